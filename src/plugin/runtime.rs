//! Plugin runtime: registration, lifecycle driving and route mounting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{info, warn};

use super::{
    ErrorHook, HealthCheck, Hooks, LifecycleContext, LifecycleManager, LifecycleReporter,
    ManagedPlugin, PluginContext, PluginError, PluginInfo, PluginState, ProtocolPlugin, ReadyHook,
};
use crate::Result;
use crate::config::{Config, LifecycleConfig, PluginConfig};
use crate::idp::MockIdp;
use crate::lookingglass::{EventBus, EventPublisher, Outcome, RUNTIME_CORRELATION};
use crate::signing::{JwtSigner, TokenSigner};
use crate::tokens::{TokenIssuer, TokenTtls};

/// Shared services every plugin context is cut from.
#[derive(Clone)]
pub struct PluginServices {
    pub idp: Arc<MockIdp>,
    pub tokens: Arc<TokenIssuer>,
    pub bus: Arc<EventBus>,
}

impl PluginServices {
    /// Build the identity store, signer, coordinator and event bus.
    pub fn from_config(config: &Config) -> Result<Self> {
        let idp = Arc::new(MockIdp::from_config(&config.idp));
        let signer: Arc<dyn TokenSigner> = Arc::new(JwtSigner::from_config(&config.signing)?);
        let tokens = Arc::new(TokenIssuer::new(
            Arc::clone(&idp),
            signer,
            config.idp.issuer.clone(),
            TokenTtls::from(&config.idp),
        ));
        let bus = Arc::new(EventBus::new(&config.looking_glass));
        Ok(Self { idp, tokens, bus })
    }
}

/// Hosts protocol plugins and drives them through their lifecycle.
pub struct PluginRuntime {
    services: PluginServices,
    lifecycle: Arc<LifecycleManager>,
    plugins: RwLock<BTreeMap<String, ManagedPlugin>>,
    hooks: Hooks,
    init_timeout: Duration,
    shutdown_timeout: Duration,
}

impl PluginRuntime {
    /// Empty runtime; `hooks` apply to every plugin registered later.
    pub fn new(services: PluginServices, hooks: Hooks, config: &LifecycleConfig) -> Self {
        Self {
            services,
            lifecycle: Arc::new(LifecycleManager::new()),
            plugins: RwLock::new(BTreeMap::new()),
            hooks,
            init_timeout: config.init_timeout,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Shared services.
    pub fn services(&self) -> &PluginServices {
        &self.services
    }

    /// Lifecycle records.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Register a plugin under `info().id`.
    pub fn register(&self, plugin: Arc<dyn ProtocolPlugin>) -> std::result::Result<(), PluginError> {
        let id = plugin.info().id;
        let mut plugins = self.plugins.write();
        if plugins.contains_key(&id) {
            return Err(PluginError::AlreadyRegistered(id));
        }
        self.lifecycle.register(&id)?;
        plugins.insert(
            id.clone(),
            ManagedPlugin::new(plugin, Arc::clone(&self.lifecycle), self.hooks.clone()),
        );
        info!(plugin = %id, "Plugin registered");
        Ok(())
    }

    /// Initialize one plugin under the configured init timeout.
    pub async fn initialize(
        &self,
        plugin_id: &str,
        config: &PluginConfig,
    ) -> std::result::Result<(), PluginError> {
        let ctx = LifecycleContext::new().with_timeout(self.init_timeout);
        self.initialize_with(&ctx, plugin_id, config).await
    }

    /// Initialize one plugin under a caller-supplied context.
    pub async fn initialize_with(
        &self,
        ctx: &LifecycleContext,
        plugin_id: &str,
        config: &PluginConfig,
    ) -> std::result::Result<(), PluginError> {
        let managed = self.managed(plugin_id)?;
        let plugin_ctx = PluginContext::new(
            Arc::clone(&self.services.idp),
            Arc::clone(&self.services.tokens),
            EventPublisher::new(Arc::clone(&self.services.bus), plugin_id),
            LifecycleReporter::new(plugin_id, Arc::clone(&self.lifecycle)),
        );
        managed.initialize(ctx, plugin_ctx, config).await
    }

    /// Shut down one plugin under the configured shutdown timeout.
    pub async fn shutdown(&self, plugin_id: &str) -> std::result::Result<(), PluginError> {
        let ctx = LifecycleContext::new().with_timeout(self.shutdown_timeout);
        self.shutdown_with(&ctx, plugin_id).await
    }

    /// Shut down one plugin under a caller-supplied context.
    pub async fn shutdown_with(
        &self,
        ctx: &LifecycleContext,
        plugin_id: &str,
    ) -> std::result::Result<(), PluginError> {
        self.managed(plugin_id)?.shutdown(ctx).await
    }

    /// Initialize every registered plugin in parallel.
    ///
    /// Failures are recorded by the lifecycle manager and returned; they
    /// never abort the other initializations.
    pub async fn initialize_all(&self, config: &Config) -> Vec<(String, PluginError)> {
        let ids = self.plugin_ids();
        let results = join_all(ids.iter().map(|id| {
            let plugin_config = config.plugin(id);
            async move { (id.clone(), self.initialize(id, &plugin_config).await) }
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect()
    }

    /// Shut down every Ready or errored plugin in parallel.
    pub async fn shutdown_all(&self) -> Vec<(String, PluginError)> {
        let ids: Vec<String> = self
            .plugin_ids()
            .into_iter()
            .filter(|id| {
                matches!(
                    self.lifecycle.get_state(id),
                    PluginState::Ready | PluginState::Error
                )
            })
            .collect();

        let results = join_all(
            ids.iter()
                .map(|id| async move { (id.clone(), self.shutdown(id).await) }),
        )
        .await;

        let failures: Vec<(String, PluginError)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        for (id, err) in &failures {
            warn!(plugin = %id, error = %err, "Plugin shutdown failed");
        }
        failures
    }

    /// Current state of one plugin.
    pub fn get_state(&self, plugin_id: &str) -> PluginState {
        self.lifecycle.get_state(plugin_id)
    }

    /// Whether every registered plugin is Ready.
    pub fn all_ready(&self) -> bool {
        self.lifecycle.all_ready()
    }

    /// Point-in-time health of every plugin.
    pub fn health_checks(&self) -> Vec<HealthCheck> {
        self.lifecycle.health_checks()
    }

    /// Identity of every registered plugin.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .values()
            .map(|m| m.plugin().info())
            .collect()
    }

    /// Every plugin's routes, each nested under `/{id}`.
    pub fn router(&self) -> Router {
        self.plugins
            .read()
            .iter()
            .fold(Router::new(), |router, (id, managed)| {
                router.nest(&format!("/{id}"), Arc::clone(managed.plugin()).routes())
            })
    }

    fn plugin_ids(&self) -> Vec<String> {
        self.plugins.read().keys().cloned().collect()
    }

    fn managed(&self, plugin_id: &str) -> std::result::Result<ManagedPlugin, PluginError> {
        self.plugins
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))
    }
}

struct RuntimeEvents {
    events: EventPublisher,
}

impl ReadyHook for RuntimeEvents {
    fn on_ready(&self, plugin_id: &str) {
        self.events.publish(
            "plugin_ready",
            RUNTIME_CORRELATION,
            Outcome::Success,
            json!({ "plugin": plugin_id }),
            None,
        );
    }
}

impl ErrorHook for RuntimeEvents {
    fn on_error(&self, plugin_id: &str, error: &PluginError) {
        self.events.publish(
            "plugin_error",
            RUNTIME_CORRELATION,
            Outcome::Error,
            json!({ "plugin": plugin_id, "error": error.to_string() }),
            None,
        );
    }
}

/// Hooks that report lifecycle outcomes on the looking-glass.
pub fn event_hooks(bus: Arc<EventBus>) -> Hooks {
    let events = Arc::new(RuntimeEvents {
        events: EventPublisher::new(bus, RUNTIME_CORRELATION),
    });
    Hooks::none()
        .with_ready(events.clone())
        .with_error(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{InitializeHook, PluginSlot};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakePlugin {
        id: &'static str,
        fail_init: bool,
        init_delay: Option<Duration>,
        slot: PluginSlot,
    }

    impl FakePlugin {
        fn named(id: &'static str) -> Self {
            Self {
                id,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ProtocolPlugin for FakePlugin {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                id: self.id.to_string(),
                name: self.id.to_uppercase(),
                version: "0.0.1".into(),
                description: "test plugin".into(),
            }
        }

        async fn initialize(
            &self,
            ctx: PluginContext,
            _config: &PluginConfig,
        ) -> std::result::Result<(), PluginError> {
            if let Some(delay) = self.init_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_init {
                return Err(PluginError::Failed("bad settings".into()));
            }
            self.slot.install(ctx);
            Ok(())
        }

        async fn shutdown(&self) -> std::result::Result<(), PluginError> {
            self.slot.clear();
            Ok(())
        }

        fn routes(self: Arc<Self>) -> Router {
            Router::new().route("/ping", get(|| async { "pong" }))
        }
    }

    fn runtime() -> PluginRuntime {
        let config = Config::default();
        let services = PluginServices::from_config(&config).unwrap();
        let hooks = event_hooks(Arc::clone(&services.bus));
        PluginRuntime::new(services, hooks, &config.lifecycle)
    }

    #[tokio::test]
    async fn initialize_then_shutdown() {
        // GIVEN: a registered plugin
        let rt = runtime();
        let plugin = Arc::new(FakePlugin::named("alpha"));
        rt.register(plugin.clone()).unwrap();
        assert_eq!(rt.get_state("alpha"), PluginState::Uninitialized);

        // WHEN: initialized
        rt.initialize("alpha", &PluginConfig::default()).await.unwrap();

        // THEN: it is Ready and its context is usable
        assert_eq!(rt.get_state("alpha"), PluginState::Ready);
        assert!(plugin.slot.ready().is_some());
        assert!(rt.all_ready());

        rt.shutdown("alpha").await.unwrap();
        assert_eq!(rt.get_state("alpha"), PluginState::Stopped);
        assert!(plugin.slot.ready().is_none());
    }

    #[tokio::test]
    async fn failed_initialize_records_error_and_event() {
        let rt = runtime();
        rt.register(Arc::new(FakePlugin {
            fail_init: true,
            ..FakePlugin::named("broken")
        }))
        .unwrap();

        let err = rt
            .initialize("broken", &PluginConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::Stage { .. }));
        assert_eq!(rt.get_state("broken"), PluginState::Error);
        let health = rt.health_checks();
        assert!(!health[0].healthy);
        assert!(health[0].error.as_deref().unwrap().contains("bad settings"));

        let events = rt.services().bus.events(Some(RUNTIME_CORRELATION), 10);
        assert_eq!(events.last().unwrap().stage, "plugin_error");
    }

    #[tokio::test]
    async fn cancelled_initialize_is_not_ready() {
        let rt = runtime();
        rt.register(Arc::new(FakePlugin {
            init_delay: Some(Duration::from_secs(5)),
            ..FakePlugin::named("slow")
        }))
        .unwrap();

        let ctx = LifecycleContext::new().with_timeout(Duration::from_millis(20));
        let err = rt
            .initialize_with(&ctx, "slow", &PluginConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::TimedOut { .. }));
        assert_eq!(rt.get_state("slow"), PluginState::Error);
    }

    #[tokio::test]
    async fn reinitialize_after_error() {
        let rt = runtime();
        let plugin = Arc::new(FakePlugin::named("alpha"));
        rt.register(plugin).unwrap();
        rt.lifecycle().set_error("alpha", "external failure").unwrap();

        rt.initialize("alpha", &PluginConfig::default()).await.unwrap();
        assert_eq!(rt.get_state("alpha"), PluginState::Ready);
        assert_eq!(rt.lifecycle().get_error("alpha"), None);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_plugins() {
        let rt = runtime();
        rt.register(Arc::new(FakePlugin::named("alpha"))).unwrap();
        assert!(matches!(
            rt.register(Arc::new(FakePlugin::named("alpha"))),
            Err(PluginError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            rt.initialize("ghost", &PluginConfig::default()).await,
            Err(PluginError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn initialize_all_isolates_failures() {
        // GIVEN: one healthy and one failing plugin
        let rt = runtime();
        rt.register(Arc::new(FakePlugin::named("good"))).unwrap();
        rt.register(Arc::new(FakePlugin {
            fail_init: true,
            ..FakePlugin::named("bad")
        }))
        .unwrap();

        // WHEN: initialized together
        let failures = rt.initialize_all(&Config::default()).await;

        // THEN: only the failing one is reported, the other is Ready
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert_eq!(rt.get_state("good"), PluginState::Ready);
        assert!(!rt.all_ready());

        let failures = rt.shutdown_all().await;
        assert!(failures.is_empty());
        assert_eq!(rt.get_state("good"), PluginState::Stopped);
        assert_eq!(rt.get_state("bad"), PluginState::Stopped);
    }

    #[tokio::test]
    async fn ready_event_is_published() {
        let rt = runtime();
        rt.register(Arc::new(FakePlugin::named("alpha"))).unwrap();
        rt.initialize("alpha", &PluginConfig::default()).await.unwrap();

        let events = rt.services().bus.events(Some(RUNTIME_CORRELATION), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, "plugin_ready");
        assert_eq!(events[0].payload["plugin"], "alpha");
    }

    struct Veto;

    #[async_trait]
    impl InitializeHook for Veto {
        async fn on_initialize(
            &self,
            _ctx: &LifecycleContext,
            plugin_id: &str,
        ) -> std::result::Result<(), PluginError> {
            Err(PluginError::Failed(format!("{plugin_id} vetoed")))
        }
    }

    #[tokio::test]
    async fn pre_init_hook_can_abort() {
        let config = Config::default();
        let services = PluginServices::from_config(&config).unwrap();
        let rt = PluginRuntime::new(
            services,
            Hooks::none().with_initialize(Arc::new(Veto)),
            &config.lifecycle,
        );
        let plugin = Arc::new(FakePlugin::named("alpha"));
        rt.register(plugin.clone()).unwrap();

        let err = rt
            .initialize("alpha", &PluginConfig::default())
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("pre-init hook failed for alpha"));
        assert_eq!(rt.get_state("alpha"), PluginState::Error);
        assert!(plugin.slot.ready().is_none());
    }

    #[tokio::test]
    async fn routes_are_namespaced() {
        let rt = runtime();
        rt.register(Arc::new(FakePlugin::named("alpha"))).unwrap();

        let response = rt
            .router()
            .oneshot(Request::get("/alpha/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rt.plugins()[0].id, "alpha");
    }
}
