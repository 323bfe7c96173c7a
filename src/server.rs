//! Process assembly: plugin registration, HTTP router, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::idp::spawn_reaper;
use crate::lookingglass;
use crate::plugin::{PluginError, PluginRuntime, PluginServices, event_hooks};
use crate::protocols::PluginKind;
use crate::{Error, Result};

/// The assembled engine: shared services, plugin runtime and configuration.
pub struct Showcase {
    config: Config,
    runtime: Arc<PluginRuntime>,
}

impl Showcase {
    /// Build services and register every enabled plugin.
    ///
    /// Plugins are registered but not initialized; see [`Self::start_plugins`].
    pub fn new(config: Config) -> Result<Self> {
        let services = PluginServices::from_config(&config)?;
        let hooks = event_hooks(Arc::clone(&services.bus));
        let runtime = Arc::new(PluginRuntime::new(services, hooks, &config.lifecycle));

        for kind in PluginKind::all() {
            if !config.plugin(kind.id()).enabled {
                info!(plugin = %kind, "Plugin disabled");
                continue;
            }
            runtime.register(kind.build())?;
        }

        Ok(Self { config, runtime })
    }

    /// Plugin runtime.
    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    /// Initialize all registered plugins; failures are isolated per plugin.
    pub async fn start_plugins(&self) -> Vec<(String, PluginError)> {
        let failures = self.runtime.initialize_all(&self.config).await;
        for (plugin_id, err) in &failures {
            error!(plugin = %plugin_id, error = %err, "Plugin failed to initialize");
        }
        failures
    }

    /// Full HTTP surface: health, looking glass and every plugin's routes.
    pub fn router(&self) -> Router {
        let bus = Arc::clone(&self.runtime.services().bus);
        let mut app = Router::new()
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.runtime))
            .merge(lookingglass::routes(bus))
            .merge(self.runtime.router())
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http());

        if self.config.server.cors_allow_any_origin {
            app = app.layer(CorsLayer::permissive());
        }
        app
    }

    /// Serve until ctrl-c or SIGTERM, then shut plugins down.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        spawn_reaper(
            Arc::clone(&self.runtime.services().idp),
            self.config.idp.reaper_interval,
            shutdown_tx.subscribe(),
        );

        self.start_plugins().await;
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("PROTOCOL SHOWCASE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.config.idp.issuer, "Mock IdP ready");
        for check in self.runtime.health_checks() {
            if check.healthy {
                info!("  /{}  ({})", check.plugin_id, check.state);
            } else {
                warn!("  /{}  ({})", check.plugin_id, check.state);
            }
        }
        info!("  /lookingglass/stream  (live flow events)");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Shutting down plugins...");
        match tokio::time::timeout(self.config.server.shutdown_timeout, self.runtime.shutdown_all())
            .await
        {
            Ok(failures) => {
                for (plugin_id, err) in failures {
                    warn!(plugin = %plugin_id, error = %err, "Plugin shutdown failed");
                }
            }
            Err(_) => warn!(
                timeout = ?self.config.server.shutdown_timeout,
                "Plugin shutdown timed out"
            ),
        }

        Ok(())
    }
}

/// `GET /health`: `200` when every plugin is Ready, `503` otherwise.
async fn health_handler(State(runtime): State<Arc<PluginRuntime>>) -> impl IntoResponse {
    let healthy = runtime.all_ready();
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "plugins": runtime.health_checks(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Resolves on ctrl-c or SIGTERM and notifies background tasks.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
