//! Plugin lifecycle state machine.
//!
//! ```text
//! Uninitialized -> Initializing -> Ready -> ShuttingDown -> Stopped
//!        \______________\___________\__________\________-> Error
//! Error -> Initializing | ShuttingDown
//! ```
//!
//! `Stopped` is terminal. `Error` is never left automatically; only an
//! explicit re-initialize (or a shutdown) moves a plugin out of it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{PluginContext, PluginError, ProtocolPlugin};
use crate::config::PluginConfig;

/// Lifecycle state of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Stopped,
    Error,
}

impl PluginState {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is an allowed transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{Error, Initializing, Ready, ShuttingDown, Stopped, Uninitialized};
        matches!(
            (self, next),
            (Uninitialized | Error, Initializing)
                | (Initializing, Ready)
                | (Ready | Error, ShuttingDown)
                | (ShuttingDown, Stopped)
                | (Uninitialized | Initializing | Ready | ShuttingDown | Error, Error)
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of a managed lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    PreInitializeHook,
    Initialize,
    PreShutdownHook,
    Shutdown,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreInitializeHook => "pre-init hook",
            Self::Initialize => "initialize",
            Self::PreShutdownHook => "pre-shutdown hook",
            Self::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone)]
struct PluginRecord {
    state: PluginState,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl PluginRecord {
    fn new() -> Self {
        Self {
            state: PluginState::Uninitialized,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Point-in-time health of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub plugin_id: String,
    pub state: PluginState,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub since: DateTime<Utc>,
}

/// Owner of every plugin's lifecycle record.
#[derive(Default)]
pub struct LifecycleManager {
    records: RwLock<BTreeMap<String, PluginRecord>>,
}

impl LifecycleManager {
    /// Empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an Uninitialized record.
    pub fn register(&self, plugin_id: &str) -> Result<(), PluginError> {
        let mut records = self.records.write();
        if records.contains_key(plugin_id) {
            return Err(PluginError::AlreadyRegistered(plugin_id.to_string()));
        }
        records.insert(plugin_id.to_string(), PluginRecord::new());
        Ok(())
    }

    /// Transition to `state`. Leaving Error clears the stored cause.
    pub fn set_state(&self, plugin_id: &str, state: PluginState) -> Result<(), PluginError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))?;

        if !record.state.can_transition_to(state) {
            return Err(PluginError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from: record.state,
                to: state,
            });
        }

        debug!(plugin = %plugin_id, from = %record.state, to = %state, "Plugin state change");
        record.state = state;
        record.updated_at = Utc::now();
        if state != PluginState::Error {
            record.last_error = None;
        }
        Ok(())
    }

    /// Transition to Error, recording the cause.
    pub fn set_error(&self, plugin_id: &str, error: impl Into<String>) -> Result<(), PluginError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(plugin_id)
            .ok_or_else(|| PluginError::NotRegistered(plugin_id.to_string()))?;

        if !record.state.can_transition_to(PluginState::Error) {
            return Err(PluginError::InvalidTransition {
                plugin_id: plugin_id.to_string(),
                from: record.state,
                to: PluginState::Error,
            });
        }

        record.state = PluginState::Error;
        record.last_error = Some(error.into());
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Current state; unknown plugins read as Uninitialized.
    pub fn get_state(&self, plugin_id: &str) -> PluginState {
        self.records
            .read()
            .get(plugin_id)
            .map_or(PluginState::Uninitialized, |r| r.state)
    }

    /// Last recorded error, while in Error.
    pub fn get_error(&self, plugin_id: &str) -> Option<String> {
        self.records
            .read()
            .get(plugin_id)
            .and_then(|r| r.last_error.clone())
    }

    /// Whether the plugin is Ready.
    pub fn is_ready(&self, plugin_id: &str) -> bool {
        self.get_state(plugin_id) == PluginState::Ready
    }

    /// Whether every registered plugin is Ready.
    pub fn all_ready(&self) -> bool {
        self.records
            .read()
            .values()
            .all(|r| r.state == PluginState::Ready)
    }

    /// Consistent snapshot of every record, ordered by id.
    pub fn health_checks(&self) -> Vec<HealthCheck> {
        self.records
            .read()
            .iter()
            .map(|(id, record)| HealthCheck {
                plugin_id: id.clone(),
                state: record.state,
                healthy: record.state == PluginState::Ready,
                error: record.last_error.clone(),
                since: record.updated_at,
            })
            .collect()
    }
}

/// Cancellation and deadline for one lifecycle operation.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl Default for LifecycleContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleContext {
    /// No deadline, fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            timeout: None,
        }
    }

    /// Context cancelled together with `parent`.
    #[must_use]
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            deadline: None,
            timeout: None,
        }
    }

    /// Add a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self.timeout = Some(timeout);
        self
    }

    /// Token to cancel this operation.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel this operation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run `fut` unless cancelled or past the deadline first.
    pub async fn guard<T, F>(&self, plugin_id: &str, fut: F) -> Result<T, PluginError>
    where
        F: Future<Output = Result<T, PluginError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(PluginError::Cancelled(plugin_id.to_string()));
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(PluginError::Cancelled(plugin_id.to_string())),
            () = deadline => Err(PluginError::TimedOut {
                plugin_id: plugin_id.to_string(),
                after: self.timeout.unwrap_or_default(),
            }),
            result = fut => result,
        }
    }
}

/// Runs before a plugin initializes; an error aborts initialization.
#[async_trait]
pub trait InitializeHook: Send + Sync {
    async fn on_initialize(&self, ctx: &LifecycleContext, plugin_id: &str)
    -> Result<(), PluginError>;
}

/// Runs after a plugin becomes Ready.
pub trait ReadyHook: Send + Sync {
    fn on_ready(&self, plugin_id: &str);
}

/// Runs before a plugin shuts down; an error aborts shutdown.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn on_shutdown(&self, ctx: &LifecycleContext, plugin_id: &str)
    -> Result<(), PluginError>;
}

/// Runs after any lifecycle failure.
pub trait ErrorHook: Send + Sync {
    fn on_error(&self, plugin_id: &str, error: &PluginError);
}

/// Optional lifecycle hooks, injected at construction.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_initialize: Option<Arc<dyn InitializeHook>>,
    pub on_ready: Option<Arc<dyn ReadyHook>>,
    pub on_shutdown: Option<Arc<dyn ShutdownHook>>,
    pub on_error: Option<Arc<dyn ErrorHook>>,
}

impl Hooks {
    /// No hooks.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_initialize(mut self, hook: Arc<dyn InitializeHook>) -> Self {
        self.on_initialize = Some(hook);
        self
    }

    #[must_use]
    pub fn with_ready(mut self, hook: Arc<dyn ReadyHook>) -> Self {
        self.on_ready = Some(hook);
        self
    }

    #[must_use]
    pub fn with_shutdown(mut self, hook: Arc<dyn ShutdownHook>) -> Self {
        self.on_shutdown = Some(hook);
        self
    }

    #[must_use]
    pub fn with_error(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.on_error = Some(hook);
        self
    }
}

/// A plugin bound to the lifecycle manager and hooks.
#[derive(Clone)]
pub struct ManagedPlugin {
    plugin: Arc<dyn ProtocolPlugin>,
    lifecycle: Arc<LifecycleManager>,
    hooks: Hooks,
}

impl ManagedPlugin {
    /// Wrap `plugin`.
    pub fn new(plugin: Arc<dyn ProtocolPlugin>, lifecycle: Arc<LifecycleManager>, hooks: Hooks) -> Self {
        Self {
            plugin,
            lifecycle,
            hooks,
        }
    }

    /// The wrapped plugin.
    pub fn plugin(&self) -> &Arc<dyn ProtocolPlugin> {
        &self.plugin
    }

    /// Pre-init hook, plugin initialize, then Ready and the ready hook.
    ///
    /// Any failure, cancellation or timeout leaves the plugin in Error.
    pub async fn initialize(
        &self,
        ctx: &LifecycleContext,
        plugin_ctx: PluginContext,
        config: &PluginConfig,
    ) -> Result<(), PluginError> {
        let id = self.plugin.info().id;
        self.lifecycle.set_state(&id, PluginState::Initializing)?;

        let run = async {
            if let Some(hook) = &self.hooks.on_initialize {
                hook.on_initialize(ctx, &id)
                    .await
                    .map_err(|e| stage_error(&id, LifecycleStage::PreInitializeHook, e))?;
            }
            self.plugin
                .initialize(plugin_ctx, config)
                .await
                .map_err(|e| stage_error(&id, LifecycleStage::Initialize, e))
        };

        match ctx.guard(&id, run).await {
            Ok(()) => {
                self.lifecycle.set_state(&id, PluginState::Ready)?;
                info!(plugin = %id, "Plugin ready");
                if let Some(hook) = &self.hooks.on_ready {
                    hook.on_ready(&id);
                }
                Ok(())
            }
            Err(e) => Err(self.fail(&id, e)),
        }
    }

    /// Pre-shutdown hook, then plugin shutdown, ending in Stopped.
    pub async fn shutdown(&self, ctx: &LifecycleContext) -> Result<(), PluginError> {
        let id = self.plugin.info().id;
        self.lifecycle.set_state(&id, PluginState::ShuttingDown)?;

        let run = async {
            if let Some(hook) = &self.hooks.on_shutdown {
                hook.on_shutdown(ctx, &id)
                    .await
                    .map_err(|e| stage_error(&id, LifecycleStage::PreShutdownHook, e))?;
            }
            self.plugin
                .shutdown()
                .await
                .map_err(|e| stage_error(&id, LifecycleStage::Shutdown, e))
        };

        match ctx.guard(&id, run).await {
            Ok(()) => {
                self.lifecycle.set_state(&id, PluginState::Stopped)?;
                info!(plugin = %id, "Plugin stopped");
                Ok(())
            }
            Err(e) => Err(self.fail(&id, e)),
        }
    }

    fn fail(&self, id: &str, err: PluginError) -> PluginError {
        error!(plugin = %id, error = %err, "Plugin lifecycle failure");
        if let Err(e) = self.lifecycle.set_error(id, err.to_string()) {
            warn!(plugin = %id, error = %e, "Could not record plugin error");
        }
        if let Some(hook) = &self.hooks.on_error {
            hook.on_error(id, &err);
        }
        err
    }
}

fn stage_error(plugin_id: &str, stage: LifecycleStage, source: PluginError) -> PluginError {
    PluginError::Stage {
        plugin_id: plugin_id.to_string(),
        stage,
        source: Box::new(source),
    }
}
