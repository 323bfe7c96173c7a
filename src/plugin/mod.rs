//! Protocol plugin contract and runtime.
//!
//! A protocol module implements [`ProtocolPlugin`]: identity via
//! [`ProtocolPlugin::info`], lifecycle via `initialize`/`shutdown`, and an
//! axum [`Router`] for its namespace. The runtime never looks inside a
//! plugin; everything a plugin may touch is handed to it at initialization
//! as a [`PluginContext`] capability bundle:
//!
//! - the Mock IdP ([`MockIdp`]) and token coordinator ([`TokenIssuer`])
//! - an [`EventPublisher`] stamped with the plugin's id
//! - a [`LifecycleReporter`] that can only read and write the plugin's own record

mod lifecycle;
mod runtime;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;

pub use lifecycle::{
    ErrorHook, HealthCheck, Hooks, InitializeHook, LifecycleContext, LifecycleManager,
    LifecycleStage, ManagedPlugin, PluginState, ReadyHook, ShutdownHook,
};
pub use runtime::{PluginRuntime, PluginServices, event_hooks};

use crate::config::PluginConfig;
use crate::idp::MockIdp;
use crate::lookingglass::EventPublisher;
use crate::tokens::TokenIssuer;

/// Static identity of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Namespace and registry key, e.g. `oauth2`
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Lifecycle and plugin failures.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No plugin registered under this id
    #[error("Plugin not registered: {0}")]
    NotRegistered(String),

    /// A plugin with this id is already registered
    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    /// Requested state change is not allowed from the current state
    #[error("Invalid transition for {plugin_id}: {from} -> {to}")]
    InvalidTransition {
        plugin_id: String,
        from: PluginState,
        to: PluginState,
    },

    /// Plugin settings are unusable
    #[error("Invalid plugin configuration: {0}")]
    Config(String),

    /// Plugin-reported failure
    #[error("{0}")]
    Failed(String),

    /// A lifecycle stage failed
    #[error("{stage} failed for {plugin_id}: {source}")]
    Stage {
        plugin_id: String,
        stage: LifecycleStage,
        #[source]
        source: Box<PluginError>,
    },

    /// The lifecycle operation was cancelled
    #[error("Lifecycle operation cancelled for {0}")]
    Cancelled(String),

    /// The lifecycle operation exceeded its deadline
    #[error("Lifecycle operation for {plugin_id} timed out after {after:?}")]
    TimedOut { plugin_id: String, after: Duration },
}

/// Contract every protocol module implements.
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    /// Identity; `info().id` is the URL namespace.
    fn info(&self) -> PluginInfo;

    /// Take the capability bundle and validate settings.
    async fn initialize(&self, ctx: PluginContext, config: &PluginConfig)
    -> Result<(), PluginError>;

    /// Release the capability bundle.
    async fn shutdown(&self) -> Result<(), PluginError>;

    /// Handlers for the plugin's namespace, relative to `/{id}`.
    fn routes(self: Arc<Self>) -> Router;
}

/// Capability bundle handed to a plugin at initialization.
#[derive(Clone)]
pub struct PluginContext {
    idp: Arc<MockIdp>,
    tokens: Arc<TokenIssuer>,
    events: EventPublisher,
    lifecycle: LifecycleReporter,
}

impl PluginContext {
    pub(crate) fn new(
        idp: Arc<MockIdp>,
        tokens: Arc<TokenIssuer>,
        events: EventPublisher,
        lifecycle: LifecycleReporter,
    ) -> Self {
        Self {
            idp,
            tokens,
            events,
            lifecycle,
        }
    }

    /// Mock IdP operations.
    pub fn idp(&self) -> &MockIdp {
        &self.idp
    }

    /// Token issuance and verification.
    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Event publishing, stamped with this plugin's id.
    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// This plugin's lifecycle record.
    pub fn lifecycle(&self) -> &LifecycleReporter {
        &self.lifecycle
    }
}

/// Self-reporting handle onto one plugin's lifecycle record.
#[derive(Clone)]
pub struct LifecycleReporter {
    plugin_id: String,
    manager: Arc<LifecycleManager>,
}

impl LifecycleReporter {
    pub(crate) fn new(plugin_id: impl Into<String>, manager: Arc<LifecycleManager>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            manager,
        }
    }

    /// Id this reporter is bound to.
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Current state.
    pub fn state(&self) -> PluginState {
        self.manager.get_state(&self.plugin_id)
    }

    /// Whether the plugin is Ready.
    pub fn is_ready(&self) -> bool {
        self.manager.is_ready(&self.plugin_id)
    }

    /// Request a state transition.
    pub fn set_state(&self, state: PluginState) -> Result<(), PluginError> {
        self.manager.set_state(&self.plugin_id, state)
    }

    /// Move to Error with a cause.
    pub fn set_error(&self, error: impl Into<String>) -> Result<(), PluginError> {
        self.manager.set_error(&self.plugin_id, error)
    }
}

/// Where a plugin keeps its context between initialize and shutdown.
#[derive(Default)]
pub struct PluginSlot {
    inner: RwLock<Option<PluginContext>>,
}

impl PluginSlot {
    /// Store the context received at initialization.
    pub fn install(&self, ctx: PluginContext) {
        *self.inner.write() = Some(ctx);
    }

    /// Drop the context at shutdown.
    pub fn clear(&self) {
        self.inner.write().take();
    }

    /// The context, only while the plugin is Ready.
    pub fn ready(&self) -> Option<PluginContext> {
        self.inner
            .read()
            .as_ref()
            .filter(|ctx| ctx.lifecycle.is_ready())
            .cloned()
    }
}
