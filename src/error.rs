//! Error types for the protocol showcase

use std::io;

use thiserror::Error;

use crate::plugin::PluginError;
use crate::signing::SigningError;

/// Result type alias for the protocol showcase
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors
///
/// Protocol-facing failures never surface as this type; handlers convert
/// them into [`crate::protocols::ProtocolError`] responses. This enum covers
/// process assembly: configuration, key loading, plugin lifecycle, I/O.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key setup or token signing failure
    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    /// Plugin lifecycle failure
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error originates from user-supplied configuration
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Yaml(_))
    }
}
