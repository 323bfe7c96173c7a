//! Protocol Showcase Library
//!
//! Identity protocol execution engine: OAuth 2.0, OpenID Connect, SAML and
//! SPIFFE flows run against a self-contained mock identity provider, with
//! every protocol step published to a live "looking glass" event stream.
//!
//! # Features
//!
//! - **Mock IdP**: seeded demo users and clients, authorization codes with PKCE,
//!   rotating refresh tokens
//! - **Token coordinator**: signed access, refresh, ID, assertion and SVID tokens,
//!   introspection and revocation
//! - **Plugin runtime**: explicit lifecycle state machine with hooks, deadlines
//!   and cancellation
//! - **Looking glass**: correlated flow events over SSE with replay

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod idp;
pub mod lookingglass;
pub mod plugin;
pub mod protocols;
pub mod server;
pub mod signing;
pub mod tokens;

pub use error::{Error, Result};
pub use server::Showcase;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("tracing: {e}")))?,
    }

    Ok(())
}
