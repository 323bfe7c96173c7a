//! Mock IdP failures.

/// Failures raised by [`super::MockIdp`] operations.
///
/// Every variant is a recoverable protocol condition; handlers map them to
/// `invalid_client` or `invalid_grant` responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdpError {
    /// Unknown email or wrong password
    #[error("Invalid email or password")]
    InvalidCredentials,

    /// No user with this id
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// No client with this id
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Client authentication failed
    #[error("Client authentication failed")]
    InvalidClient,

    /// Redirect URI is not registered for the client
    #[error("Redirect URI not registered for client")]
    InvalidRedirectUri,

    /// Authorization code unknown
    #[error("Authorization code not found")]
    CodeNotFound,

    /// Authorization code already redeemed
    #[error("Authorization code already used")]
    CodeConsumed,

    /// Authorization code expired
    #[error("Authorization code expired")]
    CodeExpired,

    /// Code presented by a different client
    #[error("Authorization code was issued to another client")]
    CodeClientMismatch,

    /// Code presented with a different redirect URI
    #[error("Redirect URI does not match authorization request")]
    CodeRedirectMismatch,

    /// PKCE verifier missing or wrong
    #[error("PKCE verification failed")]
    PkceFailed,

    /// Refresh token unknown
    #[error("Refresh token not found")]
    RefreshTokenNotFound,

    /// Refresh token revoked or already rotated
    #[error("Refresh token revoked")]
    RefreshTokenRevoked,

    /// Refresh token expired
    #[error("Refresh token expired")]
    RefreshTokenExpired,

    /// Refresh token presented by a different client
    #[error("Refresh token was issued to another client")]
    RefreshTokenClientMismatch,
}

impl IdpError {
    /// Whether the failure concerns client identity rather than grant state.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ClientNotFound(_) | Self::InvalidClient)
    }
}
