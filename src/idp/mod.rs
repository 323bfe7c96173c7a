//! Mock identity provider: identity store plus code and refresh-token state.
//!
//! [`MockIdp`] is the single owner of clients, users, authorization codes,
//! refresh tokens and the access-token deny-list. It is built once at
//! startup and shared behind an `Arc`; plugins reach it only through
//! [`crate::plugin::PluginContext`].
//!
//! # Locking
//!
//! Each table sits behind its own `parking_lot::RwLock`. Lookups take a
//! read lock; mutations take the write lock for the mutation only. Code
//! redemption and refresh-token rotation perform check-and-mark inside one
//! write-lock critical section, so concurrent redemptions of the same code
//! or refresh token observe exactly one winner.

mod claims;
mod error;
mod models;
pub mod pkce;
pub mod presets;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

pub use claims::user_claims;
pub use error::IdpError;
pub use models::{
    AuthorizationCode, Client, ClientType, CodeChallengeMethod, CodeRequest, GrantType,
    RefreshToken, UnsupportedGrantType, User, has_scope, scope_list,
};
pub use pkce::{PkcePair, generate_pkce, verify_pkce};

use crate::config::IdpConfig;
use crate::signing::Claims;
use pkce::constant_time_eq;

/// Counts removed by one [`MockIdp::purge_expired`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Expired authorization codes
    pub codes: usize,
    /// Expired or revoked refresh tokens
    pub refresh_tokens: usize,
    /// Deny-list entries whose access token has expired anyway
    pub revoked_access_tokens: usize,
}

impl PurgeStats {
    /// Total entries removed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.codes + self.refresh_tokens + self.revoked_access_tokens
    }
}

/// In-memory identity provider state.
pub struct MockIdp {
    users: RwLock<HashMap<String, User>>,
    clients: RwLock<HashMap<String, Client>>,
    codes: RwLock<HashMap<String, AuthorizationCode>>,
    refresh_tokens: RwLock<HashMap<String, RefreshToken>>,
    /// Revoked access-token `jti` -> token expiry (unix seconds)
    revoked_access: DashMap<String, i64>,
    code_ttl: chrono::Duration,
}

impl MockIdp {
    /// Empty store whose codes live for `code_ttl`.
    #[must_use]
    pub fn new(code_ttl: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            codes: RwLock::new(HashMap::new()),
            refresh_tokens: RwLock::new(HashMap::new()),
            revoked_access: DashMap::new(),
            code_ttl: chrono::Duration::from_std(code_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    /// Store populated from the `idp` config section.
    ///
    /// Demo users and clients are seeded first when enabled; configured
    /// registrations are applied afterwards and replace seeds with the same id.
    #[must_use]
    pub fn from_config(config: &IdpConfig) -> Self {
        let idp = Self::new(config.code_ttl);
        if config.seed_demo_data {
            idp.seed_demo_data();
        }
        for user in &config.users {
            idp.register_user(user.clone());
        }
        for client in &config.clients {
            idp.register_client(client.clone());
        }
        info!(
            users = idp.users.read().len(),
            clients = idp.clients.read().len(),
            "Identity store ready"
        );
        idp
    }

    /// Register the demo users and clients.
    pub fn seed_demo_data(&self) {
        for user in presets::demo_users() {
            self.register_user(user);
        }
        for client in presets::demo_clients() {
            self.register_client(client);
        }
    }

    /// Add or replace a user.
    pub fn register_user(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }

    /// Add or replace a client.
    pub fn register_client(&self, client: Client) {
        self.clients.write().insert(client.id.clone(), client);
    }

    // ── Identity store ─────────────────────────────────────────────────

    /// Authenticate by email and password.
    pub fn validate_credentials(&self, email: &str, password: &str) -> Result<User, IdpError> {
        let users = self.users.read();
        let user = users
            .values()
            .find(|u| u.email == email)
            .ok_or(IdpError::InvalidCredentials)?;

        if constant_time_eq(&user.password, password) {
            Ok(user.clone())
        } else {
            Err(IdpError::InvalidCredentials)
        }
    }

    /// Look up a user by id.
    pub fn get_user(&self, user_id: &str) -> Result<User, IdpError> {
        self.users
            .read()
            .get(user_id)
            .cloned()
            .ok_or_else(|| IdpError::UserNotFound(user_id.to_string()))
    }

    /// Look up a client by id.
    pub fn get_client(&self, client_id: &str) -> Result<Client, IdpError> {
        self.clients
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| IdpError::ClientNotFound(client_id.to_string()))
    }

    /// Authenticate a client. Public clients are accepted without a secret.
    pub fn validate_client(&self, client_id: &str, secret: Option<&str>) -> Result<Client, IdpError> {
        let client = self
            .get_client(client_id)
            .map_err(|_| IdpError::InvalidClient)?;

        if !client.requires_secret() {
            return Ok(client);
        }

        match (client.secret.as_deref(), secret) {
            (Some(expected), Some(given)) if constant_time_eq(expected, given) => Ok(client),
            _ => Err(IdpError::InvalidClient),
        }
    }

    /// Exact-match check of `uri` against the client's registered set.
    pub fn validate_redirect_uri(&self, client_id: &str, uri: &str) -> bool {
        self.clients
            .read()
            .get(client_id)
            .is_some_and(|c| c.redirect_uris.iter().any(|r| r == uri))
    }

    /// Claims `user_id` discloses for the space-delimited `scope`.
    pub fn user_claims(&self, user_id: &str, scope: &str) -> Result<Claims, IdpError> {
        let user = self.get_user(user_id)?;
        Ok(claims::user_claims(&user, &scope_list(scope)))
    }

    /// Whether `user_id` holds `role`.
    pub fn has_role(&self, user_id: &str, role: &str) -> bool {
        self.users
            .read()
            .get(user_id)
            .is_some_and(|u| u.roles.iter().any(|r| r == role))
    }

    // ── Authorization codes ────────────────────────────────────────────

    /// Issue a fresh, unconsumed authorization code.
    pub fn create_authorization_code(&self, request: CodeRequest) -> AuthorizationCode {
        let now = Utc::now();
        let code = AuthorizationCode {
            code: generate_opaque(),
            client_id: request.client_id,
            user_id: request.user_id,
            redirect_uri: request.redirect_uri,
            scope: request.scope,
            state: request.state,
            nonce: request.nonce,
            code_challenge: request.code_challenge.filter(|c| !c.is_empty()),
            code_challenge_method: request
                .code_challenge_method
                .unwrap_or(CodeChallengeMethod::S256),
            issued_at: now,
            expires_at: now + self.code_ttl,
            consumed: false,
            correlation_id: request.correlation_id,
        };

        debug!(
            client_id = %code.client_id,
            user_id = %code.user_id,
            pkce = code.code_challenge.is_some(),
            "Authorization code issued"
        );
        self.codes.write().insert(code.code.clone(), code.clone());
        code
    }

    /// Redeem an authorization code.
    ///
    /// Checks run in order: unknown, consumed, expired, client, redirect URI,
    /// PKCE. Only a fully successful check marks the code consumed; failures
    /// leave it redeemable except for expiry, which removes it.
    pub fn validate_authorization_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthorizationCode, IdpError> {
        let now = Utc::now();
        let mut codes = self.codes.write();

        let entry = codes.get_mut(code).ok_or(IdpError::CodeNotFound)?;
        if entry.consumed {
            return Err(IdpError::CodeConsumed);
        }
        if entry.is_expired(now) {
            codes.remove(code);
            return Err(IdpError::CodeExpired);
        }
        if entry.client_id != client_id {
            return Err(IdpError::CodeClientMismatch);
        }
        if entry.redirect_uri != redirect_uri {
            return Err(IdpError::CodeRedirectMismatch);
        }
        if let Some(challenge) = &entry.code_challenge {
            let verifier = code_verifier.unwrap_or_default();
            if !verify_pkce(verifier, challenge, entry.code_challenge_method) {
                return Err(IdpError::PkceFailed);
            }
        }

        entry.consumed = true;
        Ok(entry.clone())
    }

    /// Look up a code without redeeming it.
    pub fn find_authorization_code(&self, code: &str) -> Option<AuthorizationCode> {
        self.codes.read().get(code).cloned()
    }

    // ── Refresh tokens ─────────────────────────────────────────────────

    /// Persist a refresh token.
    pub fn store_refresh_token(&self, token: RefreshToken) {
        self.refresh_tokens
            .write()
            .insert(token.token.clone(), token);
    }

    /// Validate a refresh token for `client_id` without consuming it.
    pub fn validate_refresh_token(
        &self,
        token: &str,
        client_id: &str,
    ) -> Result<RefreshToken, IdpError> {
        let tokens = self.refresh_tokens.read();
        let entry = tokens.get(token).ok_or(IdpError::RefreshTokenNotFound)?;
        check_refresh_token(entry, client_id, Utc::now())?;
        Ok(entry.clone())
    }

    /// Validate and revoke a refresh token in one step, for rotation.
    ///
    /// Of two concurrent calls with the same token, exactly one succeeds.
    pub fn consume_refresh_token(
        &self,
        token: &str,
        client_id: &str,
    ) -> Result<RefreshToken, IdpError> {
        let mut tokens = self.refresh_tokens.write();
        let entry = tokens.get_mut(token).ok_or(IdpError::RefreshTokenNotFound)?;
        check_refresh_token(entry, client_id, Utc::now())?;
        entry.revoked = true;
        Ok(entry.clone())
    }

    /// Undo a [`consume_refresh_token`](Self::consume_refresh_token) whose
    /// replacement was never issued.
    pub fn reinstate_refresh_token(&self, token: &str) {
        if let Some(entry) = self.refresh_tokens.write().get_mut(token) {
            entry.revoked = false;
        }
    }

    /// Revoke a refresh token. Returns whether the token was known.
    ///
    /// Revoking an already-revoked token is not an error.
    pub fn revoke_refresh_token(&self, token: &str) -> bool {
        match self.refresh_tokens.write().get_mut(token) {
            Some(entry) => {
                entry.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Look up a refresh token without checking it.
    pub fn find_refresh_token(&self, token: &str) -> Option<RefreshToken> {
        self.refresh_tokens.read().get(token).cloned()
    }

    // ── Access-token deny-list ─────────────────────────────────────────

    /// Deny an access token by `jti` until its expiry.
    pub fn revoke_access_token(&self, jti: &str, expires_at: i64) {
        self.revoked_access.insert(jti.to_string(), expires_at);
    }

    /// Whether `jti` is on the deny-list.
    pub fn is_access_token_revoked(&self, jti: &str) -> bool {
        self.revoked_access.contains_key(jti)
    }

    // ── Housekeeping ───────────────────────────────────────────────────

    /// Remove expired codes, dead refresh tokens and stale deny-list entries.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> PurgeStats {
        let mut stats = PurgeStats::default();

        {
            let mut codes = self.codes.write();
            let before = codes.len();
            codes.retain(|_, c| !c.is_expired(now));
            stats.codes = before - codes.len();
        }
        {
            let mut tokens = self.refresh_tokens.write();
            let before = tokens.len();
            tokens.retain(|_, t| !t.revoked && !t.is_expired(now));
            stats.refresh_tokens = before - tokens.len();
        }

        let cutoff = now.timestamp();
        let before = self.revoked_access.len();
        self.revoked_access.retain(|_, exp| *exp > cutoff);
        stats.revoked_access_tokens = before - self.revoked_access.len();

        stats
    }
}

fn check_refresh_token(
    entry: &RefreshToken,
    client_id: &str,
    now: DateTime<Utc>,
) -> Result<(), IdpError> {
    if entry.revoked {
        return Err(IdpError::RefreshTokenRevoked);
    }
    if entry.is_expired(now) {
        return Err(IdpError::RefreshTokenExpired);
    }
    if entry.client_id != client_id {
        return Err(IdpError::RefreshTokenClientMismatch);
    }
    Ok(())
}

/// 256-bit random value, base64url without padding.
fn generate_opaque() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        random_bytes,
    )
}

/// Spawn the periodic purge task. Stops when `shutdown` fires.
pub fn spawn_reaper(
    idp: Arc<MockIdp>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = idp.purge_expired(Utc::now());
                    if stats.total() > 0 {
                        debug!(
                            codes = stats.codes,
                            refresh_tokens = stats.refresh_tokens,
                            revoked_access_tokens = stats.revoked_access_tokens,
                            "Purged expired IdP state"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!("IdP reaper shutting down");
                    break;
                }
            }
        }
    });
}
