//! Token issuance coordinator.
//!
//! [`TokenIssuer`] combines Mock IdP state with the signing service to
//! produce protocol token sets:
//!
//! - authorization-code redemption: access + refresh (+ ID when `openid`)
//! - client credentials: access only, subject is the client
//! - refresh: atomic rotation, reissuing the full set
//!
//! Every JWT carries `iss`, `sub`, `aud`, `iat`, `exp`, `jti` and a
//! `token_use` discriminator. Standard claims are written after any user
//! claims so a custom claim can never shadow the subject or audience.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use showcase_wire::{IntrospectionResponse, TokenResponse};
use tracing::{debug, info, warn};

use crate::config::IdpConfig;
use crate::idp::{Client, IdpError, MockIdp, RefreshToken, has_scope, scope_list};
use crate::signing::{Claims, SigningAlgorithm, SigningError, TokenSigner};

/// Value of the `token_use` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// OAuth 2.0 access token
    Access,
    /// Refresh token
    Refresh,
    /// OIDC ID token
    Id,
    /// Signed SAML assertion stand-in
    SamlAssertion,
    /// SPIFFE JWT-SVID
    JwtSvid,
}

impl TokenKind {
    /// Claim value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Id => "id",
            Self::SamlAssertion => "saml_assertion",
            Self::JwtSvid => "jwt_svid",
        }
    }

    fn from_claims(claims: &Claims) -> Option<Self> {
        match claims.get("token_use").and_then(Value::as_str)? {
            "access" => Some(Self::Access),
            "refresh" => Some(Self::Refresh),
            "id" => Some(Self::Id),
            "saml_assertion" => Some(Self::SamlAssertion),
            "jwt_svid" => Some(Self::JwtSvid),
            _ => None,
        }
    }
}

/// Failures while assembling a token set.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    /// IdP state rejected the request (grant-state or client errors)
    #[error(transparent)]
    Idp(#[from] IdpError),

    /// Signing service failure
    #[error("Token signing failed: {0}")]
    Signing(#[from] SigningError),

    /// Requested scope not permitted
    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    /// Presented token failed verification or has the wrong type
    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

/// Token lifetimes.
#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
    pub access: Duration,
    pub refresh: Duration,
    pub id: Duration,
}

impl From<&IdpConfig> for TokenTtls {
    fn from(config: &IdpConfig) -> Self {
        Self {
            access: config.access_token_ttl,
            refresh: config.refresh_token_ttl,
            id: config.id_token_ttl,
        }
    }
}

/// Output of a successful grant.
#[derive(Debug, Clone)]
pub struct IssuedTokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: u64,
    pub scope: String,
    /// `jti` of the access token
    pub access_jti: String,
}

impl IssuedTokenSet {
    /// Wire shape for the token endpoint.
    #[must_use]
    pub fn to_response(&self) -> TokenResponse {
        TokenResponse {
            access_token: self.access_token.clone(),
            token_type: "Bearer".to_string(),
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.clone(),
            id_token: self.id_token.clone(),
            scope: self.scope.clone(),
        }
    }

    /// Non-secret summary for the event stream.
    #[must_use]
    pub fn summary(&self) -> Value {
        json!({
            "token_type": "Bearer",
            "expires_in": self.expires_in,
            "scope": self.scope,
            "jti": self.access_jti,
            "refresh_token_issued": self.refresh_token.is_some(),
            "id_token_issued": self.id_token.is_some(),
        })
    }
}

/// Inspection metadata about an issued token.
#[derive(Debug, Clone, Serialize)]
pub struct TokenMetadata {
    pub token_type: TokenKind,
    pub subject: String,
    pub client_id: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
}

/// A signed token with the claims it carries.
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub claims: Claims,
}

impl SignedToken {
    fn jti(&self) -> String {
        claim_str(&self.claims, "jti").unwrap_or_default()
    }

    /// Inspection metadata derived from the claims.
    #[must_use]
    pub fn metadata(&self, kind: TokenKind) -> TokenMetadata {
        let ts = |key| {
            claim_i64(&self.claims, key)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_default()
        };
        TokenMetadata {
            token_type: kind,
            subject: claim_str(&self.claims, "sub").unwrap_or_default(),
            client_id: claim_str(&self.claims, "client_id")
                .or_else(|| claim_str(&self.claims, "aud"))
                .unwrap_or_default(),
            scope: claim_str(&self.claims, "scope").unwrap_or_default(),
            issued_at: ts("iat"),
            expires_at: ts("exp"),
            token_id: claim_str(&self.claims, "jti"),
        }
    }
}

/// Result of a refresh-token grant.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub tokens: IssuedTokenSet,
    /// The rotated-out record
    pub previous: RefreshToken,
}

/// Issues, verifies and introspects tokens.
pub struct TokenIssuer {
    idp: Arc<MockIdp>,
    signer: Arc<dyn TokenSigner>,
    issuer: String,
    ttls: TokenTtls,
}

impl TokenIssuer {
    /// Coordinator over `idp` and `signer`.
    pub fn new(
        idp: Arc<MockIdp>,
        signer: Arc<dyn TokenSigner>,
        issuer: impl Into<String>,
        ttls: TokenTtls,
    ) -> Self {
        Self {
            idp,
            signer,
            issuer: issuer.into(),
            ttls,
        }
    }

    /// `iss` claim value.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Public key set of the signing service.
    pub fn jwks(&self) -> Value {
        self.signer.jwks()
    }

    /// Algorithm tokens are signed with.
    pub fn signing_algorithm(&self) -> SigningAlgorithm {
        self.signer.default_algorithm()
    }

    /// Configured lifetimes.
    pub fn ttls(&self) -> TokenTtls {
        self.ttls
    }

    /// Sign a token of `kind` for `subject`/`audience` carrying `extra` claims.
    pub fn issue_signed(
        &self,
        kind: TokenKind,
        subject: &str,
        audience: &str,
        ttl: Duration,
        extra: Claims,
    ) -> Result<SignedToken, IssueError> {
        let now = Utc::now().timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX / 2);

        let mut claims = extra;
        claims.insert("iss".into(), json!(self.issuer));
        claims.insert("sub".into(), json!(subject));
        claims.insert("aud".into(), json!(audience));
        claims.insert("iat".into(), json!(now));
        claims.insert("exp".into(), json!(now.saturating_add(ttl_secs)));
        claims.insert("jti".into(), json!(uuid::Uuid::new_v4().to_string()));
        claims.insert("token_use".into(), json!(kind.as_str()));

        let token = self.signer.sign_default(&claims)?;
        Ok(SignedToken { token, claims })
    }

    /// Issue access + refresh (+ ID when `openid`) for a user.
    pub fn issue_tokens(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        nonce: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<IssuedTokenSet, IssueError> {
        let user_claims = self.idp.user_claims(user_id, scope)?;

        let mut access_claims = user_claims.clone();
        access_claims.insert("scope".into(), json!(scope));
        access_claims.insert("client_id".into(), json!(client_id));
        let access = self.issue_signed(
            TokenKind::Access,
            user_id,
            client_id,
            self.ttls.access,
            access_claims,
        )?;

        let mut refresh_claims = Claims::new();
        refresh_claims.insert("scope".into(), json!(scope));
        refresh_claims.insert("client_id".into(), json!(client_id));
        let refresh = self.issue_signed(
            TokenKind::Refresh,
            user_id,
            client_id,
            self.ttls.refresh,
            refresh_claims,
        )?;

        let now = Utc::now();
        self.idp.store_refresh_token(RefreshToken {
            token: refresh.token.clone(),
            client_id: client_id.to_string(),
            user_id: user_id.to_string(),
            scope: scope.to_string(),
            issued_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.ttls.refresh)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
            revoked: false,
            correlation_id: correlation_id.map(str::to_string),
        });

        let id_token = if has_scope(scope, "openid") {
            let mut id_claims = user_claims;
            id_claims.insert("azp".into(), json!(client_id));
            id_claims.insert("auth_time".into(), json!(now.timestamp()));
            if let Some(nonce) = nonce.filter(|n| !n.is_empty()) {
                id_claims.insert("nonce".into(), json!(nonce));
            }
            let id = self.issue_signed(TokenKind::Id, user_id, client_id, self.ttls.id, id_claims)?;
            Some(id.token)
        } else {
            None
        };

        info!(
            client_id = %client_id,
            user_id = %user_id,
            scope = %scope,
            id_token = id_token.is_some(),
            "Issued token set"
        );

        Ok(IssuedTokenSet {
            access_jti: access.jti(),
            access_token: access.token,
            refresh_token: Some(refresh.token),
            id_token,
            expires_in: self.ttls.access.as_secs(),
            scope: scope.to_string(),
        })
    }

    /// Issue a client-credentials access token; the client is the subject.
    ///
    /// An empty `requested_scope` grants every scope the client is allowed.
    pub fn issue_client_credentials(
        &self,
        client: &Client,
        requested_scope: &str,
    ) -> Result<IssuedTokenSet, IssueError> {
        let requested = scope_list(requested_scope);
        let scope = if requested.is_empty() {
            client.scopes.join(" ")
        } else if client.allows_scopes(&requested) {
            requested.join(" ")
        } else {
            return Err(IssueError::InvalidScope(format!(
                "Client {} may not request '{requested_scope}'",
                client.id
            )));
        };

        let mut claims = Claims::new();
        claims.insert("scope".into(), json!(scope));
        claims.insert("client_id".into(), json!(client.id));
        claims.insert("client_name".into(), json!(client.name));
        let access = self.issue_signed(
            TokenKind::Access,
            &client.id,
            &client.id,
            self.ttls.access,
            claims,
        )?;

        info!(client_id = %client.id, scope = %scope, "Issued client-credentials token");

        Ok(IssuedTokenSet {
            access_jti: access.jti(),
            access_token: access.token,
            refresh_token: None,
            id_token: None,
            expires_in: self.ttls.access.as_secs(),
            scope,
        })
    }

    /// Redeem a refresh token, rotating it.
    ///
    /// The requested scope must be a subset of the original grant. The
    /// presented token is revoked atomically with its validation; the
    /// replacement inherits the original flow's correlation id.
    pub fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        requested_scope: Option<&str>,
    ) -> Result<RefreshOutcome, IssueError> {
        let current = self.idp.validate_refresh_token(refresh_token, client_id)?;

        let scope = match requested_scope.map(str::trim).filter(|s| !s.is_empty()) {
            None => current.scope.clone(),
            Some(requested) => {
                let original = scope_list(&current.scope);
                if scope_list(requested).iter().all(|s| original.contains(s)) {
                    requested.to_string()
                } else {
                    return Err(IssueError::InvalidScope(format!(
                        "'{requested}' exceeds the original grant"
                    )));
                }
            }
        };

        let previous = self.idp.consume_refresh_token(refresh_token, client_id)?;
        debug!(client_id = %client_id, "Refresh token rotated out");

        let tokens = match self.issue_tokens(
            &previous.user_id,
            client_id,
            &scope,
            None,
            previous.correlation_id.as_deref(),
        ) {
            Ok(tokens) => tokens,
            Err(err) => {
                self.idp.reinstate_refresh_token(refresh_token);
                warn!(client_id = %client_id, error = %err, "Refresh failed, presented token kept");
                return Err(err);
            }
        };
        Ok(RefreshOutcome { tokens, previous })
    }

    /// Verify signature and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, IssueError> {
        self.signer
            .verify(token)
            .map_err(|e| IssueError::InvalidToken(e.to_string()))
    }

    /// Verify a token and require it to be a live access token.
    pub fn verify_access_token(&self, token: &str) -> Result<Claims, IssueError> {
        let claims = self.verify(token)?;
        if TokenKind::from_claims(&claims) != Some(TokenKind::Access) {
            return Err(IssueError::InvalidToken("not an access token".into()));
        }
        if let Some(jti) = claim_str(&claims, "jti") {
            if self.idp.is_access_token_revoked(&jti) {
                return Err(IssueError::InvalidToken("token revoked".into()));
            }
        }
        Ok(claims)
    }

    /// Verify a token of `kind` issued for `audience`.
    pub fn verify_for_audience(
        &self,
        token: &str,
        kind: TokenKind,
        audience: &str,
    ) -> Result<Claims, IssueError> {
        let claims = self.verify(token)?;
        if TokenKind::from_claims(&claims) != Some(kind) {
            return Err(IssueError::InvalidToken(format!(
                "expected a {} token",
                kind.as_str()
            )));
        }
        if !audience_matches(&claims, audience) {
            return Err(IssueError::InvalidToken("audience mismatch".into()));
        }
        Ok(claims)
    }

    /// RFC 7662 introspection.
    ///
    /// Unknown, expired, revoked and non-access/refresh tokens are inactive.
    pub fn introspect(&self, token: &str) -> IntrospectionResponse {
        let Ok(claims) = self.verify(token) else {
            return IntrospectionResponse::inactive();
        };

        let token_type = match TokenKind::from_claims(&claims) {
            Some(TokenKind::Access) => {
                let revoked = claim_str(&claims, "jti")
                    .is_some_and(|jti| self.idp.is_access_token_revoked(&jti));
                if revoked {
                    return IntrospectionResponse::inactive();
                }
                "access_token"
            }
            Some(TokenKind::Refresh) => {
                let client = claim_str(&claims, "client_id").unwrap_or_default();
                if self.idp.validate_refresh_token(token, &client).is_err() {
                    return IntrospectionResponse::inactive();
                }
                "refresh_token"
            }
            _ => return IntrospectionResponse::inactive(),
        };

        let sub = claim_str(&claims, "sub");
        IntrospectionResponse {
            active: true,
            token_type: Some(token_type.to_string()),
            scope: claim_str(&claims, "scope"),
            username: sub.clone(),
            sub,
            client_id: claim_str(&claims, "client_id").or_else(|| claim_str(&claims, "aud")),
            exp: claim_i64(&claims, "exp"),
            iat: claim_i64(&claims, "iat"),
            iss: claim_str(&claims, "iss"),
            jti: claim_str(&claims, "jti"),
        }
    }

    /// RFC 7009 revocation on behalf of `client_id`.
    ///
    /// Never fails: unknown tokens and tokens of other clients are ignored.
    pub fn revoke(&self, token: &str, hint: Option<&str>, client_id: &str) -> RevocationOutcome {
        let try_refresh = !matches!(hint, Some("access_token"));
        if try_refresh {
            if let Some(stored) = self.idp.find_refresh_token(token) {
                if stored.client_id != client_id {
                    return RevocationOutcome::ForeignClient;
                }
                self.idp.revoke_refresh_token(token);
                return RevocationOutcome::RefreshToken;
            }
        }

        let Ok(claims) = self.verify(token) else {
            return RevocationOutcome::Unknown;
        };
        if TokenKind::from_claims(&claims) != Some(TokenKind::Access) {
            return RevocationOutcome::Unknown;
        }
        let owner = claim_str(&claims, "client_id").or_else(|| claim_str(&claims, "aud"));
        if owner.as_deref() != Some(client_id) {
            return RevocationOutcome::ForeignClient;
        }
        match (claim_str(&claims, "jti"), claim_i64(&claims, "exp")) {
            (Some(jti), Some(exp)) => {
                self.idp.revoke_access_token(&jti, exp);
                RevocationOutcome::AccessToken
            }
            _ => RevocationOutcome::Unknown,
        }
    }
}

/// What [`TokenIssuer::revoke`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    /// A stored refresh token was revoked
    RefreshToken,
    /// An access token `jti` was added to the deny-list
    AccessToken,
    /// The token belongs to another client and was left alone
    ForeignClient,
    /// Not a token this issuer recognises
    Unknown,
}

impl RevocationOutcome {
    /// Short label for logs and events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RefreshToken => "refresh_token_revoked",
            Self::AccessToken => "access_token_revoked",
            Self::ForeignClient => "foreign_client_ignored",
            Self::Unknown => "unknown_token",
        }
    }
}

/// String claim by key.
pub fn claim_str(claims: &Claims, key: &str) -> Option<String> {
    claims.get(key).and_then(Value::as_str).map(str::to_string)
}

fn claim_i64(claims: &Claims, key: &str) -> Option<i64> {
    claims.get(key).and_then(Value::as_i64)
}

fn audience_matches(claims: &Claims, audience: &str) -> bool {
    match claims.get("aud") {
        Some(Value::String(aud)) => aud == audience,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(audience)),
        _ => false,
    }
}
