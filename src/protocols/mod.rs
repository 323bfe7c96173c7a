//! Protocol plugins and the helpers they share.
//!
//! | Plugin | Namespace | Surface |
//! |--------|-----------|---------|
//! | [`OAuth2Plugin`] | `/oauth2` | authorize, token, introspect, revoke, demo presets |
//! | [`OidcPlugin`] | `/oidc` | authorize, token, userinfo, discovery, JWKS |
//! | [`SamlPlugin`] | `/saml` | SSO (POST binding), metadata, assertion validation |
//! | [`SpiffePlugin`] | `/spiffe` | JWT-SVID issuance, validation, trust bundle |
//!
//! Every handler answers with [`ProtocolError`] on failure, so the error
//! vocabulary and cache headers are uniform across plugins.

mod authz;
mod login;
mod oauth2;
mod oidc;
mod saml;
mod spiffe;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    extract::rejection::{FormRejection, QueryRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use serde::Serialize;
use showcase_wire::ErrorBody;
use tracing::error;

pub use oauth2::OAuth2Plugin;
pub use oidc::OidcPlugin;
pub use saml::SamlPlugin;
pub use spiffe::SpiffePlugin;

use crate::idp::IdpError;
use crate::lookingglass::StepTimer;
use crate::plugin::{PluginContext, PluginSlot, ProtocolPlugin};
use crate::tokens::IssueError;

/// Header carrying the flow correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

// ── Error vocabulary ──────────────────────────────────────────────────────

/// OAuth 2.0 / OIDC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    InvalidToken,
    ServerError,
    TemporarilyUnavailable,
}

impl OAuthErrorCode {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidToken => "invalid_token",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }

    /// Status used unless a handler overrides it.
    #[must_use]
    pub fn default_status(self) -> StatusCode {
        match self {
            Self::InvalidClient | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP-facing protocol failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {description}")]
pub struct ProtocolError {
    pub code: OAuthErrorCode,
    pub description: String,
    pub state: Option<String>,
    pub status: StatusCode,
    correlation_id: Option<String>,
}

impl ProtocolError {
    /// Error with the code's default status.
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            state: None,
            status: code.default_status(),
            correlation_id: None,
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest, description)
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidClient, description)
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidGrant, description)
    }

    pub fn invalid_token(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidToken, description)
    }

    /// Opaque internal failure; log the cause before calling.
    pub fn server_error() -> Self {
        Self::new(OAuthErrorCode::ServerError, "Internal server error")
    }

    /// Echo the client's `state`.
    #[must_use]
    pub fn with_state(mut self, state: Option<&str>) -> Self {
        self.state = state.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Echo the flow's correlation id in the response header.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Wire body.
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.code.as_str().to_string(),
            error_description: self.description.clone(),
            state: self.state.clone(),
        }
    }

    /// Close `step` as failed with this error and pass it on.
    pub(crate) fn record(self, step: StepTimer) -> Self {
        step.error(serde_json::json!({
            "error": self.code,
            "error_description": self.description,
        }));
        self
    }
}

impl IntoResponse for ProtocolError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body())).into_response();
        let headers = response.headers_mut();
        no_store(headers);

        if self.status == StatusCode::UNAUTHORIZED {
            let challenge = match self.code {
                OAuthErrorCode::InvalidClient => "Basic realm=\"protocol-showcase\"".to_string(),
                code => format!("Bearer error=\"{code}\""),
            };
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }
        if let Some(id) = &self.correlation_id {
            set_correlation(headers, id);
        }
        response
    }
}

impl From<IdpError> for ProtocolError {
    fn from(err: IdpError) -> Self {
        match err {
            IdpError::ClientNotFound(_) => Self::invalid_client("Unknown client"),
            IdpError::InvalidClient => Self::invalid_client("Client authentication failed"),
            IdpError::InvalidRedirectUri => Self::invalid_request("Invalid redirect_uri"),
            other => Self::invalid_grant(other.to_string()),
        }
    }
}

impl From<FormRejection> for ProtocolError {
    fn from(rejection: FormRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ProtocolError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl From<IssueError> for ProtocolError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Idp(e) => e.into(),
            IssueError::InvalidScope(msg) => Self::new(OAuthErrorCode::InvalidScope, msg),
            IssueError::InvalidToken(msg) => Self::invalid_token(msg),
            IssueError::Signing(e) => {
                error!(error = %e, "Token signing failed");
                Self::server_error()
            }
        }
    }
}

// ── Response helpers ──────────────────────────────────────────────────────

/// `Cache-Control: no-store` and `Pragma: no-cache`.
pub(crate) fn no_store(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

fn set_correlation(headers: &mut HeaderMap, correlation_id: &str) {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(HeaderName::from_static(CORRELATION_HEADER), value);
    }
}

/// JSON body with no-store headers and the correlation id echoed.
pub(crate) fn json_no_store<T: Serialize>(correlation_id: &str, body: &T) -> Response {
    let mut response = Json(body).into_response();
    no_store(response.headers_mut());
    set_correlation(response.headers_mut(), correlation_id);
    response
}

/// Attach the correlation header to any response.
pub(crate) fn correlated(correlation_id: &str, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    set_correlation(response.headers_mut(), correlation_id);
    response
}

/// `302 Found` to `base` with `params` appended to its query.
pub(crate) fn redirect_with_params(
    base: &str,
    params: &[(&str, &str)],
) -> Result<Response, ProtocolError> {
    let mut url = url::Url::parse(base)
        .map_err(|_| ProtocolError::invalid_request("Malformed redirect_uri"))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in params.iter().filter(|(_, v)| !v.is_empty()) {
            query.append_pair(key, value);
        }
    }
    let location = HeaderValue::from_str(url.as_str())
        .map_err(|_| ProtocolError::invalid_request("Malformed redirect_uri"))?;
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}

// ── Request helpers ───────────────────────────────────────────────────────

/// Correlation id from the header, then `field`, else a fresh `flow-<uuid>`.
pub(crate) fn correlation_id(headers: &HeaderMap, field: Option<&str>) -> String {
    explicit_correlation(headers, field).unwrap_or_else(new_correlation_id)
}

/// Correlation id supplied by the caller, if any.
pub(crate) fn explicit_correlation(headers: &HeaderMap, field: Option<&str>) -> Option<String> {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            field
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
}

pub(crate) fn new_correlation_id() -> String {
    format!("flow-{}", uuid::Uuid::new_v4())
}

/// Client id and secret presented on a back-channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl ClientCredentials {
    /// HTTP Basic first, then `client_id`/`client_secret` form fields.
    pub fn extract(
        headers: &HeaderMap,
        form_id: Option<&str>,
        form_secret: Option<&str>,
    ) -> Option<Self> {
        Self::from_basic(headers).or_else(|| {
            form_id.filter(|id| !id.is_empty()).map(|id| Self {
                client_id: id.to_string(),
                client_secret: form_secret.filter(|s| !s.is_empty()).map(str::to_string),
            })
        })
    }

    fn from_basic(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let encoded = value
            .strip_prefix("Basic ")
            .or_else(|| value.strip_prefix("basic "))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (id, secret) = decoded.split_once(':')?;
        let client_id = form_decode(id);
        if client_id.is_empty() {
            return None;
        }
        Some(Self {
            client_id,
            client_secret: Some(form_decode(secret)).filter(|s| !s.is_empty()),
        })
    }
}

/// `application/x-www-form-urlencoded` decoding of a single Basic-auth half.
fn form_decode(value: &str) -> String {
    let escaped = value.replace('&', "%26").replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

/// Bearer token from the `Authorization` header.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The plugin's context, or `temporarily_unavailable` when it is not Ready.
pub(crate) fn ready_context(slot: &PluginSlot) -> Result<PluginContext, ProtocolError> {
    slot.ready().ok_or_else(|| {
        ProtocolError::new(
            OAuthErrorCode::TemporarilyUnavailable,
            "Protocol plugin is not ready",
        )
    })
}

// ── Plugin catalogue ──────────────────────────────────────────────────────

/// The protocol plugins this build ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    OAuth2,
    Oidc,
    Saml,
    Spiffe,
}

impl PluginKind {
    /// Every kind, in registration order.
    #[must_use]
    pub fn all() -> [Self; 4] {
        [Self::OAuth2, Self::Oidc, Self::Saml, Self::Spiffe]
    }

    /// Namespace and registry key.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::OAuth2 => "oauth2",
            Self::Oidc => "oidc",
            Self::Saml => "saml",
            Self::Spiffe => "spiffe",
        }
    }

    /// Fresh, uninitialized plugin instance.
    #[must_use]
    pub fn build(self) -> Arc<dyn ProtocolPlugin> {
        match self {
            Self::OAuth2 => Arc::new(OAuth2Plugin::default()),
            Self::Oidc => Arc::new(OidcPlugin::default()),
            Self::Saml => Arc::new(SamlPlugin::default()),
            Self::Spiffe => Arc::new(SpiffePlugin::default()),
        }
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .into_iter()
            .find(|k| k.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown protocol plugin: {s}"))
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(id: &str, secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {encoded}")).unwrap(),
        );
        headers
    }

    #[test]
    fn basic_auth_wins_over_form() {
        let headers = basic("demo-app", "demo-secret");
        let creds =
            ClientCredentials::extract(&headers, Some("other"), Some("x")).unwrap();
        assert_eq!(creds.client_id, "demo-app");
        assert_eq!(creds.client_secret.as_deref(), Some("demo-secret"));
    }

    #[test]
    fn basic_auth_halves_are_form_decoded() {
        let headers = basic("svc%3Aone", "p%40ss+w%2Brd%26%3D");
        let creds = ClientCredentials::extract(&headers, None, None).unwrap();
        assert_eq!(creds.client_id, "svc:one");
        assert_eq!(creds.client_secret.as_deref(), Some("p@ss w+rd&="));

        assert!(ClientCredentials::extract(&basic("", "x"), None, None).is_none());
    }

    #[test]
    fn form_credentials_fallback() {
        let creds = ClientCredentials::extract(&HeaderMap::new(), Some("public-app"), Some(""))
            .unwrap();
        assert_eq!(creds.client_id, "public-app");
        assert_eq!(creds.client_secret, None);
        assert!(ClientCredentials::extract(&HeaderMap::new(), None, None).is_none());
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            ProtocolError::invalid_client("x").status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProtocolError::invalid_grant("x").status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProtocolError::server_error().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn idp_errors_follow_taxonomy() {
        assert_eq!(
            ProtocolError::from(IdpError::CodeConsumed).code,
            OAuthErrorCode::InvalidGrant
        );
        assert_eq!(
            ProtocolError::from(IdpError::PkceFailed).code,
            OAuthErrorCode::InvalidGrant
        );
        assert_eq!(
            ProtocolError::from(IdpError::InvalidClient).code,
            OAuthErrorCode::InvalidClient
        );
        assert_eq!(
            ProtocolError::from(IssueError::InvalidScope("x".into())).code,
            OAuthErrorCode::InvalidScope
        );
    }

    #[test]
    fn error_response_headers() {
        let response = ProtocolError::invalid_token("expired")
            .with_correlation("flow-1")
            .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Bearer error=\"invalid_token\""
        );
        assert_eq!(response.headers()[CORRELATION_HEADER], "flow-1");
    }

    #[test]
    fn state_is_echoed_only_when_present() {
        let body = ProtocolError::invalid_request("x").with_state(Some("")).body();
        assert_eq!(body.state, None);
        let body = ProtocolError::invalid_request("x")
            .with_state(Some("xyz"))
            .body();
        assert_eq!(body.state.as_deref(), Some("xyz"));
    }

    #[test]
    fn redirect_appends_params() {
        let response = redirect_with_params(
            "http://localhost:3000/callback?existing=1",
            &[("code", "abc"), ("state", "")],
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://localhost:3000/callback?existing=1&code=abc"
        );
    }

    #[test]
    fn correlation_sources() {
        let mut headers = HeaderMap::new();
        assert!(correlation_id(&headers, None).starts_with("flow-"));
        assert_eq!(correlation_id(&headers, Some("form-id")), "form-id");
        headers.insert(CORRELATION_HEADER, HeaderValue::from_static("hdr-id"));
        assert_eq!(correlation_id(&headers, Some("form-id")), "hdr-id");
    }

    #[test]
    fn plugin_kinds_parse() {
        assert_eq!("OIDC".parse::<PluginKind>().unwrap(), PluginKind::Oidc);
        assert!("ldap".parse::<PluginKind>().is_err());
        assert_eq!(PluginKind::Spiffe.build().info().id, "spiffe");
    }
}
