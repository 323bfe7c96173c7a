//! OpenID Connect provider plugin.
//!
//! Shares the authorization-code server with OAuth 2.0 but requires the
//! `openid` scope, so every successful code redemption yields an ID token.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::{Query, State, rejection::{FormRejection, QueryRejection}},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tracing::debug;

use super::authz::{self, AuthorizeForm, AuthorizeQuery, AuthzProfile, TokenForm};
use super::{
    OAuthErrorCode, ProtocolError, bearer_token, correlation_id, json_no_store, ready_context,
};
use crate::config::PluginConfig;
use crate::idp::{GrantType, has_scope};
use crate::plugin::{PluginContext, PluginError, PluginInfo, PluginSlot, ProtocolPlugin};
use crate::signing::SigningAlgorithm;
use crate::tokens::claim_str;

const PROFILE: AuthzProfile = AuthzProfile {
    plugin: "oidc",
    require_openid: true,
    grants: &[GrantType::AuthorizationCode, GrantType::RefreshToken],
    title: "OpenID Connect",
    badge: "OpenID Connect",
    button: "Sign In with OpenID Connect",
};

/// OpenID Connect plugin.
#[derive(Default)]
pub struct OidcPlugin {
    slot: PluginSlot,
}

#[async_trait]
impl ProtocolPlugin for OidcPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: PROFILE.plugin.to_string(),
            name: "OpenID Connect".to_string(),
            version: "1.0.0".to_string(),
            description: "OIDC Core provider: ID tokens, userinfo, discovery and JWKS".to_string(),
        }
    }

    async fn initialize(&self, ctx: PluginContext, _config: &PluginConfig) -> Result<(), PluginError> {
        self.slot.install(ctx);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.slot.clear();
        Ok(())
    }

    fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/authorize", get(authorize).post(authorize_submit))
            .route("/token", post(token))
            .route("/userinfo", get(userinfo).post(userinfo))
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/jwks", get(jwks))
            .with_state(self)
    }
}

async fn authorize(
    State(plugin): State<Arc<OidcPlugin>>,
    headers: HeaderMap,
    query: Result<Query<AuthorizeQuery>, QueryRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Query(query) = query?;
    Ok(authz::authorize_page(&PROFILE, &ctx, &headers, &query))
}

async fn authorize_submit(
    State(plugin): State<Arc<OidcPlugin>>,
    headers: HeaderMap,
    form: Result<Form<AuthorizeForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    Ok(authz::authorize_submit(&PROFILE, &ctx, &headers, &form))
}

async fn token(
    State(plugin): State<Arc<OidcPlugin>>,
    headers: HeaderMap,
    form: Result<Form<TokenForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    Ok(authz::token(&PROFILE, &ctx, &headers, &form))
}

/// `GET|POST /oidc/userinfo`: claims of the bearer's subject.
async fn userinfo(
    State(plugin): State<Arc<OidcPlugin>>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let correlation = correlation_id(&headers, None);
    let step = ctx.events().step("oidc.userinfo", &correlation);

    match userinfo_claims(&ctx, &headers) {
        Ok(claims) => {
            step.success(json!({
                "sub": claims.get("sub"),
                "claims": claims.keys().collect::<Vec<_>>(),
            }));
            Ok(json_no_store(&correlation, &claims))
        }
        Err(err) => Err(err.with_correlation(&correlation).record(step)),
    }
}

fn userinfo_claims(
    ctx: &PluginContext,
    headers: &HeaderMap,
) -> Result<serde_json::Map<String, Value>, ProtocolError> {
    let token = bearer_token(headers)
        .ok_or_else(|| ProtocolError::invalid_token("Bearer access token required"))?;
    let claims = ctx.tokens().verify_access_token(token)?;

    let scope = claim_str(&claims, "scope").unwrap_or_default();
    if !has_scope(&scope, "openid") {
        return Err(
            ProtocolError::new(OAuthErrorCode::InvalidScope, "openid scope required")
                .with_status(StatusCode::FORBIDDEN),
        );
    }
    let sub = claim_str(&claims, "sub").unwrap_or_default();
    debug!(sub = %sub, "Userinfo request");

    // Client-credentials tokens have no user behind them
    ctx.idp()
        .user_claims(&sub, &scope)
        .map_err(|_| ProtocolError::invalid_token("Token subject is not a user"))
}

/// `GET /oidc/.well-known/openid-configuration`.
async fn discovery(State(plugin): State<Arc<OidcPlugin>>) -> Result<Json<Value>, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let tokens = ctx.tokens();
    Ok(Json(discovery_document(
        tokens.issuer(),
        tokens.signing_algorithm(),
    )))
}

fn discovery_document(issuer: &str, algorithm: SigningAlgorithm) -> Value {
    let base = issuer.trim_end_matches('/');
    json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{base}/oidc/authorize"),
        "token_endpoint": format!("{base}/oidc/token"),
        "userinfo_endpoint": format!("{base}/oidc/userinfo"),
        "jwks_uri": format!("{base}/oidc/jwks"),
        "introspection_endpoint": format!("{base}/oauth2/introspect"),
        "revocation_endpoint": format!("{base}/oauth2/revoke"),
        "response_types_supported": ["code"],
        "grant_types_supported": PROFILE.grants.iter().map(|g| g.as_str()).collect::<Vec<_>>(),
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [algorithm.as_str()],
        "scopes_supported": ["openid", "profile", "email", "roles"],
        "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post", "none"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "claims_supported": [
            "sub", "iss", "aud", "exp", "iat", "auth_time", "nonce", "azp",
            "name", "preferred_username", "updated_at", "email", "email_verified", "roles"
        ],
    })
}

/// `GET /oidc/jwks`.
async fn jwks(State(plugin): State<Arc<OidcPlugin>>) -> Result<impl IntoResponse, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    Ok(Json(ctx.tokens().jwks()))
}
