//! OAuth 2.0 authorization server plugin.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/oauth2/authorize` | Validate the request, render the login form |
//! | `POST` | `/oauth2/authorize` | Log in, issue a code, redirect to the client |
//! | `POST` | `/oauth2/token` | `authorization_code`, `refresh_token`, `client_credentials` |
//! | `POST` | `/oauth2/introspect` | RFC 7662 introspection (client auth required) |
//! | `POST` | `/oauth2/revoke` | RFC 7009 revocation, always `200` |
//! | `GET` | `/oauth2/demo/users` | Demo user presets |
//! | `GET` | `/oauth2/demo/clients` | Demo client presets |

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::{Query, State, rejection::{FormRejection, QueryRejection}},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::authz::{self, AuthorizeForm, AuthorizeQuery, AuthzProfile, TokenForm};
use super::{ProtocolError, correlated, correlation_id, json_no_store, ready_context};
use crate::config::PluginConfig;
use crate::idp::{GrantType, presets};
use crate::plugin::{PluginContext, PluginError, PluginInfo, PluginSlot, ProtocolPlugin};

const PROFILE: AuthzProfile = AuthzProfile {
    plugin: "oauth2",
    require_openid: false,
    grants: &[
        GrantType::AuthorizationCode,
        GrantType::RefreshToken,
        GrantType::ClientCredentials,
    ],
    title: "OAuth 2.0",
    badge: "OAuth 2.0 Authorization",
    button: "Sign In",
};

/// OAuth 2.0 plugin.
#[derive(Default)]
pub struct OAuth2Plugin {
    slot: PluginSlot,
}

#[async_trait]
impl ProtocolPlugin for OAuth2Plugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: PROFILE.plugin.to_string(),
            name: "OAuth 2.0".to_string(),
            version: "1.0.0".to_string(),
            description: "RFC 6749 authorization server with PKCE, introspection and revocation"
                .to_string(),
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
            .route("/introspect", post(introspect))
            .route("/revoke", post(revoke))
            .route("/demo/users", get(demo_users))
            .route("/demo/clients", get(demo_clients))
            .with_state(self)
    }
}

/// Form of `POST /introspect` and `POST /revoke`.
#[derive(Debug, Default, Deserialize)]
struct TokenActionForm {
    #[serde(default)]
    token: String,
    token_type_hint: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    correlation_id: Option<String>,
}

async fn authorize(
    State(plugin): State<Arc<OAuth2Plugin>>,
    headers: HeaderMap,
    query: Result<Query<AuthorizeQuery>, QueryRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Query(query) = query?;
    Ok(authz::authorize_page(&PROFILE, &ctx, &headers, &query))
}

async fn authorize_submit(
    State(plugin): State<Arc<OAuth2Plugin>>,
    headers: HeaderMap,
    form: Result<Form<AuthorizeForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    Ok(authz::authorize_submit(&PROFILE, &ctx, &headers, &form))
}

async fn token(
    State(plugin): State<Arc<OAuth2Plugin>>,
    headers: HeaderMap,
    form: Result<Form<TokenForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    Ok(authz::token(&PROFILE, &ctx, &headers, &form))
}

/// `POST /oauth2/introspect`: RFC 7662.
///
/// Invalid tokens are `{"active": false}` with `200`; only a failed client
/// authentication is an error.
async fn introspect(
    State(plugin): State<Arc<OAuth2Plugin>>,
    headers: HeaderMap,
    form: Result<Form<TokenActionForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, form.correlation_id.as_deref());
    let step = ctx.events().step("oauth2.introspect", &correlation);

    let client = match authz::authenticate_client(
        &ctx,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    ) {
        Ok(client) => client,
        Err(err) => return Err(err.with_correlation(&correlation).record(step)),
    };

    let result = ctx.tokens().introspect(&form.token);
    debug!(client_id = %client.id, active = result.active, "Token introspected");
    step.success(json!({
        "client_id": client.id,
        "active": result.active,
        "token_type": result.token_type,
        "sub": result.sub,
    }));
    Ok(json_no_store(&correlation, &result))
}

/// `POST /oauth2/revoke`: RFC 7009.
///
/// Answers `200` whether or not the token was known or revocable.
async fn revoke(
    State(plugin): State<Arc<OAuth2Plugin>>,
    headers: HeaderMap,
    form: Result<Form<TokenActionForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, form.correlation_id.as_deref());
    let step = ctx.events().step("oauth2.revoke", &correlation);

    let client = match authz::authenticate_client(
        &ctx,
        &headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    ) {
        Ok(client) => client,
        Err(err) => return Err(err.with_correlation(&correlation).record(step)),
    };

    let outcome = if form.token.is_empty() {
        None
    } else {
        Some(ctx.tokens().revoke(
            &form.token,
            form.token_type_hint.as_deref().filter(|h| !h.is_empty()),
            &client.id,
        ))
    };
    let label = outcome.map_or("no_token", |o| o.as_str());
    info!(client_id = %client.id, outcome = label, "Revocation request");
    step.success(json!({
        "client_id": client.id,
        "token_type_hint": form.token_type_hint,
        "outcome": label,
    }));
    Ok(correlated(&correlation, StatusCode::OK))
}

async fn demo_users() -> impl IntoResponse {
    Json(json!({ "users": presets::user_presets() }))
}

async fn demo_clients() -> impl IntoResponse {
    Json(json!({ "clients": presets::client_presets() }))
}
