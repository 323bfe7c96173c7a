//! SPIFFE workload identity plugin.
//!
//! Issues JWT-SVIDs to confidential clients holding the
//! `client_credentials` grant. The SPIFFE ID is derived from the client id:
//! `spiffe://<trust-domain>/client/<client-id>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::{State, rejection::FormRejection},
    http::HeaderMap,
    response::Response,
    routing::{get, post},
};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{
    OAuthErrorCode, ProtocolError, authz, correlated, correlation_id, json_no_store,
    ready_context,
};
use crate::config::PluginConfig;
use crate::idp::GrantType;
use crate::plugin::{PluginContext, PluginError, PluginInfo, PluginSlot, ProtocolPlugin};
use crate::tokens::{TokenKind, claim_str};

const DEFAULT_TRUST_DOMAIN: &str = "showcase.local";
const DEFAULT_SVID_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct SpiffeSettings {
    trust_domain: String,
    svid_ttl: Duration,
}

impl Default for SpiffeSettings {
    fn default() -> Self {
        Self {
            trust_domain: DEFAULT_TRUST_DOMAIN.to_string(),
            svid_ttl: DEFAULT_SVID_TTL,
        }
    }
}

/// SPIFFE plugin.
#[derive(Default)]
pub struct SpiffePlugin {
    slot: PluginSlot,
    settings: RwLock<SpiffeSettings>,
}

/// A trust domain is lowercase letters, digits, `.`, `-` and `_`.
fn valid_trust_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 255
        && domain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
}

fn spiffe_id(trust_domain: &str, client_id: &str) -> String {
    format!("spiffe://{trust_domain}/client/{client_id}")
}

#[async_trait]
impl ProtocolPlugin for SpiffePlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "spiffe".to_string(),
            name: "SPIFFE".to_string(),
            version: "1.0.0".to_string(),
            description: "JWT-SVID issuance, validation and trust bundle".to_string(),
        }
    }

    async fn initialize(&self, ctx: PluginContext, config: &PluginConfig) -> Result<(), PluginError> {
        let trust_domain = config
            .setting_str("trust_domain")
            .unwrap_or(DEFAULT_TRUST_DOMAIN)
            .to_string();
        if !valid_trust_domain(&trust_domain) {
            return Err(PluginError::Config(format!(
                "invalid trust domain: {trust_domain}"
            )));
        }
        let svid_ttl = config
            .setting_duration("svid_ttl")
            .map_err(|e| PluginError::Config(e.to_string()))?
            .unwrap_or(DEFAULT_SVID_TTL);
        if svid_ttl.is_zero() {
            return Err(PluginError::Config("svid_ttl must be positive".into()));
        }

        *self.settings.write() = SpiffeSettings {
            trust_domain,
            svid_ttl,
        };
        self.slot.install(ctx);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        self.slot.clear();
        Ok(())
    }

    fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/svid", post(issue_svid))
            .route("/validate", post(validate))
            .route("/bundle", get(bundle))
            .with_state(self)
    }
}

/// Form of `POST /svid`.
#[derive(Debug, Default, Deserialize)]
struct SvidForm {
    client_id: Option<String>,
    client_secret: Option<String>,
    #[serde(default)]
    audience: String,
    correlation_id: Option<String>,
}

/// Form of `POST /validate`.
#[derive(Debug, Default, Deserialize)]
struct ValidateForm {
    #[serde(default)]
    svid: String,
    #[serde(default)]
    audience: String,
}

/// `POST /spiffe/svid`: mint a JWT-SVID for the authenticated workload.
async fn issue_svid(
    State(plugin): State<Arc<SpiffePlugin>>,
    headers: HeaderMap,
    form: Result<Form<SvidForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, form.correlation_id.as_deref());
    let step = ctx.events().step("spiffe.svid.issue", &correlation);

    match mint(&plugin, &ctx, &headers, &form) {
        Ok(body) => {
            step.success(json!({
                "spiffe_id": body["spiffe_id"],
                "audience": body["audience"],
                "expires_at": body["expires_at"],
            }));
            Ok(json_no_store(&correlation, &body))
        }
        Err(err) => Err(err.with_correlation(&correlation).record(step)),
    }
}

fn mint(
    plugin: &SpiffePlugin,
    ctx: &PluginContext,
    headers: &HeaderMap,
    form: &SvidForm,
) -> Result<Value, ProtocolError> {
    let client = authz::authenticate_client(
        ctx,
        headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;
    if !client.allows_grant(GrantType::ClientCredentials) {
        return Err(ProtocolError::new(
            OAuthErrorCode::UnauthorizedClient,
            "Client is not a workload (client_credentials grant required)",
        ));
    }
    let audience = form.audience.trim();
    if audience.is_empty() {
        return Err(ProtocolError::invalid_request("audience is required"));
    }

    let settings = plugin.settings.read().clone();
    let id = spiffe_id(&settings.trust_domain, &client.id);
    let mut claims = serde_json::Map::new();
    claims.insert("client_id".into(), json!(client.id));
    claims.insert("trust_domain".into(), json!(settings.trust_domain));

    let svid = ctx.tokens().issue_signed(
        TokenKind::JwtSvid,
        &id,
        audience,
        settings.svid_ttl,
        claims,
    )?;
    info!(spiffe_id = %id, audience = %audience, "JWT-SVID issued");

    Ok(json!({
        "spiffe_id": id,
        "svid": svid.token,
        "audience": audience,
        "expires_at": svid.claims.get("exp"),
    }))
}

/// `POST /spiffe/validate`: verify a JWT-SVID for an audience.
///
/// Invalid SVIDs yield `{"valid": false}` with `200`.
async fn validate(
    State(plugin): State<Arc<SpiffePlugin>>,
    headers: HeaderMap,
    form: Result<Form<ValidateForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, None);
    let step = ctx.events().step("spiffe.svid.validate", &correlation);
    let trust_domain = plugin.settings.read().trust_domain.clone();

    let result = ctx
        .tokens()
        .verify_for_audience(&form.svid, TokenKind::JwtSvid, &form.audience)
        .map_err(|e| e.to_string())
        .and_then(|claims| {
            let sub = claim_str(&claims, "sub").unwrap_or_default();
            if sub.starts_with(&format!("spiffe://{trust_domain}/")) {
                Ok((sub, claims))
            } else {
                Err("SPIFFE ID outside trust domain".to_string())
            }
        });

    let body = match result {
        Ok((spiffe_id, claims)) => {
            step.success(json!({ "spiffe_id": spiffe_id, "valid": true }));
            json!({
                "valid": true,
                "spiffe_id": spiffe_id,
                "trust_domain": trust_domain,
                "audience": form.audience,
                "expires_at": claims.get("exp"),
            })
        }
        Err(reason) => {
            step.error(json!({ "audience": form.audience, "valid": false, "reason": reason }));
            json!({ "valid": false, "reason": reason })
        }
    };
    Ok(correlated(&correlation, Json(body)))
}

/// `GET /spiffe/bundle`: JWT trust bundle for the trust domain.
async fn bundle(State(plugin): State<Arc<SpiffePlugin>>) -> Result<Json<Value>, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let settings = plugin.settings.read().clone();
    let keys = ctx.tokens().jwks().get("keys").cloned().unwrap_or_else(|| json!([]));
    Ok(Json(json!({
        "trust_domain": settings.trust_domain,
        "keys": keys,
        "spiffe_refresh_hint": settings.svid_ttl.as_secs(),
    })))
}
