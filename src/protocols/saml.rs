//! SAML 2.0 identity provider plugin (contract level).
//!
//! XML encoding is out of scope: the assertion is a signed token with
//! `token_use = saml_assertion`, base64-wrapped the way a `SAMLResponse`
//! travels over the HTTP-POST binding. Service providers are registered
//! clients; the client id is the SP entity id and its redirect URIs are the
//! permitted assertion consumer service (ACS) URLs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Form, Json, Router,
    extract::{Query, State, rejection::{FormRejection, QueryRejection}},
    http::HeaderMap,
    response::{Html, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::login::{LoginPage, escape};
use super::{ProtocolError, correlated, correlation_id, ready_context};
use crate::config::PluginConfig;
use crate::plugin::{PluginContext, PluginError, PluginInfo, PluginSlot, ProtocolPlugin};
use crate::tokens::{TokenKind, claim_str};

const DEFAULT_ASSERTION_TTL: Duration = Duration::from_secs(300);
const ASSERTION_SCOPE: &str = "profile email roles";
const AUTHN_CONTEXT: &str = "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport";
const NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

#[derive(Debug, Clone)]
struct SamlSettings {
    entity_id: Option<String>,
    assertion_ttl: Duration,
}

impl Default for SamlSettings {
    fn default() -> Self {
        Self {
            entity_id: None,
            assertion_ttl: DEFAULT_ASSERTION_TTL,
        }
    }
}

/// SAML plugin.
#[derive(Default)]
pub struct SamlPlugin {
    slot: PluginSlot,
    settings: RwLock<SamlSettings>,
}

impl SamlPlugin {
    fn entity_id(&self, ctx: &PluginContext) -> String {
        self.settings.read().entity_id.clone().unwrap_or_else(|| {
            format!("{}/saml", ctx.tokens().issuer().trim_end_matches('/'))
        })
    }
}

#[async_trait]
impl ProtocolPlugin for SamlPlugin {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: "saml".to_string(),
            name: "SAML 2.0".to_string(),
            version: "1.0.0".to_string(),
            description: "Web browser SSO profile with HTTP-POST binding".to_string(),
        }
    }

    async fn initialize(&self, ctx: PluginContext, config: &PluginConfig) -> Result<(), PluginError> {
        let assertion_ttl = config
            .setting_duration("assertion_ttl")
            .map_err(|e| PluginError::Config(e.to_string()))?
            .unwrap_or(DEFAULT_ASSERTION_TTL);
        if assertion_ttl.is_zero() {
            return Err(PluginError::Config("assertion_ttl must be positive".into()));
        }

        *self.settings.write() = SamlSettings {
            entity_id: config.setting_str("entity_id").map(str::to_string),
            assertion_ttl,
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
            .route("/sso", get(sso_page).post(sso_submit))
            .route("/metadata", get(metadata))
            .route("/validate", post(validate))
            .with_state(self)
    }
}

/// Query of `GET /sso`.
#[derive(Debug, Default, Deserialize)]
struct SsoQuery {
    /// SP entity id (registered client id)
    #[serde(default)]
    sp: String,
    /// Assertion consumer service URL
    #[serde(default)]
    acs: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
    correlation_id: Option<String>,
}

/// Form of `POST /sso`.
#[derive(Debug, Default, Deserialize)]
struct SsoForm {
    #[serde(default)]
    sp: String,
    #[serde(default)]
    acs: String,
    #[serde(rename = "RelayState")]
    relay_state: Option<String>,
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
    correlation_id: Option<String>,
}

/// Form of `POST /validate`.
#[derive(Debug, Default, Deserialize)]
struct ValidateForm {
    #[serde(rename = "SAMLResponse", default)]
    saml_response: String,
    #[serde(default)]
    audience: String,
}

fn check_service_provider(ctx: &PluginContext, sp: &str, acs: &str) -> Result<String, ProtocolError> {
    let client = ctx
        .idp()
        .get_client(sp)
        .map_err(|_| ProtocolError::invalid_request("Unknown service provider"))?;
    if !ctx.idp().validate_redirect_uri(&client.id, acs) {
        return Err(ProtocolError::invalid_request(
            "ACS URL not registered for service provider",
        ));
    }
    Ok(client.name)
}

fn sso_login_page<'a>(
    sp_name: &'a str,
    hidden: Vec<(&'a str, &'a str)>,
    error: Option<&'a str>,
) -> LoginPage<'a> {
    LoginPage {
        title: "SAML 2.0",
        badge: "SAML 2.0 Single Sign-On",
        action: "/saml/sso",
        button: "Sign In with SAML",
        client_name: sp_name,
        hidden,
        scope: ASSERTION_SCOPE,
        error,
    }
}

/// `GET /saml/sso`: check the SP and ACS, render the login form.
async fn sso_page(
    State(plugin): State<Arc<SamlPlugin>>,
    headers: HeaderMap,
    query: Result<Query<SsoQuery>, QueryRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Query(query) = query?;
    let correlation = correlation_id(&headers, query.correlation_id.as_deref());
    let step = ctx.events().step("saml.sso.request", &correlation);

    let sp_name = match check_service_provider(&ctx, &query.sp, &query.acs) {
        Ok(name) => name,
        Err(err) => {
            warn!(sp = %query.sp, correlation_id = %correlation, error = %err, "SAML request rejected");
            return Err(err.with_correlation(&correlation).record(step));
        }
    };
    step.success(json!({ "sp": query.sp, "acs": query.acs }));

    let relay = query.relay_state.as_deref().unwrap_or_default();
    let page = sso_login_page(
        &sp_name,
        vec![
            ("sp", query.sp.as_str()),
            ("acs", query.acs.as_str()),
            ("RelayState", relay),
            ("correlation_id", correlation.as_str()),
        ],
        None,
    );
    Ok(correlated(&correlation, page))
}

/// `POST /saml/sso`: authenticate and post a signed assertion to the ACS.
async fn sso_submit(
    State(plugin): State<Arc<SamlPlugin>>,
    headers: HeaderMap,
    form: Result<Form<SsoForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, form.correlation_id.as_deref());
    let step = ctx.events().step("saml.sso.assertion", &correlation);

    let sp_name = match check_service_provider(&ctx, &form.sp, &form.acs) {
        Ok(name) => name,
        Err(err) => return Err(err.with_correlation(&correlation).record(step)),
    };
    let relay = form.relay_state.as_deref().unwrap_or_default();

    let user = match ctx.idp().validate_credentials(&form.email, &form.password) {
        Ok(user) => user,
        Err(err) => {
            step.error(json!({ "sp": form.sp, "error": "login_failed" }));
            let message = err.to_string();
            let page = sso_login_page(
                &sp_name,
                vec![
                    ("sp", form.sp.as_str()),
                    ("acs", form.acs.as_str()),
                    ("RelayState", relay),
                    ("correlation_id", correlation.as_str()),
                ],
                Some(&message),
            );
            return Ok(correlated(&correlation, page));
        }
    };

    let mut attributes = match ctx.idp().user_claims(&user.id, ASSERTION_SCOPE) {
        Ok(claims) => claims,
        Err(err) => return Err(ProtocolError::from(err).with_correlation(&correlation).record(step)),
    };
    attributes.remove("sub");
    let mut claims = serde_json::Map::new();
    claims.insert("issuer_entity_id".into(), json!(plugin.entity_id(&ctx)));
    claims.insert("name_id".into(), json!(user.email));
    claims.insert("name_id_format".into(), json!(NAME_ID_FORMAT));
    claims.insert("session_index".into(), json!(format!("_{}", uuid::Uuid::new_v4())));
    claims.insert("authn_context".into(), json!(AUTHN_CONTEXT));
    claims.insert("recipient".into(), json!(form.acs));
    claims.insert("attributes".into(), Value::Object(attributes));

    let ttl = plugin.settings.read().assertion_ttl;
    let assertion = match ctx
        .tokens()
        .issue_signed(TokenKind::SamlAssertion, &user.id, &form.sp, ttl, claims)
    {
        Ok(assertion) => assertion,
        Err(err) => return Err(ProtocolError::from(err).with_correlation(&correlation).record(step)),
    };

    info!(sp = %form.sp, user_id = %user.id, correlation_id = %correlation, "SAML assertion issued");
    step.success(json!({
        "sp": form.sp,
        "acs": form.acs,
        "assertion": assertion.metadata(TokenKind::SamlAssertion),
    }));

    let saml_response = STANDARD.encode(assertion.token.as_bytes());
    Ok(correlated(
        &correlation,
        Html(post_binding_form(&form.acs, &saml_response, relay)),
    ))
}

/// HTTP-POST binding: a self-submitting form to the ACS.
fn post_binding_form(acs: &str, saml_response: &str, relay_state: &str) -> String {
    let relay = if relay_state.is_empty() {
        String::new()
    } else {
        format!(
            r#"<input type="hidden" name="RelayState" value="{}">"#,
            escape(relay_state)
        )
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<body onload="document.forms[0].submit()">
  <form method="POST" action="{acs}">
    <input type="hidden" name="SAMLResponse" value="{response}">
    {relay}
    <noscript><button type="submit">Continue</button></noscript>
  </form>
</body>
</html>"#,
        acs = escape(acs),
        response = escape(saml_response),
    )
}

/// `GET /saml/metadata`.
async fn metadata(State(plugin): State<Arc<SamlPlugin>>) -> Result<Json<Value>, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let base = ctx.tokens().issuer().trim_end_matches('/').to_string();
    Ok(Json(json!({
        "entity_id": plugin.entity_id(&ctx),
        "single_sign_on_service": [
            { "binding": "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect", "location": format!("{base}/saml/sso") },
            { "binding": "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST", "location": format!("{base}/saml/sso") },
        ],
        "name_id_formats": [NAME_ID_FORMAT],
        "signing_algorithm": ctx.tokens().signing_algorithm().as_str(),
        "signing_keys": ctx.tokens().jwks(),
        "assertion_ttl_seconds": plugin.settings.read().assertion_ttl.as_secs(),
    })))
}

/// `POST /saml/validate`: verify an assertion for an audience.
///
/// Invalid assertions yield `{"valid": false}` with `200`.
async fn validate(
    State(plugin): State<Arc<SamlPlugin>>,
    headers: HeaderMap,
    form: Result<Form<ValidateForm>, FormRejection>,
) -> Result<Response, ProtocolError> {
    let ctx = ready_context(&plugin.slot)?;
    let Form(form) = form?;
    let correlation = correlation_id(&headers, None);
    let step = ctx.events().step("saml.validate", &correlation);

    let result = decode_assertion(&form.saml_response).and_then(|token| {
        ctx.tokens()
            .verify_for_audience(&token, TokenKind::SamlAssertion, &form.audience)
            .map_err(|e| e.to_string())
    });

    let body = match result {
        Ok(claims) => {
            step.success(json!({ "audience": form.audience, "valid": true }));
            json!({
                "valid": true,
                "subject": claims.get("sub"),
                "name_id": claims.get("name_id"),
                "audience": form.audience,
                "session_index": claims.get("session_index"),
                "attributes": claims.get("attributes"),
                "issued_at": claims.get("iat"),
                "expires_at": claims.get("exp"),
                "issuer": claim_str(&claims, "issuer_entity_id"),
            })
        }
        Err(reason) => {
            step.error(json!({ "audience": form.audience, "valid": false, "reason": reason }));
            json!({ "valid": false, "reason": reason })
        }
    };
    Ok(correlated(&correlation, Json(body)))
}

fn decode_assertion(saml_response: &str) -> Result<String, String> {
    let bytes = STANDARD
        .decode(saml_response.trim())
        .map_err(|_| "SAMLResponse is not valid base64".to_string())?;
    String::from_utf8(bytes).map_err(|_| "SAMLResponse is not valid UTF-8".to_string())
}
