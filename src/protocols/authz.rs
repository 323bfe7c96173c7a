//! Authorization-code server shared by the OAuth 2.0 and OIDC plugins.
//!
//! The two plugins differ only in their [`AuthzProfile`]: OIDC insists on
//! the `openid` scope and does not offer `client_credentials`.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::login::LoginPage;
use super::{
    ClientCredentials, OAuthErrorCode, ProtocolError, correlated, correlation_id,
    explicit_correlation, json_no_store, new_correlation_id, redirect_with_params,
};
use crate::idp::{
    Client, CodeChallengeMethod, CodeRequest, GrantType, IdpError, has_scope,
};
use crate::plugin::PluginContext;

/// Per-plugin behaviour of the authorization server.
pub(crate) struct AuthzProfile {
    /// Plugin id, used as the event stage prefix
    pub plugin: &'static str,
    pub require_openid: bool,
    pub grants: &'static [GrantType],
    pub title: &'static str,
    pub badge: &'static str,
    pub button: &'static str,
}

impl AuthzProfile {
    fn stage(&self, name: &str) -> String {
        format!("{}.{name}", self.plugin)
    }

    fn action(&self) -> String {
        format!("/{}/authorize", self.plugin)
    }
}

/// Query of `GET /authorize`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AuthorizeQuery {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub correlation_id: Option<String>,
}

/// Form of `POST /authorize`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AuthorizeForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub correlation_id: Option<String>,
}

/// Form of `POST /token`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenForm {
    #[serde(default)]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub correlation_id: Option<String>,
}

/// Fields echoed through the login form.
struct PendingAuthorization<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    scope: &'a str,
    state: &'a str,
    nonce: &'a str,
    code_challenge: &'a str,
    code_challenge_method: &'a str,
    correlation_id: &'a str,
}

impl PendingAuthorization<'_> {
    fn login_page<'p>(
        &'p self,
        profile: &'p AuthzProfile,
        action: &'p str,
        client_name: &'p str,
        error: Option<&'p str>,
    ) -> LoginPage<'p> {
        let mut hidden = vec![
            ("client_id", self.client_id),
            ("redirect_uri", self.redirect_uri),
            ("scope", self.scope),
            ("state", self.state),
        ];
        if profile.require_openid {
            hidden.push(("nonce", self.nonce));
        }
        hidden.extend([
            ("code_challenge", self.code_challenge),
            ("code_challenge_method", self.code_challenge_method),
            ("correlation_id", self.correlation_id),
        ]);
        LoginPage {
            title: profile.title,
            badge: profile.badge,
            action,
            button: profile.button,
            client_name,
            hidden,
            scope: self.scope,
            error,
        }
    }
}

/// `GET /authorize`: validate the request and render the login form.
pub(crate) fn authorize_page(
    profile: &AuthzProfile,
    ctx: &PluginContext,
    headers: &HeaderMap,
    query: &AuthorizeQuery,
) -> Response {
    let correlation = correlation_id(headers, query.correlation_id.as_deref());
    let step = ctx
        .events()
        .step(&profile.stage("authorize.request"), &correlation);

    let client = match validate_authorize_request(profile, ctx, query) {
        Ok(client) => client,
        Err(err) => {
            warn!(
                plugin = profile.plugin,
                client_id = %query.client_id,
                correlation_id = %correlation,
                error = %err,
                "Authorization request rejected"
            );
            return err
                .with_state(query.state.as_deref())
                .with_correlation(&correlation)
                .record(step)
                .into_response();
        }
    };

    step.success(json!({
        "client_id": client.id,
        "redirect_uri": query.redirect_uri,
        "scope": query.scope,
        "pkce": query.code_challenge.as_deref().is_some_and(|c| !c.is_empty()),
        "code_challenge_method": query.code_challenge_method,
    }));
    debug!(plugin = profile.plugin, client_id = %client.id, correlation_id = %correlation, "Rendering login form");

    let pending = PendingAuthorization {
        client_id: &query.client_id,
        redirect_uri: &query.redirect_uri,
        scope: &query.scope,
        state: query.state.as_deref().unwrap_or_default(),
        nonce: query.nonce.as_deref().unwrap_or_default(),
        code_challenge: query.code_challenge.as_deref().unwrap_or_default(),
        code_challenge_method: query.code_challenge_method.as_deref().unwrap_or_default(),
        correlation_id: &correlation,
    };
    let action = profile.action();
    correlated(
        &correlation,
        pending.login_page(profile, &action, &client.name, None),
    )
}

fn validate_authorize_request(
    profile: &AuthzProfile,
    ctx: &PluginContext,
    query: &AuthorizeQuery,
) -> Result<Client, ProtocolError> {
    if profile.require_openid && !has_scope(&query.scope, "openid") {
        return Err(ProtocolError::new(
            OAuthErrorCode::InvalidScope,
            "openid scope is required for OIDC",
        ));
    }
    if query.response_type != "code" {
        return Err(ProtocolError::new(
            OAuthErrorCode::UnsupportedResponseType,
            "Only 'code' response type is supported",
        ));
    }
    if query.client_id.is_empty() {
        return Err(ProtocolError::invalid_request("client_id is required"));
    }
    let client = ctx
        .idp()
        .get_client(&query.client_id)
        .map_err(|_| ProtocolError::invalid_client("Unknown client").with_status(StatusCode::BAD_REQUEST))?;
    if !ctx.idp().validate_redirect_uri(&client.id, &query.redirect_uri) {
        return Err(ProtocolError::invalid_request("Invalid redirect_uri"));
    }
    if !client.allows_grant(GrantType::AuthorizationCode) {
        return Err(ProtocolError::new(
            OAuthErrorCode::UnauthorizedClient,
            "Client not authorized for the authorization code grant",
        ));
    }
    Ok(client)
}

/// `POST /authorize`: check credentials, issue a code and redirect.
///
/// The redirect URI is re-validated before anything else so that neither
/// the success redirect nor a login-failure re-render can be steered to an
/// unregistered URI.
pub(crate) fn authorize_submit(
    profile: &AuthzProfile,
    ctx: &PluginContext,
    headers: &HeaderMap,
    form: &AuthorizeForm,
) -> Response {
    let correlation = correlation_id(headers, form.correlation_id.as_deref());
    let step = ctx.events().step(&profile.stage("authorize.login"), &correlation);

    let client = match ctx.idp().get_client(&form.client_id) {
        Ok(client) if ctx.idp().validate_redirect_uri(&client.id, &form.redirect_uri) => client,
        Ok(_) | Err(_) => {
            return ProtocolError::invalid_request("Invalid redirect_uri")
                .with_correlation(&correlation)
                .record(step)
                .into_response();
        }
    };

    let user = match ctx.idp().validate_credentials(&form.email, &form.password) {
        Ok(user) => user,
        Err(err) => {
            warn!(
                plugin = profile.plugin,
                client_id = %client.id,
                correlation_id = %correlation,
                "Login failed"
            );
            step.error(json!({
                "client_id": client.id,
                "error": "login_failed",
                "error_description": err.to_string(),
            }));
            let pending = PendingAuthorization {
                client_id: &form.client_id,
                redirect_uri: &form.redirect_uri,
                scope: &form.scope,
                state: form.state.as_deref().unwrap_or_default(),
                nonce: form.nonce.as_deref().unwrap_or_default(),
                code_challenge: form.code_challenge.as_deref().unwrap_or_default(),
                code_challenge_method: form.code_challenge_method.as_deref().unwrap_or_default(),
                correlation_id: &correlation,
            };
            let action = profile.action();
            let message = IdpError::InvalidCredentials.to_string();
            return correlated(
                &correlation,
                pending.login_page(profile, &action, &client.name, Some(&message)),
            );
        }
    };

    let code = ctx.idp().create_authorization_code(CodeRequest {
        client_id: client.id.clone(),
        user_id: user.id.clone(),
        redirect_uri: form.redirect_uri.clone(),
        scope: form.scope.clone(),
        state: form.state.clone(),
        nonce: form.nonce.clone().filter(|n| !n.is_empty()),
        code_challenge: form.code_challenge.clone(),
        code_challenge_method: Some(CodeChallengeMethod::from_param(
            form.code_challenge_method.as_deref(),
        )),
        correlation_id: Some(correlation.clone()),
    });

    let redirect = redirect_with_params(
        &form.redirect_uri,
        &[
            ("code", code.code.as_str()),
            ("state", form.state.as_deref().unwrap_or_default()),
        ],
    );
    match redirect {
        Ok(response) => {
            info!(
                plugin = profile.plugin,
                client_id = %client.id,
                user_id = %user.id,
                correlation_id = %correlation,
                "Authorization code issued"
            );
            step.success(json!({
                "client_id": client.id,
                "user_id": user.id,
                "scope": code.scope,
                "pkce": code.code_challenge.is_some(),
                "code_challenge_method": code.code_challenge_method.as_str(),
                "expires_at": code.expires_at,
            }));
            correlated(&correlation, response)
        }
        Err(err) => err
            .with_state(form.state.as_deref())
            .with_correlation(&correlation)
            .record(step)
            .into_response(),
    }
}

/// `POST /token`: dispatch on `grant_type`.
pub(crate) fn token(
    profile: &AuthzProfile,
    ctx: &PluginContext,
    headers: &HeaderMap,
    form: &TokenForm,
) -> Response {
    let grant = form.grant_type.parse::<GrantType>().ok();
    let correlation = explicit_correlation(headers, form.correlation_id.as_deref())
        .or_else(|| flow_of_grant(ctx, grant, form))
        .unwrap_or_else(new_correlation_id);

    let stage = profile.stage(&format!(
        "token.{}",
        grant.map_or("unsupported", GrantType::as_str)
    ));
    let step = ctx.events().step(&stage, &correlation);

    match exchange(profile, ctx, headers, form, grant, &correlation) {
        Ok((client_id, tokens)) => {
            step.success(json!({
                "client_id": client_id,
                "grant_type": form.grant_type,
                "tokens": tokens.summary(),
            }));
            json_no_store(&correlation, &tokens.to_response())
        }
        Err(err) => {
            warn!(
                plugin = profile.plugin,
                grant_type = %form.grant_type,
                correlation_id = %correlation,
                error = %err,
                "Token request rejected"
            );
            err.with_correlation(&correlation).record(step).into_response()
        }
    }
}

/// Correlation recorded with the code or refresh token being redeemed.
fn flow_of_grant(ctx: &PluginContext, grant: Option<GrantType>, form: &TokenForm) -> Option<String> {
    match grant? {
        GrantType::AuthorizationCode => ctx
            .idp()
            .find_authorization_code(form.code.as_deref()?)?
            .correlation_id,
        GrantType::RefreshToken => ctx
            .idp()
            .find_refresh_token(form.refresh_token.as_deref()?)?
            .correlation_id,
        GrantType::ClientCredentials => None,
    }
}

fn exchange(
    profile: &AuthzProfile,
    ctx: &PluginContext,
    headers: &HeaderMap,
    form: &TokenForm,
    grant: Option<GrantType>,
    correlation: &str,
) -> Result<(String, crate::tokens::IssuedTokenSet), ProtocolError> {
    let grant = grant
        .filter(|g| profile.grants.contains(g))
        .ok_or_else(|| {
            ProtocolError::new(OAuthErrorCode::UnsupportedGrantType, "Grant type not supported")
        })?;

    let client = authenticate_client(
        ctx,
        headers,
        form.client_id.as_deref(),
        form.client_secret.as_deref(),
    )?;
    if !client.allows_grant(grant) {
        return Err(ProtocolError::new(
            OAuthErrorCode::UnauthorizedClient,
            "Client not authorized for this grant type",
        ));
    }
    debug!(plugin = profile.plugin, client_id = %client.id, grant_type = %grant, "Client authenticated");

    let tokens = match grant {
        GrantType::AuthorizationCode => {
            let code = required(form.code.as_deref(), "code")?;
            let redirect_uri = form.redirect_uri.as_deref().unwrap_or_default();
            let redeemed = ctx.idp().validate_authorization_code(
                code,
                &client.id,
                redirect_uri,
                form.code_verifier.as_deref(),
            )?;
            ctx.tokens().issue_tokens(
                &redeemed.user_id,
                &client.id,
                &redeemed.scope,
                redeemed.nonce.as_deref(),
                Some(correlation),
            )?
        }
        GrantType::RefreshToken => {
            let token = required(form.refresh_token.as_deref(), "refresh_token")?;
            ctx.tokens()
                .refresh(token, &client.id, form.scope.as_deref())?
                .tokens
        }
        GrantType::ClientCredentials => ctx
            .tokens()
            .issue_client_credentials(&client, form.scope.as_deref().unwrap_or_default())?,
    };
    Ok((client.id, tokens))
}

/// Authenticate the calling client; public clients need no secret.
pub(crate) fn authenticate_client(
    ctx: &PluginContext,
    headers: &HeaderMap,
    form_id: Option<&str>,
    form_secret: Option<&str>,
) -> Result<Client, ProtocolError> {
    let creds = ClientCredentials::extract(headers, form_id, form_secret)
        .ok_or_else(|| ProtocolError::invalid_client("Client authentication required"))?;
    ctx.idp()
        .validate_client(&creds.client_id, creds.client_secret.as_deref())
        .map_err(ProtocolError::from)
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ProtocolError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProtocolError::invalid_request(format!("{name} is required")))
}
