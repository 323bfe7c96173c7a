//! End-to-end OAuth 2.0 flow tests
//!
//! Drives the assembled router through:
//! - Authorization code grant (confidential and PKCE public clients)
//! - Client credentials grant
//! - Refresh token rotation
//! - Introspection and revocation

mod common;

use axum::http::StatusCode;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use protocol_showcase::idp::generate_pkce;
use showcase_wire::TokenResponse;

use common::{
    DEMO_APP, DEMO_REDIRECT, DEMO_SECRET, MACHINE_CLIENT, MACHINE_SECRET, PUBLIC_APP,
    PUBLIC_REDIRECT, TestApp, basic, body_json, body_text, header_str, location, query_param,
};

async fn demo_code(app: &TestApp, scope: &str) -> String {
    app.login_for_code(
        "oauth2",
        &[
            ("email", "alice@example.com"),
            ("password", "password123"),
            ("client_id", DEMO_APP),
            ("redirect_uri", DEMO_REDIRECT),
            ("scope", scope),
            ("state", "xyz"),
        ],
    )
    .await
}

async fn redeem_demo_code(app: &TestApp, code: &str) -> axum::http::Response<axum::body::Body> {
    app.post_form_with(
        "/oauth2/token",
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", DEMO_REDIRECT),
        ],
        &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
    )
    .await
}

/// Test the confidential-client authorization code flow end to end
#[tokio::test]
async fn test_authorization_code_flow_confidential_client() {
    // GIVEN: a started showcase
    let app = TestApp::start().await;

    // WHEN: the authorize page is requested
    let page = app
        .get(&format!(
            "/oauth2/authorize?response_type=code&client_id={DEMO_APP}&redirect_uri={DEMO_REDIRECT}&scope=profile%20email&state=xyz"
        ))
        .await;

    // THEN: the login form is rendered with the request carried through
    assert_eq!(page.status(), StatusCode::OK);
    assert!(header_str(&page, "x-correlation-id").is_some());
    let html = body_text(page).await;
    assert!(html.contains(r#"name="client_id" value="demo-app""#));
    assert!(html.contains(r#"name="correlation_id" value="flow-"#));

    // WHEN: alice logs in
    let response = app
        .post_form(
            "/oauth2/authorize",
            &[
                ("email", "alice@example.com"),
                ("password", "password123"),
                ("client_id", DEMO_APP),
                ("redirect_uri", DEMO_REDIRECT),
                ("scope", "profile email"),
                ("state", "xyz"),
            ],
        )
        .await;

    // THEN: the browser is sent back with a code and the original state
    assert_eq!(response.status(), StatusCode::FOUND);
    let redirect = location(&response);
    assert!(redirect.starts_with(DEMO_REDIRECT));
    assert_eq!(query_param(&redirect, "state").as_deref(), Some("xyz"));
    let code = query_param(&redirect, "code").unwrap();

    // WHEN: the code is redeemed with client_secret_basic
    let response = redeem_demo_code(&app, &code).await;

    // THEN: access and refresh tokens come back, uncached, without an ID token
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "cache-control"), Some("no-store"));
    assert_eq!(header_str(&response, "pragma"), Some("no-cache"));
    let tokens: TokenResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(tokens.token_type, "Bearer");
    assert_eq!(tokens.scope, "profile email");
    assert!(tokens.refresh_token.is_some());
    assert!(tokens.id_token.is_none());
}

/// Test the PKCE flow for a public client
#[tokio::test]
async fn test_pkce_public_client_flow() {
    // GIVEN: a PKCE pair and a code bound to its challenge
    let app = TestApp::start().await;
    let pkce = generate_pkce();
    let code = app
        .login_for_code(
            "oauth2",
            &[
                ("email", "bob@example.com"),
                ("password", "password123"),
                ("client_id", PUBLIC_APP),
                ("redirect_uri", PUBLIC_REDIRECT),
                ("scope", "openid profile"),
                ("code_challenge", pkce.code_challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .await;

    // WHEN: the code is redeemed with the wrong verifier
    let wrong = app
        .post_form(
            "/oauth2/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", PUBLIC_REDIRECT),
                ("client_id", PUBLIC_APP),
                ("code_verifier", "not-the-verifier-not-the-verifier-not-the-verifier"),
            ],
        )
        .await;

    // THEN: the grant is rejected
    assert_eq!(wrong.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(wrong).await["error"], "invalid_grant");

    // WHEN: the right verifier is presented
    let response = app
        .post_form(
            "/oauth2/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", PUBLIC_REDIRECT),
                ("client_id", PUBLIC_APP),
                ("code_verifier", pkce.code_verifier.as_str()),
            ],
        )
        .await;

    // THEN: the failed attempt did not burn the code, and openid yields an ID token
    assert_eq!(response.status(), StatusCode::OK);
    let tokens: TokenResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert!(tokens.id_token.is_some());
}

/// Test that an authorization code can only be redeemed once
#[tokio::test]
async fn test_authorization_code_double_redemption() {
    // GIVEN: a code that has been redeemed
    let app = TestApp::start().await;
    let code = demo_code(&app, "openid profile").await;
    assert_eq!(redeem_demo_code(&app, &code).await.status(), StatusCode::OK);

    // WHEN: it is redeemed again
    let replay = redeem_demo_code(&app, &code).await;

    // THEN: invalid_grant
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let body = body_json(replay).await;
    assert_eq!(body["error"], "invalid_grant");
}

/// Test that concurrent redemptions of one code have exactly one winner
#[tokio::test]
async fn test_concurrent_code_redemption_single_winner() {
    // GIVEN: one fresh code
    let app = TestApp::start().await;
    let code = demo_code(&app, "profile").await;

    // WHEN: eight redemptions race
    let responses = join_all((0..8).map(|_| redeem_demo_code(&app, &code))).await;

    // THEN: exactly one succeeds
    let winners = responses
        .iter()
        .filter(|r| r.status() == StatusCode::OK)
        .count();
    assert_eq!(winners, 1);
}

/// Test a redirect URI mismatch at the token endpoint
#[tokio::test]
async fn test_code_redirect_uri_mismatch() {
    let app = TestApp::start().await;
    let code = demo_code(&app, "profile").await;

    let response = app
        .post_form_with(
            "/oauth2/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", "http://localhost:3000/other"),
            ],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_grant");

    // The mismatch did not consume the code
    assert_eq!(redeem_demo_code(&app, &code).await.status(), StatusCode::OK);
}

/// Test the machine-to-machine client credentials grant
#[tokio::test]
async fn test_client_credentials_grant() {
    // GIVEN: the machine client
    let app = TestApp::start().await;

    // WHEN: it asks for a token without a scope
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "client_credentials")],
            &[("authorization", basic(MACHINE_CLIENT, MACHINE_SECRET).as_str())],
        )
        .await;

    // THEN: it gets every allowed scope and no refresh token
    assert_eq!(response.status(), StatusCode::OK);
    let tokens: TokenResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(tokens.scope, "api:read api:write");
    assert!(tokens.refresh_token.is_none());
    assert!(tokens.id_token.is_none());

    // WHEN: it asks for a scope it does not hold
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "client_credentials"), ("scope", "api:admin")],
            &[("authorization", basic(MACHINE_CLIENT, MACHINE_SECRET).as_str())],
        )
        .await;

    // THEN: invalid_scope
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_scope");
}

/// Test client authentication failures
#[tokio::test]
async fn test_wrong_client_secret_is_invalid_client() {
    let app = TestApp::start().await;

    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "client_credentials")],
            &[("authorization", basic(MACHINE_CLIENT, "wrong").as_str())],
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(
        header_str(&response, "www-authenticate")
            .is_some_and(|v| v.starts_with("Basic"))
    );
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

/// Test grant type gating
#[tokio::test]
async fn test_grant_type_checks() {
    let app = TestApp::start().await;

    // Unknown grant
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "password")],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;
    assert_eq!(body_json(response).await["error"], "unsupported_grant_type");

    // demo-app is not a machine client
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "client_credentials")],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "unauthorized_client");
}

/// Test that unreadable request bodies answer with a protocol error
#[tokio::test]
async fn test_malformed_requests_are_invalid_request() {
    let app = TestApp::start().await;

    // GIVEN: a token request with no Content-Type
    let response = app
        .send(
            axum::http::Request::post("/oauth2/token")
                .header("authorization", basic(MACHINE_CLIENT, MACHINE_SECRET))
                .body(axum::body::Body::from("grant_type=client_credentials"))
                .unwrap(),
        )
        .await;

    // THEN: a JSON invalid_request, not a bare-text rejection
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(
        header_str(&response, "content-type").is_some_and(|v| v.starts_with("application/json"))
    );
    assert_eq!(header_str(&response, "cache-control"), Some("no-store"));
    assert_eq!(body_json(response).await["error"], "invalid_request");

    // AND: a body that does not deserialize is treated the same way
    let response = app
        .send(
            axum::http::Request::post("/oauth2/revoke")
                .header("content-type", "application/x-www-form-urlencoded")
                .header("authorization", basic(DEMO_APP, DEMO_SECRET))
                .body(axum::body::Body::from(
                    "token=a&token_type_hint=access_token&token_type_hint=refresh_token",
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_request");

    // AND: the other plugins' form endpoints follow suit
    for uri in ["/oidc/token", "/saml/validate", "/spiffe/svid"] {
        let response = app
            .send(
                axum::http::Request::post(uri)
                    .body(axum::body::Body::from("x=1"))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body_json(response).await["error"], "invalid_request", "{uri}");
    }
}

/// Test refresh token rotation
#[tokio::test]
async fn test_refresh_token_rotation() {
    // GIVEN: a token set from the code flow
    let app = TestApp::start().await;
    let code = demo_code(&app, "openid profile email").await;
    let tokens: TokenResponse =
        serde_json::from_value(body_json(redeem_demo_code(&app, &code).await).await).unwrap();
    let original = tokens.refresh_token.unwrap();

    // WHEN: the refresh token is used with a narrower scope
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", original.as_str()),
                ("scope", "openid profile"),
            ],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;

    // THEN: a new pair is issued with the narrowed scope
    assert_eq!(response.status(), StatusCode::OK);
    let rotated: TokenResponse = serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(rotated.scope, "openid profile");
    let replacement = rotated.refresh_token.unwrap();
    assert!(replacement != original);

    // WHEN: the old refresh token is replayed
    let replay = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "refresh_token"), ("refresh_token", original.as_str())],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;

    // THEN: it is dead
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(replay).await["error"], "invalid_grant");

    // AND: widening the scope beyond the grant fails without burning the replacement
    let widened = app
        .post_form_with(
            "/oauth2/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", replacement.as_str()),
                ("scope", "openid profile email"),
            ],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;
    assert_eq!(body_json(widened).await["error"], "invalid_scope");
}

/// Test that concurrent refreshes of one token have exactly one winner
#[tokio::test]
async fn test_concurrent_refresh_single_winner() {
    let app = TestApp::start().await;
    let code = demo_code(&app, "profile").await;
    let tokens: TokenResponse =
        serde_json::from_value(body_json(redeem_demo_code(&app, &code).await).await).unwrap();
    let refresh = tokens.refresh_token.unwrap();
    let auth = basic(DEMO_APP, DEMO_SECRET);
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh.as_str()),
    ];
    let headers = [("authorization", auth.as_str())];

    let responses = join_all(
        (0..6).map(|_| app.post_form_with("/oauth2/token", &form, &headers)),
    )
    .await;

    let winners = responses
        .iter()
        .filter(|r| r.status() == StatusCode::OK)
        .count();
    assert_eq!(winners, 1);
}

/// Test introspection before and after revocation
#[tokio::test]
async fn test_introspect_revoked_access_token() {
    // GIVEN: a live access token
    let app = TestApp::start().await;
    let code = demo_code(&app, "profile").await;
    let tokens: TokenResponse =
        serde_json::from_value(body_json(redeem_demo_code(&app, &code).await).await).unwrap();
    let auth = basic(DEMO_APP, DEMO_SECRET);

    // WHEN: it is introspected
    let response = app
        .post_form_with(
            "/oauth2/introspect",
            &[("token", tokens.access_token.as_str())],
            &[("authorization", auth.as_str())],
        )
        .await;

    // THEN: it is active and describes alice
    let body = body_json(response).await;
    assert_eq!(body["active"], true);
    assert_eq!(body["sub"], "alice");
    assert_eq!(body["token_type"], "access_token");
    assert_eq!(body["client_id"], DEMO_APP);

    // WHEN: it is revoked
    let response = app
        .post_form_with(
            "/oauth2/revoke",
            &[
                ("token", tokens.access_token.as_str()),
                ("token_type_hint", "access_token"),
            ],
            &[("authorization", auth.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // THEN: introspection reports it inactive and nothing else
    let response = app
        .post_form_with(
            "/oauth2/introspect",
            &[("token", tokens.access_token.as_str())],
            &[("authorization", auth.as_str())],
        )
        .await;
    assert_eq!(
        body_json(response).await,
        serde_json::json!({ "active": false })
    );
}

/// Test that introspection requires client authentication
#[tokio::test]
async fn test_introspect_requires_client_auth() {
    let app = TestApp::start().await;

    let response = app
        .post_form("/oauth2/introspect", &[("token", "anything")])
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "invalid_client");
}

/// Test revocation of a refresh token and of unknown tokens
#[tokio::test]
async fn test_revoke_refresh_token_and_unknown_token() {
    let app = TestApp::start().await;
    let code = demo_code(&app, "profile").await;
    let tokens: TokenResponse =
        serde_json::from_value(body_json(redeem_demo_code(&app, &code).await).await).unwrap();
    let refresh = tokens.refresh_token.unwrap();
    let auth = basic(DEMO_APP, DEMO_SECRET);

    // Unknown tokens still answer 200
    let response = app
        .post_form_with("/oauth2/revoke", &[("token", "garbage")], &[("authorization", auth.as_str())])
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Revoked refresh tokens can no longer be used
    let response = app
        .post_form_with("/oauth2/revoke", &[("token", refresh.as_str())], &[("authorization", auth.as_str())])
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "refresh_token"), ("refresh_token", refresh.as_str())],
            &[("authorization", auth.as_str())],
        )
        .await;
    assert_eq!(body_json(response).await["error"], "invalid_grant");
}

/// Test authorize request validation
#[tokio::test]
async fn test_authorize_rejects_unregistered_redirect() {
    let app = TestApp::start().await;

    let response = app
        .get("/oauth2/authorize?response_type=code&client_id=demo-app&redirect_uri=http://evil.example/cb&state=s1")
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["state"], "s1");
}

/// Test the login-failure re-render
#[tokio::test]
async fn test_login_failure_rerenders_form() {
    let app = TestApp::start().await;

    let response = app
        .post_form(
            "/oauth2/authorize",
            &[
                ("email", "alice@example.com"),
                ("password", "wrong"),
                ("client_id", DEMO_APP),
                ("redirect_uri", DEMO_REDIRECT),
                ("scope", "profile"),
                ("state", "keep-me"),
            ],
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let html = body_text(response).await;
    assert!(html.contains("Invalid email or password"));
    assert!(html.contains(r#"name="state" value="keep-me""#));
}

/// Test the read-only demo preset endpoints
#[tokio::test]
async fn test_demo_presets() {
    let app = TestApp::start().await;

    let users = body_json(app.get("/oauth2/demo/users").await).await;
    let emails: Vec<_> = users["users"]
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["credentials"]["email"].as_str().unwrap().to_string())
        .collect();
    assert!(emails.contains(&"alice@example.com".to_string()));

    let clients = body_json(app.get("/oauth2/demo/clients").await).await;
    assert_eq!(clients["clients"].as_array().unwrap().len(), 3);
}
