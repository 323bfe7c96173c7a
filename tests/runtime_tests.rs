//! Runtime surface tests
//!
//! Covers:
//! - Health reporting across plugin states
//! - Plugin enable/disable and failure isolation
//! - Looking-glass correlation of a multi-request flow
//! - Config file loading

mod common;

use std::io::Write;

use axum::http::StatusCode;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use protocol_showcase::Showcase;
use protocol_showcase::config::{Config, PluginConfig};
use protocol_showcase::plugin::PluginState;

use common::{
    DEMO_APP, DEMO_REDIRECT, DEMO_SECRET, TestApp, basic, body_json, header_str, location,
    query_param,
};

fn plugin_settings(settings: Value) -> PluginConfig {
    PluginConfig {
        enabled: true,
        settings: settings.as_object().cloned().unwrap_or_default(),
    }
}

fn stages(events: &Value) -> Vec<String> {
    events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["stage"].as_str().unwrap().to_string())
        .collect()
}

/// Test health with every plugin ready
#[tokio::test]
async fn test_health_all_ready() {
    let app = TestApp::start().await;

    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    let plugins: Vec<_> = body["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| (p["plugin_id"].as_str().unwrap().to_string(), p["state"].clone()))
        .collect();
    assert_eq!(
        plugins,
        vec![
            ("oauth2".to_string(), json!("ready")),
            ("oidc".to_string(), json!("ready")),
            ("saml".to_string(), json!("ready")),
            ("spiffe".to_string(), json!("ready")),
        ]
    );
}

/// Test that one plugin's bad settings do not take the others down
#[tokio::test]
async fn test_plugin_init_failure_is_isolated() {
    // GIVEN: SPIFFE configured with an invalid trust domain
    let mut config = Config::default();
    config.plugins.insert(
        "spiffe".to_string(),
        plugin_settings(json!({ "trust_domain": "Not A Domain" })),
    );
    let showcase = Showcase::new(config).unwrap();

    // WHEN: plugins start
    let failures = showcase.start_plugins().await;

    // THEN: only SPIFFE failed
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "spiffe");
    let runtime = showcase.runtime();
    assert_eq!(runtime.get_state("spiffe"), PluginState::Error);
    assert_eq!(runtime.get_state("oauth2"), PluginState::Ready);

    let app = showcase.router();
    let response = tower::ServiceExt::oneshot(
        app.clone(),
        axum::http::Request::get("/health")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();

    // AND: health is degraded with the error reported
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    let spiffe = body["plugins"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["plugin_id"] == "spiffe")
        .unwrap()
        .clone();
    assert_eq!(spiffe["healthy"], false);
    assert!(spiffe["error"].as_str().unwrap().contains("trust domain"));

    // AND: the failed plugin answers 503 while the others serve
    let response = tower::ServiceExt::oneshot(
        app.clone(),
        axum::http::Request::get("/spiffe/bundle")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "temporarily_unavailable");

    let response = tower::ServiceExt::oneshot(
        app,
        axum::http::Request::get("/oidc/jwks")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // AND: the runtime published the failure on the looking glass
    let events = runtime.services().bus.events(Some("runtime"), 20);
    assert!(
        events
            .iter()
            .any(|e| e.stage == "plugin_error" && e.payload["plugin"] == "spiffe")
    );
}

/// Test that disabled plugins are neither registered nor routed
#[tokio::test]
async fn test_disabled_plugin_is_not_mounted() {
    let mut config = Config::default();
    config.plugins.insert(
        "saml".to_string(),
        PluginConfig {
            enabled: false,
            ..PluginConfig::default()
        },
    );
    let app = TestApp::with_config(config).await;

    assert_eq!(app.get("/saml/metadata").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.get("/health").await.status(), StatusCode::OK);
    assert_eq!(app.showcase.runtime().plugins().len(), 3);
}

/// Test plugin shutdown through the runtime
#[tokio::test]
async fn test_shutdown_all_stops_plugins() {
    let app = TestApp::start().await;
    let runtime = app.showcase.runtime();

    let failures = runtime.shutdown_all().await;

    assert!(failures.is_empty());
    for check in runtime.health_checks() {
        assert_eq!(check.state, PluginState::Stopped);
    }
    let response = app.get("/oauth2/demo/users").await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.get("/oidc/jwks").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

/// Test that one correlation id follows a flow across redirects and requests
#[tokio::test]
async fn test_flow_events_are_correlated() {
    // GIVEN: an authorize request carrying an explicit correlation id
    let app = TestApp::start().await;
    let correlation = "flow-under-test";
    let response = app
        .send(
            axum::http::Request::get(format!(
                "/oauth2/authorize?response_type=code&client_id={DEMO_APP}&redirect_uri={DEMO_REDIRECT}&scope=profile"
            ))
            .header("x-correlation-id", correlation)
            .body(axum::body::Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(header_str(&response, "x-correlation-id"), Some(correlation));

    // WHEN: the login form posts back the hidden correlation field
    let response = app
        .post_form(
            "/oauth2/authorize",
            &[
                ("email", "alice@example.com"),
                ("password", "password123"),
                ("client_id", DEMO_APP),
                ("redirect_uri", DEMO_REDIRECT),
                ("scope", "profile"),
                ("correlation_id", correlation),
            ],
        )
        .await;
    let code = query_param(&location(&response), "code").unwrap();

    // AND: the client redeems the code without any correlation header
    let response = app
        .post_form_with(
            "/oauth2/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", DEMO_REDIRECT),
            ],
            &[("authorization", basic(DEMO_APP, DEMO_SECRET).as_str())],
        )
        .await;
    assert_eq!(header_str(&response, "x-correlation-id"), Some(correlation));

    // THEN: the session history holds the whole flow in order
    let events = body_json(
        app.get(&format!("/lookingglass/sessions/{correlation}/events"))
            .await,
    )
    .await;
    assert_eq!(
        stages(&events),
        vec![
            "oauth2.authorize.request",
            "oauth2.authorize.login",
            "oauth2.token.authorization_code",
        ]
    );
    for event in events.as_array().unwrap() {
        assert_eq!(event["outcome"], "success");
        assert_eq!(event["source"], "oauth2");
        assert!(event["duration_ms"].is_u64());
    }

    // AND: token values never reach the event payloads
    let text = events.to_string();
    assert!(!text.contains(&code));

    // AND: the session is listed
    let sessions = body_json(app.get("/lookingglass/sessions").await).await;
    assert!(
        sessions
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s["correlation_id"] == correlation)
    );
}

/// Test that failed steps are published as errors
#[tokio::test]
async fn test_failed_step_is_published() {
    let app = TestApp::start().await;

    let response = app
        .post_form_with(
            "/oauth2/token",
            &[("grant_type", "authorization_code"), ("code", "bogus")],
            &[
                ("authorization", basic(DEMO_APP, DEMO_SECRET).as_str()),
                ("x-correlation-id", "flow-bad-code"),
            ],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let events = body_json(app.get("/lookingglass/sessions/flow-bad-code/events").await).await;
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["outcome"], "error");
    assert_eq!(events[0]["payload"]["error"], "invalid_grant");
}

/// Test that the stream endpoints answer with an event stream
#[tokio::test]
async fn test_stream_endpoints_are_sse() {
    let app = TestApp::start().await;

    for uri in [
        "/lookingglass/stream",
        "/lookingglass/sessions/flow-x/stream?replay=5",
    ] {
        let response = app.get(uri).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            header_str(&response, "content-type")
                .is_some_and(|v| v.starts_with("text/event-stream"))
        );
    }
}

/// Test loading configuration from a YAML file
#[tokio::test]
async fn test_config_file_drives_plugins() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
idp:
  issuer: "https://idp.test"
  access_token_ttl: "5m"
plugins:
  spiffe:
    settings:
      trust_domain: "prod.example"
      svid_ttl: "90s"
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.idp.issuer, "https://idp.test");
    assert!(config.plugin("spiffe").enabled);

    let app = TestApp::with_config(config).await;
    let bundle = body_json(app.get("/spiffe/bundle").await).await;
    assert_eq!(bundle["trust_domain"], "prod.example");
    assert_eq!(bundle["spiffe_refresh_hint"], 90);

    let discovery = body_json(app.get("/oidc/.well-known/openid-configuration").await).await;
    assert_eq!(discovery["token_endpoint"], "https://idp.test/oidc/token");
}
