//! Shared harness: an in-process showcase driven through `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tower::ServiceExt;

use protocol_showcase::Showcase;
use protocol_showcase::config::Config;

pub const DEMO_APP: &str = "demo-app";
pub const DEMO_SECRET: &str = "demo-secret";
pub const DEMO_REDIRECT: &str = "http://localhost:3000/callback";
pub const PUBLIC_APP: &str = "public-app";
pub const PUBLIC_REDIRECT: &str = "http://localhost:3000/callback/spa";
pub const MACHINE_CLIENT: &str = "machine-client";
pub const MACHINE_SECRET: &str = "machine-secret";

/// A started showcase plus its router.
pub struct TestApp {
    pub showcase: Showcase,
    pub router: Router,
}

impl TestApp {
    /// Showcase with default configuration and every plugin initialized.
    pub async fn start() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let showcase = Showcase::new(config).unwrap();
        let failures = showcase.start_plugins().await;
        assert!(failures.is_empty(), "plugin init failed: {failures:?}");
        let router = showcase.router();
        Self { showcase, router }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post_form(&self, uri: &str, form: &[(&str, &str)]) -> Response<Body> {
        self.post_form_with(uri, form, &[]).await
    }

    pub async fn post_form_with(
        &self,
        uri: &str,
        form: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        let mut builder = Request::post(uri).header(
            header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        );
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = serde_urlencoded::to_string(form).unwrap();
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    /// Submit the login form at `/{plugin}/authorize` and return the issued code.
    pub async fn login_for_code(&self, plugin: &str, params: &[(&str, &str)]) -> String {
        let response = self
            .post_form(&format!("/{plugin}/authorize"), params)
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = location(&response);
        query_param(&location, "code").expect("redirect carries a code")
    }
}

pub fn basic(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn header_str<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

pub fn location(response: &Response<Body>) -> String {
    header_str(response, "location").unwrap().to_string()
}

pub fn query_param(uri: &str, name: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
