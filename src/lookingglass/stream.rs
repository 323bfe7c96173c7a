//! HTTP surface of the looking-glass: SSE streams and JSON history.

use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{Delivery, EventBus, FlowEvent, SessionSummary, Subscription};

const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
struct StreamParams {
    #[serde(default)]
    replay: usize,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

/// Looking-glass routes, mounted under `/lookingglass`.
pub fn routes(bus: Arc<EventBus>) -> Router {
    Router::new()
        .route("/lookingglass/stream", get(global_stream))
        .route("/lookingglass/events", get(global_events))
        .route("/lookingglass/sessions", get(list_sessions))
        .route("/lookingglass/sessions/{id}/stream", get(session_stream))
        .route("/lookingglass/sessions/{id}/events", get(session_events))
        .with_state(bus)
}

async fn global_stream(
    State(bus): State<Arc<EventBus>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(replay = params.replay, "Global looking-glass subscriber connected");
    let subscription = bus.subscribe(None, params.replay);
    create_sse_response(subscription, None, &bus)
}

async fn session_stream(
    State(bus): State<Arc<EventBus>>,
    Path(id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    debug!(correlation_id = %id, replay = params.replay, "Session subscriber connected");
    let subscription = bus.subscribe(Some(&id), params.replay);
    create_sse_response(subscription, Some(id), &bus)
}

async fn global_events(
    State(bus): State<Arc<EventBus>>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<FlowEvent>> {
    Json(bus.events(None, params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
}

async fn session_events(
    State(bus): State<Arc<EventBus>>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<FlowEvent>> {
    Json(bus.events(Some(&id), params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
}

async fn list_sessions(State(bus): State<Arc<EventBus>>) -> Json<Vec<SessionSummary>> {
    Json(bus.sessions())
}

/// SSE response over a subscription.
///
/// Takes owned data to satisfy Rust 2024 lifetime capture rules for `impl Stream`.
fn create_sse_response(
    mut subscription: Subscription,
    correlation_id: Option<String>,
    bus: &EventBus,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let stream = stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(json!({ "correlation_id": correlation_id }).to_string()));

        while let Some(delivery) = subscription.recv().await {
            match delivery {
                Delivery::Event(event) => {
                    let message = event.to_stream_message();
                    yield Ok(Event::default()
                        .id(event.id.to_string())
                        .data(serde_json::to_string(&message).unwrap_or_default()));
                }
                Delivery::Lagged(n) => {
                    // Client fell behind, notify them
                    yield Ok(Event::default()
                        .event("lagged")
                        .data(json!({ "missed": n }).to_string()));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(bus.keep_alive_interval())
            .text("ping"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LookingGlassConfig;
    use crate::lookingglass::Outcome;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(&LookingGlassConfig::default()))
    }

    #[tokio::test]
    async fn session_history_is_filtered() {
        let bus = bus();
        bus.publish("a", "flow-1", "t", Outcome::Success, json!({}), None);
        bus.publish("b", "flow-2", "t", Outcome::Success, json!({}), None);

        let response = routes(Arc::clone(&bus))
            .oneshot(
                Request::get("/lookingglass/sessions/flow-1/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events: Vec<FlowEvent> = serde_json::from_slice(&body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, "a");
    }

    #[tokio::test]
    async fn history_limit_applies() {
        let bus = bus();
        for i in 0..5 {
            bus.publish(&format!("s{i}"), "f", "t", Outcome::Success, json!({}), None);
        }
        let response = routes(Arc::clone(&bus))
            .oneshot(
                Request::get("/lookingglass/events?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let events: Vec<FlowEvent> = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            events.iter().map(|e| e.stage.as_str()).collect::<Vec<_>>(),
            vec!["s3", "s4"]
        );
    }

    #[tokio::test]
    async fn stream_endpoint_is_event_stream() {
        let response = routes(bus())
            .oneshot(
                Request::get("/lookingglass/sessions/flow-1/stream?replay=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/event-stream"
        );
    }
}
