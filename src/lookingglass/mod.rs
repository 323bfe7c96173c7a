//! Looking-glass: correlated flow events and their live fan-out.
//!
//! Protocol handlers append [`FlowEvent`]s through an [`EventPublisher`].
//! The [`EventBus`] keeps a bounded history (oldest evicted first) and
//! fans each event out over `tokio::sync::broadcast` channels: one global
//! feed plus one channel per correlation id that has live subscribers.
//!
//! Publishing never waits on subscribers. A subscriber that falls more
//! than `channel_capacity` events behind is told how many it missed
//! ([`Delivery::Lagged`]) instead of buffering without bound.
//!
//! Late subscribers see nothing historical unless they ask for a bounded
//! replay; replay and live delivery are stitched under the history lock
//! so no event is duplicated or lost between the two.

mod stream;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use showcase_wire::StreamMessage;
use tokio::sync::broadcast;
use tracing::trace;

pub use stream::routes;

use crate::config::LookingGlassConfig;

/// Correlation id used by the runtime's own lifecycle events.
pub const RUNTIME_CORRELATION: &str = "runtime";

/// Result of one flow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Started, result not yet known
    Pending,
    /// Completed successfully
    Success,
    /// Failed
    Error,
}

/// One observable step of a protocol execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Bus-wide sequence number
    pub id: u64,
    /// Stage identifier, e.g. `oauth2.token.issued`
    pub stage: String,
    /// Flow the event belongs to
    pub correlation_id: String,
    /// Emitting plugin or `runtime`
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl FlowEvent {
    /// Shape sent on the live stream.
    #[must_use]
    pub fn to_stream_message(&self) -> StreamMessage {
        StreamMessage {
            kind: self.stage.clone(),
            success: self.outcome != Outcome::Error,
            data: Some(json!({
                "id": self.id,
                "correlation_id": self.correlation_id,
                "source": self.source,
                "timestamp": self.timestamp,
                "outcome": self.outcome,
                "payload": self.payload,
            })),
            duration: self.duration_ms,
        }
    }
}

/// What a [`Subscription`] yields.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Next event, in emission order
    Event(FlowEvent),
    /// This many events were dropped because the subscriber fell behind
    Lagged(u64),
}

type SessionChannels = Arc<DashMap<String, broadcast::Sender<FlowEvent>>>;

/// Replay followed by live events.
pub struct Subscription {
    replay: VecDeque<FlowEvent>,
    rx: broadcast::Receiver<FlowEvent>,
    // Declared after `rx` so the receiver is gone before the guard runs
    _session: Option<SessionGuard>,
}

/// Drops a correlation's channel once its last subscriber goes away.
struct SessionGuard {
    sessions: SessionChannels,
    correlation_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .remove_if(&self.correlation_id, |_, tx| tx.receiver_count() == 0);
    }
}

impl Subscription {
    /// Next delivery; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if let Some(event) = self.replay.pop_front() {
            return Some(Delivery::Event(event));
        }
        match self.rx.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Replayed events not yet consumed.
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }
}

/// Per-correlation summary of retained history.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub correlation_id: String,
    pub events: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub errors: usize,
}

/// Bounded, correlated event history with live fan-out.
pub struct EventBus {
    history: RwLock<VecDeque<FlowEvent>>,
    global: broadcast::Sender<FlowEvent>,
    sessions: SessionChannels,
    next_id: AtomicU64,
    retention: usize,
    capacity: usize,
    max_replay: usize,
    keep_alive: Duration,
}

impl EventBus {
    /// Bus sized by the `looking_glass` config section.
    #[must_use]
    pub fn new(config: &LookingGlassConfig) -> Self {
        let capacity = config.channel_capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            history: RwLock::new(VecDeque::with_capacity(config.retention.min(4096))),
            global,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            retention: config.retention.max(1),
            capacity,
            max_replay: config.max_replay,
            keep_alive: config.keep_alive_interval,
        }
    }

    /// SSE keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive
    }

    /// Append an event and fan it out.
    pub fn publish(
        &self,
        stage: &str,
        correlation_id: &str,
        source: &str,
        outcome: Outcome,
        payload: Value,
        duration: Option<Duration>,
    ) -> FlowEvent {
        let mut history = self.history.write();

        let event = FlowEvent {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stage: stage.to_string(),
            correlation_id: correlation_id.to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            outcome,
            payload,
            duration_ms: duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        };

        history.push_back(event.clone());
        while history.len() > self.retention {
            history.pop_front();
        }

        // No receivers is not an error
        let _ = self.global.send(event.clone());

        let mut orphaned = false;
        if let Some(tx) = self.sessions.get(correlation_id) {
            orphaned = tx.send(event.clone()).is_err();
        }
        if orphaned {
            self.sessions
                .remove_if(correlation_id, |_, tx| tx.receiver_count() == 0);
        }
        drop(history);

        trace!(
            stage = %event.stage,
            correlation_id = %event.correlation_id,
            outcome = ?event.outcome,
            "Flow event published"
        );
        event
    }

    /// Subscribe to one correlation id, or to every event when `None`.
    ///
    /// `replay` most-recent retained events are delivered first, capped at
    /// `max_replay`.
    pub fn subscribe(&self, correlation_id: Option<&str>, replay: usize) -> Subscription {
        let history = self.history.read();

        let (rx, session) = match correlation_id {
            None => (self.global.subscribe(), None),
            Some(id) => {
                let rx = self
                    .sessions
                    .entry(id.to_string())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe();
                let guard = SessionGuard {
                    sessions: Arc::clone(&self.sessions),
                    correlation_id: id.to_string(),
                };
                (rx, Some(guard))
            }
        };

        let replay = Self::recent(&history, correlation_id, replay.min(self.max_replay));
        drop(history);

        Subscription {
            replay: replay.into(),
            rx,
            _session: session,
        }
    }

    /// Up to `limit` most-recent retained events, oldest first.
    pub fn events(&self, correlation_id: Option<&str>, limit: usize) -> Vec<FlowEvent> {
        Self::recent(&self.history.read(), correlation_id, limit)
    }

    /// Correlation ids present in retained history, most recently active first.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        let history = self.history.read();
        let mut by_id: HashMap<&str, SessionSummary> = HashMap::new();
        for event in history.iter() {
            let entry = by_id
                .entry(event.correlation_id.as_str())
                .or_insert_with(|| SessionSummary {
                    correlation_id: event.correlation_id.clone(),
                    events: 0,
                    first_seen: event.timestamp,
                    last_seen: event.timestamp,
                    errors: 0,
                });
            entry.events += 1;
            entry.last_seen = event.timestamp;
            if event.outcome == Outcome::Error {
                entry.errors += 1;
            }
        }
        let mut sessions: Vec<SessionSummary> = by_id.into_values().collect();
        sessions.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        sessions
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }

    fn recent(
        history: &VecDeque<FlowEvent>,
        correlation_id: Option<&str>,
        limit: usize,
    ) -> Vec<FlowEvent> {
        if limit == 0 {
            return Vec::new();
        }
        let mut picked: Vec<FlowEvent> = history
            .iter()
            .rev()
            .filter(|e| correlation_id.is_none_or(|id| e.correlation_id == id))
            .take(limit)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }
}

/// Scoped publishing handle given to one event source.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<EventBus>,
    source: String,
}

impl EventPublisher {
    /// Publisher that stamps `source` on every event.
    pub fn new(bus: Arc<EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    /// Append one event.
    pub fn publish(
        &self,
        stage: &str,
        correlation_id: &str,
        outcome: Outcome,
        payload: Value,
        duration: Option<Duration>,
    ) -> FlowEvent {
        self.bus
            .publish(stage, correlation_id, &self.source, outcome, payload, duration)
    }

    /// Start timing a step; the duration is attached when it completes.
    pub fn step(&self, stage: &str, correlation_id: &str) -> StepTimer {
        StepTimer {
            publisher: self.clone(),
            stage: stage.to_string(),
            correlation_id: correlation_id.to_string(),
            started: Instant::now(),
        }
    }
}

/// A running step started by [`EventPublisher::step`].
pub struct StepTimer {
    publisher: EventPublisher,
    stage: String,
    correlation_id: String,
    started: Instant,
}

impl StepTimer {
    /// Publish the step as pending without finishing it.
    pub fn pending(&self, payload: Value) {
        self.publisher
            .publish(&self.stage, &self.correlation_id, Outcome::Pending, payload, None);
    }

    /// Finish the step successfully.
    pub fn success(self, payload: Value) -> FlowEvent {
        self.finish(Outcome::Success, payload)
    }

    /// Finish the step as failed.
    pub fn error(self, payload: Value) -> FlowEvent {
        self.finish(Outcome::Error, payload)
    }

    fn finish(self, outcome: Outcome, payload: Value) -> FlowEvent {
        self.publisher.publish(
            &self.stage,
            &self.correlation_id,
            outcome,
            payload,
            Some(self.started.elapsed()),
        )
    }
}
