//! Engine-wide fan-out of [`PlatformEvent`]s over a `tokio::sync::broadcast`
//! channel. Share it as `Arc<EventBus>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Ring size of the broadcast channel. A receiver that falls further behind
/// gets `RecvError::Lagged` and skips ahead.
const DEFAULT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// PlatformEvent
// ---------------------------------------------------------------------------

/// One engine occurrence: a job, node, group or backend changed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// Name from `canvasflow_core::job_events`, e.g. `"node_completed"`.
    pub event_type: String,
    /// `"job"`, `"job_group"` or `"backend"`.
    pub source_entity_type: Option<String>,
    pub source_entity_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl PlatformEvent {
    /// Event with an empty object payload and no source.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_entity_type: None,
            source_entity_id: None,
            payload: Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        self.source_entity_type = Some(entity_type.into());
        self.source_entity_id = Some(entity_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// True when the event is about `entity_type` with id `entity_id`.
    pub fn is_about(&self, entity_type: &str, entity_id: &str) -> bool {
        self.source_entity_type.as_deref() == Some(entity_type)
            && self.source_entity_id.as_deref() == Some(entity_id)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Every subscriber sees every event published after it subscribed.
///
/// ```rust
/// use canvasflow_events::{EventBus, PlatformEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
/// assert_eq!(bus.publish(PlatformEvent::new("job_started")), 1);
/// assert_eq!(rx.try_recv().unwrap().event_type, "job_started");
/// ```
pub struct EventBus {
    tx: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    /// Returns how many subscribers the event was queued for; zero when
    /// nobody listens, which is not an error.
    pub fn publish(&self, event: PlatformEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
