//! Scoped event sinks with explicit register/unregister.
//!
//! A sink receives only the events dispatched for its scope (typically a
//! job-group id). Senders whose receiver has gone away are pruned on the
//! next dispatch.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::bus::PlatformEvent;

/// Buffer per sink. A full sink drops the event rather than stall the
/// dispatcher.
const SINK_CAPACITY: usize = 256;

/// Identifies one registered sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(Uuid);

/// Registry of per-scope event sinks.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: RwLock<HashMap<String, Vec<(SinkId, mpsc::Sender<PlatformEvent>)>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `scope`; events arrive on the returned receiver.
    pub async fn register(&self, scope: &str) -> (SinkId, mpsc::Receiver<PlatformEvent>) {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let id = SinkId(Uuid::new_v4());
        self.sinks
            .write()
            .await
            .entry(scope.to_string())
            .or_default()
            .push((id, tx));
        tracing::debug!(scope, "Event sink registered");
        (id, rx)
    }

    /// Remove a sink. Returns `false` if it was not registered.
    pub async fn unregister(&self, scope: &str, id: SinkId) -> bool {
        let mut sinks = self.sinks.write().await;
        let Some(list) = sinks.get_mut(scope) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            sinks.remove(scope);
        }
        removed
    }

    /// Drop every sink of `scope`, closing their receivers.
    pub async fn close_scope(&self, scope: &str) {
        self.sinks.write().await.remove(scope);
    }

    /// Deliver `event` to every sink of `scope`. Returns the number of sinks
    /// that accepted it.
    pub async fn dispatch(&self, scope: &str, event: &PlatformEvent) -> usize {
        let mut sinks = self.sinks.write().await;
        let Some(list) = sinks.get_mut(scope) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|(_, tx)| match tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(scope, event_type = %event.event_type, "Event sink full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            sinks.remove(scope);
        }
        delivered
    }

    pub async fn sink_count(&self, scope: &str) -> usize {
        self.sinks.read().await.get(scope).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_reaches_only_matching_scope() {
        let registry = SinkRegistry::new();
        let (_a, mut rx_a) = registry.register("group-a").await;
        let (_b, mut rx_b) = registry.register("group-b").await;

        let delivered = registry
            .dispatch("group-a", &PlatformEvent::new("child_completed"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap().event_type, "child_completed");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_sink() {
        let registry = SinkRegistry::new();
        let (id, _rx) = registry.register("g").await;
        assert_eq!(registry.sink_count("g").await, 1);
        assert!(registry.unregister("g", id).await);
        assert!(!registry.unregister("g", id).await);
        assert_eq!(registry.sink_count("g").await, 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let registry = SinkRegistry::new();
        let (_id, rx) = registry.register("g").await;
        drop(rx);
        assert_eq!(registry.dispatch("g", &PlatformEvent::new("x")).await, 0);
        assert_eq!(registry.sink_count("g").await, 0);
    }

    #[tokio::test]
    async fn close_scope_ends_streams() {
        let registry = SinkRegistry::new();
        let (_id, mut rx) = registry.register("g").await;
        registry.close_scope("g").await;
        assert!(rx.recv().await.is_none());
    }
}
