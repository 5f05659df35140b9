//! Event types and per-user event bus
//!
//! Capture lifecycle events are broadcast on a topic per owning user and
//! consumed by the subscription gateway, which serializes them as JSON
//! frames for connected clients.
//!
//! The bus uses `tokio::broadcast` per topic, providing:
//! - Non-blocking publish (slow subscribers never block producers)
//! - Multiple concurrent subscribers per user
//! - Bounded buffers with lag detection for slow subscribers

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Species details attached to capture events once classification resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeciesRef {
    /// Stable classifier species code (e.g. "amerob")
    pub code: String,
    /// Common name (e.g. "American Robin")
    pub common_name: String,
    /// Scientific name (e.g. "Turdus migratorius")
    pub scientific_name: String,
}

/// Capture lifecycle events
///
/// Serialized with a `type` tag so gateway frames are self-describing.
/// Progress events are best-effort; terminal events are the ones clients
/// should act on (a disconnected client resynchronizes via the capture
/// list endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CaptureEvent {
    /// Non-terminal state change (claimed, classified, generating)
    #[serde(rename = "capture.progress")]
    Progress {
        capture_id: Uuid,
        /// Current pipeline state as a wire string
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// Capture reached `processed` (classification succeeded; art optional)
    #[serde(rename = "capture.processed")]
    Processed {
        capture_id: Uuid,
        status: String,
        species: SpeciesRef,
        /// Classifier confidence, 0.0 to 1.0
        confidence: f64,
        /// Null when art generation was skipped or unavailable
        asset_url: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Capture reached `failed`
    #[serde(rename = "capture.failed")]
    Failed {
        capture_id: Uuid,
        status: String,
        /// Terminal failure reason (e.g. "unavailable", "orphaned")
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl CaptureEvent {
    /// Get event type as a wire string for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            CaptureEvent::Progress { .. } => "capture.progress",
            CaptureEvent::Processed { .. } => "capture.processed",
            CaptureEvent::Failed { .. } => "capture.failed",
        }
    }

    /// Capture this event refers to
    pub fn capture_id(&self) -> Uuid {
        match self {
            CaptureEvent::Progress { capture_id, .. }
            | CaptureEvent::Processed { capture_id, .. }
            | CaptureEvent::Failed { capture_id, .. } => *capture_id,
        }
    }

    /// True for `capture.processed` / `capture.failed`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaptureEvent::Progress { .. })
    }
}

/// Per-user event distribution bus
///
/// Topics are keyed by owning user id. Publishing to a user with no live
/// subscribers is a no-op; a subscriber that falls behind its bounded
/// buffer misses events and observes the gap as a lag count on receive.
///
/// The topic map is guarded by a read-preferring lock: publish and
/// subscribe take the read path, topic creation and pruning take the
/// short write path.
pub struct EventBus {
    topics: RwLock<HashMap<Uuid, broadcast::Sender<CaptureEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose per-subscriber buffers hold `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to all future events for one user
    ///
    /// Events published before subscription are not received.
    pub fn subscribe(&self, user_id: Uuid) -> broadcast::Receiver<CaptureEvent> {
        if let Some(tx) = self.topics.read().get(&user_id) {
            return tx.subscribe();
        }
        let mut topics = self.topics.write();
        topics
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish an event to one user's topic, ignoring missing subscribers
    ///
    /// Never blocks. If the topic has no live receivers the event is
    /// dropped and the idle topic is pruned.
    pub fn publish(&self, user_id: Uuid, event: CaptureEvent) {
        let delivered = {
            let topics = self.topics.read();
            match topics.get(&user_id) {
                Some(tx) => tx.send(event).is_ok(),
                None => return,
            }
        };

        if !delivered {
            // Last receiver dropped; reclaim the topic entry.
            let mut topics = self.topics.write();
            if let Some(tx) = topics.get(&user_id) {
                if tx.receiver_count() == 0 {
                    topics.remove(&user_id);
                }
            }
        }
    }

    /// Current number of active subscribers on one user's topic
    pub fn subscriber_count(&self, user_id: Uuid) -> usize {
        self.topics
            .read()
            .get(&user_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of live topics (users with at least one subscriber at some point)
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Configured per-subscriber buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(capture_id: Uuid) -> CaptureEvent {
        CaptureEvent::Progress {
            capture_id,
            status: "classifying".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_type_strings() {
        let id = Uuid::new_v4();
        assert_eq!(progress(id).event_type(), "capture.progress");

        let processed = CaptureEvent::Processed {
            capture_id: id,
            status: "processed".to_string(),
            species: SpeciesRef {
                code: "amerob".to_string(),
                common_name: "American Robin".to_string(),
                scientific_name: "Turdus migratorius".to_string(),
            },
            confidence: 0.92,
            asset_url: Some("https://assets/amerob.webp".to_string()),
            timestamp: Utc::now(),
        };
        assert_eq!(processed.event_type(), "capture.processed");
        assert!(processed.is_terminal());
        assert!(!progress(id).is_terminal());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&progress(id)).unwrap();
        assert!(json.contains("\"type\":\"capture.progress\""));
        assert!(json.contains("\"status\":\"classifying\""));

        let back: CaptureEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capture_id(), id);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        bus.publish(Uuid::new_v4(), progress(Uuid::new_v4()));
        assert_eq!(bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_own_topic_only() {
        let bus = EventBus::new(8);
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        let mut rx_a = bus.subscribe(user_a);
        let mut rx_b = bus.subscribe(user_b);

        let capture = Uuid::new_v4();
        bus.publish(user_a, progress(capture));

        let got = rx_a.try_recv().expect("user A should receive");
        assert_eq!(got.capture_id(), capture);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_same_topic() {
        let bus = EventBus::new(8);
        let user = Uuid::new_v4();

        let mut rx1 = bus.subscribe(user);
        let mut rx2 = bus.subscribe(user);
        assert_eq!(bus.subscriber_count(user), 2);

        bus.publish(user, progress(Uuid::new_v4()));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let user = Uuid::new_v4();
        let mut rx = bus.subscribe(user);

        for _ in 0..5 {
            bus.publish(user, progress(Uuid::new_v4()));
        }

        // Oldest events were overwritten; the receiver reports the gap.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_topic_pruned_after_last_subscriber_drops() {
        let bus = EventBus::new(8);
        let user = Uuid::new_v4();

        let rx = bus.subscribe(user);
        assert_eq!(bus.topic_count(), 1);
        drop(rx);

        // Publish notices the dead topic and prunes it.
        bus.publish(user, progress(Uuid::new_v4()));
        assert_eq!(bus.topic_count(), 0);
    }
}
