//! Topic-partitioned broadcast bus carrying aggregate sync state outward.
//!
//! Uses [`tokio::sync::broadcast`] channels so that every presentation
//! consumer receives every event without any single consumer blocking the
//! others.
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Connection`] | Connection indicator transitions |
//! | [`Topic::Joints`] | Joint map after a merge, local edit, or reset |
//! | [`Topic::Telemetry`] | Snapshots pulled by the trigger-fetch coordinator |
//! | [`Topic::Errors`] | Contained, non-fatal decode and apply errors |

use medbot_types::{SyncError, SyncEvent, SyncPayload};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    Joints,
    Telemetry,
    Errors,
}

impl Topic {
    /// The lane a payload belongs on.
    pub fn for_payload(payload: &SyncPayload) -> Self {
        match payload {
            SyncPayload::Connection { .. } => Topic::Connection,
            SyncPayload::Joints(_) => Topic::Joints,
            SyncPayload::Telemetry(_) => Topic::Telemetry,
            SyncPayload::Error(_) => Topic::Errors,
        }
    }
}

/// Shared event bus. Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    connection: broadcast::Sender<SyncEvent>,
    joints: broadcast::Sender<SyncEvent>,
    telemetry: broadcast::Sender<SyncEvent>,
    errors: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (connection, _) = broadcast::channel(capacity);
        let (joints, _) = broadcast::channel(capacity);
        let (telemetry, _) = broadcast::channel(capacity);
        let (errors, _) = broadcast::channel(capacity);
        Self {
            connection,
            joints,
            telemetry,
            errors,
        }
    }

    /// Publish `event` on the given [`Topic`].
    ///
    /// Returns the number of receivers handed the event, or
    /// [`SyncError::Channel`] when nobody is listening on that topic.
    pub fn publish_to(&self, topic: Topic, event: SyncEvent) -> Result<usize, SyncError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| SyncError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish on the lane matching the event's payload.
    pub fn publish(&self, event: SyncEvent) -> Result<usize, SyncError> {
        let topic = Topic::for_payload(&event.payload);
        self.publish_to(topic, event)
    }

    /// Fire-and-forget publish for producers that do not care whether anyone
    /// is listening.
    pub fn emit(&self, source: &str, payload: SyncPayload) {
        let _ = self.publish(SyncEvent::new(source, payload));
    }

    /// Subscribe to one [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<SyncEvent> {
        match topic {
            Topic::Connection => &self.connection,
            Topic::Joints => &self.joints,
            Topic::Telemetry => &self.telemetry,
            Topic::Errors => &self.errors,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<SyncEvent>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(RecvError::Lagged(n))` means the subscriber fell behind and `n`
    /// events were dropped; the caller decides whether to continue.
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbot_types::ConnectionState;
    use std::collections::BTreeMap;

    fn joints_event() -> SyncEvent {
        let mut values = BTreeMap::new();
        values.insert("elbow".to_string(), 12.0);
        SyncEvent::new("test", SyncPayload::Joints(values))
    }

    #[tokio::test]
    async fn publish_routes_by_payload() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut joints = bus.subscribe_to(Topic::Joints);

        let event = joints_event();
        bus.publish(event.clone())?;

        let received = joints.recv().await?;
        assert_eq!(received.id, event.id);
        assert_eq!(joints.topic(), Topic::Joints);
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topic_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut errors = bus.subscribe_to(Topic::Errors);
        let _connection = bus.subscribe_to(Topic::Connection);

        bus.publish(SyncEvent::new(
            "test",
            SyncPayload::Connection {
                endpoint: "ws://robot".to_string(),
                state: ConnectionState::Open,
            },
        ))?;

        let result =
            tokio::time::timeout(std::time::Duration::from_millis(50), errors.recv()).await;
        assert!(result.is_err(), "Errors subscriber must not see a Connection event");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(Topic::Telemetry, joints_event());
        assert!(matches!(result, Err(SyncError::Channel(_))));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit("test", SyncPayload::Error("nobody listening".to_string()));
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Joints);

        for _ in 0..1_000 {
            let _ = bus.publish(joints_event());
        }

        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
