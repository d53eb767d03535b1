//! Seams between the synchronization layer and the outside world.
//!
//! - [`JointConsumer`] – anything that receives validated, unit-converted
//!   joint values (a kinematic model, a 3D view, a test double).
//! - [`CommandSink`] – where the joint pipeline hands outbound commands. The
//!   transport's [`ChannelHandle`][crate::transport::ChannelHandle]
//!   implements it; so does a plain `mpsc` sender, which is what tests use.

use medbot_types::{JointSpec, OutboundCommand, SyncError};
use tokio::sync::mpsc;

/// Receives joint values already clamped and converted to native units
/// (radians or metres).
pub trait JointConsumer: Send {
    /// Apply one joint.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Application`] when the value cannot be applied.
    /// The pipeline logs and skips that joint; the rest of the update still
    /// goes through.
    fn apply_joint(&mut self, joint: &JointSpec, native_value: f64) -> Result<(), SyncError>;
}

/// Outbound side of the joint pipeline.
pub trait CommandSink: Send + Sync {
    /// Transmit `command` now or queue it until the connection opens.
    fn send_command(&self, command: OutboundCommand) -> Result<(), SyncError>;
}

impl CommandSink for mpsc::UnboundedSender<OutboundCommand> {
    fn send_command(&self, command: OutboundCommand) -> Result<(), SyncError> {
        self.send(command)
            .map_err(|e| SyncError::Channel(format!("command sink closed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbot_types::JointKind;
    use std::collections::BTreeMap;

    /// Minimal consumer that remembers the last value per joint.
    struct MockConsumer {
        applied: BTreeMap<String, f64>,
    }

    impl JointConsumer for MockConsumer {
        fn apply_joint(&mut self, joint: &JointSpec, native_value: f64) -> Result<(), SyncError> {
            self.applied.insert(joint.id.clone(), native_value);
            Ok(())
        }
    }

    #[test]
    fn mock_consumer_records_values() {
        let mut consumer = MockConsumer { applied: BTreeMap::new() };
        let spec = JointSpec::new("elbow", JointKind::Revolute, -90.0, 90.0);
        consumer.apply_joint(&spec, 0.5).unwrap();
        assert_eq!(consumer.applied["elbow"], 0.5);
    }

    #[test]
    fn mpsc_sender_is_a_command_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cmd = OutboundCommand::joint_update(BTreeMap::new());
        tx.send_command(cmd.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, cmd.id);
    }

    #[test]
    fn closed_mpsc_sink_reports_channel_error() {
        let (tx, rx) = mpsc::unbounded_channel::<OutboundCommand>();
        drop(rx);
        let result = tx.send_command(OutboundCommand::joint_update(BTreeMap::new()));
        assert!(matches!(result, Err(SyncError::Channel(_))));
    }
}
