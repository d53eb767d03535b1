//! Teleoperation session: one transport channel driving one joint pipeline.
//!
//! The session is the owned resource a dashboard view opens and closes.
//! Teardown runs in a fixed order: the pipeline stops (debounce timer
//! cancelled, later edits refused), then the channel closes (reconnect timer
//! cancelled, socket closed), and finally the driver drops the handler so no
//! late frame reaches the pipeline.

use std::sync::Arc;

use medbot_types::{CloseReason, ConnectionState, Envelope, JointSpec, SyncError, SyncPayload};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::adapter::JointConsumer;
use crate::bus::EventBus;
use crate::pipeline::{JointPipeline, PipelineConfig};
use crate::reconnect::ReconnectPolicy;
use crate::transport::{ChannelHandle, ChannelHandler, TransportChannel};

const SOURCE: &str = "medbot-sync::session";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the joint command channel.
    pub endpoint: String,
    pub policy: ReconnectPolicy,
    pub pipeline: PipelineConfig,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy: ReconnectPolicy::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Routes channel output into the pipeline and the bus.
struct SessionHandler {
    endpoint: String,
    pipeline: Arc<JointPipeline>,
    bus: Arc<EventBus>,
}

impl ChannelHandler for SessionHandler {
    fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Data(_) => {
                self.pipeline.apply_inbound(&envelope);
            }
            Envelope::Malformed(err) => {
                self.bus
                    .emit(SOURCE, SyncPayload::Error(SyncError::Decode(err).to_string()));
            }
            Envelope::Trigger | Envelope::Handshake => {
                debug!(endpoint = %self.endpoint, "non-data envelope on command channel");
            }
        }
    }

    fn on_state_change(&mut self, state: &ConnectionState) {
        self.bus.emit(
            SOURCE,
            SyncPayload::Connection {
                endpoint: self.endpoint.clone(),
                state: state.clone(),
            },
        );
        if let ConnectionState::Closed(CloseReason::Exhausted { attempts }) = state {
            let error = SyncError::ExhaustedReconnect {
                endpoint: self.endpoint.clone(),
                attempts: *attempts,
            };
            self.bus.emit(SOURCE, SyncPayload::Error(error.to_string()));
        }
    }
}

pub struct TeleopSession {
    channel: TransportChannel,
    handle: ChannelHandle,
    pipeline: Arc<JointPipeline>,
    bus: Arc<EventBus>,
}

impl TeleopSession {
    /// Build the pipeline at the rest pose and start connecting.
    pub fn open(
        config: SessionConfig,
        joints: Vec<JointSpec>,
        consumers: Vec<Box<dyn JointConsumer>>,
        bus: Arc<EventBus>,
    ) -> Self {
        let mut channel = TransportChannel::new(config.endpoint.clone(), config.policy);
        let handle = channel.handle();

        let pipeline = Arc::new(JointPipeline::new(
            joints,
            Arc::new(handle.clone()),
            config.pipeline,
            Some(Arc::clone(&bus)),
        ));
        for consumer in consumers {
            pipeline.add_consumer(consumer);
        }

        channel.open(SessionHandler {
            endpoint: config.endpoint.clone(),
            pipeline: Arc::clone(&pipeline),
            bus: Arc::clone(&bus),
        });
        info!(endpoint = %config.endpoint, "teleop session opened");

        Self {
            channel,
            handle,
            pipeline,
            bus,
        }
    }

    pub fn pipeline(&self) -> &JointPipeline {
        &self.pipeline
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn endpoint(&self) -> &str {
        self.channel.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.watch_state()
    }

    /// Restart connecting after the reconnect ceiling was reached. A no-op
    /// while connecting or open.
    pub fn reconnect(&mut self) {
        info!(endpoint = self.channel.endpoint(), "explicit reconnect requested");
        self.channel.open(SessionHandler {
            endpoint: self.channel.endpoint().to_string(),
            pipeline: Arc::clone(&self.pipeline),
            bus: Arc::clone(&self.bus),
        });
    }

    /// Tear the session down.
    pub async fn close(mut self) {
        self.pipeline.shutdown();
        self.channel.close().await;
        info!(endpoint = self.channel.endpoint(), "teleop session closed");
    }
}
