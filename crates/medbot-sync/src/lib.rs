//! `medbot-sync` – Real-time device-state synchronization
//!
//! Keeps the dashboard's view of a remote robot's joints and telemetry
//! consistent with the robot over an unreliable WebSocket, and carries
//! operator joint commands back without ever reapplying them as robot state.
//!
//! # Modules
//!
//! - [`transport`] – One logical connection with FIFO send queue and
//!   exponential-backoff reconnection.
//! - [`reconnect`] – Socket-free connection state machine and backoff policy.
//! - [`interpreter`] – Classifies raw frames as handshake, trigger, data, or
//!   malformed; encodes outbound joint frames.
//! - [`trigger_fetch`] – Pulls an expensive snapshot whenever the backend
//!   signals that it changed.
//! - [`pipeline`] – Inbound merge with echo suppression; clamped, debounced
//!   outbound edits.
//! - [`joints`] – The clamped joint state map.
//! - [`units`] – Degrees/millimetres to radians/metres at the consumer
//!   boundary.
//! - [`session`] – Owned teleoperation session with ordered teardown.
//! - [`bus`] – Topic-partitioned broadcast bus for aggregate state.
//! - [`adapter`] – Consumer and command-sink seams.

pub mod adapter;
pub mod bus;
pub mod interpreter;
pub mod joints;
pub mod pipeline;
pub mod reconnect;
pub mod session;
pub mod transport;
pub mod trigger_fetch;
pub mod units;

pub use adapter::{CommandSink, JointConsumer};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use interpreter::{encode, interpret};
pub use joints::JointStateMap;
pub use pipeline::{ApplyReport, JointPipeline, PipelineConfig};
pub use reconnect::{ConnectionMachine, ReconnectPolicy};
pub use session::{SessionConfig, TeleopSession};
pub use transport::{ChannelHandle, ChannelHandler, TransportChannel};
pub use trigger_fetch::{FetchPhase, HttpFetcher, SnapshotFetcher, TriggerFetchCoordinator, TriggerState};
pub use units::AngleInference;
