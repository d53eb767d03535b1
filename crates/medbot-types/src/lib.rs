use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Wire value of the `source` field that marks a frame as emitted by this
/// dashboard.
pub const SELF_ORIGIN_TAG: &str = "ui";

/// Logical command type carried by every joint frame.
pub const JOINT_UPDATE_TYPE: &str = "joint_update";

/// Default `role` attached to outbound joint frames.
pub const DEFAULT_ROLE: &str = "robot";

/// Kinematic type of a single joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Revolute,
    Prismatic,
    Fixed,
    Continuous,
}

impl JointKind {
    /// `true` for joints whose value is an angle.
    pub fn is_rotational(self) -> bool {
        matches!(self, JointKind::Revolute | JointKind::Continuous)
    }
}

impl std::fmt::Display for JointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JointKind::Revolute => write!(f, "revolute"),
            JointKind::Prismatic => write!(f, "prismatic"),
            JointKind::Fixed => write!(f, "fixed"),
            JointKind::Continuous => write!(f, "continuous"),
        }
    }
}

/// Inclusive mechanical range of a joint, in UI units (degrees or
/// millimetres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub min: f64,
    pub max: f64,
}

impl JointLimits {
    /// Build limits, swapping the bounds if they were given in reverse.
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Clamp `value` into `[min, max]`.
    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.min).min(self.max)
    }
}

/// Static description of one joint of the mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointSpec {
    /// Canonical identifier, e.g. `"shoulder_pan"`.
    pub id: String,
    pub kind: JointKind,
    pub min: f64,
    pub max: f64,
    /// Alternative spellings some producers use for this joint, e.g. `"j1"`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

impl JointSpec {
    pub fn new(id: impl Into<String>, kind: JointKind, min: f64, max: f64) -> Self {
        let limits = JointLimits::new(min, max);
        Self {
            id: id.into(),
            kind,
            min: limits.min,
            max: limits.max,
            aliases: Vec::new(),
        }
    }

    /// Builder-style alias registration.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn limits(&self) -> JointLimits {
        JointLimits::new(self.min, self.max)
    }

    /// Rest pose value: zero, pulled into range for joints whose range
    /// excludes zero.
    pub fn rest_value(&self) -> f64 {
        self.limits().clamp(0.0)
    }

    /// `true` when `name` is the canonical id or one of the aliases.
    pub fn answers_to(&self, name: &str) -> bool {
        self.id == name || self.aliases.iter().any(|a| a == name)
    }
}

/// Who produced a joint frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Origin {
    /// Emitted by this dashboard (`"source": "ui"` on the wire).
    Local,
    /// Anything else: the robot, another producer, or an untagged frame.
    #[default]
    Remote,
}

/// Canonical shape of an inbound joint frame after key-spelling
/// normalisation.
///
/// Values are kept as raw JSON so that non-numeric entries can be skipped one
/// joint at a time by the consumer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JointUpdate {
    pub values: BTreeMap<String, serde_json::Value>,
    pub origin: Origin,
    pub role: Option<String>,
}

/// Classification of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Connection-established or similar status notice. Never forwarded.
    Handshake,
    /// "Your cached telemetry is stale" signal. Carries no data.
    Trigger,
    /// A joint-value mapping.
    Data(JointUpdate),
    /// Failed both decode attempts or matched no known shape.
    Malformed(DecodeError),
}

/// One operator-issued joint command, always tagged as self-originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
    pub origin: Origin,
}

impl OutboundCommand {
    /// A `joint_update` command carrying `values`.
    pub fn joint_update(values: BTreeMap<String, f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            values,
            origin: Origin::Local,
        }
    }
}

/// Why a connection ended up in [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The owner called `close()`.
    Explicit,
    /// The reconnect ceiling was reached; requires an explicit `open()`.
    Exhausted { attempts: u32 },
}

/// Lifecycle of one logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    /// Waiting on the backoff timer before attempt number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    Open,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// `true` while a socket is live or about to be (re)established.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Reconnecting { .. }
                | ConnectionState::Open
        )
    }

    /// `true` for the sustained disconnected state that needs operator
    /// attention.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, ConnectionState::Closed(CloseReason::Exhausted { .. }))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {} ms)", delay.as_millis())
            }
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed(CloseReason::Explicit) => write!(f, "closed"),
            ConnectionState::Closed(CloseReason::Exhausted { attempts }) => {
                write!(f, "disconnected (gave up after {attempts} attempts)")
            }
        }
    }
}

/// Aggregate state published outward to presentation consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"medbot-sync::transport"`
    pub source: String,
    pub payload: SyncPayload,
}

impl SyncEvent {
    pub fn new(source: impl Into<String>, payload: SyncPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of aggregate state routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Connection indicator transition for `endpoint`.
    Connection {
        endpoint: String,
        state: ConnectionState,
    },
    /// Full joint map after a merge, local edit, or reset.
    Joints(BTreeMap<String, f64>),
    /// A freshly pulled telemetry snapshot.
    Telemetry(serde_json::Value),
    /// A contained, non-fatal error.
    Error(String),
}

/// A frame that could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{reason} (frame starts with {preview:?})")]
pub struct DecodeError {
    pub reason: String,
    pub preview: String,
}

impl DecodeError {
    const PREVIEW_CHARS: usize = 64;

    pub fn new(reason: impl Into<String>, raw: &str) -> Self {
        Self {
            reason: reason.into(),
            preview: raw.chars().take(Self::PREVIEW_CHARS).collect(),
        }
    }
}

/// Error taxonomy of the synchronization layer.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncError {
    #[error("Transport Error on {endpoint}: {details}")]
    Transport { endpoint: String, details: String },

    #[error("Decode Error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Application Error on joint {joint}: {details}")]
    Application { joint: String, details: String },

    #[error("Reconnect attempts exhausted for {endpoint} after {attempts} attempts")]
    ExhaustedReconnect { endpoint: String, attempts: u32 },

    #[error("Unknown joint: {0}")]
    UnknownJoint(String),

    #[error("Fetch Error: {0}")]
    Fetch(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Joint pipeline has been shut down")]
    ShutDown,
}
