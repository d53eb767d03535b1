//! Payload interpreter: raw text frame → [`Envelope`].
//!
//! Several backend producers talk to the dashboard and they do not agree on
//! field names. The interpreter is the only place that knows about that; it
//! accepts either spelling of the joint-value map and hands the rest of the
//! crate one canonical [`JointUpdate`].
//!
//! Classification order:
//!
//! 1. `{"Type": "connection_established", ...}` → [`Envelope::Handshake`]
//! 2. `{"payload": <bool>}` and nothing else → [`Envelope::Trigger`]
//! 3. an object with `joint_values` and/or `joints` → [`Envelope::Data`]
//! 4. anything else → [`Envelope::Malformed`]
//!
//! Some producers append stray bytes after the closing brace of a frame. If
//! the strict decode fails, the frame is cut after its last `}` and decoded
//! once more before it is declared malformed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use medbot_types::{
    DEFAULT_ROLE, DecodeError, Envelope, JOINT_UPDATE_TYPE, JointUpdate, Origin, OutboundCommand,
    SELF_ORIGIN_TAG, SyncError,
};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Canonical (full) spelling of the joint-value map key.
pub const CANONICAL_JOINT_KEY: &str = "joint_values";

/// Abbreviated spelling used by older producers. Same meaning.
pub const ABBREVIATED_JOINT_KEY: &str = "joints";

/// Field carrying the trigger flag.
pub const TRIGGER_KEY: &str = "payload";

/// Status notices recognised as handshakes and dropped.
const HANDSHAKE_TYPES: &[&str] = &["connection_established"];

/// Both casings of the handshake discriminator seen in the wild.
const HANDSHAKE_TYPE_KEYS: &[&str] = &["Type", "type"];

/// Interpret one inbound text frame.
pub fn interpret(raw: &str) -> Envelope {
    match decode(raw) {
        Ok(value) => classify(&value, raw),
        Err(e) => Envelope::Malformed(e),
    }
}

/// Strict decode, then one retry with trailing bytes after the last `}`
/// removed.
fn decode(raw: &str) -> Result<Value, DecodeError> {
    let first = match serde_json::from_str::<Value>(raw) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    match truncate_after_last_brace(raw) {
        Some(trimmed) if trimmed.len() < raw.len() => serde_json::from_str(trimmed).map_err(|e| {
            DecodeError::new(format!("invalid JSON after trimming trailing bytes: {e}"), raw)
        }),
        _ => Err(DecodeError::new(format!("invalid JSON: {first}"), raw)),
    }
}

/// Slice of `raw` up to and including its last `}`.
pub(crate) fn truncate_after_last_brace(raw: &str) -> Option<&str> {
    raw.rfind('}').map(|idx| &raw[..=idx])
}

fn classify(value: &Value, raw: &str) -> Envelope {
    let Some(obj) = value.as_object() else {
        return Envelope::Malformed(DecodeError::new("frame is not a JSON object", raw));
    };

    if is_handshake(obj) {
        return Envelope::Handshake;
    }
    if is_trigger(obj) {
        return Envelope::Trigger;
    }

    match joint_values(obj) {
        Some(values) => Envelope::Data(JointUpdate {
            values,
            origin: origin_of(obj),
            role: obj.get("role").and_then(Value::as_str).map(str::to_string),
        }),
        None => Envelope::Malformed(DecodeError::new("no recognised message shape", raw)),
    }
}

fn is_handshake(obj: &Map<String, Value>) -> bool {
    HANDSHAKE_TYPE_KEYS
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_str))
        .any(|kind| HANDSHAKE_TYPES.contains(&kind))
}

fn is_trigger(obj: &Map<String, Value>) -> bool {
    obj.len() == 1 && obj.get(TRIGGER_KEY).is_some_and(Value::is_boolean)
}

/// Merge both spellings into one map. The canonical key wins per joint when
/// a frame carries both.
fn joint_values(obj: &Map<String, Value>) -> Option<BTreeMap<String, Value>> {
    let abbreviated = obj.get(ABBREVIATED_JOINT_KEY).and_then(Value::as_object);
    let canonical = obj.get(CANONICAL_JOINT_KEY).and_then(Value::as_object);
    if abbreviated.is_none() && canonical.is_none() {
        return None;
    }

    let mut values = BTreeMap::new();
    for map in [abbreviated, canonical].into_iter().flatten() {
        for (joint, value) in map {
            values.insert(joint.clone(), value.clone());
        }
    }
    Some(values)
}

fn origin_of(obj: &Map<String, Value>) -> Origin {
    match obj.get("source").and_then(Value::as_str) {
        Some(SELF_ORIGIN_TAG) => Origin::Local,
        _ => Origin::Remote,
    }
}

// ---------------------------------------------------------------------------
// Outbound encoding
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireJointFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    joint_values: &'a BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'static str>,
    role: &'static str,
    id: Uuid,
    timestamp: DateTime<Utc>,
}

/// Serialise an [`OutboundCommand`] into its wire frame.
///
/// Locally originated commands carry `"source": "ui"` so that a backend
/// that broadcasts them back can be recognised and ignored.
pub fn encode(command: &OutboundCommand) -> Result<String, SyncError> {
    let frame = WireJointFrame {
        kind: JOINT_UPDATE_TYPE,
        joint_values: &command.values,
        source: (command.origin == Origin::Local).then_some(SELF_ORIGIN_TAG),
        role: DEFAULT_ROLE,
        id: command.id,
        timestamp: command.timestamp,
    };
    serde_json::to_string(&frame).map_err(|e| SyncError::Serialization(e.to_string()))
}
