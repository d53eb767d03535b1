//! Joint command pipeline: the bidirectional control loop for one
//! mechanism.
//!
//! Inbound, [`JointPipeline::apply_inbound`] merges robot-reported values
//! into the [`JointStateMap`] and forwards them, converted to native units,
//! to every [`JointConsumer`]. Frames this dashboard sent itself are
//! recognised by their origin tag and dropped.
//!
//! Outbound, [`JointPipeline::set_local`] updates the map at once and hands
//! the edit to a trailing-edge debouncer. Edits that arrive within one quiet
//! period coalesce into a single [`OutboundCommand`] carrying the latest
//! value of every joint touched. [`JointPipeline::reset_all`] bypasses the
//! debouncer and supersedes any edit still waiting in it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use medbot_types::{Envelope, JointSpec, Origin, OutboundCommand, SyncError, SyncPayload};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::{CommandSink, JointConsumer};
use crate::bus::EventBus;
use crate::joints::JointStateMap;
use crate::units::{AngleInference, to_native};

const SOURCE: &str = "medbot-sync::pipeline";

/// Default quiet period before a local edit is sent.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub debounce: Duration,
    pub angle_inference: AngleInference,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            angle_inference: AngleInference::default(),
        }
    }
}

/// Outcome of one inbound merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Canonical id and stored (clamped) value of each merged joint.
    pub applied: Vec<(String, f64)>,
    /// Names that were unknown or carried a non-numeric value.
    pub ignored: Vec<String>,
    /// The frame was our own command reflected back.
    pub echo_suppressed: bool,
}

struct Shared {
    map: JointStateMap,
    consumers: Vec<Box<dyn JointConsumer>>,
    last_error: Option<String>,
    /// Bumped by every reset; pending edits from an older epoch are dropped.
    epoch: u64,
    shut_down: bool,
}

/// A local edit waiting in the debouncer.
struct PendingEdit {
    joint: String,
    value: f64,
    epoch: u64,
}

pub struct JointPipeline {
    shared: Arc<Mutex<Shared>>,
    edits: mpsc::UnboundedSender<PendingEdit>,
    debouncer: AbortHandle,
    sink: Arc<dyn CommandSink>,
    bus: Option<Arc<EventBus>>,
    config: PipelineConfig,
}

impl JointPipeline {
    /// Build a pipeline at the rest pose and start its debouncer. Must be
    /// called from within a Tokio runtime.
    pub fn new(
        specs: Vec<JointSpec>,
        sink: Arc<dyn CommandSink>,
        config: PipelineConfig,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            map: JointStateMap::new(specs),
            consumers: Vec::new(),
            last_error: None,
            epoch: 0,
            shut_down: false,
        }));

        let (edits, edit_rx) = mpsc::unbounded_channel();
        let debouncer = tokio::spawn(debounce_loop(
            edit_rx,
            config.debounce,
            Arc::clone(&shared),
            Arc::clone(&sink),
            bus.clone(),
        ))
        .abort_handle();

        Self {
            shared,
            edits,
            debouncer,
            sink,
            bus,
            config,
        }
    }

    /// Register a consumer and bring it up to date with the current map.
    /// Stored values are degrees, so no radians guess applies here.
    pub fn add_consumer(&self, mut consumer: Box<dyn JointConsumer>) {
        let mut shared = self.lock();
        let Shared {
            map, last_error, ..
        } = &mut *shared;
        for spec in map.specs() {
            if let Some(value) = map.values().get(&spec.id) {
                let native = to_native(spec.kind, *value, AngleInference::Degrees);
                if let Err(e) = consumer.apply_joint(spec, native) {
                    self.contain(last_error, &spec.id, e);
                }
            }
        }
        shared.consumers.push(consumer);
    }

    /// Merge a robot-reported update.
    ///
    /// Only [`Envelope::Data`] frames of remote origin change anything.
    /// Unknown joints and non-numeric values are skipped one joint at a
    /// time; the rest of the frame still applies.
    pub fn apply_inbound(&self, envelope: &Envelope) -> ApplyReport {
        let mut report = ApplyReport::default();
        let Envelope::Data(update) = envelope else {
            return report;
        };
        if update.origin == Origin::Local {
            debug!(joints = update.values.len(), "dropping self-originated joint frame");
            report.echo_suppressed = true;
            return report;
        }

        let mut shared = self.lock();
        if shared.shut_down {
            return report;
        }

        for (name, raw) in &update.values {
            let stored = raw
                .as_f64()
                .filter(|v| v.is_finite())
                .and_then(|v| shared.map.set(name, v));
            match stored {
                Some(applied) => report.applied.push(applied),
                None => report.ignored.push(name.clone()),
            }
        }

        if !report.ignored.is_empty() {
            debug!(ignored = ?report.ignored, "skipped unknown or non-numeric joints");
        }
        if report.applied.is_empty() {
            return report;
        }

        self.deliver(&mut shared, &report.applied, self.config.angle_inference);
        self.publish_joints(&shared);
        report
    }

    /// Apply an operator edit now and schedule it for sending.
    ///
    /// Returns the stored value after clamping.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownJoint`] for a name the map does not know,
    /// [`SyncError::Application`] for a non-finite value, and
    /// [`SyncError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn set_local(&self, joint: &str, raw: f64) -> Result<f64, SyncError> {
        if !raw.is_finite() {
            return Err(SyncError::Application {
                joint: joint.to_string(),
                details: format!("value {raw} is not finite"),
            });
        }

        let mut shared = self.lock();
        if shared.shut_down {
            return Err(SyncError::ShutDown);
        }
        let (id, value) = shared
            .map
            .set(joint, raw)
            .ok_or_else(|| SyncError::UnknownJoint(joint.to_string()))?;

        self.deliver(&mut shared, &[(id.clone(), value)], AngleInference::Degrees);
        self.publish_joints(&shared);

        let epoch = shared.epoch;
        drop(shared);

        self.edits
            .send(PendingEdit {
                joint: id,
                value,
                epoch,
            })
            .map_err(|_| SyncError::ShutDown)?;
        Ok(value)
    }

    /// Return every joint to rest and send one command covering all of
    /// them right away. Edits still waiting in the debouncer are dropped.
    pub fn reset_all(&self) -> Result<(), SyncError> {
        let mut shared = self.lock();
        if shared.shut_down {
            return Err(SyncError::ShutDown);
        }

        shared.map.reset();
        shared.epoch += 1;

        let all: Vec<(String, f64)> = shared
            .map
            .values()
            .iter()
            .map(|(id, v)| (id.clone(), *v))
            .collect();
        self.deliver(&mut shared, &all, AngleInference::Degrees);
        self.publish_joints(&shared);

        // Sent under the lock so a concurrent debounce flush cannot land
        // after the reset.
        let command = OutboundCommand::joint_update(shared.map.values().clone());
        info!(command_id = %command.id, joints = command.values.len(), "reset all joints");
        self.sink.send_command(command)
    }

    /// Snapshot of the map in UI units.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.lock().map.values().clone()
    }

    /// Current value of `joint` (id or alias).
    pub fn value(&self, joint: &str) -> Option<f64> {
        self.lock().map.get(joint)
    }

    pub fn specs(&self) -> Vec<JointSpec> {
        self.lock().map.specs().to_vec()
    }

    /// Most recent contained error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Cancel the debounce timer and refuse further edits. Pending edits are
    /// not sent.
    pub fn shutdown(&self) {
        let mut shared = self.lock();
        if shared.shut_down {
            return;
        }
        shared.shut_down = true;
        self.debouncer.abort();
        debug!("joint pipeline shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand each `(id, value)` to every consumer in native units. A failing
    /// consumer is logged and skipped. Operator input is always degrees;
    /// only robot-reported values go through the configured inference.
    fn deliver(&self, shared: &mut Shared, values: &[(String, f64)], inference: AngleInference) {
        let Shared {
            map,
            consumers,
            last_error,
            ..
        } = shared;
        for (id, value) in values {
            let Some(spec) = map.resolve(id) else {
                continue;
            };
            let native = to_native(spec.kind, *value, inference);
            for consumer in consumers.iter_mut() {
                if let Err(e) = consumer.apply_joint(spec, native) {
                    self.contain(last_error, id, e);
                }
            }
        }
    }

    fn contain(&self, last_error: &mut Option<String>, joint: &str, error: SyncError) {
        warn!(joint, error = %error, "consumer failed to apply joint; skipping");
        let message = error.to_string();
        if let Some(bus) = &self.bus {
            bus.emit(SOURCE, SyncPayload::Error(message.clone()));
        }
        *last_error = Some(message);
    }

    fn publish_joints(&self, shared: &Shared) {
        if let Some(bus) = &self.bus {
            bus.emit(SOURCE, SyncPayload::Joints(shared.map.values().clone()));
        }
    }
}

impl Drop for JointPipeline {
    fn drop(&mut self) {
        self.debouncer.abort();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Debouncer
// ─────────────────────────────────────────────────────────────────────────────

/// Trailing-edge debounce: every edit restarts the quiet period; when it
/// elapses, all pending edits go out as one command.
async fn debounce_loop(
    mut edits: mpsc::UnboundedReceiver<PendingEdit>,
    window: Duration,
    shared: Arc<Mutex<Shared>>,
    sink: Arc<dyn CommandSink>,
    bus: Option<Arc<EventBus>>,
) {
    let mut pending: BTreeMap<String, (f64, u64)> = BTreeMap::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            edit = edits.recv() => match edit {
                Some(edit) => {
                    pending.insert(edit.joint, (edit.value, edit.epoch));
                    deadline.as_mut().reset(Instant::now() + window);
                }
                None => break,
            },
            () = &mut deadline, if !pending.is_empty() => {
                flush(std::mem::take(&mut pending), &shared, sink.as_ref(), bus.as_deref());
            }
        }
    }
}

fn flush(
    pending: BTreeMap<String, (f64, u64)>,
    shared: &Mutex<Shared>,
    sink: &dyn CommandSink,
    bus: Option<&EventBus>,
) {
    let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
    if shared.shut_down {
        return;
    }

    let current = shared.epoch;
    let values: BTreeMap<String, f64> = pending
        .into_iter()
        .filter(|(_, (_, epoch))| *epoch == current)
        .map(|(joint, (value, _))| (joint, value))
        .collect();
    if values.is_empty() {
        debug!("pending edits superseded by reset");
        return;
    }

    let command = OutboundCommand::joint_update(values);
    debug!(command_id = %command.id, joints = command.values.len(), "flushing debounced edits");
    if let Err(e) = sink.send_command(command) {
        warn!(error = %e, "failed to send joint command");
        if let Some(bus) = bus {
            bus.emit(SOURCE, SyncPayload::Error(e.to_string()));
        }
        shared.last_error = Some(e.to_string());
    }
}
