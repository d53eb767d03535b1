//! Console stand-in for the 3D view: remembers the native (radian / metre)
//! value last applied to each joint.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use medbot_sync::JointConsumer;
use medbot_types::{JointSpec, SyncError};

#[derive(Clone, Default)]
pub struct NativeJointView {
    values: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl NativeJointView {
    pub fn get(&self, joint: &str) -> Option<f64> {
        self.values.lock().ok()?.get(joint).copied()
    }
}

impl JointConsumer for NativeJointView {
    fn apply_joint(&mut self, joint: &JointSpec, native_value: f64) -> Result<(), SyncError> {
        let mut values = self.values.lock().map_err(|_| SyncError::Application {
            joint: joint.id.clone(),
            details: "view state is poisoned".to_string(),
        })?;
        values.insert(joint.id.clone(), native_value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbot_types::JointKind;

    #[test]
    fn clones_share_the_same_values() {
        let view = NativeJointView::default();
        let mut consumer = view.clone();
        let lift = JointSpec::new("lift", JointKind::Prismatic, 0.0, 400.0);

        consumer.apply_joint(&lift, 0.125).unwrap();

        assert_eq!(view.get("lift"), Some(0.125));
        assert_eq!(view.get("elbow"), None);
    }
}
