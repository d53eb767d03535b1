//! Joint state map: the synchronized value of every joint, in UI units.

use std::collections::BTreeMap;

use medbot_types::JointSpec;
use tracing::warn;

/// Current joint values keyed by canonical id. Every stored value lies
/// within its joint's limits.
#[derive(Debug, Clone)]
pub struct JointStateMap {
    specs: Vec<JointSpec>,
    values: BTreeMap<String, f64>,
}

impl JointStateMap {
    /// Build a map at the rest pose. A spec repeating an earlier id is
    /// dropped.
    pub fn new(specs: impl IntoIterator<Item = JointSpec>) -> Self {
        let mut unique: Vec<JointSpec> = Vec::new();
        for spec in specs {
            if unique.iter().any(|s| s.id == spec.id) {
                warn!(joint = %spec.id, "duplicate joint id; keeping the first definition");
                continue;
            }
            unique.push(spec);
        }

        let values = unique
            .iter()
            .map(|spec| (spec.id.clone(), spec.rest_value()))
            .collect();
        Self {
            specs: unique,
            values,
        }
    }

    /// Look a joint up by canonical id or alias.
    pub fn resolve(&self, name: &str) -> Option<&JointSpec> {
        self.specs
            .iter()
            .find(|s| s.id == name)
            .or_else(|| self.specs.iter().find(|s| s.answers_to(name)))
    }

    /// Clamp and store `value`. Returns the canonical id and the stored
    /// value, or `None` for an unknown joint.
    pub fn set(&mut self, name: &str, value: f64) -> Option<(String, f64)> {
        let spec = self.resolve(name)?;
        let id = spec.id.clone();
        let clamped = spec.limits().clamp(value);
        self.values.insert(id.clone(), clamped);
        Some((id, clamped))
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let spec = self.resolve(name)?;
        self.values.get(&spec.id).copied()
    }

    /// Every joint back to its rest value.
    pub fn reset(&mut self) {
        for spec in &self.specs {
            self.values.insert(spec.id.clone(), spec.rest_value());
        }
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn specs(&self) -> &[JointSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
