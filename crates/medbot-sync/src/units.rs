//! Unit conversion at the consumer boundary.
//!
//! The joint map holds UI units: degrees for revolute and continuous joints,
//! millimetres for prismatic joints. Consumers receive native units: radians
//! and metres.
//!
//! Some robots already report radians. Under [`AngleInference::Heuristic`]
//! a reported angle whose magnitude is at most 2π is assumed to be radians
//! and is passed through. This misreads small degree values (5° becomes
//! 5 rad); [`AngleInference::Degrees`] turns the guess off. Operator edits
//! are known to be degrees and always convert.

use medbot_types::JointKind;
use serde::{Deserialize, Serialize};

pub const MM_PER_METRE: f64 = 1000.0;

/// Magnitude at or below which an angle is taken to be radians already.
pub const RADIAN_HEURISTIC_BOUND: f64 = std::f64::consts::TAU;

/// How rotational values are interpreted on their way to a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleInference {
    /// Pass small magnitudes through as radians; convert the rest.
    #[default]
    Heuristic,
    /// Always treat values as degrees.
    Degrees,
}

/// Convert a UI-unit value to the consumer's native unit.
pub fn to_native(kind: JointKind, value: f64, inference: AngleInference) -> f64 {
    match kind {
        JointKind::Prismatic => value / MM_PER_METRE,
        JointKind::Revolute | JointKind::Continuous => match inference {
            AngleInference::Heuristic if value.abs() <= RADIAN_HEURISTIC_BOUND => value,
            _ => value.to_radians(),
        },
        JointKind::Fixed => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn prismatic_millimetres_become_metres() {
        assert!(close(to_native(JointKind::Prismatic, 250.0, AngleInference::Heuristic), 0.25));
    }

    #[test]
    fn large_angles_are_converted_to_radians() {
        let native = to_native(JointKind::Revolute, 90.0, AngleInference::Heuristic);
        assert!(close(native, PI / 2.0));
    }

    #[test]
    fn small_angles_pass_through_under_heuristic() {
        let native = to_native(JointKind::Continuous, 1.2, AngleInference::Heuristic);
        assert!(close(native, 1.2));
        let native = to_native(JointKind::Revolute, -RADIAN_HEURISTIC_BOUND, AngleInference::Heuristic);
        assert!(close(native, -RADIAN_HEURISTIC_BOUND));
    }

    #[test]
    fn degrees_mode_always_converts() {
        let native = to_native(JointKind::Revolute, 5.0, AngleInference::Degrees);
        assert!(close(native, 5.0_f64.to_radians()));
    }

    #[test]
    fn fixed_joints_pass_through() {
        assert_eq!(to_native(JointKind::Fixed, 42.0, AngleInference::Degrees), 42.0);
    }

    #[test]
    fn angle_inference_deserialises_snake_case() {
        let mode: AngleInference = serde_json::from_str("\"degrees\"").unwrap();
        assert_eq!(mode, AngleInference::Degrees);
    }
}
