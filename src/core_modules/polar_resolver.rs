// THEORY:
// The `PolarResolver` expresses the target in the reference marker's own frame.
// The on-screen direction of `target - reference` is rotated by the reference
// heading, and a fixed offset lines "straight ahead" up with the classifier's
// north sector. Distance is the plain Euclidean separation, clamped to the
// operating range, with a flag recording whether clamping happened.

use crate::config::DistanceRange;
use crate::core_modules::utils::geometry::{Point2, distance, screen_angle_deg, wrap_deg};
use serde::Serialize;

/// Reference-relative polar coordinates of the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolarReading {
    /// On-screen direction reference -> target.
    pub target_dir_deg: f64,
    /// Heading the bearing was measured against.
    pub heading_deg: f64,
    /// Reference-relative bearing in [0, 360).
    pub bearing_deg: f64,
    pub raw_distance: f64,
    /// `raw_distance` clamped into the operating range.
    pub distance: f64,
    pub clamped: bool,
}

/// Bearing and clamped distance of `target` as seen from `reference`.
pub fn resolve(
    reference: Point2,
    target: Point2,
    heading_deg: f64,
    heading_offset_deg: f64,
    range: &DistanceRange,
) -> PolarReading {
    let target_dir_deg = screen_angle_deg(reference, target);
    let raw_distance = distance(reference, target);
    let clamped_distance = range.clamp(raw_distance);
    PolarReading {
        target_dir_deg,
        heading_deg: wrap_deg(heading_deg),
        bearing_deg: wrap_deg(target_dir_deg - heading_deg + heading_offset_deg),
        raw_distance,
        distance: clamped_distance,
        clamped: (clamped_distance - raw_distance).abs() >= 1e-3,
    }
}

impl PolarReading {
    /// Same reading with distances divided by `scale`.
    pub fn unscaled(&self, scale: f64) -> Self {
        Self {
            raw_distance: self.raw_distance / scale,
            distance: self.distance / scale,
            ..*self
        }
    }
}
