// THEORY:
// The `TemporalStabilizer` is the labeler's memory. Per-frame measurements are
// noisy: centroids wobble by a pixel, the tip jumps between vertices, and now
// and then a same-colored glyph is mistaken for a marker. Turning that stream
// into a label that only changes when the scene really changes requires
// smoothing, plausibility checks against the last accepted frame, and a vote
// over recent labels.
//
// Key architectural principles:
// 1.  **Explicit Session State**: Everything remembered between frames lives in
//     `ProcessState`, owned by one stabilizer, owned by one capture session.
//     Nothing is global; two sessions never interfere.
// 2.  **Transactional Update**: Each frame works on a copy of the state. The copy
//     is committed only when the frame is accepted, so a rejected frame leaves
//     no trace, not even in the smoothing accumulators or the vote history.
// 3.  **Freeze, Don't Guess**: When a measurement is indistinguishable from
//     noise, or looks like a false detection, the stabilizer reuses the last
//     accepted values instead of inventing intermediate ones.
// 4.  **Wraparound-safe Smoothing**: Bearings are averaged as unit vectors so
//     359 and 1 degrees average to 0, not 180.
// 5.  **Hysteresis**: A new micro sector must win 4 of the last 7 votes before
//     it replaces the held label.
//
// Known limitation: a marker drifting slowly, each frame below the freeze and
// label-lock thresholds, can keep a stale label until a larger move happens.

use crate::config::{DistanceRange, StabilizerConfig};
use crate::core_modules::classifier::{AngleMicro, Classification, classify_angle, classify_distance};
use crate::core_modules::frame::CircleGeometry;
use crate::core_modules::polar_resolver::{PolarReading, resolve};
use crate::core_modules::utils::geometry::{Point2, circular_diff_deg, distance, max_axis_shift, wrap_deg};
use crate::error::LabelError;
use log::debug;
use serde::Serialize;
use std::collections::VecDeque;

/// One frame's raw measurement, in working pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeasurement {
    pub reference: Point2,
    pub target: Point2,
    pub heading_deg: f64,
}

/// Frame-independent geometry the stabilizer judges against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StabilizerContext {
    pub circle: CircleGeometry,
    pub range: DistanceRange,
    pub heading_offset_deg: f64,
    pub classify_offset_deg: f64,
}

/// A rule that replaced fresh values with remembered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freeze {
    /// Target too far from the center; prior centroids reused.
    TargetOffCenter,
    /// Both centroids drifted less than the noise floor.
    SubPixelDrift,
    /// Reference jumped while the target held still.
    ReferenceJump,
    /// Bearing flipped without matching movement.
    AngleFlip,
    /// Distance collapsed while a centroid moved a lot.
    DistanceDrop,
    /// Reference landed at the center right after a far reading.
    NearCenter,
    /// Movement too small to justify a sector change.
    LabelLock,
    /// New sector has not yet won the vote.
    Hysteresis,
}

/// Fixed-length ring of recent micro-sector votes.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelHistory {
    capacity: usize,
    votes: VecDeque<AngleMicro>,
}

impl LabelHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            votes: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, label: AngleMicro) {
        self.votes.push_back(label);
        while self.votes.len() > self.capacity {
            self.votes.pop_front();
        }
    }

    pub fn count(&self, label: AngleMicro) -> usize {
        self.votes.iter().filter(|vote| **vote == label).count()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// The last accepted frame plus smoothing accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessState {
    pub last_reference: Option<Point2>,
    pub last_target: Option<Point2>,
    pub last_heading_deg: Option<f64>,
    /// Smoothed bearing, before the classify offset.
    pub last_bearing_deg: Option<f64>,
    pub last_distance: Option<f64>,
    pub last_micro: Option<AngleMicro>,
    pub smooth_reference: Option<Point2>,
    pub smooth_target: Option<Point2>,
    pub smooth_distance: Option<f64>,
    pub smooth_bearing_vec: Option<(f64, f64)>,
    pub history: LabelHistory,
}

impl ProcessState {
    pub fn new(history_len: usize) -> Self {
        Self {
            last_reference: None,
            last_target: None,
            last_heading_deg: None,
            last_bearing_deg: None,
            last_distance: None,
            last_micro: None,
            smooth_reference: None,
            smooth_target: None,
            smooth_distance: None,
            smooth_bearing_vec: None,
            history: LabelHistory::new(history_len),
        }
    }

    fn prior_centroids(&self) -> Option<(Point2, Point2)> {
        Some((self.last_reference?, self.last_target?))
    }
}

/// Accepted, stabilized values for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StableReading {
    pub reference: Point2,
    pub target: Point2,
    pub heading_deg: f64,
    /// Polar reading of the stabilized centroids before temporal smoothing.
    pub polar: PolarReading,
    /// Smoothed bearing.
    pub bearing_deg: f64,
    /// Bearing the sector was classified from (classify offset applied).
    pub classified_bearing_deg: f64,
    /// Smoothed distance.
    pub distance: f64,
    pub labels: Classification,
    pub freezes: Vec<Freeze>,
}

pub struct TemporalStabilizer {
    config: StabilizerConfig,
    state: ProcessState,
}

fn ema(alpha: f64, fresh: f64, accumulated: Option<f64>) -> f64 {
    match accumulated {
        Some(previous) => alpha * fresh + (1.0 - alpha) * previous,
        None => fresh,
    }
}

fn ema_point(alpha: f64, fresh: Point2, accumulated: Option<Point2>) -> Point2 {
    (
        ema(alpha, fresh.0, accumulated.map(|p| p.0)),
        ema(alpha, fresh.1, accumulated.map(|p| p.1)),
    )
}

impl TemporalStabilizer {
    pub fn new(config: StabilizerConfig) -> Self {
        let state = ProcessState::new(config.history_len);
        Self { config, state }
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    /// Forgets every previous frame.
    pub fn reset(&mut self) {
        self.state = ProcessState::new(self.config.history_len);
    }

    /// Runs one frame through the filter; the state changes only on `Ok`.
    pub fn update(&mut self, measurement: &FrameMeasurement, ctx: &StabilizerContext) -> Result<StableReading, LabelError> {
        let cfg = self.config;
        let prior = &self.state;
        let mut next = prior.clone();
        let radius = ctx.circle.radius;
        let mut freezes = Vec::new();
        let prior_centroids = prior.prior_centroids();

        // --- 1. Target far off center: trust the prior frame instead ---
        let (mut candidate_ref, mut candidate_tgt) = (measurement.reference, measurement.target);
        if ctx.circle.offset(candidate_tgt) > radius * cfg.target_offset_tol {
            if let Some((last_ref, last_tgt)) = prior_centroids {
                candidate_ref = last_ref;
                candidate_tgt = last_tgt;
                freezes.push(Freeze::TargetOffCenter);
            }
        }

        // --- 2. Plausibility of the candidates ---
        let outside_limit = radius * cfg.centroid_outside_tol;
        if ctx.circle.offset(candidate_ref) > outside_limit {
            return Err(LabelError::ImplausibleMotion("Reference centroid outside the radar circle".into()));
        }
        if ctx.circle.offset(candidate_tgt) > outside_limit {
            return Err(LabelError::ImplausibleMotion("Target centroid outside the radar circle".into()));
        }
        let mut revert_to_prior = false;
        if let Some((last_ref, last_tgt)) = prior_centroids {
            let reference_jump = distance(candidate_ref, last_ref);
            let target_jump = distance(candidate_tgt, last_tgt);
            if reference_jump > radius * cfg.both_jump_reference_ratio
                && target_jump > radius * cfg.both_jump_target_ratio
            {
                return Err(LabelError::ImplausibleMotion(format!(
                    "Centroid jump too large (reference {reference_jump:.1}px, target {target_jump:.1}px)"
                )));
            }
            if reference_jump > radius * cfg.reference_jump_ratio && target_jump < radius * cfg.target_steady_ratio {
                revert_to_prior = true;
            }
        }

        // --- 3. Centroid smoothing and noise freeze ---
        let mut reference = ema_point(cfg.centroid_alpha, candidate_ref, prior.smooth_reference);
        let mut target = ema_point(cfg.centroid_alpha, candidate_tgt, prior.smooth_target);
        next.smooth_reference = Some(reference);
        next.smooth_target = Some(target);
        if let Some((last_ref, last_tgt)) = prior_centroids {
            if revert_to_prior {
                reference = last_ref;
                target = last_tgt;
                freezes.push(Freeze::ReferenceJump);
            } else if distance(reference, last_ref) < cfg.freeze_drift_px
                && distance(target, last_tgt) < cfg.freeze_drift_px
            {
                reference = last_ref;
                target = last_tgt;
                freezes.push(Freeze::SubPixelDrift);
            }
        }

        // --- 4. Hard distance cap ---
        let raw_distance = distance(reference, target);
        let hard_cap = ctx.range.max * cfg.hard_cap_factor;
        if raw_distance > hard_cap {
            return Err(LabelError::ImplausibleMotion(format!(
                "Distance exceeds hard cap ({raw_distance:.1} > {hard_cap:.1})"
            )));
        }

        // --- 5. Polar resolution and flip/drop freezes ---
        let mut heading_deg = measurement.heading_deg;
        let mut polar = resolve(reference, target, heading_deg, ctx.heading_offset_deg, &ctx.range);
        let mut bearing = polar.bearing_deg;
        let mut dist = polar.distance;
        let mut labels_frozen = false;

        if let (Some(last_bearing), Some(last_distance), Some((last_ref, last_tgt))) =
            (prior.last_bearing_deg, prior.last_distance, prior_centroids)
        {
            let shift = max_axis_shift((reference, target), (last_ref, last_tgt));
            if (dist - last_distance).abs() < cfg.flip_guard_distance_px
                && shift < cfg.flip_guard_shift_px
                && circular_diff_deg(bearing, last_bearing) > cfg.flip_guard_deg
            {
                reference = last_ref;
                target = last_tgt;
                heading_deg = prior.last_heading_deg.unwrap_or(heading_deg);
                polar = resolve(reference, target, heading_deg, ctx.heading_offset_deg, &ctx.range);
                bearing = last_bearing;
                dist = polar.distance;
                freezes.push(Freeze::AngleFlip);
            }
        }

        if let (Some(last_distance), Some(_)) = (prior.last_distance, prior.last_micro) {
            let shift = prior_centroids
                .map(|last| max_axis_shift((reference, target), last))
                .unwrap_or(0.0);
            let freeze = if dist / last_distance.max(1.0) < cfg.distance_drop_ratio
                && shift > radius * cfg.distance_drop_shift_ratio
            {
                Some(Freeze::DistanceDrop)
            } else if ctx.circle.offset(reference) < radius * cfg.near_center_ratio
                && last_distance > radius * cfg.previously_far_ratio
            {
                Some(Freeze::NearCenter)
            } else {
                None
            };
            if let Some(reason) = freeze {
                dist = last_distance;
                bearing = prior.last_bearing_deg.unwrap_or(bearing);
                labels_frozen = true;
                freezes.push(reason);
            }
        }

        // --- 6. Temporal smoothing of distance and bearing ---
        let smoothed_distance = ema(cfg.distance_alpha, dist, prior.smooth_distance);
        next.smooth_distance = Some(smoothed_distance);
        let fresh_vec = (bearing.to_radians().cos(), bearing.to_radians().sin());
        let mut vec = match prior.smooth_bearing_vec {
            Some(acc) => (
                cfg.bearing_alpha * fresh_vec.0 + (1.0 - cfg.bearing_alpha) * acc.0,
                cfg.bearing_alpha * fresh_vec.1 + (1.0 - cfg.bearing_alpha) * acc.1,
            ),
            None => fresh_vec,
        };
        let norm = vec.0.hypot(vec.1);
        if norm > 0.0 {
            vec = (vec.0 / norm, vec.1 / norm);
        }
        next.smooth_bearing_vec = Some(vec);
        let smoothed_bearing = wrap_deg(vec.1.atan2(vec.0).to_degrees());

        // --- 7. Classification with label lock and hysteresis ---
        let classified_bearing = wrap_deg(smoothed_bearing + ctx.classify_offset_deg);
        let mut micro = classify_angle(classified_bearing);
        if let Some(last_micro) = prior.last_micro {
            if labels_frozen {
                micro = last_micro;
            } else {
                let shift = prior_centroids
                    .map(|last| max_axis_shift((reference, target), last))
                    .unwrap_or(f64::INFINITY);
                if shift < cfg.label_lock_shift_px && micro != last_micro {
                    micro = last_micro;
                    freezes.push(Freeze::LabelLock);
                }
            }
        }

        // Every accepted frame votes, changed or not.
        next.history.push(micro);
        if let Some(last_micro) = prior.last_micro {
            if micro != last_micro {
                let distance_delta = (smoothed_distance - prior.last_distance.unwrap_or(smoothed_distance)).abs();
                let max_jump = prior_centroids
                    .map(|(last_ref, last_tgt)| distance(reference, last_ref).max(distance(target, last_tgt)))
                    .unwrap_or(0.0);
                if distance_delta < radius * cfg.tiny_movement_ratio && max_jump < radius * cfg.tiny_movement_ratio {
                    return Err(LabelError::InconsistentLabel("Inconsistent angle with tiny movement".into()));
                }
                if next.history.count(micro) < cfg.history_votes {
                    micro = last_micro;
                    freezes.push(Freeze::Hysteresis);
                }
            }
        }

        let labels = Classification::new(micro, classify_distance(smoothed_distance, &ctx.range));

        // --- 8. Commit ---
        next.last_reference = Some(reference);
        next.last_target = Some(target);
        next.last_heading_deg = Some(heading_deg);
        next.last_bearing_deg = Some(smoothed_bearing);
        next.last_distance = Some(smoothed_distance);
        next.last_micro = Some(micro);
        self.state = next;

        if !freezes.is_empty() {
            debug!("Stabilizer applied {:?}", freezes);
        }
        Ok(StableReading {
            reference,
            target,
            heading_deg,
            polar,
            bearing_deg: smoothed_bearing,
            classified_bearing_deg: classified_bearing,
            distance: smoothed_distance,
            labels,
            freezes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::{AngleMacro, DistanceMacro};
    use approx::assert_abs_diff_eq;

    fn ctx() -> StabilizerContext {
        StabilizerContext {
            circle: CircleGeometry::new((100.0, 100.0), 100.0),
            range: DistanceRange::new(5.0, 75.0),
            heading_offset_deg: 90.0,
            classify_offset_deg: 0.0,
        }
    }

    fn frame(reference: Point2, target: Point2, heading_deg: f64) -> FrameMeasurement {
        FrameMeasurement {
            reference,
            target,
            heading_deg,
        }
    }

    fn primed() -> TemporalStabilizer {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 90.0), &ctx())
            .expect("first frame");
        stabilizer
    }

    #[test]
    fn first_frame_is_taken_verbatim() {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 90.0), &ctx())
            .expect("accepted");
        assert_abs_diff_eq!(reading.bearing_deg, 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(reading.distance, 40.0);
        assert_eq!(reading.labels.angle_micro, AngleMicro::Nn);
        assert_eq!(reading.labels.angle_macro, AngleMacro::North);
        assert_eq!(reading.labels.distance_macro, DistanceMacro::Medium);
        assert!(reading.freezes.is_empty());
        assert_eq!(stabilizer.state().history.len(), 1);
    }

    #[test]
    fn sub_pixel_noise_never_flips_the_label() {
        let mut stabilizer = primed();
        // Headings alternate so the raw bearing swaps between nn and nne.
        let noisy = [
            ((100.4, 100.3), (100.2, 60.5), 70.0),
            ((99.7, 100.1), (99.6, 59.8), 90.0),
            ((100.3, 99.8), (100.5, 60.2), 70.0),
            ((99.9, 100.4), (99.8, 59.7), 90.0),
            ((100.2, 100.2), (100.1, 60.4), 70.0),
        ];
        for (reference, target, heading) in noisy {
            let reading = stabilizer
                .update(&frame(reference, target, heading), &ctx())
                .expect("accepted");
            assert_eq!(reading.labels.angle_micro, AngleMicro::Nn);
            assert!(reading.freezes.contains(&Freeze::SubPixelDrift));
            assert_eq!(reading.reference, (100.0, 100.0));
        }
    }

    #[test]
    fn centroid_outside_the_circle_is_rejected_without_touching_state() {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        let before = stabilizer.state().clone();
        let err = stabilizer
            .update(&frame((100.0, 225.0), (100.0, 150.0), 90.0), &ctx())
            .expect_err("reference is 125px out");
        assert!(matches!(err, LabelError::ImplausibleMotion(_)));
        assert_eq!(stabilizer.state(), &before);
    }

    #[test]
    fn simultaneous_large_jumps_are_rejected() {
        let mut stabilizer = primed();
        let before = stabilizer.state().clone();
        let err = stabilizer
            .update(&frame((165.0, 100.0), (100.0, 115.0), 90.0), &ctx())
            .expect_err("both jumped");
        assert!(err.to_string().contains("Centroid jump too large"));
        assert_eq!(stabilizer.state(), &before);
    }

    #[test]
    fn distance_beyond_the_hard_cap_is_rejected() {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        // 100px apart; the cap is 75 * 1.3 = 97.5.
        let err = stabilizer
            .update(&frame((100.0, 150.0), (100.0, 50.0), 90.0), &ctx())
            .expect_err("too far apart");
        assert!(err.to_string().contains("hard cap"));
    }

    #[test]
    fn lone_reference_jump_reverts_to_prior_centroids() {
        let mut stabilizer = primed();
        let reading = stabilizer
            .update(&frame((150.0, 100.0), (100.5, 60.0), 90.0), &ctx())
            .expect("reverted, not rejected");
        assert!(reading.freezes.contains(&Freeze::ReferenceJump));
        assert_eq!(reading.reference, (100.0, 100.0));
        assert_eq!(reading.target, (100.0, 60.0));
    }

    #[test]
    fn sector_change_with_tiny_movement_is_inconsistent() {
        let mut stabilizer = primed();
        let before = stabilizer.state().clone();
        // Both markers move 32px (16px after smoothing) and the arrow turns by 58 degrees.
        let err = stabilizer
            .update(&frame((132.0, 100.0), (132.0, 60.0), 32.0), &ctx())
            .expect_err("inconsistent");
        assert_eq!(
            err,
            LabelError::InconsistentLabel("Inconsistent angle with tiny movement".into())
        );
        assert_eq!(stabilizer.state(), &before);
    }

    /// Stabilizer with smoothing disabled, so every frame is taken at face value.
    fn unsmoothed() -> TemporalStabilizer {
        TemporalStabilizer::new(StabilizerConfig {
            centroid_alpha: 1.0,
            distance_alpha: 1.0,
            bearing_alpha: 1.0,
            ..StabilizerConfig::default()
        })
    }

    fn assert_label_memory_kept(before: &ProcessState, after: &ProcessState) {
        assert_eq!(after.last_micro, before.last_micro);
        let (Some(old), Some(new)) = (before.last_distance, after.last_distance) else {
            panic!("distance memory lost");
        };
        assert_abs_diff_eq!(new, old, epsilon = 1e-9);
    }

    #[test]
    fn target_far_off_center_reuses_the_prior_centroids() {
        let mut stabilizer = primed();
        let before = stabilizer.state().clone();
        // 75px from the center, beyond 0.7 of the radius.
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (100.0, 25.0), 90.0), &ctx())
            .expect("frozen, not rejected");
        assert!(reading.freezes.contains(&Freeze::TargetOffCenter));
        assert_eq!(reading.reference, (100.0, 100.0));
        assert_eq!(reading.target, (100.0, 60.0));
        assert_eq!(stabilizer.state().last_target, before.last_target);
        assert_eq!(stabilizer.state().last_reference, before.last_reference);
        assert_label_memory_kept(&before, stabilizer.state());
    }

    #[test]
    fn bearing_flip_without_movement_keeps_the_prior_heading() {
        let mut stabilizer = primed();
        let before = stabilizer.state().clone();
        // Same centroids, arrow suddenly reported pointing left: bearing 90 -> 0.
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 180.0), &ctx())
            .expect("frozen, not rejected");
        assert!(reading.freezes.contains(&Freeze::AngleFlip));
        assert_abs_diff_eq!(reading.heading_deg, 90.0);
        assert_abs_diff_eq!(reading.bearing_deg, 90.0, epsilon = 1e-9);
        assert_eq!(reading.labels.angle_micro, AngleMicro::Nn);
        assert_eq!(stabilizer.state().last_heading_deg, Some(90.0));
        assert_label_memory_kept(&before, stabilizer.state());
    }

    #[test]
    fn collapsing_distance_with_a_large_shift_is_frozen() {
        let mut stabilizer = primed();
        let before = stabilizer.state().clone();
        // Smoothed target lands at (100, 95): 5px away after 40px, shifted 35px (> 0.3r).
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (100.0, 130.0), 90.0), &ctx())
            .expect("frozen, not rejected");
        assert!(reading.freezes.contains(&Freeze::DistanceDrop));
        assert_abs_diff_eq!(reading.distance, 40.0, epsilon = 1e-9);
        assert_eq!(reading.labels.angle_micro, AngleMicro::Nn);
        assert_eq!(reading.labels.distance_macro, DistanceMacro::Medium);
        assert_label_memory_kept(&before, stabilizer.state());
    }

    #[test]
    fn reference_snapping_to_center_after_a_far_reading_is_frozen() {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        // 75px apart, above 0.7 of the radius.
        stabilizer
            .update(&frame((100.0, 140.0), (100.0, 65.0), 90.0), &ctx())
            .expect("first frame");
        let before = stabilizer.state().clone();
        // Smoothed reference moves to (100, 118): 18px from the center (< 0.2r).
        let reading = stabilizer
            .update(&frame((100.0, 96.0), (100.0, 65.0), 90.0), &ctx())
            .expect("frozen, not rejected");
        assert!(reading.freezes.contains(&Freeze::NearCenter));
        assert!(!reading.freezes.contains(&Freeze::DistanceDrop));
        assert_abs_diff_eq!(reading.distance, 75.0, epsilon = 1e-9);
        assert_label_memory_kept(&before, stabilizer.state());
    }

    #[test]
    fn small_movement_cannot_change_the_sector() {
        let mut stabilizer = unsmoothed();
        stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 90.0), &ctx())
            .expect("first frame");
        let before = stabilizer.state().clone();
        // Heading 50 puts the bearing at 130 (nnw) without moving either marker.
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 50.0), &ctx())
            .expect("locked, not rejected");
        assert!(reading.freezes.contains(&Freeze::LabelLock));
        assert!(!reading.freezes.contains(&Freeze::AngleFlip));
        assert_abs_diff_eq!(reading.bearing_deg, 130.0, epsilon = 1e-9);
        assert_eq!(reading.labels.angle_micro, AngleMicro::Nn);
        assert_label_memory_kept(&before, stabilizer.state());
    }

    #[test]
    fn new_sector_is_committed_once_it_wins_the_vote() {
        let mut stabilizer = unsmoothed();
        stabilizer
            .update(&frame((100.0, 100.0), (100.0, 60.0), 90.0), &ctx())
            .expect("first frame");
        // Target now 40px to the left of the arrow (ww). Both markers bob by
        // 25px between frames so every change counts as real movement.
        let frames = [
            ((100.0, 125.0), (60.0, 125.0)),
            ((100.0, 100.0), (60.0, 100.0)),
            ((100.0, 125.0), (60.0, 125.0)),
            ((100.0, 100.0), (60.0, 100.0)),
        ];
        for (n, (reference, target)) in frames.into_iter().enumerate() {
            let reading = stabilizer
                .update(&frame(reference, target, 90.0), &ctx())
                .expect("accepted");
            if n < 3 {
                assert_eq!(reading.labels.angle_micro, AngleMicro::Nn, "frame {n}");
                assert!(reading.freezes.contains(&Freeze::Hysteresis), "frame {n}");
                assert_eq!(stabilizer.state().last_micro, Some(AngleMicro::Nn));
            } else {
                assert_eq!(reading.labels.angle_micro, AngleMicro::Ww);
                assert_eq!(reading.labels.angle_macro, AngleMacro::West);
                assert!(reading.freezes.is_empty(), "{:?}", reading.freezes);
            }
        }
        assert_eq!(stabilizer.state().last_micro, Some(AngleMicro::Ww));
        assert_eq!(stabilizer.state().history.count(AngleMicro::Ww), 4);
        assert_eq!(stabilizer.state().history.len(), 5);
    }

    #[test]
    fn bearing_smoothing_survives_wraparound() {
        let mut stabilizer = TemporalStabilizer::new(StabilizerConfig::default());
        // Target to the right with heading 90 gives bearing 0.
        stabilizer
            .update(&frame((100.0, 100.0), (140.0, 100.0), 90.0), &ctx())
            .expect("first");
        // Slightly below the horizontal: bearing ~355.
        let reading = stabilizer
            .update(&frame((100.0, 100.0), (140.0, 103.5), 90.0), &ctx())
            .expect("second");
        assert!(
            reading.bearing_deg > 350.0 || reading.bearing_deg < 1.0,
            "bearing was {}",
            reading.bearing_deg
        );
        assert_eq!(reading.labels.angle_micro, AngleMicro::Ee);
    }

    #[test]
    fn history_keeps_only_the_latest_votes() {
        let mut history = LabelHistory::new(7);
        for _ in 0..5 {
            history.push(AngleMicro::Nn);
        }
        for _ in 0..4 {
            history.push(AngleMicro::Ww);
        }
        assert_eq!(history.len(), 7);
        assert_eq!(history.count(AngleMicro::Nn), 3);
        assert_eq!(history.count(AngleMicro::Ww), 4);
    }

    #[test]
    fn reset_forgets_everything() {
        let mut stabilizer = primed();
        stabilizer.reset();
        assert_eq!(stabilizer.state(), &ProcessState::new(7));
    }
}
