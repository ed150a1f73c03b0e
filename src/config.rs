// THEORY:
// All tunable behavior of the labeler lives in one serde-friendly tree so a
// capture session can be reproduced from a JSON file, while the handful of
// knobs an operator touches day to day can still be overridden from the
// environment. Precedence is: defaults, then the JSON file, then env vars.
//
// Units: hue is in degrees [0, 360], saturation and value in [0, 255]. Areas in
// `ArrowHeuristics` are in original (pre-magnification) pixels; the pipeline
// scales them by `upscale_factor²`. Stabilizer thresholds are in working
// (magnified) pixels or fractions of the circle radius.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::{fs, path::Path, path::PathBuf, str::FromStr};

/// Number of angle micro sectors.
pub const ANGLE_MICRO_COUNT: u32 = 12;
/// Number of distance micro bins.
pub const DISTANCE_MICRO_COUNT: u32 = 9;
/// Distance micro bins per macro band.
pub const DISTANCE_MICRO_PER_MACRO: u32 = 3;

/// An inclusive HSV window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HsvRange {
    pub hue_min: f32,
    pub hue_max: f32,
    pub sat_min: f32,
    pub sat_max: f32,
    pub val_min: f32,
    pub val_max: f32,
}

impl HsvRange {
    pub const fn new(hue: (f32, f32), sat: (f32, f32), val: (f32, f32)) -> Self {
        Self {
            hue_min: hue.0,
            hue_max: hue.1,
            sat_min: sat.0,
            sat_max: sat.1,
            val_min: val.0,
            val_max: val.1,
        }
    }

    pub fn contains(&self, hue: f32, sat: f32, val: f32) -> bool {
        hue >= self.hue_min
            && hue <= self.hue_max
            && sat >= self.sat_min
            && sat <= self.sat_max
            && val >= self.val_min
            && val <= self.val_max
    }
}

/// Color ranges and component budget for one marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerProfile {
    /// Ranges tried first; OR-ed together.
    pub primary: Vec<HsvRange>,
    /// Wider ranges tried once when the primary ranges yield nothing.
    pub fallback: Vec<HsvRange>,
    /// How many of the largest components survive size filtering.
    pub keep_top: usize,
}

impl MarkerProfile {
    /// The red, heading-carrying arrow. Red wraps around hue 0.
    pub fn reference_default() -> Self {
        Self {
            primary: vec![
                HsvRange::new((0.0, 20.0), (80.0, 255.0), (80.0, 255.0)),
                HsvRange::new((340.0, 360.0), (80.0, 255.0), (80.0, 255.0)),
            ],
            fallback: vec![
                HsvRange::new((0.0, 30.0), (50.0, 255.0), (50.0, 255.0)),
                HsvRange::new((320.0, 360.0), (50.0, 255.0), (50.0, 255.0)),
            ],
            keep_top: 1,
        }
    }

    /// The green target marker.
    pub fn target_default() -> Self {
        Self {
            primary: vec![HsvRange::new((70.0, 180.0), (60.0, 255.0), (60.0, 255.0))],
            fallback: vec![HsvRange::new((50.0, 190.0), (25.0, 255.0), (25.0, 255.0))],
            keep_top: 2,
        }
    }
}

/// Partial `MarkerProfile` from a config file; missing fields keep the marker's defaults.
#[derive(Deserialize)]
struct MarkerProfilePatch {
    primary: Option<Vec<HsvRange>>,
    fallback: Option<Vec<HsvRange>>,
    keep_top: Option<usize>,
}

impl MarkerProfilePatch {
    fn apply(self, base: MarkerProfile) -> MarkerProfile {
        MarkerProfile {
            primary: self.primary.unwrap_or(base.primary),
            fallback: self.fallback.unwrap_or(base.fallback),
            keep_top: self.keep_top.unwrap_or(base.keep_top),
        }
    }
}

fn reference_profile<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MarkerProfile, D::Error> {
    MarkerProfilePatch::deserialize(deserializer).map(|patch| patch.apply(MarkerProfile::reference_default()))
}

fn target_profile<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MarkerProfile, D::Error> {
    MarkerProfilePatch::deserialize(deserializer).map(|patch| patch.apply(MarkerProfile::target_default()))
}

/// Per-group admission caps for the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaCaps {
    pub pair: usize,
    pub angle_micro: usize,
    pub distance_micro: usize,
    pub distance_macro: usize,
    pub total: usize,
}

impl QuotaCaps {
    /// Derives every other cap from the per-pair goal.
    pub fn from_pair(pair: usize) -> Self {
        let distance_micro = pair * ANGLE_MICRO_COUNT as usize;
        Self {
            pair,
            angle_micro: pair * DISTANCE_MICRO_COUNT as usize,
            distance_micro,
            distance_macro: distance_micro * DISTANCE_MICRO_PER_MACRO as usize,
            total: pair * (ANGLE_MICRO_COUNT * DISTANCE_MICRO_COUNT) as usize,
        }
    }
}

impl Default for QuotaCaps {
    fn default() -> Self {
        Self::from_pair(9)
    }
}

/// Operating range of marker separation, in original pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceRange {
    pub min: f64,
    pub max: f64,
}

impl DistanceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// A degenerate range is widened to one pixel.
    pub fn sanitized(self) -> Self {
        if self.max <= self.min {
            Self::new(self.min, self.min + 1.0)
        } else {
            self
        }
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.min * factor, self.max * factor)
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn clamp(&self, distance: f64) -> f64 {
        distance.max(self.min).min(self.max)
    }
}

impl Default for DistanceRange {
    fn default() -> Self {
        Self::new(5.0, 75.0)
    }
}

/// Shape heuristics for the triangle-like reference arrow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrowHeuristics {
    /// Contour area bounds as fractions of the circle area.
    pub area_min_ratio: f64,
    pub area_max_ratio: f64,
    pub min_solidity: f64,
    /// Douglas-Peucker epsilon as a fraction of the contour perimeter.
    pub approx_eps_factor: f64,
    pub min_vertices: usize,
    pub max_vertices: usize,
    /// Blobs smaller than this never reach contour analysis.
    pub min_contour_pixels: f64,
    /// Component floor: max(abs, ratio * circle area).
    pub min_component_area_ratio: f64,
    pub min_component_area_abs: f64,
    /// Primary blob centroid tolerance as a fraction of the radius.
    pub blob_center_tol: f64,
}

impl Default for ArrowHeuristics {
    fn default() -> Self {
        Self {
            area_min_ratio: 0.0012,
            area_max_ratio: 0.06,
            min_solidity: 0.45,
            approx_eps_factor: 0.08,
            min_vertices: 3,
            max_vertices: 7,
            min_contour_pixels: 30.0,
            min_component_area_ratio: 0.005,
            min_component_area_abs: 40.0,
            blob_center_tol: 0.90,
        }
    }
}

/// Thresholds of the temporal filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerConfig {
    pub centroid_alpha: f64,
    pub distance_alpha: f64,
    pub bearing_alpha: f64,
    /// Target farther than this fraction of the radius freezes to the prior state.
    pub target_offset_tol: f64,
    /// Both centroids drifting less than this (px) reuse the prior centroids.
    pub freeze_drift_px: f64,
    /// Centroids beyond `radius * centroid_outside_tol` reject the frame.
    pub centroid_outside_tol: f64,
    /// Raw distance beyond `max_dist * hard_cap_factor` rejects the frame.
    pub hard_cap_factor: f64,
    pub reference_jump_ratio: f64,
    pub target_steady_ratio: f64,
    pub both_jump_reference_ratio: f64,
    pub both_jump_target_ratio: f64,
    pub flip_guard_deg: f64,
    pub flip_guard_distance_px: f64,
    pub flip_guard_shift_px: f64,
    pub distance_drop_ratio: f64,
    pub distance_drop_shift_ratio: f64,
    pub near_center_ratio: f64,
    pub previously_far_ratio: f64,
    /// Largest centroid shift (px) under which the prior micro sector is kept.
    pub label_lock_shift_px: f64,
    pub tiny_movement_ratio: f64,
    pub history_len: usize,
    pub history_votes: usize,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            centroid_alpha: 0.5,
            distance_alpha: 0.35,
            bearing_alpha: 0.30,
            target_offset_tol: 0.7,
            freeze_drift_px: 1.5,
            centroid_outside_tol: 1.20,
            hard_cap_factor: 1.3,
            reference_jump_ratio: 0.45,
            target_steady_ratio: 0.15,
            both_jump_reference_ratio: 0.6,
            both_jump_target_ratio: 0.4,
            flip_guard_deg: 60.0,
            flip_guard_distance_px: 40.0,
            flip_guard_shift_px: 20.0,
            distance_drop_ratio: 0.6,
            distance_drop_shift_ratio: 0.3,
            near_center_ratio: 0.2,
            previously_far_ratio: 0.7,
            label_lock_shift_px: 15.0,
            tiny_movement_ratio: 0.2,
            history_len: 7,
            history_votes: 4,
        }
    }
}

/// Rotation-search heading estimator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingConfig {
    /// Optional grayscale template image; a synthetic triangle is used otherwise.
    pub template_path: Option<PathBuf>,
    pub template_size: u32,
    pub rot_step_deg: u32,
    pub score_threshold: f64,
    /// Heading of the unrotated template (tip up is 90 degrees).
    pub template_heading_offset_deg: f64,
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self {
            template_path: None,
            template_size: 64,
            rot_step_deg: 5,
            score_threshold: 0.30,
            template_heading_offset_deg: 90.0,
        }
    }
}

/// Root configuration of a capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    pub caps: QuotaCaps,
    pub distance_range: DistanceRange,
    #[serde(deserialize_with = "reference_profile")]
    pub reference: MarkerProfile,
    #[serde(deserialize_with = "target_profile")]
    pub target: MarkerProfile,
    pub arrow: ArrowHeuristics,
    pub stabilizer: StabilizerConfig,
    pub heading: HeadingConfig,
    /// Magnification applied before analysis to recover sub-pixel precision.
    pub upscale_factor: f64,
    /// Added to (target direction - heading) to get the bearing.
    pub heading_offset_deg: f64,
    /// Added to the smoothed bearing right before sector classification.
    pub angle_classify_offset_deg: f64,
    /// Side of the tip refinement window; odd and at least 3.
    pub tip_refine_window: u32,
    /// Save cleaned masks next to each raw capture.
    pub debug_save: bool,
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            caps: QuotaCaps::default(),
            distance_range: DistanceRange::default(),
            reference: MarkerProfile::reference_default(),
            target: MarkerProfile::target_default(),
            arrow: ArrowHeuristics::default(),
            stabilizer: StabilizerConfig::default(),
            heading: HeadingConfig::default(),
            upscale_factor: 5.0,
            heading_offset_deg: 90.0,
            angle_classify_offset_deg: 0.0,
            tip_refine_window: 7,
            debug_save: true,
        }
    }
}

impl LabelerConfig {
    /// Reads a JSON config file, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let mut config: LabelerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.apply_lookup(|key| std::env::var(key).ok());
        Ok(config.normalized())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults plus overrides resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_lookup(lookup);
        config.normalized()
    }

    /// Applies the recognized environment-style options.
    pub fn apply_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(pair) = parse_var::<usize, _>(&lookup, "PAIR_CAP") {
            self.caps = QuotaCaps::from_pair(pair);
        }
        if let Some(v) = parse_var(&lookup, "ANGLE_MICRO_CAP") {
            self.caps.angle_micro = v;
        }
        if let Some(v) = parse_var(&lookup, "DIST_MICRO_CAP") {
            self.caps.distance_micro = v;
            if lookup("DIST_MACRO_CAP").is_none() {
                self.caps.distance_macro = v * DISTANCE_MICRO_PER_MACRO as usize;
            }
        }
        if let Some(v) = parse_var(&lookup, "DIST_MACRO_CAP") {
            self.caps.distance_macro = v;
        }
        if let Some(v) = parse_var(&lookup, "TOTAL_CAP") {
            self.caps.total = v;
        }
        if let Some(v) = parse_var(&lookup, "UPSCALE_FACTOR") {
            self.upscale_factor = v;
        }
        if let Some(v) = parse_var(&lookup, "HEADING_OFFSET_DEG") {
            self.heading_offset_deg = v;
        }
        if let Some(v) = parse_var(&lookup, "ANGLE_CLASSIFY_OFFSET_DEG") {
            self.angle_classify_offset_deg = v;
        }
        if let Some(v) = parse_var(&lookup, "TEMPLATE_SCORE_THRESHOLD") {
            self.heading.score_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "TEMPLATE_ROT_STEP") {
            self.heading.rot_step_deg = v;
        }
        if let Some(path) = lookup("TEMPLATE_PATH") {
            self.heading.template_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse_var(&lookup, "TIP_REFINE_WINDOW") {
            self.tip_refine_window = v;
        }
        if let Some(v) = parse_var(&lookup, "MIN_DIST") {
            self.distance_range.min = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_DIST") {
            self.distance_range.max = v;
        }
        if let Some(v) = parse_var(&lookup, "DEBUG_SAVE") {
            self.debug_save = v;
        }
    }

    /// Clamps values that would otherwise break an invariant downstream.
    pub fn normalized(mut self) -> Self {
        if !(self.upscale_factor >= 1.0) {
            self.upscale_factor = 1.0;
        }
        self.tip_refine_window = self.tip_refine_window.max(3);
        if self.tip_refine_window % 2 == 0 {
            self.tip_refine_window += 1;
        }
        self.heading.rot_step_deg = self.heading.rot_step_deg.clamp(1, 360);
        self.heading.template_size = self.heading.template_size.max(16);
        self.distance_range = self.distance_range.sanitized();
        self.stabilizer.history_len = self.stabilizer.history_len.max(1);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_caps_match_the_972_sample_goal() {
        let caps = QuotaCaps::default();
        assert_eq!(caps.pair, 9);
        assert_eq!(caps.angle_micro, 81);
        assert_eq!(caps.distance_micro, 108);
        assert_eq!(caps.distance_macro, 324);
        assert_eq!(caps.total, 972);
    }

    #[test]
    fn pair_cap_alone_derives_the_rest() {
        let config = LabelerConfig::from_lookup(lookup_from(&[("PAIR_CAP", "2")]));
        assert_eq!(config.caps, QuotaCaps::from_pair(2));
        assert_eq!(config.caps.total, 216);
    }

    #[test]
    fn explicit_caps_override_derived_ones() {
        let config = LabelerConfig::from_lookup(lookup_from(&[
            ("PAIR_CAP", "3"),
            ("ANGLE_MICRO_CAP", "10"),
            ("DIST_MICRO_CAP", "20"),
            ("TOTAL_CAP", "50"),
        ]));
        assert_eq!(config.caps.pair, 3);
        assert_eq!(config.caps.angle_micro, 10);
        assert_eq!(config.caps.distance_micro, 20);
        assert_eq!(config.caps.distance_macro, 60);
        assert_eq!(config.caps.total, 50);
    }

    #[test]
    fn tip_window_is_forced_odd_and_at_least_three() {
        let even = LabelerConfig::from_lookup(lookup_from(&[("TIP_REFINE_WINDOW", "8")]));
        assert_eq!(even.tip_refine_window, 9);
        let tiny = LabelerConfig::from_lookup(lookup_from(&[("TIP_REFINE_WINDOW", "1")]));
        assert_eq!(tiny.tip_refine_window, 3);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = LabelerConfig::from_lookup(lookup_from(&[
            ("UPSCALE_FACTOR", "huge"),
            ("HEADING_OFFSET_DEG", "45"),
        ]));
        assert_eq!(config.upscale_factor, 5.0);
        assert_eq!(config.heading_offset_deg, 45.0);
    }

    #[test]
    fn upscale_below_one_is_treated_as_one() {
        let config = LabelerConfig::from_lookup(lookup_from(&[("UPSCALE_FACTOR", "0.5")]));
        assert_eq!(config.upscale_factor, 1.0);
    }

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let config: LabelerConfig =
            serde_json::from_str(r#"{ "upscale_factor": 2.0, "debug_save": false }"#)
                .expect("partial config should parse");
        assert_eq!(config.upscale_factor, 2.0);
        assert!(!config.debug_save);
        assert_eq!(config.caps, QuotaCaps::default());
        assert_eq!(config.distance_range, DistanceRange::new(5.0, 75.0));
    }

    #[test]
    fn partial_nested_sections_keep_their_other_defaults() {
        let config: LabelerConfig = serde_json::from_str(
            r#"{
                "stabilizer": { "freeze_drift_px": 2.0 },
                "caps": { "total": 500 },
                "distance_range": { "max": 90.0 },
                "arrow": { "min_solidity": 0.5 },
                "heading": { "score_threshold": 0.4 },
                "reference": { "keep_top": 3 },
                "target": { "keep_top": 1 }
            }"#,
        )
        .expect("partial nested config should parse");

        assert_eq!(config.stabilizer.freeze_drift_px, 2.0);
        assert_eq!(config.stabilizer.centroid_alpha, StabilizerConfig::default().centroid_alpha);
        assert_eq!(config.stabilizer.history_votes, 4);
        assert_eq!(config.caps.total, 500);
        assert_eq!(config.caps.pair, 9);
        assert_eq!(config.distance_range, DistanceRange::new(5.0, 90.0));
        assert_eq!(config.arrow.min_solidity, 0.5);
        assert_eq!(config.arrow.area_max_ratio, ArrowHeuristics::default().area_max_ratio);
        assert_eq!(config.heading.score_threshold, 0.4);
        assert_eq!(config.heading.rot_step_deg, 5);

        // Each marker falls back to its own color ranges.
        assert_eq!(config.reference.keep_top, 3);
        assert_eq!(config.reference.primary, MarkerProfile::reference_default().primary);
        assert_eq!(config.target.keep_top, 1);
        assert_eq!(config.target.fallback, MarkerProfile::target_default().fallback);
    }

    #[test]
    fn degenerate_distance_range_is_widened() {
        let range = DistanceRange::new(10.0, 10.0).sanitized();
        assert_eq!(range.max, 11.0);
    }
}
