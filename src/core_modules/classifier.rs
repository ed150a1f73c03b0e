// THEORY:
// The `Classifier` maps continuous polar coordinates onto the fixed label
// vocabulary of the dataset. Bearings snap to the nearest of 12 sector centers
// spaced 30 degrees apart (ties go to the lower index); distances fall into 9
// equal-width bins over the operating range. Every micro label has exactly one
// macro parent, so macro labels are derived, never classified independently.

use crate::config::{DISTANCE_MICRO_COUNT, DISTANCE_MICRO_PER_MACRO, DistanceRange};
use crate::core_modules::utils::geometry::circular_diff_deg;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Four-way bearing label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleMacro {
    North,
    West,
    South,
    East,
}

/// Twelve-way bearing label, in index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AngleMicro {
    Nne,
    Nn,
    Nnw,
    Wnw,
    Ww,
    Wsw,
    Ssw,
    Ss,
    Sse,
    Ese,
    Ee,
    Ene,
}

/// Three-way distance label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMacro {
    Near,
    Medium,
    Far,
}

/// Nine-way distance label; the index is the bin number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DistanceMicro(u8);

impl Serialize for DistanceMicro {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel(pub String);

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown label {:?}", self.0)
    }
}

impl std::error::Error for UnknownLabel {}

impl AngleMacro {
    pub const ALL: [AngleMacro; 4] = [AngleMacro::North, AngleMacro::West, AngleMacro::South, AngleMacro::East];

    pub fn name(&self) -> &'static str {
        match self {
            AngleMacro::North => "north",
            AngleMacro::West => "west",
            AngleMacro::South => "south",
            AngleMacro::East => "east",
        }
    }
}

impl AngleMicro {
    pub const ALL: [AngleMicro; 12] = [
        AngleMicro::Nne,
        AngleMicro::Nn,
        AngleMicro::Nnw,
        AngleMicro::Wnw,
        AngleMicro::Ww,
        AngleMicro::Wsw,
        AngleMicro::Ssw,
        AngleMicro::Ss,
        AngleMicro::Sse,
        AngleMicro::Ese,
        AngleMicro::Ee,
        AngleMicro::Ene,
    ];

    /// Sector centers, parallel to `ALL`.
    const CENTERS_DEG: [f64; 12] = [
        60.0, 90.0, 120.0, 150.0, 180.0, 210.0, 240.0, 270.0, 300.0, 330.0, 0.0, 30.0,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn center_deg(&self) -> f64 {
        Self::CENTERS_DEG[self.index()]
    }

    pub fn macro_label(&self) -> AngleMacro {
        AngleMacro::ALL[self.index() / 3]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AngleMicro::Nne => "nne",
            AngleMicro::Nn => "nn",
            AngleMicro::Nnw => "nnw",
            AngleMicro::Wnw => "wnw",
            AngleMicro::Ww => "ww",
            AngleMicro::Wsw => "wsw",
            AngleMicro::Ssw => "ssw",
            AngleMicro::Ss => "ss",
            AngleMicro::Sse => "sse",
            AngleMicro::Ese => "ese",
            AngleMicro::Ee => "ee",
            AngleMicro::Ene => "ene",
        }
    }
}

impl DistanceMacro {
    pub const ALL: [DistanceMacro; 3] = [DistanceMacro::Near, DistanceMacro::Medium, DistanceMacro::Far];

    pub fn name(&self) -> &'static str {
        match self {
            DistanceMacro::Near => "near",
            DistanceMacro::Medium => "medium",
            DistanceMacro::Far => "far",
        }
    }
}

impl DistanceMicro {
    pub fn all() -> impl Iterator<Item = DistanceMicro> {
        (0..DISTANCE_MICRO_COUNT as u8).map(DistanceMicro)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn macro_label(&self) -> DistanceMacro {
        DistanceMacro::ALL[self.index() / DISTANCE_MICRO_PER_MACRO as usize]
    }

    /// 1-based position inside the macro band.
    pub fn ordinal(&self) -> usize {
        self.index() % DISTANCE_MICRO_PER_MACRO as usize + 1
    }
}

impl fmt::Display for AngleMacro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AngleMicro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DistanceMacro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DistanceMicro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.macro_label().name(), self.ordinal())
    }
}

impl FromStr for AngleMacro {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AngleMacro::ALL
            .into_iter()
            .find(|label| label.name() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

impl FromStr for AngleMicro {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AngleMicro::ALL
            .into_iter()
            .find(|label| label.name() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

impl FromStr for DistanceMacro {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DistanceMacro::ALL
            .into_iter()
            .find(|label| label.name() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

impl FromStr for DistanceMicro {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DistanceMicro::all()
            .find(|label| label.to_string() == s.trim())
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// Nearest sector center; ties resolve to the lower index.
pub fn classify_angle(bearing_deg: f64) -> AngleMicro {
    let mut best = AngleMicro::ALL[0];
    let mut best_diff = f64::INFINITY;
    for label in AngleMicro::ALL {
        let diff = circular_diff_deg(bearing_deg, label.center_deg());
        if diff < best_diff {
            best = label;
            best_diff = diff;
        }
    }
    best
}

/// Equal-width bin of `distance` over `range`; out-of-range values land in the end bins.
pub fn classify_distance(distance: f64, range: &DistanceRange) -> DistanceMicro {
    let range = range.sanitized();
    let width = range.span() / DISTANCE_MICRO_COUNT as f64;
    let raw = ((range.clamp(distance) - range.min) / width).floor();
    let bin = (raw.max(0.0) as usize).min(DISTANCE_MICRO_COUNT as usize - 1);
    DistanceMicro(bin as u8)
}

/// Pixel span of one distance bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DistanceBin {
    pub label: DistanceMicro,
    pub start: f64,
    pub end: f64,
}

/// The 9 bins over `range`, in order.
pub fn distance_bins(range: &DistanceRange) -> Vec<DistanceBin> {
    let range = range.sanitized();
    let width = range.span() / DISTANCE_MICRO_COUNT as f64;
    DistanceMicro::all()
        .map(|label| DistanceBin {
            label,
            start: range.min + width * label.index() as f64,
            end: range.min + width * (label.index() + 1) as f64,
        })
        .collect()
}

/// Upper bounds of the near and medium bands.
pub fn macro_thresholds(range: &DistanceRange) -> (f64, f64) {
    let range = range.sanitized();
    let band = range.span() / DistanceMacro::ALL.len() as f64;
    (range.min + band, range.min + 2.0 * band)
}

/// Full label of one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Classification {
    pub angle_micro: AngleMicro,
    pub angle_macro: AngleMacro,
    pub distance_micro: DistanceMicro,
    pub distance_macro: DistanceMacro,
}

impl Classification {
    pub fn new(angle_micro: AngleMicro, distance_micro: DistanceMicro) -> Self {
        Self {
            angle_micro,
            angle_macro: angle_micro.macro_label(),
            distance_micro,
            distance_macro: distance_micro.macro_label(),
        }
    }
}
