// THEORY:
// Every frame that does not become a sample leaves through one of these variants.
// They are expected outcomes of a noisy capture stream rather than bugs, so the
// pipeline returns them as values and the caller simply skips persistence.
// Quota skips are deliberately absent here: they live in `quota::Admission`.

use thiserror::Error;

/// Why a single frame was dropped before it could be labeled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LabelError {
    /// No qualifying blob or contour was found for one of the two markers.
    #[error("detection failure: {0}")]
    DetectionFailure(String),
    /// A centroid left the circle, the distance exceeded the hard cap, or both
    /// markers jumped at once.
    #[error("implausible motion: {0}")]
    ImplausibleMotion(String),
    /// The sector changed while the markers barely moved.
    #[error("inconsistent label: {0}")]
    InconsistentLabel(String),
}

impl LabelError {
    /// Short machine-friendly name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LabelError::DetectionFailure(_) => "detection_failure",
            LabelError::ImplausibleMotion(_) => "implausible_motion",
            LabelError::InconsistentLabel(_) => "inconsistent_label",
        }
    }
}
