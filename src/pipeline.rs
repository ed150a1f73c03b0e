// THEORY:
// The `pipeline` module is the top-level API of the labeler. It wires the
// per-layer modules into one capture flow and owns the only state that
// survives between frames.
//
// Key architectural principles:
// 1.  **Session Object**: A `CaptureSession` owns its configuration, template
//     library, temporal stabilizer and dataset curator. Two sessions never share
//     state; a long-running process keeps one and feeds it every capture.
// 2.  **Sequential Frames**: One capture runs start to finish before the next.
//     `SessionHandle` wraps the session in an async mutex so overlapping callers
//     queue up instead of interleaving stabilizer updates or ledger writes.
// 3.  **Explicit Outcomes**: A capture ends as `Saved`, `Skipped` (quota) or
//     `Dropped` (analysis failure). Only `Saved` leaves files behind.

use crate::config::LabelerConfig;
use crate::core_modules::blob_cleaner::{Blob, CleanerSettings, blob_cleaner};
use crate::core_modules::classifier::{DistanceBin, distance_bins, macro_thresholds};
use crate::core_modules::color_segmenter::{ColorMask, HsvImage, circle_mask, count_foreground, segment};
use crate::core_modules::dataset::{self, DatasetLayout, LabelRecord, SampleLabel};
use crate::core_modules::frame::{CircleGeometry, Frame, RegionSampler};
use crate::core_modules::heading_estimator::{HeadingEstimate, HeadingSource, TemplateLibrary, choose_heading};
use crate::core_modules::marker_extractor::{ExtractorSettings, MarkerState, extract_reference, extract_target};
use crate::core_modules::polar_resolver::PolarReading;
use crate::core_modules::quota::{Admission, AdmissionProgress, BalanceReport, PruneReport, QuotaBalancer, QuotaViolation};
use crate::core_modules::stabilizer::{FrameMeasurement, Freeze, ProcessState, StabilizerContext, TemporalStabilizer};
use crate::core_modules::utils::geometry::Point2;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::LabelError;
use anyhow::{Context, Result};
use image::GrayImage;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

// Re-export key data structures for the public API.
pub use crate::core_modules::classifier::Classification;
pub use crate::core_modules::frame::ImageFileSampler;

/// Everything measured and decided for one frame, in original pixels.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    /// Raw reference measurement.
    pub reference: MarkerState,
    /// Raw target measurement.
    pub target: MarkerState,
    /// Centroids after temporal stabilization.
    pub stable_reference: Point2,
    pub stable_target: Point2,
    pub heading_deg: f64,
    pub heading_source: HeadingSource,
    pub template: Option<HeadingEstimate>,
    pub polar: PolarReading,
    /// Smoothed bearing the sector was classified from.
    pub angle_deg: f64,
    /// Smoothed, clamped distance.
    pub distance_px: f64,
    pub labels: Classification,
    pub freezes: Vec<Freeze>,
    pub distance_bins: Vec<DistanceBin>,
    /// Upper bounds of the near and medium bands.
    pub distance_macro_thresholds: (f64, f64),
    #[serde(skip)]
    pub reference_mask: GrayImage,
    #[serde(skip)]
    pub target_mask: GrayImage,
}

impl Analysis {
    fn record(&self, uuid: Uuid) -> LabelRecord {
        LabelRecord {
            target: self.stable_target,
            reference: self.stable_reference,
            reference_tip: self.reference.tip.unwrap_or(self.reference.centroid),
            sample: SampleLabel::new(uuid, self.angle_deg, self.distance_px, self.labels),
        }
    }
}

/// A persisted sample.
#[derive(Debug, Clone, Serialize)]
pub struct SavedSample {
    pub label: SampleLabel,
    pub progress: AdmissionProgress,
    pub capture_path: PathBuf,
    pub label_path: PathBuf,
}

/// The result of one capture.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Saved(SavedSample),
    Skipped { uuid: Uuid, violations: Vec<QuotaViolation> },
    Dropped { uuid: Uuid, error: LabelError },
}

/// Circle mask for the last working resolution seen.
#[derive(Default)]
struct CircleMaskCache {
    entry: Option<(u32, u32, CircleGeometry, ColorMask)>,
}

impl CircleMaskCache {
    fn get(&mut self, width: u32, height: u32, circle: CircleGeometry) -> &ColorMask {
        let stale = self
            .entry
            .as_ref()
            .is_none_or(|(w, h, c, _)| (*w, *h, *c) != (width, height, circle));
        if stale {
            self.entry = None;
        }
        let (_, _, _, mask) = self
            .entry
            .get_or_insert_with(|| (width, height, circle, circle_mask(width, height, &circle)));
        mask
    }
}

/// Tries the primary ranges, then the fallback, until `extract` accepts a blob.
fn detect_marker<F>(
    hsv: &HsvImage,
    within: &ColorMask,
    circle: &CircleGeometry,
    profile: &crate::config::MarkerProfile,
    settings: &CleanerSettings,
    extract: F,
) -> Option<(Blob, MarkerState)>
where
    F: Fn(&Blob) -> Option<MarkerState>,
{
    [&profile.primary, &profile.fallback]
        .into_iter()
        .enumerate()
        .filter(|(_, ranges)| !ranges.is_empty())
        .find_map(|(attempt, ranges)| {
            let mask = segment(hsv, ranges, within);
            let blob = blob_cleaner::clean(&mask, circle, settings)?;
            let state = extract(&blob)?;
            if attempt > 0 {
                debug!("Marker found with the fallback color range");
            }
            Some((blob, state))
        })
}

/// One labeler instance: configuration, templates, frame-to-frame state and dataset.
pub struct CaptureSession {
    config: LabelerConfig,
    templates: TemplateLibrary,
    stabilizer: TemporalStabilizer,
    balancer: QuotaBalancer,
    masks: CircleMaskCache,
}

impl CaptureSession {
    pub fn new(config: LabelerConfig, root: impl Into<PathBuf>) -> Self {
        let config = config.normalized();
        let templates = TemplateLibrary::from_config(&config.heading);
        let stabilizer = TemporalStabilizer::new(config.stabilizer);
        let balancer = QuotaBalancer::new(config.caps, DatasetLayout::new(root));
        Self {
            config,
            templates,
            stabilizer,
            balancer,
            masks: CircleMaskCache::default(),
        }
    }

    pub fn config(&self) -> &LabelerConfig {
        &self.config
    }

    pub fn layout(&self) -> &DatasetLayout {
        self.balancer.layout()
    }

    pub fn state(&self) -> &ProcessState {
        self.stabilizer.state()
    }

    /// Forgets all previous frames.
    pub fn reset(&mut self) {
        self.stabilizer.reset();
    }

    /// Measures, stabilizes and classifies one frame without touching the dataset.
    pub fn analyze(&mut self, frame: &Frame) -> Result<Analysis, LabelError> {
        let cfg = &self.config;
        let scale = cfg.upscale_factor;

        // --- 1. Working Frame ---
        let working = frame.magnified(scale).smoothed();
        let circle = working.circle;
        let hsv = HsvImage::from_frame(&working);
        let within = self.masks.get(working.width(), working.height(), circle);

        // --- 2. Marker Detection ---
        let extractor = ExtractorSettings::for_arrow(&cfg.arrow, &circle, scale, cfg.tip_refine_window);
        let reference_cleaner = CleanerSettings::for_marker(&cfg.arrow, &cfg.reference, &circle, scale);
        let (reference_blob, reference) =
            detect_marker(&hsv, within, &circle, &cfg.reference, &reference_cleaner, |blob| {
                extract_reference(blob, &circle, &extractor)
            })
            .ok_or_else(|| LabelError::DetectionFailure("Reference marker not found".into()))?;
        let target_cleaner = CleanerSettings::for_marker(&cfg.arrow, &cfg.target, &circle, scale);
        let (target_blob, target) = detect_marker(&hsv, within, &circle, &cfg.target, &target_cleaner, |blob| {
            Some(extract_target(blob, &extractor))
        })
        .ok_or_else(|| LabelError::DetectionFailure("Target marker not found".into()))?;
        debug!(
            "Reference via {} ({} vertices, solidity {:.2}), target area {:.0}",
            reference.meta.method, reference.meta.vertex_count, reference.meta.solidity, target.meta.area
        );

        // --- 3. Heading ---
        let template = self.templates.estimate(&reference_blob.mask);
        if let Some(estimate) = template {
            debug!("Template heading {:.1} (score {:.3})", estimate.heading_deg, estimate.score);
        }
        let (heading_deg, heading_source) =
            choose_heading(reference.heading_deg, template, cfg.heading.score_threshold)
                .ok_or_else(|| LabelError::DetectionFailure("Reference marker has no heading".into()))?;

        // --- 4. Stabilization, Polar Resolution, Classification ---
        let ctx = StabilizerContext {
            circle,
            range: cfg.distance_range.scaled(scale),
            heading_offset_deg: cfg.heading_offset_deg,
            classify_offset_deg: cfg.angle_classify_offset_deg,
        };
        let measurement = FrameMeasurement {
            reference: reference.centroid,
            target: target.centroid,
            heading_deg,
        };
        let stable = self.stabilizer.update(&measurement, &ctx)?;

        // --- 5. Back to Original Pixels ---
        let shrink = |p: Point2| (p.0 / scale, p.1 / scale);
        Ok(Analysis {
            reference: reference.unscaled(scale),
            target: target.unscaled(scale),
            stable_reference: shrink(stable.reference),
            stable_target: shrink(stable.target),
            heading_deg: stable.heading_deg,
            heading_source,
            template,
            polar: stable.polar.unscaled(scale),
            angle_deg: stable.classified_bearing_deg,
            distance_px: stable.distance / scale,
            labels: stable.labels,
            freezes: stable.freezes,
            distance_bins: distance_bins(&self.config.distance_range),
            distance_macro_thresholds: macro_thresholds(&self.config.distance_range),
            reference_mask: reference_blob.mask,
            target_mask: target_blob.mask,
        })
    }

    /// Samples and analyzes one frame; nothing is written.
    pub fn probe(&mut self, sampler: &mut dyn RegionSampler) -> Result<Analysis> {
        let frame = sampler.sample().context("Failed to sample the radar region")?;
        Ok(self.analyze(&frame)?)
    }

    /// Full capture: persist the raw frame, analyze it, check quotas, write labels.
    pub fn capture(&mut self, sampler: &mut dyn RegionSampler, uuid: Uuid) -> Result<CaptureOutcome> {
        let layout = self.balancer.layout().clone();
        layout.ensure()?;

        // --- 1. Raw Capture ---
        let frame = sampler.sample().context("Failed to sample the radar region")?;
        let capture_path = layout.capture_path(&uuid);
        image_helper::save_capture(&capture_path, &frame.image)
            .with_context(|| format!("Failed to save capture {}", capture_path.display()))?;

        // --- 2. Opportunistic Prune ---
        self.balancer.prune();

        // --- 3. Analysis ---
        let analysis = match self.analyze(&frame) {
            Ok(analysis) => analysis,
            Err(error) => {
                warn!("Dropping {}: {}", uuid, error);
                layout.remove_sample_dir(&uuid);
                return Ok(CaptureOutcome::Dropped { uuid, error });
            }
        };
        if self.config.debug_save {
            for (marker, mask) in [("reference", &analysis.reference_mask), ("target", &analysis.target_mask)] {
                let path = layout.debug_mask_path(&uuid, marker);
                match image_helper::save_mask(&path, mask) {
                    Ok(()) => debug!("Saved {} mask ({} px) to {}", marker, count_foreground(mask), path.display()),
                    Err(err) => warn!("Could not save debug mask {}: {}", path.display(), err),
                }
            }
        }

        // --- 4. Admission ---
        let progress = match self.balancer.admit(&analysis.labels)? {
            Admission::Accepted(progress) => progress,
            Admission::Rejected(violations) => {
                let reasons: Vec<String> = violations.iter().map(ToString::to_string).collect();
                warn!("Skipping save for {}: {}", uuid, reasons.join(" | "));
                layout.remove_sample_dir(&uuid);
                return Ok(CaptureOutcome::Skipped { uuid, violations });
            }
        };

        // --- 5. Persist ---
        let record = analysis.record(uuid);
        let label_path = dataset::write_label(&layout, &record)?;
        dataset::append_ledger(&layout, &record.sample)?;
        info!(
            "Saved {}: angle {:.2} ({}/{}), distance {:.2} ({}/{})",
            uuid,
            record.sample.angle_deg,
            record.sample.labels.angle_macro,
            record.sample.labels.angle_micro,
            record.sample.distance_px,
            record.sample.labels.distance_macro,
            record.sample.labels.distance_micro
        );
        info!("Progress: {}", progress);
        Ok(CaptureOutcome::Saved(SavedSample {
            label: record.sample,
            progress,
            capture_path,
            label_path,
        }))
    }

    pub fn prune(&self) -> PruneReport {
        self.balancer.prune()
    }

    pub fn balance(&self) -> BalanceReport {
        self.balancer.balance()
    }
}

/// Cheaply clonable handle that serializes access to one session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<tokio::sync::Mutex<CaptureSession>>,
}

impl SessionHandle {
    pub fn new(session: CaptureSession) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(session)),
        }
    }

    pub async fn capture(&self, sampler: &mut (dyn RegionSampler + Send), uuid: Uuid) -> Result<CaptureOutcome> {
        let mut session = self.inner.lock().await;
        session.capture(sampler, uuid)
    }

    pub async fn probe(&self, sampler: &mut (dyn RegionSampler + Send)) -> Result<Analysis> {
        let mut session = self.inner.lock().await;
        session.probe(sampler)
    }

    pub async fn prune(&self) -> PruneReport {
        self.inner.lock().await.prune()
    }

    pub async fn balance(&self) -> BalanceReport {
        self.inner.lock().await.balance()
    }
}
