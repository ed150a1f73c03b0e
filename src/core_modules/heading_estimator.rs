// THEORY:
// The `HeadingEstimator` is a second opinion on which way the reference arrow
// points. The tip vector from the extractor is sensitive to a single noisy
// vertex; correlating the whole arrow silhouette against a rotated template is
// not, but it can be fooled by odd shapes. The pipeline therefore uses the
// template answer only when its score clears a threshold and falls back to the
// tip heading otherwise. It never blends the two.
//
// Key architectural principles:
// 1.  **Canonical Frame**: Templates and patches are both resampled so their
//     foreground centroid lands in the middle of a square canvas and their
//     farthest foreground pixel sits at a fixed fraction of the side. Matching
//     is then independent of marker size and position, and rotations about the
//     canvas center never clip the silhouette.
// 2.  **Precomputed Library**: One template is rotated once per angular step at
//     session start; per-frame work is a zero-mean normalized cross-correlation
//     against each rotation.
// 3.  **Local Patch**: A frame-sized reference mask is first cropped to the
//     marker's bounding box plus a small margin, so per-frame work scales with
//     the marker, not the magnified frame.
// 4.  **Angle Convention**: The unrotated template points at
//     `template_heading_offset_deg` (tip up is 90). A counter-clockwise rotation
//     by `r` therefore reports heading `offset + r`.

use crate::config::HeadingConfig;
use crate::core_modules::utils::geometry::{Point2, wrap_deg};
use image::{GrayImage, Luma, imageops};
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometric_transformations::{Interpolation, Projection, rotate_about_center, warp_into};
use imageproc::point::Point;
use log::{debug, warn};
use serde::Serialize;

/// Farthest foreground pixel distance, as a fraction of the canvas side.
const CANONICAL_EXTENT: f64 = 0.45;
const TEMPLATE_BLUR_SIGMA: f32 = 0.8;
/// Background kept around the marker's bounding box, in pixels.
const PATCH_MARGIN: u32 = 4;

/// Result of the rotation search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadingEstimate {
    pub heading_deg: f64,
    pub rotation_deg: f64,
    pub score: f64,
}

/// Which measurement the final heading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingSource {
    Template,
    Tip,
}

struct RotatedTemplate {
    rotation_deg: f64,
    /// Zero-mean samples.
    centered: Vec<f64>,
    norm: f64,
}

/// The canonical arrow template, rotated through a full turn.
pub struct TemplateLibrary {
    size: u32,
    heading_offset_deg: f64,
    rotations: Vec<RotatedTemplate>,
}

impl TemplateLibrary {
    /// Loads the configured template file, falling back to the synthetic arrow.
    pub fn from_config(config: &HeadingConfig) -> Self {
        if let Some(path) = &config.template_path {
            match image::open(path) {
                Ok(img) => {
                    if let Some(library) = Self::from_image(&img.to_luma8(), config) {
                        debug!("Loaded heading template from {}", path.display());
                        return library;
                    }
                    warn!("Template {} has no foreground; using the synthetic arrow", path.display());
                }
                Err(err) => warn!("Failed to load template {}: {}", path.display(), err),
            }
        }
        Self::synthetic(config)
    }

    /// Tip-up isosceles triangle.
    pub fn synthetic(config: &HeadingConfig) -> Self {
        let side = config.template_size.max(16);
        let s = side as f64;
        let mut base = GrayImage::new(side, side);
        let tip = Point::new((s * 0.5) as i32, (s * 0.08) as i32);
        let right = Point::new((s * 0.82) as i32, (s * 0.88) as i32);
        let left = Point::new((s * 0.18) as i32, (s * 0.88) as i32);
        draw_polygon_mut(&mut base, &[tip, right, left], Luma([255u8]));
        // A non-empty triangle always normalizes.
        Self::from_image(&base, config).unwrap_or_else(|| Self::empty(config))
    }

    /// Builds the library from an arbitrary grayscale silhouette; `None` if it is blank.
    pub fn from_image(base: &GrayImage, config: &HeadingConfig) -> Option<Self> {
        let size = config.template_size.max(16);
        let thresholded = GrayImage::from_fn(base.width(), base.height(), |x, y| {
            if base.get_pixel(x, y)[0] > 1 { *base.get_pixel(x, y) } else { Luma([0]) }
        });
        let canonical = canonicalize(&thresholded, size)?;
        let step = config.rot_step_deg.clamp(1, 360);
        let rotations = (0..360)
            .step_by(step as usize)
            .filter_map(|angle| {
                let rotation_deg = angle as f64;
                let rotated = rotate_about_center(
                    &canonical,
                    -(rotation_deg.to_radians() as f32),
                    Interpolation::Bilinear,
                    Luma([0]),
                );
                let (centered, norm) = zero_mean(&rotated)?;
                Some(RotatedTemplate {
                    rotation_deg,
                    centered,
                    norm,
                })
            })
            .collect::<Vec<_>>();
        if rotations.is_empty() {
            return None;
        }
        Some(Self {
            size,
            heading_offset_deg: config.template_heading_offset_deg,
            rotations,
        })
    }

    fn empty(config: &HeadingConfig) -> Self {
        Self {
            size: config.template_size.max(16),
            heading_offset_deg: config.template_heading_offset_deg,
            rotations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    /// Best-matching rotation for the reference mask.
    pub fn estimate(&self, mask: &GrayImage) -> Option<HeadingEstimate> {
        let patch = canonicalize(&marker_patch(mask)?, self.size)?;
        let (centered, norm) = zero_mean(&patch)?;

        let mut best: Option<(f64, f64)> = None;
        for template in &self.rotations {
            let dot: f64 = centered
                .iter()
                .zip(&template.centered)
                .map(|(p, t)| p * t)
                .sum();
            let score = dot / (norm * template.norm);
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((template.rotation_deg, score));
            }
        }
        let (rotation_deg, score) = best?;
        Some(HeadingEstimate {
            heading_deg: wrap_deg(rotation_deg + self.heading_offset_deg),
            rotation_deg,
            score,
        })
    }
}

/// Template heading when it clears `threshold`, otherwise the tip heading.
pub fn choose_heading(
    tip_heading: Option<f64>,
    estimate: Option<HeadingEstimate>,
    threshold: f64,
) -> Option<(f64, HeadingSource)> {
    match estimate {
        Some(est) if est.score >= threshold => Some((est.heading_deg, HeadingSource::Template)),
        _ => tip_heading.map(|heading| (wrap_deg(heading), HeadingSource::Tip)),
    }
}

/// Crop of `mask` around its foreground, `PATCH_MARGIN` pixels wider on each side.
fn marker_patch(mask: &GrayImage) -> Option<GrayImage> {
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] > 0 {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    if min_x > max_x {
        return None;
    }
    let x0 = min_x.saturating_sub(PATCH_MARGIN);
    let y0 = min_y.saturating_sub(PATCH_MARGIN);
    let x1 = (max_x + PATCH_MARGIN).min(mask.width() - 1);
    let y1 = (max_y + PATCH_MARGIN).min(mask.height() - 1);
    Some(imageops::crop_imm(mask, x0, y0, x1 - x0 + 1, y1 - y0 + 1).to_image())
}

/// Intensity-weighted centroid and farthest foreground distance.
fn foreground_extent(img: &GrayImage) -> Option<(Point2, f64)> {
    let (mut weight, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
    for (x, y, p) in img.enumerate_pixels() {
        let w = p[0] as f64;
        if w > 0.0 {
            weight += w;
            sum_x += x as f64 * w;
            sum_y += y as f64 * w;
        }
    }
    if weight <= 0.0 {
        return None;
    }
    let centroid = (sum_x / weight, sum_y / weight);
    let radius = img
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] > 0)
        .map(|(x, y, _)| (x as f64 - centroid.0).hypot(y as f64 - centroid.1))
        .fold(0.0, f64::max)
        .max(1.0);
    Some((centroid, radius))
}

/// Resamples `img` into a `size` x `size` canvas in the canonical frame, lightly blurred.
fn canonicalize(img: &GrayImage, size: u32) -> Option<GrayImage> {
    let (centroid, radius) = foreground_extent(img)?;
    let half = size as f32 / 2.0;
    let scale = (CANONICAL_EXTENT * size as f64 / radius) as f32;
    let projection = Projection::translate(half, half)
        * Projection::scale(scale, scale)
        * Projection::translate(-centroid.0 as f32, -centroid.1 as f32);
    let mut out = GrayImage::new(size, size);
    warp_into(img, &projection, Interpolation::Bilinear, Luma([0]), &mut out);
    Some(imageops::blur(&out, TEMPLATE_BLUR_SIGMA))
}

fn zero_mean(img: &GrayImage) -> Option<(Vec<f64>, f64)> {
    let n = (img.width() * img.height()) as f64;
    if n == 0.0 {
        return None;
    }
    let mean = img.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let centered: Vec<f64> = img.pixels().map(|p| p[0] as f64 - mean).collect();
    let norm = centered.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm <= f64::EPSILON {
        return None;
    }
    Some((centered, norm))
}
