// THEORY:
// A `Frame` is one capture of the circular radar region: an RGB buffer plus the
// circle it is known to contain. Frames are transient; the pipeline builds a
// magnified working copy of each one, analyzes it, and discards it.
//
// Key architectural principles:
// 1.  **External source**: Window discovery and screen grabbing are not this
//     crate's job. Anything that can hand over an RGB region implements
//     `RegionSampler`; the crate ships a file-backed sampler for the CLI.
// 2.  **Working resolution**: Magnification (cubic) followed by a light blur is
//     the only preprocessing. All geometry downstream is expressed in the
//     working frame's pixels and scaled back at the very end.

use anyhow::{Context, Result};
use image::{RgbImage, imageops};
use std::path::{Path, PathBuf};

/// Fraction of the shorter side used as the circle radius.
pub const CIRCLE_RADIUS_FRAC: f64 = 0.52;
/// Gaussian sigma equivalent to a 3x3 smoothing kernel.
const PRE_THRESHOLD_BLUR_SIGMA: f32 = 0.8;

/// Center and radius of the radar circle, in the frame's own pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleGeometry {
    pub center: (f64, f64),
    pub radius: f64,
}

impl CircleGeometry {
    pub fn new(center: (f64, f64), radius: f64) -> Self {
        Self { center, radius }
    }

    /// The circle a capture of `width` x `height` is assumed to hold.
    pub fn for_region(width: u32, height: u32) -> Self {
        let radius = (width.min(height) as f64 * CIRCLE_RADIUS_FRAC).floor();
        Self::new(((width / 2) as f64, (height / 2) as f64), radius)
    }

    pub fn area(&self) -> f64 {
        std::f64::consts::PI * self.radius * self.radius
    }

    /// Distance of `point` from the center.
    pub fn offset(&self, point: (f64, f64)) -> f64 {
        (point.0 - self.center.0).hypot(point.1 - self.center.1)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(
            (self.center.0 * factor, self.center.1 * factor),
            self.radius * factor,
        )
    }
}

/// One RGB capture of the radar region.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub circle: CircleGeometry,
}

impl Frame {
    /// Wraps `image` with the default circle for its dimensions.
    pub fn new(image: RgbImage) -> Self {
        let circle = CircleGeometry::for_region(image.width(), image.height());
        Self { image, circle }
    }

    pub fn with_circle(image: RgbImage, circle: CircleGeometry) -> Self {
        Self { image, circle }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Decodes any format `image` understands and converts it to RGB.
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("Failed to open capture {}", path.display()))?
            .to_rgb8();
        Ok(Self::new(image))
    }

    /// Cubic magnification by `factor` (no-op at 1.0) with the circle scaled along.
    pub fn magnified(&self, factor: f64) -> Frame {
        if factor <= 1.0 {
            return self.clone();
        }
        let width = ((self.width() as f64) * factor).round().max(1.0) as u32;
        let height = ((self.height() as f64) * factor).round().max(1.0) as u32;
        let image = imageops::resize(&self.image, width, height, imageops::FilterType::CatmullRom);
        Frame::with_circle(image, self.circle.scaled(factor))
    }

    /// Light blur that suppresses UI-edge aliasing before thresholding.
    pub fn smoothed(&self) -> Frame {
        Frame::with_circle(
            imageops::blur(&self.image, PRE_THRESHOLD_BLUR_SIGMA),
            self.circle,
        )
    }
}

/// Anything that can supply the current radar region.
pub trait RegionSampler {
    fn sample(&mut self) -> Result<Frame>;
}

/// Re-reads one image file on every sample, typically kept fresh by an external grabber.
#[derive(Debug, Clone)]
pub struct ImageFileSampler {
    path: PathBuf,
    circle: Option<CircleGeometry>,
}

impl ImageFileSampler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            circle: None,
        }
    }

    /// Overrides the circle derived from the image size.
    pub fn with_circle(mut self, circle: CircleGeometry) -> Self {
        self.circle = Some(circle);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegionSampler for ImageFileSampler {
    fn sample(&mut self) -> Result<Frame> {
        let mut frame = Frame::open(&self.path)?;
        if let Some(circle) = self.circle {
            frame.circle = circle;
        }
        Ok(frame)
    }
}
