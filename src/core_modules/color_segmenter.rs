// THEORY:
// The `ColorSegmenter` is the first spatial layer. It converts the working frame
// to HSV once, then answers "which pixels inside the radar circle look like this
// marker?" for any list of HSV ranges. Ranges are OR-ed, which is how red's
// wraparound at hue 0/360 is expressed, and the result is AND-ed with a
// precomputed circle mask so HUD chrome outside the radar never leaks in.
//
// The segmenter is stateless. The pipeline calls it with the primary ranges
// first and, only if extraction later fails, again with the widened fallback.

use crate::config::HsvRange;
use crate::core_modules::frame::{CircleGeometry, Frame};
use crate::core_modules::pixel::pixel::{Hue, Pixel, SaturationHSV, ValueHSV};
use image::{GrayImage, Luma};

pub const FOREGROUND: u8 = 255;

/// Binary mask; `FOREGROUND` marks selected pixels.
pub type ColorMask = GrayImage;

/// Per-pixel HSV triples of one frame, computed once and reused for every range set.
#[derive(Debug, Clone)]
pub struct HsvImage {
    width: u32,
    height: u32,
    data: Vec<(Hue, SaturationHSV, ValueHSV)>,
}

impl HsvImage {
    pub fn from_frame(frame: &Frame) -> Self {
        let data = frame
            .image
            .pixels()
            .map(|rgb| Pixel::from(rgb).hsv())
            .collect();
        Self {
            width: frame.width(),
            height: frame.height(),
            data,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> (Hue, SaturationHSV, ValueHSV) {
        self.data[(y * self.width + x) as usize]
    }
}

/// Filled disc of the radar circle.
pub fn circle_mask(width: u32, height: u32, circle: &CircleGeometry) -> ColorMask {
    GrayImage::from_fn(width, height, |x, y| {
        if circle.offset((x as f64, y as f64)) <= circle.radius {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Pixels matching any of `ranges` and lying inside `circle`.
pub fn segment(hsv: &HsvImage, ranges: &[HsvRange], circle: &ColorMask) -> ColorMask {
    let (width, height) = hsv.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        if circle.get_pixel(x, y)[0] == 0 {
            return Luma([0]);
        }
        let (hue, sat, val) = hsv.get(x, y);
        if ranges.iter().any(|range| range.contains(hue, sat, val)) {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

pub fn count_foreground(mask: &ColorMask) -> usize {
    mask.pixels().filter(|p| p[0] != 0).count()
}
