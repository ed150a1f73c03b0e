// Shared fixtures for unit tests: rasterised marker masks and synthetic radar frames.

use crate::core_modules::color_segmenter::FOREGROUND;
use crate::core_modules::frame::Frame;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_polygon_mut};
use imageproc::point::Point;
use std::path::PathBuf;

pub const BACKGROUND: Rgb<u8> = Rgb([38, 40, 44]);
pub const REFERENCE_RED: Rgb<u8> = Rgb([220, 30, 30]);
pub const TARGET_GREEN: Rgb<u8> = Rgb([30, 200, 60]);

pub fn filled_triangle_mask(width: u32, height: u32, a: (i32, i32), b: (i32, i32), c: (i32, i32)) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(
        &mut mask,
        &[Point::new(a.0, a.1), Point::new(b.0, b.1), Point::new(c.0, c.1)],
        Luma([FOREGROUND]),
    );
    mask
}

pub fn filled_disc_mask(width: u32, height: u32, center: (i32, i32), radius: i32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    draw_filled_circle_mut(&mut mask, center, radius, Luma([FOREGROUND]));
    mask
}

/// Rotates `point` counter-clockwise on screen (y down) around `center`.
pub fn rotate_point(point: (f64, f64), center: (f64, f64), ccw_deg: f64) -> (f64, f64) {
    let (sin, cos) = ccw_deg.to_radians().sin_cos();
    let (dx, dy) = (point.0 - center.0, point.1 - center.1);
    (
        center.0 + dx * cos + dy * sin,
        center.1 - dx * sin + dy * cos,
    )
}

/// 200x200 radar: tip-up red arrow centered at (100, 100), green disc at `target`.
pub fn radar_frame(target: (i32, i32)) -> Frame {
    let mut image = RgbImage::from_pixel(200, 200, BACKGROUND);
    draw_polygon_mut(
        &mut image,
        &[Point::new(100, 80), Point::new(88, 110), Point::new(112, 110)],
        REFERENCE_RED,
    );
    draw_filled_circle_mut(&mut image, target, 9, TARGET_GREEN);
    Frame::new(image)
}

/// The default scenario: target 48px straight ahead of the arrow.
pub fn default_radar_frame() -> Frame {
    radar_frame((100, 52))
}

/// Fresh, uniquely named directory under the system temp dir.
pub fn temp_root(prefix: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("{prefix}_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create temp root");
    root
}
