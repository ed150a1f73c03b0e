// THEORY:
// The `MarkerExtractor` turns a cleaned blob into a `MarkerState`: the
// measurements every later layer consumes. The reference marker is an arrow,
// so besides its centroid we need the tip that encodes where it points; the
// target marker only contributes its centroid.
//
// Key architectural principles:
// 1.  **Ordered Strategies**: Reference extraction is a list of pure functions
//     tried in order until one returns a state. The triangle strategy searches
//     outer contours for a small, solid, 3-7 vertex polygon near the center;
//     the largest-contour strategy accepts whatever is there and takes the
//     farthest boundary point as the tip.
// 2.  **Tip Selection**: A good tip is both far from the centroid and sharp.
//     Vertices with an interior angle of at most 100 degrees get a doubled
//     distance term, blunt ones are penalized by half their angle.
// 3.  **Sub-pixel Refinement**: The chosen vertex is replaced by the centroid
//     of the foreground pixels in a small odd window around it.

use crate::config::ArrowHeuristics;
use crate::core_modules::blob_cleaner::Blob;
use crate::core_modules::frame::CircleGeometry;
use crate::core_modules::utils::geometry::{
    Point2, dedup_closed, distance, polygon_area, polygon_centroid, screen_angle_deg, to_f64,
    vertex_angle_deg,
};
use image::GrayImage;
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometry::{approximate_polygon_dp, arc_length, convex_hull};
use imageproc::point::Point;
use serde::Serialize;
use std::fmt;

/// Which strategy produced a marker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Triangle,
    Largest,
    Moments,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionMethod::Triangle => "triangle",
            ExtractionMethod::Largest => "largest",
            ExtractionMethod::Moments => "moments",
        };
        f.write_str(name)
    }
}

/// Contour metrics kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarkerMeta {
    pub area: f64,
    pub vertex_count: usize,
    pub solidity: f64,
    pub perimeter: f64,
    pub method: ExtractionMethod,
}

/// Per-frame measurement of one marker, in working-resolution pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerState {
    pub centroid: Point2,
    pub tip: Option<Point2>,
    /// Direction centroid -> tip in [0, 360), when a tip exists.
    pub heading_deg: Option<f64>,
    pub meta: MarkerMeta,
}

impl MarkerState {
    fn with_tip(centroid: Point2, tip: Point2, meta: MarkerMeta) -> Self {
        Self {
            centroid,
            tip: Some(tip),
            heading_deg: Some(screen_angle_deg(centroid, tip)),
            meta,
        }
    }

    /// Same marker expressed in pixels of a frame `scale` times smaller.
    pub fn unscaled(&self, scale: f64) -> Self {
        let shrink = |p: Point2| (p.0 / scale, p.1 / scale);
        Self {
            centroid: shrink(self.centroid),
            tip: self.tip.map(shrink),
            heading_deg: self.heading_deg,
            meta: MarkerMeta {
                area: self.meta.area / (scale * scale),
                perimeter: self.meta.perimeter / scale,
                ..self.meta
            },
        }
    }
}

/// Arrow thresholds converted to working-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractorSettings {
    pub min_area: f64,
    pub max_area: f64,
    pub min_contour_pixels: f64,
    pub min_solidity: f64,
    pub approx_eps_factor: f64,
    pub min_vertices: usize,
    pub max_vertices: usize,
    pub tip_window: u32,
}

impl ExtractorSettings {
    pub fn for_arrow(heuristics: &ArrowHeuristics, circle: &CircleGeometry, scale: f64, tip_window: u32) -> Self {
        let circle_area = circle.area();
        Self {
            min_area: circle_area * heuristics.area_min_ratio,
            max_area: circle_area * heuristics.area_max_ratio,
            min_contour_pixels: heuristics.min_contour_pixels * scale * scale,
            min_solidity: heuristics.min_solidity,
            approx_eps_factor: heuristics.approx_eps_factor,
            min_vertices: heuristics.min_vertices,
            max_vertices: heuristics.max_vertices,
            tip_window,
        }
    }
}

type Strategy = fn(&Blob, &CircleGeometry, &ExtractorSettings) -> Option<MarkerState>;

const REFERENCE_STRATEGIES: [Strategy; 2] = [triangle_strategy, largest_contour_strategy];

/// Centroid, tip and heading of the arrow-shaped reference marker.
pub fn extract_reference(blob: &Blob, circle: &CircleGeometry, settings: &ExtractorSettings) -> Option<MarkerState> {
    REFERENCE_STRATEGIES
        .iter()
        .find_map(|strategy| strategy(blob, circle, settings))
}

/// Moment centroid of the target marker.
pub fn extract_target(blob: &Blob, settings: &ExtractorSettings) -> MarkerState {
    let metrics = ContourMetrics::measure(&blob.contour, settings.approx_eps_factor);
    MarkerState {
        centroid: blob.centroid,
        tip: None,
        heading_deg: None,
        meta: MarkerMeta {
            area: blob.area,
            vertex_count: metrics.polygon.len(),
            solidity: metrics.solidity,
            perimeter: metrics.perimeter,
            method: ExtractionMethod::Moments,
        },
    }
}

struct ContourMetrics {
    area: f64,
    perimeter: f64,
    polygon: Vec<Point<i32>>,
    solidity: f64,
}

impl ContourMetrics {
    fn measure(points: &[Point<i32>], eps_factor: f64) -> Self {
        let area = polygon_area(points);
        let perimeter = if points.len() > 1 { arc_length(points, true) } else { 0.0 };
        let epsilon = if perimeter > 0.0 { eps_factor * perimeter } else { eps_factor };
        let polygon = if points.len() > 2 {
            dedup_closed(approximate_polygon_dp(points, epsilon, true))
        } else {
            points.to_vec()
        };
        let hull_area = if points.len() > 2 {
            polygon_area(&convex_hull(points))
        } else {
            0.0
        };
        let solidity = area / if hull_area > 0.0 { hull_area } else { 1.0 };
        Self {
            area,
            perimeter,
            polygon,
            solidity,
        }
    }
}

fn outer_contours(mask: &GrayImage) -> Vec<Vec<Point<i32>>> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| c.points)
        .collect()
}

/// Best triangle-like outer contour, scored by center distance plus a vertex penalty.
pub fn triangle_strategy(blob: &Blob, circle: &CircleGeometry, settings: &ExtractorSettings) -> Option<MarkerState> {
    let mut best: Option<(f64, Point2, MarkerMeta, Vec<Point<i32>>)> = None;

    for contour in outer_contours(&blob.mask) {
        let metrics = ContourMetrics::measure(&contour, settings.approx_eps_factor);
        if metrics.area <= 0.0
            || metrics.area < settings.min_area
            || metrics.area > settings.max_area
            || metrics.area < settings.min_contour_pixels
            || metrics.perimeter == 0.0
        {
            continue;
        }
        let vertex_count = metrics.polygon.len();
        if vertex_count < settings.min_vertices || vertex_count > settings.max_vertices {
            continue;
        }
        if metrics.solidity < settings.min_solidity {
            continue;
        }
        let Some(centroid) = polygon_centroid(&contour) else {
            continue;
        };

        let score = distance(centroid, circle.center) + (vertex_count as f64 - 3.0).abs() * 2.0;
        if best.as_ref().is_none_or(|(best_score, ..)| score < *best_score) {
            let meta = MarkerMeta {
                area: metrics.area,
                vertex_count,
                solidity: metrics.solidity,
                perimeter: metrics.perimeter,
                method: ExtractionMethod::Triangle,
            };
            best = Some((score, centroid, meta, metrics.polygon));
        }
    }

    let (_, centroid, meta, polygon) = best?;
    let tip = sharpest_far_vertex(&polygon, centroid)?;
    let tip = refine_tip(&blob.mask, tip, settings.tip_window);
    Some(MarkerState::with_tip(centroid, tip, meta))
}

/// Largest outer contour with its farthest boundary point as the tip.
pub fn largest_contour_strategy(blob: &Blob, _circle: &CircleGeometry, settings: &ExtractorSettings) -> Option<MarkerState> {
    let contour = outer_contours(&blob.mask)
        .into_iter()
        .max_by(|a, b| polygon_area(a).total_cmp(&polygon_area(b)))?;
    let metrics = ContourMetrics::measure(&contour, settings.approx_eps_factor);
    let centroid = polygon_centroid(&contour)?;
    let farthest = contour
        .iter()
        .map(to_f64)
        .max_by(|a, b| distance(*a, centroid).total_cmp(&distance(*b, centroid)))?;
    let tip = refine_tip(&blob.mask, farthest, settings.tip_window);
    log::debug!("Triangle heuristics failed; using the largest contour ({:.0}px)", metrics.area);
    Some(MarkerState::with_tip(
        centroid,
        tip,
        MarkerMeta {
            area: metrics.area,
            vertex_count: metrics.polygon.len(),
            solidity: metrics.solidity,
            perimeter: metrics.perimeter,
            method: ExtractionMethod::Largest,
        },
    ))
}

fn sharpest_far_vertex(polygon: &[Point<i32>], centroid: Point2) -> Option<Point2> {
    let n = polygon.len();
    if n == 0 {
        return None;
    }
    let mut best: Option<(f64, Point2)> = None;
    for i in 0..n {
        let vertex = to_f64(&polygon[i]);
        let prev = to_f64(&polygon[(i + n - 1) % n]);
        let next = to_f64(&polygon[(i + 1) % n]);
        let dist = distance(vertex, centroid);
        let angle = vertex_angle_deg(prev, vertex, next);
        let score = if angle <= 100.0 {
            dist * 2.0 - angle
        } else {
            dist - 0.5 * angle
        };
        if best.is_none_or(|(best_score, _)| score > best_score) {
            best = Some((score, vertex));
        }
    }
    best.map(|(_, vertex)| vertex)
}

/// Foreground-weighted centroid of a `window` x `window` patch around `tip`.
pub fn refine_tip(mask: &GrayImage, tip: Point2, window: u32) -> Point2 {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 {
        return tip;
    }
    let half = (window / 2).max(1) as i64;
    let (x, y) = (tip.0 as i64, tip.1 as i64);
    let x0 = (x - half).max(0);
    let x1 = (x + half + 1).min(width as i64);
    let y0 = (y - half).max(0);
    let y1 = (y + half + 1).min(height as i64);

    let (mut weight, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
    for py in y0..y1 {
        for px in x0..x1 {
            let w = mask.get_pixel(px as u32, py as u32)[0] as f64;
            if w > 0.0 {
                weight += w;
                sum_x += px as f64 * w;
                sum_y += py as f64 * w;
            }
        }
    }
    if weight <= 0.0 {
        return tip;
    }
    (sum_x / weight, sum_y / weight)
}
