// Small planar helpers shared by the extractor, resolver and stabilizer.
// Angles are degrees counter-clockwise from screen +x with screen y pointing
// down, so "up" on screen is 90.

use imageproc::point::Point;

pub type Point2 = (f64, f64);

/// Wraps any angle into [0, 360).
pub fn wrap_deg(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 { 0.0 } else { wrapped }
}

/// Smallest absolute difference between two angles, in [0, 180].
pub fn circular_diff_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    diff.min(360.0 - diff)
}

/// On-screen direction of the vector `from -> to`.
pub fn screen_angle_deg(from: Point2, to: Point2) -> f64 {
    wrap_deg((-(to.1 - from.1)).atan2(to.0 - from.0).to_degrees())
}

pub fn distance(a: Point2, b: Point2) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

/// Largest per-axis displacement between two point pairs.
pub fn max_axis_shift(a: (Point2, Point2), b: (Point2, Point2)) -> f64 {
    [
        (a.0.0 - b.0.0).abs(),
        (a.0.1 - b.0.1).abs(),
        (a.1.0 - b.1.0).abs(),
        (a.1.1 - b.1.1).abs(),
    ]
    .into_iter()
    .fold(0.0, f64::max)
}

pub fn to_f64(point: &Point<i32>) -> Point2 {
    (point.x as f64, point.y as f64)
}

/// Signed shoelace area of a closed polygon.
fn signed_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    twice_area / 2.0
}

pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    signed_area(points).abs()
}

/// Area centroid of a closed polygon; degenerate polygons use the vertex mean.
pub fn polygon_centroid(points: &[Point<i32>]) -> Option<Point2> {
    if points.is_empty() {
        return None;
    }
    let area = signed_area(points);
    if area.abs() < 1e-9 {
        let n = points.len() as f64;
        let (sx, sy) = points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x as f64, sy + p.y as f64));
        return Some((sx / n, sy / n));
    }
    let (mut cx, mut cy) = (0.0, 0.0);
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        let cross = p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        cx += (p.x as f64 + q.x as f64) * cross;
        cy += (p.y as f64 + q.y as f64) * cross;
    }
    Some((cx / (6.0 * area), cy / (6.0 * area)))
}

/// Interior angle at `vertex` in degrees [0, 180].
pub fn vertex_angle_deg(prev: Point2, vertex: Point2, next: Point2) -> f64 {
    let v1 = (prev.0 - vertex.0, prev.1 - vertex.1);
    let v2 = (next.0 - vertex.0, next.1 - vertex.1);
    let mut denom = v1.0.hypot(v1.1) * v2.0.hypot(v2.1);
    if denom == 0.0 {
        denom = 1.0;
    }
    let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / denom).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Drops consecutive repeats, including a closing point equal to the first.
pub fn dedup_closed(mut points: Vec<Point<i32>>) -> Vec<Point<i32>> {
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points
}
