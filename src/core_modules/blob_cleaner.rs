// THEORY:
// The `BlobCleaner` turns a raw color mask into at most one trustworthy blob.
// Color thresholds on a magnified, anti-aliased HUD produce speckle, split
// fragments and the occasional same-colored UI glyph; this layer removes all
// three before any shape reasoning happens.
//
// Key architectural principles & algorithm steps:
// 1.  **Morphology**: One opening (drops speckle), one closing (reconnects
//     fragments of the same marker) and a small dilation (stabilizes edges).
// 2.  **Component Budget**: 8-connected components are ranked by area; only the
//     largest `keep_top` above an area floor survive. If none clears the floor
//     the mask is passed through untouched and the primary-blob step decides.
// 3.  **Primary Blob**: Among survivors, the largest whose centroid lies within a
//     radius-proportional tolerance of the circle center wins; otherwise the
//     largest overall. The marker we care about is always inside the radar.
// 4.  **Finish**: A 3x3 median filter smooths the winner's outline, then the
//     blob is re-measured and its outer contour traced for the extractor.
// 5.  **Stateless Utility**: Like the rest of the spatial layer, nothing here
//     remembers previous frames.

use crate::config::{ArrowHeuristics, MarkerProfile};
use crate::core_modules::color_segmenter::{ColorMask, FOREGROUND};
use crate::core_modules::frame::CircleGeometry;
use image::{GrayImage, Luma};
use imageproc::contours::{BorderType, find_contours};
use imageproc::distance_transform::Norm;
use imageproc::point::Point;

/// A connected foreground region after cleaning.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Full-frame mask holding only this blob.
    pub mask: GrayImage,
    /// Pixel count.
    pub area: f64,
    /// First-order moment centroid.
    pub centroid: (f64, f64),
    /// Outer boundary of the largest connected piece.
    pub contour: Vec<Point<i32>>,
}

impl Blob {
    /// Measures the foreground of `mask`; `None` if it is empty.
    pub fn from_mask(mask: GrayImage) -> Option<Blob> {
        let (mut area, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel[0] != 0 {
                area += 1.0;
                sum_x += x as f64;
                sum_y += y as f64;
            }
        }
        if area == 0.0 {
            return None;
        }
        let contour = find_contours::<i32>(&mask)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
            .max_by_key(|c| c.points.len())
            .map(|c| c.points)
            .unwrap_or_default();
        Some(Blob {
            mask,
            area,
            centroid: (sum_x / area, sum_y / area),
            contour,
        })
    }
}

/// Thresholds for one marker, already converted to working-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanerSettings {
    pub min_component_area: f64,
    pub min_blob_area: f64,
    pub keep_top: usize,
    pub center_tolerance: f64,
}

impl CleanerSettings {
    /// `circle` is the working circle; `scale` is the magnification applied to the frame.
    pub fn for_marker(
        heuristics: &ArrowHeuristics,
        profile: &MarkerProfile,
        circle: &CircleGeometry,
        scale: f64,
    ) -> Self {
        let area_scale = scale * scale;
        let original_circle_area = circle.area() / area_scale;
        let component_floor = heuristics
            .min_component_area_abs
            .max(original_circle_area * heuristics.min_component_area_ratio);
        Self {
            min_component_area: component_floor * area_scale,
            min_blob_area: heuristics.min_contour_pixels * area_scale,
            keep_top: profile.keep_top.max(1),
            center_tolerance: circle.radius * heuristics.blob_center_tol,
        }
    }
}

pub mod blob_cleaner {
    use super::*;
    use imageproc::filter::median_filter;
    use imageproc::morphology::{close, dilate, open};
    use imageproc::region_labelling::{Connectivity, connected_components};

    /// Area and centroid of one labelled component.
    #[derive(Debug, Clone, Copy)]
    struct ComponentStats {
        label: u32,
        area: f64,
        centroid: (f64, f64),
    }

    /// Runs every cleaning stage and returns the surviving blob, if any.
    pub fn clean(mask: &ColorMask, circle: &CircleGeometry, settings: &CleanerSettings) -> Option<Blob> {
        // --- 1. Morphology ---
        let mask = apply_morphology(mask);

        // --- 2. Component Budget ---
        let mask = suppress_small_components(&mask, settings.min_component_area, settings.keep_top);

        // --- 3. Primary Blob ---
        let primary = keep_primary_blob(&mask, circle, settings)?;

        // --- 4. Finish ---
        let smoothed = median_filter(&primary, 1, 1);
        let blob = Blob::from_mask(smoothed)?;
        if blob.area < settings.min_blob_area {
            log::debug!(
                "Blob of {:.0}px is below the {:.0}px floor; dropping",
                blob.area,
                settings.min_blob_area
            );
            return None;
        }
        Some(blob)
    }

    pub fn apply_morphology(mask: &ColorMask) -> ColorMask {
        let opened = open(mask, Norm::L1, 1);
        let closed = close(&opened, Norm::L1, 2);
        dilate(&closed, Norm::L1, 1)
    }

    /// Keeps the `keep_top` largest components not smaller than `min_area`.
    /// Returns `mask` unchanged when nothing clears the floor.
    pub fn suppress_small_components(mask: &ColorMask, min_area: f64, keep_top: usize) -> ColorMask {
        let (labels, mut stats) = label_components(mask);
        if stats.is_empty() {
            return mask.clone();
        }
        stats.sort_by(|a, b| b.area.total_cmp(&a.area));
        let kept: Vec<u32> = stats
            .iter()
            .take_while(|s| s.area >= min_area)
            .take(keep_top)
            .map(|s| s.label)
            .collect();
        if kept.is_empty() {
            return mask.clone();
        }
        mask_of_labels(&labels, &kept)
    }

    /// Largest component near the center, else the largest overall.
    pub fn keep_primary_blob(
        mask: &ColorMask,
        circle: &CircleGeometry,
        settings: &CleanerSettings,
    ) -> Option<ColorMask> {
        let (labels, stats) = label_components(mask);
        let mut near_center: Option<ComponentStats> = None;
        let mut largest: Option<ComponentStats> = None;
        for component in stats.into_iter().filter(|s| s.area >= settings.min_component_area) {
            if circle.offset(component.centroid) <= settings.center_tolerance
                && near_center.is_none_or(|best| component.area > best.area)
            {
                near_center = Some(component);
            }
            if largest.is_none_or(|best| component.area > best.area) {
                largest = Some(component);
            }
        }
        let chosen = near_center.or(largest)?;
        Some(mask_of_labels(&labels, &[chosen.label]))
    }

    fn label_components(mask: &ColorMask) -> (image::ImageBuffer<Luma<u32>, Vec<u32>>, Vec<ComponentStats>) {
        let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
        let mut sums: Vec<(f64, f64, f64)> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0] as usize;
            if label == 0 {
                continue;
            }
            if sums.len() < label {
                sums.resize(label, (0.0, 0.0, 0.0));
            }
            let entry = &mut sums[label - 1];
            entry.0 += 1.0;
            entry.1 += x as f64;
            entry.2 += y as f64;
        }
        let stats = sums
            .into_iter()
            .enumerate()
            .filter(|(_, (area, _, _))| *area > 0.0)
            .map(|(index, (area, sx, sy))| ComponentStats {
                label: index as u32 + 1,
                area,
                centroid: (sx / area, sy / area),
            })
            .collect();
        (labels, stats)
    }

    fn mask_of_labels(labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>, keep: &[u32]) -> ColorMask {
        GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
            if keep.contains(&labels.get_pixel(x, y)[0]) {
                Luma([FOREGROUND])
            } else {
                Luma([0])
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::blob_cleaner::*;
    use super::*;
    use approx::assert_abs_diff_eq;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn settings(min_area: f64, keep_top: usize) -> CleanerSettings {
        CleanerSettings {
            min_component_area: min_area,
            min_blob_area: 10.0,
            keep_top,
            center_tolerance: 45.0,
        }
    }

    fn square(mask: &mut GrayImage, x: i32, y: i32, side: u32) {
        draw_filled_rect_mut(mask, Rect::at(x, y).of_size(side, side), Luma([FOREGROUND]));
    }

    #[test]
    fn opening_removes_isolated_speckle() {
        let mut mask = GrayImage::new(40, 40);
        square(&mut mask, 10, 10, 10);
        mask.put_pixel(30, 30, Luma([FOREGROUND]));
        let cleaned = apply_morphology(&mask);
        assert_eq!(cleaned.get_pixel(30, 30)[0], 0);
        assert_eq!(cleaned.get_pixel(15, 15)[0], FOREGROUND);
    }

    #[test]
    fn component_budget_keeps_the_largest() {
        let mut mask = GrayImage::new(60, 60);
        square(&mut mask, 2, 2, 10);
        square(&mut mask, 30, 30, 6);
        square(&mut mask, 50, 2, 4);
        let kept = suppress_small_components(&mask, 20.0, 1);
        assert_eq!(kept.get_pixel(5, 5)[0], FOREGROUND);
        assert_eq!(kept.get_pixel(32, 32)[0], 0);
        assert_eq!(kept.get_pixel(51, 3)[0], 0);
    }

    #[test]
    fn component_budget_passes_through_when_nothing_clears_the_floor() {
        let mut mask = GrayImage::new(20, 20);
        square(&mut mask, 2, 2, 3);
        let kept = suppress_small_components(&mask, 100.0, 1);
        assert_eq!(kept, mask);
    }

    #[test]
    fn primary_blob_prefers_central_component_over_larger_edge_one() {
        let circle = CircleGeometry::new((50.0, 50.0), 50.0);
        let mut mask = GrayImage::new(100, 100);
        square(&mut mask, 45, 45, 8);
        // Bigger, but its centroid sits 45.5px away, beyond the 45px tolerance.
        square(&mut mask, 0, 44, 10);
        let chosen = keep_primary_blob(&mask, &circle, &settings(10.0, 2)).expect("blob");
        assert_eq!(chosen.get_pixel(48, 48)[0], FOREGROUND);
        assert_eq!(chosen.get_pixel(5, 48)[0], 0);
    }

    #[test]
    fn primary_blob_falls_back_to_largest_when_none_is_central() {
        let circle = CircleGeometry::new((50.0, 50.0), 50.0);
        let mut mask = GrayImage::new(100, 100);
        square(&mut mask, 0, 0, 10);
        square(&mut mask, 90, 90, 6);
        let chosen = keep_primary_blob(&mask, &circle, &settings(10.0, 2)).expect("blob");
        assert_eq!(chosen.get_pixel(4, 4)[0], FOREGROUND);
        assert_eq!(chosen.get_pixel(92, 92)[0], 0);
    }

    #[test]
    fn clean_measures_area_centroid_and_contour() {
        let circle = CircleGeometry::new((50.0, 50.0), 50.0);
        let mut mask = GrayImage::new(100, 100);
        square(&mut mask, 40, 40, 20);
        let blob = clean(&mask, &circle, &settings(10.0, 1)).expect("blob");
        assert_abs_diff_eq!(blob.centroid.0, 49.5, epsilon = 0.5);
        assert_abs_diff_eq!(blob.centroid.1, 49.5, epsilon = 0.5);
        assert!(blob.area >= 400.0);
        assert!(!blob.contour.is_empty());
    }

    #[test]
    fn empty_mask_yields_no_blob() {
        let circle = CircleGeometry::new((10.0, 10.0), 10.0);
        let mask = GrayImage::new(20, 20);
        assert!(clean(&mask, &circle, &settings(1.0, 1)).is_none());
    }

    #[test]
    fn settings_scale_areas_with_magnification() {
        let heuristics = ArrowHeuristics::default();
        let profile = MarkerProfile::target_default();
        let circle = CircleGeometry::new((250.0, 250.0), 260.0);
        let at_five = CleanerSettings::for_marker(&heuristics, &profile, &circle, 5.0);
        assert_abs_diff_eq!(at_five.min_blob_area, 30.0 * 25.0);
        assert_eq!(at_five.keep_top, 2);
        assert_abs_diff_eq!(at_five.center_tolerance, 260.0 * 0.9);
        // Original circle area is pi*52^2 ~ 8495, 0.5% of which (42.5) beats the 40px floor.
        assert_abs_diff_eq!(at_five.min_component_area, 8494.87 * 0.005 * 25.0, epsilon = 1.0);
    }
}
