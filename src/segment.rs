//! Independent segmenters plus the overlap vote that reconciles them.

use crate::color::{delta_e, GrayThresholds, LabColor, LabImage};
use crate::config::{PipelineConfig, SegmentationMode};
use crate::error::{DegradedSignal, SegmenterKind, Warnings};
use crate::geometry::{bbox_iou, polygon_iou};
use crate::regions::{
    build_regions, build_regions_from_mask, label_components, renumber, LabelImage, Region,
};
use image::{GrayImage, Luma};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use imageproc::gradients::sobel_gradients;
use imageproc::region_labelling::{connected_components, Connectivity};
use palette::Lab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Superpixel cell side as a share of the short image side, floored at `MIN_CELL`.
const CELL_FRACTION: f64 = 0.02;
const MIN_CELL: u32 = 8;
/// Watershed markers are pixels at least this share of the peak distance from background.
const MARKER_PEAK_FRACTION: f64 = 0.35;
/// Unvoted regions survive when larger than this multiple of the median candidate area.
const LARGE_REGION_FACTOR: f64 = 1.5;

/// Read-only inputs shared by every segmenter.
pub struct SegmentationInput<'a> {
    pub foreground: &'a GrayImage,
    /// Original colors, used for region fills.
    pub color: &'a LabImage,
    /// Text-suppressed colors, used to decide where regions split.
    pub clean: &'a LabImage,
    pub thresholds: &'a GrayThresholds,
    pub min_area: f64,
}

/// Direct connected components of the foreground mask.
pub fn segment_components(input: &SegmentationInput<'_>) -> Vec<Region> {
    build_regions_from_mask(
        input.foreground,
        input.color,
        input.thresholds,
        input.min_area,
    )
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Grid cells over the foreground, merged when adjacent cell means are within `delta`.
pub fn segment_superpixels(input: &SegmentationInput<'_>, delta: f32) -> Vec<Region> {
    let (width, height) = input.foreground.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let step = ((width.min(height) as f64 * CELL_FRACTION).round() as u32).max(MIN_CELL);
    let cols = width.div_ceil(step) as usize;
    let rows = height.div_ceil(step) as usize;

    let mut sums = vec![[0f64; 3]; cols * rows];
    let mut counts = vec![0usize; cols * rows];
    for (x, y, fg) in input.foreground.enumerate_pixels() {
        if fg[0] == 0 {
            continue;
        }
        let cell = (y / step) as usize * cols + (x / step) as usize;
        let lab = input.clean.at(x, y);
        sums[cell][0] += lab.l as f64;
        sums[cell][1] += lab.a as f64;
        sums[cell][2] += lab.b as f64;
        counts[cell] += 1;
    }
    let means: Vec<Option<LabColor>> = sums
        .iter()
        .zip(counts.iter())
        .map(|(s, c)| {
            (*c > 0).then(|| {
                let n = *c as f64;
                Lab::new((s[0] / n) as f32, (s[1] / n) as f32, (s[2] / n) as f32)
            })
        })
        .collect();

    let mut groups = UnionFind::new(cols * rows);
    for row in 0..rows {
        for col in 0..cols {
            let cell = row * cols + col;
            let Some(mean) = means[cell] else {
                continue;
            };
            let mut neighbours = Vec::with_capacity(2);
            if col + 1 < cols {
                neighbours.push(cell + 1);
            }
            if row + 1 < rows {
                neighbours.push(cell + cols);
            }
            for other in neighbours {
                if let Some(other_mean) = means[other] {
                    if delta_e(mean, other_mean) <= delta {
                        groups.union(cell, other);
                    }
                }
            }
        }
    }

    let mut grouped = LabelImage::new(width, height);
    for (x, y, fg) in input.foreground.enumerate_pixels() {
        if fg[0] == 0 {
            continue;
        }
        let cell = (y / step) as usize * cols + (x / step) as usize;
        grouped.put_pixel(x, y, Luma([groups.find(cell) as u32 + 1]));
    }

    build_regions(
        &label_components(&grouped),
        input.color,
        input.thresholds,
        input.min_area,
    )
}

const UNVISITED: i32 = -1;
const BASIN_EDGE: i32 = 0;

/// Marker-based watershed.
///
/// Markers are the pixels deep inside the foreground (distance transform
/// above a share of its peak); the flood proceeds in order of increasing
/// gradient of the text-suppressed lightness, so touching blocks of different
/// color split along their shared edge.
pub fn segment_watershed(input: &SegmentationInput<'_>) -> Vec<Region> {
    let (width, height) = input.foreground.dimensions();
    let fg = input.foreground.as_raw();
    if fg.iter().all(|v| *v == 0) || fg.iter().all(|v| *v > 0) {
        return Vec::new();
    }

    let background = GrayImage::from_fn(width, height, |x, y| {
        if input.foreground.get_pixel(x, y)[0] == 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let dist = euclidean_squared_distance_transform(&background);
    let peak = dist
        .as_raw()
        .iter()
        .zip(fg.iter())
        .filter(|(_, f)| **f > 0)
        .map(|(d, _)| d.sqrt())
        .fold(0.0f64, f64::max);
    if peak < 1.0 {
        return Vec::new();
    }
    let cut = peak * MARKER_PEAK_FRACTION;
    let sure = GrayImage::from_fn(width, height, |x, y| {
        let inside = input.foreground.get_pixel(x, y)[0] > 0;
        if inside && dist.get_pixel(x, y)[0].sqrt() >= cut {
            Luma([255])
        } else {
            Luma([0])
        }
    });
    let markers = connected_components(&sure, Connectivity::Eight, Luma([0u8]));

    let gradient = sobel_gradients(&input.clean.lightness());
    let w = width as usize;
    let h = height as usize;
    let mut labels: Vec<i32> = markers
        .as_raw()
        .iter()
        .map(|m| if *m > 0 { *m as i32 } else { UNVISITED })
        .collect();
    let mut queued = vec![false; w * h];
    let mut heap: BinaryHeap<Reverse<(u16, usize, usize)>> = BinaryHeap::new();
    let mut seq = 0usize;

    let neighbours = |idx: usize| -> [Option<usize>; 4] {
        let x = idx % w;
        let y = idx / w;
        [
            (x > 0).then(|| idx - 1),
            (x + 1 < w).then(|| idx + 1),
            (y > 0).then(|| idx - w),
            (y + 1 < h).then(|| idx + w),
        ]
    };

    for idx in 0..w * h {
        if labels[idx] <= 0 {
            continue;
        }
        for n in neighbours(idx).into_iter().flatten() {
            if fg[n] > 0 && labels[n] == UNVISITED && !queued[n] {
                queued[n] = true;
                heap.push(Reverse((gradient.as_raw()[n], seq, n)));
                seq += 1;
            }
        }
    }

    while let Some(Reverse((_, _, idx))) = heap.pop() {
        let mut owner = UNVISITED;
        for n in neighbours(idx).into_iter().flatten() {
            let label = labels[n];
            if label <= 0 {
                continue;
            }
            if owner == UNVISITED {
                owner = label;
            } else if owner != label {
                owner = BASIN_EDGE;
                break;
            }
        }
        labels[idx] = if owner == UNVISITED { BASIN_EDGE } else { owner };
        if labels[idx] == BASIN_EDGE {
            continue;
        }
        for n in neighbours(idx).into_iter().flatten() {
            if fg[n] > 0 && labels[n] == UNVISITED && !queued[n] {
                queued[n] = true;
                heap.push(Reverse((gradient.as_raw()[n], seq, n)));
                seq += 1;
            }
        }
    }

    let basins = LabelImage::from_fn(width, height, |x, y| {
        let label = labels[y as usize * w + x as usize];
        Luma([label.max(0) as u32])
    });
    build_regions(
        &label_components(&basins),
        input.color,
        input.thresholds,
        input.min_area,
    )
}

/// Pool every candidate and keep what the segmenters agree on.
///
/// Candidates are visited in pool order. Each unconsumed candidate gathers the
/// later unconsumed candidates that overlap it (bbox IoU at least
/// `bbox_floor`, polygon IoU at least `iou_threshold`). A group of two or more
/// keeps its largest member and consumes the rest. Candidates left alone
/// survive only when much larger than the median candidate. Ids are
/// renumbered in keep order.
pub fn reconcile(candidates: Vec<Region>, iou_threshold: f64, bbox_floor: f64) -> Vec<Region> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let median_area = median(candidates.iter().map(|r| r.area).collect());

    let mut consumed = vec![false; candidates.len()];
    let mut kept: Vec<usize> = Vec::new();
    for i in 0..candidates.len() {
        if consumed[i] {
            continue;
        }
        let mut group = vec![i];
        for j in (i + 1)..candidates.len() {
            if consumed[j] {
                continue;
            }
            if agrees(&candidates[i], &candidates[j], iou_threshold, bbox_floor) {
                group.push(j);
            }
        }
        if group.len() < 2 {
            continue;
        }
        let mut best = group[0];
        for &member in &group[1..] {
            if candidates[member].area > candidates[best].area {
                best = member;
            }
        }
        for member in group {
            consumed[member] = true;
        }
        kept.push(best);
    }

    for (i, region) in candidates.iter().enumerate() {
        if !consumed[i] && region.area > LARGE_REGION_FACTOR * median_area {
            kept.push(i);
        }
    }

    let mut slots: Vec<Option<Region>> = candidates.into_iter().map(Some).collect();
    renumber(kept.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn agrees(a: &Region, b: &Region, iou_threshold: f64, bbox_floor: f64) -> bool {
    bbox_iou(&a.bbox, &b.bbox) >= bbox_floor && polygon_iou(&a.polygon, &b.polygon) >= iou_threshold
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Run the segmenters for the configured mode and reconcile their output.
pub fn run_ensemble(
    input: &SegmentationInput<'_>,
    config: &PipelineConfig,
    warnings: &mut Warnings,
) -> Vec<Region> {
    let mut runs: Vec<(SegmenterKind, Vec<Region>)> = vec![
        (SegmenterKind::Components, segment_components(input)),
        (
            SegmenterKind::Superpixels,
            segment_superpixels(input, config.color_delta),
        ),
    ];
    if config.mode == SegmentationMode::Full {
        runs.push((SegmenterKind::Watershed, segment_watershed(input)));
    }

    let mut pool = Vec::new();
    for (kind, regions) in runs {
        log::debug!("segmenter {:?} produced {} regions", kind, regions.len());
        if regions.is_empty() {
            warnings.push(DegradedSignal::EmptySegmenter { segmenter: kind });
        }
        pool.extend(regions);
    }
    let pooled = pool.len();
    let kept = reconcile(
        renumber(pool),
        config.ensemble_iou_threshold,
        config.ensemble_bbox_iou_floor,
    );
    log::info!("ensemble kept {} of {} candidate regions", kept.len(), pooled);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::tests::{rect_region, thresholds};
    use image::{Rgb, RgbImage};

    fn paint(image: &mut RgbImage, x0: u32, y0: u32, w: u32, h: u32, rgb: [u8; 3]) {
        for y in y0..y0 + h {
            for x in x0..x0 + w {
                image.put_pixel(x, y, Rgb(rgb));
            }
        }
    }

    fn mask_from(image: &RgbImage) -> GrayImage {
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            if image.get_pixel(x, y).0 == [255, 255, 255] {
                Luma([0])
            } else {
                Luma([255])
            }
        })
    }

    /// Red and blue blocks that touch, plus a detached green block.
    fn touching_blocks() -> RgbImage {
        let mut image = RgbImage::from_pixel(160, 100, Rgb([255, 255, 255]));
        paint(&mut image, 8, 8, 40, 40, [220, 20, 30]);
        paint(&mut image, 48, 8, 40, 40, [30, 60, 210]);
        paint(&mut image, 112, 48, 40, 40, [20, 160, 60]);
        image
    }

    #[test]
    fn components_merge_touching_blocks() {
        let image = touching_blocks();
        let lab = LabImage::from_rgb(&image);
        let mask = mask_from(&image);
        let input = SegmentationInput {
            foreground: &mask,
            color: &lab,
            clean: &lab,
            thresholds: &thresholds(),
            min_area: 50.0,
        };
        let regions = segment_components(&input);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].area, 3200.0);
    }

    #[test]
    fn superpixels_split_touching_blocks_by_color() {
        let image = touching_blocks();
        let lab = LabImage::from_rgb(&image);
        let mask = mask_from(&image);
        let input = SegmentationInput {
            foreground: &mask,
            color: &lab,
            clean: &lab,
            thresholds: &thresholds(),
            min_area: 50.0,
        };
        let regions = segment_superpixels(&input, 22.0);
        assert_eq!(regions.len(), 3);
        let mut areas: Vec<f64> = regions.iter().map(|r| r.area).collect();
        areas.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(areas.iter().all(|a| (*a - 1600.0).abs() < 1.0), "{:?}", areas);
    }

    #[test]
    fn watershed_keeps_detached_blocks_apart() {
        let image = touching_blocks();
        let lab = LabImage::from_rgb(&image);
        let mask = mask_from(&image);
        let input = SegmentationInput {
            foreground: &mask,
            color: &lab,
            clean: &lab,
            thresholds: &thresholds(),
            min_area: 50.0,
        };
        let regions = segment_watershed(&input);
        let mut areas: Vec<f64> = regions.iter().map(|r| r.area).collect();
        areas.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(areas, vec![1600.0, 3200.0]);
    }

    #[test]
    fn watershed_splits_blocks_joined_by_a_neck() {
        let mut image = RgbImage::from_pixel(120, 60, Rgb([255, 255, 255]));
        paint(&mut image, 8, 8, 40, 40, [220, 20, 30]);
        paint(&mut image, 64, 8, 40, 40, [220, 20, 30]);
        paint(&mut image, 48, 26, 16, 4, [220, 20, 30]);
        let lab = LabImage::from_rgb(&image);
        let mask = mask_from(&image);
        let input = SegmentationInput {
            foreground: &mask,
            color: &lab,
            clean: &lab,
            thresholds: &thresholds(),
            min_area: 50.0,
        };

        assert_eq!(segment_components(&input).len(), 1);
        let regions = segment_watershed(&input);
        assert_eq!(regions.len(), 2);
        for region in &regions {
            assert!(region.area > 1550.0 && region.area < 1700.0, "area {}", region.area);
        }
    }

    #[test]
    fn watershed_on_empty_foreground_is_empty() {
        let image = RgbImage::from_pixel(40, 40, Rgb([255, 255, 255]));
        let lab = LabImage::from_rgb(&image);
        let mask = GrayImage::new(40, 40);
        let input = SegmentationInput {
            foreground: &mask,
            color: &lab,
            clean: &lab,
            thresholds: &thresholds(),
            min_area: 10.0,
        };
        assert!(segment_watershed(&input).is_empty());
        assert!(segment_superpixels(&input, 22.0).is_empty());
    }

    #[test]
    fn agreeing_candidates_keep_largest_once() {
        let a = rect_region(0, 0, 0, 100, 100, [220, 20, 30]);
        let b = rect_region(1, 2, 2, 96, 96, [220, 20, 30]);
        let c = rect_region(2, 300, 300, 20, 20, [30, 60, 210]);
        let kept = reconcile(vec![a, b, c], 0.65, 0.10);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, 0);
        assert_eq!(kept[0].area, 10_000.0);
    }

    #[test]
    fn lone_large_region_survives_without_votes() {
        let small = |id, x| rect_region(id, x, 0, 10, 10, [220, 20, 30]);
        let big = rect_region(3, 0, 200, 80, 80, [30, 60, 210]);
        let candidates = vec![small(0, 0), small(1, 0), small(2, 100), big];
        let kept = reconcile(candidates, 0.65, 0.10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].area, 100.0);
        assert_eq!(kept[1].area, 6400.0);
        assert_eq!(kept[1].id, 1);
    }

    #[test]
    fn reconcile_of_nothing_is_nothing() {
        assert!(reconcile(Vec::new(), 0.65, 0.10).is_empty());
    }
}
