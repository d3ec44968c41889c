//! Removal of duplicate, nested, and sub-polygon artifacts left by the ensemble.
//!
//! Every pass only drops regions, and each drop is decided against the pass's
//! full input set, so a second application finds nothing more to remove.

use crate::color::delta_e;
use crate::geometry::{count_set, point_in_polygon, rasterize_polygon, BoundingBox};
use crate::regions::Region;
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use serde::{Deserialize, Serialize};

const ISLAND_MAX_RATIO: f64 = 0.06;
const ISLAND_MAX_DELTA_E: f32 = 10.0;
const NESTED_MAX_RATIO: f64 = 0.15;
const SUB_POLYGON_MAX_RATIO: f64 = 0.28;
const SUB_POLYGON_MIN_COVER: f64 = 0.88;
const SUB_POLYGON_MAX_DELTA_E: f32 = 12.0;
const DILATION_FRACTION: f64 = 0.004;

/// Regions removed by each pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub islands: usize,
    pub nested: usize,
    pub sub_polygons: usize,
}

/// Dilation radius for the sub-polygon pass, 0.4% of the long side within 1..=4 px.
pub fn dilation_radius(width: u32, height: u32) -> u8 {
    (width.max(height) as f64 * DILATION_FRACTION)
        .round()
        .clamp(1.0, 4.0) as u8
}

pub fn cleanup_regions(regions: Vec<Region>, width: u32, height: u32) -> (Vec<Region>, CleanupReport) {
    let before = regions.len();
    let regions = drop_where(regions, is_inner_island);
    let islands = before - regions.len();

    let before = regions.len();
    let regions = drop_where(regions, is_nested_in_same_group);
    let nested = before - regions.len();

    let radius = dilation_radius(width, height);
    let before = regions.len();
    let regions = drop_where(regions, |small, large| is_sub_polygon(small, large, radius));
    let sub_polygons = before - regions.len();

    let report = CleanupReport {
        islands,
        nested,
        sub_polygons,
    };
    log::info!(
        "cleanup removed {} islands, {} nested, {} sub-polygons; {} regions remain",
        report.islands,
        report.nested,
        report.sub_polygons,
        regions.len()
    );
    (regions, report)
}

/// Drop every non-stage region that `dominated(small, large)` holds for against
/// some strictly larger region of the same input.
fn drop_where<F>(regions: Vec<Region>, dominated: F) -> Vec<Region>
where
    F: Fn(&Region, &Region) -> bool,
{
    let doomed: Vec<bool> = regions
        .iter()
        .map(|small| {
            !small.is_stage()
                && regions.iter().any(|large| {
                    large.id != small.id
                        && large.area > small.area
                        && large.bbox.touches(&small.bbox)
                        && dominated(small, large)
                })
        })
        .collect();
    regions
        .into_iter()
        .zip(doomed)
        .filter_map(|(region, drop)| (!drop).then_some(region))
        .collect()
}

fn area_ratio(small: &Region, large: &Region) -> f64 {
    small.area / large.area
}

fn centroid_inside(small: &Region, large: &Region) -> bool {
    point_in_polygon(small.centroid[0], small.centroid[1], &large.polygon)
}

fn same_group(a: &Region, b: &Region) -> bool {
    matches!((a.color_group, b.color_group), (Some(x), Some(y)) if x == y)
}

fn is_inner_island(small: &Region, large: &Region) -> bool {
    area_ratio(small, large) < ISLAND_MAX_RATIO
        && large.bbox.contains_box(&small.bbox)
        && centroid_inside(small, large)
        && delta_e(small.lab(), large.lab()) < ISLAND_MAX_DELTA_E
}

fn is_nested_in_same_group(small: &Region, large: &Region) -> bool {
    area_ratio(small, large) < NESTED_MAX_RATIO
        && same_group(small, large)
        && centroid_inside(small, large)
}

fn is_sub_polygon(small: &Region, large: &Region, radius: u8) -> bool {
    if area_ratio(small, large) >= SUB_POLYGON_MAX_RATIO {
        return false;
    }
    if !same_group(small, large) && delta_e(small.lab(), large.lab()) >= SUB_POLYGON_MAX_DELTA_E {
        return false;
    }
    covered_fraction(small, large, radius) >= SUB_POLYGON_MIN_COVER
}

/// Share of `small`'s pixels inside `large` dilated by `radius`.
fn covered_fraction(small: &Region, large: &Region, radius: u8) -> f64 {
    let frame: BoundingBox = small.bbox.expanded(radius as i32 + 1);
    let small_mask = rasterize_polygon(&small.polygon, &frame);
    let total = count_set(&small_mask);
    if total == 0 {
        return 0.0;
    }
    let large_mask = dilate(&rasterize_polygon(&large.polygon, &frame), Norm::LInf, radius);
    let inside = small_mask
        .as_raw()
        .iter()
        .zip(large_mask.as_raw())
        .filter(|(s, l)| **s > 0 && **l > 0)
        .count();
    inside as f64 / total as f64
}
