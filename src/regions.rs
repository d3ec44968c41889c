use crate::color::{
    self, is_black, is_grayish, lab_from_array, lab_to_array, lab_to_rgb, median_lab, rgb_to_hex,
    GrayThresholds, LabColor, LabImage, FALLBACK_FILL_HEX,
};
use crate::geometry::{
    polygon_area, polygon_centroid, polygon_perimeter, simplify_closed, BoundingBox, GridPoint,
};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Share of the traced perimeter used as the Douglas-Peucker epsilon.
const SIMPLIFY_PERIMETER_FRACTION: f64 = 0.012;
/// Below this many eroded pixels the whole component is sampled instead.
const MIN_INTERIOR_SAMPLES: usize = 40;
const TEXTLIKE_GRAY_RATIO: f32 = 0.60;
const TEXTLIKE_MAX_AREA: f64 = 2000.0;
const TEXTLIKE_MIN_ASPECT: f64 = 2.4;

pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionTag {
    Gray,
    Black,
    Textlike,
    /// The region is the stage itself.
    Stage,
    /// Synthesized stage outline, not traced from pixels.
    StagePlaceholder,
    /// Shares pixels with the stage rectangle. Never graded.
    StageOverlap,
    /// Bounding box overlaps the stage rectangle without sharing its pixels.
    /// Non-interactive until graded.
    NearStage,
    /// Color within a few ΔE of the stage. Non-interactive until graded.
    LikeStageColor,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "STANDING")]
    Standing,
    #[serde(rename = "VIP")]
    Vip,
    #[serde(rename = "R")]
    R,
    #[serde(rename = "S")]
    S,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionColor {
    pub rgb: [u8; 3],
    pub hex: String,
}

impl RegionColor {
    pub fn from_lab(lab: LabColor) -> Self {
        let rgb = lab_to_rgb(lab);
        Self {
            rgb,
            hex: rgb_to_hex(rgb),
        }
    }

    fn fallback() -> Self {
        Self {
            rgb: [0xCC, 0xCC, 0xCC],
            hex: FALLBACK_FILL_HEX.to_string(),
        }
    }
}

/// A candidate seat section (or the stage).
///
/// Geometry and color are fixed at construction. Later stages return updated
/// copies carrying tags, distance, grouping, grade, and capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub id: usize,
    /// Open ring on the pixel-corner lattice, at least three vertices.
    pub polygon: Vec<GridPoint>,
    pub area: f64,
    pub perimeter: f64,
    pub centroid: [f64; 2],
    pub bbox: BoundingBox,
    pub pixel_count: usize,
    pub lab: [f32; 3],
    pub fill: RegionColor,
    pub gray_ratio: f32,
    pub tags: BTreeSet<RegionTag>,
    pub distance_to_stage: Option<f64>,
    pub neighbors: Vec<usize>,
    pub color_group: Option<usize>,
    pub grade: Option<Grade>,
    pub capacity: Option<u32>,
    pub component_count: Option<u32>,
    pub ratio: f64,
    pub ring_index: Option<u8>,
}

impl Region {
    /// Builds a region from a simplified ring. Returns `None` for degenerate rings.
    pub fn from_polygon(
        id: usize,
        polygon: Vec<GridPoint>,
        pixel_count: usize,
        lab: Option<LabColor>,
        gray_ratio: f32,
    ) -> Option<Self> {
        if polygon.len() < 3 {
            return None;
        }
        let area = polygon_area(&polygon);
        if area <= 0.0 {
            return None;
        }
        let (cx, cy) = polygon_centroid(&polygon);
        let (lab, fill) = match lab {
            Some(lab) => (lab_to_array(lab), RegionColor::from_lab(lab)),
            None => (
                lab_to_array(color::rgb_to_lab([0xCC, 0xCC, 0xCC])),
                RegionColor::fallback(),
            ),
        };
        Some(Self {
            id,
            perimeter: polygon_perimeter(&polygon),
            bbox: BoundingBox::of_points(&polygon),
            centroid: [cx, cy],
            polygon,
            area,
            pixel_count,
            lab,
            fill,
            gray_ratio,
            tags: BTreeSet::new(),
            distance_to_stage: None,
            neighbors: Vec::new(),
            color_group: None,
            grade: None,
            capacity: None,
            component_count: None,
            ratio: 0.0,
            ring_index: None,
        })
    }

    pub fn lab(&self) -> LabColor {
        lab_from_array(self.lab)
    }

    pub fn has(&self, tag: RegionTag) -> bool {
        self.tags.contains(&tag)
    }

    pub fn with_tag(mut self, tag: RegionTag) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn is_stage(&self) -> bool {
        self.has(RegionTag::Stage) || self.has(RegionTag::StagePlaceholder)
    }

    pub fn is_interactive(&self) -> bool {
        if self.grade.is_some() {
            return true;
        }
        !(self.is_stage()
            || self.has(RegionTag::StageOverlap)
            || self.has(RegionTag::NearStage)
            || self.has(RegionTag::LikeStageColor)
            || self.has(RegionTag::Textlike)
            || self.has(RegionTag::Gray)
            || self.has(RegionTag::Black))
    }

    pub fn display_id(&self) -> String {
        if self.has(RegionTag::StagePlaceholder) {
            "poly_STAGE".to_string()
        } else {
            format!("poly_{:04}", self.id)
        }
    }
}

/// Label connected runs of equal non-zero values, 4-connected.
pub fn label_components(values: &LabelImage) -> LabelImage {
    connected_components(values, Connectivity::Four, Luma([0u32]))
}

pub fn label_mask(mask: &GrayImage) -> LabelImage {
    connected_components(mask, Connectivity::Four, Luma([0u8]))
}

struct ComponentStats {
    pixels: Vec<u32>,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

/// Turn a label image (0 = unlabeled, each label one connected piece) into regions.
///
/// Components smaller than `min_area` are dropped. Colors are sampled from `color`.
pub fn build_regions(
    labels: &LabelImage,
    color: &LabImage,
    thresholds: &GrayThresholds,
    min_area: f64,
) -> Vec<Region> {
    let width = labels.width();
    let mut stats: HashMap<u32, ComponentStats> = HashMap::new();
    for (idx, label) in labels.as_raw().iter().enumerate() {
        if *label == 0 {
            continue;
        }
        let x = idx as u32 % width;
        let y = idx as u32 / width;
        let entry = stats.entry(*label).or_insert_with(|| ComponentStats {
            pixels: Vec::new(),
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        });
        entry.pixels.push(idx as u32);
        entry.min_x = entry.min_x.min(x);
        entry.min_y = entry.min_y.min(y);
        entry.max_x = entry.max_x.max(x);
        entry.max_y = entry.max_y.max(y);
    }

    let mut ordered: Vec<(u32, ComponentStats)> = stats.into_iter().collect();
    ordered.sort_by_key(|(label, _)| *label);

    let mut regions = Vec::new();
    for (label, component) in ordered {
        if (component.pixels.len() as f64) < min_area {
            continue;
        }
        let Some(ring) = trace_outer_ring(labels, label, &component) else {
            continue;
        };
        let epsilon = SIMPLIFY_PERIMETER_FRACTION * polygon_perimeter(&ring);
        let polygon = simplify_closed(&ring, epsilon);
        if polygon_area(&polygon) < min_area {
            continue;
        }

        let samples = interior_samples(labels, label, &component, color);
        let gray_pixels = component
            .pixels
            .iter()
            .filter(|idx| is_grayish(color.pixels[**idx as usize], thresholds))
            .count();
        let gray_ratio = gray_pixels as f32 / component.pixels.len().max(1) as f32;

        if let Some(region) = Region::from_polygon(
            regions.len(),
            polygon,
            component.pixels.len(),
            median_lab(&samples),
            gray_ratio,
        ) {
            regions.push(region);
        }
    }
    regions
}

/// Mask convenience: label, then build.
pub fn build_regions_from_mask(
    mask: &GrayImage,
    color: &LabImage,
    thresholds: &GrayThresholds,
    min_area: f64,
) -> Vec<Region> {
    build_regions(&label_mask(mask), color, thresholds, min_area)
}

/// Median color comes from pixels whose 8 neighbours share the label, so
/// anti-aliased borders do not bleed into the fill.
fn interior_samples(
    labels: &LabelImage,
    label: u32,
    component: &ComponentStats,
    color: &LabImage,
) -> Vec<LabColor> {
    let width = labels.width() as i64;
    let height = labels.height() as i64;
    let raw = labels.as_raw();
    let same = |x: i64, y: i64| -> bool {
        x >= 0 && y >= 0 && x < width && y < height && raw[(y * width + x) as usize] == label
    };

    let mut interior = Vec::new();
    for idx in &component.pixels {
        let x = *idx as i64 % width;
        let y = *idx as i64 / width;
        let mut all = true;
        'scan: for dy in -1..=1 {
            for dx in -1..=1 {
                if !same(x + dx, y + dy) {
                    all = false;
                    break 'scan;
                }
            }
        }
        if all {
            interior.push(color.pixels[*idx as usize]);
        }
    }

    if interior.len() < MIN_INTERIOR_SAMPLES {
        return component
            .pixels
            .iter()
            .map(|idx| color.pixels[*idx as usize])
            .collect();
    }
    interior
}

/// Trace the boundary of one label as pixel-edge loops and keep the outermost.
fn trace_outer_ring(
    labels: &LabelImage,
    label: u32,
    component: &ComponentStats,
) -> Option<Vec<GridPoint>> {
    let width = labels.width() as usize;
    let height = labels.height() as usize;
    let raw = labels.as_raw();
    let is_label = |x: usize, y: usize| raw[y * width + x] == label;

    let mut segments = Vec::<(GridPoint, GridPoint)>::new();
    for y in component.min_y as usize..=component.max_y as usize {
        for x in component.min_x as usize..=component.max_x as usize {
            if !is_label(x, y) {
                continue;
            }
            let (xi, yi) = (x as i32, y as i32);
            if y == 0 || !is_label(x, y - 1) {
                segments.push((GridPoint::new(xi, yi), GridPoint::new(xi + 1, yi)));
            }
            if x + 1 >= width || !is_label(x + 1, y) {
                segments.push((GridPoint::new(xi + 1, yi), GridPoint::new(xi + 1, yi + 1)));
            }
            if y + 1 >= height || !is_label(x, y + 1) {
                segments.push((GridPoint::new(xi + 1, yi + 1), GridPoint::new(xi, yi + 1)));
            }
            if x == 0 || !is_label(x - 1, y) {
                segments.push((GridPoint::new(xi, yi + 1), GridPoint::new(xi, yi)));
            }
        }
    }
    if segments.is_empty() {
        return None;
    }

    let mut starts = HashMap::<GridPoint, Vec<usize>>::new();
    for (idx, segment) in segments.iter().enumerate() {
        starts.entry(segment.0).or_default().push(idx);
    }
    for outgoing in starts.values_mut() {
        outgoing.sort_by(|a, b| {
            let da = direction_rank(segments[*a].0, segments[*a].1);
            let db = direction_rank(segments[*b].0, segments[*b].1);
            da.cmp(&db).then(a.cmp(b))
        });
    }

    let mut used = vec![false; segments.len()];
    let mut best: Option<(f64, Vec<GridPoint>)> = None;

    for seg_idx in 0..segments.len() {
        if used[seg_idx] {
            continue;
        }

        let mut loop_points = Vec::<GridPoint>::new();
        let loop_start = segments[seg_idx].0;
        let mut current = loop_start;
        let mut safety = 0usize;

        loop {
            safety += 1;
            if safety > segments.len() + 2 {
                break;
            }
            let Some(outgoing) = starts.get(&current) else {
                break;
            };
            let Some(selected) = outgoing.iter().copied().find(|c| !used[*c]) else {
                break;
            };

            used[selected] = true;
            let (start, end) = segments[selected];
            if loop_points.is_empty() {
                loop_points.push(start);
            }
            loop_points.push(end);
            current = end;
            if current == loop_start {
                break;
            }
        }

        if loop_points.len() < 4 || loop_points.first() != loop_points.last() {
            continue;
        }
        loop_points.pop();
        let ring = drop_collinear(loop_points);
        if ring.len() < 3 {
            continue;
        }
        let area = polygon_area(&ring);
        if best.as_ref().map_or(true, |(a, _)| area > *a) {
            best = Some((area, ring));
        }
    }

    best.map(|(_, ring)| ring)
}

fn drop_collinear(ring: Vec<GridPoint>) -> Vec<GridPoint> {
    let len = ring.len();
    if len < 3 {
        return ring;
    }
    (0..len)
        .filter(|&i| {
            let prev = ring[(i + len - 1) % len];
            let curr = ring[i];
            let next = ring[(i + 1) % len];
            let collinear_x = prev.x == curr.x && curr.x == next.x;
            let collinear_y = prev.y == curr.y && curr.y == next.y;
            !(collinear_x || collinear_y)
        })
        .map(|i| ring[i])
        .collect()
}

fn direction_rank(from: GridPoint, to: GridPoint) -> i32 {
    match (to.x - from.x, to.y - from.y) {
        (1, 0) => 0,
        (0, 1) => 1,
        (-1, 0) => 2,
        (0, -1) => 3,
        _ => 4,
    }
}

/// Attach gray / black / textlike tags from the region's own color statistics.
pub fn classify(regions: Vec<Region>, thresholds: &GrayThresholds) -> Vec<Region> {
    regions
        .into_iter()
        .map(|mut region| {
            let lab = region.lab();
            if is_grayish(lab, thresholds) {
                region.tags.insert(RegionTag::Gray);
            }
            if is_black(lab, thresholds.black_l_max) {
                region.tags.insert(RegionTag::Black);
            }
            let aspect = region.bbox.elongation();
            if region.gray_ratio >= TEXTLIKE_GRAY_RATIO
                && region.area <= TEXTLIKE_MAX_AREA
                && aspect >= TEXTLIKE_MIN_ASPECT
            {
                region.tags.insert(RegionTag::Textlike);
            }
            region
        })
        .collect()
}

/// Renumber ids sequentially in list order.
pub fn renumber(regions: Vec<Region>) -> Vec<Region> {
    regions
        .into_iter()
        .enumerate()
        .map(|(id, mut region)| {
            region.id = id;
            region
        })
        .collect()
}
