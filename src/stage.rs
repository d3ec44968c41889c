//! Stage localisation.
//!
//! The stage rectangle is the origin every grade distance is measured from, so
//! `locate_stage` never fails: it walks a chain of progressively weaker
//! signals and ends at a fixed top-centre default.

use crate::color::{chroma, delta_e, is_grayish, median_lab, GrayThresholds, LabColor, LabImage};
use crate::config::PipelineConfig;
use crate::error::{DegradedSignal, StageSource, Warnings};
use crate::geometry::{bbox_iou, rasterize_polygon, BoundingBox};
use crate::ocr::{stage_text_box, OcrLine};
use crate::regions::{Region, RegionTag};
use image::imageops::{resize, FilterType};
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{close, open};
use imageproc::region_labelling::{connected_components, Connectivity};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

// Region heuristic.
const STRICT_MIN_AREA_FRACTION: f64 = 0.002;
const STRICT_MIN_ELONGATION: f64 = 1.6;
const RELAXED_MIN_AREA_FRACTION: f64 = 0.010;
const RELAXED_MIN_ELONGATION: f64 = 1.8;
const TOP_BAND_BONUS: f64 = 0.10;
const CENTER_BAND_BONUS: f64 = 0.06;

// Gray mask.
const GRAY_MASK_MAX_SIDE: u32 = 256;
/// Lightness (0..=255 scale) a pixel must sit below its local background.
const GRAY_MASK_DARKER_BY: i32 = 15;
const GRAY_MASK_BORDER: f64 = 0.01;
const GRAY_MASK_MIN_ELONGATION: f64 = 2.2;
const GRAY_WIDTH_WEIGHT: f64 = 0.55;
const GRAY_THINNESS_WEIGHT: f64 = 0.35;
const GRAY_TOP_WEIGHT: f64 = 0.10;

// Text template.
const TEMPLATE_MAX_SIDE: u32 = 400;
const TEMPLATE_SCALES: [u32; 5] = [1, 2, 3, 4, 5];
const TEMPLATE_STRIDE: usize = 2;
const TEMPLATE_FLOOR: f64 = 0.42;
const TEMPLATE_CENTER_PENALTY: f64 = 0.12;
const TEMPLATE_LOWER_HALF_PENALTY: f64 = 0.08;
const TEMPLATE_DEPTH_PENALTY: f64 = 0.06;

// Positional default: a 30% x 6% box centred at (W/2, 0.10 H).
const DEFAULT_CENTER_Y: f64 = 0.10;
const DEFAULT_WIDTH: f64 = 0.30;
const DEFAULT_HEIGHT: f64 = 0.06;

const STAGE_PADDING: f64 = 0.01;

// Overlap marking.
const OVERLAP_BBOX_IOU: f64 = 0.025;
const OVERLAP_FRACTION: f64 = 0.02;
const STAGE_COVER_FRACTION: f64 = 0.5;
/// A pixel belongs to a region when it is this close to the region's color.
const MEMBER_DELTA_E: f32 = 12.0;
const LIKE_STAGE_DELTA_E: f32 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReference {
    pub rect: BoundingBox,
    /// Grading distance origin, bottom-centre of `rect` unless overridden.
    pub anchor: [f64; 2],
    pub source: StageSource,
    /// Set when the rectangle came from an existing region.
    pub region_id: Option<usize>,
}

/// Everything the locator may consult besides the region list.
pub struct StageContext<'a> {
    pub lab: &'a LabImage,
    pub thresholds: &'a GrayThresholds,
    pub config: &'a PipelineConfig,
    pub ocr_lines: &'a [OcrLine],
}

pub fn locate_stage(
    regions: &[Region],
    ctx: &StageContext<'_>,
    warnings: &mut Warnings,
) -> StageReference {
    let width = ctx.lab.width;
    let height = ctx.lab.height;

    let (rect, source, region_id) = if let Some(rect) =
        stage_text_box(ctx.ocr_lines, ctx.config.ocr_min_score, width, height)
    {
        (rect, StageSource::Ocr, None)
    } else if let Some((rect, id)) = find_by_regions(regions, width, height, ctx.config, ctx.thresholds) {
        (rect, StageSource::RegionHeuristic, Some(id))
    } else {
        warnings.push(DegradedSignal::StageTierMissed {
            tier: StageSource::RegionHeuristic,
        });
        if let Some(rect) = find_by_gray_mask(ctx.lab, ctx.thresholds, ctx.config.prefer_top_stage) {
            (rect, StageSource::GrayMask, None)
        } else {
            warnings.push(DegradedSignal::StageTierMissed {
                tier: StageSource::GrayMask,
            });
            let gray = ctx.lab.lightness();
            if let Some(rect) = find_by_template(&gray, ctx.config.prefer_top_stage) {
                (rect, StageSource::TextTemplate, None)
            } else {
                warnings.push(DegradedSignal::StageTierMissed {
                    tier: StageSource::TextTemplate,
                });
                warnings.push(DegradedSignal::StagePositionalDefault);
                (positional_default(width, height), StageSource::PositionalDefault, None)
            }
        }
    };

    let pad = (width.max(height) as f64 * STAGE_PADDING).round() as i32;
    let mut rect = rect.expanded(pad).clamp_to(width, height);
    if rect.w == 0 || rect.h == 0 {
        rect = positional_default(width, height);
    }
    let anchor = ctx
        .config
        .stage_anchor_override
        .unwrap_or([rect.x as f64 + rect.w as f64 / 2.0, rect.bottom() as f64]);

    log::info!(
        "stage located via {:?} at ({}, {}) {}x{}",
        source,
        rect.x,
        rect.y,
        rect.w,
        rect.h
    );
    StageReference {
        rect,
        anchor,
        source,
        region_id,
    }
}

/// Score for a region-derived stage candidate.
pub fn region_candidate_score(bbox_area: f64, position_bonus: f64) -> f64 {
    bbox_area * (1.0 + position_bonus)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Band {
    Top,
    Bottom,
    Center,
}

fn band_of(cy: f64, height: f64, config: &PipelineConfig) -> Option<Band> {
    if cy <= height * config.stage_edge_band {
        Some(Band::Top)
    } else if cy >= height * (1.0 - config.stage_edge_band) {
        Some(Band::Bottom)
    } else if (cy - height / 2.0).abs() <= height * config.stage_center_band / 2.0 {
        Some(Band::Center)
    } else {
        None
    }
}

fn position_bonus(band: Band, prefer_top: bool) -> f64 {
    match band {
        Band::Top if prefer_top => TOP_BAND_BONUS,
        Band::Center => CENTER_BAND_BONUS,
        _ => 0.0,
    }
}

/// Elongated region in a top, bottom, or centre band. Gray candidates first;
/// larger colored ones only when no gray candidate qualifies.
pub fn find_by_regions(
    regions: &[Region],
    width: u32,
    height: u32,
    config: &PipelineConfig,
    thresholds: &GrayThresholds,
) -> Option<(BoundingBox, usize)> {
    let image_area = width as f64 * height as f64;
    let pick = |strict: bool| -> Option<(BoundingBox, usize)> {
        let mut best: Option<(f64, BoundingBox, usize)> = None;
        for region in regions {
            if region.has(RegionTag::Textlike) {
                continue;
            }
            let (_, cy) = region.bbox.center();
            let Some(band) = band_of(cy, height as f64, config) else {
                continue;
            };
            let area = region.bbox.area();
            let elongation = region.bbox.elongation();
            let qualifies = if strict {
                let grayish = region.has(RegionTag::Gray)
                    || region.has(RegionTag::Black)
                    || is_grayish(region.lab(), thresholds);
                grayish
                    && area >= STRICT_MIN_AREA_FRACTION * image_area
                    && elongation >= STRICT_MIN_ELONGATION
            } else {
                area >= RELAXED_MIN_AREA_FRACTION * image_area
                    && elongation >= RELAXED_MIN_ELONGATION
            };
            if !qualifies {
                continue;
            }
            let score =
                region_candidate_score(area, position_bonus(band, config.prefer_top_stage));
            if best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                best = Some((score, region.bbox, region.id));
            }
        }
        best.map(|(_, bbox, id)| (bbox, id))
    };
    pick(true).or_else(|| pick(false))
}

/// Score for a gray-mask contour.
pub fn gray_candidate_score(width_fraction: f64, thinness: f64, top_bias: f64) -> f64 {
    GRAY_WIDTH_WEIGHT * width_fraction + GRAY_THINNESS_WEIGHT * thinness + GRAY_TOP_WEIGHT * top_bias
}

/// Low-chroma blobs darker than their local background, after stripping
/// strokes thin enough to be lines or lettering.
pub fn find_by_gray_mask(
    lab: &LabImage,
    thresholds: &GrayThresholds,
    prefer_top: bool,
) -> Option<BoundingBox> {
    let (width, height) = (lab.width, lab.height);
    if width < 4 || height < 4 {
        return None;
    }
    let lightness = lab.lightness();
    let scale = (GRAY_MASK_MAX_SIDE as f64 / width.max(height) as f64).min(1.0);
    let sw = ((width as f64 * scale).round() as u32).max(1);
    let sh = ((height as f64 * scale).round() as u32).max(1);
    let small = resize(&lightness, sw, sh, FilterType::Triangle);
    let radius = (sw.max(sh) / 8).max(3);
    let background = resize(&median_filter(&small, radius, radius), width, height, FilterType::Triangle);

    let border_x = (width as f64 * GRAY_MASK_BORDER).ceil() as u32;
    let border_y = (height as f64 * GRAY_MASK_BORDER).ceil() as u32;
    let mut mask = GrayImage::new(width, height);
    for y in border_y..height.saturating_sub(border_y) {
        for x in border_x..width.saturating_sub(border_x) {
            let pixel = lab.at(x, y);
            let l = lightness.get_pixel(x, y)[0] as i32;
            let bg = background.get_pixel(x, y)[0] as i32;
            if chroma(pixel) <= thresholds.chroma
                && pixel.l >= thresholds.l_low
                && bg - l >= GRAY_MASK_DARKER_BY
            {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    let mask = close(&open(&mask, Norm::LInf, 2), Norm::LInf, 2);

    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let mut boxes: std::collections::BTreeMap<u32, (u32, u32, u32, u32, usize)> = Default::default();
    for (x, y, label) in labels.enumerate_pixels() {
        if label[0] == 0 {
            continue;
        }
        let entry = boxes.entry(label[0]).or_insert((x, y, x, y, 0));
        entry.0 = entry.0.min(x);
        entry.1 = entry.1.min(y);
        entry.2 = entry.2.max(x);
        entry.3 = entry.3.max(y);
        entry.4 += 1;
    }

    let image_area = width as f64 * height as f64;
    let mut best: Option<(f64, BoundingBox)> = None;
    for (min_x, min_y, max_x, max_y, count) in boxes.into_values() {
        let bbox = BoundingBox {
            x: min_x as i32,
            y: min_y as i32,
            w: (max_x - min_x + 1) as i32,
            h: (max_y - min_y + 1) as i32,
        };
        let elongation = bbox.elongation();
        if (count as f64) < STRICT_MIN_AREA_FRACTION * image_area
            || elongation <= GRAY_MASK_MIN_ELONGATION
        {
            continue;
        }
        let (_, cy) = bbox.center();
        let top_bias = if prefer_top { 1.0 - cy / height as f64 } else { 0.5 };
        let score = gray_candidate_score(
            bbox.w as f64 / width as f64,
            1.0 - 1.0 / elongation,
            top_bias,
        );
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, bbox));
        }
    }
    best.map(|(_, bbox)| bbox)
}

const GLYPH_ROWS: usize = 7;
const GLYPH_COLS: usize = 5;
const STAGE_GLYPHS: [[&str; GLYPH_ROWS]; 5] = [
    [".###.", "#...#", "#....", ".###.", "....#", "#...#", ".###."],
    ["#####", "..#..", "..#..", "..#..", "..#..", "..#..", "..#.."],
    [".###.", "#...#", "#...#", "#####", "#...#", "#...#", "#...#"],
    [".###.", "#...#", "#....", "#.###", "#...#", "#...#", ".###."],
    ["#####", "#....", "#....", "####.", "#....", "#....", "#####"],
];

/// Binary "STAGE" word at `scale` pixels per glyph cell. `true` marks ink.
fn render_stage_word(scale: u32, bold: bool) -> (u32, u32, Vec<bool>) {
    let cells_w = STAGE_GLYPHS.len() * (GLYPH_COLS + 1) - 1;
    let mut cells = vec![false; cells_w * GLYPH_ROWS];
    for (g, glyph) in STAGE_GLYPHS.iter().enumerate() {
        for (row, line) in glyph.iter().enumerate() {
            for (col, ch) in line.chars().enumerate() {
                if ch != '#' {
                    continue;
                }
                let cx = g * (GLYPH_COLS + 1) + col;
                cells[row * cells_w + cx] = true;
                if bold && cx + 1 < cells_w {
                    cells[row * cells_w + cx + 1] = true;
                }
            }
        }
    }
    let s = scale as usize;
    let w = cells_w * s;
    let h = GLYPH_ROWS * s;
    let mut ink = vec![false; w * h];
    for y in 0..h {
        for x in 0..w {
            ink[y * w + x] = cells[(y / s) * cells_w + x / s];
        }
    }
    (w as u32, h as u32, ink)
}

/// Penalised correlation for a template match centred at (`cx`, `cy`).
pub fn template_score(ncc: f64, cx: f64, cy: f64, width: f64, height: f64, prefer_top: bool) -> f64 {
    let center_penalty = TEMPLATE_CENTER_PENALTY * (cx - width / 2.0).abs() / width;
    let vertical_penalty = if !prefer_top {
        0.0
    } else if cy > height / 2.0 {
        TEMPLATE_LOWER_HALF_PENALTY
    } else {
        TEMPLATE_DEPTH_PENALTY * cy / height
    };
    ncc.abs() - center_penalty - vertical_penalty
}

struct Integral {
    width: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let w = image.width() as usize;
        let h = image.height() as usize;
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = image.get_pixel(x as u32, y as u32)[0] as f64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            width: stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.width;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x] + table[y * s + x]
    }
}

/// Zero-mean normalised cross-correlation of rendered "STAGE" words.
///
/// The absolute correlation is used, which treats light-on-dark and
/// dark-on-light lettering alike.
pub fn find_by_template(gray: &GrayImage, prefer_top: bool) -> Option<BoundingBox> {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let factor = (width.max(height) as f64 / TEMPLATE_MAX_SIDE as f64).max(1.0);
    let sw = ((width as f64 / factor).round() as u32).max(1);
    let sh = ((height as f64 / factor).round() as u32).max(1);
    let small = resize(gray, sw, sh, FilterType::Triangle);
    let integral = Integral::new(&small);
    let pixels = small.as_raw();
    let (sw_us, sh_us) = (sw as usize, sh as usize);

    let mut templates = Vec::new();
    for bold in [false, true] {
        for scale in TEMPLATE_SCALES {
            let (tw, th, ink) = render_stage_word(scale, bold);
            if tw > sw || th > sh {
                continue;
            }
            templates.push((tw as usize, th as usize, ink));
        }
    }

    let best = templates
        .par_iter()
        .filter_map(|(tw, th, ink)| {
            let n = (tw * th) as f64;
            let offsets: Vec<usize> = ink
                .iter()
                .enumerate()
                .filter(|(_, on)| **on)
                .map(|(i, _)| (i / tw) * sw_us + i % tw)
                .collect();
            let mean_t = offsets.len() as f64 / n;
            let t_energy = offsets.len() as f64 * (1.0 - mean_t).powi(2)
                + (n - offsets.len() as f64) * mean_t * mean_t;
            if t_energy <= f64::EPSILON {
                return None;
            }

            let mut local: Option<(f64, usize, usize)> = None;
            for y in (0..=sh_us - th).step_by(TEMPLATE_STRIDE) {
                for x in (0..=sw_us - tw).step_by(TEMPLATE_STRIDE) {
                    let s_all = integral.window(&integral.sum, x, y, *tw, *th);
                    let s_sq = integral.window(&integral.sum_sq, x, y, *tw, *th);
                    let variance = s_sq - s_all * s_all / n;
                    if variance <= 1e-6 * n {
                        continue;
                    }
                    let base = y * sw_us + x;
                    let s_ink: f64 = offsets.iter().map(|o| pixels[base + o] as f64).sum();
                    let ncc = (s_ink - mean_t * s_all) / (variance * t_energy).sqrt();
                    let score = template_score(
                        ncc,
                        x as f64 + *tw as f64 / 2.0,
                        y as f64 + *th as f64 / 2.0,
                        sw as f64,
                        sh as f64,
                        prefer_top,
                    );
                    if local.map_or(true, |(s, _, _)| score > s) {
                        local = Some((score, x, y));
                    }
                }
            }
            local.map(|(score, x, y)| (score, x, y, *tw, *th))
        })
        .reduce_with(|a, b| if b.0 > a.0 { b } else { a })?;

    let (score, x, y, tw, th) = best;
    if score < TEMPLATE_FLOOR {
        return None;
    }
    Some(BoundingBox {
        x: (x as f64 * factor).floor() as i32,
        y: (y as f64 * factor).floor() as i32,
        w: (tw as f64 * factor).ceil() as i32,
        h: (th as f64 * factor).ceil() as i32,
    })
}

pub fn positional_default(width: u32, height: u32) -> BoundingBox {
    let w = (width as f64 * DEFAULT_WIDTH).round().max(1.0);
    let h = (height as f64 * DEFAULT_HEIGHT).round().max(1.0);
    let cx = width as f64 / 2.0;
    let cy = height as f64 * DEFAULT_CENTER_Y;
    BoundingBox {
        x: (cx - w / 2.0).round() as i32,
        y: (cy - h / 2.0).round() as i32,
        w: w as i32,
        h: h as i32,
    }
    .clamp_to(width, height)
}

/// Thin, long banner shapes (aisles, row labels) that should not inherit the
/// stage's non-interactive flag just by lying near it.
pub fn is_ribbon_like(region: &Region, width: u32, height: u32) -> bool {
    let long = region.bbox.w.max(region.bbox.h) as f64;
    let short = region.bbox.w.min(region.bbox.h) as f64;
    let aspect = long / short.max(1.0);
    aspect >= 6.0
        && (6.0..=34.0).contains(&short)
        && long >= 0.16 * width as f64
        && region.area >= 0.00018 * width as f64 * height as f64
}

fn rect_median_lab(lab: &LabImage, rect: &BoundingBox) -> Option<LabColor> {
    let step = ((rect.area() / 20_000.0).sqrt().ceil() as usize).max(1);
    let mut samples = Vec::new();
    for y in (rect.y.max(0) as u32..rect.bottom().max(0) as u32).step_by(step) {
        for x in (rect.x.max(0) as u32..rect.right().max(0) as u32).step_by(step) {
            if x < lab.width && y < lab.height {
                samples.push(lab.at(x, y));
            }
        }
    }
    median_lab(&samples)
}

/// Pixels of `region` inside `rect`: within its outline and close to its own
/// color. Outlines are outer rings, so enclosed holes never count.
fn shared_pixels(region: &Region, rect: &BoundingBox, lab: &LabImage) -> usize {
    if region.bbox.intersection_area(rect) <= 0.0 {
        return 0;
    }
    let frame = region.bbox.expanded(1);
    let mask = rasterize_polygon(&region.polygon, &frame);
    let color = region.lab();
    mask.enumerate_pixels()
        .filter(|(x, y, p)| {
            if p[0] == 0 {
                return false;
            }
            let gx = *x as i32 + frame.x;
            let gy = *y as i32 + frame.y;
            gx >= rect.x.max(0)
                && gy >= rect.y.max(0)
                && gx < rect.right().min(lab.width as i32)
                && gy < rect.bottom().min(lab.height as i32)
                && delta_e(lab.at(gx as u32, gy as u32), color) <= MEMBER_DELTA_E
        })
        .count()
}

/// Tag the stage region and anything overlapping or resembling it, and inject
/// a placeholder outline when no region covers the rectangle.
///
/// The stage is the tier-1 pick when there is one, else the region covering
/// the largest share of the rectangle (at least half). Regions that are mostly
/// inside the rectangle, or share its pixels and its color, are stage fragments
/// and get `StageOverlap`. Box contact alone gives `NearStage`.
pub fn mark_stage(
    regions: Vec<Region>,
    stage: &StageReference,
    lab: &LabImage,
    warnings: &mut Warnings,
) -> Vec<Region> {
    let (width, height) = (lab.width, lab.height);
    let stage_lab = rect_median_lab(lab, &stage.rect);
    let rect_pixels = stage.rect.area().max(1.0);

    let shared: Vec<usize> = regions
        .iter()
        .map(|r| shared_pixels(r, &stage.rect, lab))
        .collect();
    let stage_index = regions
        .iter()
        .position(|r| stage.region_id == Some(r.id))
        .or_else(|| {
            (0..regions.len())
                .filter(|&i| shared[i] as f64 / rect_pixels >= STAGE_COVER_FRACTION)
                .max_by(|&a, &b| shared[a].cmp(&shared[b]).then(b.cmp(&a)))
        });

    let mut marked: Vec<Region> = regions
        .into_iter()
        .zip(shared)
        .enumerate()
        .map(|(i, (mut region, shared))| {
            if stage_index == Some(i) {
                region.tags.insert(RegionTag::Stage);
                return region;
            }
            if is_ribbon_like(&region, width, height) {
                return region;
            }
            let fraction = shared as f64 / region.pixel_count.max(1) as f64;
            let like = stage_lab.is_some_and(|s| delta_e(region.lab(), s) <= LIKE_STAGE_DELTA_E);
            if fraction >= STAGE_COVER_FRACTION || (like && fraction >= OVERLAP_FRACTION) {
                region.tags.insert(RegionTag::StageOverlap);
            } else if fraction >= OVERLAP_FRACTION
                || bbox_iou(&region.bbox, &stage.rect) >= OVERLAP_BBOX_IOU
            {
                region.tags.insert(RegionTag::NearStage);
            }
            if like {
                region.tags.insert(RegionTag::LikeStageColor);
            }
            region
        })
        .collect();

    if stage_index.is_none() {
        let id = marked.iter().map(|r| r.id + 1).max().unwrap_or(0);
        let placeholder = Region::from_polygon(
            id,
            stage.rect.corners(),
            stage.rect.area() as usize,
            stage_lab,
            1.0,
        );
        if let Some(placeholder) = placeholder {
            marked.push(
                placeholder
                    .with_tag(RegionTag::Stage)
                    .with_tag(RegionTag::StagePlaceholder),
            );
            warnings.push(DegradedSignal::StagePlaceholderInjected);
        }
    }

    let count = |tag| marked.iter().filter(|r| r.has(tag)).count();
    log::info!(
        "stage marking: {} stage fragments, {} near the stage",
        count(RegionTag::StageOverlap),
        count(RegionTag::NearStage)
    );
    marked
}
