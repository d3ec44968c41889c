//! Glyph detection and inpainting ahead of segmentation.
//!
//! Labels printed over seat blocks would otherwise split one section into
//! several fragments, so they are painted over with the surrounding color.
//! Misses are harmless; over-detections get trimmed by the later stages.

use image::imageops::grayscale;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;

const CANNY_LOW: f32 = 40.0;
const CANNY_HIGH: f32 = 120.0;
const BLOB_DILATION: u8 = 2;
const BLOB_MIN_AREA: u32 = 30;
const BLOB_MAX_AREA: u32 = 8000;
const BLOB_MIN_SIDE: u32 = 6;
const BLOB_MAX_SIDE: u32 = 150;
const BLOB_MIN_ASPECT: f64 = 0.2;
const BLOB_MAX_ASPECT: f64 = 12.0;
const MIN_EDGE_DENSITY: f64 = 0.12;
/// Hollow outlines (a drawn box) have no edges in the middle; glyph runs do.
const MIN_CORE_EDGE_DENSITY: f64 = 0.08;
const SMALL_COMPONENT_AREA: usize = 400;
const MEDIAN_RADIUS: i64 = 4;

#[derive(Debug, Clone, Copy)]
struct Blob {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Blob {
    fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }
}

/// Mask (255) of glyph-like blobs inside the foreground.
pub fn detect_text(rgb: &RgbImage, foreground: &GrayImage) -> GrayImage {
    let (width, height) = rgb.dimensions();
    let gray = grayscale(rgb);
    let edges = canny(&gray, CANNY_LOW, CANNY_HIGH);
    let mut grown = dilate(&edges, Norm::LInf, BLOB_DILATION);
    for (g, f) in grown.pixels_mut().zip(foreground.pixels()) {
        if f[0] == 0 {
            *g = Luma([0]);
        }
    }

    let labels = connected_components(&grown, Connectivity::Eight, Luma([0u8]));
    let mut blobs: HashMap<u32, Blob> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        if label[0] == 0 {
            continue;
        }
        blobs
            .entry(label[0])
            .and_modify(|b| {
                b.min_x = b.min_x.min(x);
                b.min_y = b.min_y.min(y);
                b.max_x = b.max_x.max(x);
                b.max_y = b.max_y.max(y);
            })
            .or_insert(Blob {
                min_x: x,
                min_y: y,
                max_x: x,
                max_y: y,
            });
    }

    let mut mask = GrayImage::new(width, height);
    let mut accepted = 0usize;
    let mut ordered: Vec<Blob> = blobs.into_values().collect();
    ordered.sort_by_key(|b| (b.min_y, b.min_x));
    for blob in ordered {
        if !is_glyph_like(&blob, &edges) {
            continue;
        }
        accepted += 1;
        for y in blob.min_y..=blob.max_y {
            for x in blob.min_x..=blob.max_x {
                if foreground.get_pixel(x, y)[0] > 0 {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
    }

    log::debug!("text suppressor accepted {} glyph blobs", accepted);
    mask
}

fn is_glyph_like(blob: &Blob, edges: &GrayImage) -> bool {
    let w = blob.width();
    let h = blob.height();
    let area = w * h;
    if !(BLOB_MIN_AREA..=BLOB_MAX_AREA).contains(&area) {
        return false;
    }
    if w.min(h) < BLOB_MIN_SIDE || w.max(h) > BLOB_MAX_SIDE {
        return false;
    }
    let aspect = w as f64 / h as f64;
    if !(BLOB_MIN_ASPECT..=BLOB_MAX_ASPECT).contains(&aspect) {
        return false;
    }

    let density = edge_density(edges, blob.min_x, blob.min_y, blob.max_x, blob.max_y);
    if density < MIN_EDGE_DENSITY {
        return false;
    }
    let core = edge_density(
        edges,
        blob.min_x + w / 4,
        blob.min_y + h / 4,
        blob.max_x - w / 4,
        blob.max_y - h / 4,
    );
    core >= MIN_CORE_EDGE_DENSITY
}

fn edge_density(edges: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
    if x1 < x0 || y1 < y0 {
        return 0.0;
    }
    let mut hits = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            if edges.get_pixel(x, y)[0] > 0 {
                hits += 1;
            }
        }
    }
    hits as f64 / ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64
}

/// Fill masked pixels from their surroundings.
///
/// Small components take the per-channel median of unmasked pixels in a 9x9
/// window. Whatever is left is filled from the outside in, each pixel taking
/// the mean of its already-known 8-neighbours.
pub fn inpaint(rgb: &RgbImage, mask: &GrayImage) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let mut out = rgb.clone();
    let mut known: Vec<bool> = mask.as_raw().iter().map(|v| *v == 0).collect();
    if known.iter().all(|k| *k) {
        return out;
    }

    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut sizes: HashMap<u32, usize> = HashMap::new();
    for label in labels.as_raw() {
        if *label != 0 {
            *sizes.entry(*label).or_default() += 1;
        }
    }

    let idx = |x: i64, y: i64| (y * width as i64 + x) as usize;
    let original_known = known.clone();
    for (x, y, label) in labels.enumerate_pixels() {
        let size = sizes.get(&label[0]).copied().unwrap_or(0);
        if label[0] == 0 || size >= SMALL_COMPONENT_AREA {
            continue;
        }
        let mut channels: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for dy in -MEDIAN_RADIUS..=MEDIAN_RADIUS {
            for dx in -MEDIAN_RADIUS..=MEDIAN_RADIUS {
                let nx = x as i64 + dx;
                let ny = y as i64 + dy;
                if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                    continue;
                }
                if !original_known[idx(nx, ny)] {
                    continue;
                }
                let p = rgb.get_pixel(nx as u32, ny as u32);
                for c in 0..3 {
                    channels[c].push(p[c]);
                }
            }
        }
        if channels[0].is_empty() {
            continue;
        }
        let mut pixel = [0u8; 3];
        for c in 0..3 {
            channels[c].sort_unstable();
            pixel[c] = channels[c][channels[c].len() / 2];
        }
        out.put_pixel(x, y, Rgb(pixel));
        known[idx(x as i64, y as i64)] = true;
    }

    let mut pending: Vec<(u32, u32)> = (0..height)
        .flat_map(|y| (0..width).map(move |x| (x, y)))
        .filter(|(x, y)| !known[idx(*x as i64, *y as i64)])
        .collect();

    while !pending.is_empty() {
        let mut frontier: Vec<(u32, u32, [u8; 3])> = Vec::new();
        for &(x, y) in &pending {
            let mut sum = [0u32; 3];
            let mut n = 0u32;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if (dx == 0 && dy == 0)
                        || nx < 0
                        || ny < 0
                        || nx >= width as i64
                        || ny >= height as i64
                        || !known[idx(nx, ny)]
                    {
                        continue;
                    }
                    let p = out.get_pixel(nx as u32, ny as u32);
                    for c in 0..3 {
                        sum[c] += p[c] as u32;
                    }
                    n += 1;
                }
            }
            if n > 0 {
                frontier.push((
                    x,
                    y,
                    [
                        ((sum[0] + n / 2) / n) as u8,
                        ((sum[1] + n / 2) / n) as u8,
                        ((sum[2] + n / 2) / n) as u8,
                    ],
                ));
            }
        }
        if frontier.is_empty() {
            break;
        }
        for (x, y, pixel) in frontier {
            out.put_pixel(x, y, Rgb(pixel));
            known[idx(x as i64, y as i64)] = true;
        }
        pending.retain(|(x, y)| !known[idx(*x as i64, *y as i64)]);
    }

    out
}
