//! Foreground/background separation by color clustering.

use crate::color::{rgb_to_lab, LabColor, LabImage};
use crate::config::PipelineConfig;
use image::imageops::{resize, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::open;
use palette::{color_difference::Ciede2000, Lab};
use rayon::prelude::*;
use std::collections::HashSet;

const CLUSTER_COUNT: usize = 5;
const MAX_ITERATIONS: usize = 12;
const MAX_TRAINING_SAMPLES: usize = 20_000;
/// Bottom share of the image scanned for a legend block.
const LEGEND_BAND: f64 = 0.25;
/// A row with fewer foreground pixels than this share of the width counts as empty.
const LEGEND_EMPTY_ROW: f64 = 0.02;

/// K-means clustering center
#[derive(Clone)]
struct KMeansCenter {
    lab: LabColor,
    sum_l: f64,
    sum_a: f64,
    sum_b: f64,
    count: u64,
}

impl KMeansCenter {
    fn new(lab: LabColor) -> Self {
        Self {
            lab,
            sum_l: 0.0,
            sum_a: 0.0,
            sum_b: 0.0,
            count: 0,
        }
    }

    fn add_sample(&mut self, lab: LabColor) {
        self.sum_l += lab.l as f64;
        self.sum_a += lab.a as f64;
        self.sum_b += lab.b as f64;
        self.count += 1;
    }

    fn update_centroid(&mut self) {
        if self.count > 0 {
            self.lab = Lab::new(
                (self.sum_l / self.count as f64) as f32,
                (self.sum_a / self.count as f64) as f32,
                (self.sum_b / self.count as f64) as f32,
            );
        }
        self.sum_l = 0.0;
        self.sum_a = 0.0;
        self.sum_b = 0.0;
        self.count = 0;
    }
}

fn nearest_center(pixel: LabColor, centers: &[LabColor]) -> usize {
    let mut best_idx = 0usize;
    let mut best_dist = f32::MAX;
    for (i, center) in centers.iter().enumerate() {
        let dist = pixel.difference(*center);
        if dist < best_dist {
            best_dist = dist;
            best_idx = i;
        }
    }
    best_idx
}

/// Parallel k-means over Lab samples using CIEDE2000. Returns the final centers.
fn kmeans(pixels: &[LabColor], k: usize, max_iterations: usize) -> Vec<LabColor> {
    if pixels.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(pixels.len());
    let mut centers = kmeans_plus_plus_init(pixels, k);
    let mut labels = vec![usize::MAX; pixels.len()];

    for _ in 0..max_iterations {
        let snapshot: Vec<LabColor> = centers.iter().map(|c| c.lab).collect();
        let new_labels: Vec<usize> = pixels
            .par_iter()
            .map(|pixel| nearest_center(*pixel, &snapshot))
            .collect();

        let changed = new_labels
            .iter()
            .zip(labels.iter())
            .filter(|(a, b)| a != b)
            .count();
        labels = new_labels;
        if changed == 0 {
            break;
        }

        for (pixel, &label) in pixels.iter().zip(labels.iter()) {
            centers[label].add_sample(*pixel);
        }
        for center in &mut centers {
            center.update_centroid();
        }
    }

    centers.into_iter().map(|c| c.lab).collect()
}

/// Deterministic seeding: median-lightness sample first, then repeatedly the
/// sample farthest from every chosen center.
fn kmeans_plus_plus_init(pixels: &[LabColor], k: usize) -> Vec<KMeansCenter> {
    let n = pixels.len();
    let mut centers = Vec::with_capacity(k);
    let mut chosen_indices = HashSet::new();

    let mut sorted_by_l: Vec<(usize, f32)> =
        pixels.iter().enumerate().map(|(i, p)| (i, p.l)).collect();
    sorted_by_l.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let first_idx = sorted_by_l[n / 2].0;
    centers.push(KMeansCenter::new(pixels[first_idx]));
    chosen_indices.insert(first_idx);

    let mut min_distances: Vec<f32> = pixels
        .par_iter()
        .map(|p| p.difference(centers[0].lab))
        .collect();

    while centers.len() < k {
        let Some((best_idx, _)) = min_distances
            .iter()
            .enumerate()
            .filter(|(i, _)| !chosen_indices.contains(i))
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            break;
        };

        chosen_indices.insert(best_idx);
        let new_lab = pixels[best_idx];
        min_distances
            .par_iter_mut()
            .zip(pixels.par_iter())
            .for_each(|(min_d, pixel)| {
                let d = pixel.difference(new_lab);
                if d < *min_d {
                    *min_d = d;
                }
            });
        centers.push(KMeansCenter::new(new_lab));
    }

    centers
}

/// Returns a mask where 255 marks printed artwork.
///
/// Clusters a half-resolution copy into a handful of colors, treats the most
/// populous cluster (at full resolution) as background, and opens the
/// complement with a 3x3 kernel. Monochrome input yields an empty mask.
pub fn extract_foreground(rgb: &RgbImage, lab: &LabImage, config: &PipelineConfig) -> GrayImage {
    let (width, height) = rgb.dimensions();
    let half = resize(
        rgb,
        (width / 2).max(1),
        (height / 2).max(1),
        FilterType::Triangle,
    );
    let step = (half.as_raw().len() / 3 / MAX_TRAINING_SAMPLES).max(1);
    let training: Vec<LabColor> = half
        .as_raw()
        .chunks_exact(3)
        .step_by(step)
        .map(|p| rgb_to_lab([p[0], p[1], p[2]]))
        .collect();

    let centers = kmeans(&training, CLUSTER_COUNT, MAX_ITERATIONS);
    if centers.is_empty() {
        return GrayImage::new(width, height);
    }

    let assignment: Vec<usize> = lab
        .pixels
        .par_iter()
        .map(|p| nearest_center(*p, &centers))
        .collect();
    let mut counts = vec![0usize; centers.len()];
    for label in &assignment {
        counts[*label] += 1;
    }
    let background = counts
        .iter()
        .enumerate()
        .fold((0usize, 0usize), |best, (i, c)| if *c > best.1 { (i, *c) } else { best })
        .0;

    let raw: Vec<u8> = assignment
        .iter()
        .map(|label| if *label == background { 0 } else { 255 })
        .collect();
    let mask = GrayImage::from_raw(width, height, raw).unwrap_or_else(|| GrayImage::new(width, height));
    let mut mask = open(&mask, Norm::LInf, 1);

    log::debug!(
        "foreground: {} clusters, background share {:.3}",
        centers.len(),
        counts[background] as f64 / assignment.len().max(1) as f64
    );

    if config.crop_legend {
        crop_legend(&mut mask);
    }
    mask
}

/// Blank everything below the first near-empty row in the bottom band, where
/// diagrams usually place their price legend.
pub fn crop_legend(mask: &mut GrayImage) {
    let (width, height) = mask.dimensions();
    let band_start = (height as f64 * (1.0 - LEGEND_BAND)).floor() as u32;
    let limit = (width as f64 * LEGEND_EMPTY_ROW).max(1.0);

    let cut = (band_start..height).find(|&y| {
        let count = (0..width).filter(|&x| mask.get_pixel(x, y)[0] > 0).count();
        (count as f64) < limit
    });

    if let Some(cut) = cut {
        if cut > band_start {
            for y in cut..height {
                for x in 0..width {
                    mask.put_pixel(x, y, Luma([0]));
                }
            }
        }
    }
}
