//! Perceptual color helpers shared by every stage.
//!
//! All colors are CIE L*a*b* (D65) as produced by `palette`; distances are CIEDE2000.

use crate::config::PipelineConfig;
use image::{GrayImage, Luma, RgbImage};
use palette::{color_difference::Ciede2000, white_point::D65, FromColor, Lab, Srgb};
use rayon::prelude::*;

pub type LabColor = Lab<D65, f32>;

/// Fill used when a region has no interior samples at all.
pub const FALLBACK_FILL_HEX: &str = "#CCCCCC";

/// Convert RGB [0-255] to LAB color space
pub fn rgb_to_lab(rgb: [u8; 3]) -> LabColor {
    let srgb = Srgb::new(
        rgb[0] as f32 / 255.0,
        rgb[1] as f32 / 255.0,
        rgb[2] as f32 / 255.0,
    );
    Lab::from_color(srgb)
}

pub fn lab_to_rgb(lab: LabColor) -> [u8; 3] {
    let srgb = Srgb::from_color(lab);
    [
        (srgb.red.clamp(0.0, 1.0) * 255.0).round() as u8,
        (srgb.green.clamp(0.0, 1.0) * 255.0).round() as u8,
        (srgb.blue.clamp(0.0, 1.0) * 255.0).round() as u8,
    ]
}

pub fn rgb_to_hex(rgb: [u8; 3]) -> String {
    format!("#{:02X}{:02X}{:02X}", rgb[0], rgb[1], rgb[2])
}

pub fn lab_to_array(lab: LabColor) -> [f32; 3] {
    [lab.l, lab.a, lab.b]
}

pub fn lab_from_array(lab: [f32; 3]) -> LabColor {
    Lab::new(lab[0], lab[1], lab[2])
}

pub fn chroma(lab: LabColor) -> f32 {
    (lab.a * lab.a + lab.b * lab.b).sqrt()
}

pub fn delta_e(a: LabColor, b: LabColor) -> f32 {
    a.difference(b)
}

pub fn is_grayish(lab: LabColor, thresholds: &GrayThresholds) -> bool {
    chroma(lab) <= thresholds.chroma
        && lab.l >= thresholds.l_low
        && lab.l <= thresholds.l_high
}

pub fn is_black(lab: LabColor, l_max: f32) -> bool {
    lab.l <= l_max
}

/// Per-image gray/black classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrayThresholds {
    pub chroma: f32,
    pub l_low: f32,
    pub l_high: f32,
    pub black_l_max: f32,
}

impl GrayThresholds {
    /// The chroma cut adapts to scan noise: a low percentile of image-wide chroma plus a margin.
    pub fn estimate(image: &LabImage, config: &PipelineConfig) -> Self {
        let mut chromas: Vec<f32> = image.pixels.par_iter().map(|p| chroma(*p)).collect();
        let base = percentile(&mut chromas, config.gray_chroma_quantile);
        Self {
            chroma: base + config.gray_chroma_margin,
            l_low: config.gray_l_low,
            l_high: config.gray_l_high,
            black_l_max: config.black_l_max,
        }
    }
}

/// Nearest-rank percentile. Reorders `values`.
pub fn percentile(values: &mut [f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let rank = ((values.len() - 1) as f32 * q.clamp(0.0, 1.0)).round() as usize;
    let (_, nth, _) =
        values.select_nth_unstable_by(rank, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    *nth
}

/// Channel-wise median of a set of Lab samples.
pub fn median_lab(samples: &[LabColor]) -> Option<LabColor> {
    if samples.is_empty() {
        return None;
    }
    let mut l: Vec<f32> = samples.iter().map(|s| s.l).collect();
    let mut a: Vec<f32> = samples.iter().map(|s| s.a).collect();
    let mut b: Vec<f32> = samples.iter().map(|s| s.b).collect();
    Some(Lab::new(
        percentile(&mut l, 0.5),
        percentile(&mut a, 0.5),
        percentile(&mut b, 0.5),
    ))
}

/// Row-major Lab raster.
#[derive(Debug, Clone)]
pub struct LabImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<LabColor>,
}

impl LabImage {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let pixels = image
            .as_raw()
            .par_chunks_exact(3)
            .map(|p| rgb_to_lab([p[0], p[1], p[2]]))
            .collect();
        Self {
            width: image.width(),
            height: image.height(),
            pixels,
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn at(&self, x: u32, y: u32) -> LabColor {
        self.pixels[(y * self.width + x) as usize]
    }

    /// L* rescaled to 0..=255.
    pub fn lightness(&self) -> GrayImage {
        let mut out = GrayImage::new(self.width, self.height);
        for (dst, src) in out.pixels_mut().zip(self.pixels.iter()) {
            *dst = Luma([(src.l * 2.55).round().clamp(0.0, 255.0) as u8]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> GrayThresholds {
        GrayThresholds {
            chroma: 5.0,
            l_low: 8.0,
            l_high: 96.0,
            black_l_max: 14.0,
        }
    }

    #[test]
    fn test_hex_conversion() {
        assert_eq!(rgb_to_hex([255, 0, 16]), "#FF0010");
    }

    #[test]
    fn mid_gray_is_grayish_but_not_black() {
        let gray = rgb_to_lab([128, 128, 128]);
        assert!(is_grayish(gray, &thresholds()));
        assert!(!is_black(gray, 14.0));
    }

    #[test]
    fn saturated_red_is_not_grayish() {
        let red = rgb_to_lab([220, 20, 30]);
        assert!(chroma(red) > 50.0);
        assert!(!is_grayish(red, &thresholds()));
    }

    #[test]
    fn white_exceeds_gray_lightness_ceiling() {
        assert!(!is_grayish(rgb_to_lab([255, 255, 255]), &thresholds()));
        assert!(is_black(rgb_to_lab([0, 0, 0]), 14.0));
    }

    #[test]
    fn lab_round_trip_is_close() {
        let rgb = [40, 120, 200];
        let back = lab_to_rgb(rgb_to_lab(rgb));
        for (a, b) in rgb.iter().zip(back.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 1);
        }
    }

    #[test]
    fn delta_e_separates_distinct_hues() {
        let red = rgb_to_lab([220, 20, 30]);
        let red2 = rgb_to_lab([215, 25, 35]);
        let blue = rgb_to_lab([30, 60, 210]);
        assert!(delta_e(red, red2) < 5.0);
        assert!(delta_e(red, blue) > 22.0);
    }

    #[test]
    fn chroma_threshold_tracks_low_percentile() {
        let mut image = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        for x in 0..10 {
            image.put_pixel(x, 0, image::Rgb([220, 20, 30]));
        }
        let lab = LabImage::from_rgb(&image);
        let t = GrayThresholds::estimate(&lab, &PipelineConfig::default());
        assert!(t.chroma < 5.0);
    }

    #[test]
    fn median_lab_is_channelwise() {
        let samples = [
            Lab::new(10.0, 1.0, -5.0),
            Lab::new(50.0, 2.0, 0.0),
            Lab::new(90.0, 3.0, 5.0),
        ];
        let m = median_lab(&samples).unwrap();
        assert_eq!((m.l, m.a, m.b), (50.0, 2.0, 0.0));
        assert!(median_lab(&[]).is_none());
    }
}
