use crate::error::{Result, SeatmapError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SegmentationMode {
    /// Connected components plus grid superpixels.
    Fast,
    /// Adds the watershed segmenter.
    Full,
}

/// Every threshold the pipeline reads. Built once per run and passed down by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub mode: SegmentationMode,
    /// Absolute minimum region area in px. Derived from the image size when absent.
    pub min_area: Option<f64>,
    pub min_area_fraction: f64,
    pub min_area_fraction_floor: f64,
    pub min_area_fraction_ceiling: f64,
    pub ensemble_iou_threshold: f64,
    pub ensemble_bbox_iou_floor: f64,
    pub color_delta: f32,
    pub stage_edge_band: f64,
    pub stage_center_band: f64,
    pub prefer_top_stage: bool,
    pub stage_anchor_override: Option<[f64; 2]>,
    pub ring_quantiles: [f64; 3],
    pub seats_per_component: u32,
    pub neighbor_gap_px: i32,
    pub gray_chroma_quantile: f32,
    pub gray_chroma_margin: f32,
    pub gray_l_low: f32,
    pub gray_l_high: f32,
    pub black_l_max: f32,
    pub total_attendees: Option<u32>,
    pub crop_legend: bool,
    pub suppress_text: bool,
    pub min_render_area: f64,
    pub ocr_min_score: f32,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PipelinePreset {
    Fast,
    Full,
}

impl PipelineConfig {
    /// Fast: two segmenters, no watershed.
    pub fn fast() -> Self {
        Self {
            mode: SegmentationMode::Fast,
            ensemble_iou_threshold: 0.55,
            ..Self::full()
        }
    }

    /// Full: all three segmenters with the stricter merge threshold.
    pub fn full() -> Self {
        Self {
            mode: SegmentationMode::Full,
            min_area: None,
            min_area_fraction: 2.5e-4,
            min_area_fraction_floor: 1.5e-4,
            min_area_fraction_ceiling: 6e-2,
            ensemble_iou_threshold: 0.65,
            ensemble_bbox_iou_floor: 0.10,
            color_delta: 22.0,
            stage_edge_band: 0.17,
            stage_center_band: 0.30,
            prefer_top_stage: true,
            stage_anchor_override: None,
            ring_quantiles: [0.20, 0.45, 0.75],
            seats_per_component: 1,
            neighbor_gap_px: 12,
            gray_chroma_quantile: 0.20,
            gray_chroma_margin: 3.0,
            gray_l_low: 8.0,
            gray_l_high: 96.0,
            black_l_max: 14.0,
            total_attendees: None,
            crop_legend: false,
            suppress_text: true,
            min_render_area: 450.0,
            ocr_min_score: 0.5,
        }
    }

    pub fn from_preset(preset: PipelinePreset) -> Self {
        match preset {
            PipelinePreset::Fast => Self::fast(),
            PipelinePreset::Full => Self::full(),
        }
    }

    /// Loads a JSON config. Missing keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            SeatmapError::config(
                "file",
                format!("{}: {}", path.as_ref().display(), e),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(min_area) = self.min_area {
            non_negative("minArea", min_area)?;
        }
        non_negative("minAreaFraction", self.min_area_fraction)?;
        non_negative("minAreaFractionFloor", self.min_area_fraction_floor)?;
        non_negative("minAreaFractionCeiling", self.min_area_fraction_ceiling)?;
        if self.min_area_fraction_floor > self.min_area_fraction_ceiling {
            return Err(SeatmapError::config(
                "minAreaFractionFloor",
                "floor exceeds ceiling",
            ));
        }
        unit_open_closed("ensembleIouThreshold", self.ensemble_iou_threshold)?;
        unit_open_closed("ensembleBboxIouFloor", self.ensemble_bbox_iou_floor)?;
        if !self.color_delta.is_finite() || self.color_delta <= 0.0 {
            return Err(SeatmapError::config("colorDelta", "must be positive"));
        }
        unit_closed("stageEdgeBand", self.stage_edge_band)?;
        unit_closed("stageCenterBand", self.stage_center_band)?;
        if let Some([x, y]) = self.stage_anchor_override {
            non_negative("stageAnchorOverride", x)?;
            non_negative("stageAnchorOverride", y)?;
        }
        for q in self.ring_quantiles {
            unit_closed("ringQuantiles", q)?;
        }
        if self.ring_quantiles.windows(2).any(|w| w[0] > w[1]) {
            return Err(SeatmapError::config("ringQuantiles", "must be ascending"));
        }
        if self.seats_per_component == 0 {
            return Err(SeatmapError::config(
                "seatsPerComponent",
                "must be at least 1",
            ));
        }
        if self.neighbor_gap_px < 0 {
            return Err(SeatmapError::config("neighborGapPx", "must be >= 0"));
        }
        unit_closed("grayChromaQuantile", self.gray_chroma_quantile as f64)?;
        non_negative("grayChromaMargin", self.gray_chroma_margin as f64)?;
        non_negative("grayLLow", self.gray_l_low as f64)?;
        non_negative("blackLMax", self.black_l_max as f64)?;
        if !self.gray_l_high.is_finite() || self.gray_l_low >= self.gray_l_high {
            return Err(SeatmapError::config(
                "grayLHigh",
                "must be greater than grayLLow",
            ));
        }
        non_negative("minRenderArea", self.min_render_area)?;
        unit_closed("ocrMinScore", self.ocr_min_score as f64)?;
        Ok(())
    }

    /// Minimum component area for an image of `pixel_count` pixels.
    pub fn resolve_min_area(&self, pixel_count: usize) -> f64 {
        if let Some(min_area) = self.min_area {
            return min_area;
        }
        let px = pixel_count as f64;
        (px * self.min_area_fraction).clamp(
            px * self.min_area_fraction_floor,
            px * self.min_area_fraction_ceiling,
        )
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::full()
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(SeatmapError::config(
            field,
            format!("must be a finite value >= 0, got {}", value),
        ));
    }
    Ok(())
}

fn unit_closed(field: &'static str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SeatmapError::config(
            field,
            format!("must lie in [0, 1], got {}", value),
        ));
    }
    Ok(())
}

fn unit_open_closed(field: &'static str, value: f64) -> Result<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(SeatmapError::config(
            field,
            format!("must lie in (0, 1], got {}", value),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
        PipelineConfig::fast().validate().unwrap();
    }

    #[test]
    fn negative_min_area_is_rejected() {
        let config = PipelineConfig {
            min_area: Some(-5.0),
            ..PipelineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            SeatmapError::Configuration {
                field: "minArea",
                ..
            }
        ));
    }

    #[test]
    fn descending_ring_quantiles_are_rejected() {
        let config = PipelineConfig {
            ring_quantiles: [0.5, 0.4, 0.9],
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_seats_per_component_is_rejected() {
        let config = PipelineConfig {
            seats_per_component: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn auto_min_area_scales_with_image() {
        let config = PipelineConfig::default();
        let area = config.resolve_min_area(1_000_000);
        assert!((area - 250.0).abs() < 1e-9);

        let fixed = PipelineConfig {
            min_area: Some(77.0),
            ..PipelineConfig::default()
        };
        assert_eq!(fixed.resolve_min_area(1_000_000), 77.0);
    }

    #[test]
    fn json_file_fills_missing_keys_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"mode":"fast","colorDelta":18.5,"totalAttendees":1200}}"#).unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.mode, SegmentationMode::Fast);
        assert_eq!(config.color_delta, 18.5);
        assert_eq!(config.total_attendees, Some(1200));
        assert_eq!(config.neighbor_gap_px, 12);
    }

    #[test]
    fn json_file_with_invalid_values_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ensembleIouThreshold":1.5}}"#).unwrap();
        assert!(PipelineConfig::from_json_file(file.path()).is_err());
    }
}
