//! Seating-chart diagrams in, graded seat sections out.
//!
//! [`process_seatmap`] decodes an image and runs every stage: foreground
//! separation, text suppression, the segmentation ensemble, stage location,
//! cleanup, grading, and capacity allocation. The result is a plain serde
//! value ready for a renderer.

pub mod capacity;
pub mod cleanup;
pub mod color;
pub mod config;
pub mod error;
pub mod foreground;
pub mod geometry;
pub mod grading;
pub mod neighbors;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod regions;
pub mod segment;
pub mod stage;
pub mod text;

use std::fs;
use std::path::Path;

pub use config::{PipelineConfig, PipelinePreset, SegmentationMode};
pub use error::{DegradedSignal, Result, SeatmapError, StageSource};
pub use ocr::{NoOcr, OcrLine, OcrProvider, PrecomputedOcr};
pub use output::{RegionRecord, SeatGrid, SeatmapResult, Section};
pub use pipeline::{process_rgb_image, process_seatmap};
pub use regions::Grade;

/// Read an image file and process it.
pub fn process_seatmap_from_path(
    path: impl AsRef<Path>,
    config: &PipelineConfig,
    ocr: &dyn OcrProvider,
) -> Result<SeatmapResult> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    log::info!("processing {} ({} bytes)", path.display(), bytes.len());
    process_seatmap(&bytes, config, ocr)
}

/// Load OCR lines (a JSON array of `{text, score, polygon}`) produced elsewhere.
pub fn load_ocr_lines(path: impl AsRef<Path>) -> Result<Vec<OcrLine>> {
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| SeatmapError::Input(format!("invalid OCR lines JSON: {}", e)))
}
