use crate::capacity::allocate_capacity;
use crate::cleanup::cleanup_regions;
use crate::color::{GrayThresholds, LabImage};
use crate::config::PipelineConfig;
use crate::error::{DegradedSignal, Result, SeatmapError, Warnings};
use crate::foreground::extract_foreground;
use crate::grading::{assign_grades, assign_provisional_groups};
use crate::neighbors::attach_neighbors;
use crate::ocr::OcrProvider;
use crate::output::{build_sections, emit_regions, stage_record, PerfStats, SeatmapResult};
use crate::regions::classify;
use crate::segment::{run_ensemble, SegmentationInput};
use crate::stage::{locate_stage, mark_stage, StageContext};
use crate::text::{detect_text, inpaint};
use image::RgbImage;
use sha2::{Digest, Sha256};
use std::time::Instant;

const PIPELINE_DIGEST_VERSION: u8 = 1;

/// Decode `image_data` and run the full pipeline on it.
pub fn process_seatmap(
    image_data: &[u8],
    config: &PipelineConfig,
    ocr: &dyn OcrProvider,
) -> Result<SeatmapResult> {
    config.validate()?;

    let decode_start = Instant::now();
    let decoded = image::load_from_memory(image_data)
        .map_err(|e| SeatmapError::Input(format!("failed to decode image bytes: {}", e)))?;
    let rgb = decoded.to_rgb8();
    let decode_ms = decode_start.elapsed().as_millis() as u64;

    let mut result = process_rgb_image(&rgb, config, ocr)?;
    result.perf.decode_ms = decode_ms;
    result.perf.total_ms += decode_ms;
    Ok(result)
}

/// Run the pipeline on an already decoded image.
pub fn process_rgb_image(
    rgb: &RgbImage,
    config: &PipelineConfig,
    ocr: &dyn OcrProvider,
) -> Result<SeatmapResult> {
    config.validate()?;
    let (width, height) = rgb.dimensions();
    if width < 2 || height < 2 {
        return Err(SeatmapError::Input(format!(
            "image too small ({}x{}); minimum size is 2x2",
            width, height
        )));
    }

    let timing_enabled = timing_enabled();
    let total_start = Instant::now();
    let mut warnings = Warnings::default();

    let foreground_start = Instant::now();
    let lab = LabImage::from_rgb(rgb);
    let thresholds = GrayThresholds::estimate(&lab, config);
    let foreground = extract_foreground(rgb, &lab, config);
    let foreground_ms = foreground_start.elapsed().as_millis() as u64;

    let text_start = Instant::now();
    let clean_lab = if config.suppress_text {
        let mask = detect_text(rgb, &foreground);
        if mask.as_raw().iter().all(|v| *v == 0) {
            warnings.push(DegradedSignal::NoTextMask);
            None
        } else {
            Some(LabImage::from_rgb(&inpaint(rgb, &mask)))
        }
    } else {
        None
    };
    let clean = clean_lab.as_ref().unwrap_or(&lab);
    let text_ms = text_start.elapsed().as_millis() as u64;

    let segmentation_start = Instant::now();
    let input = SegmentationInput {
        foreground: &foreground,
        color: &lab,
        clean,
        thresholds: &thresholds,
        min_area: config.resolve_min_area(lab.len()),
    };
    let regions = classify(run_ensemble(&input, config, &mut warnings), &thresholds);
    let segmentation_ms = segmentation_start.elapsed().as_millis() as u64;

    let stage_start = Instant::now();
    let ocr_lines = ocr.recognize(rgb);
    if ocr_lines.is_empty() {
        warnings.push(DegradedSignal::OcrUnavailable);
    }
    let stage = locate_stage(
        &regions,
        &StageContext {
            lab: &lab,
            thresholds: &thresholds,
            config,
            ocr_lines: &ocr_lines,
        },
        &mut warnings,
    );
    let regions = mark_stage(regions, &stage, &lab, &mut warnings);
    let stage_ms = stage_start.elapsed().as_millis() as u64;

    let cleanup_start = Instant::now();
    let regions = assign_provisional_groups(regions, config.color_delta);
    let (regions, cleanup) = cleanup_regions(regions, width, height);
    let cleanup_ms = cleanup_start.elapsed().as_millis() as u64;

    let grading_start = Instant::now();
    let regions = attach_neighbors(regions, config.neighbor_gap_px);
    let outcome = assign_grades(regions, &stage, &thresholds, config, &mut warnings);
    let regions = allocate_capacity(
        outcome.regions,
        config.total_attendees,
        config.seats_per_component,
    )?;
    let grading_ms = grading_start.elapsed().as_millis() as u64;

    let records = emit_regions(&regions, config.min_render_area);
    let sections = build_sections(&regions);
    let stage = stage_record(&stage, &regions);
    let total_ms = total_start.elapsed().as_millis() as u64;

    if timing_enabled {
        log::debug!(
            "seatmap timing {}x{} mode={:?} foreground={}ms text={}ms segmentation={}ms stage={}ms cleanup={}ms grading={}ms total={}ms",
            width,
            height,
            config.mode,
            foreground_ms,
            text_ms,
            segmentation_ms,
            stage_ms,
            cleanup_ms,
            grading_ms,
            total_ms
        );
    }
    log::info!(
        "seatmap: {} regions emitted, {} sections, stage via {:?}",
        records.len(),
        sections.len(),
        stage.source
    );

    Ok(SeatmapResult {
        width,
        height,
        regions: records,
        sections,
        stage: Some(stage),
        color_groups: outcome.groups,
        cleanup,
        warnings: warnings.into_vec(),
        perf: PerfStats {
            decode_ms: 0,
            foreground_ms,
            text_ms,
            segmentation_ms,
            stage_ms,
            cleanup_ms,
            grading_ms,
            total_ms,
        },
        run_digest: build_run_digest(rgb, config),
    })
}

fn timing_enabled() -> bool {
    matches!(
        std::env::var("SEATMAP_DEBUG_TIMING").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    )
}

/// SHA-256 over the pixels, dimensions, and configuration of a run.
pub fn build_run_digest(rgb: &RgbImage, config: &PipelineConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update([PIPELINE_DIGEST_VERSION]);
    hasher.update(rgb.width().to_le_bytes());
    hasher.update(rgb.height().to_le_bytes());
    hasher.update(rgb.as_raw());
    hasher.update(serde_json::to_vec(config).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}
