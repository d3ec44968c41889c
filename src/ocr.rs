//! Boundary to an external OCR service.
//!
//! The pipeline never runs OCR itself. Callers hand over whatever lines a
//! recognizer produced and the stage locator uses them as its first hint.

use crate::geometry::BoundingBox;
use image::RgbImage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

const STAGE_KEYWORDS: &[&str] = &["stage", "무대", "스테이지"];
/// Padding around the union of matching boxes, as a share of the short image side.
const STAGE_BOX_PAD: f64 = 0.01;

/// One recognized line: text, confidence, and its outline in image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub score: f32,
    pub polygon: Vec<[f64; 2]>,
}

pub trait OcrProvider {
    /// Lines found in `image`. An empty list means nothing was recognized.
    fn recognize(&self, image: &RgbImage) -> Vec<OcrLine>;
}

/// No recognizer available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOcr;

impl OcrProvider for NoOcr {
    fn recognize(&self, _image: &RgbImage) -> Vec<OcrLine> {
        Vec::new()
    }
}

/// Lines recognized ahead of time, e.g. loaded from a service response.
#[derive(Debug, Default, Clone)]
pub struct PrecomputedOcr {
    pub lines: Vec<OcrLine>,
}

impl OcrProvider for PrecomputedOcr {
    fn recognize(&self, _image: &RgbImage) -> Vec<OcrLine> {
        self.lines.clone()
    }
}

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-:._]+").expect("separator pattern is valid"));

/// Lowercase with whitespace and punctuation separators removed.
pub fn normalize_text(text: &str) -> String {
    SEPARATORS.replace_all(text, "").to_lowercase()
}

pub fn mentions_stage(text: &str) -> bool {
    let normalized = normalize_text(text);
    STAGE_KEYWORDS.iter().any(|k| normalized.contains(k))
}

/// Union box of confident stage-keyword lines, padded and clamped to the image.
pub fn stage_text_box(
    lines: &[OcrLine],
    min_score: f32,
    width: u32,
    height: u32,
) -> Option<BoundingBox> {
    let mut union: Option<BoundingBox> = None;
    for line in lines {
        if line.score < min_score || line.polygon.is_empty() || !mentions_stage(&line.text) {
            continue;
        }
        let min_x = line.polygon.iter().map(|p| p[0]).fold(f64::MAX, f64::min);
        let min_y = line.polygon.iter().map(|p| p[1]).fold(f64::MAX, f64::min);
        let max_x = line.polygon.iter().map(|p| p[0]).fold(f64::MIN, f64::max);
        let max_y = line.polygon.iter().map(|p| p[1]).fold(f64::MIN, f64::max);
        let bbox = BoundingBox {
            x: min_x.floor() as i32,
            y: min_y.floor() as i32,
            w: (max_x.ceil() - min_x.floor()).max(1.0) as i32,
            h: (max_y.ceil() - min_y.floor()).max(1.0) as i32,
        };
        union = Some(match union {
            Some(existing) => existing.union(&bbox),
            None => bbox,
        });
    }

    let pad = (width.min(height) as f64 * STAGE_BOX_PAD).round() as i32;
    union
        .map(|b| b.expanded(pad).clamp_to(width, height))
        .filter(|b| b.w > 0 && b.h > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str, score: f32, x: f64, y: f64, w: f64, h: f64) -> OcrLine {
        OcrLine {
            text: text.to_string(),
            score,
            polygon: vec![[x, y], [x + w, y], [x + w, y + h], [x, y + h]],
        }
    }

    #[test]
    fn normalization_strips_separators_and_case() {
        assert_eq!(normalize_text("S-T A.G_E:"), "stage");
        assert_eq!(normalize_text("Main\tStage\n--"), "mainstage");
        assert_eq!(normalize_text("스테이지 A"), "스테이지a");
        assert!(mentions_stage("Main  STAGE"));
        assert!(mentions_stage("무 대"));
        assert!(!mentions_stage("Floor A"));
    }

    #[test]
    fn stage_box_unions_confident_matches_only() {
        let lines = vec![
            line("STAGE", 0.9, 100.0, 20.0, 60.0, 20.0),
            line("stage", 0.2, 400.0, 400.0, 50.0, 20.0),
            line("VIP", 0.99, 10.0, 10.0, 20.0, 10.0),
        ];
        let bbox = stage_text_box(&lines, 0.5, 500, 500).unwrap();
        assert_eq!(bbox, BoundingBox { x: 95, y: 15, w: 70, h: 30 });
    }

    #[test]
    fn no_matching_lines_yields_none() {
        let lines = vec![line("GATE 3", 0.95, 0.0, 0.0, 30.0, 10.0)];
        assert!(stage_text_box(&lines, 0.5, 100, 100).is_none());
        assert!(NoOcr.recognize(&RgbImage::new(4, 4)).is_empty());
    }
}
