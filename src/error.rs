use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal failures. Anything weaker is reported as a [`DegradedSignal`].
#[derive(Debug, Error)]
pub enum SeatmapError {
    #[error("input error: {0}")]
    Input(String),

    #[error("configuration error: {field}: {reason}")]
    Configuration { field: &'static str, reason: String },

    #[error("no graded regions available to carry {total_attendees} attendees")]
    EmptyRegionSet { total_attendees: u32 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeatmapError {
    pub fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SeatmapError>;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmenterKind {
    Components,
    Superpixels,
    Watershed,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageSource {
    Ocr,
    RegionHeuristic,
    GrayMask,
    TextTemplate,
    PositionalDefault,
}

/// Non-fatal conditions. The run keeps going and these land in the result's warnings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DegradedSignal {
    NoTextMask,
    EmptySegmenter { segmenter: SegmenterKind },
    StageTierMissed { tier: StageSource },
    StagePositionalDefault,
    StagePlaceholderInjected,
    NoGradedRegions,
    OcrUnavailable,
}

impl std::fmt::Display for DegradedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoTextMask => write!(f, "text suppressor found no glyph-like blobs"),
            Self::EmptySegmenter { segmenter } => {
                write!(f, "segmenter {:?} produced no regions", segmenter)
            }
            Self::StageTierMissed { tier } => write!(f, "stage tier {:?} found nothing", tier),
            Self::StagePositionalDefault => {
                write!(f, "stage fell back to the positional default")
            }
            Self::StagePlaceholderInjected => {
                write!(f, "no region covers the stage; placeholder injected")
            }
            Self::NoGradedRegions => write!(f, "no region qualified for grading"),
            Self::OcrUnavailable => write!(f, "no OCR lines supplied"),
        }
    }
}

/// Collects degraded signals for one run and mirrors each one to the log.
#[derive(Debug, Default)]
pub struct Warnings {
    signals: Vec<DegradedSignal>,
}

impl Warnings {
    pub fn push(&mut self, signal: DegradedSignal) {
        log::warn!("{}", signal);
        if !self.signals.contains(&signal) {
            self.signals.push(signal);
        }
    }

    pub fn into_vec(self) -> Vec<DegradedSignal> {
        self.signals
    }
}
