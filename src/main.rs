use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seatmap_lib::{
    load_ocr_lines, process_seatmap_from_path, NoOcr, OcrProvider, PipelineConfig, PipelinePreset,
    PrecomputedOcr,
};

#[derive(Parser)]
#[command(name = "seatmap")]
#[command(about = "Turn a venue seating-chart image into graded seat sections")]
struct Cli {
    /// Seating-chart image (PNG, JPEG, ...)
    image: PathBuf,

    /// JSON pipeline configuration; missing keys take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Segmentation preset, overriding the config file
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Attendees to distribute over graded sections
    #[arg(short, long)]
    total_attendees: Option<u32>,

    /// Seats represented by one rendered component
    #[arg(long)]
    seats_per_component: Option<u32>,

    /// OCR lines from an external recognizer: JSON array of {text, score, polygon}
    #[arg(long)]
    ocr_lines: Option<PathBuf>,

    /// Write the result here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretty-print the JSON
    #[arg(long)]
    pretty: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Fast,
    Full,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(mode) = cli.mode {
        let preset = PipelineConfig::from_preset(match mode {
            ModeArg::Fast => PipelinePreset::Fast,
            ModeArg::Full => PipelinePreset::Full,
        });
        config.mode = preset.mode;
        config.ensemble_iou_threshold = preset.ensemble_iou_threshold;
    }
    if let Some(total) = cli.total_attendees {
        config.total_attendees = Some(total);
    }
    if let Some(seats) = cli.seats_per_component {
        config.seats_per_component = seats;
    }

    let ocr: Box<dyn OcrProvider> = match &cli.ocr_lines {
        Some(path) => Box::new(PrecomputedOcr {
            lines: load_ocr_lines(path)
                .with_context(|| format!("loading OCR lines {}", path.display()))?,
        }),
        None => Box::new(NoOcr),
    };

    let result = process_seatmap_from_path(&cli.image, &config, ocr.as_ref())
        .with_context(|| format!("processing {}", cli.image.display()))?;

    let json = if cli.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    match &cli.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
