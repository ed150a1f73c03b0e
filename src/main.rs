// Command-line runner over the `radar_labeler` library.
//
// The radar region itself is produced by an external grabber that keeps an
// image file up to date; every subcommand that needs a frame re-reads it.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use radar_labeler::config::LabelerConfig;
use radar_labeler::core_modules::frame::CircleGeometry;
use radar_labeler::pipeline::{CaptureOutcome, CaptureSession, ImageFileSampler, SessionHandle};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "radar_labeler")]
#[command(about = "Turn radar/minimap captures into balanced bearing and distance labels")]
#[command(version)]
struct Cli {
    /// Dataset root holding screenshots/ and csv/.
    #[arg(long, default_value = "Data")]
    root: PathBuf,

    /// JSON configuration; environment variables still override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze the current frame and print the result without saving anything.
    Probe(SourceArgs),

    /// Capture, label and store samples.
    Capture {
        #[command(flatten)]
        source: SourceArgs,

        /// Number of consecutive captures.
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Capture on a fixed interval until interrupted.
    Watch {
        #[command(flatten)]
        source: SourceArgs,

        /// Milliseconds between captures.
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many captures.
        #[arg(long)]
        max: Option<usize>,
    },

    /// Evict samples that exceed any quota cap.
    Prune,

    /// Prune, then print per-group counts against caps.
    Balance {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Args)]
struct SourceArgs {
    /// Image file holding the current radar region.
    #[arg(long)]
    image: PathBuf,

    /// Circle center x; defaults to the image center.
    #[arg(long, requires_all = ["center_y", "radius"])]
    center_x: Option<f64>,

    #[arg(long)]
    center_y: Option<f64>,

    /// Circle radius; defaults to 0.52 of the shorter side.
    #[arg(long)]
    radius: Option<f64>,
}

impl SourceArgs {
    fn sampler(&self) -> ImageFileSampler {
        let sampler = ImageFileSampler::new(&self.image);
        match (self.center_x, self.center_y, self.radius) {
            (Some(x), Some(y), Some(r)) => sampler.with_circle(CircleGeometry::new((x, y), r)),
            _ => sampler,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<LabelerConfig> {
    match path {
        Some(path) => LabelerConfig::load(path),
        None => Ok(LabelerConfig::from_env()),
    }
}

fn report(outcome: &CaptureOutcome) {
    match outcome {
        CaptureOutcome::Saved(saved) => println!(
            "saved {} angle={:.2} ({}/{}) distance={:.2} ({}/{})",
            saved.label.uuid,
            saved.label.angle_deg,
            saved.label.labels.angle_macro,
            saved.label.labels.angle_micro,
            saved.label.distance_px,
            saved.label.labels.distance_macro,
            saved.label.labels.distance_micro
        ),
        CaptureOutcome::Skipped { uuid, violations } => {
            let reasons: Vec<String> = violations.iter().map(ToString::to_string).collect();
            println!("skipped {}: {}", uuid, reasons.join(" | "));
        }
        CaptureOutcome::Dropped { uuid, error } => println!("dropped {}: {}", uuid, error),
    }
}

async fn watch(handle: SessionHandle, source: SourceArgs, interval_ms: u64, max: Option<usize>) -> Result<()> {
    let mut sampler = source.sampler();
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut captured = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted after {} capture(s)", captured);
                break;
            }
            _ = ticker.tick() => {
                match handle.capture(&mut sampler, Uuid::new_v4()).await {
                    Ok(outcome) => report(&outcome),
                    Err(err) => warn!("Capture failed: {err:#}"),
                }
                captured += 1;
                if max.is_some_and(|max| captured >= max) {
                    break;
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let mut session = CaptureSession::new(config, &cli.root);

    match cli.command {
        Commands::Probe(source) => {
            let analysis = session.probe(&mut source.sampler())?;
            println!(
                "{}",
                serde_json::to_string_pretty(&analysis).context("Failed to encode the analysis")?
            );
        }
        Commands::Capture { source, count } => {
            let mut sampler = source.sampler();
            for _ in 0..count.max(1) {
                let outcome = session.capture(&mut sampler, Uuid::new_v4())?;
                report(&outcome);
            }
        }
        Commands::Watch {
            source,
            interval_ms,
            max,
        } => {
            watch(SessionHandle::new(session), source, interval_ms, max).await?;
        }
        Commands::Prune => {
            let pruned = session.prune();
            println!(
                "removed {} sample(s), {} retained",
                pruned.removed.len(),
                pruned.retained.len()
            );
        }
        Commands::Balance { json } => {
            let balance = session.balance();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&balance).context("Failed to encode the report")?
                );
            } else {
                print!("{balance}");
            }
        }
    }
    Ok(())
}
