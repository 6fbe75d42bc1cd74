//! Command-line harness for visionflow pipelines: load a pipeline file or
//! package, run images, print payloads.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use visionflow_core::PipelineModel;

#[derive(Parser)]
#[command(name = "visionflow", about = "Dataflow graph executor for vision pipelines")]
struct Cli {
    /// Device the model nodes load onto.
    #[arg(long, default_value_t = 0, global = true)]
    device: i64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one image through a pipeline and print the JSON payload.
    Run {
        /// Pipeline JSON or packaged archive.
        pipeline: PathBuf,
        /// Input image.
        image: PathBuf,
        /// Pretty-print the payload.
        #[arg(long)]
        pretty: bool,
    },
    /// Load a pipeline and print its model pre-load report.
    Inspect { pipeline: PathBuf },
    /// Measure average per-image latency.
    Bench {
        pipeline: PathBuf,
        image: PathBuf,
        #[arg(long, default_value_t = 1)]
        warmup: usize,
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
}

fn load(pipeline: &PathBuf, device: i64) -> Result<PipelineModel> {
    let model = PipelineModel::load_file(pipeline, device)
        .with_context(|| format!("failed to load {}", pipeline.display()))?;
    if !model.is_loaded() {
        bail!("model pre-load failed: {}", model.load_report().message);
    }
    Ok(model)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            pipeline,
            image,
            pretty,
        } => {
            let model = load(&pipeline, cli.device)?;
            let img = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?;
            let results = model.infer_one(&img)?;
            let payload = serde_json::Value::Array(results);
            if pretty {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("{payload}");
            }
        }
        Command::Inspect { pipeline } => {
            let model = PipelineModel::load_file(&pipeline, cli.device)
                .with_context(|| format!("failed to load {}", pipeline.display()))?;
            println!("{}", serde_json::to_string_pretty(model.load_report())?);
        }
        Command::Bench {
            pipeline,
            image,
            warmup,
            runs,
        } => {
            let model = load(&pipeline, cli.device)?;
            let img = image::open(&image)
                .with_context(|| format!("failed to open {}", image.display()))?;
            let ms = model.benchmark(&img, warmup, runs)?;
            println!("avg {ms:.2} ms over {runs} run(s)");
        }
    }
    Ok(())
}
