use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cropset_core::coco::InputDataset;
use cropset_core::pipeline::Plan;
use cropset_core::store::FsImageStore;
use cropset_core::{doctor, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "cropset", version, about = "Crop camera-trap detections into a location-split classification dataset")]
struct Cli {
    #[arg(long)]
    config: PathBuf,

    /// Overrides output.coco_dir.
    #[arg(long, global = true)]
    coco_dir: Option<PathBuf>,

    /// Overrides output.records_dir.
    #[arg(long, global = true)]
    records_dir: Option<PathBuf>,

    /// Detections from an earlier run (overrides cache.load_from).
    #[arg(long, global = true)]
    use_detection_file: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Detect, crop and write the train/test datasets.
    Run,
    /// Check configuration and inputs without running the detector.
    Doctor,
    /// Print categories, an example image and the location split.
    Inspect {
        /// Also print the detector model's tensor layout.
        #[arg(long)]
        model: bool,
    },
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    if let Some(dir) = &cli.coco_dir {
        cfg.output.coco_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.records_dir {
        cfg.output.records_dir = Some(dir.clone());
    }
    if let Some(file) = &cli.use_detection_file {
        cfg.cache.load_from = Some(file.clone());
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.cmd {
        Command::Run => run(&cfg)?,
        Command::Doctor => {
            doctor::check(&cfg)?;
        }
        Command::Inspect { model } => inspect(&cfg, model)?,
    }
    Ok(())
}

fn run(cfg: &PipelineConfig) -> Result<()> {
    let mut detector = cropset_vision::build_detector(&cfg.detector).context("init detector")?;
    let summary = cropset_core::run(cfg, detector.as_mut(), &FsImageStore).context("pipeline run")?;
    info!(
        "run: {} train / {} test entries, {} cache hits, detections saved to {}",
        summary.train_entries,
        summary.test_entries,
        summary.cache_hits,
        summary.cache_path.display()
    );
    for (reason, n) in &summary.skips {
        info!("run: skipped {n} x {}", reason.describe());
    }
    Ok(())
}

fn inspect(cfg: &PipelineConfig, model: bool) -> Result<()> {
    let dataset = InputDataset::load(&cfg.input.annotations).context("load annotations")?;
    let plan = Plan::build(cfg, &dataset).context("plan split")?;

    println!("categories ({}):", dataset.categories.len());
    for c in plan.categories.categories() {
        let excluded = if plan.excluded.contains(&c.name) { " (excluded)" } else { "" };
        println!("  {:>4}  {}{}", c.id, c.name, excluded);
    }

    if let Some(example) = dataset.sorted_images().first() {
        let annotations: Vec<_> = dataset.annotations.iter().filter(|a| a.image_id == example.id).collect();
        println!("example image:\n{}", serde_json::to_string_pretty(example)?);
        println!("its annotations:\n{}", serde_json::to_string_pretty(&annotations)?);
    }

    let join = |set: &std::collections::BTreeSet<cropset_core::coco::LocationId>| {
        set.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ")
    };
    println!("train locations ({}): {}", plan.split.train.len(), join(&plan.split.train));
    println!("test locations ({}): {}", plan.split.test.len(), join(&plan.split.test));

    if model {
        inspect_model(cfg)?;
    }
    Ok(())
}

#[cfg(feature = "detector-tflite")]
fn inspect_model(cfg: &PipelineConfig) -> Result<()> {
    let path = cfg.detector.model_path.as_ref().context("detector.model_path missing")?;
    let mut det = cropset_vision::tflite::TfliteDetector::new(path, cfg.detector.num_threads)?;
    print!("{}", det.inspect()?);
    Ok(())
}

#[cfg(not(feature = "detector-tflite"))]
fn inspect_model(_cfg: &PipelineConfig) -> Result<()> {
    anyhow::bail!("detector backend not available; build with --features detector-tflite")
}
