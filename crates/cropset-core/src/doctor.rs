use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::DetectionCache;
use crate::coco::InputDataset;
use crate::config::{DetectorCfg, PipelineConfig};
use crate::pipeline::Plan;

pub fn check_thresholds(cfg: &PipelineConfig) -> Result<()> {
    anyhow::ensure!(
        (0.0..1.0).contains(&cfg.crop.confidence_threshold),
        "crop.confidence_threshold should be in 0..1"
    );
    anyhow::ensure!(cfg.crop.padding_factor >= 1.0, "crop.padding_factor must be >= 1.0");
    anyhow::ensure!((0.0..=1.0).contains(&cfg.split.test_fraction), "split.test_fraction must be in 0..=1");
    anyhow::ensure!(cfg.output.images_per_shard > 0, "output.images_per_shard must be positive");
    Ok(())
}

pub fn check_detector(cfg: &DetectorCfg) -> Result<()> {
    match cfg.backend.as_str() {
        "cache-only" => Ok(()),
        "tflite" => {
            let model = cfg.model_path.as_ref().context("detector.model_path missing")?;
            anyhow::ensure!(model.exists(), "detector.model_path missing: {}", model.display());
            anyhow::ensure!(cfg.num_threads >= 1, "detector.num_threads must be >= 1");
            Ok(())
        }
        other => anyhow::bail!("unknown detector.backend: {other}"),
    }
}

pub fn check_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        anyhow::ensure!(dir.is_dir(), "output path is not a dir: {}", dir.display());
    }
    Ok(())
}

/// What a run would see, computed without touching the detector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Survey {
    pub images: usize,
    pub annotations: usize,
    pub categories: usize,
    pub locations: usize,
    pub train_locations: usize,
    pub test_locations: usize,
    /// Images with exactly one distinct category that is not excluded.
    pub usable_images: usize,
    pub cached_detections: Option<usize>,
    /// Usable images the loaded cache has no entry for.
    pub uncached_images: usize,
}

pub fn survey(cfg: &PipelineConfig) -> Result<Survey> {
    let targets = cfg.validate().context("validate config")?;
    for dir in targets.coco_dir.iter().chain(targets.records.iter().map(|r| &r.dir)) {
        check_output_dir(dir)?;
    }

    let dataset = InputDataset::load(&cfg.input.annotations)?;
    let plan = Plan::build(cfg, &dataset)?;
    let cache = cfg.cache.load_from.as_deref().map(DetectionCache::load).transpose()?;

    let by_image = dataset.categories_by_image();
    let mut usable_images = 0;
    let mut uncached_images = 0;
    for image in &dataset.images {
        let Some(cats) = by_image.get(&image.id) else { continue };
        let Some(&only) = cats.first().filter(|_| cats.len() == 1) else { continue };
        if plan.excluded.contains(&plan.categories.lookup(only)?.name) {
            continue;
        }
        usable_images += 1;
        if !cache.as_ref().is_some_and(|c| c.contains(&image.id)) {
            uncached_images += 1;
        }
    }

    Ok(Survey {
        images: dataset.images.len(),
        annotations: dataset.annotations.len(),
        categories: dataset.categories.len(),
        locations: plan.split.len(),
        train_locations: plan.split.train.len(),
        test_locations: plan.split.test.len(),
        usable_images,
        cached_detections: cache.as_ref().map(DetectionCache::len),
        uncached_images,
    })
}

/// Every check `cropset doctor` runs.
pub fn check(cfg: &PipelineConfig) -> Result<Survey> {
    info!("doctor: starting");
    check_thresholds(cfg)?;
    check_detector(&cfg.detector)?;
    let survey = survey(cfg)?;

    if survey.train_locations == 0 {
        warn!("doctor: only {} location(s); the train split will be empty", survey.locations);
    }
    if cfg.detector.backend == "cache-only" && survey.uncached_images > 0 {
        warn!(
            "doctor: backend is cache-only but {} usable images have no cached detections",
            survey.uncached_images
        );
    }
    info!(
        "doctor: {} images, {} usable, {} locations ({} train / {} test)",
        survey.images, survey.usable_images, survey.locations, survey.train_locations, survey.test_locations
    );
    info!("doctor: OK");
    Ok(survey)
}
