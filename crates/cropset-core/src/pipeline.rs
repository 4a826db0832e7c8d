use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::assembler::DatasetAssembler;
use crate::cache::DetectionCache;
use crate::coco::{CategoryTable, ImageId, InputDataset, InputImage, LocationId};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::output::{write_coco_style, write_records};
use crate::runner::{DetectionRunner, Resolution};
use crate::skip::{SkipLog, SkipReason};
use crate::split::{LocationSplit, Split};
use crate::store::ImageStore;
use crate::Detector;

const PROGRESS_EVERY: usize = 500;

/// Everything decided before the first image is touched: category ids,
/// excluded names, image locations and the train/test partition.
#[derive(Debug)]
pub struct Plan<'a> {
    pub categories: CategoryTable,
    pub excluded: HashSet<String>,
    pub locations: HashMap<&'a ImageId, LocationId>,
    pub split: LocationSplit,
}

impl<'a> Plan<'a> {
    pub fn build(config: &PipelineConfig, dataset: &'a InputDataset) -> Result<Self> {
        let categories = CategoryTable::from_input(&dataset.categories);
        for name in &config.input.exclude_categories {
            if !categories.contains_name(name) {
                return Err(PipelineError::UnknownCategory(name.clone()));
            }
        }

        let key = &config.input.location_key;
        let mut locations = HashMap::with_capacity(dataset.images.len());
        // cache keys are the string form, so `3` and `"3"` would share an entry
        let mut keys = HashSet::with_capacity(dataset.images.len());
        for image in &dataset.images {
            if !keys.insert(image.id.to_string()) {
                return Err(PipelineError::DuplicateImageId(image.id.to_string()));
            }
            let loc = image.location(key).ok_or_else(|| PipelineError::MissingLocation {
                image: image.id.to_string(),
                key: key.clone(),
            })?;
            locations.insert(&image.id, loc);
        }

        let split = LocationSplit::split(locations.values().cloned(), config.split.test_fraction, config.split.seed)?;
        Ok(Self {
            categories,
            excluded: config.input.exclude_categories.iter().cloned().collect(),
            locations,
            split,
        })
    }

    pub fn side(&self, image: &InputImage) -> Option<Split> {
        self.locations.get(&image.id).and_then(|loc| self.split.side(loc))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub images_total: usize,
    /// Images that contributed at least one crop.
    pub images_used: usize,
    pub train_entries: usize,
    pub test_entries: usize,
    pub crops_written: usize,
    pub crops_reused: usize,
    pub crops_replaced: usize,
    pub detector_invocations: usize,
    pub cache_hits: usize,
    pub skips: BTreeMap<SkipReason, usize>,
    pub cache_path: PathBuf,
}

struct Stages {
    runner: DetectionRunner,
    assembler: DatasetAssembler,
    skips: SkipLog,
}

impl Stages {
    fn process_all(
        &mut self,
        config: &PipelineConfig,
        dataset: &InputDataset,
        plan: &Plan<'_>,
        detector: &mut dyn Detector,
        store: &dyn ImageStore,
    ) -> Result<usize> {
        let by_image = dataset.categories_by_image();
        let images = dataset.sorted_images();
        let total = images.len();
        let mut used = 0;

        for (i, image) in images.into_iter().enumerate() {
            if i > 0 && i % PROGRESS_EVERY == 0 {
                info!(
                    "progress: {i}/{total} images, {} detector runs, {} cache hits",
                    self.runner.invocations(),
                    self.runner.cache_hits()
                );
            }

            let input_category = match by_image.get(&image.id).map(|c| (c.len(), c.first())) {
                Some((1, Some(&c))) => c,
                Some((n, _)) if n > 1 => {
                    self.skips.record(SkipReason::MultipleCategories, &image.file_name);
                    continue;
                }
                _ => {
                    self.skips.record(SkipReason::NoCategory, &image.file_name);
                    continue;
                }
            };
            let category = plan.categories.lookup(input_category)?;
            if plan.excluded.contains(&category.name) {
                self.skips.record(SkipReason::ExcludedCategory, &image.file_name);
                continue;
            }
            let split = plan.side(image).ok_or_else(|| PipelineError::MissingLocation {
                image: image.id.to_string(),
                key: config.input.location_key.clone(),
            })?;

            let source = config.input.image_dir.join(&image.file_name);
            let (record, pixels) = match self.runner.resolve(&image.id, &source, store, detector)? {
                Resolution::Cached(record) => (record, None),
                Resolution::Fresh { record, image } => (record, Some(image)),
                Resolution::Unavailable(reason) => {
                    self.skips.record(reason, &image.file_name);
                    continue;
                }
            };

            if self.assembler.assemble(image, category, split, &record, pixels, store, &mut self.skips)? > 0 {
                used += 1;
            }
        }
        Ok(used)
    }
}

/// Runs the whole conversion: split, detect (through the cache), crop,
/// assemble, write outputs. The detection cache is saved even when
/// processing fails part way.
pub fn run(config: &PipelineConfig, detector: &mut dyn Detector, store: &dyn ImageStore) -> Result<RunSummary> {
    let targets = config.validate()?;
    let dataset = InputDataset::load(&config.input.annotations)?;
    info!(
        "input: {} images, {} annotations, {} categories",
        dataset.images.len(),
        dataset.annotations.len(),
        dataset.categories.len()
    );

    let plan = Plan::build(config, &dataset)?;
    info!(
        "split: {} locations in total, {} for training, {} for testing",
        plan.split.len(),
        plan.split.train.len(),
        plan.split.test.len()
    );
    if plan.split.is_degenerate() {
        warn!("split: only one location; every image goes to the test split and train stays empty");
    }

    let cache = match &config.cache.load_from {
        Some(path) => DetectionCache::load(path)?,
        None => DetectionCache::new(),
    };
    targets.create_dirs()?;
    let cache_path = config.cache_save_path(&targets);
    let crop_root = targets.crop_root();

    let mut stages = Stages {
        runner: DetectionRunner::new(cache),
        assembler: DatasetAssembler::new(
            plan.categories.categories(),
            &config.input.image_dir,
            &crop_root,
            config.crop_options(),
        ),
        skips: SkipLog::default(),
    };

    let processed = stages.process_all(config, &dataset, &plan, detector, store);
    if let Err(save_err) = stages.runner.cache().save(&cache_path) {
        return match processed {
            Err(run_err) => {
                error!("cache: could not save {}: {save_err}", cache_path.display());
                Err(run_err)
            }
            Ok(_) => Err(save_err),
        };
    }
    let images_used = processed?;

    let Stages { runner, assembler, skips } = stages;
    let stats = assembler.stats();
    let (train, test) = assembler.into_datasets();

    if let Some(dir) = &targets.coco_dir {
        write_coco_style(&train, &test, dir)?;
    }
    if let Some(records) = &targets.records {
        write_records(&train, &test, &crop_root, store, records)?;
    }

    skips.log_summary();
    let summary = RunSummary {
        images_total: dataset.images.len(),
        images_used,
        train_entries: train.images.len(),
        test_entries: test.images.len(),
        crops_written: stats.crops_written,
        crops_reused: stats.crops_reused,
        crops_replaced: stats.crops_replaced,
        detector_invocations: runner.invocations(),
        cache_hits: runner.cache_hits(),
        skips: skips.counts().clone(),
        cache_path,
    };
    info!(
        "done: {} of {} images used, {} train / {} test crops ({} written, {} reused, {} replaced), {} detector runs",
        summary.images_used,
        summary.images_total,
        summary.train_entries,
        summary.test_entries,
        summary.crops_written,
        summary.crops_reused,
        summary.crops_replaced,
        summary.detector_invocations
    );
    Ok(summary)
}
