use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::assembler::CropOptions;
use crate::error::{PipelineError, Result};
use crate::output::{OutputTargets, RecordsTarget};

/// Complete run configuration, usually read from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub input: InputCfg,
    #[serde(default)]
    pub output: OutputCfg,
    #[serde(default)]
    pub crop: CropCfg,
    #[serde(default)]
    pub split: SplitCfg,
    #[serde(default)]
    pub cache: CacheCfg,
    #[serde(default)]
    pub detector: DetectorCfg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputCfg {
    /// COCO-style annotation file.
    pub annotations: PathBuf,
    /// Root the image `file_name`s are relative to.
    pub image_dir: PathBuf,
    /// Image field the train/test split is keyed on.
    #[serde(default = "default_location_key")]
    pub location_key: String,
    #[serde(default)]
    pub exclude_categories: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputCfg {
    pub coco_dir: Option<PathBuf>,
    pub records_dir: Option<PathBuf>,
    #[serde(default = "default_images_per_shard")]
    pub images_per_shard: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CropCfg {
    /// Square crop side = padding_factor * longest box side.
    #[serde(default = "default_padding_factor")]
    pub padding_factor: f64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default)]
    pub overwrite_crops: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SplitCfg {
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheCfg {
    /// Detections from an earlier run; enables resume.
    pub load_from: Option<PathBuf>,
    /// Defaults to `detections_final.json` in the first output directory.
    pub save_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorCfg {
    /// "tflite" | "cache-only"
    #[serde(default = "default_backend")]
    pub backend: String,
    pub model_path: Option<PathBuf>,
    #[serde(default = "default_num_threads")]
    pub num_threads: i32,
}

fn default_location_key() -> String {
    "location".into()
}

fn default_images_per_shard() -> usize {
    200
}

fn default_padding_factor() -> f64 {
    1.3 * 1.3
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_test_fraction() -> f64 {
    0.2
}

fn default_backend() -> String {
    "tflite".into()
}

fn default_num_threads() -> i32 {
    2
}

impl Default for OutputCfg {
    fn default() -> Self {
        Self { coco_dir: None, records_dir: None, images_per_shard: default_images_per_shard() }
    }
}

impl Default for CropCfg {
    fn default() -> Self {
        Self {
            padding_factor: default_padding_factor(),
            confidence_threshold: default_confidence_threshold(),
            overwrite_crops: false,
        }
    }
}

impl Default for SplitCfg {
    fn default() -> Self {
        Self { test_fraction: default_test_fraction(), seed: 0 }
    }
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self { backend: default_backend(), model_path: None, num_threads: default_num_threads() }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).map_err(PipelineError::io(path))?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Checks every fatal configuration condition and resolves the output
    /// targets. Input paths must exist.
    pub fn validate(&self) -> Result<OutputTargets> {
        for path in [&self.input.annotations, &self.input.image_dir] {
            if !path.exists() {
                return Err(PipelineError::MissingInput(path.clone()));
            }
        }
        if let Some(cache) = &self.cache.load_from {
            if !cache.exists() {
                return Err(PipelineError::MissingInput(cache.clone()));
            }
        }
        if !(self.crop.padding_factor >= 1.0) {
            return Err(PipelineError::InvalidPaddingFactor(self.crop.padding_factor));
        }
        if !(0.0..1.0).contains(&self.crop.confidence_threshold) {
            return Err(PipelineError::InvalidConfidenceThreshold(self.crop.confidence_threshold));
        }
        if !(0.0..=1.0).contains(&self.split.test_fraction) {
            return Err(PipelineError::InvalidFraction(self.split.test_fraction));
        }
        self.output_targets()
    }

    pub fn output_targets(&self) -> Result<OutputTargets> {
        let records = self.output.records_dir.as_ref().map(|dir| RecordsTarget {
            dir: dir.clone(),
            images_per_shard: self.output.images_per_shard,
        });
        OutputTargets::new(self.output.coco_dir.clone(), records)
    }

    pub fn crop_options(&self) -> CropOptions {
        CropOptions {
            confidence_threshold: self.crop.confidence_threshold,
            padding_factor: self.crop.padding_factor,
            overwrite: self.crop.overwrite_crops,
        }
    }

    pub fn cache_save_path(&self, targets: &OutputTargets) -> PathBuf {
        self.cache.save_to.clone().unwrap_or_else(|| targets.default_cache_path())
    }
}
