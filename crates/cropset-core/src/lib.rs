//! Turns a COCO-style detection dataset into a cropped, location-split
//! classification dataset.
//!
//! The pipeline runs a detector over every single-label image (memoizing the
//! raw output in a [`cache::DetectionCache`]), crops a padded square around
//! each confident detection and appends the crop to the train or test split
//! chosen by the image's location.

pub mod assembler;
pub mod cache;
pub mod coco;
pub mod config;
pub mod detections;
pub mod doctor;
mod error;
pub mod geometry;
pub mod output;
pub mod pipeline;
pub mod records;
pub mod runner;
pub mod skip;
pub mod split;
pub mod store;

pub use config::PipelineConfig;
pub use detections::{Detection, DetectionRecord, RawDetections};
pub use error::{PipelineError, Result};
pub use pipeline::{run, RunSummary};

use image::DynamicImage;

/// Object detector collaborator.
///
/// Returns the raw output for one image: boxes as normalized
/// `[top, left, bottom, right]`, scores, float class ids and a count.
/// Normalization into a [`DetectionRecord`] happens on the caller side.
pub trait Detector: Send {
    fn detect(&mut self, image: &DynamicImage) -> anyhow::Result<RawDetections>;
}
