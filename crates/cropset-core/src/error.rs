use std::path::PathBuf;

use thiserror::Error;

/// Fatal pipeline errors. Per-image and per-detection problems are not
/// errors; see [`crate::skip::SkipReason`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input does not exist: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("no output target configured (set output.coco_dir and/or output.records_dir)")]
    NoOutputTarget,

    #[error("detection cache {} is corrupt: {source}", path.display())]
    CorruptCache {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("test_fraction must be within [0, 1], got {0}")]
    InvalidFraction(f64),

    #[error("padding_factor must be >= 1, got {0}")]
    InvalidPaddingFactor(f64),

    #[error("confidence_threshold must be within [0, 1), got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("images_per_shard must be greater than 0")]
    InvalidShardSize,

    #[error("category {0:?} does not exist in the dataset")]
    UnknownCategory(String),

    #[error("annotation references unknown category id {0}")]
    UnknownCategoryId(i64),

    #[error("image id {0} is used by more than one image")]
    DuplicateImageId(String),

    #[error("image {image} has no usable {key:?} field")]
    MissingLocation { image: String, key: String },

    #[error("invalid detector output: {0}")]
    InvalidDetections(String),

    #[error("detector failed on {image}: {message}")]
    Detector { image: String, message: String },

    #[error("failed to parse {}: {source}", path.display())]
    InputJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| PipelineError::Io { path, source }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
