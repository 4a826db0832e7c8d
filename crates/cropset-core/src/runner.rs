use std::path::Path;

use image::DynamicImage;
use tracing::debug;

use crate::cache::DetectionCache;
use crate::coco::ImageId;
use crate::detections::DetectionRecord;
use crate::error::{PipelineError, Result};
use crate::skip::SkipReason;
use crate::store::{ImageStore, LoadError};
use crate::Detector;

/// Outcome of resolving detections for one image.
#[derive(Debug)]
pub enum Resolution {
    Cached(DetectionRecord),
    /// Fresh detector run; the decoded pixels are handed on so the crop stage
    /// does not decode the image again.
    Fresh { record: DetectionRecord, image: DynamicImage },
    Unavailable(SkipReason),
}

/// Resolves detections through the cache, running the detector only on
/// misses.
#[derive(Debug, Default)]
pub struct DetectionRunner {
    cache: DetectionCache,
    invocations: usize,
    hits: usize,
}

impl DetectionRunner {
    pub fn new(cache: DetectionCache) -> Self {
        Self { cache, invocations: 0, hits: 0 }
    }

    pub fn resolve(
        &mut self,
        id: &ImageId,
        source: &Path,
        store: &dyn ImageStore,
        detector: &mut dyn Detector,
    ) -> Result<Resolution> {
        if let Some(record) = self.cache.get(id) {
            self.hits += 1;
            return Ok(Resolution::Cached(record.clone()));
        }

        let image = match store.load(source) {
            Ok(img) => img,
            Err(LoadError::Missing) => return Ok(Resolution::Unavailable(SkipReason::ImageMissing)),
            Err(LoadError::Undecodable(_)) => return Ok(Resolution::Unavailable(SkipReason::ImageUndecodable)),
            Err(LoadError::Io(e)) => return Err(PipelineError::Io { path: source.to_path_buf(), source: e }),
        };

        self.invocations += 1;
        let raw = detector.detect(&image).map_err(|e| PipelineError::Detector {
            image: id.to_string(),
            message: format!("{e:#}"),
        })?;
        let record = DetectionRecord::from_raw(raw)?;
        debug!("detect: {id}: {} detections", record.count);

        self.cache.put(id, record.clone());
        Ok(Resolution::Fresh { record, image })
    }

    pub fn cache(&self) -> &DetectionCache {
        &self.cache
    }

    pub fn into_cache(self) -> DetectionCache {
        self.cache
    }

    /// Live detector calls made so far.
    pub fn invocations(&self) -> usize {
        self.invocations
    }

    pub fn cache_hits(&self) -> usize {
        self.hits
    }
}
