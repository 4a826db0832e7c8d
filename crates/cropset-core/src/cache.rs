use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::coco::ImageId;
use crate::detections::DetectionRecord;
use crate::error::{PipelineError, Result};

const CACHE_VERSION: u32 = 1;

/// Image id -> full detector output. Unbounded; lives in memory for the
/// whole run and is saved once at the end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionCache {
    entries: BTreeMap<String, DetectionRecord>,
}

#[derive(Deserialize)]
struct CacheFile {
    version: u32,
    detections: BTreeMap<String, DetectionRecord>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(path.to_path_buf()));
        }
        let file = fs::File::open(path).map_err(PipelineError::io(path))?;
        let parsed: CacheFile = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            PipelineError::CorruptCache { path: path.to_path_buf(), source }
        })?;
        if parsed.version != CACHE_VERSION {
            return Err(PipelineError::InvalidDetections(format!(
                "{}: unsupported cache version {}",
                path.display(),
                parsed.version
            )));
        }
        for (id, record) in &parsed.detections {
            record
                .validate()
                .map_err(|e| PipelineError::InvalidDetections(format!("{}: image {id}: {e}", path.display())))?;
        }
        info!("cache: loaded {} detection records from {}", parsed.detections.len(), path.display());
        Ok(Self { entries: parsed.detections })
    }

    pub fn get(&self, id: &ImageId) -> Option<&DetectionRecord> {
        self.entries.get(&id.to_string())
    }

    pub fn put(&mut self, id: &ImageId, record: DetectionRecord) {
        self.entries.insert(id.to_string(), record);
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.entries.contains_key(&id.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes to a sibling `.tmp` file and renames it over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(PipelineError::io(parent))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp).map_err(PipelineError::io(&tmp))?;
            let mut w = BufWriter::new(file);
            let body = CacheFileRef { version: CACHE_VERSION, detections: &self.entries };
            serde_json::to_writer(&mut w, &body)?;
            w.flush().map_err(PipelineError::io(&tmp))?;
        }
        fs::rename(&tmp, path).map_err(PipelineError::io(path))?;
        info!("cache: saved {} detection records to {}", self.entries.len(), path.display());
        Ok(())
    }
}

#[derive(Serialize)]
struct CacheFileRef<'a> {
    version: u32,
    detections: &'a BTreeMap<String, DetectionRecord>,
}
