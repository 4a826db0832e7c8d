//! Sharded record files: one JSON object per line, image bytes base64 encoded.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassLabel {
    pub label: u32,
    pub text: String,
}

/// Everything a record carries about one crop.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDescriptor {
    pub filename: String,
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub class: ClassLabel,
    pub format: String,
    pub encoded: Vec<u8>,
}

pub trait RecordWriter {
    fn add(&mut self, record: &RecordDescriptor) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

#[derive(Serialize)]
struct RecordLine<'a> {
    filename: &'a str,
    id: u64,
    height: u32,
    width: u32,
    class: &'a ClassLabel,
    format: &'a str,
    encoded: String,
}

/// Writes `<dir>/<name>-00000`, `<dir>/<name>-00001`, ... starting a new
/// shard every `per_shard` records.
pub struct ShardedRecordWriter {
    dir: PathBuf,
    name: String,
    per_shard: usize,
    next_shard_idx: usize,
    written: usize,
    current: Option<BufWriter<File>>,
}

impl ShardedRecordWriter {
    pub fn new(dir: &Path, name: &str, per_shard: usize) -> Result<Self> {
        if per_shard == 0 {
            return Err(PipelineError::InvalidShardSize);
        }
        fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            per_shard,
            next_shard_idx: 0,
            written: 0,
            current: None,
        })
    }

    pub fn shard_path(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("{}-{:05}", self.name, idx))
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn shards(&self) -> usize {
        self.next_shard_idx
    }

    fn finish_shard(&mut self) -> Result<()> {
        if let Some(mut w) = self.current.take() {
            let path = self.shard_path(self.next_shard_idx - 1);
            w.flush().map_err(PipelineError::io(path))?;
        }
        Ok(())
    }
}

impl RecordWriter for ShardedRecordWriter {
    fn add(&mut self, record: &RecordDescriptor) -> Result<()> {
        if self.written % self.per_shard == 0 {
            self.finish_shard()?;
            let path = self.shard_path(self.next_shard_idx);
            debug!("records: opening shard {}", path.display());
            let file = File::create(&path).map_err(PipelineError::io(&path))?;
            self.current = Some(BufWriter::new(file));
            self.next_shard_idx += 1;
        }

        let line = RecordLine {
            filename: &record.filename,
            id: record.id,
            height: record.height,
            width: record.width,
            class: &record.class,
            format: &record.format,
            encoded: base64::engine::general_purpose::STANDARD.encode(&record.encoded),
        };
        let shard = self.shard_path(self.next_shard_idx - 1);
        let Some(w) = self.current.as_mut() else {
            return Ok(());
        };
        serde_json::to_writer(&mut *w, &line)?;
        w.write_all(b"\n").map_err(PipelineError::io(shard))?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.written == 0 {
            warn!("records: no images were written for {}", self.name);
        }
        self.finish_shard()
    }
}
