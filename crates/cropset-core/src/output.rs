use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::coco::{Category, CocoDataset};
use crate::error::{PipelineError, Result};
use crate::records::{ClassLabel, RecordDescriptor, RecordWriter, ShardedRecordWriter};
use crate::store::ImageStore;

pub const LABEL_MAP_FILE: &str = "label_map.pbtxt";

/// Where the run writes its results, resolved once from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTargets {
    pub coco_dir: Option<PathBuf>,
    pub records: Option<RecordsTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordsTarget {
    pub dir: PathBuf,
    pub images_per_shard: usize,
}

impl OutputTargets {
    pub fn new(coco_dir: Option<PathBuf>, records: Option<RecordsTarget>) -> Result<Self> {
        if coco_dir.is_none() && records.is_none() {
            return Err(PipelineError::NoOutputTarget);
        }
        if records.as_ref().is_some_and(|r| r.images_per_shard == 0) {
            return Err(PipelineError::InvalidShardSize);
        }
        Ok(Self { coco_dir, records })
    }

    /// Directory that receives the cropped images. Records-only runs stage
    /// them under `<records dir>/crops`.
    pub fn crop_root(&self) -> PathBuf {
        match (&self.coco_dir, &self.records) {
            (Some(dir), _) => dir.clone(),
            (None, Some(r)) => r.dir.join("crops"),
            (None, None) => PathBuf::from("crops"),
        }
    }

    /// Default location of the saved detection cache.
    pub fn default_cache_path(&self) -> PathBuf {
        let dir = match (&self.coco_dir, &self.records) {
            (Some(dir), _) => dir.clone(),
            (None, Some(r)) => r.dir.clone(),
            (None, None) => PathBuf::from("."),
        };
        dir.join("detections_final.json")
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in self.coco_dir.iter().chain(self.records.iter().map(|r| &r.dir)) {
            if !dir.exists() {
                info!("output: creating {}", dir.display());
                fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
            }
        }
        Ok(())
    }
}

/// Writes `train.json` and `test.json` into `dir`.
pub fn write_coco_style(train: &CocoDataset, test: &CocoDataset, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
    for (name, dataset) in [("train.json", train), ("test.json", test)] {
        let path = dir.join(name);
        let file = File::create(&path).map_err(PipelineError::io(&path))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, dataset)?;
        w.flush().map_err(PipelineError::io(&path))?;
        info!("output: wrote {} ({} images)", path.display(), dataset.images.len());
    }
    Ok(())
}

/// Feeds one split to a record writer. Images and annotations are paired by
/// position, which is how the assembler appends them.
pub fn write_split_records(
    dataset: &CocoDataset,
    crop_root: &Path,
    store: &dyn ImageStore,
    writer: &mut dyn RecordWriter,
) -> Result<usize> {
    let mut n = 0;
    for (image, ann) in dataset.images.iter().zip(&dataset.annotations) {
        let category = dataset
            .category(ann.category_id)
            .ok_or(PipelineError::UnknownCategoryId(ann.category_id as i64))?;
        let path = crop_root.join(&image.file_name);
        let record = RecordDescriptor {
            filename: image.file_name.clone(),
            id: image.id,
            width: image.width,
            height: image.height,
            class: ClassLabel { label: category.id, text: category.name.clone() },
            format: image_format_name(&image.file_name),
            encoded: store.read_bytes(&path)?,
        };
        writer.add(&record)?;
        n += 1;
    }
    writer.close()?;
    Ok(n)
}

/// Writes `train-NNNNN` / `test-NNNNN` shards and the label map into `dir`.
pub fn write_records(
    train: &CocoDataset,
    test: &CocoDataset,
    crop_root: &Path,
    store: &dyn ImageStore,
    target: &RecordsTarget,
) -> Result<()> {
    for (name, dataset) in [("train", train), ("test", test)] {
        let mut writer = ShardedRecordWriter::new(&target.dir, name, target.images_per_shard)?;
        let n = write_split_records(dataset, crop_root, store, &mut writer)?;
        info!("output: wrote {n} {name} records in {} shards", writer.shards());
    }
    write_label_map(&train.categories, &target.dir)
}

pub fn write_label_map(categories: &[Category], dir: &Path) -> Result<()> {
    let path = dir.join(LABEL_MAP_FILE);
    fs::write(&path, label_map(categories)).map_err(PipelineError::io(&path))
}

pub fn label_map(categories: &[Category]) -> String {
    categories
        .iter()
        .map(|c| format!("item {{name: \"{}\" id: {}}}\n", c.name, c.id))
        .collect()
}

fn image_format_name(file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "jpeg".into(),
        "" => "unknown".into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::{AnnotationEntry, ImageEntry};
    use crate::store::FsImageStore;

    fn categories() -> Vec<Category> {
        vec![
            Category { id: 0, name: "deer".into(), supercategory: "entity".into() },
            Category { id: 1, name: "fox".into(), supercategory: "entity".into() },
        ]
    }

    fn dataset(names: &[(&str, u32)]) -> CocoDataset {
        let mut ds = CocoDataset::with_categories(categories());
        for (i, (name, cat)) in names.iter().enumerate() {
            ds.images.push(ImageEntry { id: i as u64, width: 2, height: 2, file_name: name.to_string() });
            ds.annotations.push(AnnotationEntry { id: i as u64, image_id: i as u64, category_id: *cat });
        }
        ds
    }

    #[derive(Default)]
    struct Collect {
        records: Vec<RecordDescriptor>,
        closed: bool,
    }

    impl RecordWriter for Collect {
        fn add(&mut self, record: &RecordDescriptor) -> Result<()> {
            self.records.push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn targets_require_one_output() {
        assert!(matches!(OutputTargets::new(None, None), Err(PipelineError::NoOutputTarget)));
        let records = RecordsTarget { dir: "r".into(), images_per_shard: 0 };
        assert!(matches!(OutputTargets::new(None, Some(records)), Err(PipelineError::InvalidShardSize)));
    }

    #[test]
    fn crop_root_and_cache_path() {
        let records = RecordsTarget { dir: PathBuf::from("r"), images_per_shard: 10 };
        let only_records = OutputTargets::new(None, Some(records.clone())).unwrap();
        assert_eq!(only_records.crop_root(), PathBuf::from("r/crops"));
        assert_eq!(only_records.default_cache_path(), PathBuf::from("r/detections_final.json"));

        let both = OutputTargets::new(Some("c".into()), Some(records)).unwrap();
        assert_eq!(both.crop_root(), PathBuf::from("c"));
        assert_eq!(both.default_cache_path(), PathBuf::from("c/detections_final.json"));
    }

    #[test]
    fn label_map_lines() {
        assert_eq!(label_map(&categories()), "item {name: \"deer\" id: 0}\nitem {name: \"fox\" id: 1}\n");
    }

    #[test]
    fn coco_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let train = dataset(&[("deer/a.jpg", 0)]);
        let test = dataset(&[("fox/b.jpg", 1), ("fox/c.jpg", 1)]);
        write_coco_style(&train, &test, dir.path()).unwrap();

        let back: CocoDataset = serde_json::from_slice(&fs::read(dir.path().join("test.json")).unwrap()).unwrap();
        assert_eq!(back, test);
        let raw: serde_json::Value = serde_json::from_slice(&fs::read(dir.path().join("train.json")).unwrap()).unwrap();
        assert_eq!(raw["categories"][1]["supercategory"], "entity");
    }

    #[test]
    fn split_records_carry_labels_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("fox")).unwrap();
        fs::write(dir.path().join("fox/b.jpg"), [1u8, 2, 3]).unwrap();
        let ds = dataset(&[("fox/b.jpg", 1)]);

        let mut sink = Collect::default();
        let n = write_split_records(&ds, dir.path(), &FsImageStore, &mut sink).unwrap();
        assert_eq!(n, 1);
        assert!(sink.closed);
        let rec = &sink.records[0];
        assert_eq!(rec.class, ClassLabel { label: 1, text: "fox".into() });
        assert_eq!(rec.encoded, vec![1, 2, 3]);
        assert_eq!(rec.format, "jpeg");
    }

    #[test]
    fn records_and_label_map_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let crops = dir.path().join("crops");
        fs::create_dir_all(crops.join("deer")).unwrap();
        fs::write(crops.join("deer/a.png"), [9u8]).unwrap();
        let train = dataset(&[("deer/a.png", 0)]);
        let test = dataset(&[]);
        let target = RecordsTarget { dir: dir.path().join("records"), images_per_shard: 200 };

        write_records(&train, &test, &crops, &FsImageStore, &target).unwrap();
        assert!(target.dir.join("train-00000").exists());
        assert!(!target.dir.join("test-00000").exists());
        assert_eq!(
            fs::read_to_string(target.dir.join(LABEL_MAP_FILE)).unwrap(),
            label_map(&categories())
        );
    }
}
