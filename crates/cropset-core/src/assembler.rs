//! Crops confident detections and grows the train/test datasets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::{debug, warn};

use crate::coco::{AnnotationEntry, Category, CocoDataset, ImageEntry, InputImage};
use crate::detections::DetectionRecord;
use crate::error::{PipelineError, Result};
use crate::geometry::{compute_crop_box, PixelBox};
use crate::skip::{SkipLog, SkipReason};
use crate::split::Split;
use crate::store::{ImageStore, LoadError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropOptions {
    pub confidence_threshold: f32,
    pub padding_factor: f64,
    /// Recompute crops even when the output file already exists.
    pub overwrite: bool,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self { confidence_threshold: 0.5, padding_factor: 1.3 * 1.3, overwrite: false }
    }
}

/// Next image / annotation id of one split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdCounter {
    next_image_id: u64,
    next_annotation_id: u64,
}

impl IdCounter {
    pub fn next(&mut self) -> (u64, u64) {
        let ids = (self.next_image_id, self.next_annotation_id);
        self.next_image_id += 1;
        self.next_annotation_id += 1;
        ids
    }
}

/// A dataset together with the counter that owns its ids.
#[derive(Debug, Clone, Default)]
pub struct SplitDataset {
    dataset: CocoDataset,
    ids: IdCounter,
}

impl SplitDataset {
    fn new(categories: Vec<Category>) -> Self {
        Self { dataset: CocoDataset::with_categories(categories), ids: IdCounter::default() }
    }

    /// Appends one image and its annotation; returns the image id.
    fn push(&mut self, width: u32, height: u32, file_name: String, category_id: u32) -> u64 {
        let (image_id, annotation_id) = self.ids.next();
        self.dataset.images.push(ImageEntry { id: image_id, width, height, file_name });
        self.dataset.annotations.push(AnnotationEntry { id: annotation_id, image_id, category_id });
        image_id
    }

    pub fn dataset(&self) -> &CocoDataset {
        &self.dataset
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub crops_written: usize,
    pub crops_reused: usize,
    /// Existing crops that could not be read back and were cropped again.
    pub crops_replaced: usize,
}

pub struct DatasetAssembler {
    options: CropOptions,
    image_dir: PathBuf,
    crop_root: PathBuf,
    train: SplitDataset,
    test: SplitDataset,
    stats: AssemblyStats,
    /// Crop paths handed out during this run.
    claimed: HashSet<String>,
}

impl DatasetAssembler {
    pub fn new(categories: &[Category], image_dir: &Path, crop_root: &Path, options: CropOptions) -> Self {
        Self {
            options,
            image_dir: image_dir.to_path_buf(),
            crop_root: crop_root.to_path_buf(),
            train: SplitDataset::new(categories.to_vec()),
            test: SplitDataset::new(categories.to_vec()),
            stats: AssemblyStats::default(),
            claimed: HashSet::new(),
        }
    }

    /// Crops every detection above the confidence threshold and appends one
    /// entry per crop to `split`. `pixels` are the already decoded image, if
    /// the caller has them. Returns the number of entries appended.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        &mut self,
        image: &InputImage,
        category: &Category,
        split: Split,
        detections: &DetectionRecord,
        pixels: Option<DynamicImage>,
        store: &dyn ImageStore,
        skips: &mut SkipLog,
    ) -> Result<usize> {
        let selected = detections.confident(self.options.confidence_threshold);
        let base_name = format!("{}/{}", category.name, image.file_name);
        let numbered = selected.len() > 1;

        let mut pixels = pixels;
        let mut appended = 0;
        for (idx, det) in selected.iter().enumerate() {
            let bbox = PixelBox::from_normalized(det.bbox, image.width, image.height);
            let Some(crop) = compute_crop_box(&bbox, image.width, image.height, self.options.padding_factor) else {
                skips.record(SkipReason::EmptyCrop, &format!("{} box {idx}", image.file_name));
                continue;
            };

            let wanted = if numbered { numbered_file_name(&base_name, idx) } else { base_name.clone() };
            let file_name = self.claim(wanted);
            let out_path = self.crop_root.join(&file_name);

            let existing = if self.options.overwrite { None } else { self.existing_crop(&out_path, store) };
            let (width, height) = if let Some(dims) = existing {
                self.stats.crops_reused += 1;
                dims
            } else {
                if pixels.is_none() {
                    let source = self.image_dir.join(&image.file_name);
                    match store.load(&source) {
                        Ok(img) => pixels = Some(img),
                        Err(LoadError::Missing) => {
                            skips.record(SkipReason::ImageMissing, &image.file_name);
                            return Ok(appended);
                        }
                        Err(LoadError::Undecodable(_)) => {
                            skips.record(SkipReason::ImageUndecodable, &image.file_name);
                            return Ok(appended);
                        }
                        Err(LoadError::Io(e)) => return Err(PipelineError::Io { path: source, source: e }),
                    }
                }
                let Some(img) = pixels.as_ref() else { return Ok(appended) };

                let cropped = img.crop_imm(crop.left, crop.top, crop.width(), crop.height());
                if cropped.width() == 0 || cropped.height() == 0 {
                    // annotated size larger than the actual pixels
                    skips.record(SkipReason::EmptyCrop, &format!("{} box {idx}", image.file_name));
                    continue;
                }
                store.save(&cropped, &out_path)?;
                self.stats.crops_written += 1;
                (cropped.width(), cropped.height())
            };

            let image_id = self.split_mut(split).push(width, height, file_name, category.id);
            debug!("assemble: {} box {idx} -> {split} image {image_id} ({width}x{height})", image.file_name);
            appended += 1;
        }
        Ok(appended)
    }

    /// Reserves a crop path for this run. A path some earlier image already
    /// owns gets a further `_<n>` suffix, so no two entries share a file.
    fn claim(&mut self, wanted: String) -> String {
        let mut name = wanted.clone();
        let mut n = 1;
        while self.claimed.contains(&name) {
            name = numbered_file_name(&wanted, n);
            n += 1;
        }
        if name != wanted {
            warn!("assemble: crop path {wanted} is already taken in this run, using {name}");
        }
        self.claimed.insert(name.clone());
        name
    }

    /// Dimensions of a crop left by an earlier run, if it still decodes.
    /// Unreadable leftovers are counted and cropped again.
    fn existing_crop(&mut self, path: &Path, store: &dyn ImageStore) -> Option<(u32, u32)> {
        if !store.exists(path) {
            return None;
        }
        match store.load(path) {
            Ok(img) => Some((img.width(), img.height())),
            Err(e) => {
                warn!("assemble: existing crop {} is unreadable ({e}), cropping again", path.display());
                self.stats.crops_replaced += 1;
                None
            }
        }
    }

    fn split_mut(&mut self, split: Split) -> &mut SplitDataset {
        match split {
            Split::Train => &mut self.train,
            Split::Test => &mut self.test,
        }
    }

    pub fn train(&self) -> &CocoDataset {
        self.train.dataset()
    }

    pub fn test(&self) -> &CocoDataset {
        self.test.dataset()
    }

    pub fn stats(&self) -> AssemblyStats {
        self.stats
    }

    pub fn into_datasets(self) -> (CocoDataset, CocoDataset) {
        (self.train.dataset, self.test.dataset)
    }
}

/// `deer/cam1/img.jpg` + 2 -> `deer/cam1/img_2.jpg`.
pub fn numbered_file_name(file_name: &str, index: usize) -> String {
    let stem_start = file_name.rfind('/').map_or(0, |i| i + 1);
    match file_name[stem_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = stem_start + dot;
            format!("{}_{index}{}", &file_name[..dot], &file_name[dot..])
        }
        _ => format!("{file_name}_{index}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::MemStore;
    use serde_json::Map;

    fn category() -> Category {
        Category { id: 4, name: "deer".into(), supercategory: "entity".into() }
    }

    fn input_image(file_name: &str, w: u32, h: u32) -> InputImage {
        InputImage {
            id: crate::coco::ImageId::Num(1),
            file_name: file_name.into(),
            width: w,
            height: h,
            extra: Map::new(),
        }
    }

    fn record(boxes: Vec<[f32; 4]>, scores: Vec<f32>) -> DetectionRecord {
        let count = boxes.len();
        DetectionRecord { classes: vec![1; count], boxes, scores, count }
    }

    fn assembler() -> DatasetAssembler {
        DatasetAssembler::new(&[category()], Path::new("images"), Path::new("out"), CropOptions::default())
    }

    #[test]
    fn numbered_names() {
        assert_eq!(numbered_file_name("deer/cam1/img.jpg", 0), "deer/cam1/img_0.jpg");
        assert_eq!(numbered_file_name("deer/a.b/img", 3), "deer/a.b/img_3");
        assert_eq!(numbered_file_name("deer/.hidden", 1), "deer/.hidden_1");
    }

    #[test]
    fn single_detection_keeps_plain_name() {
        let store = MemStore::default().with_image("images/cam1/a.jpg", 100, 100);
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.1, 0.1, 0.5, 0.5], [0.2, 0.2, 0.3, 0.3]], vec![0.9, 0.3]);

        let n = asm
            .assemble(&input_image("cam1/a.jpg", 100, 100), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_eq!(n, 1);
        let train = asm.train();
        assert_eq!(train.images[0].file_name, "deer/cam1/a.jpg");
        // [10,10,50,50] padded by 1.69 -> [0,0,63,63]
        assert_eq!((train.images[0].width, train.images[0].height), (63, 63));
        assert_eq!(train.annotations[0].category_id, 4);
        assert!(asm.test().images.is_empty());
        assert!(store.exists(Path::new("out/deer/cam1/a.jpg")));
    }

    #[test]
    fn multiple_detections_get_indexed_paths_and_sequential_ids() {
        let store = MemStore::default().with_image("images/b.jpg", 200, 100);
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(
            vec![[0.1, 0.1, 0.4, 0.3], [0.5, 0.5, 0.9, 0.9], [0.2, 0.2, 0.6, 0.6]],
            vec![0.8, 0.7, 0.6],
        );

        asm.assemble(&input_image("b.jpg", 200, 100), &category(), Split::Test, &rec, None, &store, &mut skips)
            .unwrap();
        let test = asm.test();
        let names: Vec<_> = test.images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, ["deer/b_0.jpg", "deer/b_1.jpg", "deer/b_2.jpg"]);
        let ids: Vec<_> = test.images.iter().map(|i| i.id).collect();
        assert_eq!(ids, [0, 1, 2]);
        for (img, ann) in test.images.iter().zip(&test.annotations) {
            assert_eq!(ann.image_id, img.id);
        }
    }

    #[test]
    fn counters_are_per_split() {
        let store = MemStore::default().with_image("images/a.jpg", 50, 50).with_image("images/b.jpg", 50, 50);
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.2, 0.2, 0.6, 0.6]], vec![0.9]);
        asm.assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        asm.assemble(&input_image("b.jpg", 50, 50), &category(), Split::Test, &rec, None, &store, &mut skips)
            .unwrap();
        asm.assemble(&input_image("c.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_eq!(asm.train().images.len(), 1);
        assert_eq!(asm.test().images[0].id, 0);
        assert_eq!(skips.count(SkipReason::ImageMissing), 1);
    }

    #[test]
    fn existing_crop_is_reused_with_its_own_dimensions() {
        let store = MemStore::default();
        store
            .saved
            .borrow_mut()
            .insert(PathBuf::from("out/deer/a.jpg"), DynamicImage::ImageRgb8(image::RgbImage::new(31, 29)));
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.2, 0.2, 0.6, 0.6]], vec![0.9]);

        // source image is gone; the existing crop is enough
        asm.assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_eq!((asm.train().images[0].width, asm.train().images[0].height), (31, 29));
        assert_eq!(asm.stats(), AssemblyStats { crops_written: 0, crops_reused: 1, crops_replaced: 0 });
    }

    #[test]
    fn overwrite_recomputes_existing_crop() {
        let store = MemStore::default().with_image("images/a.jpg", 50, 50);
        store
            .saved
            .borrow_mut()
            .insert(PathBuf::from("out/deer/a.jpg"), DynamicImage::ImageRgb8(image::RgbImage::new(31, 29)));
        let options = CropOptions { overwrite: true, ..CropOptions::default() };
        let mut asm = DatasetAssembler::new(&[category()], Path::new("images"), Path::new("out"), options);
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.2, 0.2, 0.6, 0.6]], vec![0.9]);

        asm.assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_ne!(asm.train().images[0].width, 31);
        assert_eq!(asm.stats().crops_written, 1);
    }

    #[test]
    fn collapsed_detection_skips_only_itself() {
        let store = MemStore::default().with_image("images/a.jpg", 50, 50);
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.3, 0.3, 0.3, 0.3], [0.2, 0.2, 0.6, 0.6]], vec![0.9, 0.9]);

        let n = asm
            .assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(skips.count(SkipReason::EmptyCrop), 1);
        // numbering follows the confident detections, so the survivor is _1
        assert_eq!(asm.train().images[0].file_name, "deer/a_1.jpg");
    }

    #[test]
    fn uses_provided_pixels() {
        let store = MemStore::default();
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.0, 0.0, 1.0, 1.0]], vec![0.9]);
        let pixels = DynamicImage::ImageRgb8(image::RgbImage::new(40, 20));

        asm.assemble(&input_image("a.jpg", 40, 20), &category(), Split::Train, &rec, Some(pixels), &store, &mut skips)
            .unwrap();
        assert_eq!((asm.train().images[0].width, asm.train().images[0].height), (40, 20));
    }

    #[test]
    fn unreadable_existing_crop_is_cropped_again() {
        let mut store = MemStore::default().with_image("images/a.jpg", 50, 50);
        store.broken.insert(PathBuf::from("out/deer/a.jpg"));
        store
            .saved
            .borrow_mut()
            .insert(PathBuf::from("out/deer/a.jpg"), DynamicImage::ImageRgb8(image::RgbImage::new(31, 29)));
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let rec = record(vec![[0.2, 0.2, 0.6, 0.6]], vec![0.9]);

        let n = asm
            .assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &rec, None, &store, &mut skips)
            .unwrap();
        assert_eq!(n, 1);
        assert_ne!(asm.train().images[0].width, 31);
        assert_eq!(asm.stats(), AssemblyStats { crops_written: 1, crops_reused: 0, crops_replaced: 1 });
    }

    #[test]
    fn numbered_crop_path_is_not_shared_with_a_later_image() {
        let store = MemStore::default().with_image("images/a.jpg", 50, 50).with_image("images/a_0.jpg", 50, 50);
        let mut asm = assembler();
        let mut skips = SkipLog::default();
        let two = record(vec![[0.1, 0.1, 0.4, 0.4], [0.5, 0.5, 0.9, 0.9]], vec![0.9, 0.8]);
        let one = record(vec![[0.2, 0.2, 0.6, 0.6]], vec![0.9]);

        asm.assemble(&input_image("a.jpg", 50, 50), &category(), Split::Train, &two, None, &store, &mut skips)
            .unwrap();
        asm.assemble(&input_image("a_0.jpg", 50, 50), &category(), Split::Train, &one, None, &store, &mut skips)
            .unwrap();

        let names: Vec<_> = asm.train().images.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, ["deer/a_0.jpg", "deer/a_1.jpg", "deer/a_0_1.jpg"]);
        assert_eq!(asm.stats(), AssemblyStats { crops_written: 3, crops_reused: 0, crops_replaced: 0 });
        assert!(store.exists(Path::new("out/deer/a_0_1.jpg")));
    }
}
