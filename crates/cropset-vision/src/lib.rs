//! Detector backends for the cropping pipeline.

#[cfg(feature = "detector-tflite")]
pub mod tflite;

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage};
use tracing::info;

use cropset_core::config::DetectorCfg;
use cropset_core::{Detector, RawDetections};

/// Backend for runs that must be served entirely from a detection cache.
/// Any image that reaches it is an error.
#[derive(Debug, Default)]
pub struct CacheOnlyDetector;

impl Detector for CacheOnlyDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<RawDetections> {
        anyhow::bail!(
            "no cached detections for a {}x{} image and detector.backend is cache-only",
            image.width(),
            image.height()
        )
    }
}

pub fn build_detector(cfg: &DetectorCfg) -> Result<Box<dyn Detector>> {
    match cfg.backend.as_str() {
        "cache-only" => {
            info!("detector: cache-only");
            Ok(Box::new(CacheOnlyDetector))
        }
        "tflite" => tflite_detector(cfg),
        other => anyhow::bail!("unknown detector.backend: {other}"),
    }
}

#[cfg(feature = "detector-tflite")]
fn tflite_detector(cfg: &DetectorCfg) -> Result<Box<dyn Detector>> {
    use anyhow::Context;
    let model = cfg.model_path.as_ref().context("detector.model_path missing")?;
    Ok(Box::new(tflite::TfliteDetector::new(model, cfg.num_threads)?))
}

#[cfg(not(feature = "detector-tflite"))]
fn tflite_detector(_cfg: &DetectorCfg) -> Result<Box<dyn Detector>> {
    anyhow::bail!("detector.backend = \"tflite\" but binary not built with --features detector-tflite")
}

/// Packs `img` as interleaved RGB bytes at the model's input size.
pub fn rgb_input(img: &DynamicImage, w: u32, h: u32) -> Vec<u8> {
    let rgb = img.to_rgb8();
    if rgb.dimensions() == (w, h) {
        return rgb.into_raw();
    }
    image::imageops::resize(&rgb, w, h, FilterType::Triangle).into_raw()
}

/// Assembles the four outputs of an SSD postprocess op (boxes, classes,
/// scores, count) into raw detections. `boxes` is flat, four floats per box.
pub fn ssd_outputs(boxes: &[f32], classes: &[f32], scores: &[f32], count: f32) -> Result<RawDetections> {
    anyhow::ensure!(boxes.len() % 4 == 0, "box tensor length {} is not a multiple of 4", boxes.len());
    let boxes: Vec<[f32; 4]> = boxes.chunks_exact(4).map(|b| [b[0], b[1], b[2], b[3]]).collect();
    anyhow::ensure!(
        boxes.len() == classes.len() && boxes.len() == scores.len(),
        "output tensors disagree: {} boxes, {} classes, {} scores",
        boxes.len(),
        classes.len(),
        scores.len()
    );
    Ok(RawDetections { boxes, scores: scores.to_vec(), classes: classes.to_vec(), num_detections: count })
}
