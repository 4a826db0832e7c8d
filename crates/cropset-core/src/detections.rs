use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Detector output as it comes off the model: float tensors, possibly padded
/// past `num_detections`.
#[derive(Debug, Clone, Default)]
pub struct RawDetections {
    /// normalized [top, left, bottom, right]
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<f32>,
    pub num_detections: f32,
}

/// Canonical per-image detector output, as stored in the detection cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub classes: Vec<u32>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// normalized [top, left, bottom, right]
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: u32,
}

impl DetectionRecord {
    pub fn empty() -> Self {
        Self { boxes: Vec::new(), scores: Vec::new(), classes: Vec::new(), count: 0 }
    }

    /// Validates raw detector output and keeps the first `num_detections`
    /// entries.
    pub fn from_raw(raw: RawDetections) -> Result<Self> {
        let RawDetections { mut boxes, mut scores, classes, num_detections } = raw;

        if !num_detections.is_finite() || num_detections < 0.0 || num_detections.fract() != 0.0 {
            return Err(PipelineError::InvalidDetections(format!(
                "num_detections must be a non-negative integer, got {num_detections}"
            )));
        }
        let count = num_detections as usize;
        let available = boxes.len().min(scores.len()).min(classes.len());
        if count > available {
            return Err(PipelineError::InvalidDetections(format!(
                "num_detections={count} but only {} boxes, {} scores, {} classes",
                boxes.len(),
                scores.len(),
                classes.len()
            )));
        }

        boxes.truncate(count);
        scores.truncate(count);
        let classes = classes[..count]
            .iter()
            .map(|&c| {
                if c.is_finite() && c >= 0.0 && c.fract() == 0.0 {
                    Ok(c as u32)
                } else {
                    Err(PipelineError::InvalidDetections(format!("class id {c} is not a non-negative integer")))
                }
            })
            .collect::<Result<Vec<u32>>>()?;

        let record = Self { boxes, scores, classes, count };
        record.validate()?;
        Ok(record)
    }

    /// Shape and value checks shared by fresh and cached records.
    pub fn validate(&self) -> Result<()> {
        if self.boxes.len() != self.count || self.scores.len() != self.count || self.classes.len() != self.count {
            return Err(PipelineError::InvalidDetections(format!(
                "count={} but {} boxes, {} scores, {} classes",
                self.count,
                self.boxes.len(),
                self.scores.len(),
                self.classes.len()
            )));
        }
        if let Some(b) = self.boxes.iter().find(|b| b.iter().any(|v| !v.is_finite())) {
            return Err(PipelineError::InvalidDetections(format!("non-finite box {b:?}")));
        }
        if let Some(s) = self.scores.iter().find(|s| !s.is_finite()) {
            return Err(PipelineError::InvalidDetections(format!("non-finite score {s}")));
        }
        Ok(())
    }

    pub fn detections(&self) -> impl Iterator<Item = Detection> + '_ {
        self.boxes
            .iter()
            .zip(&self.scores)
            .zip(&self.classes)
            .map(|((&bbox, &score), &class_id)| Detection { bbox, score, class_id })
    }

    /// Detections with `score > threshold`, in detector order.
    pub fn confident(&self, threshold: f32) -> Vec<Detection> {
        self.detections().filter(|d| d.score > threshold).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(n: f32) -> RawDetections {
        RawDetections {
            boxes: vec![[0.1, 0.1, 0.5, 0.5], [0.2, 0.2, 0.4, 0.4], [0.0, 0.0, 0.0, 0.0]],
            scores: vec![0.9, 0.5, 0.0],
            classes: vec![1.0, 1.0, 0.0],
            num_detections: n,
        }
    }

    #[test]
    fn truncates_padding_past_count() {
        let rec = DetectionRecord::from_raw(raw(2.0)).unwrap();
        assert_eq!(rec.count, 2);
        assert_eq!(rec.boxes.len(), 2);
        assert_eq!(rec.classes, vec![1, 1]);
    }

    #[test]
    fn rejects_count_past_tensors() {
        assert!(matches!(DetectionRecord::from_raw(raw(4.0)), Err(PipelineError::InvalidDetections(_))));
        assert!(DetectionRecord::from_raw(raw(1.5)).is_err());
        assert!(DetectionRecord::from_raw(raw(-1.0)).is_err());
    }

    #[test]
    fn rejects_fractional_class() {
        let mut r = raw(2.0);
        r.classes[1] = 1.25;
        assert!(DetectionRecord::from_raw(r).is_err());
    }

    #[test]
    fn threshold_is_strict() {
        let rec = DetectionRecord::from_raw(raw(3.0)).unwrap();
        let kept = rec.confident(0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);
    }

    #[test]
    fn validate_catches_shape_mismatch() {
        let mut rec = DetectionRecord::from_raw(raw(2.0)).unwrap();
        rec.scores.pop();
        assert!(rec.validate().is_err());
        assert!(DetectionRecord::empty().validate().is_ok());
    }
}
