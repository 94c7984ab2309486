use serde::Serialize;
use thiserror::Error;

pub use aggregate::{
    aggregate, AcceptedDetection, AggregateConfig, DedupOrder, DedupScope, DetectionResult, TotalValue,
};
pub use denomination::{Denomination, DENOMINATIONS};
pub use yolov8::{
    Config, DetectionError, Detector, InitializationError, PreprocessImagesError, ProcessOutputError, ResizeType, Thresholds,
    YOLOV8,
};

mod aggregate;
mod denomination;
mod yolov8;

/// Axis-aligned box in image pixel space.
///
/// `x1 < x2` and `y1 < y2` are expected but never checked; a box with
/// reversed corners has a non-positive area and simply never overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        BoundingBox { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn union(&self, other: &BoundingBox) -> f32 {
        self.area() + other.area() - self.intersection(other)
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection over union. Zero when the union is empty or negative.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let union = self.union(other);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection(other) / union
    }
}

/// One box as reported by the detector, before any filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDetection {
    /// Class index predicted by the model
    pub class: i32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Detector columns differ in length: {boxes} boxes, {classes} classes, {confidences} confidences")]
pub struct ColumnLengthMismatch {
    pub boxes: usize,
    pub classes: usize,
    pub confidences: usize,
}

impl RawDetection {
    /// Zips column-shaped detector output (`xyxy`, `cls`, `conf`) into detections.
    ///
    /// Class values arrive as floats from most exporters and are truncated.
    pub fn from_columns(
        boxes: &[[f32; 4]],
        classes: &[f32],
        confidences: &[f32],
    ) -> Result<Vec<RawDetection>, ColumnLengthMismatch> {
        if boxes.len() != classes.len() || boxes.len() != confidences.len() {
            return Err(ColumnLengthMismatch {
                boxes: boxes.len(),
                classes: classes.len(),
                confidences: confidences.len(),
            });
        }
        Ok(boxes
            .iter()
            .zip(classes.iter())
            .zip(confidences.iter())
            .map(|((&[x1, y1, x2, y2], &class), &confidence)| RawDetection {
                class: class as i32,
                confidence,
                bbox: BoundingBox::new(x1, y1, x2, y2),
            })
            .collect())
    }

    /// Human-readable line recorded in the debug trace.
    ///
    /// Coordinates are widened to f64 before printing, so `12.3456` shows up
    /// as `12.345600128173828`.
    pub fn trace_line(&self) -> String {
        format!(
            "Class: {}, Confidence: {:.2}, BBox: [{:?}, {:?}, {:?}, {:?}]",
            self.class,
            self.confidence,
            f64::from(self.bbox.x1),
            f64::from(self.bbox.y1),
            f64::from(self.bbox.x2),
            f64::from(self.bbox.y2)
        )
    }
}
