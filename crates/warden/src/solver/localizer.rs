//! Target localization: detector inference, confidence filtering, and NMS.

use anyhow::Result;
use beian_common::constants::solver::{CONFIDENCE_THRESHOLD, IOU_THRESHOLD};
use beian_common::{ChallengeGeometry, DetectionBox};
use image::RgbImage;
use image::imageops::{self, FilterType};
use imageproc::rect::Rect;
use std::sync::Arc;

use super::model::{Detector, ImageTensor};

/// Outcome of localizing one challenge image
#[derive(Debug, Clone, PartialEq)]
pub enum Localization {
    /// Exactly `geometry.targets` boxes, in suppression order
    Found(Vec<DetectionBox>),
    /// Fewer boxes survived suppression than the challenge needs
    Insufficient { found: usize, expected: usize },
}

/// Runs the detection model over a challenge background
pub struct Localizer {
    detector: Arc<dyn Detector>,
    geometry: ChallengeGeometry,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl Localizer {
    pub fn new(detector: Arc<dyn Detector>, geometry: ChallengeGeometry) -> Self {
        Self {
            detector,
            geometry,
            confidence_threshold: CONFIDENCE_THRESHOLD,
            iou_threshold: IOU_THRESHOLD,
        }
    }

    /// Localize candidate regions in source-pixel coordinates
    pub fn localize(&self, image: &RgbImage) -> Result<Localization> {
        let (width, height) = image.dimensions();
        let (input_width, input_height) = (self.geometry.input_width, self.geometry.input_height);

        // Direct scaling, not aspect-preserving
        let input = if (width, height) == (input_width, input_height) {
            ImageTensor::from_rgb(image)
        } else {
            let resized = imageops::resize(image, input_width, input_height, FilterType::Triangle);
            ImageTensor::from_rgb(&resized)
        };

        let rows = self.detector.detect(&input)?;
        let x_factor = width as f32 / input_width as f32;
        let y_factor = height as f32 / input_height as f32;
        let boxes = decode_rows(&rows, x_factor, y_factor, self.confidence_threshold);
        let keep = non_max_suppression(&boxes, self.iou_threshold);

        tracing::debug!(
            candidates = rows.len(),
            confident = boxes.len(),
            kept = keep.len(),
            expected = self.geometry.targets,
            "Localized challenge image"
        );

        if keep.len() < self.geometry.targets {
            return Ok(Localization::Insufficient {
                found: keep.len(),
                expected: self.geometry.targets,
            });
        }

        Ok(Localization::Found(
            keep.into_iter()
                .take(self.geometry.targets)
                .map(|i| boxes[i])
                .collect(),
        ))
    }
}

/// Convert center-form rows into source-pixel boxes, keeping confident rows
pub fn decode_rows(
    rows: &[Vec<f32>],
    x_factor: f32,
    y_factor: f32,
    threshold: f32,
) -> Vec<DetectionBox> {
    rows.iter()
        .filter(|row| row.len() > 4)
        .filter_map(|row| {
            let score = row[4..].iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if score < threshold {
                return None;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            Some(DetectionBox {
                x: ((cx - w / 2.0) * x_factor) as i32,
                y: ((cy - h / 2.0) * y_factor) as i32,
                width: (w * x_factor) as i32,
                height: (h * y_factor) as i32,
                score,
            })
        })
        .collect()
}

/// Greedy NMS. Returns indices into `boxes`, highest score first; a box is
/// dropped when its IoU with an already kept box exceeds `iou_threshold`.
pub fn non_max_suppression(boxes: &[DetectionBox], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len()).collect();
    // Stable: equal scores keep their row order
    order.sort_by(|&a, &b| boxes[b].score.total_cmp(&boxes[a].score));

    let mut keep: Vec<usize> = Vec::with_capacity(order.len());
    for candidate in order {
        if keep
            .iter()
            .all(|&kept| iou(&boxes[kept], &boxes[candidate]) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes; zero for degenerate boxes
pub fn iou(a: &DetectionBox, b: &DetectionBox) -> f32 {
    let (Some(ra), Some(rb)) = (to_rect(a), to_rect(b)) else {
        return 0.0;
    };
    let intersection = ra
        .intersect(rb)
        .map(|r| i64::from(r.width()) * i64::from(r.height()))
        .unwrap_or(0);
    let union = a.area() + b.area() - intersection;
    if union <= 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

fn to_rect(b: &DetectionBox) -> Option<Rect> {
    if b.width <= 0 || b.height <= 0 {
        return None;
    }
    Some(Rect::at(b.x, b.y).of_size(b.width as u32, b.height as u32))
}
