//! Similarity matching of target glyphs against localized candidates.

use anyhow::{Result, bail};
use beian_common::constants::solver::{CROP_MARGIN, POINT_OFFSET, SIMILARITY_INPUT_SIDE};
use beian_common::{DetectionBox, MatchedPoint};
use image::RgbImage;
use image::imageops::{self, FilterType};
use std::sync::Arc;

use super::model::{ImageTensor, Similarity};

/// Picks, for every target glyph, the candidate box it most resembles
pub struct Matcher {
    similarity: Arc<dyn Similarity>,
}

impl Matcher {
    pub fn new(similarity: Arc<dyn Similarity>) -> Self {
        Self { similarity }
    }

    /// One point per target, in target order.
    ///
    /// A chosen box stays in the candidate pool, so two targets can land on
    /// the same box. Strictly greater similarity wins; on an exact tie the
    /// first box encountered is kept.
    pub fn match_targets(
        &self,
        image: &RgbImage,
        boxes: &[DetectionBox],
        targets: &[ImageTensor],
    ) -> Result<Vec<MatchedPoint>> {
        if boxes.is_empty() {
            bail!("no candidate boxes to match against");
        }

        let crops = boxes
            .iter()
            .map(|b| crop_candidate(image, b))
            .collect::<Result<Vec<_>>>()?;

        let mut points = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let mut best: Option<(f32, &DetectionBox)> = None;
            for (candidate, crop) in boxes.iter().zip(&crops) {
                let score = sigmoid(self.similarity.similarity(crop, target)?);
                if best.is_none_or(|(best_score, _)| score > best_score) {
                    best = Some((score, candidate));
                }
            }

            // boxes is non-empty, so best is set
            let Some((score, chosen)) = best else {
                bail!("no candidate selected for target {index}");
            };
            tracing::debug!(
                target = index,
                x = chosen.x,
                y = chosen.y,
                similarity = score,
                "Matched target glyph"
            );
            points.push(MatchedPoint {
                x: chosen.x + POINT_OFFSET,
                y: chosen.y + POINT_OFFSET,
            });
        }

        Ok(points)
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Crop a box plus margin, clamped to the image, and scale to model input
pub fn crop_candidate(image: &RgbImage, b: &DetectionBox) -> Result<ImageTensor> {
    let (width, height) = image.dimensions();
    let margin = CROP_MARGIN as i32;

    let x0 = b.x.clamp(0, width as i32);
    let y0 = b.y.clamp(0, height as i32);
    let x1 = (b.x + b.width + margin).clamp(0, width as i32);
    let y1 = (b.y + b.height + margin).clamp(0, height as i32);
    if x1 <= x0 || y1 <= y0 {
        bail!(
            "box ({}, {}, {}x{}) lies outside the {}x{} image",
            b.x,
            b.y,
            b.width,
            b.height,
            width,
            height
        );
    }

    let crop = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    let resized = imageops::resize(
        &crop,
        SIMILARITY_INPUT_SIDE,
        SIMILARITY_INPUT_SIDE,
        FilterType::Triangle,
    );
    Ok(ImageTensor::from_rgb(&resized))
}
