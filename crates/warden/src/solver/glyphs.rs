//! Target glyph preparation.
//!
//! Targets come either from fixed slots of the challenge's reference image or,
//! when the challenge names its targets as text, from glyphs rendered with a
//! local font.

use anyhow::{Context, Result, bail};
use beian_common::constants::solver::{
    GLYPH_CROP_HEIGHT, GLYPH_CROP_WIDTH, GLYPH_CROP_XS, GLYPH_CROP_Y, RENDERED_GLYPH_BACKGROUND,
    RENDERED_GLYPH_SIDE, SIMILARITY_INPUT_SIDE,
};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use rusttype::{Font, Scale, point};
use std::path::Path;

use super::model::ImageTensor;

/// Crop the target glyphs out of the reference image, in click order
pub fn reference_glyphs(reference: &RgbImage) -> Result<Vec<ImageTensor>> {
    let (width, height) = reference.dimensions();
    if GLYPH_CROP_Y + GLYPH_CROP_HEIGHT > height {
        bail!("reference image too short: {height}px");
    }

    GLYPH_CROP_XS
        .iter()
        .map(|&x| {
            if x + GLYPH_CROP_WIDTH > width {
                bail!("reference image too narrow for glyph at x={x}: {width}px");
            }
            let glyph =
                imageops::crop_imm(reference, x, GLYPH_CROP_Y, GLYPH_CROP_WIDTH, GLYPH_CROP_HEIGHT)
                    .to_image();
            Ok(to_model_input(&glyph))
        })
        .collect()
}

fn to_model_input(glyph: &RgbImage) -> ImageTensor {
    let resized = imageops::resize(
        glyph,
        SIMILARITY_INPUT_SIDE,
        SIMILARITY_INPUT_SIDE,
        FilterType::Triangle,
    );
    ImageTensor::from_rgb(&resized)
}

/// Renders text targets as white glyphs centred on a fixed background
pub struct GlyphRenderer {
    font: Font<'static>,
}

impl GlyphRenderer {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read font {}", path.display()))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let font = Font::try_from_vec(bytes).context("Font data is not a valid TrueType font")?;
        Ok(Self { font })
    }

    /// Render `text` onto a square canvas of the rendered-glyph size
    pub fn render(&self, text: &str) -> RgbImage {
        let side = RENDERED_GLYPH_SIDE;
        let mut canvas = RgbImage::from_pixel(side, side, Rgb(RENDERED_GLYPH_BACKGROUND));

        let scale = Scale::uniform(side as f32 * 0.8);
        let ascent = self.font.v_metrics(scale).ascent;
        let glyphs: Vec<_> = self.font.layout(text, scale, point(0.0, ascent)).collect();

        let Some((min_x, min_y, max_x, max_y)) = glyphs
            .iter()
            .filter_map(|g| g.pixel_bounding_box())
            .map(|bb| (bb.min.x, bb.min.y, bb.max.x, bb.max.y))
            .reduce(|a, b| (a.0.min(b.0), a.1.min(b.1), a.2.max(b.2), a.3.max(b.3)))
        else {
            return canvas;
        };

        let dx = (side as i32 - (max_x - min_x)) / 2 - min_x;
        let dy = (side as i32 - (max_y - min_y)) / 2 - min_y;

        for glyph in &glyphs {
            let Some(bb) = glyph.pixel_bounding_box() else {
                continue;
            };
            glyph.draw(|gx, gy, coverage| {
                let x = gx as i32 + bb.min.x + dx;
                let y = gy as i32 + bb.min.y + dy;
                if x < 0 || y < 0 || x >= side as i32 || y >= side as i32 {
                    return;
                }
                let pixel = canvas.get_pixel_mut(x as u32, y as u32);
                for channel in 0..3 {
                    let bg = f32::from(pixel[channel]);
                    pixel[channel] = (bg + (255.0 - bg) * coverage).round() as u8;
                }
            });
        }

        canvas
    }

    /// Render each target word and scale it to model input
    pub fn render_targets(&self, words: &[String]) -> Vec<ImageTensor> {
        words.iter().map(|w| to_model_input(&self.render(w))).collect()
    }
}
