//! Perceptual CAPTCHA solving.
//!
//! Pipeline: decode → localize candidates → match target glyphs → encrypt
//! the click points under the challenge's secret key.

mod cipher;
mod glyphs;
mod localizer;
mod matcher;
mod model;

pub use cipher::{CipherError, encrypt_points};
pub use glyphs::{GlyphRenderer, reference_glyphs};
pub use localizer::{Localization, Localizer};
pub use matcher::Matcher;
pub use model::{Detector, ImageTensor, OnnxDetector, OnnxSimilarity, Similarity};

use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD};
use beian_common::{ChallengeGeometry, MatchedPoint};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SolverConfig;

#[derive(Debug, Error)]
pub enum SolveError {
    #[error("failed to decode challenge image: {0}")]
    Decode(String),

    #[error("only {found} of {expected} target regions localized")]
    InsufficientBoxes { found: usize, expected: usize },

    #[error("challenge names its targets as text but no glyph font is loaded")]
    NoGlyphFont,

    #[error(transparent)]
    Model(#[from] anyhow::Error),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Where the target glyphs of a challenge come from
#[derive(Debug, Clone, Copy)]
pub enum Targets<'a> {
    /// Base64 reference image with the glyphs at fixed slots
    Reference(&'a str),
    /// Target words to render locally
    Words(&'a [String]),
}

/// Loaded perception models, constructed once and shared by handle
pub struct Perception {
    pub detector: Arc<dyn Detector>,
    pub similarity: Arc<dyn Similarity>,
    pub glyphs: Option<GlyphRenderer>,
    pub geometry: ChallengeGeometry,
}

impl Perception {
    pub fn load(config: &SolverConfig) -> anyhow::Result<Self> {
        let geometry = config.geometry.geometry();
        let detector = OnnxDetector::load(&config.detector_model, geometry)
            .context("Failed to load detector model")?;
        let similarity =
            OnnxSimilarity::load(&config.siamese_model).context("Failed to load siamese model")?;

        // Text-target challenges are optional; run without a font if absent
        let glyphs = match GlyphRenderer::load(&config.font_path) {
            Ok(renderer) => Some(renderer),
            Err(e) => {
                tracing::warn!(error = %e, "Glyph font unavailable, text targets disabled");
                None
            }
        };

        Ok(Self {
            detector: Arc::new(detector),
            similarity: Arc::new(similarity),
            glyphs,
            geometry,
        })
    }
}

/// Localizer + Matcher + PointCipher over one shared perception context
pub struct Solver {
    localizer: Localizer,
    matcher: Matcher,
    glyphs: Option<GlyphRenderer>,
}

impl Solver {
    pub fn new(perception: Perception) -> Self {
        Self {
            localizer: Localizer::new(perception.detector, perception.geometry),
            matcher: Matcher::new(perception.similarity),
            glyphs: perception.glyphs,
        }
    }

    /// Whether text targets can be rendered
    pub fn renders_text(&self) -> bool {
        self.glyphs.is_some()
    }

    /// Click points for one challenge, in target order
    pub fn solve_points(
        &self,
        background: &str,
        targets: Targets<'_>,
    ) -> Result<Vec<MatchedPoint>, SolveError> {
        let image = decode_image(background)?;

        let boxes = match self.localizer.localize(&image)? {
            Localization::Found(boxes) => boxes,
            Localization::Insufficient { found, expected } => {
                return Err(SolveError::InsufficientBoxes { found, expected });
            }
        };

        let glyphs = match targets {
            Targets::Reference(encoded) => reference_glyphs(&decode_image(encoded)?)?,
            Targets::Words(words) => self
                .glyphs
                .as_ref()
                .ok_or(SolveError::NoGlyphFont)?
                .render_targets(words),
        };

        Ok(self.matcher.match_targets(&image, &boxes, &glyphs)?)
    }

    /// Encrypted point payload ready for submission
    pub fn solve(
        &self,
        background: &str,
        targets: Targets<'_>,
        secret_key: &str,
    ) -> Result<String, SolveError> {
        let points = self.solve_points(background, targets)?;
        Ok(encrypt_points(&points, secret_key)?)
    }
}

/// Decode a base64 (optionally data-URL prefixed) image into RGB
pub fn decode_image(encoded: &str) -> Result<RgbImage, SolveError> {
    let payload = match encoded.split_once(";base64,") {
        Some((_, data)) => data,
        None => encoded,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SolveError::Decode(e.to_string()))?;
    let image = image::load_from_memory(&bytes).map_err(|e| SolveError::Decode(e.to_string()))?;
    Ok(image.to_rgb8())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    pub(crate) fn encode_png(image: &RgbImage) -> String {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        STANDARD.encode(bytes)
    }

    /// Emits one confident row per configured centre
    struct GridDetector {
        centres: Vec<(f32, f32)>,
    }

    impl Detector for GridDetector {
        fn detect(&self, _: &ImageTensor) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(self
                .centres
                .iter()
                .enumerate()
                .map(|(i, &(cx, cy))| vec![cx, cy, 20.0, 20.0, 0.9 - i as f32 * 0.01])
                .collect())
        }
    }

    /// Prefers candidates whose brightness matches the target's
    struct BrightnessSimilarity;

    impl Similarity for BrightnessSimilarity {
        fn similarity(&self, candidate: &ImageTensor, target: &ImageTensor) -> anyhow::Result<f32> {
            let mean = |t: &ImageTensor| t.data.iter().sum::<f32>() / t.data.len() as f32;
            Ok(-10.0 * (mean(candidate) - mean(target)).abs())
        }
    }

    pub(crate) fn solver(centres: Vec<(f32, f32)>, targets: usize) -> Solver {
        Solver::new(Perception {
            detector: Arc::new(GridDetector { centres }),
            similarity: Arc::new(BrightnessSimilarity),
            glyphs: None,
            geometry: ChallengeGeometry {
                targets,
                ..ChallengeGeometry::ICP
            },
        })
    }

    /// Background with four patches of distinct brightness and a matching
    /// reference strip listing them in the order 3, 0, 2, 1
    pub(crate) fn challenge_images() -> (String, String) {
        let levels = [40u8, 100, 160, 220];
        let mut background = RgbImage::new(512, 192);
        for (i, level) in levels.iter().enumerate() {
            let x0 = 40 + i as u32 * 120;
            for x in x0..x0 + 22 {
                for y in 60..82 {
                    background.put_pixel(x, y, Rgb([*level; 3]));
                }
            }
        }

        let mut reference = RgbImage::new(300, 40);
        for (slot, level_index) in [3usize, 0, 2, 1].iter().enumerate() {
            let x0 = beian_common::constants::solver::GLYPH_CROP_XS[slot];
            for x in x0..x0 + 26 {
                for y in 11..39 {
                    reference.put_pixel(x, y, Rgb([levels[*level_index]; 3]));
                }
            }
        }

        (encode_png(&background), encode_png(&reference))
    }

    pub(crate) fn patch_centres() -> Vec<(f32, f32)> {
        (0..4).map(|i| (50.0 + i as f32 * 120.0, 70.0)).collect()
    }

    #[test]
    fn test_solve_points_end_to_end() {
        let (background, reference) = challenge_images();
        let solver = solver(patch_centres(), 4);

        let points = solver
            .solve_points(&background, Targets::Reference(&reference))
            .unwrap();

        // Box top-left is (centre - 10), plus the fixed +20 offset
        let expected: Vec<MatchedPoint> = [3, 0, 2, 1]
            .iter()
            .map(|&i| MatchedPoint { x: 60 + i * 120, y: 80 })
            .collect();
        assert_eq!(points, expected);
    }

    #[test]
    fn test_solve_encrypts_points() {
        let (background, reference) = challenge_images();
        let solver = solver(patch_centres(), 4);

        let payload = solver
            .solve(&background, Targets::Reference(&reference), "0123456789abcdef")
            .unwrap();
        let points = solver
            .solve_points(&background, Targets::Reference(&reference))
            .unwrap();
        assert_eq!(payload, encrypt_points(&points, "0123456789abcdef").unwrap());
    }

    #[test]
    fn test_insufficient_localization_is_reported() {
        let (background, reference) = challenge_images();
        let solver = solver(patch_centres(), 5);

        let err = solver
            .solve_points(&background, Targets::Reference(&reference))
            .unwrap_err();
        assert!(matches!(
            err,
            SolveError::InsufficientBoxes { found: 4, expected: 5 }
        ));
    }

    #[test]
    fn test_text_targets_need_a_font() {
        let (background, _) = challenge_images();
        let solver = solver(patch_centres(), 4);
        let words = vec!["各".to_string()];

        let err = solver
            .solve_points(&background, Targets::Words(&words))
            .unwrap_err();
        assert!(matches!(err, SolveError::NoGlyphFont));
    }

    #[test]
    fn test_decode_accepts_data_url() {
        let image = RgbImage::from_pixel(3, 2, Rgb([1, 2, 3]));
        let encoded = encode_png(&image);

        let plain = decode_image(&encoded).unwrap();
        let prefixed = decode_image(&format!("data:image/png;base64,{encoded}")).unwrap();
        assert_eq!(plain, image);
        assert_eq!(prefixed, image);
        assert!(matches!(decode_image("%%%"), Err(SolveError::Decode(_))));
    }
}
