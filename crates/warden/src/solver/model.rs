//! Inference seam for the two perception models.
//!
//! The pipeline only sees the [`Detector`] and [`Similarity`] traits; the
//! ONNX backends below load the graphs with tract and serialise each plan
//! through a mutex so one loaded model can be shared by concurrent solves.

use anyhow::{Context, Result, anyhow};
use beian_common::ChallengeGeometry;
use beian_common::constants::solver::SIMILARITY_INPUT_SIDE;
use image::RgbImage;
use std::path::Path;
use std::sync::Mutex;
use tract_onnx::prelude::*;

/// A `1x3xHxW` float tensor with channels scaled to [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// HWC RGB bytes to planar CHW floats
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; plane * 3];

        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for channel in 0..3 {
                data[channel * plane + offset] = f32::from(pixel[channel]) / 255.0;
            }
        }

        Self { width, height, data }
    }

    fn to_tract(&self) -> Result<Tensor> {
        let array = tract_ndarray::Array4::from_shape_vec(
            (1, 3, self.height as usize, self.width as usize),
            self.data.clone(),
        )?;
        Ok(array.into())
    }
}

/// Target-localization model
pub trait Detector: Send + Sync {
    /// Raw candidate rows `[cx, cy, w, h, class scores...]` in input coordinates
    fn detect(&self, input: &ImageTensor) -> Result<Vec<Vec<f32>>>;
}

/// Similarity-matching model
pub trait Similarity: Send + Sync {
    /// Raw (pre-sigmoid) similarity of a candidate crop to a target glyph
    fn similarity(&self, candidate: &ImageTensor, target: &ImageTensor) -> Result<f32>;
}

type RunFn = Box<dyn FnMut(TVec<TValue>) -> TractResult<TVec<TValue>> + Send>;

/// A loaded, optimised tract plan
struct OnnxPlan {
    run: Mutex<RunFn>,
}

impl OnnxPlan {
    fn load(path: &Path, inputs: &[[usize; 4]]) -> Result<Self> {
        let mut model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("Failed to read model {}", path.display()))?;

        for (slot, shape) in inputs.iter().enumerate() {
            model = model.with_input_fact(slot, f32::fact(*shape).into())?;
        }

        let plan = model
            .into_optimized()
            .with_context(|| format!("Failed to optimise model {}", path.display()))?
            .into_runnable()?;

        let run: RunFn = Box::new(move |inputs: TVec<TValue>| plan.run(inputs));
        Ok(Self {
            run: Mutex::new(run),
        })
    }

    fn run(&self, inputs: TVec<TValue>) -> Result<TVec<TValue>> {
        let mut run = self
            .run
            .lock()
            .map_err(|_| anyhow!("inference lock poisoned"))?;
        (*run)(inputs)
    }
}

/// ONNX detection model, output `[1, 4 + classes, candidates]`
pub struct OnnxDetector {
    plan: OnnxPlan,
}

impl OnnxDetector {
    pub fn load(path: &Path, geometry: ChallengeGeometry) -> Result<Self> {
        let shape = [
            1,
            3,
            geometry.input_height as usize,
            geometry.input_width as usize,
        ];
        Ok(Self {
            plan: OnnxPlan::load(path, &[shape])?,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, input: &ImageTensor) -> Result<Vec<Vec<f32>>> {
        let outputs = self.plan.run(tvec!(input.to_tract()?.into()))?;
        let output = outputs.first().context("detector produced no output")?;
        let view = output
            .to_array_view::<f32>()?
            .into_dimensionality::<tract_ndarray::Ix3>()?;

        // Transpose [1, features, candidates] into one row per candidate
        let (_, features, candidates) = view.dim();
        Ok((0..candidates)
            .map(|i| (0..features).map(|k| view[[0, k, i]]).collect())
            .collect())
    }
}

/// ONNX siamese model taking (candidate, target)
pub struct OnnxSimilarity {
    plan: OnnxPlan,
}

impl OnnxSimilarity {
    pub fn load(path: &Path) -> Result<Self> {
        let side = SIMILARITY_INPUT_SIDE as usize;
        let shape = [1, 3, side, side];
        Ok(Self {
            plan: OnnxPlan::load(path, &[shape, shape])?,
        })
    }
}

impl Similarity for OnnxSimilarity {
    fn similarity(&self, candidate: &ImageTensor, target: &ImageTensor) -> Result<f32> {
        let outputs = self
            .plan
            .run(tvec!(candidate.to_tract()?.into(), target.to_tract()?.into()))?;
        let output = outputs.first().context("similarity model produced no output")?;
        output
            .to_array_view::<f32>()?
            .iter()
            .next()
            .copied()
            .context("similarity model produced an empty tensor")
    }
}
