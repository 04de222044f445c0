#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use super::cpu::CpuEmbedder;
use crate::embed::backend::{EmbedError, Embedder};
use crate::{BoundingBox, Vector};

/// Tract-based embedder for ONNX face-embedding models.
///
/// The model takes one `1x3xNxN` RGB crop in `[0, 1]` and returns a single
/// embedding tensor, which is L2-normalised. Face regions come from the CPU
/// foreground detector. Only model loading touches the disk.
pub struct TractEmbedder {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_side: u32,
}

impl TractEmbedder {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_side: u32) -> Result<Self> {
        if input_side == 0 {
            return Err(anyhow!("model input size must be non-zero"));
        }
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_side as usize, input_side as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_side })
    }

    fn build_input(&self, crop: &RgbImage) -> Tensor {
        let side = self.input_side as usize;
        let resized =
            image::imageops::resize(crop, self.input_side, self.input_side, FilterType::Triangle);
        let pixels = resized.as_raw();
        let sample = |(_, channel, y, x): (usize, usize, usize, usize)| {
            let idx = (y * side + x) * 3 + channel;
            pixels[idx] as f32 / 255.0
        };
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), sample).into_tensor()
    }

    fn extract_embedding(&self, outputs: TVec<TValue>) -> Result<Vec<f32>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let mut embedding: Vec<f32> = values.iter().copied().collect();
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 && norm.is_finite() {
            embedding.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(embedding)
    }
}

impl Embedder for TractEmbedder {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>> {
        Ok(CpuEmbedder::foreground_box(image).into_iter().collect())
    }

    fn encode(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vector, EmbedError> {
        let (width, height) = image.dimensions();
        if !face.fits_within(width, height) {
            return Err(EmbedError::NoFaceDetected);
        }
        let crop =
            image::imageops::crop_imm(image, face.left, face.top, face.width(), face.height())
                .to_image();
        let input = self.build_input(&crop);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let embedding = self.extract_embedding(outputs)?;
        Ok(Vector::new(embedding)?)
    }

    /// One inference on a blank crop so the first real frame runs at full speed.
    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_side, self.input_side);
        let input = self.build_input(&blank);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX warm-up inference failed")?;
        self.extract_embedding(outputs)?;
        Ok(())
    }
}
