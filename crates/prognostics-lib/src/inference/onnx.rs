//! ONNX inference using tract
//!
//! The model takes a `[1, input_len]` f32 tensor and returns either `[value]`
//! or `[value, variance]`.

use super::{ModelOutput, Scorer};
use anyhow::{ensure, Context, Result};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::debug;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

pub struct OnnxScorer {
    model: TractModel,
    input_len: usize,
}

impl OnnxScorer {
    /// Load and optimize an ONNX model from bytes
    pub fn from_bytes(model_bytes: &[u8], input_len: usize) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, input_len]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(Self { model, input_len })
    }
}

impl Scorer for OnnxScorer {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn predict(&self, features: &[f64]) -> Result<ModelOutput> {
        ensure!(
            features.len() == self.input_len,
            "expected {} features, got {}",
            self.input_len,
            features.len()
        );
        let start = Instant::now();

        let data: Vec<f32> = features.iter().map(|&v| v as f32).collect();
        let input: Tensor = tract_ndarray::Array2::from_shape_vec((1, self.input_len), data)
            .context("Failed to shape input tensor")?
            .into();

        let result = self.model.run(tvec!(input.into()))?;
        let output = result.first().context("No output from model")?;
        let values: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();
        ensure!(!values.is_empty(), "Model produced an empty output");

        debug!(elapsed_us = start.elapsed().as_micros() as u64, "ONNX inference completed");

        Ok(ModelOutput {
            value: values[0] as f64,
            spread: values
                .get(1)
                .map(|variance| (*variance as f64).max(0.0).sqrt()),
        })
    }
}

impl std::fmt::Debug for OnnxScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxScorer")
            .field("input_len", &self.input_len)
            .finish()
    }
}
