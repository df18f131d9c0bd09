//! Batched generation of synthetic transitions

use burn::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::diffusion::ElucidatedDiffusion;
use crate::error::{DiffusionError, Result};
use crate::network::Denoiser;
use crate::normalizer::Normalizer;
use crate::sampler::SampleOptions;
use crate::transitions::{TransitionLayout, Transitions};

fn default_num_sample_steps() -> usize {
    128
}
fn default_sample_batch_size() -> usize {
    100_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_num_sample_steps")]
    pub num_sample_steps: usize,
    #[serde(default = "default_sample_batch_size")]
    pub sample_batch_size: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            num_sample_steps: default_num_sample_steps(),
            sample_batch_size: default_sample_batch_size(),
        }
    }
}

impl GeneratorConfig {
    pub fn with_num_sample_steps(mut self, steps: usize) -> Self {
        self.num_sample_steps = steps;
        self
    }

    pub fn with_sample_batch_size(mut self, batch_size: usize) -> Self {
        self.sample_batch_size = batch_size;
        self
    }
}

/// Draws transitions from a trained model in fixed-size batches
///
/// Samples are clamped to `[-1, 1]` only when the model's normalizer reports
/// [`Normalizer::unit_range`].
#[derive(Debug)]
pub struct TransitionGenerator<'a, M, N> {
    diffusion: &'a ElucidatedDiffusion<M, N>,
    config: GeneratorConfig,
    layout: TransitionLayout,
}

impl<'a, M, N> TransitionGenerator<'a, M, N> {
    pub fn new(
        diffusion: &'a ElucidatedDiffusion<M, N>,
        config: GeneratorConfig,
        layout: TransitionLayout,
    ) -> Result<Self> {
        if config.num_sample_steps == 0 || config.sample_batch_size == 0 {
            return Err(DiffusionError::invalid(
                "num_sample_steps and sample_batch_size must be positive",
            ));
        }
        layout.validate()?;
        let expected = vec![layout.event_dim()];
        if diffusion.config().event_shape != expected {
            return Err(DiffusionError::ShapeMismatch {
                expected,
                actual: diffusion.config().event_shape.clone(),
            });
        }
        Ok(Self {
            diffusion,
            config,
            layout,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn layout(&self) -> &TransitionLayout {
        &self.layout
    }

    /// Number of sampler batches needed for `num_samples` transitions
    pub fn num_batches(&self, num_samples: usize) -> Result<usize> {
        let batch = self.config.sample_batch_size;
        if num_samples == 0 || num_samples % batch != 0 {
            return Err(DiffusionError::invalid(format!(
                "num_samples ({num_samples}) must be a positive multiple of sample_batch_size ({batch})"
            )));
        }
        let per_batch = batch * self.layout.num_transition;
        if num_samples % per_batch != 0 {
            return Err(DiffusionError::invalid(format!(
                "num_samples ({num_samples}) must be a multiple of sample_batch_size × num_transition ({per_batch})"
            )));
        }
        Ok(num_samples / per_batch)
    }

    /// Generates `num_samples` transitions
    pub fn generate<B, R>(
        &self,
        num_samples: usize,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Transitions<B>>
    where
        B: Backend,
        M: Denoiser<B, 2>,
        N: Normalizer<B, 2>,
        R: Rng,
    {
        self.generate_with_progress(num_samples, cond, rng, device, |_, _| {})
    }

    /// Like [`Self::generate`], calling `on_batch(done, total)` after every batch
    pub fn generate_with_progress<B, R, F>(
        &self,
        num_samples: usize,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
        device: &B::Device,
        mut on_batch: F,
    ) -> Result<Transitions<B>>
    where
        B: Backend,
        M: Denoiser<B, 2>,
        N: Normalizer<B, 2>,
        R: Rng,
        F: FnMut(usize, usize),
    {
        let num_batches = self.num_batches(num_samples)?;
        let clamp = Normalizer::<B, 2>::unit_range(self.diffusion.normalizer());
        let options = SampleOptions::default()
            .with_num_sample_steps(self.config.num_sample_steps)
            .with_clamp(clamp);

        tracing::info!(
            num_samples,
            num_batches,
            batch_size = self.config.sample_batch_size,
            num_sample_steps = self.config.num_sample_steps,
            clamp,
            "generating transitions"
        );

        let mut parts = Vec::with_capacity(num_batches);
        for i in 0..num_batches {
            tracing::debug!(batch = i + 1, num_batches, "generating batch");
            let samples: Tensor<B, 2> = self.diffusion.sample(
                self.config.sample_batch_size,
                &options,
                cond.clone(),
                rng,
                device,
            )?;
            parts.push(self.layout.split(samples)?);
            on_batch(i + 1, num_batches);
        }
        Transitions::concat(parts)
    }
}
