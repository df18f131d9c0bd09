//! EDM training loss
//!
//! Noise levels are drawn log-normally, `ln σ ~ N(P_mean, P_std²)`, and each
//! example's reconstruction error is weighted by `λ(σ) = (σ² + σ_data²) / (σ·σ_data)²`
//! so every noise level contributes gradients of comparable magnitude.

use burn::prelude::*;
use rand::Rng;

use crate::diffusion::ElucidatedDiffusion;
use crate::error::Result;
use crate::network::Denoiser;
use crate::noise::{standard_normal, standard_normal_values};
use crate::normalizer::Normalizer;
use crate::precondition::pad_to_rank;

/// Batch mean of `weights · mean_over_event((denoised - target)²)`
pub fn weighted_reconstruction_loss<B: Backend, const D: usize>(
    denoised: Tensor<B, D>,
    target: Tensor<B, D>,
    weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let dims = denoised.dims();
    let width: usize = dims[1..].iter().product();
    let sq = (denoised - target).powf_scalar(2.0);
    let per_example = sq.reshape([dims[0], width]).mean_dim(1).squeeze_dim::<1>(1);
    (per_example * weights).mean()
}

impl<M, N> ElucidatedDiffusion<M, N> {
    /// One training noise level per example
    pub fn noise_distribution<B: Backend, R: Rng>(
        &self,
        batch_size: usize,
        rng: &mut R,
        device: &B::Device,
    ) -> Tensor<B, 1> {
        let config = self.config();
        let values: Vec<f32> = standard_normal_values(batch_size, rng)
            .into_iter()
            .map(|z| (config.p_mean + config.p_std * z as f64).exp() as f32)
            .collect();
        Tensor::from_data(TensorData::new(values, [batch_size]), device)
    }

    /// Denoising loss on an already normalized batch
    ///
    /// Returns a one-element tensor; gradients flow through the network call.
    pub fn denoising_loss<B, const D: usize, R>(
        &self,
        x: Tensor<B, D>,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>>
    where
        B: Backend,
        M: Denoiser<B, D>,
        R: Rng,
    {
        self.check_input(&x)?;
        let device = x.device();
        let dims = x.dims();

        let sigmas = self.noise_distribution::<B, R>(dims[0], rng, &device);
        let noise = standard_normal::<B, D, R>(dims, rng, &device);
        let noised = x.clone() + noise * pad_to_rank::<B, D>(sigmas.clone());

        let denoised = self.preconditioned_forward(noised, sigmas.clone(), cond, false)?;
        let weights = self.preconditioning().loss_weight_tensor(sigmas);
        Ok(weighted_reconstruction_loss(denoised, x, weights))
    }

    /// Training loss on raw data, normalizing it first
    pub fn forward_loss<B, const D: usize, R>(
        &self,
        x: Tensor<B, D>,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
    ) -> Result<Tensor<B, 1>>
    where
        B: Backend,
        M: Denoiser<B, D>,
        N: Normalizer<B, D>,
        R: Rng,
    {
        self.check_input(&x)?;
        let x = self.normalize(x)?;
        self.denoising_loss(x, cond, rng)
    }
}
