//! Stochastic Heun sampler (Karras et al. 2022, Algorithm 2)
//!
//! Each step optionally raises the noise level from σ to `σ̂ = σ(1 + γ)` by
//! injecting fresh noise ("churn"), takes an Euler step from `σ̂` to `σ_next`,
//! and corrects it with the trapezoidal rule unless `σ_next = 0`.

use burn::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::DiffusionConfig;
use crate::diffusion::{broadcast_cond, ElucidatedDiffusion};
use crate::error::{DiffusionError, Result};
use crate::network::Denoiser;
use crate::noise::standard_normal;
use crate::normalizer::Normalizer;
use crate::schedule::NoiseSchedule;

fn default_clamp() -> bool {
    true
}

/// Per-call sampling options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleOptions {
    /// Overrides the configured number of steps
    #[serde(default)]
    pub num_sample_steps: Option<usize>,
    /// Clamp denoised predictions and the final sample to `[-1, 1]`
    #[serde(default = "default_clamp")]
    pub clamp: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            num_sample_steps: None,
            clamp: default_clamp(),
        }
    }
}

impl SampleOptions {
    pub fn with_num_sample_steps(mut self, steps: usize) -> Self {
        self.num_sample_steps = Some(steps);
        self
    }

    pub fn with_clamp(mut self, clamp: bool) -> Self {
        self.clamp = clamp;
        self
    }
}

/// Heun sampler with churn over a fixed noise schedule
#[derive(Debug, Clone)]
pub struct HeunSampler {
    schedule: NoiseSchedule,
    gammas: Vec<f64>,
    s_noise: f64,
}

impl HeunSampler {
    /// Builds the schedule and churn factors for `num_steps` steps
    pub fn new(config: &DiffusionConfig, num_steps: usize) -> Self {
        let schedule = NoiseSchedule::from_config(config, num_steps);
        let gammas = schedule.gammas(config.s_churn, config.s_tmin, config.s_tmax);
        Self {
            schedule,
            gammas,
            s_noise: config.s_noise,
        }
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_steps(&self) -> usize {
        self.schedule.num_steps()
    }

    /// Churn factor applied at step `index`
    pub fn gamma(&self, index: usize) -> f64 {
        self.gammas.get(index).copied().unwrap_or(0.0)
    }

    /// Initial state `σ_0 · ε`
    pub fn init_noise<B: Backend, const D: usize, R: Rng>(
        &self,
        shape: [usize; D],
        rng: &mut R,
        device: &B::Device,
    ) -> Tensor<B, D> {
        standard_normal::<B, D, R>(shape, rng, device) * self.schedule.init_sigma()
    }

    /// Advances `x` from level `index` to `index + 1`
    ///
    /// `score` returns `(x - D(x; σ)) / σ`. The churn noise is drawn on every
    /// step so the random stream does not depend on γ.
    pub fn step<B, const D: usize, R, F>(
        &self,
        x: Tensor<B, D>,
        index: usize,
        rng: &mut R,
        mut score: F,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        R: Rng,
        F: FnMut(Tensor<B, D>, f64) -> Result<Tensor<B, D>>,
    {
        if index >= self.num_steps() {
            return Err(DiffusionError::invalid(format!(
                "step index {index} is past the last step ({})",
                self.num_steps()
            )));
        }
        let sigmas = self.schedule.sigmas();
        let (sigma, sigma_next) = (sigmas[index], sigmas[index + 1]);
        let gamma = self.gamma(index);

        let eps = standard_normal::<B, D, R>(x.dims(), rng, &x.device()) * self.s_noise;

        let sigma_hat = sigma + gamma * sigma;
        // rounding can push the radicand slightly negative when γ = 0
        let radicand = (sigma_hat * sigma_hat - sigma * sigma).max(0.0);
        let x_hat = x + eps * radicand.sqrt();

        let d = score(x_hat.clone(), sigma_hat)?;
        let dt = sigma_next - sigma_hat;
        let x_next = x_hat.clone() + d.clone() * dt;

        if sigma_next == 0.0 {
            return Ok(x_next);
        }

        let d_prime = score(x_next, sigma_next)?;
        Ok(x_hat + (d + d_prime) * (0.5 * dt))
    }
}

impl<M, N> ElucidatedDiffusion<M, N> {
    /// Draws `batch_size` samples in the raw data space
    ///
    /// Starts from `σ_max`-scaled Gaussian noise and walks the Karras schedule
    /// with the stochastic Heun sampler. With `options.clamp` the denoised
    /// predictions and the final normalized sample are clamped to `[-1, 1]`,
    /// which is only meaningful when the normalizer's range is `[-1, 1]`.
    pub fn sample<B, const D: usize, R>(
        &self,
        batch_size: usize,
        options: &SampleOptions,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D>,
        N: Normalizer<B, D>,
        R: Rng,
    {
        let x = self.sample_normalized(batch_size, options, cond, rng, device)?;
        self.unnormalize(x)
    }

    /// Like [`Self::sample`] but returns samples in the normalized space
    pub fn sample_normalized<B, const D: usize, R>(
        &self,
        batch_size: usize,
        options: &SampleOptions,
        cond: Option<Tensor<B, 2>>,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D>,
        R: Rng,
    {
        let config = self.config();
        let num_steps = options.num_sample_steps.unwrap_or(config.num_sample_steps);
        if num_steps == 0 {
            return Err(DiffusionError::invalid("num_sample_steps must be at least 1"));
        }
        let shape = config.batch_shape::<D>(batch_size)?;
        let cond = broadcast_cond(cond, batch_size)?;
        let sampler = HeunSampler::new(config, num_steps);

        tracing::info!(
            batch_size,
            num_steps,
            clamp = options.clamp,
            "sampling"
        );

        let mut x = sampler.init_noise::<B, D, R>(shape, rng, device);
        for (index, (sigma, sigma_next)) in sampler.schedule().pairs().enumerate() {
            let gamma = sampler.gamma(index);
            tracing::debug!(step = index, sigma, sigma_next, gamma, "sampler step");
            // the network is read-only here, so no graph is kept across steps
            x = sampler
                .step(x, index, rng, |x, sigma| {
                    self.denoised_over_sigma(x, sigma, cond.clone(), options.clamp)
                })?
                .detach();
        }

        Ok(if options.clamp { x.clamp(-1.0, 1.0) } else { x })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diffusion::tests::{IdentityNet, ZeroNet};
    use crate::noise::read_values;
    use crate::network::ResidualMlpConfig;
    use crate::normalizer::{IdentityNormalizer, MinMaxNormalizer};
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn config() -> DiffusionConfig {
        DiffusionConfig::new([4]).with_num_sample_steps(8)
    }

    #[test]
    fn test_sample_options_default_clamps() {
        let options = SampleOptions::default();
        assert!(options.clamp);
        assert_eq!(options.num_sample_steps, None);

        let parsed: SampleOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_gammas_respect_window() {
        let sampler = HeunSampler::new(&config(), 8);
        let sigmas = sampler.schedule().sigmas().to_vec();
        for (i, &sigma) in sigmas.iter().enumerate() {
            let gamma = sampler.gamma(i);
            if (0.05..=50.0).contains(&sigma) {
                assert!((gamma - (2f64.sqrt() - 1.0)).abs() < 1e-12);
            } else {
                assert_eq!(gamma, 0.0);
            }
        }
    }

    #[test]
    fn test_last_step_is_euler() {
        let device = Default::default();
        let config = DiffusionConfig::new([2]).with_num_sample_steps(1).without_churn();
        let sampler = HeunSampler::new(&config, 1);
        let mut calls = 0;
        let x = Tensor::<TestBackend, 2>::ones([1, 2], &device);
        let out = sampler
            .step(x, 0, &mut StdRng::seed_from_u64(0), |x, _| {
                calls += 1;
                Ok(x)
            })
            .unwrap();
        assert_eq!(calls, 1);
        // x + (0 - 80)·x
        let values = read_values(out).unwrap();
        assert!(values.iter().all(|&v| (v + 79.0).abs() < 1e-3));
    }

    #[test]
    fn test_step_past_end_is_an_error() {
        let device = Default::default();
        let sampler = HeunSampler::new(&config(), 8);
        let x = Tensor::<TestBackend, 2>::ones([1, 4], &device);
        let result = sampler.step(x, 8, &mut StdRng::seed_from_u64(0), |x, _| Ok(x));
        assert!(matches!(result, Err(DiffusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_heun_step_evaluates_twice() {
        let device = Default::default();
        let sampler = HeunSampler::new(&config().without_churn(), 8);
        let mut calls = 0;
        let x = Tensor::<TestBackend, 2>::ones([1, 4], &device);
        sampler
            .step(x, 0, &mut StdRng::seed_from_u64(0), |x, _| {
                calls += 1;
                Ok(x.zeros_like())
            })
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_same_seed_same_samples() {
        let device = Default::default();
        let diffusion = ElucidatedDiffusion::new(config(), ZeroNet, IdentityNormalizer).unwrap();
        let options = SampleOptions::default();

        let a: Tensor<TestBackend, 2> = diffusion
            .sample(3, &options, None, &mut StdRng::seed_from_u64(11), &device)
            .unwrap();
        let b: Tensor<TestBackend, 2> = diffusion
            .sample(3, &options, None, &mut StdRng::seed_from_u64(11), &device)
            .unwrap();
        assert_eq!(read_values(a).unwrap(), read_values(b).unwrap());
    }

    #[test]
    fn test_identity_network_lands_in_unit_box() {
        let device = Default::default();
        let diffusion =
            ElucidatedDiffusion::new(config(), IdentityNet, IdentityNormalizer).unwrap();
        let x: Tensor<TestBackend, 2> = diffusion
            .sample(1, &SampleOptions::default(), None, &mut StdRng::seed_from_u64(5), &device)
            .unwrap();
        assert_eq!(x.dims(), [1, 4]);
        let values = read_values(x).unwrap();
        assert!(values.iter().all(|v| v.is_finite() && (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_samples_are_unnormalized() {
        let device = Default::default();
        let normalizer =
            MinMaxNormalizer::<TestBackend>::from_bounds(vec![10.0; 4], vec![20.0; 4], &device)
                .unwrap();
        let diffusion = ElucidatedDiffusion::new(config(), ZeroNet, normalizer).unwrap();
        let x: Tensor<TestBackend, 2> = diffusion
            .sample(8, &SampleOptions::default(), None, &mut StdRng::seed_from_u64(2), &device)
            .unwrap();
        let values = read_values(x).unwrap();
        assert!(values.iter().all(|v| (10.0..=20.0).contains(v)));
    }

    #[test]
    fn test_unclamped_zero_net_shrinks_noise() {
        // for N(0, σ_data²) data the zero network is the exact denoiser
        let device = Default::default();
        let diffusion = ElucidatedDiffusion::new(
            DiffusionConfig::new([4]).with_num_sample_steps(32),
            ZeroNet,
            IdentityNormalizer,
        )
        .unwrap();
        let options = SampleOptions::default().with_clamp(false);
        let x: Tensor<TestBackend, 2> = diffusion
            .sample(256, &options, None, &mut StdRng::seed_from_u64(9), &device)
            .unwrap();
        let values = read_values(x).unwrap();
        let var = values.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / values.len() as f64;
        assert!((var - 1.0).abs() < 0.25, "variance {var}");
    }

    #[test]
    fn test_rejects_zero_steps() {
        let device = Default::default();
        let diffusion = ElucidatedDiffusion::new(config(), ZeroNet, IdentityNormalizer).unwrap();
        let options = SampleOptions::default().with_num_sample_steps(0);
        let result: Result<Tensor<TestBackend, 2>> =
            diffusion.sample(1, &options, None, &mut StdRng::seed_from_u64(0), &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_batch() {
        let device = Default::default();
        let diffusion = ElucidatedDiffusion::new(config(), ZeroNet, IdentityNormalizer).unwrap();
        let result: Result<Tensor<TestBackend, 2>> = diffusion.sample(
            0,
            &SampleOptions::default(),
            None,
            &mut StdRng::seed_from_u64(0),
            &device,
        );
        assert!(matches!(result, Err(DiffusionError::InvalidConfig(_))));
    }

    #[test]
    fn test_samples_carry_no_autodiff_graph() {
        let device = Default::default();
        let network = ResidualMlpConfig::new(4)
            .with_width(8)
            .with_num_layers(1)
            .with_dim_t(8)
            .init::<Autodiff<TestBackend>>(&device);
        let diffusion = ElucidatedDiffusion::new(config(), network, IdentityNormalizer).unwrap();
        let x: Tensor<Autodiff<TestBackend>, 2> = diffusion
            .sample(2, &SampleOptions::default(), None, &mut StdRng::seed_from_u64(4), &device)
            .unwrap();
        assert_eq!(x.dims(), [2, 4]);
        assert!(!x.is_require_grad());
    }
}
