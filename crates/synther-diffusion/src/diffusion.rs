//! The elucidated diffusion model
//!
//! [`ElucidatedDiffusion`] ties a noise-prediction network and a normalizer to
//! a validated [`DiffusionConfig`]. Sampling, training loss and likelihood are
//! implemented in their own modules on top of [`ElucidatedDiffusion::preconditioned_forward`].

use burn::prelude::*;

use crate::config::DiffusionConfig;
use crate::error::{DiffusionError, Result};
use crate::network::Denoiser;
use crate::normalizer::Normalizer;
use crate::precondition::{pad_to_rank, Preconditioning, SIGMA_EPS};

/// EDM diffusion model over events of a fixed shape
#[derive(Debug, Clone)]
pub struct ElucidatedDiffusion<M, N> {
    config: DiffusionConfig,
    precond: Preconditioning,
    network: M,
    normalizer: N,
}

impl<M, N> ElucidatedDiffusion<M, N> {
    /// Creates the model, validating the configuration
    pub fn new(config: DiffusionConfig, network: M, normalizer: N) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            precond: Preconditioning::new(config.sigma_data),
            config,
            network,
            normalizer,
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn preconditioning(&self) -> &Preconditioning {
        &self.precond
    }

    pub fn network(&self) -> &M {
        &self.network
    }

    /// Mutable access for an external optimizer
    pub fn network_mut(&mut self) -> &mut M {
        &mut self.network
    }

    pub fn normalizer(&self) -> &N {
        &self.normalizer
    }

    /// Mutable access, e.g. to refit the statistics on new data
    pub fn normalizer_mut(&mut self) -> &mut N {
        &mut self.normalizer
    }

    pub fn into_parts(self) -> (DiffusionConfig, M, N) {
        (self.config, self.network, self.normalizer)
    }

    /// Replaces the network, e.g. after an optimizer step
    pub fn with_network<M2>(self, network: M2) -> ElucidatedDiffusion<M2, N> {
        ElucidatedDiffusion {
            config: self.config,
            precond: self.precond,
            network,
            normalizer: self.normalizer,
        }
    }

    /// Checks that `x` is a batch of events of the configured shape
    pub fn check_input<B: Backend, const D: usize>(&self, x: &Tensor<B, D>) -> Result<()> {
        self.config.check_batch_dims(&x.dims())
    }
}

/// Broadcasts a `[1, cond_dim]` condition to `[batch, cond_dim]`
pub fn broadcast_cond<B: Backend>(
    cond: Option<Tensor<B, 2>>,
    batch: usize,
) -> Result<Option<Tensor<B, 2>>> {
    let Some(cond) = cond else {
        return Ok(None);
    };
    let [rows, cond_dim] = cond.dims();
    if rows == batch {
        Ok(Some(cond))
    } else if rows == 1 {
        Ok(Some(cond.repeat_dim(0, batch)))
    } else {
        Err(DiffusionError::ShapeMismatch {
            expected: vec![batch, cond_dim],
            actual: vec![rows, cond_dim],
        })
    }
}

impl<M, N> ElucidatedDiffusion<M, N> {
    /// Preconditioned denoiser
    ///
    /// ```text
    /// D(x; σ) = c_skip(σ)·x + c_out(σ)·F(c_in(σ)·x, c_noise(σ), cond)
    /// ```
    ///
    /// `sigma` holds one noise level per example. With `clamp` the prediction
    /// is clamped to `[-1, 1]`.
    pub fn preconditioned_forward<B, const D: usize>(
        &self,
        x: Tensor<B, D>,
        sigma: Tensor<B, 1>,
        cond: Option<Tensor<B, 2>>,
        clamp: bool,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D>,
    {
        self.check_input(&x)?;
        let batch = x.dims()[0];
        let [sigma_len] = sigma.dims();
        if sigma_len != batch {
            return Err(DiffusionError::ShapeMismatch {
                expected: vec![batch],
                actual: vec![sigma_len],
            });
        }
        let cond = broadcast_cond(cond, batch)?;

        let c_skip: Tensor<B, D> = pad_to_rank(self.precond.c_skip_tensor(sigma.clone()));
        let c_out: Tensor<B, D> = pad_to_rank(self.precond.c_out_tensor(sigma.clone()));
        let c_in: Tensor<B, D> = pad_to_rank(self.precond.c_in_tensor(sigma.clone()));
        let c_noise = self.precond.c_noise_tensor(sigma);

        let net_out = self.network.forward(x.clone() * c_in, c_noise, cond);
        let out = x * c_skip + net_out * c_out;

        Ok(if clamp { out.clamp(-1.0, 1.0) } else { out })
    }

    /// [`Self::preconditioned_forward`] with one noise level for the whole batch
    pub fn preconditioned_forward_at<B, const D: usize>(
        &self,
        x: Tensor<B, D>,
        sigma: f64,
        cond: Option<Tensor<B, 2>>,
        clamp: bool,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D>,
    {
        let sigma = Tensor::full([x.dims()[0]], sigma, &x.device());
        self.preconditioned_forward(x, sigma, cond, clamp)
    }

    /// Probability-flow direction `(x - D(x; σ)) / σ`
    ///
    /// σ is clamped to [`SIGMA_EPS`] before dividing.
    pub fn denoised_over_sigma<B, const D: usize>(
        &self,
        x: Tensor<B, D>,
        sigma: f64,
        cond: Option<Tensor<B, 2>>,
        clamp: bool,
    ) -> Result<Tensor<B, D>>
    where
        B: Backend,
        M: Denoiser<B, D>,
    {
        let denoised = self.preconditioned_forward_at(x.clone(), sigma, cond, clamp)?;
        Ok((x - denoised) / sigma.max(SIGMA_EPS))
    }

    /// Maps raw data into the model's normalized space
    pub fn normalize<B, const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        B: Backend,
        N: Normalizer<B, D>,
    {
        self.normalizer.normalize(x)
    }

    /// Maps normalized data back to the raw data space
    pub fn unnormalize<B, const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>>
    where
        B: Backend,
        N: Normalizer<B, D>,
    {
        self.normalizer.unnormalize(x)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalizer::IdentityNormalizer;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    /// `F(x, ·, ·) = x`
    #[derive(Debug, Clone, Copy)]
    pub struct IdentityNet;

    impl<B: Backend, const D: usize> Denoiser<B, D> for IdentityNet {
        fn forward(
            &self,
            x: Tensor<B, D>,
            _: Tensor<B, 1>,
            _: Option<Tensor<B, 2>>,
        ) -> Tensor<B, D> {
            x
        }
    }

    /// `F = 0`, so `D(x; σ) = c_skip(σ)·x`
    #[derive(Debug, Clone, Copy)]
    pub struct ZeroNet;

    impl<B: Backend, const D: usize> Denoiser<B, D> for ZeroNet {
        fn forward(
            &self,
            x: Tensor<B, D>,
            _: Tensor<B, 1>,
            _: Option<Tensor<B, 2>>,
        ) -> Tensor<B, D> {
            x.zeros_like()
        }
    }

    /// Adds the first condition column to every feature
    #[derive(Debug, Clone, Copy)]
    pub struct CondNet;

    impl<B: Backend> Denoiser<B, 2> for CondNet {
        fn forward(
            &self,
            x: Tensor<B, 2>,
            _: Tensor<B, 1>,
            cond: Option<Tensor<B, 2>>,
        ) -> Tensor<B, 2> {
            match cond {
                Some(cond) => x.zeros_like() + cond.narrow(1, 0, 1),
                None => x.zeros_like(),
            }
        }
    }

    fn model<M>(network: M) -> ElucidatedDiffusion<M, IdentityNormalizer> {
        ElucidatedDiffusion::new(DiffusionConfig::new([3]), network, IdentityNormalizer).unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let config = DiffusionConfig::new([3]).with_sigma_range(1.0, 0.5);
        assert!(ElucidatedDiffusion::new(config, ZeroNet, IdentityNormalizer).is_err());
    }

    #[test]
    fn test_zero_net_gives_skip_scaling() {
        let device = Default::default();
        let diffusion = model(ZeroNet);
        let x = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let sigma = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device);
        let out = diffusion.preconditioned_forward(x, sigma, None, false).unwrap();
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values[..3].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(values[3..].iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_identity_net_formula() {
        let device = Default::default();
        let diffusion = model(IdentityNet);
        let c = diffusion.preconditioning().coefficients(2.0);
        let x = Tensor::<TestBackend, 2>::full([1, 3], 0.7, &device);
        let out = diffusion.preconditioned_forward_at(x, 2.0, None, false).unwrap();
        let expected = (c.c_skip + c.c_out * c.c_in) * 0.7;
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&v| (v as f64 - expected).abs() < 1e-5));
    }

    #[test]
    fn test_clamp_bounds_prediction() {
        let device = Default::default();
        let diffusion = model(ZeroNet);
        let x = Tensor::<TestBackend, 2>::full([1, 3], 5.0, &device);
        let out = diffusion.preconditioned_forward_at(x, 0.01, None, true).unwrap();
        assert_eq!(out.max().into_scalar(), 1.0);
    }

    #[test]
    fn test_rejects_wrong_event_shape() {
        let device = Default::default();
        let diffusion = model(ZeroNet);
        let x = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        match diffusion.preconditioned_forward_at(x, 1.0, None, false) {
            Err(DiffusionError::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, vec![2, 3]);
                assert_eq!(actual, vec![2, 4]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_wrong_sigma_length() {
        let device = Default::default();
        let diffusion = model(ZeroNet);
        let x = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let sigma = Tensor::<TestBackend, 1>::ones([3], &device);
        assert!(diffusion.preconditioned_forward(x, sigma, None, false).is_err());
    }

    #[test]
    fn test_condition_is_broadcast() {
        let device = Default::default();
        let diffusion = model(CondNet);
        let x = Tensor::<TestBackend, 2>::zeros([4, 3], &device);
        let cond = Tensor::<TestBackend, 2>::from_floats([[2.0, 9.0]], &device);
        let out = diffusion
            .preconditioned_forward_at(x, 1.0, Some(cond), false)
            .unwrap();
        let c_out = diffusion.preconditioning().c_out(1.0);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert_eq!(values.len(), 12);
        assert!(values.iter().all(|&v| (v as f64 - 2.0 * c_out).abs() < 1e-5));
    }

    #[test]
    fn test_rejects_mismatched_condition_batch() {
        let device = Default::default();
        let cond = Tensor::<TestBackend, 2>::zeros([3, 1], &device);
        assert!(broadcast_cond(Some(cond), 4).is_err());
    }

    #[test]
    fn test_denoised_over_sigma_at_zero_is_finite() {
        let device = Default::default();
        let diffusion = model(IdentityNet);
        let x = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let d = diffusion.denoised_over_sigma(x, 0.0, None, false).unwrap();
        let values: Vec<f32> = d.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
