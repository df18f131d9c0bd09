//! EDM preconditioning coefficients
//!
//! The network never sees raw noised data. Its input is rescaled by `c_in`,
//! its noise-level input is `c_noise`, and its output is blended with the
//! noised input through `c_skip` and `c_out` (Karras et al. 2022, Table 1):
//!
//! ```text
//! denoised = c_skip(σ)·x + c_out(σ)·F(c_in(σ)·x, c_noise(σ))
//! ```

use burn::prelude::*;

/// Smallest sigma fed to a logarithm or used as a divisor
pub const SIGMA_EPS: f64 = 1e-20;

/// The four preconditioning coefficients at one noise level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub c_skip: f64,
    pub c_out: f64,
    pub c_in: f64,
    pub c_noise: f64,
}

/// Preconditioning for a data distribution with standard deviation `sigma_data`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preconditioning {
    pub sigma_data: f64,
}

impl Preconditioning {
    pub fn new(sigma_data: f64) -> Self {
        Self { sigma_data }
    }

    pub fn c_skip(&self, sigma: f64) -> f64 {
        let sd2 = self.sigma_data * self.sigma_data;
        sd2 / (sigma * sigma + sd2)
    }

    pub fn c_out(&self, sigma: f64) -> f64 {
        sigma * self.sigma_data / (self.sigma_data * self.sigma_data + sigma * sigma).sqrt()
    }

    pub fn c_in(&self, sigma: f64) -> f64 {
        1.0 / (sigma * sigma + self.sigma_data * self.sigma_data).sqrt()
    }

    /// `0.25·ln(σ)`, with σ clamped to [`SIGMA_EPS`]
    pub fn c_noise(&self, sigma: f64) -> f64 {
        sigma.max(SIGMA_EPS).ln() * 0.25
    }

    pub fn coefficients(&self, sigma: f64) -> Coefficients {
        Coefficients {
            c_skip: self.c_skip(sigma),
            c_out: self.c_out(sigma),
            c_in: self.c_in(sigma),
            c_noise: self.c_noise(sigma),
        }
    }

    /// Training loss weight `(σ² + σ_data²) / (σ·σ_data)²`
    pub fn loss_weight(&self, sigma: f64) -> f64 {
        let sigma = sigma.max(SIGMA_EPS);
        (sigma * sigma + self.sigma_data * self.sigma_data) / (sigma * self.sigma_data).powi(2)
    }

    /// Per-example `c_skip`
    pub fn c_skip_tensor<B: Backend>(&self, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
        let sd2 = self.sigma_data * self.sigma_data;
        (sigma.clone() * sigma + sd2).recip() * sd2
    }

    /// Per-example `c_out`
    pub fn c_out_tensor<B: Backend>(&self, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
        let sd2 = self.sigma_data * self.sigma_data;
        let norm = (sigma.clone() * sigma.clone() + sd2).sqrt();
        sigma * self.sigma_data / norm
    }

    /// Per-example `c_in`
    pub fn c_in_tensor<B: Backend>(&self, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
        let sd2 = self.sigma_data * self.sigma_data;
        (sigma.clone() * sigma + sd2).sqrt().recip()
    }

    /// Per-example `c_noise`
    pub fn c_noise_tensor<B: Backend>(&self, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
        sigma.clamp_min(SIGMA_EPS).log() * 0.25
    }

    /// Per-example training loss weight
    pub fn loss_weight_tensor<B: Backend>(&self, sigma: Tensor<B, 1>) -> Tensor<B, 1> {
        let sd2 = self.sigma_data * self.sigma_data;
        let sigma = sigma.clamp_min(SIGMA_EPS);
        let scaled = sigma.clone() * self.sigma_data;
        (sigma.clone() * sigma + sd2) / (scaled.clone() * scaled)
    }
}

/// Reshapes per-example values `[batch]` to `[batch, 1, ..., 1]` for broadcasting
pub fn pad_to_rank<B: Backend, const D: usize>(values: Tensor<B, 1>) -> Tensor<B, D> {
    let [batch] = values.dims();
    let mut dims = [1usize; D];
    dims[0] = batch;
    values.reshape(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_continuity_at_zero_noise() {
        let pre = Preconditioning::new(0.5);
        let mut previous_gap = f64::INFINITY;
        for sigma in [1.0, 1e-1, 1e-2, 1e-3, 1e-5] {
            let c = pre.coefficients(sigma);
            let total = c.c_skip + c.c_out * c.c_in * pre.sigma_data;
            let gap = (total - 1.0).abs();
            assert!(gap <= previous_gap, "gap grew at sigma={sigma}");
            previous_gap = gap;
        }
        assert!(previous_gap < 1e-4);
    }

    #[test]
    fn test_stable_over_orders_of_magnitude() {
        let pre = Preconditioning::new(1.0);
        for exp in -3..=2 {
            let sigma = 10f64.powi(exp);
            let c = pre.coefficients(sigma);
            for v in [c.c_skip, c.c_out, c.c_in, c.c_noise] {
                assert!(v.is_finite(), "non-finite coefficient at sigma={sigma}");
            }
            assert!(c.c_skip > 0.0 && c.c_skip <= 1.0);
            assert!(c.c_out > 0.0 && c.c_out < 1.0);
            // unit effective input variance: c_in²·(σ² + σ_data²) = 1
            let input_var = c.c_in * c.c_in * (sigma * sigma + 1.0);
            assert!((input_var - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_c_noise_clamps_zero() {
        let pre = Preconditioning::new(1.0);
        let c = pre.c_noise(0.0);
        assert!(c.is_finite());
        assert!((c - 0.25 * SIGMA_EPS.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_loss_weight_matches_formula() {
        let pre = Preconditioning::new(0.5);
        let sigma = 2.0;
        let expected = (4.0 + 0.25) / (1.0 * 1.0);
        assert!((pre.loss_weight(sigma) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_tensor_coefficients_match_scalar() {
        let device = Default::default();
        let pre = Preconditioning::new(0.5);
        let sigmas = [0.002f32, 0.3, 1.0, 80.0];
        let t = Tensor::<TestBackend, 1>::from_floats(sigmas, &device);

        let c_skip: Vec<f32> = pre.c_skip_tensor(t.clone()).into_data().to_vec().unwrap();
        let c_out: Vec<f32> = pre.c_out_tensor(t.clone()).into_data().to_vec().unwrap();
        let c_in: Vec<f32> = pre.c_in_tensor(t.clone()).into_data().to_vec().unwrap();
        let c_noise: Vec<f32> = pre.c_noise_tensor(t.clone()).into_data().to_vec().unwrap();
        let weight: Vec<f32> = pre.loss_weight_tensor(t).into_data().to_vec().unwrap();

        for (i, &s) in sigmas.iter().enumerate() {
            let c = pre.coefficients(s as f64);
            let rel = |a: f32, b: f64| ((a as f64 - b) / b.abs().max(1e-6)).abs();
            assert!(rel(c_skip[i], c.c_skip) < 1e-4);
            assert!(rel(c_out[i], c.c_out) < 1e-4);
            assert!(rel(c_in[i], c.c_in) < 1e-4);
            assert!(rel(c_noise[i], c.c_noise) < 1e-4);
            assert!(rel(weight[i], pre.loss_weight(s as f64)) < 1e-3);
        }
    }

    #[test]
    fn test_c_noise_tensor_zero_is_finite() {
        let device = Default::default();
        let pre = Preconditioning::new(1.0);
        let t = Tensor::<TestBackend, 1>::zeros([3], &device);
        let values: Vec<f32> = pre.c_noise_tensor(t).into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_pad_to_rank() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        let padded: Tensor<TestBackend, 3> = pad_to_rank(t);
        assert_eq!(padded.dims(), [2, 1, 1]);
    }
}
