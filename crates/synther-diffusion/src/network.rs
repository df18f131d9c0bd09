//! Noise-prediction network contract and a residual MLP implementation
//!
//! The diffusion core only needs something that maps
//! `(c_in·x, c_noise(σ), cond)` to a tensor shaped like `x`. Any type can take
//! part by implementing [`Denoiser`]; [`ResidualMlpDenoiser`] is the network
//! used for flat transition vectors.

use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// Noise-prediction network
///
/// `x` has shape `[batch, *event_shape]`, `noise_level` is the per-example
/// `c_noise(σ)` with shape `[batch]`, and `cond` (when present) has shape
/// `[batch, cond_dim]`. The output must have the shape of `x`.
///
/// For likelihood evaluation the implementation must be differentiable with
/// respect to `x` on an autodiff backend.
pub trait Denoiser<B: Backend, const D: usize> {
    fn forward(
        &self,
        x: Tensor<B, D>,
        noise_level: Tensor<B, 1>,
        cond: Option<Tensor<B, 2>>,
    ) -> Tensor<B, D>;
}

impl<B: Backend, const D: usize, T: Denoiser<B, D> + ?Sized> Denoiser<B, D> for &T {
    fn forward(
        &self,
        x: Tensor<B, D>,
        noise_level: Tensor<B, 1>,
        cond: Option<Tensor<B, 2>>,
    ) -> Tensor<B, D> {
        (**self).forward(x, noise_level, cond)
    }
}

/// Sinusoidal embedding of per-example noise levels
///
/// Returns `[batch, dim]` with the sine half followed by the cosine half.
pub fn noise_level_embedding<B: Backend>(noise_level: Tensor<B, 1>, dim: usize) -> Tensor<B, 2> {
    let device = noise_level.device();
    let half_dim = (dim / 2).max(1);
    let max_period = 10000.0f64;

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| (-((i as f64) / half_dim as f64) * max_period.ln()).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), &device);

    let [batch] = noise_level.dims();
    let args = noise_level.reshape([batch, 1]) * freqs.reshape([1, half_dim]);

    Tensor::cat(vec![args.clone().sin(), args.cos()], 1)
}

/// Configuration for [`ResidualMlpDenoiser`]
#[derive(Debug, Clone)]
pub struct ResidualMlpConfig {
    /// Flattened event size
    pub d_in: usize,
    /// Width of the sinusoidal noise embedding
    pub dim_t: usize,
    /// Number of residual blocks
    pub num_layers: usize,
    /// Hidden width
    pub mlp_width: usize,
    /// Size of the conditioning vector, if the network is conditional
    pub cond_dim: Option<usize>,
}

impl ResidualMlpConfig {
    /// Creates the default configuration for `d_in` features
    pub fn new(d_in: usize) -> Self {
        Self {
            d_in,
            dim_t: 128,
            num_layers: 6,
            mlp_width: 1024,
            cond_dim: None,
        }
    }

    pub fn with_width(mut self, mlp_width: usize) -> Self {
        self.mlp_width = mlp_width;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_dim_t(mut self, dim_t: usize) -> Self {
        self.dim_t = dim_t;
        self
    }

    pub fn with_cond_dim(mut self, cond_dim: usize) -> Self {
        self.cond_dim = Some(cond_dim);
        self
    }

    /// Initializes the network with random weights
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualMlpDenoiser<B> {
        let width = self.mlp_width;
        let time_in = 2 * (self.dim_t / 2).max(1);

        ResidualMlpDenoiser {
            proj: LinearConfig::new(self.d_in, width).init(device),
            time_fc1: LinearConfig::new(time_in, width).init(device),
            time_fc2: LinearConfig::new(width, width).init(device),
            cond_proj: self
                .cond_dim
                .map(|cond_dim| LinearConfig::new(cond_dim, width).init(device)),
            blocks: (0..self.num_layers)
                .map(|_| ResidualBlock::new(width, device))
                .collect(),
            final_norm: LayerNormConfig::new(width).init(device),
            out: LinearConfig::new(width, self.d_in).init(device),
            dim_t: self.dim_t,
        }
    }
}

/// Pre-norm residual MLP block
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub norm: LayerNorm<B>,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(width: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(width).init(device),
            fc1: LinearConfig::new(width, width).init(device),
            fc2: LinearConfig::new(width, width).init(device),
        }
    }

    /// `x + fc2(silu(fc1(norm(x))))`
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let h = self.norm.forward(x.clone());
        let h = silu(self.fc1.forward(h));
        x + self.fc2.forward(h)
    }
}

/// Residual MLP over flat `[batch, d_in]` events
///
/// The noise embedding (plus the projected condition, if any) is added to the
/// projected input before the residual stack.
#[derive(Module, Debug)]
pub struct ResidualMlpDenoiser<B: Backend> {
    pub proj: Linear<B>,
    pub time_fc1: Linear<B>,
    pub time_fc2: Linear<B>,
    pub cond_proj: Option<Linear<B>>,
    pub blocks: Vec<ResidualBlock<B>>,
    pub final_norm: LayerNorm<B>,
    pub out: Linear<B>,
    #[module(skip)]
    pub dim_t: usize,
}

impl<B: Backend> ResidualMlpDenoiser<B> {
    fn embed(&self, noise_level: Tensor<B, 1>, cond: Option<Tensor<B, 2>>) -> Tensor<B, 2> {
        let t = noise_level_embedding(noise_level, self.dim_t);
        let t = self.time_fc2.forward(silu(self.time_fc1.forward(t)));
        match (&self.cond_proj, cond) {
            (Some(proj), Some(cond)) => t + proj.forward(cond),
            _ => t,
        }
    }
}

impl<B: Backend> Denoiser<B, 2> for ResidualMlpDenoiser<B> {
    fn forward(
        &self,
        x: Tensor<B, 2>,
        noise_level: Tensor<B, 1>,
        cond: Option<Tensor<B, 2>>,
    ) -> Tensor<B, 2> {
        let h = self.proj.forward(x) + self.embed(noise_level, cond);
        let h = self
            .blocks
            .iter()
            .fold(h, |h, block| block.forward(h));
        let h = silu(self.final_norm.forward(h));
        self.out.forward(h)
    }
}
