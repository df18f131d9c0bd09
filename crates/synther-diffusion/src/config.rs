//! Diffusion model configuration
//!
//! Defaults follow Karras et al., "Elucidating the Design Space of
//! Diffusion-Based Generative Models" (Table 5), as tuned for transition data.

use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

fn default_num_sample_steps() -> usize {
    32
}
fn default_sigma_min() -> f64 {
    0.002
}
fn default_sigma_max() -> f64 {
    80.0
}
fn default_sigma_data() -> f64 {
    1.0
}
fn default_rho() -> f64 {
    7.0
}
fn default_p_mean() -> f64 {
    -1.2
}
fn default_p_std() -> f64 {
    1.2
}
fn default_s_churn() -> f64 {
    80.0
}
fn default_s_tmin() -> f64 {
    0.05
}
fn default_s_tmax() -> f64 {
    50.0
}
fn default_s_noise() -> f64 {
    1.003
}

/// Configuration of the elucidated diffusion model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Shape of one sample, excluding the batch dimension
    pub event_shape: Vec<usize>,
    /// Default number of sampling steps (N in the paper)
    #[serde(default = "default_num_sample_steps")]
    pub num_sample_steps: usize,
    /// Smallest noise level of the sampling schedule
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f64,
    /// Largest noise level of the sampling schedule
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f64,
    /// Standard deviation of the (normalized) data distribution
    #[serde(default = "default_sigma_data")]
    pub sigma_data: f64,
    /// Schedule curvature
    #[serde(default = "default_rho")]
    pub rho: f64,
    /// Mean of log(sigma) during training
    #[serde(default = "default_p_mean")]
    pub p_mean: f64,
    /// Standard deviation of log(sigma) during training
    #[serde(default = "default_p_std")]
    pub p_std: f64,
    /// Total churn budget; 0 disables stochastic sampling
    #[serde(default = "default_s_churn")]
    pub s_churn: f64,
    /// Lower sigma bound where churn applies
    #[serde(default = "default_s_tmin")]
    pub s_tmin: f64,
    /// Upper sigma bound where churn applies
    #[serde(default = "default_s_tmax")]
    pub s_tmax: f64,
    /// Scale of the churn noise
    #[serde(default = "default_s_noise")]
    pub s_noise: f64,
}

impl DiffusionConfig {
    /// Creates a config for the given event shape with default parameters
    pub fn new(event_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            event_shape: event_shape.into(),
            num_sample_steps: default_num_sample_steps(),
            sigma_min: default_sigma_min(),
            sigma_max: default_sigma_max(),
            sigma_data: default_sigma_data(),
            rho: default_rho(),
            p_mean: default_p_mean(),
            p_std: default_p_std(),
            s_churn: default_s_churn(),
            s_tmin: default_s_tmin(),
            s_tmax: default_s_tmax(),
            s_noise: default_s_noise(),
        }
    }

    pub fn with_num_sample_steps(mut self, steps: usize) -> Self {
        self.num_sample_steps = steps;
        self
    }

    pub fn with_sigma_range(mut self, sigma_min: f64, sigma_max: f64) -> Self {
        self.sigma_min = sigma_min;
        self.sigma_max = sigma_max;
        self
    }

    pub fn with_sigma_data(mut self, sigma_data: f64) -> Self {
        self.sigma_data = sigma_data;
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_training_noise(mut self, p_mean: f64, p_std: f64) -> Self {
        self.p_mean = p_mean;
        self.p_std = p_std;
        self
    }

    /// Sets the stochastic sampler parameters (churn, t_min, t_max, noise)
    pub fn with_churn(mut self, s_churn: f64, s_tmin: f64, s_tmax: f64, s_noise: f64) -> Self {
        self.s_churn = s_churn;
        self.s_tmin = s_tmin;
        self.s_tmax = s_tmax;
        self.s_noise = s_noise;
        self
    }

    /// Disables churn, making the sampler a deterministic Heun solver
    pub fn without_churn(mut self) -> Self {
        self.s_churn = 0.0;
        self
    }

    /// Number of scalar features in one sample
    pub fn event_numel(&self) -> usize {
        self.event_shape.iter().product()
    }

    /// Checks every parameter, returning the first violation found
    pub fn validate(&self) -> Result<()> {
        if self.event_shape.is_empty() || self.event_shape.contains(&0) {
            return Err(DiffusionError::invalid(format!(
                "event_shape must be non-empty with positive extents, got {:?}",
                self.event_shape
            )));
        }
        if self.num_sample_steps == 0 {
            return Err(DiffusionError::invalid("num_sample_steps must be at least 1"));
        }
        for (name, value) in [
            ("sigma_min", self.sigma_min),
            ("sigma_max", self.sigma_max),
            ("sigma_data", self.sigma_data),
            ("rho", self.rho),
            ("p_std", self.p_std),
            ("s_noise", self.s_noise),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DiffusionError::invalid(format!(
                    "{name} must be a positive finite number, got {value}"
                )));
            }
        }
        if self.sigma_min >= self.sigma_max {
            return Err(DiffusionError::invalid(format!(
                "sigma_min ({}) must be smaller than sigma_max ({})",
                self.sigma_min, self.sigma_max
            )));
        }
        if !self.p_mean.is_finite() {
            return Err(DiffusionError::invalid("p_mean must be finite"));
        }
        if !self.s_churn.is_finite() || self.s_churn < 0.0 {
            return Err(DiffusionError::invalid(format!(
                "s_churn must be non-negative, got {}",
                self.s_churn
            )));
        }
        if self.s_tmin.is_nan() || self.s_tmax.is_nan() || self.s_tmin > self.s_tmax {
            return Err(DiffusionError::invalid(format!(
                "s_tmin ({}) must not exceed s_tmax ({})",
                self.s_tmin, self.s_tmax
            )));
        }
        Ok(())
    }

    /// Checks that `dims` is a non-empty batch of events of the configured shape
    pub fn check_batch_dims(&self, dims: &[usize]) -> Result<()> {
        if dims.first() == Some(&0) {
            return Err(DiffusionError::invalid("batch must hold at least one example"));
        }
        let matches = dims.len() == self.event_shape.len() + 1 && dims[1..] == self.event_shape[..];
        if matches {
            Ok(())
        } else {
            let batch = dims.first().copied().unwrap_or(0);
            let mut expected = vec![batch];
            expected.extend_from_slice(&self.event_shape);
            Err(DiffusionError::ShapeMismatch {
                expected,
                actual: dims.to_vec(),
            })
        }
    }

    /// Full tensor shape `[batch, *event_shape]` for a rank-`D` tensor
    pub fn batch_shape<const D: usize>(&self, batch: usize) -> Result<[usize; D]> {
        if batch == 0 {
            return Err(DiffusionError::invalid("batch must hold at least one example"));
        }
        if D != self.event_shape.len() + 1 {
            return Err(DiffusionError::invalid(format!(
                "tensor rank {D} cannot hold a batch of events with shape {:?}",
                self.event_shape
            )));
        }
        let mut shape = [batch; D];
        shape[1..].copy_from_slice(&self.event_shape);
        Ok(shape)
    }
}
