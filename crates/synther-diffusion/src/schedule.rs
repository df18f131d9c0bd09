//! Noise schedules for EDM sampling
//!
//! Sampling walks a decreasing sequence of noise levels built with the
//! Karras et al. power-law ramp and terminated by an explicit `σ = 0`.

use crate::config::DiffusionConfig;

/// Karras noise schedule with `num_steps + 1` entries
///
/// ```text
/// σ_i = (σ_max^(1/ρ) + i/(N-1)·(σ_min^(1/ρ) - σ_max^(1/ρ)))^ρ,  i = 0..N-1
/// σ_N = 0
/// ```
///
/// A single-step schedule is `[σ_max, 0]`.
pub fn karras_sigmas(num_steps: usize, sigma_min: f64, sigma_max: f64, rho: f64) -> Vec<f64> {
    if num_steps == 0 {
        return vec![0.0];
    }
    if num_steps == 1 {
        return vec![sigma_max, 0.0];
    }

    let inv_rho = 1.0 / rho;
    let max_inv_rho = sigma_max.powf(inv_rho);
    let min_inv_rho = sigma_min.powf(inv_rho);
    let last = (num_steps - 1) as f64;

    let mut sigmas: Vec<f64> = (0..num_steps)
        .map(|i| {
            let ramp = i as f64 / last;
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho)
        })
        .collect();
    sigmas.push(0.0);
    sigmas
}

/// Churn factor γ for one noise level
///
/// Non-zero only inside `[s_tmin, s_tmax]`, where it equals
/// `min(s_churn / N, √2 - 1)`.
pub fn churn_gamma(sigma: f64, num_steps: usize, s_churn: f64, s_tmin: f64, s_tmax: f64) -> f64 {
    if sigma >= s_tmin && sigma <= s_tmax {
        (s_churn / num_steps.max(1) as f64).min(std::f64::consts::SQRT_2 - 1.0)
    } else {
        0.0
    }
}

/// An immutable, decreasing sequence of noise levels ending at zero
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    sigmas: Vec<f64>,
}

impl NoiseSchedule {
    /// Builds a Karras schedule
    pub fn karras(num_steps: usize, sigma_min: f64, sigma_max: f64, rho: f64) -> Self {
        Self {
            sigmas: karras_sigmas(num_steps, sigma_min, sigma_max, rho),
        }
    }

    /// Builds the schedule for `num_steps` steps from the model configuration
    pub fn from_config(config: &DiffusionConfig, num_steps: usize) -> Self {
        Self::karras(num_steps, config.sigma_min, config.sigma_max, config.rho)
    }

    /// Noise levels, `sigmas()[0] = σ_max` and the last entry is `0`
    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    /// Number of denoising steps (one less than the number of levels)
    pub fn num_steps(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    /// Initial noise level
    pub fn init_sigma(&self) -> f64 {
        self.sigmas.first().copied().unwrap_or(0.0)
    }

    /// Consecutive `(σ, σ_next)` pairs
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.sigmas.windows(2).map(|w| (w[0], w[1]))
    }

    /// γ for every level, computed with this schedule's step count
    pub fn gammas(&self, s_churn: f64, s_tmin: f64, s_tmax: f64) -> Vec<f64> {
        let n = self.num_steps();
        self.sigmas
            .iter()
            .map(|&s| churn_gamma(s, n, s_churn, s_tmin, s_tmax))
            .collect()
    }
}
