//! Data normalizers
//!
//! The diffusion model works in a normalized space. A [`Normalizer`] maps raw
//! samples into it and back. Fitted normalizers keep per-feature statistics
//! over the flattened event, so they apply to any event shape whose element
//! count matches the fitted feature count.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};
use crate::noise::read_values;

/// Maps raw data to and from the model's normalized space
pub trait Normalizer<B: Backend, const D: usize> {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>>;

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>>;

    /// Whether the normalized range of the fitted data is exactly `[-1, 1]`
    ///
    /// Samplers may only clamp to `[-1, 1]` when this is true.
    fn unit_range(&self) -> bool {
        false
    }
}

impl<B: Backend, const D: usize, T: Normalizer<B, D> + ?Sized> Normalizer<B, D> for &T {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        (**self).normalize(x)
    }

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        (**self).unnormalize(x)
    }

    fn unit_range(&self) -> bool {
        (**self).unit_range()
    }
}

/// Leaves data untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityNormalizer;

impl<B: Backend, const D: usize> Normalizer<B, D> for IdentityNormalizer {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        Ok(x)
    }

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        Ok(x)
    }
}

/// Serializable fitted statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizerStats {
    Identity,
    MinMax { min: Vec<f32>, max: Vec<f32> },
    Standard { mean: Vec<f32>, std: Vec<f32> },
}

/// `x' = (x - offset) / scale`, per flattened feature
#[derive(Debug, Clone)]
struct Affine<B: Backend> {
    offset: Tensor<B, 1>,
    scale: Tensor<B, 1>,
    num_features: usize,
}

impl<B: Backend> Affine<B> {
    fn new(offset: Vec<f32>, scale: Vec<f32>, device: &B::Device) -> Self {
        let num_features = offset.len();
        Self {
            offset: Tensor::from_data(TensorData::new(offset, [num_features]), device),
            scale: Tensor::from_data(TensorData::new(scale, [num_features]), device),
            num_features,
        }
    }

    fn flatten<const D: usize>(&self, x: Tensor<B, D>) -> Result<(Tensor<B, 2>, [usize; D])> {
        let dims = x.dims();
        let batch = dims[0];
        let numel: usize = dims[1..].iter().product();
        if numel != self.num_features {
            return Err(DiffusionError::ShapeMismatch {
                expected: vec![batch, self.num_features],
                actual: dims.to_vec(),
            });
        }
        Ok((x.reshape([batch, numel]), dims))
    }

    fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let (flat, dims) = self.flatten(x)?;
        let offset = self.offset.clone().unsqueeze_dim::<2>(0);
        let out = (flat - offset) / self.scale.clone().unsqueeze_dim::<2>(0);
        Ok(out.reshape(dims))
    }

    fn inverse<const D: usize>(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        let (flat, dims) = self.flatten(x)?;
        let offset = self.offset.clone().unsqueeze_dim::<2>(0);
        let out = flat * self.scale.clone().unsqueeze_dim::<2>(0) + offset;
        Ok(out.reshape(dims))
    }
}

/// Reads a `[n, features]` batch to the host as per-feature columns
fn columns<B: Backend>(data: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
    let [rows, features] = data.dims();
    if rows == 0 || features == 0 {
        return Err(DiffusionError::invalid(format!(
            "cannot fit a normalizer on an empty batch of shape [{rows}, {features}]"
        )));
    }
    let values = read_values(data)?;
    let mut cols = vec![Vec::with_capacity(rows); features];
    for row in values.chunks_exact(features) {
        for (col, &v) in cols.iter_mut().zip(row) {
            col.push(v);
        }
    }
    Ok(cols)
}

/// Maps each feature's fitted `[min, max]` onto `[-1, 1]`
#[derive(Debug, Clone)]
pub struct MinMaxNormalizer<B: Backend> {
    min: Vec<f32>,
    max: Vec<f32>,
    affine: Affine<B>,
}

impl<B: Backend> MinMaxNormalizer<B> {
    /// Fits per-feature bounds on a `[n, features]` batch
    pub fn fit(data: Tensor<B, 2>) -> Result<Self> {
        let device = data.device();
        let cols = columns(data)?;
        let min: Vec<f32> = cols
            .iter()
            .map(|c| c.iter().copied().fold(f32::INFINITY, f32::min))
            .collect();
        let max: Vec<f32> = cols
            .iter()
            .map(|c| c.iter().copied().fold(f32::NEG_INFINITY, f32::max))
            .collect();
        Self::from_bounds(min, max, &device)
    }

    /// Builds a normalizer from known bounds
    pub fn from_bounds(min: Vec<f32>, max: Vec<f32>, device: &B::Device) -> Result<Self> {
        if min.len() != max.len() || min.is_empty() {
            return Err(DiffusionError::invalid(format!(
                "min/max statistics must be non-empty and equally long, got {} and {}",
                min.len(),
                max.len()
            )));
        }
        let mut offset = Vec::with_capacity(min.len());
        let mut scale = Vec::with_capacity(min.len());
        let mut degenerate = 0usize;
        for (&lo, &hi) in min.iter().zip(&max) {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return Err(DiffusionError::invalid(format!(
                    "invalid feature bounds [{lo}, {hi}]"
                )));
            }
            let half_range = (hi - lo) / 2.0;
            offset.push(lo + half_range);
            if half_range > 0.0 {
                scale.push(half_range);
            } else {
                degenerate += 1;
                scale.push(1.0);
            }
        }
        if degenerate > 0 {
            tracing::warn!(
                degenerate,
                "min-max normalizer has zero-range features; using unit scale"
            );
        }

        Ok(Self {
            affine: Affine::new(offset, scale, device),
            min,
            max,
        })
    }

    /// Refits the bounds on new data
    pub fn refit(&mut self, data: Tensor<B, 2>) -> Result<()> {
        *self = Self::fit(data)?;
        Ok(())
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats::MinMax {
            min: self.min.clone(),
            max: self.max.clone(),
        }
    }
}

impl<B: Backend, const D: usize> Normalizer<B, D> for MinMaxNormalizer<B> {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.affine.forward(x)
    }

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.affine.inverse(x)
    }

    fn unit_range(&self) -> bool {
        true
    }
}

/// Standardizes each feature to zero mean and unit variance
#[derive(Debug, Clone)]
pub struct StandardNormalizer<B: Backend> {
    mean: Vec<f32>,
    std: Vec<f32>,
    affine: Affine<B>,
}

impl<B: Backend> StandardNormalizer<B> {
    /// Fits per-feature mean and (unbiased) standard deviation
    pub fn fit(data: Tensor<B, 2>) -> Result<Self> {
        let device = data.device();
        let cols = columns(data)?;
        let mut mean = Vec::with_capacity(cols.len());
        let mut std = Vec::with_capacity(cols.len());
        for col in &cols {
            let n = col.len() as f64;
            let mu = col.iter().map(|&v| v as f64).sum::<f64>() / n;
            let var = if col.len() > 1 {
                col.iter().map(|&v| (v as f64 - mu).powi(2)).sum::<f64>() / (n - 1.0)
            } else {
                0.0
            };
            mean.push(mu as f32);
            std.push(var.sqrt() as f32);
        }
        Self::from_moments(mean, std, &device)
    }

    pub fn from_moments(mean: Vec<f32>, std: Vec<f32>, device: &B::Device) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(DiffusionError::invalid(format!(
                "mean/std statistics must be non-empty and equally long, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if mean.iter().chain(&std).any(|v| !v.is_finite()) || std.iter().any(|&s| s < 0.0) {
            return Err(DiffusionError::invalid("mean/std statistics must be finite with std >= 0"));
        }
        let degenerate = std.iter().filter(|&&s| s == 0.0).count();
        if degenerate > 0 {
            tracing::warn!(
                degenerate,
                "standard normalizer has zero-variance features; using unit scale"
            );
        }
        let scale = std.iter().map(|&s| if s > 0.0 { s } else { 1.0 }).collect();

        Ok(Self {
            affine: Affine::new(mean.clone(), scale, device),
            mean,
            std,
        })
    }

    pub fn refit(&mut self, data: Tensor<B, 2>) -> Result<()> {
        *self = Self::fit(data)?;
        Ok(())
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats::Standard {
            mean: self.mean.clone(),
            std: self.std.clone(),
        }
    }
}

impl<B: Backend, const D: usize> Normalizer<B, D> for StandardNormalizer<B> {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.affine.forward(x)
    }

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        self.affine.inverse(x)
    }
}

/// Any of the fitted normalizers, chosen at runtime from [`NormalizerStats`]
#[derive(Debug, Clone)]
pub enum FittedNormalizer<B: Backend> {
    Identity(IdentityNormalizer),
    MinMax(MinMaxNormalizer<B>),
    Standard(StandardNormalizer<B>),
}

impl<B: Backend> FittedNormalizer<B> {
    pub fn from_stats(stats: NormalizerStats, device: &B::Device) -> Result<Self> {
        Ok(match stats {
            NormalizerStats::Identity => Self::Identity(IdentityNormalizer),
            NormalizerStats::MinMax { min, max } => {
                Self::MinMax(MinMaxNormalizer::from_bounds(min, max, device)?)
            }
            NormalizerStats::Standard { mean, std } => {
                Self::Standard(StandardNormalizer::from_moments(mean, std, device)?)
            }
        })
    }

    pub fn stats(&self) -> NormalizerStats {
        match self {
            Self::Identity(_) => NormalizerStats::Identity,
            Self::MinMax(n) => n.stats(),
            Self::Standard(n) => n.stats(),
        }
    }
}

impl<B: Backend, const D: usize> Normalizer<B, D> for FittedNormalizer<B> {
    fn normalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        match self {
            Self::Identity(n) => Normalizer::<B, D>::normalize(n, x),
            Self::MinMax(n) => n.normalize(x),
            Self::Standard(n) => n.normalize(x),
        }
    }

    fn unnormalize(&self, x: Tensor<B, D>) -> Result<Tensor<B, D>> {
        match self {
            Self::Identity(n) => Normalizer::<B, D>::unnormalize(n, x),
            Self::MinMax(n) => n.unnormalize(x),
            Self::Standard(n) => n.unnormalize(x),
        }
    }

    fn unit_range(&self) -> bool {
        matches!(self, Self::MinMax(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn data() -> Tensor<TestBackend, 2> {
        Tensor::from_floats(
            [[0.0, 10.0, 3.0], [2.0, -10.0, 3.0], [4.0, 0.0, 3.0]],
            &Default::default(),
        )
    }

    fn max_abs_diff(a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_min_max_maps_to_unit_range() {
        let norm = MinMaxNormalizer::fit(data()).unwrap();
        let x: Tensor<TestBackend, 2> = norm.normalize(data()).unwrap();
        let values = read_values(x).unwrap();
        // constant third feature is centered with unit scale
        assert_eq!(values, vec![-1.0, 1.0, 0.0, 0.0, -1.0, 0.0, 1.0, 0.0, 0.0]);
        assert!(Normalizer::<TestBackend, 2>::unit_range(&norm));
    }

    #[test]
    fn test_round_trips() {
        let min_max = MinMaxNormalizer::fit(data()).unwrap();
        let standard = StandardNormalizer::fit(data()).unwrap();

        let back = min_max.unnormalize(min_max.normalize(data()).unwrap()).unwrap();
        assert!(max_abs_diff(back, data()) < 1e-5);

        let back = standard.unnormalize(standard.normalize(data()).unwrap()).unwrap();
        assert!(max_abs_diff(back, data()) < 1e-5);
    }

    #[test]
    fn test_standard_statistics() {
        let norm = StandardNormalizer::fit(data()).unwrap();
        match norm.stats() {
            NormalizerStats::Standard { mean, std } => {
                assert_eq!(mean, vec![2.0, 0.0, 3.0]);
                assert!((std[0] - 2.0).abs() < 1e-6);
                assert!((std[1] - 10.0).abs() < 1e-5);
                assert_eq!(std[2], 0.0);
            }
            other => panic!("unexpected stats {other:?}"),
        }
        assert!(!Normalizer::<TestBackend, 2>::unit_range(&norm));
    }

    #[test]
    fn test_higher_rank_events() {
        let device = Default::default();
        let norm = MinMaxNormalizer::<TestBackend>::from_bounds(
            vec![0.0; 4],
            vec![2.0; 4],
            &device,
        )
        .unwrap();
        let x = Tensor::<TestBackend, 3>::ones([3, 2, 2], &device);
        let y = norm.normalize(x).unwrap();
        assert_eq!(y.dims(), [3, 2, 2]);
        assert_eq!(y.abs().max().into_scalar(), 0.0);
    }

    #[test]
    fn test_feature_count_mismatch() {
        let norm = MinMaxNormalizer::fit(data()).unwrap();
        let x = Tensor::<TestBackend, 2>::zeros([2, 4], &Default::default());
        assert!(matches!(
            norm.normalize(x),
            Err(DiffusionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_refit_replaces_statistics() {
        let mut norm = MinMaxNormalizer::fit(data()).unwrap();
        let wider = data() * 2.0;
        norm.refit(wider.clone()).unwrap();
        let x: Tensor<TestBackend, 2> = norm.normalize(wider).unwrap();
        assert!(x.abs().max().into_scalar() <= 1.0 + 1e-6);
        match norm.stats() {
            NormalizerStats::MinMax { max, .. } => assert_eq!(max, vec![8.0, 20.0, 6.0]),
            other => panic!("unexpected stats {other:?}"),
        }
    }

    #[test]
    fn test_stats_json_round_trip() {
        let device = Default::default();
        let stats = MinMaxNormalizer::<TestBackend>::fit(data()).unwrap().stats();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"kind\":\"min_max\""));

        let parsed: NormalizerStats = serde_json::from_str(&json).unwrap();
        let fitted = FittedNormalizer::<TestBackend>::from_stats(parsed, &device).unwrap();
        assert!(Normalizer::<TestBackend, 2>::unit_range(&fitted));
        assert_eq!(fitted.stats(), stats);
    }

    #[test]
    fn test_rejects_empty_fit() {
        let x = Tensor::<TestBackend, 2>::zeros([0, 3], &Default::default());
        assert!(MinMaxNormalizer::fit(x).is_err());
    }
}
