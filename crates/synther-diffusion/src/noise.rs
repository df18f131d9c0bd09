//! Seeded random tensors and host read-back
//!
//! Burn's `Tensor::random` draws from a backend-global generator. Every draw in
//! this crate instead comes from a caller-owned `rand::Rng`, so runs are
//! reproducible from a seed and independent across callers.

use burn::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{DiffusionError, Result};

/// `n` draws from N(0, 1)
pub fn standard_normal_values<R: Rng>(n: usize, rng: &mut R) -> Vec<f32> {
    (0..n).map(|_| StandardNormal.sample(&mut *rng)).collect()
}

/// Tensor of independent N(0, 1) draws
pub fn standard_normal<B: Backend, const D: usize, R: Rng>(
    shape: [usize; D],
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel = shape.iter().product();
    let values = standard_normal_values(numel, rng);
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Tensor of independent Rademacher (±1) draws
pub fn rademacher<B: Backend, const D: usize, R: Rng>(
    shape: [usize; D],
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, D> {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel)
        .map(|_| if rng.gen::<bool>() { 1.0 } else { -1.0 })
        .collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Copies a tensor to the host as `f32`
pub fn read_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DiffusionError::TensorData(format!("{e:?}")))
}

/// Reads a single-element tensor as `f64`
pub fn read_scalar<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<f64> {
    let values = read_values(tensor)?;
    match values.as_slice() {
        [v] => Ok(*v as f64),
        _ => Err(DiffusionError::TensorData(format!(
            "expected a single element, got {}",
            values.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_same_seed_same_draws() {
        let device = Default::default();
        let a: Tensor<TestBackend, 2> =
            standard_normal([3, 4], &mut StdRng::seed_from_u64(7), &device);
        let b: Tensor<TestBackend, 2> =
            standard_normal([3, 4], &mut StdRng::seed_from_u64(7), &device);
        assert_eq!(read_values(a).unwrap(), read_values(b).unwrap());
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = StdRng::seed_from_u64(0);
        let values = standard_normal_values(20_000, &mut rng);
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>()
            / values.len() as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_rademacher_signs() {
        let device = Default::default();
        let v: Tensor<TestBackend, 2> =
            rademacher([8, 16], &mut StdRng::seed_from_u64(3), &device);
        let values = read_values(v).unwrap();
        assert!(values.iter().all(|&x| x == 1.0 || x == -1.0));
        assert!(values.iter().any(|&x| x == 1.0));
        assert!(values.iter().any(|&x| x == -1.0));
    }

    #[test]
    fn test_read_scalar_rejects_vectors() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 1>::from_floats([1.0, 2.0], &device);
        assert!(read_scalar(t).is_err());
        let t = Tensor::<TestBackend, 1>::from_floats([2.5], &device);
        assert_eq!(read_scalar(t).unwrap(), 2.5);
    }
}
