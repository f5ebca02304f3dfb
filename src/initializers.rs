// src/initializers.rs
// Seeded random tensors for tests and the demo binary.
use ndarray::{ArrayD, IxDyn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::backend::number::GradElement;
use crate::error::{PoolGradError, Result};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

fn sample_tensor<T: GradElement>(
    shape: &[usize],
    seed: u64,
    dist: impl Distribution<f64>,
) -> Result<ArrayD<T>> {
    let mut rng = seeded_rng(seed);
    let numel = shape.iter().product();
    let data: Vec<T> = (0..numel).map(|_| T::from_f64(dist.sample(&mut rng))).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?)
}

/// Samples U(low, high)
pub fn uniform_tensor<T: GradElement>(shape: &[usize], low: f64, high: f64, seed: u64) -> Result<ArrayD<T>> {
    let uniform = Uniform::new(low, high).map_err(|e| PoolGradError::Config {
        key: "uniform".to_string(),
        reason: e.to_string(),
    })?;
    sample_tensor(shape, seed, uniform)
}

/// Samples N(mean, std)
pub fn normal_tensor<T: GradElement>(shape: &[usize], mean: f64, std: f64, seed: u64) -> Result<ArrayD<T>> {
    let normal = Normal::new(mean, std).map_err(|e| PoolGradError::Config {
        key: "normal".to_string(),
        reason: e.to_string(),
    })?;
    sample_tensor(shape, seed, normal)
}

/// Integers in [0, levels), so pooling windows regularly hold tied maxima
pub fn quantized_tensor<T: GradElement>(shape: &[usize], levels: u32, seed: u64) -> Result<ArrayD<T>> {
    let uniform = Uniform::new(0u32, levels.max(1)).map_err(|e| PoolGradError::Config {
        key: "levels".to_string(),
        reason: e.to_string(),
    })?;
    sample_tensor(shape, seed, uniform.map(f64::from))
}
