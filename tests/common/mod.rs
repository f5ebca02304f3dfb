// tests/common/mod.rs
// Shared helpers for the integration tests: seeded operands and a naive scatter oracle.
#![allow(dead_code)]

use approx::relative_eq;
use ferrox_poolgrad::initializers::{normal_tensor, quantized_tensor, uniform_tensor};
use ferrox_poolgrad::{
    ArgmaxIndex, GradElement, Layout, PoolingParams, VolumeDims, max_pool3d_with_argmax,
};
use ndarray::{ArrayD, Dimension};

/// Forward input, pooled gradient and argmax for one case
pub struct Operands<T, I> {
    pub input: ArrayD<T>,
    pub grad: ArrayD<T>,
    pub argmax: ArrayD<I>,
}

/// Uniform input in [-4, 4), normal gradient, argmax from the forward pass
pub fn random_operands<T: GradElement, I: ArgmaxIndex>(
    shape: &[usize],
    params: &PoolingParams,
    layout: Layout,
    seed: u64,
) -> Operands<T, I> {
    let input = uniform_tensor::<T>(shape, -4.0, 4.0, seed).unwrap();
    with_forward(input, params, layout, seed)
}

/// Few distinct values so neighbouring windows share tied maxima
pub fn tied_operands<T: GradElement, I: ArgmaxIndex>(
    shape: &[usize],
    params: &PoolingParams,
    seed: u64,
) -> Operands<T, I> {
    let input = quantized_tensor::<T>(shape, 3, seed).unwrap();
    with_forward(input, params, Layout::Ncdhw, seed)
}

fn with_forward<T: GradElement, I: ArgmaxIndex>(
    input: ArrayD<T>,
    params: &PoolingParams,
    layout: Layout,
    seed: u64,
) -> Operands<T, I> {
    let (pooled, argmax) = max_pool3d_with_argmax::<T, I>(input.view(), params, layout).unwrap();
    let grad = normal_tensor::<T>(pooled.shape(), 0.0, 1.0, seed.wrapping_add(1000)).unwrap();
    Operands { input, grad, argmax }
}

/// Adds every pooled gradient onto the input position its argmax names, in f64.
/// Negative argmax entries are skipped.
pub fn scatter_oracle<T: GradElement, I: ArgmaxIndex>(
    grad: &ArrayD<T>,
    argmax: &ArrayD<I>,
    input_shape: &[usize],
    layout: Layout,
) -> ArrayD<f64> {
    let input = VolumeDims::from_shape("input", input_shape, layout).unwrap();
    let pooled = VolumeDims::from_shape("grad", grad.shape(), layout).unwrap();
    let mut out = ArrayD::<f64>::zeros(input_shape);
    for ((index, g), a) in grad.indexed_iter().zip(argmax.iter()) {
        let flat = a.to_i64();
        if flat < 0 {
            continue;
        }
        let flat = flat as usize;
        let (n, c) = match layout {
            Layout::Ncdhw => (index[0], index[1]),
            Layout::Ndhwc => (index[0], index[index.ndim() - 1]),
        };
        let d = flat / (input.h * input.w);
        let h = flat / input.w % input.h;
        let w = flat % input.w;
        assert!(d < input.d && pooled.planes() == input.planes());
        let target: Vec<usize> = match (layout, input_shape.len()) {
            (Layout::Ncdhw, 5) => vec![n, c, d, h, w],
            (Layout::Ncdhw, _) => vec![n, c, h, w],
            (Layout::Ndhwc, 5) => vec![n, d, h, w, c],
            (Layout::Ndhwc, _) => vec![n, h, w, c],
        };
        out[target.as_slice()] += g.to_f64();
    }
    out
}

/// Element-wise relative comparison with an absolute floor for values near zero
pub fn assert_close<T: GradElement>(actual: &ArrayD<T>, expected: &ArrayD<f64>, tol: f64) {
    assert_eq!(actual.shape(), expected.shape());
    for ((index, a), e) in actual.indexed_iter().zip(expected.iter()) {
        let a = a.to_f64();
        assert!(
            relative_eq!(a, *e, epsilon = tol, max_relative = tol),
            "mismatch at {:?}: got {}, expected {}",
            index.slice(),
            a,
            e
        );
    }
}

pub fn sum_f64<T: GradElement>(tensor: &ArrayD<T>) -> f64 {
    tensor.iter().map(|x| x.to_f64()).sum()
}
