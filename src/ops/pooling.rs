// src/ops/pooling.rs
// CPU max pooling forward pass that records the argmax consumed by the gradient engines.

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::error::{PoolGradError, Result};
use crate::ops::params::{Layout, PoolingParams, VolumeDims};

/// Argmax recorded for a window that covers no input element
pub const EMPTY_WINDOW_ARGMAX: i64 = -1;

/// Flat offset of an element in a tensor of `dims` stored in `layout`
pub(crate) fn element_offset(
    layout: Layout,
    dims: &VolumeDims,
    n: usize,
    c: usize,
    [d, h, w]: [usize; 3],
) -> usize {
    match layout {
        Layout::Ncdhw => (((n * dims.c + c) * dims.d + d) * dims.h + h) * dims.w + w,
        Layout::Ndhwc => (((n * dims.d + d) * dims.h + h) * dims.w + w) * dims.c + c,
    }
}

/// Max pooling over D, H, W.
///
/// Returns the pooled values and, per pooled element, the flat `d * H * W + h * W + w` of the
/// selected input element within its plane. The first maximum in scan order wins a tie and a
/// NaN is always selected over numbers.
pub fn max_pool3d_with_argmax<T: GradElement, I: ArgmaxIndex>(
    input: ArrayViewD<'_, T>,
    params: &PoolingParams,
    layout: Layout,
) -> Result<(ArrayD<T>, ArrayD<I>)> {
    params.validate()?;
    let dims = VolumeDims::from_shape("input", input.shape(), layout)?;
    let pooled = dims.with_spatial(params.pooled_spatial(dims.spatial()));
    let standard = input.as_standard_layout();
    let data = standard.as_slice().ok_or_else(|| {
        PoolGradError::Shape("input is not contiguous after standardisation".to_string())
    })?;

    let axes = params.axes();
    let mut values = vec![T::from_f64(f64::NEG_INFINITY); pooled.numel()];
    let empty = I::from_i64(EMPTY_WINDOW_ARGMAX).ok_or(PoolGradError::UnsupportedDtype {
        tensor: "argmax",
        dtype: I::DTYPE,
    })?;
    let mut indices = vec![empty; pooled.numel()];

    for n in 0..dims.n {
        for c in 0..dims.c {
            for pd in 0..pooled.d {
                for ph in 0..pooled.h {
                    for pw in 0..pooled.w {
                        let out = element_offset(layout, &pooled, n, c, [pd, ph, pw]);
                        let mut best: Option<(T, i64)> = None;
                        for kd in 0..axes[0].kernel {
                            let d = (pd as i64) * axes[0].stride - axes[0].pad + kd * axes[0].dilation;
                            if d < 0 || d >= dims.d as i64 {
                                continue;
                            }
                            for kh in 0..axes[1].kernel {
                                let h = (ph as i64) * axes[1].stride - axes[1].pad + kh * axes[1].dilation;
                                if h < 0 || h >= dims.h as i64 {
                                    continue;
                                }
                                for kw in 0..axes[2].kernel {
                                    let w = (pw as i64) * axes[2].stride - axes[2].pad
                                        + kw * axes[2].dilation;
                                    if w < 0 || w >= dims.w as i64 {
                                        continue;
                                    }
                                    let coord = [d as usize, h as usize, w as usize];
                                    let value = data[element_offset(layout, &dims, n, c, coord)];
                                    let take = match best {
                                        None => true,
                                        Some((current, _)) => {
                                            !current.is_nan() && (value.is_nan() || value > current)
                                        }
                                    };
                                    if take {
                                        let flat = (d * dims.h as i64 + h) * dims.w as i64 + w;
                                        best = Some((value, flat));
                                    }
                                }
                            }
                        }
                        if let Some((value, flat)) = best {
                            values[out] = value;
                            indices[out] = I::from_i64(flat).ok_or(PoolGradError::UnsupportedDtype {
                                tensor: "argmax",
                                dtype: I::DTYPE,
                            })?;
                        }
                    }
                }
            }
        }
    }

    let shape = pooled.to_shape(layout, input.ndim());
    let values = ArrayD::from_shape_vec(IxDyn(&shape), values)?;
    let indices = ArrayD::from_shape_vec(IxDyn(&shape), indices)?;
    Ok((values, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_forward_picks_window_maximum() {
        let input = Array::from_shape_vec(IxDyn(&[1, 1, 1, 2, 4]), vec![1.0f32, 5.0, 2.0, 0.0, 3.0, 4.0, 9.0, 8.0])
            .unwrap();
        let params = PoolingParams::new([1, 2, 2], [1, 2, 2], [0; 3]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(input.view(), &params, Layout::Ncdhw).unwrap();
        assert_eq!(values.shape(), &[1, 1, 1, 1, 2]);
        assert_eq!(values.as_slice().unwrap(), &[5.0, 9.0]);
        assert_eq!(argmax.as_slice().unwrap(), &[1, 6]);
    }

    #[test]
    fn test_first_maximum_wins_ties() {
        let input = Array::from_elem(IxDyn(&[1, 1, 2, 2, 2]), 1.0f64);
        let params = PoolingParams::cubic(2, 1, 0);
        let (_, argmax) = max_pool3d_with_argmax::<f64, i64>(input.view(), &params, Layout::Ncdhw).unwrap();
        assert_eq!(argmax.as_slice().unwrap(), &[0]);
    }

    #[test]
    fn test_nan_propagates() {
        let input = Array::from_shape_vec(IxDyn(&[1, 1, 1, 1, 4]), vec![1.0f32, f32::NAN, 7.0, 2.0]).unwrap();
        let params = PoolingParams::new([1, 1, 4], [1, 1, 4], [0; 3]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(input.view(), &params, Layout::Ncdhw).unwrap();
        assert!(values[[0, 0, 0, 0, 0]].is_nan());
        assert_eq!(argmax[[0, 0, 0, 0, 0]], 1);
    }

    #[test]
    fn test_padding_never_selected() {
        let input = Array::from_shape_vec(IxDyn(&[1, 1, 3, 1, 1]), vec![-3.0f32, -1.0, -2.0]).unwrap();
        let params = PoolingParams::new([3, 1, 1], [1, 1, 1], [1, 0, 0]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(input.view(), &params, Layout::Ncdhw).unwrap();
        assert_eq!(values.as_slice().unwrap(), &[-1.0, -1.0, -1.0]);
        assert_eq!(argmax.as_slice().unwrap(), &[1, 1, 1]);
    }

    #[test]
    fn test_channel_last_forward() {
        // N=1, D=1, H=1, W=2, C=2
        let input = Array::from_shape_vec(IxDyn(&[1, 1, 1, 2, 2]), vec![1.0f32, 8.0, 3.0, 2.0]).unwrap();
        let params = PoolingParams::new([1, 1, 2], [1, 1, 2], [0; 3]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(input.view(), &params, Layout::Ndhwc).unwrap();
        assert_eq!(values.shape(), &[1, 1, 1, 1, 2]);
        assert_eq!(values.as_slice().unwrap(), &[3.0, 8.0]);
        assert_eq!(argmax.as_slice().unwrap(), &[1, 0]);
    }

    #[test]
    fn test_dilated_window_without_input_is_marked_empty() {
        // Kernel 2 dilation 2 pad 1 on a length-1 axis visits positions -1 and 1 only
        let input = Array::from_elem(IxDyn(&[1, 1, 1, 1, 1]), 4.0f32);
        let params = PoolingParams::new([1, 1, 2], [1, 1, 1], [0, 0, 1]).with_dilation([1, 1, 2]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(input.view(), &params, Layout::Ncdhw).unwrap();
        assert_eq!(values.as_slice().unwrap(), &[f32::NEG_INFINITY]);
        assert_eq!(argmax.as_slice().unwrap(), &[-1]);
    }

    #[test]
    fn test_transposed_view_is_accepted() {
        let input = Array::from_shape_vec(IxDyn(&[1, 1, 1, 2, 2]), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        let transposed = input.view().permuted_axes(IxDyn(&[0, 1, 2, 4, 3]));
        let params = PoolingParams::new([1, 2, 1], [1, 2, 1], [0; 3]);
        let (values, argmax) = max_pool3d_with_argmax::<f32, i32>(transposed, &params, Layout::Ncdhw).unwrap();
        // Transposed rows are [1, 3] and [2, 4]
        assert_eq!(values.as_slice().unwrap(), &[2.0, 4.0]);
        assert_eq!(argmax.as_slice().unwrap(), &[2, 3]);
    }
}
