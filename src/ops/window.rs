// src/ops/window.rs
// Window range calculator shared by the vectorized and the SIMT engines.
// For a position in the input volume it tells which pooled positions may have picked it.

use std::ops::Range;

use crate::ops::params::AxisParams;

/// First pooled position whose window can reach `index`.
/// A zero stride is a degenerate axis and always yields 0.
pub fn pool_start(index: i64, pad: i64, kernel: i64, dilation: i64, stride: i64) -> i64 {
    if stride == 0 {
        return 0;
    }
    let effective = (kernel - 1) * dilation + 1;
    if index + pad < effective {
        0
    } else {
        (index + pad - effective) / stride + 1
    }
}

/// One past the last pooled position whose window can reach `index`, clamped to `pooled`.
pub fn pool_end(index: i64, pad: i64, stride: i64, pooled: i64) -> i64 {
    if stride == 0 {
        return 0;
    }
    ((index + pad) / stride + 1).min(pooled)
}

/// Pooled positions that may have selected input position `index`
pub fn window_range(index: i64, axis: &AxisParams, pooled: i64) -> Range<i64> {
    let start = pool_start(index, axis.pad, axis.kernel, axis.dilation, axis.stride);
    let end = pool_end(index, axis.pad, axis.stride, pooled);
    start..end.max(start)
}

/// Union of the windows of `len` consecutive input positions starting at `start`
pub fn tile_window(start: i64, len: i64, axis: &AxisParams, pooled: i64) -> Range<i64> {
    if len <= 0 {
        return 0..0;
    }
    let first = pool_start(start, axis.pad, axis.kernel, axis.dilation, axis.stride);
    let last = pool_end(start + len - 1, axis.pad, axis.stride, pooled);
    first..last.max(first)
}

/// Smallest distance between two pooled positions whose windows never share an input position
pub fn collision_distance(axis: &AxisParams) -> i64 {
    if axis.stride <= 0 {
        return 1;
    }
    let effective = axis.effective_kernel();
    ((effective + axis.stride - 1) / axis.stride).max(1)
}

/// Upper bound of the pooled window loaded for a tile of `len` input positions
pub fn window_extent_bound(len: i64, axis: &AxisParams, pooled: i64) -> i64 {
    if len <= 0 || axis.stride <= 0 {
        return 0;
    }
    ((len + axis.effective_kernel() - 2) / axis.stride + 1).min(pooled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_stride_is_degenerate() {
        assert_eq!(pool_start(5, 0, 2, 1, 0), 0);
        assert_eq!(pool_end(5, 0, 0, 10), 0);
        let axis = AxisParams {
            kernel: 2,
            stride: 0,
            pad: 0,
            dilation: 1,
        };
        assert!(window_range(3, &axis, 4).is_empty());
        assert_eq!(collision_distance(&axis), 1);
        assert_eq!(window_extent_bound(4, &axis, 4), 0);
    }

    #[test]
    fn test_overlapping_windows() {
        // Depth 4, kernel 2, stride 1: three pooled positions covering [0,1], [1,2], [2,3]
        let axis = AxisParams::new(2, 1, 0);
        assert_eq!(window_range(0, &axis, 3), 0..1);
        assert_eq!(window_range(1, &axis, 3), 0..2);
        assert_eq!(window_range(2, &axis, 3), 1..3);
        assert_eq!(window_range(3, &axis, 3), 2..3);
    }

    #[test]
    fn test_padded_windows_are_clamped() {
        // Depth 3, kernel 3, pad 1, stride 1: pooled p covers [p-1, p+1]
        let axis = AxisParams::new(3, 1, 1);
        assert_eq!(window_range(0, &axis, 3), 0..2);
        assert_eq!(window_range(1, &axis, 3), 0..3);
        assert_eq!(window_range(2, &axis, 3), 1..3);
    }

    #[test]
    fn test_window_matches_brute_force() {
        for kernel in 1..5 {
            for stride in 1..4 {
                for dilation in 1..3 {
                    let axis = AxisParams::new(kernel, stride, 0).with_dilation(dilation);
                    for pad in 0..=axis.effective_kernel() / 2 {
                        let axis = AxisParams { pad, ..axis };
                        let input = 11;
                        let pooled = axis.pooled_size(input, false);
                        for index in 0..input {
                            let range = window_range(index, &axis, pooled);
                            for p in 0..pooled {
                                let covers = (0..kernel)
                                    .map(|k| p * stride - pad + k * dilation)
                                    .any(|pos| pos == index);
                                if covers {
                                    assert!(
                                        range.contains(&p),
                                        "k={} s={} d={} p={} index={} pooled {} outside {:?}",
                                        kernel, stride, dilation, pad, index, p, range
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_tile_window_and_bounds() {
        let axis = AxisParams::new(3, 2, 0);
        // Input 9 -> pooled 4 windows [0,2] [2,4] [4,6] [6,8]
        assert_eq!(tile_window(0, 9, &axis, 4), 0..4);
        assert_eq!(tile_window(4, 2, &axis, 4), 1..3);
        assert!(tile_window(4, 0, &axis, 4).is_empty());

        for start in 0..9 {
            for len in 1..=(9 - start) {
                let range = tile_window(start, len, &axis, 4);
                assert!(range.end - range.start <= window_extent_bound(len, &axis, 4));
            }
        }
    }

    #[test]
    fn test_collision_distance() {
        assert_eq!(collision_distance(&AxisParams::new(2, 2, 0)), 1);
        assert_eq!(collision_distance(&AxisParams::new(3, 2, 0)), 2);
        assert_eq!(collision_distance(&AxisParams::new(3, 1, 1)), 3);
        assert_eq!(collision_distance(&AxisParams::new(3, 3, 0).with_dilation(2)), 2);
    }
}
