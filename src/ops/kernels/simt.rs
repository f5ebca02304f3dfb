// src/ops/kernels/simt.rs
// Thread-per-element engine. Every input element gathers its own gradient by scanning the
// pooled positions whose windows can reach it, so no two workers ever write the same slot.

use rayon::prelude::*;
use tracing::debug;

use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::error::{PoolGradError, Result};
use crate::ops::kernels::{ExecutionStats, KernelStats};
use crate::ops::params::{AxisParams, Layout, VolumeDims};
use crate::ops::tiling::{Strategy, TilingPlan};
use crate::ops::window::window_range;

/// Read-only view shared by all threads
struct SimtContext<'a, T, I> {
    grad: &'a [T],
    argmax: &'a [I],
    input: VolumeDims,
    pooled: VolumeDims,
    axes: [AxisParams; 3],
}

impl<T: GradElement, I: ArgmaxIndex> SimtContext<'_, T, I> {
    /// Channel-first: index = ((plane * D + d) * H + h) * W + w
    fn gather_ncdhw(&self, index: usize) -> T {
        let plane_volume = self.input.plane_volume();
        let plane = index / plane_volume;
        let local = index % plane_volume;
        let hw = self.input.h * self.input.w;
        let coord = [local / hw, (local % hw) / self.input.w, local % self.input.w];
        let pooled_base = plane * self.pooled.plane_volume();
        self.gather(coord, local as i64, |pd, ph, pw| {
            pooled_base + (pd * self.pooled.h + ph) * self.pooled.w + pw
        })
    }

    /// Channel-last: index = (((n * D + d) * H + h) * W + w) * C + c
    fn gather_ndhwc(&self, index: usize) -> T {
        let c = self.input.c;
        let channel = index % c;
        let mut rest = index / c;
        let w = rest % self.input.w;
        rest /= self.input.w;
        let h = rest % self.input.h;
        rest /= self.input.h;
        let d = rest % self.input.d;
        let n = rest / self.input.d;
        let own = ((d * self.input.h + h) * self.input.w + w) as i64;
        let pooled = &self.pooled;
        self.gather([d, h, w], own, |pd, ph, pw| {
            (((n * pooled.d + pd) * pooled.h + ph) * pooled.w + pw) * c + channel
        })
    }

    fn gather(&self, coord: [usize; 3], own: i64, offset: impl Fn(usize, usize, usize) -> usize) -> T {
        let pooled = self.pooled.spatial();
        let mut ranges = [0..0, 0..0, 0..0];
        for i in 0..3 {
            ranges[i] = window_range(coord[i] as i64, &self.axes[i], pooled[i] as i64);
        }
        let mut sum = <T::Acc as Default>::default();
        for pd in ranges[0].clone() {
            for ph in ranges[1].clone() {
                for pw in ranges[2].clone() {
                    let at = offset(pd as usize, ph as usize, pw as usize);
                    if self.argmax[at].to_i64() == own {
                        sum += self.grad[at].widen();
                    }
                }
            }
        }
        T::narrow(sum)
    }
}

/// Runs a SIMT plan over flat tensors in the plan's layout.
pub fn execute<T: GradElement, I: ArgmaxIndex>(
    plan: &TilingPlan,
    grad: &[T],
    argmax: &[I],
) -> Result<(Vec<T>, ExecutionStats)> {
    let layout = match plan.strategy {
        Strategy::Simt { layout } => layout,
        Strategy::Vectorized { .. } => {
            return Err(PoolGradError::Pipeline {
                stage: "simt",
                reason: format!("plan was made for {}", plan.strategy),
            });
        }
    };
    for (tensor, len) in [("grad", grad.len()), ("argmax", argmax.len())] {
        if len != plan.pooled.numel() {
            return Err(PoolGradError::ShapeMismatch {
                tensor,
                expected: vec![plan.pooled.numel()],
                got: vec![len],
            });
        }
    }

    let ctx = SimtContext {
        grad,
        argmax,
        input: plan.input,
        pooled: plan.pooled,
        axes: plan.params.axes(),
    };
    let mut output = vec![<T as GradElement>::zero(); plan.input.numel()];
    if plan.elements_per_core > 0 {
        // One chunk per used core, one task per element inside it
        output
            .par_chunks_mut(plan.elements_per_core)
            .enumerate()
            .for_each(|(core, chunk)| {
                let base = core * plan.elements_per_core;
                chunk.par_iter_mut().enumerate().for_each(|(i, out)| {
                    *out = match layout {
                        Layout::Ncdhw => ctx.gather_ncdhw(base + i),
                        Layout::Ndhwc => ctx.gather_ndhwc(base + i),
                    };
                });
            });
    }

    let kernel = KernelStats {
        threads: output.len(),
        ..KernelStats::default()
    };
    debug!(threads = kernel.threads, cores = plan.used_cores, %layout, "simt pass done");
    Ok((
        output,
        ExecutionStats {
            kernel,
            pipeline: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::platform::PlatformInfo;
    use crate::ops::params::PoolingParams;
    use crate::ops::tiling::{PlannerConfig, StrategyKind, TilingPlanner};

    fn simt_plan(params: &PoolingParams, layout: Layout, x: &[usize], y: &[usize]) -> TilingPlan {
        TilingPlanner::new(PlatformInfo::new(3, 196_608))
            .with_config(PlannerConfig::forced(StrategyKind::Simt))
            .plan::<f32, i32>(params, layout, x, y)
            .unwrap()
    }

    #[test]
    fn test_overlapping_depth_windows() {
        // Depth 4, kernel 2, stride 1: pooled 0 -> 1, pooled 1 -> 1, pooled 2 -> 2
        let params = PoolingParams::new([2, 1, 1], [1, 1, 1], [0; 3]);
        let plan = simt_plan(&params, Layout::Ncdhw, &[1, 1, 4, 1, 1], &[1, 1, 3, 1, 1]);
        let grad = [1.0f32, 10.0, 100.0];
        let argmax = [1i32, 1, 2];
        let (out, stats) = execute(&plan, &grad, &argmax).unwrap();
        assert_eq!(out, vec![0.0, 11.0, 100.0, 0.0]);
        assert_eq!(stats.kernel.threads, 4);
        assert!(stats.pipeline.is_none());
    }

    #[test]
    fn test_padded_windows_skip_out_of_range() {
        // Depth 3, kernel 3, pad 1: every pooled position picks the middle element
        let params = PoolingParams::new([3, 1, 1], [1, 1, 1], [1, 0, 0]);
        let plan = simt_plan(&params, Layout::Ncdhw, &[1, 1, 3, 1, 1], &[1, 1, 3, 1, 1]);
        let (out, _) = execute(&plan, &[1.0f32, 2.0, 4.0], &[1i32, 1, 1]).unwrap();
        assert_eq!(out, vec![0.0, 7.0, 0.0]);
    }

    #[test]
    fn test_channel_last_matches_per_channel_scatter() {
        // 1 x 2 x 2 x 2 x 2 (NDHWC), kernel 2 stride 2: one pooled cell per channel
        let params = PoolingParams::cubic(2, 2, 0);
        let plan = simt_plan(&params, Layout::Ndhwc, &[1, 2, 2, 2, 2], &[1, 1, 1, 1, 2]);
        assert_eq!(plan.tiling_key(), 3);
        let grad = [3.0f32, 5.0];
        let argmax = [7i32, 2];
        let (out, _) = execute(&plan, &grad, &argmax).unwrap();
        let mut expected = vec![0.0f32; 16];
        // Channel 0 picked (1,1,1), channel 1 picked (0,1,0)
        expected[7 * 2] = 3.0;
        expected[2 * 2 + 1] = 5.0;
        assert_eq!(out, expected);
    }

    #[test]
    fn test_rejects_vectorized_plan() {
        let params = PoolingParams::cubic(2, 2, 0);
        let plan = TilingPlanner::new(PlatformInfo::new(2, 196_608))
            .plan::<f32, i32>(&params, Layout::Ncdhw, &[1, 1, 4, 4, 4], &[1, 1, 2, 2, 2])
            .unwrap();
        assert!(execute(&plan, &[0.0f32; 8], &[0i32; 8]).is_err());
    }

    #[test]
    fn test_length_mismatch() {
        let params = PoolingParams::cubic(2, 2, 0);
        let plan = simt_plan(&params, Layout::Ncdhw, &[1, 1, 4, 4, 4], &[1, 1, 2, 2, 2]);
        let err = execute(&plan, &[0.0f32; 7], &[0i32; 8]).unwrap_err();
        assert!(matches!(err, PoolGradError::ShapeMismatch { tensor: "grad", .. }));
    }
}
