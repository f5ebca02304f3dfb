// src/ops/mod.rs
// Operator front end for the max-pool gradient.
// The host side resolves shapes and attributes, asks the planner for a tiling plan once and
// then hands the plan to whichever engine it selected.

pub mod kernels;
pub mod params;
pub mod pooling;
pub mod tiling;
pub mod window;


use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};
use tracing::{debug, info_span};

use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::backend::platform::PlatformInfo;
use crate::error::{PoolGradError, Result};
use kernels::ExecutionStats;
use params::{AxisParams, Layout, PoolingParams, TensorDescriptor};
use tiling::{PlannerConfig, StrategyKind, TilingPlan, TilingPlanner};

/// Gradient with respect to the pooling input, plus the plan that produced it
#[derive(Debug, Clone)]
pub struct GradResult<T> {
    pub grad_input: ArrayD<T>,
    pub plan: TilingPlan,
    pub stats: ExecutionStats,
}

/// Backward pass of 3-D max pooling driven by a recorded argmax.
#[derive(Debug, Clone)]
pub struct MaxPool3dGrad {
    params: PoolingParams,
    layout: Layout,
    platform: PlatformInfo,
    config: PlannerConfig,
}

impl MaxPool3dGrad {
    pub fn new(params: PoolingParams) -> Self {
        Self {
            params,
            layout: Layout::default(),
            platform: PlatformInfo::default(),
            config: PlannerConfig::default(),
        }
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Pins the engine, see `PlannerConfig::force`
    pub fn force(self, kind: StrategyKind) -> Self {
        self.with_config(PlannerConfig::forced(kind))
    }

    pub fn params(&self) -> &PoolingParams {
        &self.params
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn planner(&self) -> TilingPlanner {
        TilingPlanner::new(self.platform).with_config(self.config)
    }

    pub fn plan<T: GradElement, I: ArgmaxIndex>(
        &self,
        input_shape: &[usize],
        pooled_shape: &[usize],
    ) -> Result<TilingPlan> {
        self.planner()
            .plan::<T, I>(&self.params, self.layout, input_shape, pooled_shape)
    }

    /// Scatters `grad` back to the input positions recorded in `argmax`.
    /// `input_shape` is the shape of the forward input and of the returned gradient.
    pub fn forward<T: GradElement, I: ArgmaxIndex>(
        &self,
        grad: ArrayViewD<'_, T>,
        argmax: ArrayViewD<'_, I>,
        input_shape: &[usize],
    ) -> Result<GradResult<T>> {
        let span = info_span!(
            "max_pool3d_grad",
            layout = %self.layout,
            dtype = %T::DTYPE,
            index = %I::DTYPE,
            input = ?input_shape
        );
        let _guard = span.enter();

        let input = TensorDescriptor::new(input_shape, T::DTYPE, self.layout)?;
        let grad_desc = TensorDescriptor::new(grad.shape(), T::DTYPE, self.layout)?;
        let argmax_desc = TensorDescriptor::new(argmax.shape(), I::DTYPE, self.layout)?;
        let plan = self
            .planner()
            .plan_for(&self.params, &input, &grad_desc, &argmax_desc)?;

        let grad = grad.as_standard_layout();
        let argmax = argmax.as_standard_layout();
        let (grad, argmax) = match (grad.as_slice(), argmax.as_slice()) {
            (Some(g), Some(a)) => (g, a),
            _ => {
                return Err(PoolGradError::Shape(
                    "operands are not contiguous after standardisation".to_string(),
                ));
            }
        };

        let (output, stats) = match plan.strategy.kind() {
            StrategyKind::Vectorized => kernels::vectorized::execute(&plan, grad, argmax)?,
            StrategyKind::Simt => kernels::simt::execute(&plan, grad, argmax)?,
        };
        debug!(
            strategy = %plan.strategy,
            tiles = stats.kernel.tiles,
            zero_filled = stats.kernel.zero_filled_tiles,
            vector_ops = stats.kernel.vector_ops,
            masked_lanes = stats.kernel.masked_lanes,
            "gradient scattered"
        );

        let grad_input = ArrayD::from_shape_vec(IxDyn(input_shape), output)?;
        Ok(GradResult {
            grad_input,
            plan,
            stats,
        })
    }
}

/// Max-pool 3-D gradient on the default platform with channel-first tensors.
pub fn max_pool3d_grad_with_argmax<T: GradElement, I: ArgmaxIndex>(
    grad: ArrayViewD<'_, T>,
    argmax: ArrayViewD<'_, I>,
    input_shape: &[usize],
    params: &PoolingParams,
) -> Result<ArrayD<T>> {
    MaxPool3dGrad::new(*params)
        .forward(grad, argmax, input_shape)
        .map(|r| r.grad_input)
}

/// Max-pool 2-D gradient, run as a depth-1 volume.
///
/// Accepts batched (N, C, H, W) or unbatched (C, H, W) tensors; every operand must have the
/// same rank as `input_shape`. Unbatched operands run as a batch of one and the result keeps
/// the unbatched shape.
pub fn max_pool2d_grad_with_argmax<T: GradElement, I: ArgmaxIndex>(
    grad: ArrayViewD<'_, T>,
    argmax: ArrayViewD<'_, I>,
    input_shape: &[usize],
    params: &PoolingParams,
) -> Result<ArrayD<T>> {
    let rank = input_shape.len();
    for (tensor, shape) in [
        ("input", input_shape),
        ("grad", grad.shape()),
        ("argmax", argmax.shape()),
    ] {
        if !(3..=4).contains(&shape.len()) || shape.len() != rank {
            return Err(PoolGradError::InvalidRank {
                tensor,
                rank: shape.len(),
                shape: shape.to_vec(),
            });
        }
    }
    if params.d != AxisParams::identity() {
        return Err(PoolGradError::Config {
            key: "d".to_string(),
            reason: format!("2-D pooling needs kernel 1, stride 1, pad 0 on depth, got {:?}", params.d),
        });
    }
    if rank == 4 {
        return max_pool3d_grad_with_argmax(grad, argmax, input_shape, params);
    }

    let batched: Vec<usize> = std::iter::once(1).chain(input_shape.iter().copied()).collect();
    let grad_input = max_pool3d_grad_with_argmax(
        grad.insert_axis(Axis(0)),
        argmax.insert_axis(Axis(0)),
        &batched,
        params,
    )?;
    Ok(grad_input.index_axis_move(Axis(0), 0))
}
