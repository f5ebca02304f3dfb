// src/ops/tiling.rs
// Host-side tiling planner. Runs once per invocation and decides how the input volume is cut
// into tiles, how tiles are spread over cores, how big the per-core buffers are and which
// engine executes the plan.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::number::{ArgmaxIndex, DType, GradElement};
use crate::backend::platform::PlatformInfo;
use crate::error::{PoolGradError, Result};
use crate::ops::params::{Layout, PoolingParams, TensorDescriptor, VolumeDims};
use crate::ops::window::{collision_distance, tile_window, window_extent_bound};

/// Rotating buffer slots per core
pub const BUFFER_NUM: usize = 2;
/// Fixed helper area reserved next to the slots
pub const HELP_BUFFER_BYTES: usize = 2048;
/// Input elements per pooled element above which the vector lanes would mostly idle
pub const SIMT_SPARSITY_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Vectorized,
    Simt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    Vectorized { check_range: bool },
    Simt { layout: Layout },
}

impl Strategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Vectorized { .. } => StrategyKind::Vectorized,
            Strategy::Simt { .. } => StrategyKind::Simt,
        }
    }

    /// Numeric key reported to the host launcher
    pub fn tiling_key(&self) -> u64 {
        match self {
            Strategy::Vectorized { check_range: false } => 0,
            Strategy::Vectorized { check_range: true } => 100,
            Strategy::Simt {
                layout: Layout::Ncdhw,
            } => 2,
            Strategy::Simt {
                layout: Layout::Ndhwc,
            } => 3,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Vectorized { check_range } => {
                write!(f, "vectorized(check_range={})", check_range)
            }
            Strategy::Simt { layout } => write!(f, "simt({})", layout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Pin the engine instead of letting the planner choose
    pub force: Option<StrategyKind>,
}

impl PlannerConfig {
    pub fn forced(kind: StrategyKind) -> Self {
        Self { force: Some(kind) }
    }
}

/// Split of one axis into `outer` chunks of `inner` elements, the last one holding `tail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisSplit {
    pub inner: usize,
    pub outer: usize,
    pub tail: usize,
}

impl AxisSplit {
    pub fn new(extent: usize, inner: usize) -> Self {
        if extent == 0 {
            return Self {
                inner: inner.max(1),
                outer: 0,
                tail: 0,
            };
        }
        let inner = inner.clamp(1, extent);
        let outer = extent.div_ceil(inner);
        Self {
            inner,
            outer,
            tail: extent - inner * (outer - 1),
        }
    }

    pub fn whole(extent: usize) -> Self {
        Self::new(extent, extent)
    }

    /// Extent of chunk `index`
    pub fn actual(&self, index: usize) -> usize {
        if index + 1 == self.outer {
            self.tail
        } else {
            self.inner
        }
    }

    pub fn range(&self, index: usize) -> Range<usize> {
        let start = index * self.inner;
        start..start + self.actual(index)
    }
}

/// Element counts of one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BufferSizes {
    pub accumulator: usize,
    pub grad: usize,
    pub argmax: usize,
}

/// One tile: a plane range and an input-space box, identified by its block index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileCoord {
    pub block: usize,
    pub plane_index: usize,
    pub axis_index: [usize; 3],
    pub planes: Range<usize>,
    pub input: [Range<usize>; 3],
}

impl TileCoord {
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn extent(&self) -> [usize; 3] {
        [self.input[0].len(), self.input[1].len(), self.input[2].len()]
    }

    pub fn origin(&self) -> [usize; 3] {
        [self.input[0].start, self.input[1].start, self.input[2].start]
    }

    pub fn numel(&self) -> usize {
        self.plane_count() * self.extent().iter().product::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingPlan {
    pub layout: Layout,
    pub params: PoolingParams,
    pub grad_dtype: DType,
    pub index_dtype: DType,
    pub input: VolumeDims,
    pub pooled: VolumeDims,
    /// Split of the combined batch x channel axis
    pub planes: AxisSplit,
    /// Split of the input-space D, H, W axes
    pub spatial: [AxisSplit; 3],
    /// Batching granularity (lane spacing) per D, H, W
    pub batch: [usize; 3],
    pub total_blocks: usize,
    pub blocks_per_core: usize,
    pub tail_core_blocks: usize,
    pub used_cores: usize,
    pub buffers: BufferSizes,
    pub lane_count: usize,
    pub block_elems: usize,
    pub vector_bytes: usize,
    pub strategy: Strategy,
    pub scratch_per_core_bytes: usize,
    pub workspace_bytes: usize,
    pub elements_per_core: usize,
}

impl TilingPlan {
    pub fn tiling_key(&self) -> u64 {
        self.strategy.tiling_key()
    }

    /// Block indices handled by `core`; the last used core takes the tail count
    pub fn core_blocks(&self, core: usize) -> Range<usize> {
        if core >= self.used_cores {
            return 0..0;
        }
        let start = core * self.blocks_per_core;
        let count = if core + 1 == self.used_cores {
            self.tail_core_blocks
        } else {
            self.blocks_per_core
        };
        start..start + count
    }

    fn spatial_blocks(&self) -> usize {
        self.spatial.iter().map(|s| s.outer).product()
    }

    /// Decodes a block index, plane axis outermost then D, H, W
    pub fn tile(&self, block: usize) -> TileCoord {
        let spatial_blocks = self.spatial_blocks().max(1);
        let plane_index = block / spatial_blocks;
        let rest = block % spatial_blocks;
        let hw_blocks = self.spatial[1].outer * self.spatial[2].outer;
        let d_index = rest / hw_blocks.max(1);
        let rest = rest % hw_blocks.max(1);
        let h_index = rest / self.spatial[2].outer.max(1);
        let w_index = rest % self.spatial[2].outer.max(1);
        let axis_index = [d_index, h_index, w_index];
        TileCoord {
            block,
            plane_index,
            axis_index,
            planes: self.planes.range(plane_index),
            input: [
                self.spatial[0].range(d_index),
                self.spatial[1].range(h_index),
                self.spatial[2].range(w_index),
            ],
        }
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.total_blocks).map(move |block| self.tile(block))
    }

    /// Planes and input-space box written by the tile
    pub fn tile_input_region(&self, tile: &TileCoord) -> (Range<usize>, [Range<usize>; 3]) {
        (tile.planes.clone(), tile.input.clone())
    }

    /// Pooled positions whose windows may reach into the tile, per D, H, W
    pub fn tile_pooled_window(&self, tile: &TileCoord) -> [Range<i64>; 3] {
        let axes = self.params.axes();
        let pooled = self.pooled.spatial();
        let mut out: [Range<i64>; 3] = [0..0, 0..0, 0..0];
        for i in 0..3 {
            out[i] = tile_window(
                tile.input[i].start as i64,
                tile.input[i].len() as i64,
                &axes[i],
                pooled[i] as i64,
            );
        }
        out
    }
}

/// Bytes of one double-buffered tile working set
#[derive(Debug, Clone, Copy)]
struct WorkingSet {
    acc_bytes: usize,
    grad_bytes: usize,
    index_bytes: usize,
    block_elems: usize,
}

impl WorkingSet {
    fn buffers(
        &self,
        planes: usize,
        inner: [usize; 3],
        params: &PoolingParams,
        pooled: [usize; 3],
    ) -> BufferSizes {
        let axes = params.axes();
        let mut window = [0usize; 3];
        for i in 0..3 {
            window[i] = window_extent_bound(inner[i] as i64, &axes[i], pooled[i] as i64).max(0) as usize;
        }
        let out_w = round_up(inner[2], self.block_elems);
        let arg_w = round_up(window[2], self.block_elems);
        let arg_count = planes * window[0] * window[1] * arg_w;
        BufferSizes {
            accumulator: planes * inner[0] * inner[1] * out_w,
            grad: arg_count,
            argmax: arg_count,
        }
    }

    fn slot_bytes(&self, sizes: &BufferSizes) -> usize {
        sizes.accumulator * self.acc_bytes
            + sizes.grad * self.grad_bytes
            + sizes.argmax * self.index_bytes
    }

    fn total_bytes(&self, sizes: &BufferSizes) -> usize {
        BUFFER_NUM * self.slot_bytes(sizes) + HELP_BUFFER_BYTES
    }
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Largest x in 1..=hi with `fits(x)`, assuming `fits` is monotone
fn largest_fitting(hi: usize, fits: impl Fn(usize) -> bool) -> Option<usize> {
    if hi == 0 || !fits(1) {
        return None;
    }
    let (mut lo, mut hi) = (1usize, hi);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

/// Rounds down to a stride multiple so tile borders line up with window borders
fn align_to_stride(value: usize, stride: i64) -> usize {
    let stride = stride.max(1) as usize;
    if value >= stride {
        value / stride * stride
    } else {
        value
    }
}

/// Computes `TilingPlan`s for a platform.
#[derive(Debug, Clone, Default)]
pub struct TilingPlanner {
    platform: PlatformInfo,
    config: PlannerConfig,
}

impl TilingPlanner {
    pub fn new(platform: PlatformInfo) -> Self {
        Self {
            platform,
            config: PlannerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Plans from operand descriptors, checking the dtype combination first
    pub fn plan_for(
        &self,
        params: &PoolingParams,
        input: &TensorDescriptor,
        grad: &TensorDescriptor,
        argmax: &TensorDescriptor,
    ) -> Result<TilingPlan> {
        if !grad.dtype.is_float() {
            return Err(PoolGradError::UnsupportedDtype {
                tensor: "grad",
                dtype: grad.dtype,
            });
        }
        if input.dtype != grad.dtype {
            return Err(PoolGradError::UnsupportedDtype {
                tensor: "input",
                dtype: input.dtype,
            });
        }
        if !matches!(argmax.dtype, DType::Int32 | DType::Int64) {
            return Err(PoolGradError::UnsupportedDtype {
                tensor: "argmax",
                dtype: argmax.dtype,
            });
        }
        if grad.layout != input.layout || argmax.layout != input.layout {
            return Err(PoolGradError::UnsupportedLayout {
                layout: grad.layout,
                engine: "mixed-layout",
            });
        }
        self.plan_dtypes(
            params,
            input.layout,
            input.shape(),
            grad.shape(),
            argmax.shape(),
            grad.dtype,
            argmax.dtype,
        )
    }

    pub fn plan<T: GradElement, I: ArgmaxIndex>(
        &self,
        params: &PoolingParams,
        layout: Layout,
        input_shape: &[usize],
        pooled_shape: &[usize],
    ) -> Result<TilingPlan> {
        self.plan_dtypes(
            params,
            layout,
            input_shape,
            pooled_shape,
            pooled_shape,
            T::DTYPE,
            I::DTYPE,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_dtypes(
        &self,
        params: &PoolingParams,
        layout: Layout,
        input_shape: &[usize],
        grad_shape: &[usize],
        argmax_shape: &[usize],
        grad_dtype: DType,
        index_dtype: DType,
    ) -> Result<TilingPlan> {
        let (input, pooled) = params.validate_shapes(input_shape, grad_shape, argmax_shape, layout)?;
        let strategy_kind = self.select_engine(params, layout, &input, &pooled)?;

        let plan = match strategy_kind {
            StrategyKind::Simt => self.plan_simt(params, layout, input, pooled, grad_dtype, index_dtype),
            StrategyKind::Vectorized => {
                self.plan_vectorized(params, layout, input, pooled, grad_dtype, index_dtype)?
            }
        };

        debug!(
            strategy = %plan.strategy,
            tiling_key = plan.tiling_key(),
            planes = ?plan.planes,
            spatial = ?plan.spatial,
            batch = ?plan.batch,
            total_blocks = plan.total_blocks,
            used_cores = plan.used_cores,
            workspace_bytes = plan.workspace_bytes,
            "tiling plan ready"
        );
        Ok(plan)
    }

    fn select_engine(
        &self,
        params: &PoolingParams,
        layout: Layout,
        input: &VolumeDims,
        pooled: &VolumeDims,
    ) -> Result<StrategyKind> {
        match self.config.force {
            Some(StrategyKind::Vectorized) if layout.is_channel_last() => {
                Err(PoolGradError::UnsupportedLayout {
                    layout,
                    engine: "vectorized",
                })
            }
            Some(kind) => Ok(kind),
            None => {
                let sparse = input.plane_volume()
                    > pooled.plane_volume().saturating_mul(SIMT_SPARSITY_THRESHOLD);
                if layout.is_channel_last() || params.has_dilation() || sparse {
                    Ok(StrategyKind::Simt)
                } else {
                    Ok(StrategyKind::Vectorized)
                }
            }
        }
    }

    fn plan_simt(
        &self,
        params: &PoolingParams,
        layout: Layout,
        input: VolumeDims,
        pooled: VolumeDims,
        grad_dtype: DType,
        index_dtype: DType,
    ) -> TilingPlan {
        let planes = AxisSplit::new(input.planes(), 1);
        let spatial = [
            AxisSplit::whole(input.d),
            AxisSplit::whole(input.h),
            AxisSplit::whole(input.w),
        ];
        let (blocks_per_core, used_cores, tail_core_blocks) =
            split_blocks(planes.outer, self.platform.core_num);
        TilingPlan {
            layout,
            params: *params,
            grad_dtype,
            index_dtype,
            input,
            pooled,
            planes,
            spatial,
            batch: [1; 3],
            total_blocks: planes.outer,
            blocks_per_core,
            tail_core_blocks,
            used_cores,
            buffers: BufferSizes::default(),
            lane_count: 1,
            block_elems: 1,
            vector_bytes: self.platform.vector_bytes,
            strategy: Strategy::Simt { layout },
            scratch_per_core_bytes: 0,
            workspace_bytes: self.platform.reserved_workspace_bytes,
            elements_per_core: blocks_per_core * input.plane_volume(),
        }
    }

    fn plan_vectorized(
        &self,
        params: &PoolingParams,
        layout: Layout,
        input: VolumeDims,
        pooled: VolumeDims,
        grad_dtype: DType,
        index_dtype: DType,
    ) -> Result<TilingPlan> {
        let grad_bytes = grad_dtype.size_in_bytes();
        let index_bytes = index_dtype.size_in_bytes();
        let acc_bytes = if grad_dtype == DType::Float64 { 8 } else { 4 };
        let block_bytes = self.platform.block_bytes;
        let ws = WorkingSet {
            acc_bytes,
            grad_bytes,
            index_bytes,
            block_elems: (block_bytes / grad_bytes).max(block_bytes / index_bytes).max(1),
        };
        let budget = self.platform.scratch_bytes;
        let full = input.spatial();
        let pooled_sp = pooled.spatial();
        let fits = |planes: usize, inner: [usize; 3]| {
            ws.total_bytes(&ws.buffers(planes, inner, params, pooled_sp)) <= budget
        };
        let axes = params.axes();

        let core_num = self.platform.core_num;
        let plane_count = input.planes();
        let mut inner = full;
        let high_inner;
        if fits(1, full) {
            let fit = largest_fitting(plane_count.max(1), |p| fits(p, full)).unwrap_or(1);
            high_inner = fit.min(plane_count.div_ceil(core_num)).max(1);
        } else {
            high_inner = 1;
            // Shrink D, then H, then W until one tile fits
            let mut settled = false;
            for axis in 0..3 {
                let fits_axis = |x: usize| {
                    let mut candidate = inner;
                    candidate[axis] = x;
                    fits(1, candidate)
                };
                match largest_fitting(full[axis], fits_axis) {
                    Some(x) => {
                        inner[axis] = align_to_stride(x, axes[axis].stride);
                        settled = true;
                        break;
                    }
                    None => inner[axis] = 1,
                }
            }
            if !settled {
                let required = ws.total_bytes(&ws.buffers(1, [1, 1, 1], params, pooled_sp));
                return Err(PoolGradError::WorkingSetTooLarge {
                    required_bytes: required,
                    available_bytes: budget,
                });
            }
        }

        let planes = AxisSplit::new(plane_count, high_inner);
        let blocks_for = |inner: &[usize; 3]| {
            planes.outer
                * (0..3)
                    .map(|i| full[i].div_ceil(inner[i]))
                    .product::<usize>()
        };
        // Spread small problems over more cores by cutting D, then H
        if high_inner == 1 {
            let mut axis = 0;
            while axis < 2 && blocks_for(&inner) < core_num {
                if inner[axis] <= 1 {
                    axis += 1;
                    continue;
                }
                let half = inner[axis].div_ceil(2);
                let aligned = round_up(half, axes[axis].stride.max(1) as usize);
                inner[axis] = if aligned < inner[axis] { aligned } else { half };
            }
        }

        let spatial = [
            AxisSplit::new(full[0], inner[0]),
            AxisSplit::new(full[1], inner[1]),
            AxisSplit::new(full[2], inner[2]),
        ];

        let check_range = !(0..3).all(|i| {
            let axis = &axes[i];
            spatial[i].outer <= 1
                || (axis.pad == 0
                    && axis.effective_kernel() <= axis.stride
                    && spatial[i].inner % axis.stride as usize == 0)
        });

        let mut batch = [1usize; 3];
        for i in 0..3 {
            batch[i] = (collision_distance(&axes[i]) as usize).next_power_of_two();
        }

        let buffers = ws.buffers(high_inner, inner, params, pooled_sp);
        let scratch_per_core_bytes = ws.total_bytes(&buffers);
        let total_blocks = if plane_count == 0 {
            0
        } else {
            planes.outer * spatial.iter().map(|s| s.outer).product::<usize>()
        };
        let (blocks_per_core, used_cores, tail_core_blocks) = split_blocks(total_blocks, core_num);

        Ok(TilingPlan {
            layout,
            params: *params,
            grad_dtype,
            index_dtype,
            input,
            pooled,
            planes,
            spatial,
            batch,
            total_blocks,
            blocks_per_core,
            tail_core_blocks,
            used_cores,
            buffers,
            lane_count: (self.platform.vector_bytes / index_bytes).max(1),
            block_elems: ws.block_elems,
            vector_bytes: self.platform.vector_bytes,
            strategy: Strategy::Vectorized { check_range },
            scratch_per_core_bytes,
            workspace_bytes: self.platform.reserved_workspace_bytes
                + used_cores * scratch_per_core_bytes,
            elements_per_core: blocks_per_core * high_inner * inner.iter().product::<usize>(),
        })
    }
}

/// (normal blocks per core, used cores, blocks on the last core)
fn split_blocks(total_blocks: usize, core_num: usize) -> (usize, usize, usize) {
    if total_blocks == 0 {
        return (0, 0, 0);
    }
    let per_core = total_blocks.div_ceil(core_num.max(1));
    let used = total_blocks.div_ceil(per_core);
    let tail = total_blocks - per_core * (used - 1);
    (per_core, used, tail)
}
