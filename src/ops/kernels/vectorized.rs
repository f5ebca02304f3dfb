// src/ops/kernels/vectorized.rs
// Vectorized scatter-accumulate engine.
// Tiles are loaded into per-core slots, scattered into a wide accumulator by the lane engine
// and narrowed back into the gradient tensor by the store stage.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::backend::memory::TileSlot;
use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::backend::pipeline::{Pipeline, TileStages};
use crate::error::{PoolGradError, Result};
use crate::ops::kernels::lanes::{LaneAxis, LaneProgram, LoopAxis, TileFrame, VectorUnit};
use crate::ops::kernels::{ExecutionStats, KernelStats, SubStrategy};
use crate::ops::params::Layout;
use crate::ops::tiling::{Strategy, TileCoord, TilingPlan, round_up};

/// Picks the batching mode from how many lane positions each pooled axis offers.
pub fn choose_sub_strategy(
    window: [usize; 3],
    batch: [usize; 3],
    index_bytes: usize,
    vector_bytes: usize,
) -> SubStrategy {
    let count = |i: usize| {
        let pb = batch[i].clamp(1, window[i].max(1));
        window[i] / pb
    };
    let row = count(2) * 2 * index_bytes;
    if row > vector_bytes {
        SubStrategy::SingleRow
    } else if row * count(1) > vector_bytes {
        SubStrategy::MultiRow
    } else if row * count(1) * count(0) > vector_bytes {
        SubStrategy::DepthSlab
    } else {
        SubStrategy::ManyPlane
    }
}

/// Layout of one tile inside its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileGeometry {
    planes: usize,
    origin: [usize; 3],
    extent: [usize; 3],
    row_stride: usize,
    window_start: [usize; 3],
    window: [usize; 3],
    window_row: usize,
}

impl TileGeometry {
    fn new(plan: &TilingPlan, tile: &TileCoord, window: &[std::ops::Range<i64>; 3]) -> Self {
        let extent = tile.extent();
        let mut window_start = [0usize; 3];
        let mut window_len = [0usize; 3];
        for i in 0..3 {
            window_start[i] = window[i].start.max(0) as usize;
            window_len[i] = (window[i].end - window[i].start).max(0) as usize;
        }
        Self {
            planes: tile.plane_count(),
            origin: tile.origin(),
            extent,
            row_stride: round_up(extent[2], plan.block_elems),
            window_start,
            window: window_len,
            window_row: round_up(window_len[2], plan.block_elems),
        }
    }

    fn acc_plane(&self) -> usize {
        self.extent[0] * self.extent[1] * self.row_stride
    }

    fn pooled_plane(&self) -> usize {
        self.window[0] * self.window[1] * self.window_row
    }

    /// Everything the lane program depends on; tiles differing only in position share it
    fn shape(&self) -> TileShape {
        TileShape {
            planes: self.planes,
            extent: self.extent,
            row_stride: self.row_stride,
            window: self.window,
            window_row: self.window_row,
        }
    }

    fn program(&self, strategy: SubStrategy, batch: [usize; 3]) -> LaneProgram {
        let [wd, wh, ww] = self.window;
        let d = LaneAxis::new(wd, batch[0], wh * self.window_row);
        let h = LaneAxis::new(wh, batch[1], self.window_row);
        let w = LaneAxis::new(ww, batch[2], 1);
        let plane_loop = LoopAxis::new(self.planes, self.pooled_plane(), self.acc_plane());
        let d_loop = LoopAxis::new(wd, wh * self.window_row, 0);
        let h_loop = LoopAxis::new(wh, self.window_row, 0);
        match strategy {
            SubStrategy::SingleRow => LaneProgram::new(&[w], &[plane_loop, d_loop, h_loop]),
            SubStrategy::MultiRow => LaneProgram::new(&[h, w], &[plane_loop, d_loop]),
            SubStrategy::DepthSlab => LaneProgram::new(&[d, h, w], &[plane_loop]),
            SubStrategy::ManyPlane => {
                let planes = LaneAxis::new(self.planes, 1, self.pooled_plane())
                    .with_dst_stride(self.acc_plane());
                LaneProgram::new(&[planes, d, h, w], &[])
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TileShape {
    planes: usize,
    extent: [usize; 3],
    row_stride: usize,
    window: [usize; 3],
    window_row: usize,
}

/// Tile stages over NCDHW gradient and argmax tensors.
pub struct VectorizedStages<'a, T: GradElement, I: ArgmaxIndex> {
    plan: &'a TilingPlan,
    grad: &'a [T],
    argmax: &'a [I],
    check_range: bool,
    /// One lane program per distinct tile shape, built before the pipeline starts
    programs: HashMap<TileShape, (SubStrategy, LaneProgram)>,
}

impl<'a, T: GradElement, I: ArgmaxIndex> VectorizedStages<'a, T, I> {
    pub fn new(plan: &'a TilingPlan, grad: &'a [T], argmax: &'a [I]) -> Result<Self> {
        let check_range = match plan.strategy {
            Strategy::Vectorized { check_range } => check_range,
            Strategy::Simt { layout } => {
                return Err(PoolGradError::UnsupportedLayout {
                    layout,
                    engine: "vectorized",
                });
            }
        };
        if plan.layout != Layout::Ncdhw {
            return Err(PoolGradError::UnsupportedLayout {
                layout: plan.layout,
                engine: "vectorized",
            });
        }
        check_len("grad", grad.len(), plan.pooled.numel())?;
        check_len("argmax", argmax.len(), plan.pooled.numel())?;

        let mut programs = HashMap::new();
        for tile in plan.tiles() {
            let window = plan.tile_pooled_window(&tile);
            if window.iter().any(|w| w.is_empty()) {
                continue;
            }
            let g = TileGeometry::new(plan, &tile, &window);
            programs.entry(g.shape()).or_insert_with(|| {
                let strategy = choose_sub_strategy(g.window, plan.batch, I::size_in_bytes(), plan.vector_bytes);
                (strategy, g.program(strategy, plan.batch))
            });
        }
        debug!(programs = programs.len(), tiles = plan.total_blocks, "lane programs built");
        Ok(Self {
            plan,
            grad,
            argmax,
            check_range,
            programs,
        })
    }

    /// Number of distinct lane programs the plan needs
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn geometry(&self, slot: &TileSlot<T, I>) -> Result<(TileCoord, TileGeometry)> {
        let tile = slot.tile()?.clone();
        let geometry = TileGeometry::new(self.plan, &tile, &slot.window);
        Ok((tile, geometry))
    }
}

fn check_len(tensor: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(PoolGradError::ShapeMismatch {
            tensor,
            expected: vec![expected],
            got: vec![got],
        });
    }
    Ok(())
}

impl<T: GradElement, I: ArgmaxIndex> TileStages for VectorizedStages<'_, T, I> {
    type Elem = T;
    type Index = I;
    type Stats = KernelStats;

    fn load(&self, slot: &mut TileSlot<T, I>) -> Result<()> {
        if slot.zero_fill {
            return Ok(());
        }
        let (tile, g) = self.geometry(slot)?;
        if g.planes * g.pooled_plane() > slot.grad.len() {
            return Err(PoolGradError::Pipeline {
                stage: "load",
                reason: format!("block {} does not fit its slot", tile.block),
            });
        }
        let pooled = &self.plan.pooled;
        let plane_volume = pooled.plane_volume();
        let [wd, wh, ww] = g.window;
        for (local, plane) in tile.planes.clone().enumerate() {
            for d in 0..wd {
                for h in 0..wh {
                    let src = plane * plane_volume
                        + ((g.window_start[0] + d) * pooled.h + g.window_start[1] + h) * pooled.w
                        + g.window_start[2];
                    let dst = local * g.pooled_plane() + (d * wh + h) * g.window_row;
                    slot.grad[dst..dst + ww].copy_from_slice(&self.grad[src..src + ww]);
                    slot.argmax[dst..dst + ww].copy_from_slice(&self.argmax[src..src + ww]);
                }
            }
        }
        Ok(())
    }

    fn compute(&self, slot: &mut TileSlot<T, I>, stats: &mut KernelStats) -> Result<()> {
        if slot.zero_fill {
            stats.record_zero_fill();
            trace!(block = slot.tile()?.block, "empty window, zero fill");
            return Ok(());
        }
        let (tile, g) = self.geometry(slot)?;
        let acc_len = g.planes * g.acc_plane();
        if acc_len > slot.accumulator.len() {
            return Err(PoolGradError::Pipeline {
                stage: "compute",
                reason: format!("block {} does not fit its accumulator", tile.block),
            });
        }

        let (strategy, program) = self.programs.get(&g.shape()).ok_or_else(|| PoolGradError::Pipeline {
            stage: "compute",
            reason: format!("no lane program for block {} with window {:?}", tile.block, g.window),
        })?;
        let strategy = *strategy;
        let frame = TileFrame {
            origin: g.origin.map(|x| x as i64),
            extent: g.extent.map(|x| x as i64),
            row_stride: g.row_stride as i64,
            input_h: self.plan.input.h as i64,
            input_w: self.plan.input.w as i64,
        };

        let acc = &mut slot.accumulator[..acc_len];
        acc.fill(Default::default());
        let mut unit = VectorUnit::new(
            &slot.grad,
            &slot.argmax,
            acc,
            frame,
            self.check_range,
            self.plan.lane_count,
            stats,
        );
        program.run(&mut unit);
        stats.record_tile(strategy);
        trace!(block = tile.block, ?strategy, window = ?g.window, "tile accumulated");
        Ok(())
    }

    fn store(&self, slot: &TileSlot<T, I>, output: &mut [T]) -> Result<()> {
        let (tile, g) = self.geometry(slot)?;
        let input = &self.plan.input;
        let plane_volume = input.plane_volume();
        let [ed, eh, ew] = g.extent;
        for (local, plane) in tile.planes.clone().enumerate() {
            for d in 0..ed {
                for h in 0..eh {
                    let dst = plane * plane_volume
                        + ((g.origin[0] + d) * input.h + g.origin[1] + h) * input.w
                        + g.origin[2];
                    let row = &mut output[dst..dst + ew];
                    if slot.zero_fill {
                        row.fill(<T as GradElement>::zero());
                        continue;
                    }
                    // Alignment padding past `ew` stays in the slot
                    let src = local * g.acc_plane() + (d * eh + h) * g.row_stride;
                    for (out, &acc) in row.iter_mut().zip(&slot.accumulator[src..src + ew]) {
                        *out = T::narrow(acc);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Runs a vectorized plan over flat NCDHW tensors and returns the flat gradient input.
pub fn execute<T: GradElement, I: ArgmaxIndex>(
    plan: &TilingPlan,
    grad: &[T],
    argmax: &[I],
) -> Result<(Vec<T>, ExecutionStats)> {
    let stages = VectorizedStages::new(plan, grad, argmax)?;
    let mut output = vec![<T as GradElement>::zero(); plan.input.numel()];
    let (pipeline, kernel) = Pipeline::default().run(plan, &stages, &mut output)?;
    Ok((
        output,
        ExecutionStats {
            kernel,
            pipeline: Some(pipeline),
        },
    ))
}
