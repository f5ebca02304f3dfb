// src/backend/pipeline.rs
// Double-buffered load -> compute -> store pipeline.
// Each used core gets a loader thread and a compute thread that pass tile slots along bounded
// channels. The store stage runs on the calling thread and is the only writer of the output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::bounded;
use tracing::{debug, trace};

use crate::backend::memory::{SlotPool, SlotStats, TileSlot};
use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::error::{PoolGradError, Result};
use crate::ops::tiling::{BUFFER_NUM, TilingPlan};

/// Statistics that can be combined across cores
pub trait MergeStats: Default + Send {
    fn merge(&mut self, other: &Self);
}

impl MergeStats for () {
    fn merge(&mut self, _other: &Self) {}
}

/// The three stages of one tile.
pub trait TileStages: Sync {
    type Elem: GradElement;
    type Index: ArgmaxIndex;
    type Stats: MergeStats;

    // Fill the slot with the pooled data for its assigned tile
    fn load(&self, slot: &mut TileSlot<Self::Elem, Self::Index>) -> Result<()>;

    // Turn the loaded slot into an accumulated tile
    fn compute(
        &self,
        slot: &mut TileSlot<Self::Elem, Self::Index>,
        stats: &mut Self::Stats,
    ) -> Result<()>;

    // Write the finished tile to the output tensor
    fn store(&self, slot: &TileSlot<Self::Elem, Self::Index>, output: &mut [Self::Elem])
    -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub cores: usize,
    pub tiles_loaded: usize,
    pub tiles_computed: usize,
    pub tiles_stored: usize,
    pub slots_allocated: usize,
    pub slot_reuses: usize,
    pub peak_slots_in_flight: usize,
}

impl PipelineStats {
    fn absorb(&mut self, slots: &SlotStats) {
        self.slots_allocated += slots.allocations;
        self.slot_reuses += slots.reuses;
        self.peak_slots_in_flight = self.peak_slots_in_flight.max(slots.peak_in_flight);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    slots_per_core: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            slots_per_core: BUFFER_NUM,
        }
    }
}

struct CoreReport<S> {
    loaded: usize,
    computed: usize,
    stats: S,
}

fn stage_error(stage: &'static str, reason: impl Into<String>) -> PoolGradError {
    PoolGradError::Pipeline {
        stage,
        reason: reason.into(),
    }
}

impl Pipeline {
    pub fn new(slots_per_core: usize) -> Self {
        Self {
            slots_per_core: slots_per_core.max(1),
        }
    }

    pub fn slots_per_core(&self) -> usize {
        self.slots_per_core
    }

    /// Runs every block of `plan` through the stages and writes the tiles into `output`.
    /// The first failing stage aborts the run and its error is returned once every thread
    /// has drained.
    pub fn run<S: TileStages>(
        &self,
        plan: &TilingPlan,
        stages: &S,
        output: &mut [S::Elem],
    ) -> Result<(PipelineStats, S::Stats)> {
        let mut stats = PipelineStats {
            cores: plan.used_cores,
            ..PipelineStats::default()
        };
        let mut kernel_stats = S::Stats::default();
        if plan.total_blocks == 0 {
            return Ok((stats, kernel_stats));
        }

        let pools: Vec<SlotPool<S::Elem, S::Index>> = (0..plan.used_cores)
            .map(|_| SlotPool::new(plan.buffers, self.slots_per_core))
            .collect();
        let abort = AtomicBool::new(false);
        let capacity = plan.used_cores * self.slots_per_core;
        let (store_tx, store_rx) = bounded::<(usize, TileSlot<S::Elem, S::Index>)>(capacity);

        let mut first_error: Option<PoolGradError> = None;
        let reports = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(plan.used_cores);
            for (core, pool) in pools.iter().enumerate() {
                let (compute_tx, compute_rx) = bounded::<TileSlot<S::Elem, S::Index>>(self.slots_per_core);
                let store_tx = store_tx.clone();
                let abort = &abort;

                let loader = scope.spawn(move || -> Result<usize> {
                    let mut loaded = 0;
                    for block in plan.core_blocks(core) {
                        if abort.load(Ordering::Acquire) {
                            break;
                        }
                        let mut slot = pool.acquire()?;
                        let tile = plan.tile(block);
                        let window = plan.tile_pooled_window(&tile);
                        slot.assign(tile, window);
                        if let Err(e) = stages.load(&mut slot) {
                            abort.store(true, Ordering::Release);
                            pool.release(slot)?;
                            return Err(e);
                        }
                        trace!(core, block, slot = slot.id(), "tile loaded");
                        loaded += 1;
                        if let Err(returned) = compute_tx.send(slot) {
                            pool.release(returned.into_inner())?;
                            break;
                        }
                    }
                    Ok(loaded)
                });

                let compute = scope.spawn(move || -> Result<CoreReport<S::Stats>> {
                    let mut report = CoreReport {
                        loaded: 0,
                        computed: 0,
                        stats: S::Stats::default(),
                    };
                    let mut failure = None;
                    for mut slot in compute_rx {
                        if failure.is_some() || abort.load(Ordering::Acquire) {
                            pool.release(slot)?;
                            continue;
                        }
                        match stages.compute(&mut slot, &mut report.stats) {
                            Ok(()) => {
                                report.computed += 1;
                                if let Err(returned) = store_tx.send((core, slot)) {
                                    pool.release(returned.into_inner().1)?;
                                }
                            }
                            Err(e) => {
                                abort.store(true, Ordering::Release);
                                pool.release(slot)?;
                                failure = Some(e);
                            }
                        }
                    }
                    match failure {
                        Some(e) => Err(e),
                        None => Ok(report),
                    }
                });
                handles.push((loader, compute));
            }
            drop(store_tx);

            // Store stage: single writer of the output slice
            for (core, slot) in store_rx.iter() {
                if first_error.is_none() && !abort.load(Ordering::Acquire) {
                    match stages.store(&slot, output) {
                        Ok(()) => stats.tiles_stored += 1,
                        Err(e) => {
                            abort.store(true, Ordering::Release);
                            first_error = Some(e);
                        }
                    }
                }
                if let Err(e) = pools[core].release(slot) {
                    abort.store(true, Ordering::Release);
                    first_error.get_or_insert(e);
                }
            }

            let mut reports = Vec::with_capacity(handles.len());
            for (loader, compute) in handles {
                let loaded = loader
                    .join()
                    .map_err(|_| stage_error("load", "loader thread panicked"))
                    .and_then(|r| r);
                let computed = compute
                    .join()
                    .map_err(|_| stage_error("compute", "compute thread panicked"))
                    .and_then(|r| r);
                reports.push(loaded.and_then(|loaded| {
                    computed.map(|mut report| {
                        report.loaded = loaded;
                        report
                    })
                }));
            }
            reports
        });

        for (core, report) in reports.into_iter().enumerate() {
            match report {
                Ok(report) => {
                    debug!(
                        core,
                        loaded = report.loaded,
                        computed = report.computed,
                        "core pipeline finished"
                    );
                    stats.tiles_loaded += report.loaded;
                    stats.tiles_computed += report.computed;
                    kernel_stats.merge(&report.stats);
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        for pool in &pools {
            stats.absorb(&pool.stats());
        }
        Ok((stats, kernel_stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::platform::PlatformInfo;
    use crate::ops::params::{Layout, PoolingParams};
    use crate::ops::tiling::TilingPlanner;
    use std::sync::atomic::AtomicUsize;

    /// Writes the block index into every element a tile covers.
    struct MarkTiles {
        plane_volume: usize,
        spatial: [usize; 3],
        fail_at: Option<usize>,
        computed: AtomicUsize,
    }

    #[derive(Debug, Default)]
    struct Count(usize);

    impl MergeStats for Count {
        fn merge(&mut self, other: &Self) {
            self.0 += other.0;
        }
    }

    impl TileStages for MarkTiles {
        type Elem = f32;
        type Index = i32;
        type Stats = Count;

        fn load(&self, slot: &mut TileSlot<f32, i32>) -> Result<()> {
            let block = slot.tile()?.block;
            slot.grad[0] = block as f32;
            Ok(())
        }

        fn compute(&self, slot: &mut TileSlot<f32, i32>, stats: &mut Count) -> Result<()> {
            let block = slot.tile()?.block;
            if Some(block) == self.fail_at {
                return Err(stage_error("compute", format!("block {}", block)));
            }
            // Load must be complete before compute sees the slot
            if slot.grad[0] != block as f32 {
                return Err(stage_error("compute", "slot seen before load finished"));
            }
            slot.accumulator[0] = slot.grad[0] + 1.0;
            stats.0 += 1;
            self.computed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn store(&self, slot: &TileSlot<f32, i32>, output: &mut [f32]) -> Result<()> {
            let tile = slot.tile()?;
            let [_, h, w] = self.spatial;
            for plane in tile.planes.clone() {
                for d in tile.input[0].clone() {
                    for y in tile.input[1].clone() {
                        for x in tile.input[2].clone() {
                            let idx = plane * self.plane_volume + (d * h + y) * w + x;
                            output[idx] += slot.accumulator[0];
                        }
                    }
                }
            }
            Ok(())
        }
    }

    fn plan(cores: usize) -> TilingPlan {
        let params = PoolingParams::new([1, 2, 2], [1, 2, 2], [0; 3]);
        TilingPlanner::new(PlatformInfo::new(cores, 196_608))
            .plan::<f32, i32>(&params, Layout::Ncdhw, &[1, 3, 8, 90, 160], &[1, 3, 8, 45, 80])
            .unwrap()
    }

    #[test]
    fn test_every_element_is_stored_exactly_once() {
        let plan = plan(4);
        let stages = MarkTiles {
            plane_volume: plan.input.plane_volume(),
            spatial: plan.input.spatial(),
            fail_at: None,
            computed: AtomicUsize::new(0),
        };
        let mut output = vec![0.0f32; plan.input.numel()];
        let (stats, count) = Pipeline::default().run(&plan, &stages, &mut output).unwrap();

        assert_eq!(stats.tiles_loaded, plan.total_blocks);
        assert_eq!(stats.tiles_computed, plan.total_blocks);
        assert_eq!(stats.tiles_stored, plan.total_blocks);
        assert_eq!(count.0, plan.total_blocks);
        assert_eq!(stats.slots_allocated, plan.used_cores * BUFFER_NUM);
        assert!(stats.peak_slots_in_flight <= BUFFER_NUM);
        for tile in plan.tiles() {
            let [_, h, w] = plan.input.spatial();
            let idx = tile.planes.start * plan.input.plane_volume()
                + (tile.input[0].start * h + tile.input[1].start) * w
                + tile.input[2].start;
            assert_eq!(output[idx], tile.block as f32 + 1.0);
        }
    }

    #[test]
    fn test_compute_failure_is_propagated() {
        let plan = plan(2);
        let stages = MarkTiles {
            plane_volume: plan.input.plane_volume(),
            spatial: plan.input.spatial(),
            fail_at: Some(1),
            computed: AtomicUsize::new(0),
        };
        let mut output = vec![0.0f32; plan.input.numel()];
        let err = Pipeline::default().run(&plan, &stages, &mut output).unwrap_err();
        assert!(matches!(err, PoolGradError::Pipeline { stage: "compute", .. }));
    }

    #[test]
    fn test_empty_plan_runs_nothing() {
        let params = PoolingParams::cubic(2, 2, 0);
        let plan = TilingPlanner::new(PlatformInfo::new(4, 196_608))
            .plan::<f32, i32>(&params, Layout::Ncdhw, &[0, 2, 4, 4, 4], &[0, 2, 2, 2, 2])
            .unwrap();
        let stages = MarkTiles {
            plane_volume: 64,
            spatial: [4, 4, 4],
            fail_at: None,
            computed: AtomicUsize::new(0),
        };
        let (stats, _) = Pipeline::default().run(&plan, &stages, &mut []).unwrap();
        assert_eq!(stats.tiles_stored, 0);
        assert_eq!(stages.computed.load(Ordering::Relaxed), 0);
    }
}
