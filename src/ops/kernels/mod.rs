// src/ops/kernels/mod.rs
// Execution engines for the max-pool gradient. Both engines share the window math in
// `ops::window` and produce the same result for a given plan.

pub mod lanes;
pub mod simt;
pub mod vectorized;

use serde::{Deserialize, Serialize};

use crate::backend::pipeline::{MergeStats, PipelineStats};

/// Batching mode of the vectorized engine for one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubStrategy {
    /// Lanes run along one pooled row
    SingleRow,
    /// Lanes span height x width
    MultiRow,
    /// Lanes span depth x height x width
    DepthSlab,
    /// Lanes span several planes at once
    ManyPlane,
}

impl SubStrategy {
    pub const ALL: [SubStrategy; 4] = [
        SubStrategy::SingleRow,
        SubStrategy::MultiRow,
        SubStrategy::DepthSlab,
        SubStrategy::ManyPlane,
    ];

    fn slot(self) -> usize {
        match self {
            SubStrategy::SingleRow => 0,
            SubStrategy::MultiRow => 1,
            SubStrategy::DepthSlab => 2,
            SubStrategy::ManyPlane => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelStats {
    pub tiles: usize,
    pub zero_filled_tiles: usize,
    /// Tiles per sub-strategy, indexed like `SubStrategy::ALL`
    pub sub_strategy_tiles: [usize; 4],
    pub vector_ops: usize,
    pub active_lanes: usize,
    pub masked_lanes: usize,
    /// Input elements visited by the SIMT engine
    pub threads: usize,
}

impl KernelStats {
    pub fn record_tile(&mut self, strategy: SubStrategy) {
        self.tiles += 1;
        self.sub_strategy_tiles[strategy.slot()] += 1;
    }

    pub fn record_zero_fill(&mut self) {
        self.tiles += 1;
        self.zero_filled_tiles += 1;
    }

    pub fn tiles_with(&self, strategy: SubStrategy) -> usize {
        self.sub_strategy_tiles[strategy.slot()]
    }
}

impl MergeStats for KernelStats {
    fn merge(&mut self, other: &Self) {
        self.tiles += other.tiles;
        self.zero_filled_tiles += other.zero_filled_tiles;
        for (a, b) in self.sub_strategy_tiles.iter_mut().zip(other.sub_strategy_tiles) {
            *a += b;
        }
        self.vector_ops += other.vector_ops;
        self.active_lanes += other.active_lanes;
        self.masked_lanes += other.masked_lanes;
        self.threads += other.threads;
    }
}

/// Counters reported with every gradient result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub kernel: KernelStats,
    /// Only filled by the vectorized engine
    pub pipeline: Option<PipelineStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_merge() {
        let mut a = KernelStats::default();
        a.record_tile(SubStrategy::SingleRow);
        a.vector_ops = 3;
        let mut b = KernelStats::default();
        b.record_tile(SubStrategy::ManyPlane);
        b.record_zero_fill();
        b.masked_lanes = 2;
        a.merge(&b);
        assert_eq!(a.tiles, 3);
        assert_eq!(a.zero_filled_tiles, 1);
        assert_eq!(a.tiles_with(SubStrategy::SingleRow), 1);
        assert_eq!(a.tiles_with(SubStrategy::ManyPlane), 1);
        assert_eq!(a.tiles_with(SubStrategy::DepthSlab), 0);
        assert_eq!((a.vector_ops, a.masked_lanes), (3, 2));
    }
}
