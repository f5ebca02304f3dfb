// src/backend/memory/mod.rs
// Tile slot pool for the vectorized engine.
// Every core owns a fixed number of slots that circulate between the pipeline stages, so the
// scratch buffers are allocated once per core and reused for every tile it processes.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::backend::number::{ArgmaxIndex, GradElement};
use crate::error::{PoolGradError, Result};
use crate::ops::tiling::{BufferSizes, TileCoord};

/// Scratch buffers for one tile: the wide accumulator plus the loaded pooled sub-tensors.
#[derive(Debug)]
pub struct TileSlot<T: GradElement, I: ArgmaxIndex> {
    id: usize,
    uses: usize,
    pub tile: Option<TileCoord>,
    /// Pooled window loaded for the current tile, per D, H, W
    pub window: [Range<i64>; 3],
    /// Set by the load stage when the window is empty and the tile only needs zeros
    pub zero_fill: bool,
    pub accumulator: Vec<T::Acc>,
    pub grad: Vec<T>,
    pub argmax: Vec<I>,
}

impl<T: GradElement, I: ArgmaxIndex> TileSlot<T, I> {
    fn new(id: usize, sizes: &BufferSizes) -> Self {
        Self {
            id,
            uses: 0,
            tile: None,
            window: [0..0, 0..0, 0..0],
            zero_fill: false,
            accumulator: vec![<T::Acc as Default>::default(); sizes.accumulator],
            grad: vec![T::default(); sizes.grad],
            argmax: vec![I::default(); sizes.argmax],
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of tiles this slot has carried
    pub fn uses(&self) -> usize {
        self.uses
    }

    /// Binds the slot to a new tile and forgets the previous one
    pub fn assign(&mut self, tile: TileCoord, window: [Range<i64>; 3]) {
        self.zero_fill = window.iter().any(|w| w.is_empty());
        self.tile = Some(tile);
        self.window = window;
        self.uses += 1;
    }

    pub fn tile(&self) -> Result<&TileCoord> {
        self.tile.as_ref().ok_or_else(|| PoolGradError::Pipeline {
            stage: "slot",
            reason: format!("slot {} has no tile assigned", self.id),
        })
    }

    pub fn capacity(&self) -> BufferSizes {
        BufferSizes {
            accumulator: self.accumulator.len(),
            grad: self.grad.len(),
            argmax: self.argmax.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub allocations: usize,
    pub acquisitions: usize,
    /// Acquisitions served by a slot that already carried a tile
    pub reuses: usize,
    pub peak_in_flight: usize,
}

/// Fixed set of slots handed out in FIFO order.
/// `acquire` blocks until a slot is released once all of them are in flight.
#[derive(Debug)]
pub struct SlotPool<T: GradElement, I: ArgmaxIndex> {
    free_tx: Sender<TileSlot<T, I>>,
    free_rx: Receiver<TileSlot<T, I>>,
    capacity: usize,
    acquisitions: AtomicUsize,
    reuses: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl<T: GradElement, I: ArgmaxIndex> SlotPool<T, I> {
    pub fn new(sizes: BufferSizes, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = bounded(capacity);
        for id in 0..capacity {
            // Cannot fail: the channel has room for every slot and we hold the receiver
            let _ = free_tx.send(TileSlot::new(id, &sizes));
        }
        Self {
            free_tx,
            free_rx,
            capacity,
            acquisitions: AtomicUsize::new(0),
            reuses: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn acquire(&self) -> Result<TileSlot<T, I>> {
        let slot = self.free_rx.recv().map_err(|e| PoolGradError::Pipeline {
            stage: "acquire",
            reason: e.to_string(),
        })?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        if slot.uses > 0 {
            self.reuses.fetch_add(1, Ordering::Relaxed);
        }
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        Ok(slot)
    }

    pub fn release(&self, slot: TileSlot<T, I>) -> Result<()> {
        // Decrement first so a waiting acquire never observes more than `capacity` in flight
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.free_tx.send(slot).map_err(|e| PoolGradError::Pipeline {
            stage: "release",
            reason: e.to_string(),
        })
    }

    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            allocations: self.capacity,
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}
