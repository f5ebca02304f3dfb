// src/ops/kernels/lanes.rs
// Emulated vector unit used by the vectorized engine.
//
// A `LaneProgram` enumerates the pooled positions of one tile as vector operations. Positions
// that share a vector operation are at least one batch apart on a lane axis, so their windows
// never overlap and their accumulator addresses are distinct. `VectorUnit` executes one
// operation: gather, decode, mask, scatter-add.

use crate::backend::number::{Accumulator, ArgmaxIndex, GradElement};
use crate::ops::kernels::KernelStats;

/// Axis whose positions are spread across vector lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneAxis {
    pub len: usize,
    /// Distance between positions sharing an operation
    pub batch: usize,
    pub src_stride: usize,
    pub dst_stride: usize,
}

impl LaneAxis {
    pub fn new(len: usize, batch: usize, src_stride: usize) -> Self {
        Self {
            len,
            batch,
            src_stride,
            dst_stride: 0,
        }
    }

    pub fn with_dst_stride(mut self, dst_stride: usize) -> Self {
        self.dst_stride = dst_stride;
        self
    }

    pub fn spacing(&self) -> usize {
        self.batch.clamp(1, self.len.max(1))
    }

    /// Lane positions along this axis
    pub fn full(&self) -> usize {
        self.len / self.spacing()
    }

    pub fn tail(&self) -> usize {
        self.len % self.spacing()
    }

    fn segments(&self) -> Vec<Segment> {
        let pb = self.spacing();
        let full = self.full();
        let mut out = Vec::with_capacity(2);
        if full > 0 {
            out.push(Segment {
                lanes: full,
                step: pb,
                starts: (0, pb),
            });
        }
        if self.tail() > 0 {
            out.push(Segment {
                lanes: 1,
                step: 0,
                starts: (full * pb, self.len),
            });
        }
        out
    }
}

/// Axis walked by a scalar loop around the vector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopAxis {
    pub len: usize,
    pub src_stride: usize,
    pub dst_stride: usize,
}

impl LoopAxis {
    pub fn new(len: usize, src_stride: usize, dst_stride: usize) -> Self {
        Self {
            len,
            src_stride,
            dst_stride,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    lanes: usize,
    step: usize,
    starts: (usize, usize),
}

/// Base register plus the scalar starts it is replayed at.
#[derive(Debug, Clone)]
struct Combo {
    src_base: Vec<usize>,
    dst_base: Vec<usize>,
    starts: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct LaneProgram {
    combos: Vec<Combo>,
    loops: Vec<(usize, usize)>,
}

fn odometer(axes: &[(usize, usize, usize, usize)]) -> Vec<(usize, usize)> {
    // (first, end, src_stride, dst_stride)
    let mut out = vec![(0usize, 0usize)];
    for &(first, end, src_stride, dst_stride) in axes {
        let mut next = Vec::with_capacity(out.len() * end.saturating_sub(first));
        for &(s, d) in &out {
            for pos in first..end {
                next.push((s + pos * src_stride, d + pos * dst_stride));
            }
        }
        out = next;
    }
    out
}

impl LaneProgram {
    pub fn new(lane_axes: &[LaneAxis], loop_axes: &[LoopAxis]) -> Self {
        let segments: Vec<Vec<Segment>> = lane_axes.iter().map(|a| a.segments()).collect();
        let mut combos = Vec::new();
        if !segments.iter().any(|s| s.is_empty()) {
            let mut choice = vec![0usize; segments.len()];
            'combos: loop {
                combos.push(Self::combo(lane_axes, &segments, &choice));
                // Advance the full/tail choice, last axis fastest
                let mut axis = segments.len();
                loop {
                    if axis == 0 {
                        break 'combos;
                    }
                    axis -= 1;
                    choice[axis] += 1;
                    if choice[axis] < segments[axis].len() {
                        continue 'combos;
                    }
                    choice[axis] = 0;
                }
            }
        }
        let loop_spec: Vec<_> = loop_axes
            .iter()
            .map(|a| (0, a.len, a.src_stride, a.dst_stride))
            .collect();
        Self {
            combos,
            loops: odometer(&loop_spec),
        }
    }

    fn combo(axes: &[LaneAxis], segments: &[Vec<Segment>], choice: &[usize]) -> Combo {
        let mut base = vec![(0usize, 0usize)];
        let mut start_spec = Vec::with_capacity(axes.len());
        for (i, axis) in axes.iter().enumerate() {
            let seg = segments[i][choice[i]];
            let mut next = Vec::with_capacity(base.len() * seg.lanes);
            for &(s, d) in &base {
                for k in 0..seg.lanes {
                    next.push((
                        s + k * seg.step * axis.src_stride,
                        d + k * seg.step * axis.dst_stride,
                    ));
                }
            }
            base = next;
            start_spec.push((seg.starts.0, seg.starts.1, axis.src_stride, axis.dst_stride));
        }
        Combo {
            src_base: base.iter().map(|b| b.0).collect(),
            dst_base: base.iter().map(|b| b.1).collect(),
            starts: odometer(&start_spec),
        }
    }

    /// Visits every vector operation as (src lanes, dst lanes, src offset, dst offset).
    pub fn for_each_op(
        &self,
        lane_count: usize,
        mut op: impl FnMut(&[usize], &[usize], usize, usize),
    ) {
        let lane_count = lane_count.max(1);
        for &(loop_src, loop_dst) in &self.loops {
            for combo in &self.combos {
                for &(start_src, start_dst) in &combo.starts {
                    for (src, dst) in combo
                        .src_base
                        .chunks(lane_count)
                        .zip(combo.dst_base.chunks(lane_count))
                    {
                        op(src, dst, loop_src + start_src, loop_dst + start_dst);
                    }
                }
            }
        }
    }

    /// Lanes in the widest base register
    pub fn max_lanes(&self) -> usize {
        self.combos.iter().map(|c| c.src_base.len()).max().unwrap_or(0)
    }

    pub fn run<T: GradElement, I: ArgmaxIndex>(&self, unit: &mut VectorUnit<'_, T, I>) {
        let lane_count = unit.lane_count;
        self.for_each_op(lane_count, |src, dst, src_off, dst_off| {
            unit.scatter_add(src, dst, src_off, dst_off)
        });
    }
}

/// Where a tile sits in the input volume and how its accumulator is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFrame {
    pub origin: [i64; 3],
    pub extent: [i64; 3],
    /// Aligned width of one accumulator row
    pub row_stride: i64,
    pub input_h: i64,
    pub input_w: i64,
}

impl TileFrame {
    /// Decodes a flat argmax into tile-local (d, h, w)
    pub fn decode(&self, flat: i64) -> [i64; 3] {
        let hw = self.input_h * self.input_w;
        let rem = flat % hw;
        [
            flat / hw - self.origin[0],
            rem / self.input_w - self.origin[1],
            rem % self.input_w - self.origin[2],
        ]
    }

    pub fn contains(&self, local: [i64; 3]) -> bool {
        local
            .iter()
            .zip(self.extent)
            .all(|(&x, extent)| x >= 0 && x < extent)
    }

    pub fn offset(&self, local: [i64; 3]) -> i64 {
        (local[0] * self.extent[1] + local[1]) * self.row_stride + local[2]
    }
}

pub struct VectorUnit<'a, T: GradElement, I: ArgmaxIndex> {
    grad: &'a [T],
    argmax: &'a [I],
    acc: &'a mut [T::Acc],
    frame: TileFrame,
    check_range: bool,
    lane_count: usize,
    stats: &'a mut KernelStats,
    values: Vec<T::Acc>,
    addrs: Vec<Option<usize>>,
    sums: Vec<T::Acc>,
}

impl<'a, T: GradElement, I: ArgmaxIndex> VectorUnit<'a, T, I> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        grad: &'a [T],
        argmax: &'a [I],
        acc: &'a mut [T::Acc],
        frame: TileFrame,
        check_range: bool,
        lane_count: usize,
        stats: &'a mut KernelStats,
    ) -> Self {
        let lane_count = lane_count.max(1);
        Self {
            grad,
            argmax,
            acc,
            frame,
            check_range,
            lane_count,
            stats,
            values: Vec::with_capacity(lane_count),
            addrs: Vec::with_capacity(lane_count),
            sums: Vec::with_capacity(lane_count),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    fn address(&self, flat: i64, dst: usize) -> Option<usize> {
        // Negative records mark windows that saw no input
        if flat < 0 {
            return None;
        }
        let local = self.frame.decode(flat);
        if self.check_range && !self.frame.contains(local) {
            return None;
        }
        let addr = dst as i64 + self.frame.offset(local);
        // Unchecked lanes that land outside the buffer are dropped
        usize::try_from(addr).ok().filter(|&a| a < self.acc.len())
    }

    /// One vector operation over `src.len()` lanes.
    pub fn scatter_add(&mut self, src: &[usize], dst: &[usize], src_off: usize, dst_off: usize) {
        self.values.clear();
        self.addrs.clear();
        for (&s, &d) in src.iter().zip(dst) {
            let at = src_off + s;
            let flat = self.argmax[at].to_i64();
            self.values.push(self.grad[at].widen());
            let addr = self.address(flat, dst_off + d);
            self.addrs.push(addr);
        }

        // Read-modify-write: gather, add, scatter
        self.sums.clear();
        for (addr, &value) in self.addrs.iter().zip(&self.values) {
            let mut sum = addr.map(|a| self.acc[a]).unwrap_or_default();
            sum += value;
            self.sums.push(sum);
        }
        let mut active = 0;
        for (addr, &sum) in self.addrs.iter().zip(&self.sums) {
            if let Some(a) = *addr {
                self.acc[a] = sum;
                active += 1;
            }
        }

        self.stats.vector_ops += 1;
        self.stats.active_lanes += active;
        self.stats.masked_lanes += src.len() - active;
    }
}

/// Sum of an accumulator buffer, used by tests and debug output
pub fn accumulated_sum<A: Accumulator>(acc: &[A]) -> f64 {
    acc.iter().map(|a| a.to_f64()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_axis_segments() {
        let axis = LaneAxis::new(7, 4, 1);
        assert_eq!((axis.spacing(), axis.full(), axis.tail()), (4, 1, 3));
        let axis = LaneAxis::new(3, 8, 1);
        assert_eq!((axis.spacing(), axis.full(), axis.tail()), (3, 1, 0));
        let axis = LaneAxis::new(9, 2, 1);
        assert_eq!((axis.full(), axis.tail()), (4, 1));
    }

    #[test]
    fn test_program_visits_every_position_once() {
        let lanes = [LaneAxis::new(5, 2, 8), LaneAxis::new(7, 4, 1)];
        let loops = [LoopAxis::new(2, 64, 0)];
        let program = LaneProgram::new(&lanes, &loops);

        let mut seen: HashMap<usize, usize> = HashMap::new();
        program.for_each_op(3, |src, _, src_off, _| {
            assert!(src.len() <= 3);
            for &s in src {
                *seen.entry(src_off + s).or_default() += 1;
            }
        });
        assert_eq!(seen.len(), 2 * 5 * 7);
        for plane in 0..2 {
            for h in 0..5 {
                for w in 0..7 {
                    assert_eq!(seen.get(&(plane * 64 + h * 8 + w)), Some(&1));
                }
            }
        }
    }

    #[test]
    fn test_lanes_in_one_op_are_a_batch_apart() {
        let lanes = [LaneAxis::new(6, 2, 16), LaneAxis::new(9, 3, 1)];
        let program = LaneProgram::new(&lanes, &[]);
        program.for_each_op(64, |src, _, off, _| {
            let coords: Vec<(usize, usize)> =
                src.iter().map(|&s| ((off + s) / 16, (off + s) % 16)).collect();
            for (i, a) in coords.iter().enumerate() {
                for b in &coords[i + 1..] {
                    assert!(a.0.abs_diff(b.0) >= 2 || a.1.abs_diff(b.1) >= 3);
                }
            }
        });
    }

    #[test]
    fn test_plane_lanes_carry_destination_stride() {
        let lanes = [LaneAxis::new(3, 1, 100).with_dst_stride(40)];
        let program = LaneProgram::new(&lanes, &[]);
        let mut ops = Vec::new();
        program.for_each_op(8, |src, dst, _, _| ops.push((src.to_vec(), dst.to_vec())));
        assert_eq!(ops, vec![(vec![0, 100, 200], vec![0, 40, 80])]);
        assert_eq!(program.max_lanes(), 3);
    }

    #[test]
    fn test_empty_axis_yields_no_ops() {
        let program = LaneProgram::new(&[LaneAxis::new(0, 2, 1)], &[]);
        let mut count = 0;
        program.for_each_op(8, |_, _, _, _| count += 1);
        assert_eq!(count, 0);
    }

    fn frame() -> TileFrame {
        // Tile d 0..1, h 2..4, w 0..4 of an input 1 x 6 x 4, rows aligned to 8
        TileFrame {
            origin: [0, 2, 0],
            extent: [1, 2, 4],
            row_stride: 8,
            input_h: 6,
            input_w: 4,
        }
    }

    #[test]
    fn test_frame_decode() {
        let f = frame();
        assert_eq!(f.decode(2 * 4 + 3), [0, 0, 3]);
        assert_eq!(f.decode(3 * 4 + 1), [0, 1, 1]);
        assert!(f.contains([0, 1, 1]));
        assert!(!f.contains(f.decode(4 * 4)));
        assert_eq!(f.offset([0, 1, 1]), 9);
    }

    #[test]
    fn test_scatter_add_masks_out_of_tile_lanes() {
        let grad = [1.0f32, 2.0, 4.0, 8.0];
        // Two lanes land in the tile, one points above it and one below
        let argmax = [8i32, 13, 1, 17];
        let mut acc = vec![0.0f32; 16];
        let mut stats = KernelStats::default();
        {
            let mut unit = VectorUnit::<f32, i32>::new(&grad, &argmax, &mut acc, frame(), true, 4, &mut stats);
            unit.scatter_add(&[0, 1, 2, 3], &[0, 0, 0, 0], 0, 0);
        }
        assert_eq!(acc[0], 1.0);
        assert_eq!(acc[9], 2.0);
        assert_eq!(accumulated_sum(&acc), 3.0);
        assert_eq!(stats.vector_ops, 1);
        assert_eq!((stats.active_lanes, stats.masked_lanes), (2, 2));
    }

    #[test]
    fn test_unchecked_lanes_outside_buffer_are_dropped() {
        let grad = [1.0f64, 2.0];
        let argmax = [0i64, 9];
        let mut acc = vec![0.0f64; 16];
        let mut stats = KernelStats::default();
        {
            let mut unit = VectorUnit::<f64, i64>::new(&grad, &argmax, &mut acc, frame(), false, 4, &mut stats);
            unit.scatter_add(&[0, 1], &[0, 0], 0, 0);
        }
        // Flat 0 decodes to h = -2: address -16 is dropped, flat 9 lands at row 0 column 1
        assert_eq!(acc[1], 2.0);
        assert_eq!(stats.masked_lanes, 1);
    }

    #[test]
    fn test_program_run_accumulates_all_lanes() {
        // Pooled 2 x 2 window whose argmax all point into a 1 x 2 x 4 tile
        let grad = [1.0f32, 1.0, 1.0, 1.0];
        let argmax = [8i32, 9, 13, 8];
        let mut acc = vec![0.0f32; 16];
        let mut stats = KernelStats::default();
        let program = LaneProgram::new(&[LaneAxis::new(2, 1, 2), LaneAxis::new(2, 2, 1)], &[]);
        {
            let mut unit = VectorUnit::<f32, i32>::new(&grad, &argmax, &mut acc, frame(), true, 64, &mut stats);
            program.run(&mut unit);
        }
        assert_eq!(acc[0], 2.0);
        assert_eq!(acc[1], 1.0);
        assert_eq!(acc[9], 1.0);
        assert_eq!(stats.active_lanes, 4);
    }
}
