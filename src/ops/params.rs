// src/ops/params.rs
// Resolved tensor descriptors and pooling attributes handed to the gradient engine.

use serde::{Deserialize, Serialize};

use crate::backend::number::DType;
use crate::error::{PoolGradError, Result};

/// Memory order of the 5-D tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// Channel-first: N, C, D, H, W
    #[default]
    Ncdhw,
    /// Channel-last: N, D, H, W, C
    Ndhwc,
}

impl Layout {
    pub fn is_channel_last(&self) -> bool {
        matches!(self, Layout::Ndhwc)
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Ncdhw => write!(f, "NCDHW"),
            Layout::Ndhwc => write!(f, "NDHWC"),
        }
    }
}

/// Logical extents of a pooling tensor independent of its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeDims {
    pub n: usize,
    pub c: usize,
    pub d: usize,
    pub h: usize,
    pub w: usize,
}

impl VolumeDims {
    pub fn new(n: usize, c: usize, d: usize, h: usize, w: usize) -> Self {
        Self { n, c, d, h, w }
    }

    /// Combined batch x channel count
    pub fn planes(&self) -> usize {
        self.n * self.c
    }

    pub fn plane_volume(&self) -> usize {
        self.d * self.h * self.w
    }

    pub fn spatial(&self) -> [usize; 3] {
        [self.d, self.h, self.w]
    }

    pub fn numel(&self) -> usize {
        self.planes() * self.plane_volume()
    }

    pub fn with_spatial(&self, spatial: [usize; 3]) -> Self {
        Self::new(self.n, self.c, spatial[0], spatial[1], spatial[2])
    }

    /// Physical shape for a layout, rank 4 drops the depth axis
    pub fn to_shape(&self, layout: Layout, rank: usize) -> Vec<usize> {
        match (layout, rank) {
            (Layout::Ncdhw, 4) => vec![self.n, self.c, self.h, self.w],
            (Layout::Ndhwc, 4) => vec![self.n, self.h, self.w, self.c],
            (Layout::Ncdhw, _) => vec![self.n, self.c, self.d, self.h, self.w],
            (Layout::Ndhwc, _) => vec![self.n, self.d, self.h, self.w, self.c],
        }
    }

    pub fn from_shape(tensor: &'static str, shape: &[usize], layout: Layout) -> Result<Self> {
        let dims = match (layout, shape) {
            (Layout::Ncdhw, [n, c, d, h, w]) => Self::new(*n, *c, *d, *h, *w),
            (Layout::Ncdhw, [n, c, h, w]) => Self::new(*n, *c, 1, *h, *w),
            (Layout::Ndhwc, [n, d, h, w, c]) => Self::new(*n, *c, *d, *h, *w),
            (Layout::Ndhwc, [n, h, w, c]) => Self::new(*n, *c, 1, *h, *w),
            _ => {
                return Err(PoolGradError::InvalidRank {
                    tensor,
                    rank: shape.len(),
                    shape: shape.to_vec(),
                });
            }
        };
        Ok(dims)
    }
}

/// Shape, dtype and layout of one operand, fixed for a whole invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    shape: Vec<usize>,
    pub dtype: DType,
    pub layout: Layout,
    /// Resolved once from `shape` and `layout`
    dims: VolumeDims,
}

impl TensorDescriptor {
    /// Rejects ranks other than 4 and 5
    pub fn new(shape: &[usize], dtype: DType, layout: Layout) -> Result<Self> {
        let dims = VolumeDims::from_shape("tensor", shape, layout)?;
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            layout,
            dims,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dims(&self) -> VolumeDims {
        self.dims
    }
}

/// Kernel, stride, padding and dilation along one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisParams {
    pub kernel: i64,
    pub stride: i64,
    pub pad: i64,
    pub dilation: i64,
}

impl AxisParams {
    pub fn new(kernel: i64, stride: i64, pad: i64) -> Self {
        Self {
            kernel,
            stride,
            pad,
            dilation: 1,
        }
    }

    /// Axis that leaves its extent untouched
    pub fn identity() -> Self {
        Self::new(1, 1, 0)
    }

    pub fn with_dilation(mut self, dilation: i64) -> Self {
        self.dilation = dilation;
        self
    }

    /// Span covered by one dilated window
    pub fn effective_kernel(&self) -> i64 {
        (self.kernel - 1) * self.dilation + 1
    }

    /// Number of pooled positions along this axis for an input extent
    pub fn pooled_size(&self, input_len: i64, ceil_mode: bool) -> i64 {
        if self.stride <= 0 {
            return 0;
        }
        let round_up = if ceil_mode { self.stride - 1 } else { 0 };
        let span = input_len + 2 * self.pad - self.effective_kernel() + round_up;
        if span < 0 {
            return 0;
        }
        let mut out = span / self.stride + 1;
        // The last window has to start inside the input or the left padding
        if ceil_mode && (out - 1) * self.stride >= input_len + self.pad {
            out -= 1;
        }
        out
    }

    fn validate(&self, axis: &'static str) -> Result<()> {
        if self.kernel <= 0 {
            return Err(PoolGradError::InvalidKernel {
                axis,
                value: self.kernel,
            });
        }
        if self.stride <= 0 {
            return Err(PoolGradError::InvalidStride {
                axis,
                value: self.stride,
            });
        }
        if self.dilation <= 0 {
            return Err(PoolGradError::InvalidDilation {
                axis,
                value: self.dilation,
            });
        }
        // Bounded by the raw kernel, dilation does not widen the allowed padding
        let limit = self.kernel / 2;
        if self.pad < 0 || self.pad > limit {
            return Err(PoolGradError::InvalidPadding {
                axis,
                value: self.pad,
                limit,
            });
        }
        Ok(())
    }
}

pub const AXIS_NAMES: [&str; 3] = ["d", "h", "w"];

/// Expands an empty, single or pair attribute list to height and width values
fn broadcast_hw(key: &str, values: &[i64], empty: [i64; 2]) -> Result<[i64; 2]> {
    match values {
        [] => Ok(empty),
        [v] => Ok([*v, *v]),
        [h, w] => Ok([*h, *w]),
        _ => Err(list_len_error(key, values.len(), "zero, one or two")),
    }
}

fn list_len_error(key: &str, len: usize, allowed: &str) -> PoolGradError {
    PoolGradError::Config {
        key: key.to_string(),
        reason: format!("2-D attribute list must have {allowed} entries, got {len}"),
    }
}

/// Pooling attributes for the depth, height and width axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolingParams {
    pub d: AxisParams,
    pub h: AxisParams,
    pub w: AxisParams,
    pub ceil_mode: bool,
}

impl PoolingParams {
    pub fn new(kernel: [i64; 3], stride: [i64; 3], pad: [i64; 3]) -> Self {
        Self {
            d: AxisParams::new(kernel[0], stride[0], pad[0]),
            h: AxisParams::new(kernel[1], stride[1], pad[1]),
            w: AxisParams::new(kernel[2], stride[2], pad[2]),
            ceil_mode: false,
        }
    }

    /// Same kernel, stride and padding on every axis
    pub fn cubic(kernel: i64, stride: i64, pad: i64) -> Self {
        Self::new([kernel; 3], [stride; 3], [pad; 3])
    }

    /// 2-D pooling expressed as a depth-1 volume
    pub fn pool2d(kernel: [i64; 2], stride: [i64; 2], pad: [i64; 2]) -> Self {
        Self {
            d: AxisParams::identity(),
            h: AxisParams::new(kernel[0], stride[0], pad[0]),
            w: AxisParams::new(kernel[1], stride[1], pad[1]),
            ceil_mode: false,
        }
    }

    /// 2-D attributes from attribute lists of one or two entries.
    ///
    /// A single entry applies to both height and width. An empty stride means stride equals
    /// kernel, an empty padding means zero padding and an empty dilation means no dilation.
    pub fn pool2d_from_lists(kernel: &[i64], stride: &[i64], pad: &[i64], dilation: &[i64]) -> Result<Self> {
        let kernel = match kernel {
            [k] => [*k, *k],
            [kh, kw] => [*kh, *kw],
            _ => return Err(list_len_error("kernel", kernel.len(), "one or two")),
        };
        let stride = broadcast_hw("stride", stride, kernel)?;
        let pad = broadcast_hw("pad", pad, [0, 0])?;
        let dilation = broadcast_hw("dilation", dilation, [1, 1])?;
        Ok(Self::pool2d(kernel, stride, pad).with_dilation([1, dilation[0], dilation[1]]))
    }

    pub fn with_dilation(mut self, dilation: [i64; 3]) -> Self {
        self.d.dilation = dilation[0];
        self.h.dilation = dilation[1];
        self.w.dilation = dilation[2];
        self
    }

    pub fn with_ceil_mode(mut self, ceil_mode: bool) -> Self {
        self.ceil_mode = ceil_mode;
        self
    }

    pub fn axes(&self) -> [AxisParams; 3] {
        [self.d, self.h, self.w]
    }

    pub fn validate(&self) -> Result<()> {
        for (axis, params) in AXIS_NAMES.iter().zip(self.axes()) {
            params.validate(axis)?;
        }
        Ok(())
    }

    pub fn has_dilation(&self) -> bool {
        self.axes().iter().any(|a| a.dilation > 1)
    }

    /// Pooled D, H, W for the given input extents
    pub fn pooled_spatial(&self, input: [usize; 3]) -> [usize; 3] {
        let mut out = [0usize; 3];
        for (i, axis) in self.axes().iter().enumerate() {
            out[i] = axis.pooled_size(input[i] as i64, self.ceil_mode).max(0) as usize;
        }
        out
    }

    /// Checks attributes and operand shapes, returning the input and pooled extents
    pub fn validate_shapes(
        &self,
        input_shape: &[usize],
        grad_shape: &[usize],
        argmax_shape: &[usize],
        layout: Layout,
    ) -> Result<(VolumeDims, VolumeDims)> {
        self.validate()?;
        let input = VolumeDims::from_shape("input", input_shape, layout)?;
        let pooled = VolumeDims::from_shape("grad", grad_shape, layout)?;
        VolumeDims::from_shape("argmax", argmax_shape, layout)?;

        if grad_shape != argmax_shape {
            return Err(PoolGradError::ShapeMismatch {
                tensor: "argmax",
                expected: grad_shape.to_vec(),
                got: argmax_shape.to_vec(),
            });
        }
        if grad_shape.len() != input_shape.len() {
            return Err(PoolGradError::ShapeMismatch {
                tensor: "grad",
                expected: input_shape.to_vec(),
                got: grad_shape.to_vec(),
            });
        }
        if input.c == 0 || input.d == 0 || input.h == 0 || input.w == 0 {
            return Err(PoolGradError::ShapeMismatch {
                tensor: "input",
                expected: vec![input.n, input.c.max(1), input.d.max(1), input.h.max(1), input.w.max(1)],
                got: input_shape.to_vec(),
            });
        }

        let expected = input.with_spatial(self.pooled_spatial(input.spatial()));
        if expected.spatial().contains(&0) || expected != pooled {
            return Err(PoolGradError::ShapeMismatch {
                tensor: "grad",
                expected: expected.to_shape(layout, grad_shape.len()),
                got: grad_shape.to_vec(),
            });
        }
        Ok((input, pooled))
    }
}
