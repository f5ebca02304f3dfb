// src/backend/number.rs
// Element traits for the pooling gradient kernels.
// Gradients are accumulated in a wider float and narrowed once per tile, argmax records are
// integers that get widened to i64 before any index math.

use half::{bf16, f16};
use rand_distr::num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::ops::AddAssign;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    Float16,
    BFloat16,
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Float16 | DType::BFloat16 => 2,
            DType::Float32 | DType::Int32 => 4,
            DType::Float64 | DType::Int64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DType::Float16 | DType::BFloat16 | DType::Float32 | DType::Float64
        )
    }
}

impl Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::Float16 => "float16",
            DType::BFloat16 => "bfloat16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
        };
        write!(f, "{}", name)
    }
}

/// Wide accumulator used while scatter-adding gradients inside a tile.
pub trait Accumulator:
    Copy + Send + Sync + Debug + Default + PartialEq + Zero + AddAssign + 'static
{
    fn to_f64(self) -> f64;
}

impl Accumulator for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Accumulator for f64 {
    fn to_f64(self) -> f64 {
        self
    }
}

/// Floating point element type of the gradient tensors.
/// `widen` promotes into the accumulator, `narrow` rounds back to nearest-even.
pub trait GradElement:
    Copy + Send + Sync + Debug + Display + Default + PartialOrd + 'static
{
    type Acc: Accumulator;

    const DTYPE: DType;

    /// Promote into the accumulation type
    fn widen(self) -> Self::Acc;

    /// Convert an accumulated value back into the element type
    fn narrow(acc: Self::Acc) -> Self;

    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;

    fn zero() -> Self {
        Self::narrow(<Self::Acc as Zero>::zero())
    }

    fn is_nan(self) -> bool {
        self.to_f64().is_nan()
    }

    fn size_in_bytes() -> usize {
        Self::DTYPE.size_in_bytes()
    }
}

impl GradElement for f32 {
    type Acc = f32;
    const DTYPE: DType = DType::Float32;

    fn widen(self) -> f32 {
        self
    }

    fn narrow(acc: f32) -> Self {
        acc
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl GradElement for f64 {
    type Acc = f64;
    const DTYPE: DType = DType::Float64;

    fn widen(self) -> f64 {
        self
    }

    fn narrow(acc: f64) -> Self {
        acc
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }
}

impl GradElement for f16 {
    type Acc = f32;
    const DTYPE: DType = DType::Float16;

    fn widen(self) -> f32 {
        self.to_f32()
    }

    fn narrow(acc: f32) -> Self {
        f16::from_f32(acc)
    }

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl GradElement for bf16 {
    type Acc = f32;
    const DTYPE: DType = DType::BFloat16;

    fn widen(self) -> f32 {
        self.to_f32()
    }

    fn narrow(acc: f32) -> Self {
        bf16::from_f32(acc)
    }

    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    fn from_f64(value: f64) -> Self {
        bf16::from_f64(value)
    }
}

/// Integer type of the recorded forward argmax.
pub trait ArgmaxIndex: Copy + Send + Sync + Debug + Default + PartialEq + 'static {
    const DTYPE: DType;

    fn to_i64(self) -> i64;

    /// Fails when the value does not fit in the index type
    fn from_i64(value: i64) -> Option<Self>;

    fn size_in_bytes() -> usize {
        Self::DTYPE.size_in_bytes()
    }
}

impl ArgmaxIndex for i32 {
    const DTYPE: DType = DType::Int32;

    fn to_i64(self) -> i64 {
        self as i64
    }

    fn from_i64(value: i64) -> Option<Self> {
        i32::try_from(value).ok()
    }
}

impl ArgmaxIndex for i64 {
    const DTYPE: DType = DType::Int64;

    fn to_i64(self) -> i64 {
        self
    }

    fn from_i64(value: i64) -> Option<Self> {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::Float16.size_in_bytes(), 2);
        assert_eq!(DType::BFloat16.size_in_bytes(), 2);
        assert_eq!(DType::Float32.size_in_bytes(), 4);
        assert_eq!(DType::Int64.size_in_bytes(), 8);
        assert!(DType::BFloat16.is_float());
        assert!(!DType::Int32.is_float());
        assert_eq!(DType::Int32.to_string(), "int32");
    }

    #[test]
    fn test_half_precision_accumulates_in_f32() {
        // 2048 + 1 is not representable in f16, the wide accumulator keeps it until narrowing
        let mut acc = f16::from_f32(2048.0).widen();
        acc += f16::from_f32(1.0).widen();
        acc += f16::from_f32(1.0).widen();
        assert_eq!(acc, 2050.0);
        assert_eq!(f16::narrow(acc), f16::from_f32(2050.0));
    }

    #[test]
    fn test_narrow_rounds_to_nearest_even() {
        // 2049 sits exactly between 2048 and 2050 in f16
        assert_eq!(f16::narrow(2049.0), f16::from_f32(2048.0));
        assert_eq!(f16::narrow(2051.0), f16::from_f32(2052.0));
    }

    #[test]
    fn test_index_conversions() {
        assert_eq!(i32::from_i64(17), Some(17));
        assert_eq!(i32::from_i64(i64::MAX), None);
        assert_eq!(<i64 as ArgmaxIndex>::to_i64(-3), -3);
        assert_eq!(<f32 as GradElement>::zero(), 0.0);
        assert_eq!(<bf16 as GradElement>::zero(), bf16::ZERO);
    }
}
