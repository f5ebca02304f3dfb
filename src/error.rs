// src/error.rs
use thiserror::Error;

use crate::backend::number::DType;
use crate::ops::params::Layout;

/// Errors raised while validating, planning or executing a pooling gradient.
/// Every variant is fatal for the invocation: nothing is retried and no partial output escapes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolGradError {
    #[error("Expected a rank 4 or rank 5 tensor for '{tensor}', got rank {rank} (shape {shape:?})")]
    InvalidRank {
        tensor: &'static str,
        rank: usize,
        shape: Vec<usize>,
    },

    #[error("Kernel size on axis '{axis}' must be greater than 0, got {value}")]
    InvalidKernel { axis: &'static str, value: i64 },

    #[error("Stride on axis '{axis}' must be greater than 0, got {value}")]
    InvalidStride { axis: &'static str, value: i64 },

    #[error("Dilation on axis '{axis}' must be greater than 0, got {value}")]
    InvalidDilation { axis: &'static str, value: i64 },

    #[error(
        "Padding on axis '{axis}' must lie in [0, {limit}] (half of the kernel size), got {value}"
    )]
    InvalidPadding {
        axis: &'static str,
        value: i64,
        limit: i64,
    },

    #[error("Shape mismatch for '{tensor}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unsupported dtype {dtype} for '{tensor}'")]
    UnsupportedDtype { tensor: &'static str, dtype: DType },

    #[error("Layout {layout} is not supported by the {engine} engine")]
    UnsupportedLayout {
        layout: Layout,
        engine: &'static str,
    },

    #[error(
        "Minimum tile needs {required_bytes} bytes of scratch memory but only {available_bytes} are available"
    )]
    WorkingSetTooLarge {
        required_bytes: usize,
        available_bytes: usize,
    },

    #[error("Pipeline stage '{stage}' failed: {reason}")]
    Pipeline { stage: &'static str, reason: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    Config { key: String, reason: String },

    #[error("Array shape error: {0}")]
    Shape(String),
}

impl From<ndarray::ShapeError> for PoolGradError {
    fn from(err: ndarray::ShapeError) -> Self {
        PoolGradError::Shape(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolGradError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_axis() {
        let err = PoolGradError::InvalidStride {
            axis: "h",
            value: 0,
        };
        assert_eq!(
            err.to_string(),
            "Stride on axis 'h' must be greater than 0, got 0"
        );

        let err = PoolGradError::WorkingSetTooLarge {
            required_bytes: 4096,
            available_bytes: 1024,
        };
        assert!(err.to_string().contains("4096"));
    }

    #[test]
    fn test_shape_error_conversion() {
        let shape_err = ndarray::Array::from_shape_vec((2, 2), vec![1.0f32; 3]).unwrap_err();
        let err: PoolGradError = shape_err.into();
        assert!(matches!(err, PoolGradError::Shape(_)));
    }
}
