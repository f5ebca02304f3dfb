//! # Ferrox Poolgrad
//!
//! Backward pass of 3-D max pooling for CPU tensors, driven by the argmax recorded in the
//! forward pass.
//!
//! ## Features
//!
//! - Tiling planner that splits the work across cores under a per-core scratch budget
//! - Vectorized scatter-add engine with double-buffered load, compute and store stages
//! - Thread-per-element engine for channel-last, dilated or very sparse pooling
//! - f16, bf16, f32 and f64 gradients with i32 or i64 argmax records
//! - Written 100% in safe Rust
//!
//! ```
//! use ferrox_poolgrad::{max_pool3d_grad_with_argmax, max_pool3d_with_argmax, Layout, PoolingParams};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let params = PoolingParams::cubic(2, 2, 0);
//! let x = ArrayD::from_shape_fn(IxDyn(&[1, 1, 4, 4, 4]), |i| (i[2] * 16 + i[3] * 4 + i[4]) as f32);
//! let (pooled, argmax) = max_pool3d_with_argmax::<f32, i32>(x.view(), &params, Layout::Ncdhw).unwrap();
//! let grad = ArrayD::from_elem(pooled.raw_dim(), 1.0f32);
//! let dx = max_pool3d_grad_with_argmax(grad.view(), argmax.view(), &[1, 1, 4, 4, 4], &params).unwrap();
//! assert_eq!(dx.sum(), 8.0);
//! ```
pub mod backend;
pub mod error;
pub mod initializers;
pub mod ops;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use backend::{DType, GradElement, ArgmaxIndex, PlatformInfo};
pub use error::{PoolGradError, Result};
pub use ops::kernels::{ExecutionStats, KernelStats, SubStrategy};
pub use ops::params::{AxisParams, Layout, PoolingParams, TensorDescriptor, VolumeDims};
pub use ops::pooling::max_pool3d_with_argmax;
pub use ops::tiling::{PlannerConfig, Strategy, StrategyKind, TilingPlan, TilingPlanner};
pub use ops::{GradResult, MaxPool3dGrad, max_pool2d_grad_with_argmax, max_pool3d_grad_with_argmax};
