pub mod memory;
pub mod number;
pub mod pipeline;
pub mod platform;

pub use memory::{SlotPool, SlotStats, TileSlot};
pub use number::{Accumulator, ArgmaxIndex, DType, GradElement};
pub use pipeline::{Pipeline, PipelineStats, TileStages};
pub use platform::PlatformInfo;
