//! 软件模拟的图形后端
//!
//! 不依赖任何图形驱动，所有平台可用：
//! - `execution`：按提交顺序退休的队列时间线与 fence
//! - `device`：`GpuDevice` 实现
//! - `swap_chain`：模拟交换链

pub mod device;
pub mod execution;
pub mod swap_chain;

pub use device::{HeadlessDevice, HeadlessOptions, HeadlessResource, RecordedCommand};
pub use execution::{CompletionMode, GpuController};
