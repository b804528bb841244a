//! 图形后端模块
//!
//! - `backend`：核心与图形 API 之间的 `GpuDevice` 抽象
//! - `headless`：软件模拟的设备，所有平台可用
//! - `dx12`：DirectX 12 实现（仅 Windows）

pub mod backend;
#[cfg(target_os = "windows")]
pub mod dx12;
pub mod headless;

pub use backend::{GpuDevice, GpuFence, SurfaceTarget};
