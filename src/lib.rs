//! gpu_frame_core - 帧流水线化的 GPU 命令与资源管理核心
//!
//! 以三帧缓冲的方式把 CPU 录制与 GPU 执行重叠起来，并保证任何仍被
//! 在飞帧引用的资源或描述符都不会被提前销毁或复用。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志和错误处理
//! - `gfx`: `GpuDevice` 抽象以及 headless / DX12 后端
//! - `renderer`: fence 同步、帧命令单元、描述符堆、延迟释放和设备核心
//!
//! # 使用示例
//!
//! ```no_run
//! use gpu_frame_core::core::Config;
//! use gpu_frame_core::gfx::SurfaceTarget;
//! use gpu_frame_core::renderer::Renderer;
//!
//! let config = Config::from_file_or_default("config.toml");
//! let mut renderer = Renderer::new(&config, SurfaceTarget::Offscreen)?;
//! renderer.render_frame()?;
//! renderer.shutdown()?;
//! # Ok::<(), gpu_frame_core::core::CoreError>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
