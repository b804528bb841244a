//! 渲染器模块
//!
//! 本模块是与图形 API 无关的帧管线核心：
//!
//! - `sync`：fence 同步器和帧时间线
//! - `command`：帧命令单元，驱动每帧的录制、提交和槽位轮转
//! - `descriptor`：带延迟释放的描述符槽位堆
//! - `deferred`：延迟释放队列和自动延迟释放的资源句柄
//! - `device`：设备核心，组合以上所有部分
//!
//! # 架构设计
//!
//! - `Renderer`：对应用层提供统一接口
//! - `Backend`：内部枚举，持有某个后端上的 `DeviceCore`
//! - 具体图形 API 在 `gfx` 模块中实现 `GpuDevice`

use std::sync::Arc;

use tracing::info;

use crate::core::config::GraphicsBackend;
use crate::core::error::Result;
use crate::core::Config;
#[cfg(target_os = "windows")]
use crate::gfx::dx12::{Dx12Device, Dx12Options};
use crate::gfx::backend::{SurfaceTarget, VideoMemoryInfo};
use crate::gfx::headless::{HeadlessDevice, HeadlessOptions};

pub mod command;
pub mod deferred;
pub mod descriptor;
pub mod device;
pub mod sync;

pub use deferred::{DeferredReleaser, GpuResource};
pub use descriptor::{DescriptorHandle, DescriptorHeapStats, DescriptorHeapType, DescriptorSlotHeap};
pub use device::{DeviceCore, DeviceCoreDesc, FrameRecorder};
pub use sync::Submission;

/// 同时在飞的帧数
pub const FRAME_BUFFER_COUNT: usize = 3;

/// 图形后端枚举
///
/// 通过枚举分发到具体后端上的 `DeviceCore`，避免动态分发。
enum Backend {
    Headless(DeviceCore<HeadlessDevice>),
    #[cfg(target_os = "windows")]
    Dx12(DeviceCore<Dx12Device>),
}

pub struct Renderer {
    backend: Backend,
}

/// 可以交给加载线程的描述符堆
#[derive(Clone)]
pub enum SharedDescriptorHeap {
    Headless(Arc<DescriptorSlotHeap<HeadlessDevice>>),
    #[cfg(target_os = "windows")]
    Dx12(Arc<DescriptorSlotHeap<Dx12Device>>),
}

impl SharedDescriptorHeap {
    pub fn allocate(&self) -> Result<DescriptorHandle> {
        match self {
            SharedDescriptorHeap::Headless(heap) => heap.allocate(),
            #[cfg(target_os = "windows")]
            SharedDescriptorHeap::Dx12(heap) => heap.allocate(),
        }
    }

    pub fn free(&self, handle: &mut DescriptorHandle) {
        match self {
            SharedDescriptorHeap::Headless(heap) => heap.free(handle),
            #[cfg(target_os = "windows")]
            SharedDescriptorHeap::Dx12(heap) => heap.free(handle),
        }
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        match self {
            SharedDescriptorHeap::Headless(heap) => heap.stats(),
            #[cfg(target_os = "windows")]
            SharedDescriptorHeap::Dx12(heap) => heap.stats(),
        }
    }
}

impl Renderer {
    pub fn new(config: &Config, surface: SurfaceTarget) -> Result<Self> {
        let desc = DeviceCoreDesc::from_config(config);

        let backend = match config.graphics.backend {
            GraphicsBackend::Headless => {
                info!("Initializing headless backend");
                let options = HeadlessOptions::from_config(&config.headless);
                Backend::Headless(DeviceCore::initialize(&desc, &options, surface)?)
            }
            #[cfg(target_os = "windows")]
            GraphicsBackend::Dx12 => {
                info!("Initializing DX12 backend");
                let options = Dx12Options::from_config(config);
                Backend::Dx12(DeviceCore::initialize(&desc, &options, surface)?)
            }
            #[cfg(not(target_os = "windows"))]
            GraphicsBackend::Dx12 => {
                return Err(crate::core::error::CoreError::Initialization(
                    "DX12 backend is only available on Windows".to_string(),
                ));
            }
        };

        Ok(Self { backend })
    }

    /// 渲染一帧（清屏并呈现）
    pub fn render_frame(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Headless(core) => core.render(|_| Ok(())),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.render(|_| Ok(())),
        }
    }

    /// 开始一帧，返回帧槽位
    pub fn begin_frame(&mut self) -> Result<usize> {
        match &mut self.backend {
            Backend::Headless(core) => core.begin_frame(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.begin_frame(),
        }
    }

    /// 提交当前帧并呈现
    pub fn end_frame(&mut self) -> Result<Submission> {
        match &mut self.backend {
            Backend::Headless(core) => core.end_frame(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.end_frame(),
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Headless(core) => core.resize(width, height),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.resize(width, height),
        }
    }

    pub fn toggle_vsync(&mut self) -> bool {
        match &mut self.backend {
            Backend::Headless(core) => core.toggle_vsync(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.toggle_vsync(),
        }
    }

    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        match &mut self.backend {
            Backend::Headless(core) => core.set_fullscreen(fullscreen),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.set_fullscreen(fullscreen),
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        match &self.backend {
            Backend::Headless(core) => core.is_fullscreen(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.is_fullscreen(),
        }
    }

    pub fn allocate_descriptor(&self, heap_type: DescriptorHeapType) -> Result<DescriptorHandle> {
        match &self.backend {
            Backend::Headless(core) => core.allocate_descriptor(heap_type),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.allocate_descriptor(heap_type),
        }
    }

    pub fn free_descriptor(&self, handle: &mut DescriptorHandle) {
        match &self.backend {
            Backend::Headless(core) => core.free_descriptor(handle),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.free_descriptor(handle),
        }
    }

    /// 供加载线程并发分配描述符
    pub fn descriptor_heap(&self, heap_type: DescriptorHeapType) -> Option<SharedDescriptorHeap> {
        match &self.backend {
            Backend::Headless(core) => core.descriptor_heap(heap_type).map(SharedDescriptorHeap::Headless),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.descriptor_heap(heap_type).map(SharedDescriptorHeap::Dx12),
        }
    }

    /// 把对象的销毁推迟到当前帧完成之后
    pub fn deferred_release<T: Send + 'static>(&self, object: T) {
        match &self.backend {
            Backend::Headless(core) => core.deferred_release(object),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.deferred_release(object),
        }
    }

    pub fn releaser(&self) -> DeferredReleaser {
        match &self.backend {
            Backend::Headless(core) => core.releaser(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.releaser(),
        }
    }

    pub fn pending_deferred_count(&self) -> usize {
        match &self.backend {
            Backend::Headless(core) => core.pending_deferred_count(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.pending_deferred_count(),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Headless(core) => core.flush().map(|_| ()),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.flush().map(|_| ()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Headless(core) => core.backend_name(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.backend_name(),
        }
    }

    pub fn frame_number(&self) -> u64 {
        match &self.backend {
            Backend::Headless(core) => core.frame_number(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.frame_number(),
        }
    }

    pub fn video_memory_info(&self) -> Result<VideoMemoryInfo> {
        match &self.backend {
            Backend::Headless(core) => core.video_memory_info(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.video_memory_info(),
        }
    }

    /// 等待 GPU 空闲并释放所有资源
    pub fn shutdown(self) -> Result<()> {
        match self.backend {
            Backend::Headless(core) => core.shutdown(),
            #[cfg(target_os = "windows")]
            Backend::Dx12(core) => core.shutdown(),
        }
    }
}
