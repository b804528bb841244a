//! 图形后端的统一抽象接口
//!
//! 帧管线核心只通过 `GpuDevice` trait 与具体图形 API 交互。
//! 每个后端用关联类型声明自己的队列、fence、命令分配器、命令列表、
//! 描述符堆、资源和交换链，核心代码在这些类型上泛型化。
//!
//! 目前有两个实现：
//!
//! - `headless`：软件模拟的 GPU，按提交顺序执行并在所有平台上可用
//! - `dx12`：DirectX 12（仅 Windows）

use std::fmt;
use std::time::Duration;

use raw_window_handle::RawWindowHandle;

use crate::core::error::Result;
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapType};

/// Direct3D 特性级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureLevel {
    Level11_0,
    Level11_1,
    Level12_0,
    Level12_1,
    Level12_2,
}

impl FeatureLevel {
    /// 核心要求的最低特性级别
    pub const MINIMUM: FeatureLevel = FeatureLevel::Level11_0;
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureLevel::Level11_0 => "11_0",
            FeatureLevel::Level11_1 => "11_1",
            FeatureLevel::Level12_0 => "12_0",
            FeatureLevel::Level12_1 => "12_1",
            FeatureLevel::Level12_2 => "12_2",
        };
        f.write_str(name)
    }
}

/// 所选适配器的信息
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub dedicated_video_memory: u64,
    pub feature_level: FeatureLevel,
    pub is_software: bool,
}

/// 本地显存使用情况（字节）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoMemoryInfo {
    pub budget: u64,
    pub current_usage: u64,
    pub available_for_reservation: u64,
    pub current_reservation: u64,
}

/// 呈现参数，在 EndFrame 的 present 调用时生效
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentMode {
    pub vsync: bool,
    /// 关闭 vsync 且窗口化时是否允许撕裂
    pub allow_tearing: bool,
}

impl PresentMode {
    /// DXGI 的 sync interval
    pub fn sync_interval(&self) -> u32 {
        u32::from(self.vsync)
    }
}

/// 后端创建的描述符堆及其寻址信息
///
/// 第 `i` 个描述符的地址为 `cpu_start + i * increment`（GPU 地址同理）。
pub struct RawDescriptorHeap<H> {
    pub raw: H,
    pub cpu_start: usize,
    pub gpu_start: Option<u64>,
    pub increment: u32,
}

/// 呈现目标
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    /// 原生窗口
    Window(RawWindowHandle),
    /// 无窗口（离屏）
    Offscreen,
}

/// 设备 fence
///
/// 设备在执行完 signal 之前提交的所有工作后，把 fence 推进到对应的值。
pub trait GpuFence: Send + Sync {
    /// 设备已完成的最大 fence 值
    fn completed_value(&self) -> Result<u64>;

    /// 阻塞直到 fence 达到 `value`
    ///
    /// 使用操作系统等待原语，不自旋。超时返回 `Ok(false)`。
    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> Result<bool>;
}

/// 图形设备
///
/// 所有操作都针对一个直接（graphics）队列。命令列表由 `create_command_list`
/// 以关闭状态返回，录制前需要 `reset_command_list`。
pub trait GpuDevice: Sized + 'static {
    /// 后端特有的创建参数
    type Options: Clone + Default;
    type Queue;
    type Fence: GpuFence + 'static;
    type CommandAllocator;
    type CommandList;
    type DescriptorHeap: Send + 'static;
    type Resource: Send + 'static;
    type SwapChain: Send + 'static;

    /// 选择适配器并创建设备，没有适配器满足 `minimum` 时失败
    fn create(options: &Self::Options, minimum: FeatureLevel) -> Result<Self>;

    fn backend_name(&self) -> &'static str;

    fn adapter_info(&self) -> &AdapterInfo;

    /// 是否支持关闭 vsync 时的撕裂呈现
    fn supports_tearing(&self) -> bool;

    fn create_command_queue(&self) -> Result<Self::Queue>;

    fn create_fence(&self, initial_value: u64) -> Result<Self::Fence>;

    /// 队列执行完之前提交的所有工作后把 fence 设为 `value`
    fn signal(&self, queue: &Self::Queue, fence: &Self::Fence, value: u64) -> Result<()>;

    fn create_command_allocator(&self) -> Result<Self::CommandAllocator>;

    fn create_command_list(&self, allocator: &Self::CommandAllocator) -> Result<Self::CommandList>;

    /// 重置分配器并让命令列表重新开始录制
    ///
    /// 调用方必须保证 GPU 已经不再使用分配器中的命令。
    fn reset_command_list(
        &self,
        allocator: &mut Self::CommandAllocator,
        list: &mut Self::CommandList,
    ) -> Result<()>;

    fn close_command_list(&self, list: &mut Self::CommandList) -> Result<()>;

    fn execute_command_list(&self, queue: &Self::Queue, list: &Self::CommandList) -> Result<()>;

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawDescriptorHeap<Self::DescriptorHeap>>;

    /// 在默认堆上创建缓冲区
    fn create_buffer(&self, size: u64, name: &str) -> Result<Self::Resource>;

    fn create_swap_chain(
        &self,
        queue: &Self::Queue,
        surface: SurfaceTarget,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<Self::SwapChain>;

    /// 交换链的后台缓冲区，调整大小前必须全部释放
    fn back_buffers(&self, swap_chain: &Self::SwapChain) -> Result<Vec<Self::Resource>>;

    fn current_back_buffer_index(&self, swap_chain: &Self::SwapChain) -> usize;

    fn create_render_target_view(&self, resource: &Self::Resource, handle: CpuDescriptorHandle);

    /// 录制 PRESENT -> RENDER_TARGET 屏障、清屏、RENDER_TARGET -> PRESENT 屏障
    fn record_clear(
        &self,
        list: &mut Self::CommandList,
        target: &Self::Resource,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    ) -> Result<()>;

    fn resize_swap_chain(&self, swap_chain: &mut Self::SwapChain, width: u32, height: u32) -> Result<()>;

    fn present(&self, swap_chain: &mut Self::SwapChain, mode: PresentMode) -> Result<()>;

    fn set_fullscreen(&self, swap_chain: &mut Self::SwapChain, fullscreen: bool) -> Result<()>;

    fn video_memory_info(&self) -> Result<VideoMemoryInfo>;

    fn set_video_memory_reservation(&self, bytes: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_level_ordering() {
        assert!(FeatureLevel::Level12_0 > FeatureLevel::MINIMUM);
        assert!(FeatureLevel::Level11_0 >= FeatureLevel::MINIMUM);
        assert_eq!(FeatureLevel::Level12_1.to_string(), "12_1");
    }

    #[test]
    fn test_sync_interval() {
        let vsync = PresentMode { vsync: true, allow_tearing: false };
        let tearing = PresentMode { vsync: false, allow_tearing: true };
        assert_eq!(vsync.sync_interval(), 1);
        assert_eq!(tearing.sync_interval(), 0);
    }
}
