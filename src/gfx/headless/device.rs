//! 模拟 GPU 设备
//!
//! 在软件中实现 `GpuDevice` 的全部操作：命令列表状态机、按序执行的队列、
//! fence、描述符堆地址、缓冲区、交换链。用于在没有 GPU 的机器上运行核心。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, info, trace};

use super::execution::{CompletionMode, GpuController, GpuOp, GpuShared, HeadlessFence, LiveToken};
use super::swap_chain::HeadlessSwapChain;
use crate::core::config::{HeadlessCompletion, HeadlessConfig};
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{
    AdapterInfo, FeatureLevel, GpuDevice, PresentMode, RawDescriptorHeap, SurfaceTarget,
    VideoMemoryInfo,
};
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapType};

const HEAP_ADDRESS_STRIDE: u64 = 0x0100_0000;
const CPU_HEAP_BASE: u64 = 0x0001_0000;
const GPU_HEAP_BASE: u64 = 0x8000_0000_0000;

/// 模拟设备的创建参数
#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub completion: CompletionMode,
    /// 模拟适配器支持的最高特性级别
    pub feature_level: FeatureLevel,
    pub adapter_name: String,
    pub dedicated_video_memory: u64,
    pub supports_tearing: bool,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            completion: CompletionMode::Immediate,
            feature_level: FeatureLevel::Level12_1,
            adapter_name: "Headless Adapter".to_string(),
            dedicated_video_memory: 4 << 30,
            supports_tearing: true,
        }
    }
}

impl HeadlessOptions {
    pub fn from_config(config: &HeadlessConfig) -> Self {
        let completion = match config.completion {
            HeadlessCompletion::Immediate => CompletionMode::Immediate,
            HeadlessCompletion::Threaded => CompletionMode::Threaded {
                latency: std::time::Duration::from_millis(config.latency_ms),
            },
        };
        Self {
            completion,
            ..Self::default()
        }
    }

    /// 由测试手动完成 GPU 工作
    pub fn manual() -> Self {
        Self {
            completion: CompletionMode::Manual,
            ..Self::default()
        }
    }
}

/// 命令队列
pub struct HeadlessQueue {
    submitter: Submitter,
}

/// 把队列操作交给执行时间线
enum Submitter {
    Inline(Arc<GpuShared>),
    Worker(Sender<GpuOp>),
}

impl Submitter {
    fn submit(&self, op: GpuOp) -> Result<()> {
        match self {
            Submitter::Inline(shared) => {
                shared.enqueue(op);
                Ok(())
            }
            Submitter::Worker(sender) => sender.send(op).map_err(|_| {
                GraphicsError::QueueSubmission("completion worker has stopped".to_string()).into()
            }),
        }
    }
}

/// 命令分配器
pub struct HeadlessCommandAllocator {
    /// 仍在 GPU 上执行的命令列表数
    executing: Arc<AtomicUsize>,
    resets: u64,
}

impl HeadlessCommandAllocator {
    pub fn reset_count(&self) -> u64 {
        self.resets
    }
}

/// 录制的命令
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Transition { resource: String, to_render_target: bool },
    ClearRenderTarget { rtv: usize, color: [f32; 4] },
}

/// 命令列表
pub struct HeadlessCommandList {
    executing: Arc<AtomicUsize>,
    open: bool,
    commands: Vec<RecordedCommand>,
}

impl HeadlessCommandList {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(GraphicsError::CommandExecution("command list is not recording".to_string()).into());
        }
        Ok(())
    }
}

/// 描述符堆
pub struct HeadlessDescriptorHeap {
    pub heap_type: DescriptorHeapType,
    pub capacity: u32,
    pub shader_visible: bool,
    _token: LiveToken,
}

/// 缓冲区或后台缓冲区
pub struct HeadlessResource {
    name: String,
    size: u64,
    _token: LiveToken,
    _back_buffer: Option<BackBufferRef>,
}

impl HeadlessResource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// 后台缓冲区引用，交换链据此拒绝在引用未释放时调整大小
pub(crate) struct BackBufferRef(pub(crate) Arc<AtomicUsize>);

impl Drop for BackBufferRef {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 完成线程的发送端
///
/// 线程在设备和所有队列都释放后处理完剩余操作并退出。
struct CompletionWorker {
    sender: Sender<GpuOp>,
}

/// 模拟 GPU 设备
pub struct HeadlessDevice {
    adapter: AdapterInfo,
    supports_tearing: bool,
    shared: Arc<GpuShared>,
    heap_count: AtomicU64,
    reservation: AtomicU64,
    worker: Option<CompletionWorker>,
}

impl HeadlessDevice {
    /// 获取驱动模拟 GPU 的控制器
    pub fn controller(&self) -> GpuController {
        GpuController {
            shared: self.shared.clone(),
        }
    }

    fn spawn_worker(latency: std::time::Duration) -> Result<CompletionWorker> {
        let (sender, receiver) = unbounded::<GpuOp>();
        thread::Builder::new()
            .name("headless-gpu".to_string())
            .spawn(move || {
                for op in receiver {
                    if matches!(op, GpuOp::Execute { .. }) && !latency.is_zero() {
                        thread::sleep(latency);
                    }
                    if let Some(value) = op.retire() {
                        trace!(fence_value = value, "Headless GPU reached fence");
                    }
                }
            })
            .map_err(|e| GraphicsError::DeviceCreation(format!("failed to spawn completion worker: {}", e)))?;

        debug!(?latency, "Headless completion worker started");
        Ok(CompletionWorker { sender })
    }

    fn increment_size(heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::DepthStencil => 8,
            _ => 32,
        }
    }
}

impl GpuDevice for HeadlessDevice {
    type Options = HeadlessOptions;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;
    type DescriptorHeap = HeadlessDescriptorHeap;
    type Resource = HeadlessResource;
    type SwapChain = HeadlessSwapChain;

    fn create(options: &HeadlessOptions, minimum: FeatureLevel) -> Result<Self> {
        if options.feature_level < minimum {
            return Err(GraphicsError::NoSuitableAdapter(minimum.to_string()).into());
        }

        let shared = Arc::new(GpuShared::new(options.completion.clone()));
        let worker = match &options.completion {
            CompletionMode::Threaded { latency } => Some(Self::spawn_worker(*latency)?),
            _ => None,
        };

        let adapter = AdapterInfo {
            name: options.adapter_name.clone(),
            dedicated_video_memory: options.dedicated_video_memory,
            feature_level: options.feature_level,
            is_software: true,
        };
        info!(
            adapter = %adapter.name,
            feature_level = %adapter.feature_level,
            completion = ?options.completion,
            "Headless device created"
        );

        Ok(Self {
            adapter,
            supports_tearing: options.supports_tearing,
            shared,
            heap_count: AtomicU64::new(0),
            reservation: AtomicU64::new(0),
            worker,
        })
    }

    fn backend_name(&self) -> &'static str {
        "Headless"
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn supports_tearing(&self) -> bool {
        self.supports_tearing
    }

    fn create_command_queue(&self) -> Result<HeadlessQueue> {
        self.shared.check_lost()?;
        let submitter = match self.worker.as_ref().map(|w| w.sender.clone()) {
            Some(sender) => Submitter::Worker(sender),
            None => Submitter::Inline(self.shared.clone()),
        };
        Ok(HeadlessQueue { submitter })
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence> {
        self.shared.check_lost()?;
        Ok(HeadlessFence::new(&self.shared, initial_value))
    }

    fn signal(&self, queue: &HeadlessQueue, fence: &HeadlessFence, value: u64) -> Result<()> {
        self.shared.check_lost()?;
        queue.submitter.submit(GpuOp::Signal {
            fence: fence.inner.clone(),
            value,
        })
    }

    fn create_command_allocator(&self) -> Result<HeadlessCommandAllocator> {
        self.shared.check_lost()?;
        Ok(HeadlessCommandAllocator {
            executing: Arc::new(AtomicUsize::new(0)),
            resets: 0,
        })
    }

    fn create_command_list(&self, allocator: &HeadlessCommandAllocator) -> Result<HeadlessCommandList> {
        self.shared.check_lost()?;
        Ok(HeadlessCommandList {
            executing: allocator.executing.clone(),
            open: false,
            commands: Vec::new(),
        })
    }

    fn reset_command_list(
        &self,
        allocator: &mut HeadlessCommandAllocator,
        list: &mut HeadlessCommandList,
    ) -> Result<()> {
        self.shared.check_lost()?;
        if allocator.executing.load(Ordering::Acquire) > 0 {
            return Err(GraphicsError::CommandExecution(
                "command allocator reset while the GPU is still executing its commands".to_string(),
            )
            .into());
        }
        allocator.resets += 1;
        list.executing = allocator.executing.clone();
        list.commands.clear();
        list.open = true;
        Ok(())
    }

    fn close_command_list(&self, list: &mut HeadlessCommandList) -> Result<()> {
        self.shared.check_lost()?;
        list.ensure_open()?;
        list.open = false;
        Ok(())
    }

    fn execute_command_list(&self, queue: &HeadlessQueue, list: &HeadlessCommandList) -> Result<()> {
        self.shared.check_lost()?;
        if list.open {
            return Err(GraphicsError::QueueSubmission(
                "command list must be closed before execution".to_string(),
            )
            .into());
        }
        list.executing.fetch_add(1, Ordering::AcqRel);
        self.shared.executed_lists.fetch_add(1, Ordering::AcqRel);
        queue.submitter.submit(GpuOp::Execute {
            executing: list.executing.clone(),
        })
    }

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawDescriptorHeap<HeadlessDescriptorHeap>> {
        self.shared.check_lost()?;
        if capacity == 0 || capacity > heap_type.max_capacity(shader_visible) {
            return Err(GraphicsError::DescriptorHeapCreation(format!(
                "{} heap cannot hold {} descriptors",
                heap_type.name(),
                capacity
            ))
            .into());
        }

        let n = self.heap_count.fetch_add(1, Ordering::AcqRel);
        let cpu_start = (CPU_HEAP_BASE + n * HEAP_ADDRESS_STRIDE) as usize;
        let gpu_start = shader_visible.then(|| GPU_HEAP_BASE + n * HEAP_ADDRESS_STRIDE);

        Ok(RawDescriptorHeap {
            raw: HeadlessDescriptorHeap {
                heap_type,
                capacity,
                shader_visible,
                _token: LiveToken::new(&self.shared, 0),
            },
            cpu_start,
            gpu_start,
            increment: Self::increment_size(heap_type),
        })
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<HeadlessResource> {
        self.shared.check_lost()?;
        if size == 0 {
            return Err(GraphicsError::ResourceCreation(format!("buffer '{}' has zero size", name)).into());
        }
        Ok(HeadlessResource {
            name: name.to_string(),
            size,
            _token: LiveToken::new(&self.shared, size),
            _back_buffer: None,
        })
    }

    fn create_swap_chain(
        &self,
        _queue: &HeadlessQueue,
        _surface: SurfaceTarget,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<HeadlessSwapChain> {
        self.shared.check_lost()?;
        HeadlessSwapChain::new(width, height, buffer_count)
    }

    fn back_buffers(&self, swap_chain: &HeadlessSwapChain) -> Result<Vec<HeadlessResource>> {
        self.shared.check_lost()?;
        let size = u64::from(swap_chain.width()) * u64::from(swap_chain.height()) * 4;
        Ok((0..swap_chain.buffer_count())
            .map(|i| HeadlessResource {
                name: format!("back buffer {}", i),
                size,
                _token: LiveToken::new(&self.shared, size),
                _back_buffer: Some(swap_chain.acquire_reference()),
            })
            .collect())
    }

    fn current_back_buffer_index(&self, swap_chain: &HeadlessSwapChain) -> usize {
        swap_chain.current_index()
    }

    fn create_render_target_view(&self, _resource: &HeadlessResource, _handle: CpuDescriptorHandle) {
        self.shared.render_target_views.fetch_add(1, Ordering::AcqRel);
    }

    fn record_clear(
        &self,
        list: &mut HeadlessCommandList,
        target: &HeadlessResource,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    ) -> Result<()> {
        list.ensure_open()?;
        list.commands.push(RecordedCommand::Transition {
            resource: target.name.clone(),
            to_render_target: true,
        });
        list.commands.push(RecordedCommand::ClearRenderTarget { rtv: rtv.ptr, color });
        list.commands.push(RecordedCommand::Transition {
            resource: target.name.clone(),
            to_render_target: false,
        });
        Ok(())
    }

    fn resize_swap_chain(&self, swap_chain: &mut HeadlessSwapChain, width: u32, height: u32) -> Result<()> {
        self.shared.check_lost()?;
        swap_chain.resize(width, height)
    }

    fn present(&self, swap_chain: &mut HeadlessSwapChain, mode: PresentMode) -> Result<()> {
        self.shared.check_lost()?;
        if mode.allow_tearing && !self.supports_tearing {
            return Err(GraphicsError::SwapchainError("tearing is not supported".to_string()).into());
        }
        swap_chain.present();
        self.shared.presents.fetch_add(1, Ordering::AcqRel);
        *self.shared.last_present.lock() = Some(mode);
        Ok(())
    }

    fn set_fullscreen(&self, swap_chain: &mut HeadlessSwapChain, fullscreen: bool) -> Result<()> {
        self.shared.check_lost()?;
        if self.shared.reject_fullscreen.swap(false, Ordering::AcqRel) {
            return Err(GraphicsError::SwapchainError(
                "fullscreen transition is not currently available".to_string(),
            )
            .into());
        }
        swap_chain.set_fullscreen(fullscreen);
        self.shared.fullscreen.store(fullscreen, Ordering::Release);
        Ok(())
    }

    fn video_memory_info(&self) -> Result<VideoMemoryInfo> {
        self.shared.check_lost()?;
        let budget = self.adapter.dedicated_video_memory;
        Ok(VideoMemoryInfo {
            budget,
            current_usage: self.shared.allocated_bytes.load(Ordering::Acquire),
            available_for_reservation: budget / 2,
            current_reservation: self.reservation.load(Ordering::Acquire),
        })
    }

    fn set_video_memory_reservation(&self, bytes: u64) -> Result<()> {
        self.shared.check_lost()?;
        let available = self.adapter.dedicated_video_memory / 2;
        if bytes > available {
            return Err(GraphicsError::ResourceCreation(format!(
                "cannot reserve {} bytes, only {} available",
                bytes, available
            ))
            .into());
        }
        self.reservation.store(bytes, Ordering::Release);
        Ok(())
    }
}
