//! 设备核心
//!
//! `DeviceCore` 拥有图形设备、四个描述符堆、帧命令单元、延迟释放队列和交换链，
//! 对窗口层提供 Initialize / Shutdown / Render 等窄接口。
//!
//! 生命周期是显式的：`initialize` 构造一次，`shutdown` 消费掉它。
//! 没有调用 `shutdown` 时，`Drop` 按同样的顺序尽力清理。
//!
//! # 关闭顺序
//!
//! 1. flush 队列
//! 2. 退出全屏，释放后台缓冲区的 RTV，把后台缓冲区和交换链放入延迟释放队列
//! 3. 销毁全部延迟释放的资源
//! 4. 回收所有描述符堆的延迟释放记录
//! 5. 交出设备堆并放入延迟释放队列
//! 6. 再销毁一遍，处理上一步以及资源析构过程中新入队的对象

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::command::FrameCommandUnit;
use super::deferred::{DeferredReleaseQueue, DeferredReleaser, GpuResource};
use super::descriptor::{DescriptorHandle, DescriptorHeapDesc, DescriptorHeapType, DescriptorSlotHeap};
use super::sync::{FenceValue, Submission};
use super::FRAME_BUFFER_COUNT;
use crate::core::config::{Config, DescriptorConfig};
use crate::core::error::{CoreError, Result};
use crate::gfx::backend::{AdapterInfo, FeatureLevel, GpuDevice, PresentMode, SurfaceTarget, VideoMemoryInfo};

/// 设备核心创建参数
#[derive(Debug, Clone)]
pub struct DeviceCoreDesc {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub fullscreen: bool,
    pub descriptors: DescriptorConfig,
    pub minimum_feature_level: FeatureLevel,
    /// 每帧清屏颜色，`None` 表示不清屏
    pub clear_color: Option<[f32; 4]>,
    /// BeginFrame 等待 fence 的超时，`None` 表示无限等待
    pub frame_wait_timeout: Option<Duration>,
    /// 预留显存（字节）
    pub video_memory_reservation: u64,
}

impl Default for DeviceCoreDesc {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
            fullscreen: false,
            descriptors: DescriptorConfig::default(),
            minimum_feature_level: FeatureLevel::MINIMUM,
            clear_color: None,
            frame_wait_timeout: None,
            video_memory_reservation: 0,
        }
    }
}

impl DeviceCoreDesc {
    pub fn from_config(config: &Config) -> Self {
        Self {
            width: config.window.width,
            height: config.window.height,
            vsync: config.graphics.vsync,
            fullscreen: config.graphics.fullscreen,
            descriptors: config.descriptors,
            minimum_feature_level: FeatureLevel::MINIMUM,
            clear_color: config.graphics.clear_color,
            frame_wait_timeout: config.graphics.frame_wait_timeout_ms.map(Duration::from_millis),
            video_memory_reservation: config.graphics.video_memory_reservation_mb * 1024 * 1024,
        }
    }
}

/// 交换链及依赖它尺寸的资源
struct Presentation<B: GpuDevice> {
    back_buffers: Vec<B::Resource>,
    rtvs: Vec<DescriptorHandle>,
    swap_chain: B::SwapChain,
    width: u32,
    height: u32,
}

impl<B: GpuDevice> Presentation<B> {
    fn create(
        device: &B,
        queue: &B::Queue,
        surface: SurfaceTarget,
        width: u32,
        height: u32,
        rtv_heap: &DescriptorSlotHeap<B>,
    ) -> Result<Self> {
        let swap_chain = device.create_swap_chain(queue, surface, width, height, FRAME_BUFFER_COUNT as u32)?;
        let back_buffers = device.back_buffers(&swap_chain)?;
        let rtvs = back_buffers
            .iter()
            .map(|buffer| {
                let handle = rtv_heap.allocate()?;
                device.create_render_target_view(buffer, handle.cpu);
                Ok(handle)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(width, height, buffers = back_buffers.len(), "Swap chain created");
        Ok(Self {
            back_buffers,
            rtvs,
            swap_chain,
            width,
            height,
        })
    }

    fn current_target(&self, device: &B) -> Option<(&B::Resource, DescriptorHandle)> {
        let index = device.current_back_buffer_index(&self.swap_chain);
        Some((self.back_buffers.get(index)?, *self.rtvs.get(index)?))
    }
}

/// 一帧的录制上下文
pub struct FrameRecorder<'a, B: GpuDevice> {
    device: &'a B,
    list: &'a mut B::CommandList,
    target: Option<(&'a B::Resource, DescriptorHandle)>,
    frame_index: usize,
    frame_number: u64,
}

impl<'a, B: GpuDevice> FrameRecorder<'a, B> {
    pub fn device(&self) -> &B {
        self.device
    }

    pub fn command_list(&mut self) -> &mut B::CommandList {
        &mut *self.list
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// 当前后台缓冲区
    pub fn back_buffer(&self) -> Option<&B::Resource> {
        self.target.map(|(buffer, _)| buffer)
    }

    /// 当前后台缓冲区的 RTV
    pub fn back_buffer_rtv(&self) -> Option<DescriptorHandle> {
        self.target.map(|(_, rtv)| rtv)
    }

    /// 清除当前后台缓冲区
    pub fn clear(&mut self, color: [f32; 4]) -> Result<()> {
        let (buffer, rtv) = self
            .target
            .ok_or_else(|| CoreError::Runtime("no back buffer to clear".to_string()))?;
        self.device.record_clear(&mut *self.list, buffer, rtv.cpu, color)
    }
}

/// 设备核心
pub struct DeviceCore<B: GpuDevice> {
    presentation: Option<Presentation<B>>,
    heaps: Vec<Arc<DescriptorSlotHeap<B>>>,
    releases: Arc<DeferredReleaseQueue>,
    commands: FrameCommandUnit<B>,
    vsync: bool,
    fullscreen: bool,
    fullscreen_applied: bool,
    clear_color: Option<[f32; 4]>,
    shut_down: bool,
    /// 必须最后析构
    device: B,
}

impl<B: GpuDevice> DeviceCore<B> {
    /// 创建设备、描述符堆、帧命令单元和交换链
    ///
    /// 没有适配器满足最低特性级别时返回 `NoSuitableAdapter`。
    pub fn initialize(desc: &DeviceCoreDesc, options: &B::Options, surface: SurfaceTarget) -> Result<Self> {
        let device = B::create(options, desc.minimum_feature_level).map_err(|e| {
            error!(error = %e, minimum = %desc.minimum_feature_level, "Failed to create graphics device");
            e
        })?;

        let adapter = device.adapter_info();
        info!(
            backend = device.backend_name(),
            adapter = %adapter.name,
            feature_level = %adapter.feature_level,
            video_memory_mb = adapter.dedicated_video_memory / (1024 * 1024),
            "Graphics device created"
        );

        if desc.video_memory_reservation > 0 {
            if let Err(e) = device.set_video_memory_reservation(desc.video_memory_reservation) {
                warn!(error = %e, bytes = desc.video_memory_reservation, "Video memory reservation rejected");
            }
        }

        let commands = FrameCommandUnit::new(&device, desc.frame_wait_timeout)?;
        let timeline = commands.timeline().clone();

        let heaps = DescriptorHeapType::MANAGED
            .iter()
            .map(|&heap_type| {
                let capacity = desc.descriptors.capacity(heap_type).ok_or_else(|| {
                    CoreError::Initialization(format!("no capacity configured for {} heap", heap_type.name()))
                })?;
                let heap_desc = DescriptorHeapDesc::for_type(heap_type, capacity);
                Ok(Arc::new(DescriptorSlotHeap::new(&device, &heap_desc, timeline.clone())?))
            })
            .collect::<Result<Vec<_>>>()?;

        let releases = Arc::new(DeferredReleaseQueue::new(timeline));

        let (width, height) = (desc.width.max(1), desc.height.max(1));
        let presentation = Presentation::create(&device, commands.queue(), surface, width, height, &heaps[0])?;

        info!(width, height, vsync = desc.vsync, "Device core initialized");

        Ok(Self {
            presentation: Some(presentation),
            heaps,
            releases,
            commands,
            vsync: desc.vsync,
            fullscreen: desc.fullscreen,
            fullscreen_applied: false,
            clear_color: desc.clear_color,
            shut_down: false,
            device,
        })
    }

    /// 等待 GPU 空闲并按依赖顺序释放所有对象
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_in_place()
    }

    fn shutdown_in_place(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        info!("Shutting down device core");

        let flushed = self.commands.flush(&self.device);
        if let Err(e) = &flushed {
            error!(error = %e, "Flush failed during shutdown, releasing anyway");
        }

        if let Some(presentation) = self.presentation.take() {
            let Presentation {
                back_buffers,
                rtvs,
                mut swap_chain,
                ..
            } = presentation;

            if self.fullscreen_applied {
                if let Err(e) = self.device.set_fullscreen(&mut swap_chain, false) {
                    warn!(error = %e, "Failed to leave fullscreen");
                }
                self.fullscreen_applied = false;
            }
            for mut rtv in rtvs {
                self.heaps[0].free(&mut rtv);
            }
            self.releases.defer(back_buffers);
            self.releases.defer(swap_chain);
        }

        let released = self.releases.drain_all();
        let freed: usize = self.heaps.iter().map(|heap| heap.drain_deferred_free()).sum();
        for heap in &self.heaps {
            if let Some(raw) = heap.release() {
                self.releases.defer(raw);
            }
        }
        let late = self.releases.drain_all();

        info!(released, freed, late, "Device core shut down");
        flushed.map(|_| ())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.shut_down {
            return Err(CoreError::Runtime("device core has been shut down".to_string()));
        }
        Ok(())
    }

    /// 开始一帧，并处理当前槽位待处理的延迟释放
    pub fn begin_frame(&mut self) -> Result<usize> {
        self.ensure_active()?;
        let index = self.commands.begin_frame(&self.device)?;
        if self.commands.timeline().take_pending(index) {
            self.process_deferred(index)?;
        }
        Ok(index)
    }

    /// 资源可能引用描述符，先销毁资源再回收描述符
    fn process_deferred(&self, index: usize) -> Result<()> {
        let released = self.releases.process(index)?;
        let mut freed = 0;
        for heap in &self.heaps {
            freed += heap.process_deferred_free(index)?;
        }
        if released > 0 || freed > 0 {
            debug!(frame_index = index, released, freed, "Processed deferred work");
        }
        Ok(())
    }

    /// 提交当前帧并呈现
    ///
    /// 挂起的全屏切换在提交之后、呈现之前应用。切换失败时这一帧仍然提交并
    /// signal，然后返回切换的错误，下次 `end_frame` 会重试。
    pub fn end_frame(&mut self) -> Result<Submission> {
        self.ensure_active()?;
        let device = &self.device;
        let vsync = self.vsync;
        let fullscreen = self.fullscreen;
        let fullscreen_applied = &mut self.fullscreen_applied;
        let presentation = self.presentation.as_mut();

        self.commands.end_frame_with(device, || {
            let Some(presentation) = presentation else {
                return Ok(());
            };
            if fullscreen != *fullscreen_applied {
                device.set_fullscreen(&mut presentation.swap_chain, fullscreen)?;
                *fullscreen_applied = fullscreen;
                info!(fullscreen, "Fullscreen state changed");
            }
            let mode = PresentMode {
                vsync,
                allow_tearing: !vsync && device.supports_tearing() && !*fullscreen_applied,
            };
            device.present(&mut presentation.swap_chain, mode)
        })
    }

    /// 录制并提交一帧
    ///
    /// 配置了清屏颜色时先清除后台缓冲区。`record` 失败时这一帧仍然会被提交，
    /// 然后返回 `record` 的错误。
    pub fn render<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&mut FrameRecorder<'_, B>) -> Result<()>,
    {
        let frame_index = self.begin_frame()?;
        let frame_number = self.commands.frame_number();

        let recorded = Self::record_frame(
            &self.device,
            &mut self.commands,
            self.presentation.as_ref(),
            self.clear_color,
            frame_index,
            frame_number,
            record,
        );
        let ended = self.end_frame();

        match (recorded, ended) {
            (Err(e), _) => Err(e),
            (Ok(()), ended) => ended.map(|_| ()),
        }
    }

    fn record_frame<F>(
        device: &B,
        commands: &mut FrameCommandUnit<B>,
        presentation: Option<&Presentation<B>>,
        clear_color: Option<[f32; 4]>,
        frame_index: usize,
        frame_number: u64,
        record: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut FrameRecorder<'_, B>) -> Result<()>,
    {
        let mut recorder = FrameRecorder {
            device,
            list: commands.recording_list()?,
            target: presentation.and_then(|p| p.current_target(device)),
            frame_index,
            frame_number,
        };
        if let Some(color) = clear_color {
            recorder.clear(color)?;
        }
        record(&mut recorder)
    }

    /// 等待所有已提交的 GPU 工作完成
    pub fn flush(&mut self) -> Result<FenceValue> {
        self.ensure_active()?;
        self.commands.flush(&self.device)
    }

    /// 调整交换链大小
    ///
    /// 尺寸为 0 时按 1 处理，尺寸不变时什么都不做。先 flush，再释放后台缓冲区引用，
    /// 调整大小后在原来的描述符槽位中重建 RTV。
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ensure_active()?;
        let (width, height) = (width.max(1), height.max(1));

        if self.commands.is_recording() {
            return Err(CoreError::Runtime("cannot resize while a frame is recording".to_string()));
        }
        let Some(presentation) = self.presentation.as_ref() else {
            return Ok(());
        };
        if presentation.width == width && presentation.height == height {
            return Ok(());
        }

        self.commands.flush(&self.device)?;

        let Some(presentation) = self.presentation.as_mut() else {
            return Ok(());
        };
        presentation.back_buffers.clear();
        self.device.resize_swap_chain(&mut presentation.swap_chain, width, height)?;
        presentation.back_buffers = self.device.back_buffers(&presentation.swap_chain)?;
        for (buffer, rtv) in presentation.back_buffers.iter().zip(&presentation.rtvs) {
            self.device.create_render_target_view(buffer, rtv.cpu);
        }
        presentation.width = width;
        presentation.height = height;

        info!(width, height, "Swap chain resized");
        Ok(())
    }

    /// 切换垂直同步，返回新状态
    pub fn toggle_vsync(&mut self) -> bool {
        self.vsync = !self.vsync;
        info!(vsync = self.vsync, "VSync toggled");
        self.vsync
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    pub fn is_vsync(&self) -> bool {
        self.vsync
    }

    /// 请求全屏状态，在下一次 `end_frame` 时生效
    pub fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    /// 从指定类型的堆分配描述符
    pub fn allocate_descriptor(&self, heap_type: DescriptorHeapType) -> Result<DescriptorHandle> {
        self.ensure_active()?;
        self.heap(heap_type)
            .ok_or_else(|| CoreError::Runtime(format!("{} heap is not managed by the device core", heap_type.name())))?
            .allocate()
    }

    /// 释放描述符，槽位在当前帧完成后回收
    pub fn free_descriptor(&self, handle: &mut DescriptorHandle) {
        match self.heap(handle.heap_type) {
            Some(heap) => heap.free(handle),
            None if handle.is_valid() => {
                warn!(heap = handle.heap_type.name(), "Ignoring free of an unmanaged descriptor");
            }
            None => {}
        }
    }

    fn heap(&self, heap_type: DescriptorHeapType) -> Option<&Arc<DescriptorSlotHeap<B>>> {
        let position = DescriptorHeapType::MANAGED.iter().position(|&t| t == heap_type)?;
        self.heaps.get(position)
    }

    /// 共享描述符堆，供资源加载线程使用
    pub fn descriptor_heap(&self, heap_type: DescriptorHeapType) -> Option<Arc<DescriptorSlotHeap<B>>> {
        self.heap(heap_type).cloned()
    }

    /// 把对象的销毁推迟到当前帧完成之后
    pub fn deferred_release<T: Send + 'static>(&self, object: T) {
        self.releases.defer(object);
    }

    pub fn releaser(&self) -> DeferredReleaser {
        DeferredReleaser::new(&self.releases)
    }

    /// 创建缓冲区，离开作用域时自动延迟释放
    pub fn create_buffer(&self, size: u64, name: &str) -> Result<GpuResource<B::Resource>> {
        self.ensure_active()?;
        let buffer = self.device.create_buffer(size, name)?;
        Ok(GpuResource::new(buffer, self.releaser()))
    }

    /// 等待回收的资源和描述符总数
    pub fn pending_deferred_count(&self) -> usize {
        self.releases.pending_count() + self.heaps.iter().map(|heap| heap.pending_free_count()).sum::<usize>()
    }

    pub fn video_memory_info(&self) -> Result<VideoMemoryInfo> {
        self.device.video_memory_info()
    }

    pub fn device(&self) -> &B {
        &self.device
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        self.device.adapter_info()
    }

    pub fn backend_name(&self) -> &'static str {
        self.device.backend_name()
    }

    pub fn frame_index(&self) -> usize {
        self.commands.frame_index()
    }

    pub fn frame_number(&self) -> u64 {
        self.commands.frame_number()
    }

    /// 交换链尺寸
    pub fn size(&self) -> Option<(u32, u32)> {
        self.presentation.as_ref().map(|p| (p.width, p.height))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl<B: GpuDevice> Drop for DeviceCore<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_in_place() {
            error!(error = %e, "Device core shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::init_test_logger;
    use crate::core::error::GraphicsError;
    use crate::gfx::headless::{CompletionMode, GpuController, HeadlessDevice, HeadlessOptions};
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn desc() -> DeviceCoreDesc {
        DeviceCoreDesc {
            width: 64,
            height: 64,
            descriptors: DescriptorConfig {
                render_target: 16,
                depth_stencil: 16,
                shader_resource: 64,
                unordered_access: 16,
            },
            ..DeviceCoreDesc::default()
        }
    }

    fn core_with(options: HeadlessOptions) -> (DeviceCore<HeadlessDevice>, GpuController) {
        init_test_logger();
        let core = match DeviceCore::<HeadlessDevice>::initialize(&desc(), &options, SurfaceTarget::Offscreen) {
            Ok(core) => core,
            Err(e) => panic!("initialization failed: {}", e),
        };
        let controller = core.device().controller();
        (core, controller)
    }

    fn render_empty(core: &mut DeviceCore<HeadlessDevice>) {
        core.render(|_| Ok(())).unwrap();
    }

    /// 销毁核心，同时由后台线程完成 GPU 工作
    ///
    /// 手动模式下 `Drop` 的 flush 会再提交一次 signal，没有人完成就会一直等待。
    fn drop_while_gpu_drains(core: DeviceCore<HeadlessDevice>, controller: &GpuController) {
        let done = Arc::new(AtomicBool::new(false));
        let gpu = {
            let controller = controller.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    controller.complete_all();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };
        drop(core);
        done.store(true, Ordering::Release);
        gpu.join().unwrap();
    }

    #[test]
    fn test_initialize_creates_swap_chain_views() {
        let (core, controller) = core_with(HeadlessOptions::default());
        assert_eq!(core.backend_name(), "Headless");
        assert_eq!(core.size(), Some((64, 64)));
        assert_eq!(controller.render_target_views_created(), FRAME_BUFFER_COUNT as u64);
        // 四个堆加三个后台缓冲区
        assert_eq!(controller.live_resources(), 4 + FRAME_BUFFER_COUNT);
        let rtv = core.descriptor_heap(DescriptorHeapType::RenderTarget).unwrap();
        assert_eq!(rtv.live_count(), FRAME_BUFFER_COUNT as u32);
    }

    #[test]
    fn test_initialize_fails_without_suitable_adapter() {
        let options = HeadlessOptions {
            feature_level: FeatureLevel::Level11_0,
            ..HeadlessOptions::default()
        };
        let desc = DeviceCoreDesc {
            minimum_feature_level: FeatureLevel::Level12_0,
            ..desc()
        };
        match DeviceCore::<HeadlessDevice>::initialize(&desc, &options, SurfaceTarget::Offscreen) {
            Ok(_) => panic!("initialization should fail"),
            Err(e) => {
                assert!(matches!(
                    e,
                    CoreError::Graphics(crate::core::error::GraphicsError::NoSuitableAdapter(_))
                ));
                assert!(e.is_fatal());
            }
        }
    }

    #[test]
    fn test_invalid_heap_capacity_fails_initialization() {
        let desc = DeviceCoreDesc {
            descriptors: DescriptorConfig {
                render_target: 0,
                ..DescriptorConfig::default()
            },
            ..desc()
        };
        let result =
            DeviceCore::<HeadlessDevice>::initialize(&desc, &HeadlessOptions::default(), SurfaceTarget::Offscreen);
        assert!(matches!(result, Err(CoreError::InvalidDescriptorCapacity { capacity: 0, .. })));
    }

    #[test]
    fn test_flush_then_shutdown_leaves_nothing_pending() {
        let (mut core, controller) = core_with(HeadlessOptions::default());

        let buffer = core.create_buffer(256, "constants").unwrap();
        let mut srv = core.allocate_descriptor(DescriptorHeapType::ShaderResource).unwrap();
        render_empty(&mut core);
        drop(buffer);
        core.free_descriptor(&mut srv);
        core.deferred_release(core.device().create_buffer(16, "staging").unwrap());
        let _leaked = core.allocate_descriptor(DescriptorHeapType::UnorderedAccess).unwrap();
        assert!(core.pending_deferred_count() > 0);

        core.flush().unwrap();
        core.shutdown_in_place().unwrap();

        assert_eq!(core.pending_deferred_count(), 0);
        assert_eq!(controller.live_resources(), 0);
        assert!(core.is_shut_down());
        assert!(core.begin_frame().is_err());
        assert!(core.allocate_descriptor(DescriptorHeapType::ShaderResource).is_err());
    }

    #[test]
    fn test_deferred_release_waits_for_slot_fence() {
        let (mut core, controller) = core_with(HeadlessOptions::manual());

        let buffer = core.create_buffer(1024, "vertices").unwrap();
        let live = controller.live_resources();
        drop(buffer);
        assert_eq!(core.pending_deferred_count(), 1);

        render_empty(&mut core);
        assert_eq!(controller.live_resources(), live);

        controller.complete_all();
        render_empty(&mut core);
        render_empty(&mut core);
        assert_eq!(controller.live_resources(), live);

        // 帧 3 复用槽位 0
        render_empty(&mut core);
        assert_eq!(controller.live_resources(), live - 1);
        assert_eq!(core.pending_deferred_count(), 0);

        drop_while_gpu_drains(core, &controller);
        assert_eq!(controller.live_resources(), 0);
    }

    #[test]
    fn test_descriptor_free_between_frames() {
        let (mut core, controller) = core_with(HeadlessOptions::manual());
        let heap = core.descriptor_heap(DescriptorHeapType::DepthStencil).unwrap();

        render_empty(&mut core);
        let mut dsv = core.allocate_descriptor(DescriptorHeapType::DepthStencil).unwrap();
        // 帧 0 已提交，帧 1 尚未开始
        core.free_descriptor(&mut dsv);
        assert!(!dsv.is_valid());
        controller.complete_all();

        render_empty(&mut core);
        render_empty(&mut core);
        render_empty(&mut core);
        assert_eq!(heap.pending_free_count(), 1);

        // 帧 1 的 fence 完成后，槽位 1 在帧 4 被复用
        controller.complete_all();
        render_empty(&mut core);
        assert_eq!(heap.pending_free_count(), 0);
        assert_eq!(heap.live_count(), 0);

        drop(heap);
        drop_while_gpu_drains(core, &controller);
        assert_eq!(controller.pending_operations(), 0);
    }

    #[test]
    fn test_drop_waits_for_outstanding_gpu_work() {
        let (mut core, controller) = core_with(HeadlessOptions::manual());
        let buffer = core.create_buffer(64, "in flight").unwrap();
        render_empty(&mut core);
        assert!(controller.pending_operations() > 0);

        let gpu = {
            let controller = controller.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                while controller.live_resources() > 0 {
                    controller.complete_all();
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let started = Instant::now();
        drop(buffer);
        drop(core);
        assert!(started.elapsed() >= Duration::from_millis(50));
        gpu.join().unwrap();

        assert_eq!(controller.live_resources(), 0);
        assert_eq!(controller.pending_operations(), 0);
    }

    #[test]
    fn test_render_records_clear_and_presents() {
        let (mut core, controller) = core_with(HeadlessOptions::default());
        core.clear_color = Some([0.2, 0.3, 0.4, 1.0]);

        core.render(|recorder| {
            assert!(recorder.back_buffer().is_some());
            assert_eq!(recorder.frame_number(), 0);
            assert_eq!(recorder.command_list().commands().len(), 3);
            Ok(())
        })
        .unwrap();

        assert_eq!(controller.present_count(), 1);
        assert_eq!(controller.executed_command_lists(), 1);
        assert_eq!(core.frame_number(), 1);
    }

    #[test]
    fn test_render_error_still_ends_frame() {
        let (mut core, _controller) = core_with(HeadlessOptions::default());
        let err = core
            .render(|_| Err(CoreError::Runtime("draw failed".to_string())))
            .unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
        assert_eq!(core.frame_number(), 1);
        render_empty(&mut core);
    }

    #[test]
    fn test_lost_device_is_fatal() {
        let (mut core, controller) = core_with(HeadlessOptions::default());
        render_empty(&mut core);

        controller.lose_device();
        let err = core.render(|_| Ok(())).unwrap_err();
        assert!(err.is_device_lost());
        assert!(err.is_fatal());

        // 关闭仍然释放所有对象
        assert!(core.shutdown_in_place().is_err());
        assert_eq!(core.pending_deferred_count(), 0);
    }

    #[test]
    fn test_resize() {
        let (mut core, controller) = core_with(HeadlessOptions::default());
        let rtv_heap = core.descriptor_heap(DescriptorHeapType::RenderTarget).unwrap();
        let views = controller.render_target_views_created();

        core.resize(64, 64).unwrap();
        assert_eq!(controller.render_target_views_created(), views);

        core.resize(0, 0).unwrap();
        assert_eq!(core.size(), Some((1, 1)));
        assert_eq!(controller.render_target_views_created(), views + FRAME_BUFFER_COUNT as u64);
        assert_eq!(rtv_heap.live_count(), FRAME_BUFFER_COUNT as u32);

        core.begin_frame().unwrap();
        assert!(core.resize(128, 128).is_err());
        core.end_frame().unwrap();
        core.resize(128, 128).unwrap();
        assert_eq!(core.size(), Some((128, 128)));
    }

    #[test]
    fn test_vsync_and_fullscreen() {
        let (mut core, controller) = core_with(HeadlessOptions::default());

        render_empty(&mut core);
        assert_eq!(
            controller.last_present(),
            Some(PresentMode {
                vsync: true,
                allow_tearing: false
            })
        );

        assert!(!core.toggle_vsync());
        render_empty(&mut core);
        assert_eq!(
            controller.last_present(),
            Some(PresentMode {
                vsync: false,
                allow_tearing: true
            })
        );

        core.set_fullscreen(true);
        render_empty(&mut core);
        assert!(controller.is_fullscreen());
        assert_eq!(controller.last_present().map(|mode| mode.allow_tearing), Some(false));

        core.shutdown_in_place().unwrap();
        assert!(!controller.is_fullscreen());
    }

    #[test]
    fn test_unmanaged_heap() {
        let (core, _controller) = core_with(HeadlessOptions::default());
        assert!(core.allocate_descriptor(DescriptorHeapType::Sampler).is_err());
        assert!(core.descriptor_heap(DescriptorHeapType::Sampler).is_none());
    }

    #[test]
    fn test_loader_thread_allocates_while_rendering() {
        let options = HeadlessOptions {
            completion: CompletionMode::Threaded {
                latency: Duration::from_millis(1),
            },
            ..HeadlessOptions::default()
        };
        let (mut core, _controller) = core_with(options);
        let heap = core.descriptor_heap(DescriptorHeapType::ShaderResource).unwrap();
        let live = Arc::new(Mutex::new(HashSet::new()));

        let loader = {
            let live = live.clone();
            thread::spawn(move || {
                let mut held = VecDeque::new();
                let mut allocated = 0;
                while allocated < 200 {
                    let handle = match heap.allocate() {
                        Ok(handle) => handle,
                        // 释放的槽位要等所在帧的 fence 完成后才能复用
                        Err(CoreError::DescriptorHeapExhausted { .. }) => {
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                        Err(e) => panic!("allocation failed: {}", e),
                    };
                    assert!(live.lock().insert(handle.index()), "index {} handed out twice", handle.index());
                    held.push_back(handle);
                    allocated += 1;

                    if held.len() > 4 {
                        if let Some(mut handle) = held.pop_front() {
                            live.lock().remove(&handle.index());
                            heap.free(&mut handle);
                        }
                    }
                }
                for mut handle in held {
                    live.lock().remove(&handle.index());
                    heap.free(&mut handle);
                }
            })
        };

        let started = Instant::now();
        while !loader.is_finished() {
            let own = core.allocate_descriptor(DescriptorHeapType::ShaderResource).ok();
            if let Some(handle) = &own {
                assert!(live.lock().insert(handle.index()), "index {} handed out twice", handle.index());
            }
            render_empty(&mut core);
            if let Some(mut handle) = own {
                live.lock().remove(&handle.index());
                core.free_descriptor(&mut handle);
            }
            assert!(started.elapsed() < Duration::from_secs(30), "loader made no progress");
        }
        loader.join().unwrap();
        assert!(live.lock().is_empty());

        for _ in 0..=FRAME_BUFFER_COUNT {
            render_empty(&mut core);
        }
        assert_eq!(core.pending_deferred_count(), 0);
        core.shutdown().unwrap();
    }

    #[test]
    fn test_failed_fullscreen_transition_still_submits() {
        let (mut core, controller) = core_with(HeadlessOptions::default());
        core.set_fullscreen(true);
        controller.reject_next_fullscreen();

        let err = core.render(|_| Ok(())).unwrap_err();
        assert!(matches!(err, CoreError::Graphics(GraphicsError::SwapchainError(_))));
        assert!(!err.is_device_lost());
        assert_eq!(core.frame_number(), 1);
        assert_eq!(controller.executed_command_lists(), 1);
        assert_eq!(controller.present_count(), 0);
        assert!(!controller.is_fullscreen());

        // 下一帧重试切换
        render_empty(&mut core);
        assert!(controller.is_fullscreen());
        assert_eq!(core.frame_number(), 2);
        assert_eq!(controller.present_count(), 1);
        assert_eq!(
            controller.last_present(),
            Some(PresentMode {
                vsync: true,
                allow_tearing: false
            })
        );
    }
}
