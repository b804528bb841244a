//! 描述符管理模块
//!
//! 提供固定容量的描述符槽位堆 `DescriptorSlotHeap`：
//! 在一段连续的描述符区间上维护空闲列表，支持立即分配和按帧延迟释放。
//!
//! # 空闲列表
//!
//! `free_handles` 初始化为 `free_handles[i] = i`。`size` 是已占用槽位数（包括等待
//! 延迟回收的槽位），`free_handles[size..capacity]` 是可分配的索引：
//!
//! - 分配：取 `free_handles[size]`，`size += 1`
//! - 回收：`size -= 1`，`free_handles[size] = index`
//!
//! # 延迟释放
//!
//! `free` 不会立即把索引放回空闲列表，而是记录（帧号，索引），并在帧时间线上
//! 标记该槽位有待处理工作。`process_deferred_free` 只回收对应帧的 fence 已确认
//! 完成的记录，参见 `FrameTimeline`。
//!
//! # DirectX 12 描述符类型
//!
//! - **RTV** (Render Target View)：渲染目标视图
//! - **DSV** (Depth Stencil View)：深度模板视图
//! - **CBV/SRV/UAV**：着色器可见的常量缓冲、着色资源、无序访问视图
//! - **UAV**：不可见的无序访问视图，用于清除 UAV 等 CPU 侧操作

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::sync::FrameTimeline;
use super::FRAME_BUFFER_COUNT;
use crate::core::error::{CoreError, Result};
use crate::gfx::backend::GpuDevice;

/// CBV/SRV/UAV 堆的最大容量（资源绑定 tier 2）
pub const MAX_CBV_SRV_UAV_DESCRIPTORS: u32 = 1_000_000;

/// 着色器可见采样器堆的最大容量
pub const MAX_SHADER_VISIBLE_SAMPLERS: u32 = 2048;

/// 描述符堆类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// 渲染目标视图 (RTV)
    RenderTarget,
    /// 深度模板视图 (DSV)
    DepthStencil,
    /// 着色器可见的 CBV/SRV/UAV
    ShaderResource,
    /// 不可见的 UAV
    UnorderedAccess,
    /// 采样器，核心不管理该类型的堆
    Sampler,
}

impl DescriptorHeapType {
    /// 由核心管理的四种堆
    pub const MANAGED: [DescriptorHeapType; 4] = [
        DescriptorHeapType::RenderTarget,
        DescriptorHeapType::DepthStencil,
        DescriptorHeapType::ShaderResource,
        DescriptorHeapType::UnorderedAccess,
    ];

    /// 获取堆类型名称
    pub fn name(&self) -> &'static str {
        match self {
            DescriptorHeapType::RenderTarget => "RTV",
            DescriptorHeapType::DepthStencil => "DSV",
            DescriptorHeapType::ShaderResource => "SRV/CBV/UAV",
            DescriptorHeapType::UnorderedAccess => "UAV",
            DescriptorHeapType::Sampler => "Sampler",
        }
    }

    /// 配置文件中的字段名
    pub fn config_key(&self) -> &'static str {
        match self {
            DescriptorHeapType::RenderTarget => "render_target",
            DescriptorHeapType::DepthStencil => "depth_stencil",
            DescriptorHeapType::ShaderResource => "shader_resource",
            DescriptorHeapType::UnorderedAccess => "unordered_access",
            DescriptorHeapType::Sampler => "sampler",
        }
    }

    /// RTV/DSV 堆不能是着色器可见的
    pub fn supports_shader_visible(&self) -> bool {
        !matches!(
            self,
            DescriptorHeapType::RenderTarget | DescriptorHeapType::DepthStencil
        )
    }

    /// 默认是否着色器可见
    pub fn default_shader_visible(&self) -> bool {
        matches!(
            self,
            DescriptorHeapType::ShaderResource | DescriptorHeapType::Sampler
        )
    }

    /// 硬件允许的最大容量
    pub fn max_capacity(&self, shader_visible: bool) -> u32 {
        match self {
            DescriptorHeapType::Sampler if shader_visible => MAX_SHADER_VISIBLE_SAMPLERS,
            _ => MAX_CBV_SRV_UAV_DESCRIPTORS,
        }
    }
}

/// 描述符堆描述信息
#[derive(Debug, Clone)]
pub struct DescriptorHeapDesc {
    pub heap_type: DescriptorHeapType,
    pub capacity: u32,
    pub shader_visible: bool,
    pub name: Option<String>,
}

impl DescriptorHeapDesc {
    pub fn new(heap_type: DescriptorHeapType, capacity: u32) -> Self {
        Self {
            heap_type,
            capacity,
            shader_visible: heap_type.default_shader_visible(),
            name: None,
        }
    }

    /// 设置调试名称
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 设置着色器可见性
    pub fn with_shader_visible(mut self, visible: bool) -> Self {
        self.shader_visible = visible;
        self
    }

    /// 创建 RTV 堆描述符
    pub fn rtv(capacity: u32) -> Self {
        Self::new(DescriptorHeapType::RenderTarget, capacity).with_name("RTV Heap")
    }

    /// 创建 DSV 堆描述符
    pub fn dsv(capacity: u32) -> Self {
        Self::new(DescriptorHeapType::DepthStencil, capacity).with_name("DSV Heap")
    }

    /// 创建着色器可见的 SRV/CBV/UAV 堆描述符
    pub fn shader_resource(capacity: u32) -> Self {
        Self::new(DescriptorHeapType::ShaderResource, capacity)
            .with_shader_visible(true)
            .with_name("SRV/CBV/UAV Heap")
    }

    /// 创建不可见的 UAV 堆描述符
    pub fn unordered_access(capacity: u32) -> Self {
        Self::new(DescriptorHeapType::UnorderedAccess, capacity)
            .with_shader_visible(false)
            .with_name("UAV Heap")
    }

    /// 按堆类型创建描述符
    pub fn for_type(heap_type: DescriptorHeapType, capacity: u32) -> Self {
        match heap_type {
            DescriptorHeapType::RenderTarget => Self::rtv(capacity),
            DescriptorHeapType::DepthStencil => Self::dsv(capacity),
            DescriptorHeapType::ShaderResource => Self::shader_resource(capacity),
            DescriptorHeapType::UnorderedAccess => Self::unordered_access(capacity),
            DescriptorHeapType::Sampler => Self::new(heap_type, capacity).with_name("Sampler Heap"),
        }
    }
}

/// 描述符句柄（CPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: usize,
    /// 描述符索引
    pub index: u32,
}

impl CpuDescriptorHandle {
    pub fn new(ptr: usize, index: u32) -> Self {
        Self { ptr, index }
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + count as usize * increment_size as usize,
            index: self.index + count,
        }
    }
}

/// 描述符句柄（GPU 可见）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuDescriptorHandle {
    /// 句柄指针值
    pub ptr: u64,
    /// 描述符索引
    pub index: u32,
}

impl GpuDescriptorHandle {
    pub fn new(ptr: u64, index: u32) -> Self {
        Self { ptr, index }
    }

    /// 偏移句柄
    pub fn offset(&self, count: u32, increment_size: u32) -> Self {
        Self {
            ptr: self.ptr + u64::from(count) * u64::from(increment_size),
            index: self.index + count,
        }
    }
}

/// 描述符句柄
///
/// 由它所支撑的资源视图独占；释放后被清零。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHandle {
    /// CPU 可见句柄
    pub cpu: CpuDescriptorHandle,
    /// GPU 可见句柄（仅对着色器可见的堆有效）
    pub gpu: Option<GpuDescriptorHandle>,
    /// 所属堆类型
    pub heap_type: DescriptorHeapType,
}

impl DescriptorHandle {
    /// 无效句柄
    pub fn invalid(heap_type: DescriptorHeapType) -> Self {
        Self {
            cpu: CpuDescriptorHandle::new(0, 0),
            gpu: None,
            heap_type,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cpu.ptr != 0
    }

    /// 槽位索引
    pub fn index(&self) -> u32 {
        self.cpu.index
    }

    pub fn is_shader_visible(&self) -> bool {
        self.gpu.is_some()
    }

    fn invalidate(&mut self) {
        *self = Self::invalid(self.heap_type);
    }
}

/// 描述符堆统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorHeapStats {
    pub heap_type: DescriptorHeapType,
    pub capacity: u32,
    /// 正在使用的槽位数
    pub used: u32,
    /// 已释放但尚未回收的槽位数
    pub pending_free: u32,
    /// 可立即分配的槽位数
    pub available: u32,
    /// 使用率 (0.0 - 1.0)
    pub usage_ratio: f32,
}

impl DescriptorHeapStats {
    fn new(heap_type: DescriptorHeapType, capacity: u32, occupied: u32, pending_free: u32) -> Self {
        let used = occupied - pending_free;
        Self {
            heap_type,
            capacity,
            used,
            pending_free,
            available: capacity - occupied,
            usage_ratio: if capacity > 0 { used as f32 / capacity as f32 } else { 0.0 },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeferredFree {
    frame_number: u64,
    index: u32,
}

struct HeapState<H> {
    raw: Option<H>,
    free_handles: Vec<u32>,
    /// 已占用槽位数，包括等待回收的槽位
    size: u32,
    live: Vec<bool>,
    deferred: [Vec<DeferredFree>; FRAME_BUFFER_COUNT],
}

impl<H> HeapState<H> {
    fn pending_count(&self) -> usize {
        self.deferred.iter().map(Vec::len).sum()
    }

    fn fold_back(&mut self, index: u32) {
        self.size -= 1;
        self.free_handles[self.size as usize] = index;
    }

    fn drain_all(&mut self) -> usize {
        let records: Vec<DeferredFree> = self.deferred.iter_mut().flat_map(std::mem::take).collect();
        for record in &records {
            self.fold_back(record.index);
        }
        records.len()
    }
}

/// 描述符槽位堆
///
/// 所有修改操作都经过同一把互斥锁，资源加载线程可以和渲染线程同时分配和释放。
pub struct DescriptorSlotHeap<B: GpuDevice> {
    heap_type: DescriptorHeapType,
    name: String,
    capacity: u32,
    shader_visible: bool,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
    increment: u32,
    state: Mutex<HeapState<B::DescriptorHeap>>,
    timeline: Arc<FrameTimeline>,
}

impl<B: GpuDevice> DescriptorSlotHeap<B> {
    /// 创建设备堆并初始化空闲列表
    ///
    /// 容量为 0 或超过该堆类型的硬件限制时失败，这是调用方的配置错误。
    pub fn new(device: &B, desc: &DescriptorHeapDesc, timeline: Arc<FrameTimeline>) -> Result<Self> {
        let heap_type = desc.heap_type;
        let mut shader_visible = desc.shader_visible;
        if shader_visible && !heap_type.supports_shader_visible() {
            warn!(heap = heap_type.name(), "Heap type cannot be shader visible, ignoring flag");
            shader_visible = false;
        }

        let limit = heap_type.max_capacity(shader_visible);
        if desc.capacity == 0 || desc.capacity > limit {
            error!(heap = heap_type.name(), capacity = desc.capacity, limit, "Invalid descriptor heap capacity");
            return Err(CoreError::InvalidDescriptorCapacity {
                heap: heap_type.name(),
                capacity: desc.capacity,
                limit,
            });
        }

        let raw = device.create_descriptor_heap(heap_type, desc.capacity, shader_visible)?;
        let capacity = desc.capacity;
        let name = desc.name.clone().unwrap_or_else(|| heap_type.name().to_string());

        debug!(
            heap = %name,
            capacity,
            shader_visible,
            increment = raw.increment,
            "Descriptor heap created"
        );

        Ok(Self {
            heap_type,
            name,
            capacity,
            shader_visible,
            cpu_start: CpuDescriptorHandle::new(raw.cpu_start, 0),
            gpu_start: raw.gpu_start.map(|ptr| GpuDescriptorHandle::new(ptr, 0)),
            increment: raw.increment,
            state: Mutex::new(HeapState {
                raw: Some(raw.raw),
                free_handles: (0..capacity).collect(),
                size: 0,
                live: vec![false; capacity as usize],
                deferred: std::array::from_fn(|_| Vec::new()),
            }),
            timeline,
        })
    }

    /// 分配一个描述符槽位
    ///
    /// 堆已满时返回 `DescriptorHeapExhausted`，容量规划属于配置问题，调用方不应重试。
    pub fn allocate(&self) -> Result<DescriptorHandle> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.raw.is_none() {
            return Err(CoreError::Runtime(format!("{} has been released", self.name)));
        }

        if state.size >= self.capacity {
            error!(
                heap = %self.name,
                capacity = self.capacity,
                pending_free = state.pending_count(),
                "Descriptor heap exhausted"
            );
            return Err(CoreError::DescriptorHeapExhausted {
                heap: self.heap_type.name(),
                capacity: self.capacity,
            });
        }

        let index = state.free_handles[state.size as usize];
        state.size += 1;
        debug_assert!(!state.live[index as usize], "descriptor index issued twice");
        state.live[index as usize] = true;

        trace!(heap = %self.name, index, "Descriptor allocated");
        Ok(self.handle_at(index))
    }

    /// 释放描述符
    ///
    /// 索引在当前帧的 fence 完成后才会回到空闲列表。句柄被清零；
    /// 对无效句柄或重复释放不做任何事。
    pub fn free(&self, handle: &mut DescriptorHandle) {
        if !handle.is_valid() {
            return;
        }

        if !self.contains(handle) {
            warn!(
                heap = %self.name,
                handle_heap = handle.heap_type.name(),
                ptr = handle.cpu.ptr,
                "Ignoring free of a handle that does not belong to this heap"
            );
            return;
        }

        let index = handle.index();
        let frame_number = self.timeline.frame_number();
        let slot = FrameTimeline::slot_of(frame_number);
        {
            let mut state = self.state.lock();
            if !state.live[index as usize] {
                warn!(heap = %self.name, index, "Descriptor freed twice");
                handle.invalidate();
                return;
            }
            state.live[index as usize] = false;
            state.deferred[slot].push(DeferredFree { frame_number, index });
        }
        self.timeline.mark_pending(slot);

        trace!(heap = %self.name, index, frame_number, "Descriptor free deferred");
        handle.invalidate();
    }

    /// 回收 `frame_index` 槽位中 fence 已完成的延迟释放记录
    ///
    /// 返回回收的槽位数。尚未完成的记录保留，并重新标记该槽位。
    pub fn process_deferred_free(&self, frame_index: usize) -> Result<usize> {
        FrameTimeline::check_slot(frame_index)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.deferred[frame_index].is_empty() {
            return Ok(0);
        }

        let retired = self.timeline.retired_frame(frame_index)?;
        let records = std::mem::take(&mut state.deferred[frame_index]);
        let mut released = 0;
        for record in records {
            if retired.is_some_and(|frame| frame >= record.frame_number) {
                state.fold_back(record.index);
                released += 1;
            } else {
                state.deferred[frame_index].push(record);
            }
        }

        let remaining = state.deferred[frame_index].len();
        if remaining > 0 {
            self.timeline.mark_pending(frame_index);
        }

        trace!(heap = %self.name, frame_index, released, remaining, "Processed deferred descriptor frees");
        Ok(released)
    }

    /// 回收所有延迟释放记录，不检查 fence
    ///
    /// 只能在 flush 之后调用。
    pub fn drain_deferred_free(&self) -> usize {
        let drained = self.state.lock().drain_all();
        if drained > 0 {
            debug!(heap = %self.name, drained, "Drained deferred descriptor frees");
        }
        drained
    }

    /// 交出设备堆
    ///
    /// 先回收全部延迟记录；仍有存活句柄时记录警告。之后的分配都会失败。
    pub fn release(&self) -> Option<B::DescriptorHeap> {
        let mut state = self.state.lock();
        state.drain_all();
        if state.size > 0 {
            warn!(heap = %self.name, live = state.size, "Descriptor heap released with live handles");
        }
        state.raw.take()
    }

    /// 句柄是否属于该堆
    pub fn contains(&self, handle: &DescriptorHandle) -> bool {
        handle.heap_type == self.heap_type
            && handle.index() < self.capacity
            && handle.cpu == self.cpu_start.offset(handle.index(), self.increment)
    }

    fn handle_at(&self, index: u32) -> DescriptorHandle {
        DescriptorHandle {
            cpu: self.cpu_start.offset(index, self.increment),
            gpu: self.gpu_start.map(|gpu| gpu.offset(index, self.increment)),
            heap_type: self.heap_type,
        }
    }

    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn cpu_start(&self) -> CpuDescriptorHandle {
        self.cpu_start
    }

    pub fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.gpu_start
    }

    /// 正在使用的句柄数
    pub fn live_count(&self) -> u32 {
        let state = self.state.lock();
        state.size - state.pending_count() as u32
    }

    /// 等待回收的槽位数
    pub fn pending_free_count(&self) -> usize {
        self.state.lock().pending_count()
    }

    /// 可立即分配的槽位数
    pub fn available(&self) -> u32 {
        self.capacity - self.state.lock().size
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().raw.is_none()
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        let state = self.state.lock();
        DescriptorHeapStats::new(self.heap_type, self.capacity, state.size, state.pending_count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::FeatureLevel;
    use crate::gfx::headless::{GpuController, HeadlessDevice, HeadlessOptions};
    use crate::renderer::sync::FenceSynchronizer;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::{HashMap, HashSet};
    use std::thread;

    /// 只有 fence 和时间线的最小帧循环
    struct Harness {
        device: HeadlessDevice,
        queue: crate::gfx::headless::device::HeadlessQueue,
        sync: FenceSynchronizer<HeadlessDevice>,
        timeline: Arc<FrameTimeline>,
    }

    impl Harness {
        fn new() -> Self {
            let device = HeadlessDevice::create(&HeadlessOptions::manual(), FeatureLevel::MINIMUM).unwrap();
            let queue = device.create_command_queue().unwrap();
            let sync = FenceSynchronizer::new(&device).unwrap();
            let timeline = Arc::new(FrameTimeline::new(sync.shared_fence()));
            Self { device, queue, sync, timeline }
        }

        fn heap(&self, desc: DescriptorHeapDesc) -> DescriptorSlotHeap<HeadlessDevice> {
            DescriptorSlotHeap::new(&self.device, &desc, self.timeline.clone()).unwrap()
        }

        fn controller(&self) -> GpuController {
            self.device.controller()
        }

        fn end_frame(&self) -> crate::renderer::sync::Submission {
            let value = self.sync.signal(&self.device, &self.queue).unwrap();
            self.timeline.complete_frame(value)
        }
    }

    #[test]
    fn test_heap_type() {
        assert!(DescriptorHeapType::ShaderResource.default_shader_visible());
        assert!(!DescriptorHeapType::UnorderedAccess.default_shader_visible());
        assert!(!DescriptorHeapType::RenderTarget.supports_shader_visible());
        assert_eq!(DescriptorHeapType::RenderTarget.name(), "RTV");
        assert_eq!(DescriptorHeapType::Sampler.max_capacity(true), MAX_SHADER_VISIBLE_SAMPLERS);
        assert_eq!(DescriptorHeapType::Sampler.max_capacity(false), MAX_CBV_SRV_UAV_DESCRIPTORS);
    }

    #[test]
    fn test_heap_desc_builders() {
        let desc = DescriptorHeapDesc::rtv(100);
        assert_eq!(desc.heap_type, DescriptorHeapType::RenderTarget);
        assert_eq!(desc.capacity, 100);
        assert!(!desc.shader_visible);
        assert_eq!(desc.name, Some("RTV Heap".to_string()));

        assert!(DescriptorHeapDesc::shader_resource(128).shader_visible);
        assert!(!DescriptorHeapDesc::unordered_access(128).shader_visible);
    }

    #[test]
    fn test_handle_offset() {
        let cpu = CpuDescriptorHandle::new(1000, 0).offset(5, 32);
        assert_eq!(cpu.ptr, 1160);
        assert_eq!(cpu.index, 5);

        let gpu = GpuDescriptorHandle::new(2000, 0).offset(10, 32);
        assert_eq!(gpu.ptr, 2320);
        assert_eq!(gpu.index, 10);
    }

    #[test]
    fn test_free_list_starts_in_order() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::dsv(4));
        let indices: Vec<u32> = (0..4).map(|_| heap.allocate().unwrap().index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_handle_addresses() {
        let harness = Harness::new();
        let srv = harness.heap(DescriptorHeapDesc::shader_resource(16));
        srv.allocate().unwrap();
        let handle = srv.allocate().unwrap();

        assert_eq!(handle.cpu.ptr, srv.cpu_start().ptr + srv.increment() as usize);
        let gpu = handle.gpu.expect("shader visible heap has GPU handles");
        assert_eq!(gpu.ptr, srv.gpu_start().unwrap().ptr + u64::from(srv.increment()));
        assert!(srv.contains(&handle));

        let rtv = harness.heap(DescriptorHeapDesc::rtv(4).with_shader_visible(true));
        assert!(!rtv.is_shader_visible());
        assert!(rtv.allocate().unwrap().gpu.is_none());
    }

    #[test]
    fn test_invalid_capacity() {
        let harness = Harness::new();
        let zero = DescriptorSlotHeap::new(&harness.device, &DescriptorHeapDesc::rtv(0), harness.timeline.clone());
        assert!(matches!(zero, Err(CoreError::InvalidDescriptorCapacity { capacity: 0, .. })));

        let samplers = DescriptorHeapDesc::for_type(DescriptorHeapType::Sampler, 4096).with_shader_visible(true);
        let result = DescriptorSlotHeap::new(&harness.device, &samplers, harness.timeline.clone());
        assert!(matches!(
            result,
            Err(CoreError::InvalidDescriptorCapacity { limit: MAX_SHADER_VISIBLE_SAMPLERS, .. })
        ));
    }

    #[test]
    fn test_fill_exhaust_and_restore() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::shader_resource(8));

        let mut handles: Vec<_> = (0..8).map(|_| heap.allocate().unwrap()).collect();
        let err = heap.allocate().unwrap_err();
        assert!(matches!(err, CoreError::DescriptorHeapExhausted { capacity: 8, .. }));
        assert!(err.is_fatal());

        for handle in handles.iter_mut() {
            heap.free(handle);
            assert!(!handle.is_valid());
        }
        assert_eq!(heap.available(), 0);
        assert_eq!(heap.pending_free_count(), 8);

        harness.end_frame();
        harness.controller().complete_all();
        assert_eq!(heap.process_deferred_free(0).unwrap(), 8);
        assert_eq!(heap.available(), 8);

        let again: HashSet<u32> = (0..8).map(|_| heap.allocate().unwrap().index()).collect();
        assert_eq!(again.len(), 8);
    }

    #[test]
    fn test_free_waits_for_fence() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::rtv(4));

        let _a = heap.allocate().unwrap();
        let mut b = heap.allocate().unwrap();
        let _c = heap.allocate().unwrap();
        let _d = heap.allocate().unwrap();
        let b_index = b.index();

        // 帧 0 期间释放 B
        heap.free(&mut b);
        assert!(harness.timeline.has_pending(0));
        harness.end_frame();

        // fence 尚未完成，B 仍被排除在空闲列表之外
        assert_eq!(heap.process_deferred_free(0).unwrap(), 0);
        assert!(heap.allocate().is_err());
        assert!(harness.timeline.has_pending(0));

        harness.controller().complete_all();
        assert_eq!(heap.process_deferred_free(0).unwrap(), 1);
        assert_eq!(heap.allocate().unwrap().index(), b_index);
    }

    #[test]
    fn test_free_between_frames_waits_for_next_submission() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::unordered_access(4));
        let controller = harness.controller();

        for _ in 0..3 {
            harness.end_frame();
        }
        controller.complete_all();

        // 帧号 3 复用槽位 0，但槽位 0 只提交过帧 0
        let mut handle = heap.allocate().unwrap();
        heap.free(&mut handle);
        assert_eq!(heap.process_deferred_free(0).unwrap(), 0);

        harness.end_frame();
        assert_eq!(heap.process_deferred_free(0).unwrap(), 0);

        controller.complete_all();
        assert_eq!(heap.process_deferred_free(0).unwrap(), 1);
        assert_eq!(heap.pending_free_count(), 0);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::dsv(4));
        let mut handle = heap.allocate().unwrap();
        let mut copy = handle;

        heap.free(&mut handle);
        heap.free(&mut handle);
        heap.free(&mut copy);
        assert!(!copy.is_valid());
        assert_eq!(heap.pending_free_count(), 1);

        let mut invalid = DescriptorHandle::invalid(DescriptorHeapType::DepthStencil);
        heap.free(&mut invalid);
        assert_eq!(heap.pending_free_count(), 1);
    }

    #[test]
    fn test_foreign_handle_is_ignored() {
        let harness = Harness::new();
        let rtv = harness.heap(DescriptorHeapDesc::rtv(4));
        let dsv = harness.heap(DescriptorHeapDesc::dsv(4));

        let mut handle = rtv.allocate().unwrap();
        dsv.free(&mut handle);
        assert!(handle.is_valid());
        assert_eq!(dsv.pending_free_count(), 0);
        assert_eq!(rtv.live_count(), 1);
    }

    #[test]
    fn test_process_rejects_out_of_range_slot() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::dsv(4));
        let mut handle = heap.allocate().unwrap();
        heap.free(&mut handle);

        let result = heap.process_deferred_free(FRAME_BUFFER_COUNT);
        assert!(matches!(result, Err(CoreError::Runtime(_))));
        assert_eq!(heap.pending_free_count(), 1);
    }

    #[test]
    fn test_stats() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::rtv(10));
        let mut handle = heap.allocate().unwrap();
        heap.allocate().unwrap();
        heap.free(&mut handle);

        let stats = heap.stats();
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.used, 1);
        assert_eq!(stats.pending_free, 1);
        assert_eq!(stats.available, 8);
        assert!((stats.usage_ratio - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_release_hands_back_raw_heap() {
        let harness = Harness::new();
        let heap = harness.heap(DescriptorHeapDesc::rtv(4));
        let mut handle = heap.allocate().unwrap();
        heap.free(&mut handle);

        let raw = heap.release().expect("raw heap is still owned");
        assert_eq!(raw.capacity, 4);
        assert_eq!(heap.pending_free_count(), 0);
        assert!(heap.is_released());
        assert!(heap.allocate().is_err());
        assert!(heap.release().is_none());
    }

    #[test]
    fn test_random_sequences_never_duplicate() {
        let harness = Harness::new();
        let controller = harness.controller();
        let capacity = 32;
        let heap = harness.heap(DescriptorHeapDesc::shader_resource(capacity));
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let mut live: Vec<DescriptorHandle> = Vec::new();
        // 已释放、尚未确认回收的索引 -> 释放时的帧号
        let mut quarantine: HashMap<u32, u64> = HashMap::new();
        // 帧号 -> 该帧的 fence 值
        let mut submitted: HashMap<u64, u64> = HashMap::new();

        for _ in 0..5000 {
            match rng.gen_range(0..10) {
                0..=4 => match heap.allocate() {
                    Ok(handle) => {
                        let index = handle.index();
                        assert!(live.iter().all(|h| h.index() != index), "index {} issued twice", index);
                        if let Some(frame_number) = quarantine.remove(&index) {
                            let fence_value = submitted[&frame_number];
                            assert!(harness.timeline.completed_value().unwrap() >= fence_value);
                        }
                        live.push(handle);
                    }
                    Err(CoreError::DescriptorHeapExhausted { .. }) => {
                        assert_eq!(live.len() + heap.pending_free_count(), capacity as usize);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                },
                5..=7 if !live.is_empty() => {
                    let mut handle = live.swap_remove(rng.gen_range(0..live.len()));
                    quarantine.insert(handle.index(), harness.timeline.frame_number());
                    heap.free(&mut handle);
                }
                8 => {
                    let submission = harness.end_frame();
                    submitted.insert(submission.frame_number, submission.fence_value.value());
                    if rng.gen_bool(0.5) {
                        controller.complete_next();
                    }
                }
                _ => {
                    let slot = harness.timeline.frame_index();
                    if harness.timeline.take_pending(slot) {
                        heap.process_deferred_free(slot).unwrap();
                    }
                }
            }
            assert!(live.len() <= capacity as usize);
            assert_eq!(heap.live_count() as usize, live.len());
        }
    }

    #[test]
    fn test_concurrent_allocation() {
        let harness = Harness::new();
        let heap = Arc::new(harness.heap(DescriptorHeapDesc::shader_resource(256)));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let heap = heap.clone();
                thread::spawn(move || (0..64).map(|_| heap.allocate().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<DescriptorHandle> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        let unique: HashSet<u32> = all.iter().map(|h| h.index()).collect();
        assert_eq!(unique.len(), 256);
        assert!(heap.allocate().is_err());

        for handle in all.iter_mut() {
            heap.free(handle);
        }
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.drain_deferred_free(), 256);
        assert_eq!(heap.available(), 256);
    }
}
