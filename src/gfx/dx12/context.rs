//! DirectX 12 设备
//!
//! `Dx12Device` 把 D3D12/DXGI 对象封装成 `GpuDevice` 的实现。
//!
//! # 初始化流程
//!
//! 1. 按配置启用调试层
//! 2. 创建 DXGI 工厂
//! 3. 选择适配器：WARP，或专用显存最大的硬件适配器
//! 4. 以最低特性级别创建设备，再查询实际支持的最高级别
//! 5. 查询撕裂呈现支持

use std::mem::ManuallyDrop;

use tracing::{debug, info, warn};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::descriptor::{create_heap, Dx12DescriptorHeap};
use super::fence::Dx12Fence;
use super::swap_chain::Dx12SwapChain;
use crate::core::error::{GraphicsError, Result};
use crate::core::Config;
use crate::gfx::backend::{
    AdapterInfo, FeatureLevel, GpuDevice, PresentMode, RawDescriptorHeap, SurfaceTarget,
    VideoMemoryInfo,
};
use crate::renderer::descriptor::{CpuDescriptorHandle, DescriptorHeapType};

/// DX12 设备的创建参数
#[derive(Debug, Clone, Default)]
pub struct Dx12Options {
    /// 使用 WARP 软件适配器
    pub use_warp: bool,
    /// 启用 D3D12 调试层
    pub debug_layer: bool,
}

impl Dx12Options {
    pub fn from_config(config: &Config) -> Self {
        Self {
            use_warp: config.graphics.use_warp,
            debug_layer: config.graphics.debug_layer,
        }
    }
}

pub struct Dx12Queue(pub ID3D12CommandQueue);

pub struct Dx12CommandAllocator(pub ID3D12CommandAllocator);

pub struct Dx12CommandList(pub ID3D12GraphicsCommandList);

/// 缓冲区或后台缓冲区
pub struct Dx12Resource(pub ID3D12Resource);

unsafe impl Send for Dx12Resource {}

/// 把设备移除类的 HRESULT 映射为 `DeviceLost`，其余交给 `other`
pub(crate) fn map_device_error(
    error: windows::core::Error,
    other: impl FnOnce(String) -> GraphicsError,
) -> GraphicsError {
    let code = error.code();
    if code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_RESET || code == DXGI_ERROR_DEVICE_HUNG {
        GraphicsError::DeviceLost(error.to_string())
    } else {
        other(error.to_string())
    }
}

fn native_feature_level(level: FeatureLevel) -> D3D_FEATURE_LEVEL {
    match level {
        FeatureLevel::Level11_0 => D3D_FEATURE_LEVEL_11_0,
        FeatureLevel::Level11_1 => D3D_FEATURE_LEVEL_11_1,
        FeatureLevel::Level12_0 => D3D_FEATURE_LEVEL_12_0,
        FeatureLevel::Level12_1 => D3D_FEATURE_LEVEL_12_1,
        FeatureLevel::Level12_2 => D3D_FEATURE_LEVEL_12_2,
    }
}

fn from_native_feature_level(level: D3D_FEATURE_LEVEL) -> FeatureLevel {
    match level {
        D3D_FEATURE_LEVEL_12_2 => FeatureLevel::Level12_2,
        D3D_FEATURE_LEVEL_12_1 => FeatureLevel::Level12_1,
        D3D_FEATURE_LEVEL_12_0 => FeatureLevel::Level12_0,
        D3D_FEATURE_LEVEL_11_1 => FeatureLevel::Level11_1,
        _ => FeatureLevel::Level11_0,
    }
}

const ALL_FEATURE_LEVELS: [D3D_FEATURE_LEVEL; 5] = [
    D3D_FEATURE_LEVEL_11_0,
    D3D_FEATURE_LEVEL_11_1,
    D3D_FEATURE_LEVEL_12_0,
    D3D_FEATURE_LEVEL_12_1,
    D3D_FEATURE_LEVEL_12_2,
];

/// DirectX 12 设备
pub struct Dx12Device {
    device: ID3D12Device,
    factory: IDXGIFactory4,
    adapter: IDXGIAdapter3,
    info: AdapterInfo,
    supports_tearing: bool,
}

impl Dx12Device {
    pub fn raw(&self) -> &ID3D12Device {
        &self.device
    }

    fn enable_debug_layer() {
        unsafe {
            let mut debug: Option<ID3D12Debug> = None;
            match D3D12GetDebugInterface(&mut debug) {
                Ok(()) => {
                    if let Some(debug) = debug {
                        debug.EnableDebugLayer();
                        debug!("DX12 Debug Layer enabled");
                    }
                }
                Err(e) => warn!("Failed to enable DX12 Debug Layer: {}", e),
            }
        }
    }

    /// 在适配器上以 `minimum` 创建设备，返回设备和实际最高特性级别
    fn try_create_device(
        adapter: &IDXGIAdapter1,
        minimum: FeatureLevel,
    ) -> Option<(ID3D12Device, FeatureLevel)> {
        unsafe {
            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(adapter, native_feature_level(minimum), &mut device).ok()?;
            let device = device?;

            let requested = ALL_FEATURE_LEVELS;
            let mut levels = D3D12_FEATURE_DATA_FEATURE_LEVELS {
                NumFeatureLevels: requested.len() as u32,
                pFeatureLevelsRequested: requested.as_ptr(),
                MaxSupportedFeatureLevel: native_feature_level(minimum),
            };
            let level = match device.CheckFeatureSupport(
                D3D12_FEATURE_FEATURE_LEVELS,
                &mut levels as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<D3D12_FEATURE_DATA_FEATURE_LEVELS>() as u32,
            ) {
                Ok(()) => from_native_feature_level(levels.MaxSupportedFeatureLevel),
                Err(_) => minimum,
            };
            Some((device, level.max(minimum)))
        }
    }

    /// 选择专用显存最大且满足最低特性级别的硬件适配器
    fn select_hardware_adapter(
        factory: &IDXGIFactory4,
        minimum: FeatureLevel,
    ) -> Option<(IDXGIAdapter1, ID3D12Device, FeatureLevel, DXGI_ADAPTER_DESC1)> {
        let mut best: Option<(IDXGIAdapter1, ID3D12Device, FeatureLevel, DXGI_ADAPTER_DESC1)> = None;

        for index in 0.. {
            let adapter = match unsafe { factory.EnumAdapters1(index) } {
                Ok(adapter) => adapter,
                Err(_) => break,
            };
            let Ok(desc) = (unsafe { adapter.GetDesc1() }) else {
                continue;
            };
            if (DXGI_ADAPTER_FLAG(desc.Flags as i32) & DXGI_ADAPTER_FLAG_SOFTWARE) != DXGI_ADAPTER_FLAG_NONE {
                continue;
            }

            let name = String::from_utf16_lossy(&desc.Description);
            let Some((device, level)) = Self::try_create_device(&adapter, minimum) else {
                debug!(adapter = %name.trim_end_matches('\0'), "Adapter does not meet minimum feature level");
                continue;
            };

            let larger = best
                .as_ref()
                .map_or(true, |(_, _, _, current)| desc.DedicatedVideoMemory > current.DedicatedVideoMemory);
            if larger {
                best = Some((adapter, device, level, desc));
            }
        }

        best
    }

    fn check_tearing_support(factory: &IDXGIFactory4) -> bool {
        let Ok(factory5) = factory.cast::<IDXGIFactory5>() else {
            return false;
        };
        let mut allow: i32 = 0;
        let result = unsafe {
            factory5.CheckFeatureSupport(
                DXGI_FEATURE_PRESENT_ALLOW_TEARING,
                &mut allow as *mut _ as *mut core::ffi::c_void,
                std::mem::size_of::<i32>() as u32,
            )
        };
        result.is_ok() && allow != 0
    }

    fn transition_barrier(
        resource: &ID3D12Resource,
        before: D3D12_RESOURCE_STATES,
        after: D3D12_RESOURCE_STATES,
    ) -> D3D12_RESOURCE_BARRIER {
        D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: ManuallyDrop::new(Some(resource.clone())),
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: before,
                    StateAfter: after,
                }),
            },
        }
    }

    /// 释放屏障中持有的资源引用
    fn release_barrier(barrier: D3D12_RESOURCE_BARRIER) {
        unsafe {
            let transition = ManuallyDrop::into_inner(barrier.Anonymous.Transition);
            drop(ManuallyDrop::into_inner(transition.pResource));
        }
    }

    fn record_transition(
        list: &ID3D12GraphicsCommandList,
        resource: &ID3D12Resource,
        before: D3D12_RESOURCE_STATES,
        after: D3D12_RESOURCE_STATES,
    ) {
        let barrier = Self::transition_barrier(resource, before, after);
        unsafe {
            list.ResourceBarrier(std::slice::from_ref(&barrier));
        }
        Self::release_barrier(barrier);
    }

    fn device_lost_or(&self, error: windows::core::Error, other: impl FnOnce(String) -> GraphicsError) -> GraphicsError {
        let lost = unsafe { self.device.GetDeviceRemovedReason() };
        if lost.is_err() {
            return GraphicsError::DeviceLost(format!("{} (removed reason {:?})", error, lost));
        }
        map_device_error(error, other)
    }
}

impl GpuDevice for Dx12Device {
    type Options = Dx12Options;
    type Queue = Dx12Queue;
    type Fence = Dx12Fence;
    type CommandAllocator = Dx12CommandAllocator;
    type CommandList = Dx12CommandList;
    type DescriptorHeap = Dx12DescriptorHeap;
    type Resource = Dx12Resource;
    type SwapChain = Dx12SwapChain;

    fn create(options: &Dx12Options, minimum: FeatureLevel) -> Result<Self> {
        if options.debug_layer {
            Self::enable_debug_layer();
        }

        let factory_flags = if options.debug_layer {
            DXGI_CREATE_FACTORY_DEBUG
        } else {
            DXGI_CREATE_FACTORY_FLAGS(0)
        };
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(factory_flags) }
            .map_err(|e| GraphicsError::DeviceCreation(format!("CreateDXGIFactory2 failed: {}", e)))?;

        let (adapter, device, feature_level, desc) = if options.use_warp {
            let adapter: IDXGIAdapter1 = unsafe { factory.EnumWarpAdapter() }
                .map_err(|e| GraphicsError::DeviceCreation(format!("EnumWarpAdapter failed: {}", e)))?;
            let desc = unsafe { adapter.GetDesc1() }
                .map_err(|e| GraphicsError::DeviceCreation(format!("GetDesc1 failed: {}", e)))?;
            let (device, level) = Self::try_create_device(&adapter, minimum)
                .ok_or_else(|| GraphicsError::NoSuitableAdapter(minimum.to_string()))?;
            (adapter, device, level, desc)
        } else {
            Self::select_hardware_adapter(&factory, minimum)
                .ok_or_else(|| GraphicsError::NoSuitableAdapter(minimum.to_string()))?
        };

        let adapter: IDXGIAdapter3 = adapter
            .cast()
            .map_err(|e| GraphicsError::DeviceCreation(format!("IDXGIAdapter3 unavailable: {}", e)))?;

        let name = String::from_utf16_lossy(&desc.Description)
            .trim_end_matches('\0')
            .to_string();
        let info = AdapterInfo {
            name,
            dedicated_video_memory: desc.DedicatedVideoMemory as u64,
            feature_level,
            is_software: options.use_warp,
        };
        let supports_tearing = Self::check_tearing_support(&factory);

        info!(
            adapter = %info.name,
            feature_level = %info.feature_level,
            dedicated_mb = info.dedicated_video_memory >> 20,
            tearing = supports_tearing,
            "D3D12 device created"
        );

        Ok(Self {
            device,
            factory,
            adapter,
            info,
            supports_tearing,
        })
    }

    fn backend_name(&self) -> &'static str {
        "DirectX 12"
    }

    fn adapter_info(&self) -> &AdapterInfo {
        &self.info
    }

    fn supports_tearing(&self) -> bool {
        self.supports_tearing
    }

    fn create_command_queue(&self) -> Result<Dx12Queue> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        let queue: ID3D12CommandQueue = unsafe { self.device.CreateCommandQueue(&desc) }
            .map_err(|e| self.device_lost_or(e, |m| GraphicsError::DeviceCreation(format!("CreateCommandQueue failed: {}", m))))?;
        Ok(Dx12Queue(queue))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Dx12Fence> {
        Dx12Fence::new(&self.device, initial_value)
    }

    fn signal(&self, queue: &Dx12Queue, fence: &Dx12Fence, value: u64) -> Result<()> {
        unsafe { queue.0.Signal(&fence.fence, value) }
            .map_err(|e| self.device_lost_or(e, |m| GraphicsError::FenceFailure(format!("Signal failed: {}", m))))?;
        Ok(())
    }

    fn create_command_allocator(&self) -> Result<Dx12CommandAllocator> {
        let allocator: ID3D12CommandAllocator =
            unsafe { self.device.CreateCommandAllocator(D3D12_COMMAND_LIST_TYPE_DIRECT) }.map_err(|e| {
                self.device_lost_or(e, |m| GraphicsError::CommandExecution(format!("CreateCommandAllocator failed: {}", m)))
            })?;
        Ok(Dx12CommandAllocator(allocator))
    }

    fn create_command_list(&self, allocator: &Dx12CommandAllocator) -> Result<Dx12CommandList> {
        unsafe {
            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, D3D12_COMMAND_LIST_TYPE_DIRECT, &allocator.0, None)
                .map_err(|e| {
                    self.device_lost_or(e, |m| GraphicsError::CommandExecution(format!("CreateCommandList failed: {}", m)))
                })?;
            // 命令列表创建后处于录制状态，关闭后交给帧循环重置
            list.Close()
                .map_err(|e| GraphicsError::CommandExecution(format!("Close failed: {}", e)))?;
            Ok(Dx12CommandList(list))
        }
    }

    fn reset_command_list(&self, allocator: &mut Dx12CommandAllocator, list: &mut Dx12CommandList) -> Result<()> {
        unsafe {
            allocator.0.Reset().map_err(|e| {
                self.device_lost_or(e, |m| GraphicsError::CommandExecution(format!("allocator Reset failed: {}", m)))
            })?;
            list.0.Reset(&allocator.0, None).map_err(|e| {
                self.device_lost_or(e, |m| GraphicsError::CommandExecution(format!("command list Reset failed: {}", m)))
            })?;
        }
        Ok(())
    }

    fn close_command_list(&self, list: &mut Dx12CommandList) -> Result<()> {
        unsafe { list.0.Close() }
            .map_err(|e| self.device_lost_or(e, |m| GraphicsError::CommandExecution(format!("Close failed: {}", m))))?;
        Ok(())
    }

    fn execute_command_list(&self, queue: &Dx12Queue, list: &Dx12CommandList) -> Result<()> {
        let lists = [Some(list.0.clone().into())];
        unsafe {
            queue.0.ExecuteCommandLists(&lists);
        }
        Ok(())
    }

    fn create_descriptor_heap(
        &self,
        heap_type: DescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> Result<RawDescriptorHeap<Dx12DescriptorHeap>> {
        create_heap(&self.device, heap_type, capacity, shader_visible)
    }

    fn create_buffer(&self, size: u64, name: &str) -> Result<Dx12Resource> {
        if size == 0 {
            return Err(GraphicsError::ResourceCreation(format!("buffer '{}' has zero size", name)).into());
        }

        let heap_properties = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
            Width: size,
            Height: 1,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_UNKNOWN,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
            ..Default::default()
        };

        unsafe {
            let mut resource: Option<ID3D12Resource> = None;
            self.device
                .CreateCommittedResource(
                    &heap_properties,
                    D3D12_HEAP_FLAG_NONE,
                    &desc,
                    D3D12_RESOURCE_STATE_COMMON,
                    None,
                    &mut resource,
                )
                .map_err(|e| {
                    self.device_lost_or(e, |m| {
                        GraphicsError::ResourceCreation(format!("buffer '{}' ({} bytes): {}", name, size, m))
                    })
                })?;
            let resource = resource
                .ok_or_else(|| GraphicsError::ResourceCreation(format!("buffer '{}' was not returned", name)))?;

            let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
            let _ = resource.SetName(PCWSTR(wide_name.as_ptr()));
            Ok(Dx12Resource(resource))
        }
    }

    fn create_swap_chain(
        &self,
        queue: &Dx12Queue,
        surface: SurfaceTarget,
        width: u32,
        height: u32,
        buffer_count: u32,
    ) -> Result<Dx12SwapChain> {
        Dx12SwapChain::create(
            &self.factory,
            &queue.0,
            surface,
            width,
            height,
            buffer_count,
            self.supports_tearing,
        )
    }

    fn back_buffers(&self, swap_chain: &Dx12SwapChain) -> Result<Vec<Dx12Resource>> {
        swap_chain.back_buffers()
    }

    fn current_back_buffer_index(&self, swap_chain: &Dx12SwapChain) -> usize {
        swap_chain.current_index()
    }

    fn create_render_target_view(&self, resource: &Dx12Resource, handle: CpuDescriptorHandle) {
        unsafe {
            self.device
                .CreateRenderTargetView(&resource.0, None, D3D12_CPU_DESCRIPTOR_HANDLE { ptr: handle.ptr });
        }
    }

    fn record_clear(
        &self,
        list: &mut Dx12CommandList,
        target: &Dx12Resource,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    ) -> Result<()> {
        Self::record_transition(&list.0, &target.0, D3D12_RESOURCE_STATE_PRESENT, D3D12_RESOURCE_STATE_RENDER_TARGET);
        unsafe {
            list.0
                .ClearRenderTargetView(D3D12_CPU_DESCRIPTOR_HANDLE { ptr: rtv.ptr }, &color, None);
        }
        Self::record_transition(&list.0, &target.0, D3D12_RESOURCE_STATE_RENDER_TARGET, D3D12_RESOURCE_STATE_PRESENT);
        Ok(())
    }

    fn resize_swap_chain(&self, swap_chain: &mut Dx12SwapChain, width: u32, height: u32) -> Result<()> {
        swap_chain.resize(width, height)
    }

    fn present(&self, swap_chain: &mut Dx12SwapChain, mode: PresentMode) -> Result<()> {
        swap_chain.present(mode)
    }

    fn set_fullscreen(&self, swap_chain: &mut Dx12SwapChain, fullscreen: bool) -> Result<()> {
        swap_chain.set_fullscreen(fullscreen)
    }

    fn video_memory_info(&self) -> Result<VideoMemoryInfo> {
        let info = unsafe { self.adapter.QueryVideoMemoryInfo(0, DXGI_MEMORY_SEGMENT_GROUP_LOCAL) }
            .map_err(|e| self.device_lost_or(e, |m| GraphicsError::ResourceCreation(format!("QueryVideoMemoryInfo failed: {}", m))))?;
        Ok(VideoMemoryInfo {
            budget: info.Budget,
            current_usage: info.CurrentUsage,
            available_for_reservation: info.AvailableForReservation,
            current_reservation: info.CurrentReservation,
        })
    }

    fn set_video_memory_reservation(&self, bytes: u64) -> Result<()> {
        unsafe { self.adapter.SetVideoMemoryReservation(0, DXGI_MEMORY_SEGMENT_GROUP_LOCAL, bytes) }.map_err(|e| {
            GraphicsError::ResourceCreation(format!("SetVideoMemoryReservation({} bytes) failed: {}", bytes, e))
        })?;
        debug!(bytes, "Video memory reservation set");
        Ok(())
    }
}
