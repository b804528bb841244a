//! DX12 描述符堆创建

use tracing::debug;
use windows::core::PCWSTR;
use windows::Win32::Graphics::Direct3D12::*;

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::RawDescriptorHeap;
use crate::renderer::descriptor::DescriptorHeapType;

/// 描述符堆
pub struct Dx12DescriptorHeap {
    pub heap: ID3D12DescriptorHeap,
    pub heap_type: DescriptorHeapType,
}

unsafe impl Send for Dx12DescriptorHeap {}

/// 核心堆类型到 D3D12 堆类型的映射
///
/// UAV 与 CBV/SRV 共用 D3D12 的 CBV_SRV_UAV 堆类型，只是由核心单独管理。
pub fn native_heap_type(heap_type: DescriptorHeapType) -> D3D12_DESCRIPTOR_HEAP_TYPE {
    match heap_type {
        DescriptorHeapType::RenderTarget => D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
        DescriptorHeapType::DepthStencil => D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
        DescriptorHeapType::ShaderResource | DescriptorHeapType::UnorderedAccess => {
            D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV
        }
        DescriptorHeapType::Sampler => D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
    }
}

pub(crate) fn create_heap(
    device: &ID3D12Device,
    heap_type: DescriptorHeapType,
    capacity: u32,
    shader_visible: bool,
) -> Result<RawDescriptorHeap<Dx12DescriptorHeap>> {
    let native_type = native_heap_type(heap_type);
    let flags = if shader_visible {
        D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
    } else {
        D3D12_DESCRIPTOR_HEAP_FLAG_NONE
    };

    unsafe {
        let heap: ID3D12DescriptorHeap = device
            .CreateDescriptorHeap(&D3D12_DESCRIPTOR_HEAP_DESC {
                Type: native_type,
                NumDescriptors: capacity,
                Flags: flags,
                NodeMask: 0,
            })
            .map_err(|e| {
                GraphicsError::DescriptorHeapCreation(format!(
                    "failed to create {} heap with {} descriptors: {}",
                    heap_type.name(),
                    capacity,
                    e
                ))
            })?;

        let name = format!("{} Descriptor Heap", heap_type.name());
        let wide_name: Vec<u16> = name.encode_utf16().chain(Some(0)).collect();
        let _ = heap.SetName(PCWSTR(wide_name.as_ptr()));

        let increment = device.GetDescriptorHandleIncrementSize(native_type);
        let cpu_start = heap.GetCPUDescriptorHandleForHeapStart().ptr;
        let gpu_start = shader_visible.then(|| heap.GetGPUDescriptorHandleForHeapStart().ptr);

        debug!(
            heap = heap_type.name(),
            capacity,
            shader_visible,
            increment,
            "D3D12 descriptor heap created"
        );

        Ok(RawDescriptorHeap {
            raw: Dx12DescriptorHeap { heap, heap_type },
            cpu_start,
            gpu_start,
            increment,
        })
    }
}
