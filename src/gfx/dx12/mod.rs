//! DirectX 12 后端（仅 Windows）
//!
//! - `context`：设备、适配器选择和 `GpuDevice` 实现
//! - `fence`：基于事件等待的 fence
//! - `descriptor`：描述符堆创建
//! - `swap_chain`：DXGI 交换链

pub mod context;
pub mod descriptor;
pub mod fence;
pub mod swap_chain;

pub use context::{Dx12CommandAllocator, Dx12CommandList, Dx12Device, Dx12Options, Dx12Queue, Dx12Resource};
pub use descriptor::Dx12DescriptorHeap;
pub use fence::Dx12Fence;
pub use swap_chain::Dx12SwapChain;
