//! DX12 fence
//!
//! 每个 fence 持有一个自动重置的事件，等待通过 `SetEventOnCompletion`
//! 和 `WaitForSingleObject` 完成，不自旋。

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Graphics::Direct3D12::{ID3D12Fence, D3D12_FENCE_FLAG_NONE, ID3D12Device};
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject, INFINITE};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::GpuFence;

/// 设备移除后 `GetCompletedValue` 返回的值
const DEVICE_REMOVED_VALUE: u64 = u64::MAX;

pub struct Dx12Fence {
    pub(crate) fence: ID3D12Fence,
    event: HANDLE,
    /// 同一个事件同时只能服务一个等待者
    wait_lock: Mutex<()>,
}

// ID3D12Fence 是自由线程对象，事件句柄的使用由 wait_lock 串行化
unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}

impl Dx12Fence {
    pub(crate) fn new(device: &ID3D12Device, initial_value: u64) -> Result<Self> {
        unsafe {
            let fence: ID3D12Fence = device
                .CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)
                .map_err(|e| GraphicsError::FenceFailure(format!("CreateFence failed: {}", e)))?;
            let event = CreateEventA(None, false, false, None)
                .map_err(|e| GraphicsError::FenceFailure(format!("CreateEvent failed: {}", e)))?;
            Ok(Self {
                fence,
                event,
                wait_lock: Mutex::new(()),
            })
        }
    }
}

impl GpuFence for Dx12Fence {
    fn completed_value(&self) -> Result<u64> {
        let value = unsafe { self.fence.GetCompletedValue() };
        if value == DEVICE_REMOVED_VALUE {
            return Err(GraphicsError::DeviceLost("fence reports device removal".to_string()).into());
        }
        Ok(value)
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        if self.completed_value()? >= value {
            return Ok(true);
        }

        let _guard = self.wait_lock.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        unsafe {
            self.fence
                .SetEventOnCompletion(value, self.event)
                .map_err(|e| GraphicsError::FenceFailure(format!("SetEventOnCompletion failed: {}", e)))?;
        }

        // 之前超时的等待可能让事件残留为已触发，醒来后重新检查 fence
        loop {
            if self.completed_value()? >= value {
                return Ok(true);
            }

            let millis = match deadline {
                None => INFINITE,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    u32::try_from(remaining.as_millis()).unwrap_or(INFINITE - 1)
                }
            };

            let status = unsafe { WaitForSingleObject(self.event, millis) };
            if status == WAIT_TIMEOUT {
                return Ok(self.completed_value()? >= value);
            }
            if status != WAIT_OBJECT_0 {
                return Err(GraphicsError::FenceFailure(format!(
                    "WaitForSingleObject returned {:?}",
                    status
                ))
                .into());
            }
        }
    }
}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}
