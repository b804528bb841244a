//! DXGI 交换链

use raw_window_handle::RawWindowHandle;
use tracing::{debug, info};
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D12::{ID3D12CommandQueue, ID3D12Resource};
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::context::map_device_error;
use super::Dx12Resource;
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{PresentMode, SurfaceTarget};

pub const BACK_BUFFER_FORMAT: DXGI_FORMAT = DXGI_FORMAT_R8G8B8A8_UNORM;

pub struct Dx12SwapChain {
    pub swap_chain: IDXGISwapChain3,
    buffer_count: u32,
    flags: DXGI_SWAP_CHAIN_FLAG,
}

unsafe impl Send for Dx12SwapChain {}

impl Dx12SwapChain {
    pub(crate) fn create(
        factory: &IDXGIFactory4,
        queue: &ID3D12CommandQueue,
        surface: SurfaceTarget,
        width: u32,
        height: u32,
        buffer_count: u32,
        allow_tearing: bool,
    ) -> Result<Self> {
        let hwnd = match surface {
            SurfaceTarget::Window(RawWindowHandle::Win32(handle)) => {
                HWND(handle.hwnd.get() as *mut core::ffi::c_void)
            }
            SurfaceTarget::Window(_) => {
                return Err(GraphicsError::SwapchainError("expected a Win32 window handle".to_string()).into());
            }
            SurfaceTarget::Offscreen => {
                return Err(GraphicsError::SwapchainError(
                    "DX12 backend requires a window to present to".to_string(),
                )
                .into());
            }
        };

        let flags = if allow_tearing {
            DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING
        } else {
            DXGI_SWAP_CHAIN_FLAG(0)
        };

        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: width,
            Height: height,
            Format: BACK_BUFFER_FORMAT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: buffer_count,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            Flags: flags.0 as u32,
            ..Default::default()
        };

        unsafe {
            let swap_chain: IDXGISwapChain1 = factory
                .CreateSwapChainForHwnd(queue, hwnd, &desc, None, None)
                .map_err(|e| GraphicsError::SwapchainError(format!("CreateSwapChainForHwnd failed: {}", e)))?;
            let swap_chain: IDXGISwapChain3 = swap_chain
                .cast()
                .map_err(|e| GraphicsError::SwapchainError(format!("IDXGISwapChain3 unavailable: {}", e)))?;

            info!(width, height, buffers = buffer_count, tearing = allow_tearing, "Swap chain created");
            Ok(Self {
                swap_chain,
                buffer_count,
                flags,
            })
        }
    }

    pub(crate) fn back_buffers(&self) -> Result<Vec<Dx12Resource>> {
        (0..self.buffer_count)
            .map(|i| unsafe {
                self.swap_chain
                    .GetBuffer::<ID3D12Resource>(i)
                    .map(Dx12Resource)
                    .map_err(|e| GraphicsError::SwapchainError(format!("GetBuffer({}) failed: {}", i, e)).into())
            })
            .collect()
    }

    pub(crate) fn current_index(&self) -> usize {
        unsafe { self.swap_chain.GetCurrentBackBufferIndex() as usize }
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            self.swap_chain
                .ResizeBuffers(self.buffer_count, width, height, BACK_BUFFER_FORMAT, self.flags)
                .map_err(|e| map_device_error(e, |msg| GraphicsError::SwapchainError(format!("ResizeBuffers failed: {}", msg))))?;
        }
        debug!(width, height, "Swap chain buffers resized");
        Ok(())
    }

    pub(crate) fn present(&self, mode: PresentMode) -> Result<()> {
        let flags = if mode.allow_tearing && !mode.vsync && self.flags == DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING {
            DXGI_PRESENT_ALLOW_TEARING
        } else {
            DXGI_PRESENT(0)
        };
        unsafe {
            self.swap_chain
                .Present(mode.sync_interval(), flags)
                .ok()
                .map_err(|e| map_device_error(e, |msg| GraphicsError::SwapchainError(format!("Present failed: {}", msg))))?;
        }
        Ok(())
    }

    pub(crate) fn set_fullscreen(&mut self, fullscreen: bool) -> Result<()> {
        unsafe {
            self.swap_chain
                .SetFullscreenState(fullscreen, None)
                .map_err(|e| GraphicsError::SwapchainError(format!("SetFullscreenState failed: {}", e)))?;
        }
        info!(fullscreen, "Fullscreen state changed");
        Ok(())
    }
}
