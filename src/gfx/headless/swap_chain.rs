//! 模拟交换链

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::device::BackBufferRef;
use crate::core::error::{GraphicsError, Result};

/// 模拟交换链
///
/// 和 DXGI 一样，调整大小前必须释放所有后台缓冲区引用。
pub struct HeadlessSwapChain {
    width: u32,
    height: u32,
    buffer_count: u32,
    current: usize,
    fullscreen: bool,
    outstanding: Arc<AtomicUsize>,
}

impl HeadlessSwapChain {
    pub(crate) fn new(width: u32, height: u32, buffer_count: u32) -> Result<Self> {
        if width == 0 || height == 0 || buffer_count == 0 {
            return Err(GraphicsError::SwapchainError(format!(
                "invalid swap chain {}x{} with {} buffers",
                width, height, buffer_count
            ))
            .into());
        }
        Ok(Self {
            width,
            height,
            buffer_count,
            current: 0,
            fullscreen: false,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub(crate) fn acquire_reference(&self) -> BackBufferRef {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        BackBufferRef(self.outstanding.clone())
    }

    pub(crate) fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        let outstanding = self.outstanding.load(Ordering::Acquire);
        if outstanding > 0 {
            return Err(GraphicsError::SwapchainError(format!(
                "{} back buffer references must be released before resizing",
                outstanding
            ))
            .into());
        }
        if width == 0 || height == 0 {
            return Err(GraphicsError::SwapchainError(format!("invalid size {}x{}", width, height)).into());
        }
        self.width = width;
        self.height = height;
        self.current = 0;
        Ok(())
    }

    pub(crate) fn present(&mut self) {
        self.current = (self.current + 1) % self.buffer_count as usize;
    }

    pub(crate) fn set_fullscreen(&mut self, fullscreen: bool) {
        self.fullscreen = fullscreen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_rotates_buffers() {
        let mut swap_chain = HeadlessSwapChain::new(64, 64, 3).unwrap();
        assert_eq!(swap_chain.current_index(), 0);
        swap_chain.present();
        swap_chain.present();
        assert_eq!(swap_chain.current_index(), 2);
        swap_chain.present();
        assert_eq!(swap_chain.current_index(), 0);
    }

    #[test]
    fn test_resize_requires_released_buffers() {
        let mut swap_chain = HeadlessSwapChain::new(64, 64, 2).unwrap();
        let reference = swap_chain.acquire_reference();
        assert!(swap_chain.resize(128, 128).is_err());

        drop(reference);
        swap_chain.resize(128, 96).unwrap();
        assert_eq!((swap_chain.width(), swap_chain.height()), (128, 96));
    }

    #[test]
    fn test_invalid_size() {
        assert!(HeadlessSwapChain::new(0, 64, 2).is_err());
    }
}
