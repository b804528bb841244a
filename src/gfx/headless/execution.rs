//! 模拟 GPU 的执行时间线
//!
//! 队列上的操作（执行命令列表、signal fence）严格按提交顺序退休。
//! 退休方式由 `CompletionMode` 决定：立即、手动（测试驱动）或后台线程。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{GpuFence, PresentMode};

/// 模拟 GPU 完成工作的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionMode {
    /// 提交时立即完成
    Immediate,
    /// 只有调用 `GpuController::complete_*` 时才完成
    Manual,
    /// 后台线程按顺序完成，每个命令列表耗时 `latency`
    Threaded { latency: Duration },
}

/// 队列上的一个操作
pub(crate) enum GpuOp {
    Execute { executing: Arc<AtomicUsize> },
    Signal { fence: Arc<FenceInner>, value: u64 },
}

impl GpuOp {
    /// 完成该操作，返回 signal 的值
    pub(crate) fn retire(self) -> Option<u64> {
        match self {
            GpuOp::Execute { executing } => {
                executing.fetch_sub(1, Ordering::AcqRel);
                None
            }
            GpuOp::Signal { fence, value } => {
                fence.advance(value);
                Some(value)
            }
        }
    }
}

/// 设备、fence、资源共享的状态
pub(crate) struct GpuShared {
    pub(crate) mode: CompletionMode,
    pending: Mutex<VecDeque<GpuOp>>,
    pub(crate) lost: Arc<AtomicBool>,
    fences: Mutex<Vec<Weak<FenceInner>>>,
    pub(crate) live_resources: AtomicUsize,
    pub(crate) allocated_bytes: AtomicU64,
    pub(crate) executed_lists: AtomicU64,
    pub(crate) render_target_views: AtomicU64,
    pub(crate) presents: AtomicU64,
    pub(crate) last_present: Mutex<Option<PresentMode>>,
    pub(crate) fullscreen: AtomicBool,
    /// 下一次全屏切换失败
    pub(crate) reject_fullscreen: AtomicBool,
}

impl GpuShared {
    pub(crate) fn new(mode: CompletionMode) -> Self {
        Self {
            mode,
            pending: Mutex::new(VecDeque::new()),
            lost: Arc::new(AtomicBool::new(false)),
            fences: Mutex::new(Vec::new()),
            live_resources: AtomicUsize::new(0),
            allocated_bytes: AtomicU64::new(0),
            executed_lists: AtomicU64::new(0),
            render_target_views: AtomicU64::new(0),
            presents: AtomicU64::new(0),
            last_present: Mutex::new(None),
            fullscreen: AtomicBool::new(false),
            reject_fullscreen: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn check_lost(&self) -> Result<()> {
        if self.is_lost() {
            return Err(GraphicsError::DeviceLost("headless device was removed".to_string()).into());
        }
        Ok(())
    }

    pub(crate) fn register_fence(&self, fence: &Arc<FenceInner>) {
        let mut fences = self.fences.lock();
        fences.retain(|f| f.strong_count() > 0);
        fences.push(Arc::downgrade(fence));
    }

    /// 立即或手动模式下入队
    pub(crate) fn enqueue(&self, op: GpuOp) {
        let mut pending = self.pending.lock();
        if self.mode == CompletionMode::Immediate {
            // 先退休之前积压的操作，保持顺序
            while let Some(prev) = pending.pop_front() {
                prev.retire();
            }
            op.retire();
        } else {
            pending.push_back(op);
        }
    }

    fn lose(&self) {
        self.lost.store(true, Ordering::Release);
        for fence in self.fences.lock().iter().filter_map(Weak::upgrade) {
            // 持锁通知，避免等待方错过唤醒
            let _guard = fence.value.lock();
            fence.cond.notify_all();
        }
    }
}

/// fence 的共享部分
pub(crate) struct FenceInner {
    value: Mutex<u64>,
    cond: Condvar,
    lost: Arc<AtomicBool>,
}

impl FenceInner {
    fn advance(&self, value: u64) {
        let mut current = self.value.lock();
        if value > *current {
            *current = value;
        }
        self.cond.notify_all();
    }
}

/// 模拟 fence
pub struct HeadlessFence {
    pub(crate) inner: Arc<FenceInner>,
}

impl HeadlessFence {
    pub(crate) fn new(shared: &GpuShared, initial_value: u64) -> Self {
        let inner = Arc::new(FenceInner {
            value: Mutex::new(initial_value),
            cond: Condvar::new(),
            lost: shared.lost.clone(),
        });
        shared.register_fence(&inner);
        Self { inner }
    }
}

impl GpuFence for HeadlessFence {
    fn completed_value(&self) -> Result<u64> {
        if self.inner.lost.load(Ordering::Acquire) {
            return Err(GraphicsError::DeviceLost("fence queried after device removal".to_string()).into());
        }
        Ok(*self.inner.value.lock())
    }

    fn wait_for(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.inner.value.lock();
        loop {
            if self.inner.lost.load(Ordering::Acquire) {
                return Err(GraphicsError::DeviceLost(format!(
                    "device removed while waiting for fence value {}",
                    value
                ))
                .into());
            }
            if *current >= value {
                return Ok(true);
            }
            match deadline {
                None => self.inner.cond.wait(&mut current),
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut current, deadline).timed_out() {
                        return Ok(*current >= value);
                    }
                }
            }
        }
    }
}

/// 资源存活计数
///
/// 创建时计数加一，析构时减一，用来验证延迟释放确实销毁了对象。
pub(crate) struct LiveToken {
    shared: Arc<GpuShared>,
    bytes: u64,
}

impl LiveToken {
    pub(crate) fn new(shared: &Arc<GpuShared>, bytes: u64) -> Self {
        shared.live_resources.fetch_add(1, Ordering::AcqRel);
        shared.allocated_bytes.fetch_add(bytes, Ordering::AcqRel);
        Self {
            shared: shared.clone(),
            bytes,
        }
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.shared.live_resources.fetch_sub(1, Ordering::AcqRel);
        self.shared.allocated_bytes.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// 从测试或工具代码驱动模拟 GPU
#[derive(Clone)]
pub struct GpuController {
    pub(crate) shared: Arc<GpuShared>,
}

impl GpuController {
    /// 完成队列中直到下一次 signal（含）的操作，返回 signal 的值
    pub fn complete_next(&self) -> Option<u64> {
        let mut pending = self.shared.pending.lock();
        while let Some(op) = pending.pop_front() {
            if let Some(value) = op.retire() {
                return Some(value);
            }
        }
        None
    }

    /// 完成操作直到 signal 了不小于 `value` 的值
    pub fn complete_through(&self, value: u64) -> Option<u64> {
        let mut pending = self.shared.pending.lock();
        let mut last = None;
        while let Some(op) = pending.pop_front() {
            if let Some(signaled) = op.retire() {
                last = Some(signaled);
                if signaled >= value {
                    break;
                }
            }
        }
        last
    }

    /// 完成所有积压的操作，返回最后一次 signal 的值
    pub fn complete_all(&self) -> Option<u64> {
        let mut pending = self.shared.pending.lock();
        let mut last = None;
        while let Some(op) = pending.pop_front() {
            if let Some(value) = op.retire() {
                last = Some(value);
            }
        }
        last
    }

    /// 尚未完成的队列操作数
    pub fn pending_operations(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// 模拟设备移除，之后所有设备调用和 fence 等待都会失败
    pub fn lose_device(&self) {
        self.shared.lose();
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// 存活的资源数（缓冲区、后台缓冲区、描述符堆）
    pub fn live_resources(&self) -> usize {
        self.shared.live_resources.load(Ordering::Acquire)
    }

    pub fn executed_command_lists(&self) -> u64 {
        self.shared.executed_lists.load(Ordering::Acquire)
    }

    pub fn render_target_views_created(&self) -> u64 {
        self.shared.render_target_views.load(Ordering::Acquire)
    }

    pub fn present_count(&self) -> u64 {
        self.shared.presents.load(Ordering::Acquire)
    }

    pub fn last_present(&self) -> Option<PresentMode> {
        *self.shared.last_present.lock()
    }

    pub fn is_fullscreen(&self) -> bool {
        self.shared.fullscreen.load(Ordering::Acquire)
    }

    /// 让下一次全屏切换失败，模拟 DXGI 暂时不允许切换
    pub fn reject_next_fullscreen(&self) {
        self.shared.reject_fullscreen.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manual() -> Arc<GpuShared> {
        Arc::new(GpuShared::new(CompletionMode::Manual))
    }

    #[test]
    fn test_signals_retire_in_order() {
        let shared = manual();
        let controller = GpuController { shared: shared.clone() };
        let fence = HeadlessFence::new(&shared, 0);
        let executing = Arc::new(AtomicUsize::new(1));

        shared.enqueue(GpuOp::Execute { executing: executing.clone() });
        shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value: 1 });
        shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value: 2 });

        assert_eq!(fence.completed_value().unwrap(), 0);
        assert_eq!(controller.complete_next(), Some(1));
        assert_eq!(executing.load(Ordering::Acquire), 0);
        assert_eq!(fence.completed_value().unwrap(), 1);
        assert_eq!(controller.complete_all(), Some(2));
        assert_eq!(controller.pending_operations(), 0);
    }

    #[test]
    fn test_complete_through() {
        let shared = manual();
        let controller = GpuController { shared: shared.clone() };
        let fence = HeadlessFence::new(&shared, 0);
        for value in 1..=3 {
            shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value });
        }

        assert_eq!(controller.complete_through(2), Some(2));
        assert_eq!(fence.completed_value().unwrap(), 2);
        assert_eq!(controller.pending_operations(), 1);
    }

    #[test]
    fn test_wait_times_out() {
        let shared = manual();
        let fence = HeadlessFence::new(&shared, 0);
        shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value: 1 });

        let reached = fence.wait_for(1, Some(Duration::from_millis(10))).unwrap();
        assert!(!reached);
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let shared = manual();
        let controller = GpuController { shared: shared.clone() };
        let fence = HeadlessFence::new(&shared, 0);
        shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value: 1 });

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            controller.complete_all();
        });
        assert!(fence.wait_for(1, None).unwrap());
        worker.join().unwrap();
    }

    #[test]
    fn test_device_loss_wakes_waiters() {
        let shared = manual();
        let controller = GpuController { shared: shared.clone() };
        let fence = HeadlessFence::new(&shared, 0);

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            controller.lose_device();
        });
        let err = fence.wait_for(5, None).unwrap_err();
        assert!(err.is_device_lost());
        worker.join().unwrap();
        assert!(fence.completed_value().is_err());
    }

    #[test]
    fn test_immediate_mode() {
        let shared = Arc::new(GpuShared::new(CompletionMode::Immediate));
        let fence = HeadlessFence::new(&shared, 0);
        shared.enqueue(GpuOp::Signal { fence: fence.inner.clone(), value: 7 });
        assert_eq!(fence.completed_value().unwrap(), 7);
    }

    #[test]
    fn test_live_token() {
        let shared = manual();
        let controller = GpuController { shared: shared.clone() };
        let token = LiveToken::new(&shared, 256);
        assert_eq!(controller.live_resources(), 1);
        assert_eq!(shared.allocated_bytes.load(Ordering::Acquire), 256);
        drop(token);
        assert_eq!(controller.live_resources(), 0);
    }
}
