//! GPU 同步机制模块
//!
//! 提供 CPU-GPU 同步原语：
//!
//! - **`FenceSynchronizer`**：单调递增的 fence 值，提供 signal / wait / flush
//! - **`FrameTimeline`**：记录每个帧槽位最后一次提交的帧号和 fence 值，
//!   供描述符堆和延迟释放队列判断某一帧引用的对象是否可以回收
//!
//! # 回收规则
//!
//! 延迟记录在入队时带上当前帧号 `k`（槽位为 `k % FRAME_BUFFER_COUNT`）。
//! 只有当该槽位已经提交了帧号 `>= k` 的帧，并且这次提交的 fence 值已经完成，
//! 记录才可以回收。帧号只在 `EndFrame` 之后递增，所以在两帧之间释放的对象
//! 会被记到下一帧，不会因为只等待了更早的 fence 而被提前回收。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::FRAME_BUFFER_COUNT;
use crate::core::error::{CoreError, Result};
use crate::gfx::backend::{GpuDevice, GpuFence};

/// Fence 值
///
/// 用于 CPU-GPU 同步的单调递增值，0 表示从未 signal，视为已完成。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    /// 未设置的 fence 值
    pub const UNSET: FenceValue = FenceValue(0);

    /// 创建新的Fence值
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 是否为未设置的值
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// Fence 同步器
///
/// 封装一个设备 fence 和 CPU 侧最后分配的 fence 值。
///
/// # 示例
///
/// ```ignore
/// let value = sync.signal(&device, &queue)?;
/// // ...
/// sync.wait(value, None)?;
/// ```
pub struct FenceSynchronizer<B: GpuDevice> {
    fence: Arc<B::Fence>,
    /// 最后分配的 fence 值（CPU 侧）
    last_signaled: AtomicU64,
    /// 观察到的已完成值，只增不减
    completed: AtomicU64,
    /// 保证 fence 值按递增顺序到达队列
    signal_lock: Mutex<()>,
}

impl<B: GpuDevice> FenceSynchronizer<B> {
    /// 创建 fence，初始值为 0
    pub fn new(device: &B) -> Result<Self> {
        let fence = device.create_fence(0)?;
        Ok(Self {
            fence: Arc::new(fence),
            last_signaled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            signal_lock: Mutex::new(()),
        })
    }

    /// 以 trait object 形式共享设备 fence
    pub fn shared_fence(&self) -> Arc<dyn GpuFence> {
        self.fence.clone()
    }

    /// 分配下一个 fence 值，并让队列在完成之前提交的所有工作后 signal 到该值
    pub fn signal(&self, device: &B, queue: &B::Queue) -> Result<FenceValue> {
        let _guard = self.signal_lock.lock();
        let value = FenceValue::new(self.last_signaled.fetch_add(1, Ordering::AcqRel) + 1);
        device.signal(queue, &self.fence, value.value())?;
        Ok(value)
    }

    /// 阻塞直到 `value` 完成或超时
    ///
    /// `timeout` 为 `None` 时无限等待。超时返回可恢复的 `FenceTimeout`。
    pub fn wait(&self, value: FenceValue, timeout: Option<Duration>) -> Result<()> {
        if value.is_unset() {
            return Ok(());
        }

        let last = self.last_signaled.load(Ordering::Acquire);
        if value.value() > last {
            return Err(CoreError::Runtime(format!(
                "fence value {} has not been signaled (last signaled {})",
                value.value(),
                last
            )));
        }

        if self.is_complete(value)? {
            return Ok(());
        }

        debug!(fence_value = value.value(), ?timeout, "Waiting for GPU");
        if !self.fence.wait_for(value.value(), timeout)? {
            return Err(CoreError::FenceTimeout {
                value: value.value(),
                timeout: timeout.unwrap_or_default(),
            });
        }
        self.completed.fetch_max(value.value(), Ordering::AcqRel);
        debug!(fence_value = value.value(), "GPU wait completed");
        Ok(())
    }

    /// signal 并等待，保证之前提交的所有 GPU 工作都已完成
    pub fn flush(&self, device: &B, queue: &B::Queue) -> Result<FenceValue> {
        let value = self.signal(device, queue)?;
        self.wait(value, None)?;
        Ok(value)
    }

    /// 最后分配的 fence 值
    pub fn last_signaled(&self) -> FenceValue {
        FenceValue::new(self.last_signaled.load(Ordering::Acquire))
    }

    /// 设备已完成的 fence 值
    pub fn completed_value(&self) -> Result<FenceValue> {
        let observed = self.fence.completed_value()?;
        let previous = self.completed.fetch_max(observed, Ordering::AcqRel);
        Ok(FenceValue::new(previous.max(observed)))
    }

    /// 检查特定 fence 值是否已完成
    pub fn is_complete(&self, value: FenceValue) -> Result<bool> {
        if value.is_unset() {
            return Ok(true);
        }
        Ok(self.completed_value()? >= value)
    }
}

/// 一次帧提交
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub frame_number: u64,
    pub fence_value: FenceValue,
}

/// 帧时间线
///
/// 由帧命令单元推进，被描述符堆和延迟释放队列共享。
pub struct FrameTimeline {
    frame_number: AtomicU64,
    submissions: Mutex<[Option<Submission>; FRAME_BUFFER_COUNT]>,
    pending: [AtomicBool; FRAME_BUFFER_COUNT],
    fence: Arc<dyn GpuFence>,
    completed: AtomicU64,
}

impl FrameTimeline {
    pub fn new(fence: Arc<dyn GpuFence>) -> Self {
        Self {
            frame_number: AtomicU64::new(0),
            submissions: Mutex::new([None; FRAME_BUFFER_COUNT]),
            pending: std::array::from_fn(|_| AtomicBool::new(false)),
            fence,
            completed: AtomicU64::new(0),
        }
    }

    /// 帧号对应的槽位
    pub fn slot_of(frame_number: u64) -> usize {
        (frame_number % FRAME_BUFFER_COUNT as u64) as usize
    }

    /// 检查帧槽位下标，越界时返回 `Runtime` 错误
    pub fn check_slot(slot: usize) -> Result<usize> {
        if slot >= FRAME_BUFFER_COUNT {
            return Err(CoreError::Runtime(format!(
                "frame slot {} is out of range (0..{})",
                slot, FRAME_BUFFER_COUNT
            )));
        }
        Ok(slot)
    }

    /// 当前帧号，`EndFrame` 之后递增
    pub fn frame_number(&self) -> u64 {
        self.frame_number.load(Ordering::Acquire)
    }

    /// 当前帧槽位
    pub fn frame_index(&self) -> usize {
        Self::slot_of(self.frame_number())
    }

    /// 记录一次提交并进入下一帧
    pub(crate) fn complete_frame(&self, fence_value: FenceValue) -> Submission {
        let frame_number = self.frame_number();
        let submission = Submission {
            frame_number,
            fence_value,
        };
        self.submissions.lock()[Self::slot_of(frame_number)] = Some(submission);
        self.frame_number.store(frame_number + 1, Ordering::Release);
        submission
    }

    /// 槽位最后一次提交
    pub fn last_submission(&self, slot: usize) -> Option<Submission> {
        self.submissions.lock().get(slot).copied().flatten()
    }

    /// 设备已完成的 fence 值，只增不减
    pub fn completed_value(&self) -> Result<u64> {
        let observed = self.fence.completed_value()?;
        let previous = self.completed.fetch_max(observed, Ordering::AcqRel);
        Ok(previous.max(observed))
    }

    /// 槽位中已确认完成的最大帧号
    ///
    /// 槽位尚无提交，或最后一次提交的 fence 还没完成时返回 `None`。
    pub fn retired_frame(&self, slot: usize) -> Result<Option<u64>> {
        Self::check_slot(slot)?;
        let Some(submission) = self.last_submission(slot) else {
            return Ok(None);
        };
        if self.completed_value()? >= submission.fence_value.value() {
            Ok(Some(submission.frame_number))
        } else {
            Ok(None)
        }
    }

    /// 帧号为 `frame_number` 时入队的记录是否可以回收
    pub fn is_frame_retired(&self, frame_number: u64) -> Result<bool> {
        Ok(self
            .retired_frame(Self::slot_of(frame_number))?
            .is_some_and(|retired| retired >= frame_number))
    }

    /// 标记槽位有待处理的延迟工作
    pub fn mark_pending(&self, slot: usize) {
        self.pending[slot].store(true, Ordering::Release);
    }

    /// 取出并清除槽位的待处理标记
    pub fn take_pending(&self, slot: usize) -> bool {
        self.pending[slot].swap(false, Ordering::AcqRel)
    }

    pub fn has_pending(&self, slot: usize) -> bool {
        self.pending[slot].load(Ordering::Acquire)
    }
}
