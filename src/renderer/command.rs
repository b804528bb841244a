//! 帧命令单元
//!
//! 拥有命令队列、每个帧槽位一对命令分配器/命令列表，以及 `FenceSynchronizer`。
//! 驱动每帧的录制与提交，并轮转帧槽位。
//!
//! # 帧槽位状态
//!
//! ```text
//! Idle -> Recording -> Submitted -> (fence 完成后) Idle
//! ```
//!
//! `begin_frame` 是唯一的同步点：复用槽位之前等待该槽位上次记录的 fence 值，
//! 保证 CPU 不会重置 GPU 仍在读取的命令分配器。最初的 `FRAME_BUFFER_COUNT`
//! 帧没有记录过 fence 值，不会阻塞。

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::sync::{FenceSynchronizer, FenceValue, FrameTimeline, Submission};
use super::FRAME_BUFFER_COUNT;
use crate::core::error::{CoreError, Result};
use crate::frame_trace;
use crate::gfx::backend::GpuDevice;

/// 帧槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSlotState {
    /// 可以开始录制
    Idle,
    /// 正在录制
    Recording,
    /// 已提交，等待 fence
    Submitted,
}

struct FrameSlot<B: GpuDevice> {
    allocator: B::CommandAllocator,
    list: B::CommandList,
    fence_value: FenceValue,
    state: FrameSlotState,
}

/// 帧命令单元
pub struct FrameCommandUnit<B: GpuDevice> {
    slots: Vec<FrameSlot<B>>,
    sync: FenceSynchronizer<B>,
    timeline: Arc<FrameTimeline>,
    queue: B::Queue,
    wait_timeout: Option<Duration>,
}

impl<B: GpuDevice> FrameCommandUnit<B> {
    /// 创建队列、fence 和所有帧槽位
    ///
    /// `wait_timeout` 为 `None` 时 `begin_frame` 无限等待。
    pub fn new(device: &B, wait_timeout: Option<Duration>) -> Result<Self> {
        let queue = device.create_command_queue()?;
        let sync = FenceSynchronizer::new(device)?;
        let timeline = Arc::new(FrameTimeline::new(sync.shared_fence()));

        let slots = (0..FRAME_BUFFER_COUNT)
            .map(|_| {
                let allocator = device.create_command_allocator()?;
                let list = device.create_command_list(&allocator)?;
                Ok(FrameSlot {
                    allocator,
                    list,
                    fence_value: FenceValue::UNSET,
                    state: FrameSlotState::Idle,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(frame_count = FRAME_BUFFER_COUNT, ?wait_timeout, "Frame command unit created");

        Ok(Self {
            slots,
            sync,
            timeline,
            queue,
            wait_timeout,
        })
    }

    /// 开始一帧
    ///
    /// 等待当前槽位上次提交的 fence 完成，然后重置它的分配器和命令列表。
    /// 等待超时返回可恢复的 `FenceTimeout`，槽位保持不变。
    pub fn begin_frame(&mut self, device: &B) -> Result<usize> {
        let index = self.timeline.frame_index();
        let slot = &mut self.slots[index];
        if slot.state == FrameSlotState::Recording {
            return Err(CoreError::Runtime(format!("frame slot {} is already recording", index)));
        }

        self.sync.wait(slot.fence_value, self.wait_timeout)?;
        slot.state = FrameSlotState::Idle;

        device.reset_command_list(&mut slot.allocator, &mut slot.list)?;
        slot.state = FrameSlotState::Recording;

        frame_trace!(
            frame_index = index,
            frame_number = self.timeline.frame_number(),
            "Frame recording started"
        );
        Ok(index)
    }

    /// 结束一帧
    ///
    /// 关闭并提交命令列表，调用 `present`，signal 新的 fence 值并记录到当前槽位，
    /// 然后推进帧号。`present` 失败时仍然完成 signal，再返回它的错误。
    pub fn end_frame_with<F>(&mut self, device: &B, present: F) -> Result<Submission>
    where
        F: FnOnce() -> Result<()>,
    {
        let index = self.timeline.frame_index();
        let slot = &mut self.slots[index];
        if slot.state != FrameSlotState::Recording {
            return Err(CoreError::Runtime(format!(
                "end_frame called while frame slot {} is {:?}",
                index, slot.state
            )));
        }

        device.close_command_list(&mut slot.list)?;
        device.execute_command_list(&self.queue, &slot.list)?;
        slot.state = FrameSlotState::Submitted;

        let presented = present();

        let fence_value = self.sync.signal(device, &self.queue)?;
        slot.fence_value = fence_value;
        let submission = self.timeline.complete_frame(fence_value);

        frame_trace!(
            frame_index = index,
            frame_number = submission.frame_number,
            fence_value = fence_value.value(),
            "Frame submitted"
        );

        presented?;
        Ok(submission)
    }

    /// 结束一帧，不呈现
    pub fn end_frame(&mut self, device: &B) -> Result<Submission> {
        self.end_frame_with(device, || Ok(()))
    }

    /// 等待所有已提交的 GPU 工作完成
    pub fn flush(&mut self, device: &B) -> Result<FenceValue> {
        let value = self.sync.flush(device, &self.queue)?;
        for slot in &mut self.slots {
            if slot.state == FrameSlotState::Submitted {
                slot.state = FrameSlotState::Idle;
            }
        }
        debug!(fence_value = value.value(), "Command queue flushed");
        Ok(value)
    }

    /// 当前正在录制的命令列表
    pub fn command_list(&mut self) -> Option<&mut B::CommandList> {
        let slot = &mut self.slots[self.timeline.frame_index()];
        (slot.state == FrameSlotState::Recording).then_some(&mut slot.list)
    }

    pub(crate) fn recording_list(&mut self) -> Result<&mut B::CommandList> {
        self.command_list()
            .ok_or_else(|| CoreError::Runtime("no frame is recording".to_string()))
    }

    pub fn is_recording(&self) -> bool {
        self.slots[self.timeline.frame_index()].state == FrameSlotState::Recording
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    pub fn sync(&self) -> &FenceSynchronizer<B> {
        &self.sync
    }

    pub fn timeline(&self) -> &Arc<FrameTimeline> {
        &self.timeline
    }

    /// 当前帧槽位
    pub fn frame_index(&self) -> usize {
        self.timeline.frame_index()
    }

    pub fn frame_number(&self) -> u64 {
        self.timeline.frame_number()
    }

    pub fn slot_state(&self, index: usize) -> Result<FrameSlotState> {
        Ok(self.slots[FrameTimeline::check_slot(index)?].state)
    }

    /// 槽位上次记录的 fence 值
    pub fn slot_fence_value(&self, index: usize) -> Result<FenceValue> {
        Ok(self.slots[FrameTimeline::check_slot(index)?].fence_value)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    pub fn set_wait_timeout(&mut self, timeout: Option<Duration>) {
        self.wait_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::FeatureLevel;
    use crate::gfx::headless::{CompletionMode, HeadlessDevice, HeadlessOptions, RecordedCommand};
    use crate::renderer::descriptor::CpuDescriptorHandle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn manual_device() -> HeadlessDevice {
        HeadlessDevice::create(&HeadlessOptions::manual(), FeatureLevel::MINIMUM).unwrap()
    }

    #[test]
    fn test_first_frames_do_not_block() {
        let device = manual_device();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();

        for expected in 0..FRAME_BUFFER_COUNT {
            assert_eq!(unit.begin_frame(&device).unwrap(), expected);
            let submission = unit.end_frame(&device).unwrap();
            assert_eq!(submission.frame_number, expected as u64);
            assert_eq!(submission.fence_value.value(), expected as u64 + 1);
            assert_eq!(unit.slot_state(expected).unwrap(), FrameSlotState::Submitted);
        }

        assert_eq!(unit.frame_index(), 0);
        assert_eq!(unit.frame_number(), FRAME_BUFFER_COUNT as u64);
        assert_eq!(device.controller().pending_operations(), FRAME_BUFFER_COUNT * 2);
    }

    #[test]
    fn test_reused_slot_waits_for_fence() {
        let device = manual_device();
        let controller = device.controller();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();
        for _ in 0..FRAME_BUFFER_COUNT {
            unit.begin_frame(&device).unwrap();
            unit.end_frame(&device).unwrap();
        }

        let released = Arc::new(AtomicBool::new(false));
        let worker = {
            let released = released.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                released.store(true, Ordering::SeqCst);
                controller.complete_through(1);
            })
        };

        // 槽位 0 的 fence 值为 1
        assert_eq!(unit.begin_frame(&device).unwrap(), 0);
        assert!(released.load(Ordering::SeqCst));
        assert!(unit.is_recording());
        worker.join().unwrap();
    }

    #[test]
    fn test_begin_frame_timeout_is_recoverable() {
        let device = manual_device();
        let controller = device.controller();
        let mut unit = FrameCommandUnit::new(&device, Some(Duration::from_millis(10))).unwrap();
        for _ in 0..FRAME_BUFFER_COUNT {
            unit.begin_frame(&device).unwrap();
            unit.end_frame(&device).unwrap();
        }

        let err = unit.begin_frame(&device).unwrap_err();
        assert!(matches!(err, CoreError::FenceTimeout { value: 1, .. }));
        assert!(!err.is_fatal());
        assert_eq!(unit.slot_state(0).unwrap(), FrameSlotState::Submitted);

        controller.complete_all();
        assert_eq!(unit.begin_frame(&device).unwrap(), 0);
    }

    #[test]
    fn test_state_errors() {
        let device = manual_device();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();

        assert!(unit.end_frame(&device).is_err());
        assert!(unit.command_list().is_none());

        unit.begin_frame(&device).unwrap();
        assert!(unit.begin_frame(&device).is_err());
        assert!(unit.command_list().is_some());
    }

    #[test]
    fn test_slot_queries_reject_out_of_range_index() {
        let device = manual_device();
        let unit = FrameCommandUnit::new(&device, None).unwrap();

        assert_eq!(unit.slot_state(FRAME_BUFFER_COUNT - 1).unwrap(), FrameSlotState::Idle);
        assert!(matches!(unit.slot_state(FRAME_BUFFER_COUNT), Err(CoreError::Runtime(_))));
        assert!(matches!(unit.slot_fence_value(FRAME_BUFFER_COUNT), Err(CoreError::Runtime(_))));
    }

    #[test]
    fn test_present_error_still_signals() {
        let device = manual_device();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();
        unit.begin_frame(&device).unwrap();

        let err = unit
            .end_frame_with(&device, || Err(CoreError::Runtime("present failed".to_string())))
            .unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
        assert_eq!(unit.frame_number(), 1);
        assert_eq!(unit.slot_fence_value(0).unwrap().value(), 1);
    }

    #[test]
    fn test_recorded_commands_reach_queue() {
        let device = manual_device();
        let controller = device.controller();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();
        let target = device.create_buffer(64, "target").unwrap();

        unit.begin_frame(&device).unwrap();
        let list = unit.recording_list().unwrap();
        device
            .record_clear(list, &target, CpuDescriptorHandle::new(0x10, 0), [0.0, 0.0, 0.0, 1.0])
            .unwrap();
        assert_eq!(list.commands().len(), 3);
        assert!(matches!(list.commands()[1], RecordedCommand::ClearRenderTarget { rtv: 0x10, .. }));
        unit.end_frame(&device).unwrap();

        assert_eq!(controller.executed_command_lists(), 1);
    }

    #[test]
    fn test_flush_with_threaded_completion() {
        let options = HeadlessOptions {
            completion: CompletionMode::Threaded {
                latency: Duration::from_millis(1),
            },
            ..HeadlessOptions::default()
        };
        let device = HeadlessDevice::create(&options, FeatureLevel::MINIMUM).unwrap();
        let mut unit = FrameCommandUnit::new(&device, None).unwrap();

        for _ in 0..5 {
            unit.begin_frame(&device).unwrap();
            unit.end_frame(&device).unwrap();
        }
        let value = unit.flush(&device).unwrap();
        assert_eq!(value.value(), 6);
        assert!(unit.sync().is_complete(value).unwrap());
        for index in 0..FRAME_BUFFER_COUNT {
            assert_eq!(unit.slot_state(index).unwrap(), FrameSlotState::Idle);
        }
    }
}
