//! 延迟释放队列
//!
//! GPU 可能仍在读取的对象不能立即销毁。`DeferredReleaseQueue` 持有这些对象，
//! 直到入队时所在帧的 fence 完成后才把它们 drop 掉。

use std::any::Any;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::sync::FrameTimeline;
use super::FRAME_BUFFER_COUNT;
use crate::core::error::Result;

struct DeferredObject {
    frame_number: u64,
    type_name: &'static str,
    object: Box<dyn Any + Send>,
}

/// 按帧槽位组织的延迟释放队列
pub struct DeferredReleaseQueue {
    timeline: Arc<FrameTimeline>,
    slots: Mutex<[Vec<DeferredObject>; FRAME_BUFFER_COUNT]>,
}

impl DeferredReleaseQueue {
    pub fn new(timeline: Arc<FrameTimeline>) -> Self {
        Self {
            timeline,
            slots: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// 把对象的销毁推迟到当前帧的 fence 完成之后
    pub fn defer<T: Send + 'static>(&self, object: T) {
        let frame_number = self.timeline.frame_number();
        let slot = FrameTimeline::slot_of(frame_number);
        let type_name = std::any::type_name::<T>();
        self.slots.lock()[slot].push(DeferredObject {
            frame_number,
            type_name,
            object: Box::new(object),
        });
        self.timeline.mark_pending(slot);
        trace!(frame_number, object = type_name, "Release deferred");
    }

    /// 销毁槽位中已经可以回收的对象，返回销毁的数量
    ///
    /// 对象在锁外 drop，drop 过程中可以再次入队。
    pub fn process(&self, slot: usize) -> Result<usize> {
        FrameTimeline::check_slot(slot)?;
        let released = {
            let mut slots = self.slots.lock();
            if slots[slot].is_empty() {
                return Ok(0);
            }

            let retired = self.timeline.retired_frame(slot)?;
            let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut slots[slot])
                .into_iter()
                .partition(|entry| retired.is_some_and(|frame| frame >= entry.frame_number));
            slots[slot] = kept;
            if !slots[slot].is_empty() {
                self.timeline.mark_pending(slot);
            }
            released
        };

        let count = released.len();
        for entry in released {
            trace!(frame_number = entry.frame_number, object = entry.type_name, "Releasing object");
            drop(entry.object);
        }
        Ok(count)
    }

    /// 销毁全部延迟对象，不检查 fence
    ///
    /// 只能在 flush 之后调用。drop 过程中新入队的对象会在同一次调用中一并销毁。
    pub fn drain_all(&self) -> usize {
        let mut total = 0;
        loop {
            let entries: Vec<DeferredObject> = {
                let mut slots = self.slots.lock();
                slots.iter_mut().flat_map(std::mem::take).collect()
            };
            if entries.is_empty() {
                break;
            }
            total += entries.len();
            drop(entries);
        }
        if total > 0 {
            debug!(released = total, "Drained deferred releases");
        }
        total
    }

    /// 等待销毁的对象数
    pub fn pending_count(&self) -> usize {
        self.slots.lock().iter().map(Vec::len).sum()
    }
}

/// 延迟释放队列的弱引用
///
/// 队列已经销毁时直接 drop 对象。
#[derive(Clone)]
pub struct DeferredReleaser {
    queue: Weak<DeferredReleaseQueue>,
}

impl DeferredReleaser {
    pub fn new(queue: &Arc<DeferredReleaseQueue>) -> Self {
        Self {
            queue: Arc::downgrade(queue),
        }
    }

    pub fn release<T: Send + 'static>(&self, object: T) {
        match self.queue.upgrade() {
            Some(queue) => queue.defer(object),
            None => drop(object),
        }
    }
}

/// 离开作用域时自动延迟释放的 GPU 对象
pub struct GpuResource<T: Send + 'static> {
    inner: Option<T>,
    releaser: DeferredReleaser,
}

impl<T: Send + 'static> GpuResource<T> {
    pub fn new(inner: T, releaser: DeferredReleaser) -> Self {
        Self {
            inner: Some(inner),
            releaser,
        }
    }

    pub fn get(&self) -> &T {
        self
    }
}

impl<T: Send + 'static> Deref for GpuResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("GpuResource accessed after release"),
        }
    }
}

impl<T: Send + 'static> DerefMut for GpuResource<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Some(inner) => inner,
            None => unreachable!("GpuResource accessed after release"),
        }
    }
}

impl<T: Send + 'static> Drop for GpuResource<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.releaser.release(inner);
        }
    }
}
