use crate::frame::FrameData;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Bounded per-backend frame queue that drops the oldest frame when full.
///
/// `push` never blocks; the dropped counter is shared with the backend's
/// monitor so it keeps counting across backend restarts.
pub struct FrameQueue {
    queue: ArrayQueue<FrameData>,
    dropped: Arc<AtomicU64>,
    pushed: AtomicU64,
    notify: Notify,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_counter(capacity, Arc::new(AtomicU64::new(0)))
    }

    pub fn with_counter(capacity: usize, dropped: Arc<AtomicU64>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped,
            pushed: AtomicU64::new(0),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame; returns true when an older frame was evicted
    pub fn push(&self, frame: FrameData) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        self.pushed.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(frame).is_some();
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn pop(&self) -> Option<FrameData> {
        self.queue.pop()
    }

    /// Wait for the next frame; None once closed and drained
    pub async fn next(&self) -> Option<FrameData> {
        loop {
            if let Some(frame) = self.queue.pop() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting frames and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}
