//! Bounded hand-off queue between the capture and consumer threads
//!
//! The queue never blocks the producer. When it is full the configured
//! [`OverflowPolicy`] decides which frame is lost, and the loss is counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::frame_assembler::Frame;

/// What to do with a new frame when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame so the newest is always available
    #[default]
    DropOldest,
    /// Reject the incoming frame and keep what is queued
    DropNewest,
}

impl OverflowPolicy {
    /// Parse a policy from an environment variable
    pub fn from_env_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "drop-oldest" | "oldest" => Some(OverflowPolicy::DropOldest),
            "drop-newest" | "newest" => Some(OverflowPolicy::DropNewest),
            _ => None,
        }
    }
}

/// Fixed-capacity FIFO of complete frames
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    policy: OverflowPolicy,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (at least one)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a frame without blocking
    ///
    /// Returns `false` if the frame itself was rejected (`DropNewest` on a full
    /// queue). Under `DropOldest` the frame is always accepted.
    pub fn try_enqueue(&self, frame: Frame) -> bool {
        let mut frames = self.lock();

        if frames.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match self.policy {
                OverflowPolicy::DropNewest => {
                    log::trace!("Queue full, rejecting frame {}", frame.sequence());
                    return false;
                }
                OverflowPolicy::DropOldest => {
                    if let Some(evicted) = frames.pop_front() {
                        log::trace!("Queue full, evicting frame {}", evicted.sequence());
                    }
                }
            }
        }

        frames.push_back(frame);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Take the oldest frame, if any, without blocking
    pub fn try_dequeue(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    /// Frames currently queued
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of queued frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy in effect
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Frames accepted so far
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Frames lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // A panic while holding the lock can't leave the deque half-updated,
    // so a poisoned lock is still safe to use
    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
