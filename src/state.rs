//! Lifecycle states of a tracking record
//!
//! A record carries two independent states:
//! - Queue state: Unregistered, Registered, Enqueued or Dequeued
//! - Activity: Active (target may be alive), Pending (handed to the
//!   dispatcher) or Inactive (fully processed)
//!
//! The authoritative queue state lives inside the record's slot mutex.
//! `AtomicQueueTag` mirrors its discriminant so that diagnostics such as
//! `is_enqueued` can read it without taking a lock.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where a record stands with respect to its notification queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueTag {
    /// Never associated with a queue, or no longer
    Unregistered = 0,
    /// Associated with a queue, not linked into it yet
    Registered = 1,
    /// Linked into its queue
    Enqueued = 2,
    /// Pulled out of its queue by a consumer
    Dequeued = 3,
}

impl From<u8> for QueueTag {
    fn from(value: u8) -> Self {
        match value {
            1 => QueueTag::Registered,
            2 => QueueTag::Enqueued,
            3 => QueueTag::Dequeued,
            _ => QueueTag::Unregistered,
        }
    }
}

/// Progress of a record through the collector and the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Activity {
    /// Still possibly tracking a live target
    Active = 0,
    /// Handed off to the dispatcher
    Pending = 1,
    /// Fully processed
    Inactive = 2,
}

impl From<u8> for Activity {
    fn from(value: u8) -> Self {
        match value {
            0 => Activity::Active,
            1 => Activity::Pending,
            _ => Activity::Inactive,
        }
    }
}

/// Lock-free mirror of a record's queue state
pub(crate) struct AtomicQueueTag {
    inner: AtomicU8,
}

impl AtomicQueueTag {
    pub fn new(tag: QueueTag) -> Self {
        Self {
            inner: AtomicU8::new(tag as u8),
        }
    }

    pub fn load(&self) -> QueueTag {
        QueueTag::from(self.inner.load(Ordering::Acquire))
    }

    /// Publish a new tag. Callers hold the record's slot lock.
    pub fn store(&self, tag: QueueTag) {
        self.inner.store(tag as u8, Ordering::Release);
    }
}

/// Thread-safe activity storage
pub(crate) struct AtomicActivity {
    inner: AtomicU8,
}

impl AtomicActivity {
    pub fn new(activity: Activity) -> Self {
        Self {
            inner: AtomicU8::new(activity as u8),
        }
    }

    pub fn load(&self) -> Activity {
        Activity::from(self.inner.load(Ordering::Acquire))
    }

    /// Active -> Pending. Returns false if the record was not Active.
    pub fn mark_pending(&self) -> bool {
        self.transition(Activity::Active, Activity::Pending)
    }

    /// Pending -> Inactive. Returns false if the record was not Pending.
    pub fn mark_inactive(&self) -> bool {
        self.transition(Activity::Pending, Activity::Inactive)
    }

    /// Active -> Inactive, for records that leave tracking without ever
    /// being delivered (cleared, or cleaned explicitly).
    pub fn retire(&self) -> bool {
        self.transition(Activity::Active, Activity::Inactive)
    }

    fn transition(&self, from: Activity, to: Activity) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
