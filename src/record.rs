//! Tracking record layout
//!
//! A `Record` is the bookkeeping node associated one-to-one with an
//! observed target. It is shared through `Arc` between the user's handle,
//! the collector's tracking list, the pending list, a notification queue
//! and (for cleanup records) the cleaner's registry.

use crate::cleaner::Cleanup;
use crate::queue::QueueShared;
use crate::state::{Activity, AtomicActivity, AtomicQueueTag, QueueTag};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Type-erased observation of a target
pub(crate) type Referent = Weak<dyn Any + Send + Sync>;

/// How much of the target a reference lets its holder see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    /// `get()` hands out the target while it is alive
    Weak,
    /// The target can never be retrieved; only its death is observable
    Phantom,
}

/// Intrusive list link
///
/// `Terminal` marks "end of list" for a linked record and "removed" for
/// a dequeued one, which keeps it distinct from `Unlinked`.
pub(crate) enum Link {
    Unlinked,
    Terminal,
    Next(Arc<Record>),
}

impl Link {
    /// Link to the previous head of a list, or `Terminal` if it was empty
    pub fn to_head(head: Option<Arc<Record>>) -> Self {
        head.map_or(Link::Terminal, Link::Next)
    }

    pub fn into_next(self) -> Option<Arc<Record>> {
        match self {
            Link::Next(record) => Some(record),
            Link::Unlinked | Link::Terminal => None,
        }
    }

    pub fn next(&self) -> Option<&Arc<Record>> {
        match self {
            Link::Next(record) => Some(record),
            Link::Unlinked | Link::Terminal => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Link::Terminal)
    }
}

/// Queue state of a record
pub(crate) enum QueueState {
    Unregistered,
    Registered(Arc<QueueShared>),
    Enqueued,
    Dequeued,
}

impl QueueState {
    pub fn tag(&self) -> QueueTag {
        match self {
            QueueState::Unregistered => QueueTag::Unregistered,
            QueueState::Registered(_) => QueueTag::Registered,
            QueueState::Enqueued => QueueTag::Enqueued,
            QueueState::Dequeued => QueueTag::Dequeued,
        }
    }
}

/// Queue state plus the queue's `next` link, written only under the
/// owning queue's list lock
pub(crate) struct QueueSlot {
    pub state: QueueState,
    pub next: Link,
}

/// What the dispatcher does with a record once it is pending
pub(crate) enum RecordKind {
    /// Route to the associated queue, if any
    Plain,
    /// Run a one-shot action immediately
    Cleanup(Cleanup),
}

pub(crate) struct Record {
    id: u64,
    strength: Strength,
    referent: Mutex<Option<Referent>>,
    pub slot: Mutex<QueueSlot>,
    pub tag: AtomicQueueTag,
    pub activity: AtomicActivity,
    /// Chains the record while it sits in a pending list or batch
    pub pending: Mutex<Link>,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(
        referent: Referent,
        strength: Strength,
        queue: Option<Arc<QueueShared>>,
        kind: RecordKind,
    ) -> Arc<Self> {
        let state = match queue {
            Some(queue) => QueueState::Registered(queue),
            None => QueueState::Unregistered,
        };
        Arc::new(Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            strength,
            referent: Mutex::new(Some(referent)),
            tag: AtomicQueueTag::new(state.tag()),
            slot: Mutex::new(QueueSlot {
                state,
                next: Link::Unlinked,
            }),
            activity: AtomicActivity::new(Activity::Active),
            pending: Mutex::new(Link::Unlinked),
            kind,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn strength(&self) -> Strength {
        self.strength
    }

    /// Sever the observation of the target. Idempotent.
    pub fn clear(&self) {
        self.referent.lock().take();
    }

    pub fn is_cleared(&self) -> bool {
        self.referent.lock().is_none()
    }

    /// `None` once cleared, otherwise whether the target has no strong
    /// references left
    pub fn target_dead(&self) -> Option<bool> {
        self.referent
            .lock()
            .as_ref()
            .map(|referent| referent.strong_count() == 0)
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.referent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn refers_to(&self, target: *const ()) -> bool {
        match self.referent.lock().as_ref() {
            Some(referent) => std::ptr::addr_eq(referent.as_ptr(), target),
            None => false,
        }
    }

    /// Clear, then push onto the associated queue
    ///
    /// Clearing comes first so that no consumer ever pulls a record that
    /// still observes its target.
    pub fn enqueue(self: &Arc<Self>) -> bool {
        self.clear();
        let queue = match &self.slot.lock().state {
            QueueState::Registered(queue) => Arc::clone(queue),
            _ => return false,
        };
        queue.enqueue(self)
    }

    /// Racy by nature: the answer may be stale by the time it is used
    pub fn is_enqueued(&self) -> bool {
        self.tag.load() == QueueTag::Enqueued
    }

    pub fn is_cleanup(&self) -> bool {
        matches!(self.kind, RecordKind::Cleanup(_))
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("strength", &self.strength)
            .field("queue", &self.tag.load())
            .field("activity", &self.activity.load())
            .field("cleanup", &self.is_cleanup())
            .finish_non_exhaustive()
    }
}

/// Opaque, type-erased handle to a tracking record
///
/// Custom `PendingSource` implementations use it to hand records to the
/// dispatcher through a [`PendingList`](crate::PendingList).
#[derive(Clone)]
pub struct RecordRef(pub(crate) Arc<Record>);

impl RecordRef {
    /// Process-unique identifier of the record
    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn activity(&self) -> Activity {
        self.0.activity.load()
    }

    pub fn queue_tag(&self) -> QueueTag {
        self.0.tag.load()
    }

    pub fn is_cleanup(&self) -> bool {
        self.0.is_cleanup()
    }

    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
