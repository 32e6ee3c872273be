//! User-facing handle to a tracking record
//!
//! A `Reference<T>` observes an `Arc<T>` without keeping it alive. Once the
//! last strong reference to the target is gone, the collector hands the
//! record to the dispatcher, which pushes it onto the reference's queue.

use crate::record::{Record, RecordRef, Strength};
use crate::state::{Activity, QueueTag};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Weak or phantom reference to an `Arc<T>`
///
/// Cloning a `Reference` clones the handle, not the record: both clones
/// are the same reference as far as queues and `ptr_eq` are concerned.
///
/// A reference is only delivered while something keeps its record alive.
/// If every handle is dropped before the target dies, the collector
/// forgets it silently.
pub struct Reference<T> {
    record: Arc<Record>,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            record: Arc::clone(&self.record),
            _marker: PhantomData,
        }
    }
}

impl<T> Reference<T> {
    pub(crate) fn from_record(record: Arc<Record>) -> Self {
        Self {
            record,
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &Arc<Record> {
        &self.record
    }

    /// Stop observing the target
    ///
    /// Idempotent. A cleared reference is never delivered by the collector;
    /// it can still be enqueued explicitly.
    pub fn clear(&self) {
        self.record.clear();
    }

    /// Clear the reference and push it onto its queue
    ///
    /// Returns false if the reference was created without a queue or has
    /// already been enqueued (and possibly dequeued).
    pub fn enqueue(&self) -> bool {
        self.record.enqueue()
    }

    /// Whether the reference currently sits in its queue
    ///
    /// The answer may already be stale when it is returned; use it for
    /// diagnostics only.
    pub fn is_enqueued(&self) -> bool {
        self.record.is_enqueued()
    }

    pub fn strength(&self) -> Strength {
        self.record.strength()
    }

    pub fn activity(&self) -> Activity {
        self.record.activity.load()
    }

    pub fn queue_state(&self) -> QueueTag {
        self.record.tag.load()
    }

    /// Type-erased handle for custom pending sources
    pub fn record(&self) -> RecordRef {
        RecordRef(Arc::clone(&self.record))
    }

    /// Identity comparison of the underlying records
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.record, &other.record)
    }
}

impl<T: Send + Sync + 'static> Reference<T> {
    /// The target, while it is alive and the reference has not been cleared
    ///
    /// Always `None` for phantom references.
    pub fn get(&self) -> Option<Arc<T>> {
        if self.record.strength() == Strength::Phantom {
            return None;
        }
        self.record.upgrade()?.downcast::<T>().ok()
    }

    /// Whether this reference observes `target`
    ///
    /// Works for phantom references too, since it never hands the target out.
    pub fn refers_to(&self, target: &Arc<T>) -> bool {
        self.record.refers_to(Arc::as_ptr(target) as *const ())
    }
}

impl<T> PartialEq for Reference<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Reference<T> {}

impl<T> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.record.id())
            .field("strength", &self.record.strength())
            .field("queue", &self.queue_state())
            .field("activity", &self.activity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::queue::ReferenceQueue;

    #[test]
    fn weak_get_follows_target_lifetime() {
        let collector = Collector::new();
        let target = Arc::new(String::from("alive"));
        let reference = collector.register(&target, Strength::Weak, None);
        assert_eq!(reference.get().as_deref().map(String::as_str), Some("alive"));
        assert!(reference.refers_to(&target));
        drop(target);
        assert!(reference.get().is_none());
    }

    #[test]
    fn phantom_never_yields_target() {
        let collector = Collector::new();
        let target = Arc::new(5u64);
        let reference = collector.register(&target, Strength::Phantom, None);
        assert!(reference.get().is_none());
        assert!(reference.refers_to(&target));
    }

    #[test]
    fn explicit_enqueue_clears_first() {
        let collector = Collector::new();
        let queue = ReferenceQueue::new();
        let target = Arc::new(5u64);
        let reference = collector.register(&target, Strength::Weak, Some(&queue));
        assert_eq!(reference.queue_state(), QueueTag::Registered);

        assert!(reference.enqueue());
        assert!(reference.get().is_none());
        assert!(reference.is_enqueued());
        assert!(!reference.enqueue());

        let polled = queue.poll().unwrap();
        assert_eq!(polled, reference);
        assert!(!reference.is_enqueued());
        assert_eq!(reference.queue_state(), QueueTag::Dequeued);
        assert!(!reference.enqueue());
    }

    #[test]
    fn enqueue_without_queue_returns_false() {
        let collector = Collector::new();
        let target = Arc::new(5u64);
        let reference = collector.register(&target, Strength::Weak, None);
        assert!(!reference.enqueue());
        assert!(!reference.is_enqueued());
    }

    #[test]
    fn clones_share_identity() {
        let collector = Collector::new();
        let target = Arc::new(5u64);
        let a = collector.register(&target, Strength::Weak, None);
        let b = a.clone();
        let c = collector.register(&target, Strength::Weak, None);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.record().ptr_eq(&b.record()));
    }
}
