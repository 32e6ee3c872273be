//! Reachability tracking for `Arc` targets
//!
//! The collector keeps a list of every registered record and, on each
//! sweep, hands the records whose targets lost their last strong reference
//! to the pending list. It is the producer side of the dispatcher.
//!
//! Records are tracked weakly: a record nobody holds any more cannot be
//! delivered, and the sweep simply forgets it.

use crate::error::SourceError;
use crate::pending::{PendingBatch, PendingList, PendingSource};
use crate::queue::ReferenceQueue;
use crate::record::{Record, RecordKind, Referent, Strength};
use crate::reference::Reference;
use crate::state::Activity;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Records registered with the collector
struct TrackedList(Vec<Weak<Record>>);

impl TrackedList {
    const fn new() -> Self {
        Self(Vec::new())
    }

    fn add(&mut self, record: &Arc<Record>) {
        self.0.push(Arc::downgrade(record));
    }

    /// Drop every record that can no longer be delivered and return the
    /// ones whose target died
    fn sweep(&mut self) -> Vec<Arc<Record>> {
        let mut dead = Vec::new();
        self.0.retain(|weak| {
            let Some(record) = weak.upgrade() else {
                return false;
            };
            if record.activity.load() != Activity::Active {
                return false;
            }
            match record.target_dead() {
                // Cleared references are never discovered.
                None => false,
                Some(false) => true,
                Some(true) => {
                    record.clear();
                    dead.push(record);
                    false
                }
            }
        });
        dead
    }
}

/// Producer that detects dead `Arc` targets
///
/// # Example
///
/// ```
/// use nachruf::{Collector, PendingSource, Strength};
/// use std::sync::Arc;
///
/// let collector = Collector::new();
/// let target = Arc::new(42);
/// let reference = collector.register(&target, Strength::Weak, None);
///
/// assert_eq!(collector.collect(), 0);
/// drop(target);
/// assert_eq!(collector.collect(), 1);
/// assert!(collector.has_pending_work());
/// # drop(reference);
/// ```
pub struct Collector {
    tracked: Mutex<TrackedList>,
    pending: PendingList,
    discovered: AtomicUsize,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tracked: Mutex::new(TrackedList::new()),
            pending: PendingList::new(),
            discovered: AtomicUsize::new(0),
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
        })
    }

    /// Start observing `target`
    ///
    /// With a queue, the returned reference is pushed onto it by the
    /// dispatcher once the target dies.
    pub fn register<T: Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        strength: Strength,
        queue: Option<&ReferenceQueue<T>>,
    ) -> Reference<T> {
        let referent = Arc::downgrade(target) as Referent;
        let record = Record::new(
            referent,
            strength,
            queue.map(|queue| Arc::clone(queue.shared())),
            RecordKind::Plain,
        );
        self.track(&record);
        Reference::from_record(record)
    }

    pub(crate) fn track(&self, record: &Arc<Record>) {
        self.tracked.lock().add(record);
    }

    /// Sweep the tracked records once
    ///
    /// Every record whose target has no strong references left is cleared
    /// and handed to the pending list. Returns how many were handed off.
    pub fn collect(&self) -> usize {
        let (dead, remaining) = {
            let mut tracked = self.tracked.lock();
            let dead = tracked.sweep();
            (dead, tracked.0.len())
        };
        let handed_off = self.pending.push_all(dead);
        self.discovered.fetch_add(handed_off, Ordering::Relaxed);
        tracing::debug!(handed_off, remaining, "reference sweep finished");
        handed_off
    }

    /// Records still tracked, including ones the next sweep will forget
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().0.len()
    }

    /// Total records handed off since creation
    pub fn discovered_count(&self) -> usize {
        self.discovered.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> &PendingList {
        &self.pending
    }

    /// Shut down: a dispatcher exits once the pending list is drained and
    /// a scanner stops after its current sweep
    pub fn close(&self) {
        self.pending.close();
        *self.stopped.lock() = true;
        self.stop_signal.notify_all();
    }

    /// Sweep every `interval` until the collector is closed
    pub(crate) fn scan_until_closed(&self, interval: Duration) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            MutexGuard::unlocked(&mut stopped, || {
                self.collect();
            });
            if *stopped {
                break;
            }
            let _ = self.stop_signal.wait_for(&mut stopped, interval);
        }
    }
}

impl PendingSource for Collector {
    fn wait_for_pending_work(&self) -> Result<(), SourceError> {
        self.pending.wait_for_pending_work()
    }

    fn take_pending(&self) -> Result<PendingBatch, SourceError> {
        self.pending.take_pending()
    }

    fn has_pending_work(&self) -> bool {
        self.pending.has_pending_work()
    }
}
