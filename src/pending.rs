//! Hand-off between a collector and the dispatcher
//!
//! A collector discovers records whose targets died and pushes them onto a
//! pending list. The dispatcher blocks until the list is non-empty, then
//! takes the whole list at once and walks it through each record's
//! `pending` link.

use crate::error::SourceError;
use crate::record::{Link, Record, RecordRef};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// The producer side consumed by the [`Dispatcher`](crate::Dispatcher)
///
/// Implementations must make `take_pending` atomic with respect to
/// concurrent pushes: every handed-off record ends up in exactly one batch.
pub trait PendingSource: Send + Sync {
    /// Block until pending work is likely available
    ///
    /// Returns [`SourceError::Closed`] once the source has shut down and
    /// holds no more work.
    fn wait_for_pending_work(&self) -> Result<(), SourceError>;

    /// Take every pending record and leave the source empty
    fn take_pending(&self) -> Result<PendingBatch, SourceError>;

    /// Non-blocking check for undelivered work
    fn has_pending_work(&self) -> bool;
}

/// Walk a chain of `pending` links, detaching each record, so that long
/// chains are never dropped recursively
fn unlink_chain(mut current: Option<Arc<Record>>) {
    while let Some(record) = current {
        current = std::mem::replace(&mut *record.pending.lock(), Link::Unlinked).into_next();
    }
}

/// A batch of records taken from a pending list, most recent first
pub struct PendingBatch {
    next: Option<Arc<Record>>,
}

impl PendingBatch {
    pub fn empty() -> Self {
        Self { next: None }
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_none()
    }
}

impl Iterator for PendingBatch {
    type Item = RecordRef;

    /// Detach and return the next record
    fn next(&mut self) -> Option<RecordRef> {
        let record = self.next.take()?;
        self.next = std::mem::replace(&mut *record.pending.lock(), Link::Unlinked).into_next();
        Some(RecordRef(record))
    }
}

impl Drop for PendingBatch {
    fn drop(&mut self) {
        unlink_chain(self.next.take());
    }
}

impl fmt::Debug for PendingBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingBatch")
            .field("empty", &self.is_empty())
            .finish()
    }
}

struct PendingHead {
    head: Option<Arc<Record>>,
    len: usize,
    closed: bool,
}

impl Drop for PendingHead {
    fn drop(&mut self) {
        unlink_chain(self.head.take());
    }
}

/// Intrusive stack of pending records with a wake-up signal
///
/// This is the hand-off structure used by [`Collector`](crate::Collector),
/// and it implements [`PendingSource`] itself, so custom producers (and
/// tests) can feed a dispatcher directly.
pub struct PendingList {
    state: Mutex<PendingHead>,
    available: Condvar,
}

impl Default for PendingList {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingList {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingHead {
                head: None,
                len: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Hand a record off to the dispatcher
    ///
    /// Moves the record from Active to Pending. Returns false, and leaves
    /// the list untouched, if the record was not Active.
    pub fn push(&self, record: &RecordRef) -> bool {
        self.push_all([Arc::clone(&record.0)]) == 1
    }

    pub(crate) fn push_all(&self, records: impl IntoIterator<Item = Arc<Record>>) -> usize {
        let mut state = self.state.lock();
        let mut pushed = 0;
        for record in records {
            if !record.activity.mark_pending() {
                continue;
            }
            *record.pending.lock() = Link::to_head(state.head.take());
            state.head = Some(record);
            pushed += 1;
        }
        state.len += pushed;
        drop(state);
        if pushed > 0 {
            self.available.notify_all();
        }
        pushed
    }

    /// Atomically take the whole list
    pub fn take_and_clear(&self) -> PendingBatch {
        let mut state = self.state.lock();
        state.len = 0;
        PendingBatch {
            next: state.head.take(),
        }
    }

    /// Number of records waiting for the dispatcher
    pub fn len(&self) -> usize {
        self.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().head.is_none()
    }

    /// Stop accepting waits once drained; wakes a blocked dispatcher
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl PendingSource for PendingList {
    fn wait_for_pending_work(&self) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        loop {
            if state.head.is_some() {
                return Ok(());
            }
            if state.closed {
                return Err(SourceError::Closed);
            }
            self.available.wait(&mut state);
        }
    }

    fn take_pending(&self) -> Result<PendingBatch, SourceError> {
        Ok(self.take_and_clear())
    }

    fn has_pending_work(&self) -> bool {
        !self.is_empty()
    }
}

impl fmt::Debug for PendingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PendingList")
            .field("len", &state.len)
            .field("closed", &state.closed)
            .finish()
    }
}
