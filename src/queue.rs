//! Notification queues
//!
//! A `ReferenceQueue` is an intrusive, LIFO list of tracking records.
//! The dispatcher (or an explicit `Reference::enqueue`) pushes records
//! whose targets died; application threads pull them with `poll` or the
//! blocking `remove` variants.
//!
//! All list mutation happens under one mutex per queue, and the lock is
//! only ever held for constant-time splicing.

use crate::error::RefError;
use crate::record::{Link, QueueState, Record};
use crate::reference::Reference;
use crate::state::QueueTag;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Head of the intrusive list
struct QueueList {
    head: Option<Arc<Record>>,
    len: usize,
    /// Bumped by `interrupt`; blocked removers compare against it
    interrupts: u64,
}

impl Drop for QueueList {
    fn drop(&mut self) {
        // Unlink iteratively so that long lists don't recurse through
        // nested `Arc` drops.
        let mut current = self.head.take();
        while let Some(record) = current {
            let mut slot = record.slot.lock();
            // Surviving references must not report a queue that is gone.
            slot.state = QueueState::Dequeued;
            record.tag.store(QueueTag::Dequeued);
            current = std::mem::replace(&mut slot.next, Link::Terminal).into_next();
        }
    }
}

/// Type-erased queue state shared by every handle and registered record
pub(crate) struct QueueShared {
    list: Mutex<QueueList>,
    available: Condvar,
}

impl QueueShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            list: Mutex::new(QueueList {
                head: None,
                len: 0,
                interrupts: 0,
            }),
            available: Condvar::new(),
        })
    }

    /// Link `record` as the new head
    ///
    /// Fails if the record is no longer registered with this queue, which
    /// covers records that were enqueued or dequeued concurrently.
    pub fn enqueue(&self, record: &Arc<Record>) -> bool {
        let mut list = self.list.lock();
        if !self.link_locked(&mut list, record) {
            return false;
        }
        drop(list);
        self.available.notify_all();
        true
    }

    fn link_locked(&self, list: &mut QueueList, record: &Arc<Record>) -> bool {
        let mut slot = record.slot.lock();
        match &slot.state {
            QueueState::Registered(queue) if std::ptr::eq(Arc::as_ptr(queue), self) => {}
            _ => return false,
        }
        slot.next = Link::to_head(list.head.take());
        list.head = Some(Arc::clone(record));
        // Only publish the tag once the link is in place.
        slot.state = QueueState::Enqueued;
        record.tag.store(QueueTag::Enqueued);
        list.len += 1;
        true
    }

    fn poll_locked(list: &mut QueueList) -> Option<Arc<Record>> {
        let head = list.head.take()?;
        {
            let mut slot = head.slot.lock();
            // Leave the queue before unlinking, mirroring `enqueue`.
            slot.state = QueueState::Dequeued;
            head.tag.store(QueueTag::Dequeued);
            list.head = std::mem::replace(&mut slot.next, Link::Terminal).into_next();
        }
        list.len -= 1;
        Some(head)
    }

    pub fn poll(&self) -> Option<Arc<Record>> {
        let mut list = self.list.lock();
        Self::poll_locked(&mut list)
    }

    pub fn remove_timeout(&self, timeout_ms: i64) -> Result<Option<Arc<Record>>, RefError> {
        if timeout_ms < 0 {
            return Err(RefError::NegativeTimeout(timeout_ms));
        }
        let mut list = self.list.lock();
        if let Some(record) = Self::poll_locked(&mut list) {
            return Ok(Some(record));
        }
        let generation = list.interrupts;
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            match deadline {
                None => self.available.wait(&mut list),
                Some(deadline) => {
                    // Recompute the remaining time after every wake-up.
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let _ = self.available.wait_for(&mut list, deadline - now);
                }
            }
            if list.interrupts != generation {
                return Err(RefError::Interrupted);
            }
            if let Some(record) = Self::poll_locked(&mut list) {
                return Ok(Some(record));
            }
        }
    }

    pub fn interrupt(&self) {
        let mut list = self.list.lock();
        list.interrupts = list.interrupts.wrapping_add(1);
        drop(list);
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.list.lock().len
    }

    /// Best-effort walk over the records currently linked
    ///
    /// The list lock is only taken to read the head. Reaching a `Terminal`
    /// link on a record that is no longer enqueued means a poller overtook
    /// the walk, so it restarts from the live head.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Record>)) {
        let mut current = self.list.lock().head.clone();
        while let Some(record) = current {
            let (enqueued, next, terminal) = {
                let slot = record.slot.lock();
                (
                    matches!(slot.state, QueueState::Enqueued),
                    slot.next.next().cloned(),
                    slot.next.is_terminal(),
                )
            };
            if enqueued {
                f(&record);
            }
            current = if terminal && !enqueued {
                self.list.lock().head.clone()
            } else {
                next
            };
        }
    }
}

/// A queue that receives references once their targets are gone
///
/// Handles are cheap to clone and all clones refer to the same queue.
/// Records come out most-recently-enqueued first; this order is an
/// implementation detail, not a contract.
///
/// # Example
///
/// ```
/// use nachruf::{RefContext, ReferenceQueue};
/// use std::sync::Arc;
///
/// let ctx = RefContext::new().unwrap();
/// let queue = ReferenceQueue::new();
/// let target = Arc::new(String::from("payload"));
/// let reference = ctx.weak(&target, Some(&queue));
///
/// drop(target);
/// ctx.collect();
/// ctx.wait_for_processing();
///
/// let delivered = queue.poll().unwrap();
/// assert!(delivered.ptr_eq(&reference));
/// ```
pub struct ReferenceQueue<T> {
    shared: Arc<QueueShared>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ReferenceQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ReferenceQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T> ReferenceQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: QueueShared::new(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }

    /// Number of records currently linked
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel all current waiters on this queue
    ///
    /// Every thread blocked in `remove` or `remove_timeout` on this queue
    /// returns [`RefError::Interrupted`]; there is no way to cancel just one
    /// of them. Nothing is unlinked, and later calls block normally.
    pub fn interrupt_waiters(&self) {
        self.shared.interrupt();
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Send + Sync + 'static> ReferenceQueue<T> {
    /// Link `reference` into this queue without clearing it
    ///
    /// [`Reference::enqueue`] is the usual entry point; it clears the
    /// reference first. Returns false unless the reference is registered
    /// with this queue and has not been enqueued before.
    pub fn enqueue(&self, reference: &Reference<T>) -> bool {
        self.shared.enqueue(reference.raw())
    }

    /// Pull the most recently enqueued reference, if any, without blocking
    pub fn poll(&self) -> Option<Reference<T>> {
        self.shared.poll().map(Reference::from_record)
    }

    /// Block until a reference is available
    pub fn remove(&self) -> Result<Reference<T>, RefError> {
        loop {
            if let Some(record) = self.shared.remove_timeout(0)? {
                return Ok(Reference::from_record(record));
            }
        }
    }

    /// Block for at most `timeout_ms` milliseconds; `0` waits forever
    ///
    /// # Errors
    ///
    /// [`RefError::NegativeTimeout`] for a negative timeout, before any
    /// waiting happens, and [`RefError::Interrupted`] if
    /// [`interrupt_waiters`](Self::interrupt_waiters) was called meanwhile.
    pub fn remove_timeout(&self, timeout_ms: i64) -> Result<Option<Reference<T>>, RefError> {
        Ok(self
            .shared
            .remove_timeout(timeout_ms)?
            .map(Reference::from_record))
    }

    /// Visit the references currently in the queue without removing them
    ///
    /// Intended for diagnostics. Under concurrent polling a reference may
    /// be skipped or visited twice.
    pub fn for_each(&self, mut f: impl FnMut(&Reference<T>)) {
        self.shared
            .for_each(|record| f(&Reference::from_record(Arc::clone(record))));
    }
}

impl<T> fmt::Debug for ReferenceQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKind, Referent, Strength};
    use std::thread;

    fn registered(queue: &ReferenceQueue<u32>, target: &Arc<u32>) -> Arc<Record> {
        let referent = Arc::downgrade(target) as Referent;
        Record::new(
            referent,
            Strength::Weak,
            Some(Arc::clone(queue.shared())),
            RecordKind::Plain,
        )
    }

    #[test]
    fn enqueue_then_poll_returns_record() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let record = registered(&queue, &target);
        assert!(queue.shared().enqueue(&record));
        assert!(record.is_enqueued());
        assert_eq!(queue.len(), 1);

        let polled = queue.shared().poll().unwrap();
        assert!(Arc::ptr_eq(&polled, &record));
        assert_eq!(record.tag.load(), QueueTag::Dequeued);
        assert!(queue.is_empty());
    }

    #[test]
    fn poll_is_lifo() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let r1 = registered(&queue, &target);
        let r2 = registered(&queue, &target);
        assert!(queue.shared().enqueue(&r1));
        assert!(queue.shared().enqueue(&r2));
        assert!(Arc::ptr_eq(&queue.shared().poll().unwrap(), &r2));
        assert!(Arc::ptr_eq(&queue.shared().poll().unwrap(), &r1));
    }

    #[test]
    fn draining_leaves_queue_reusable() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let first = registered(&queue, &target);
        assert!(queue.shared().enqueue(&first));
        assert!(queue.shared().poll().is_some());
        assert!(queue.shared().poll().is_none());
        assert!(queue.shared().poll().is_none());
        assert_eq!(queue.len(), 0);

        let second = registered(&queue, &target);
        assert!(queue.shared().enqueue(&second));
        assert!(Arc::ptr_eq(&queue.shared().poll().unwrap(), &second));
    }

    #[test]
    fn enqueue_refused_twice_and_after_dequeue() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let record = registered(&queue, &target);
        assert!(queue.shared().enqueue(&record));
        assert!(!queue.shared().enqueue(&record));
        queue.shared().poll();
        assert!(!queue.shared().enqueue(&record));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn enqueue_refused_for_foreign_queue() {
        let queue = ReferenceQueue::new();
        let other = ReferenceQueue::<u32>::new();
        let target = Arc::new(1);
        let record = registered(&queue, &target);
        assert!(!other.shared().enqueue(&record));
        assert_eq!(record.tag.load(), QueueTag::Registered);
    }

    #[test]
    fn negative_timeout_rejected() {
        let queue = ReferenceQueue::<u32>::new();
        assert!(matches!(
            queue.remove_timeout(-1),
            Err(RefError::NegativeTimeout(-1))
        ));
    }

    #[test]
    fn timed_remove_waits_for_timeout() {
        let queue = ReferenceQueue::<u32>::new();
        let start = Instant::now();
        let result = queue.remove_timeout(100).unwrap();
        let elapsed = start.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(100), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn blocked_remove_wakes_on_enqueue() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let record = registered(&queue, &target);

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.remove().map(|r| r.raw().id()))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.shared().enqueue(&record));
        assert_eq!(consumer.join().unwrap().unwrap(), record.id());
    }

    #[test]
    fn timed_remove_keeps_its_deadline_when_woken_for_nothing() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let record = registered(&queue, &target);

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let result = queue.remove_timeout(400).map(|r| r.is_some());
                (result, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(250));
        {
            // Wake the waiter, then take the record before it gets the lock.
            let shared = queue.shared();
            let mut list = shared.list.lock();
            assert!(shared.link_locked(&mut list, &record));
            shared.available.notify_all();
            assert!(QueueShared::poll_locked(&mut list).is_some());
        }

        let (result, elapsed) = waiter.join().unwrap();
        assert!(!result.unwrap());
        assert!(elapsed >= Duration::from_millis(400), "returned early: {elapsed:?}");
        // Re-arming the full timeout after the wake-up would take >= 650 ms.
        assert!(elapsed < Duration::from_millis(640), "deadline re-armed: {elapsed:?}");
        assert_eq!(record.tag.load(), QueueTag::Dequeued);
    }

    #[test]
    fn dropping_queue_dequeues_linked_records() {
        let target = Arc::new(1);
        let record = {
            let queue = ReferenceQueue::new();
            let record = registered(&queue, &target);
            assert!(queue.shared().enqueue(&record));
            assert!(record.is_enqueued());
            record
        };
        assert!(!record.is_enqueued());
        assert_eq!(record.tag.load(), QueueTag::Dequeued);
        assert!(matches!(record.slot.lock().next, Link::Terminal));
    }

    #[test]
    fn interrupt_aborts_wait_without_mutation() {
        let queue = ReferenceQueue::<u32>::new();
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.remove_timeout(0).map(|r| r.is_some()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.interrupt_waiters();
        assert!(matches!(waiter.join().unwrap(), Err(RefError::Interrupted)));
        assert!(queue.is_empty());
    }

    #[test]
    fn for_each_visits_all_linked() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let records: Vec<_> = (0..5).map(|_| registered(&queue, &target)).collect();
        for record in &records {
            assert!(queue.shared().enqueue(record));
        }
        let mut seen = Vec::new();
        queue.shared().for_each(|record| seen.push(record.id()));
        let expected: Vec<_> = records.iter().rev().map(|r| r.id()).collect();
        assert_eq!(seen, expected);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn concurrent_producers_and_consumers_account_for_everything() {
        let queue = ReferenceQueue::new();
        let target = Arc::new(1);
        let records: Vec<_> = (0..400).map(|_| registered(&queue, &target)).collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut taken = 0;
                    while let Ok(Some(_)) = queue.remove_timeout(500) {
                        taken += 1;
                    }
                    taken
                })
            })
            .collect();

        let producers: Vec<_> = records
            .chunks(100)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                let queue = queue.clone();
                thread::spawn(move || chunk.iter().filter(|r| queue.shared().enqueue(r)).count())
            })
            .collect();

        let produced: usize = producers.into_iter().map(|h| h.join().unwrap()).sum();
        let consumed: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(produced, 400);
        assert_eq!(consumed, 400);
        assert!(queue.is_empty());
    }
}
