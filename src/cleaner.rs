//! One-shot cleanup actions tied to a target's death
//!
//! A `Cleaner` registers an action against an `Arc` target. The action
//! runs exactly once: either on the dispatcher thread after the target
//! died, or synchronously through `Cleanable::clean`, whichever claims it
//! first.
//!
//! The action must not own a strong `Arc` to its target, or the target
//! never dies. This is not checked.

use crate::collector::Collector;
use crate::error::RefError;
use crate::record::{Record, RecordKind, Referent, Strength};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Action = Box<dyn FnOnce() + Send>;

/// Keeps cleanup records reachable until they run
struct Registry {
    live: Mutex<HashMap<u64, Arc<Record>>>,
}

/// Cleanup payload of a record
pub(crate) struct Cleanup {
    claimed: AtomicBool,
    action: Mutex<Option<Action>>,
    registry: Weak<Registry>,
}

impl Cleanup {
    /// Whoever wins the swap owns the action
    fn claim(&self) -> Option<Action> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.action.lock().take()
    }

    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn unregister(&self, id: u64) {
        if let Some(registry) = self.registry.upgrade() {
            // Dropped outside the lock.
            let removed = registry.live.lock().remove(&id);
            drop(removed);
        }
    }

    /// Run from the dispatcher: a panicking action is logged and dropped
    ///
    /// Returns whether the action was claimed here.
    pub(crate) fn run_isolated(&self, record: &Record) -> bool {
        let Some(action) = self.claim() else {
            return false;
        };
        self.unregister(record.id());
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) {
            tracing::warn!(
                record = record.id(),
                panic = panic_message(&*payload),
                "cleanup action panicked"
            );
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Registers cleanup actions
///
/// # Example
///
/// ```
/// use nachruf::RefContext;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let ctx = RefContext::new().unwrap();
/// let cleaner = ctx.cleaner();
/// let closed = Arc::new(AtomicBool::new(false));
///
/// let handle = Arc::new(17);
/// let flag = Arc::clone(&closed);
/// cleaner.register(&handle, move || flag.store(true, Ordering::SeqCst));
///
/// drop(handle);
/// ctx.collect();
/// ctx.wait_for_processing();
/// assert!(closed.load(Ordering::SeqCst));
/// ```
#[derive(Clone)]
pub struct Cleaner {
    collector: Arc<Collector>,
    registry: Arc<Registry>,
}

impl Cleaner {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            registry: Arc::new(Registry {
                live: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run `action` once `target` has no strong references left
    pub fn register<T, F>(&self, target: &Arc<T>, action: F) -> Cleanable
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let referent = Arc::downgrade(target) as Referent;
        self.register_referent(referent, Box::new(action))
    }

    /// Like [`register`](Self::register), for a target known only weakly
    ///
    /// # Errors
    ///
    /// [`RefError::DeadTarget`] if the target is already gone.
    pub fn register_weak<T, F>(&self, target: &Weak<T>, action: F) -> Result<Cleanable, RefError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        if target.strong_count() == 0 {
            return Err(RefError::DeadTarget);
        }
        let referent: Referent = target.clone();
        Ok(self.register_referent(referent, Box::new(action)))
    }

    fn register_referent(&self, referent: Referent, action: Action) -> Cleanable {
        let cleanup = Cleanup {
            claimed: AtomicBool::new(false),
            action: Mutex::new(Some(action)),
            registry: Arc::downgrade(&self.registry),
        };
        let record = Record::new(referent, Strength::Phantom, None, RecordKind::Cleanup(cleanup));
        self.registry
            .live
            .lock()
            .insert(record.id(), Arc::clone(&record));
        self.collector.track(&record);
        Cleanable { record }
    }

    /// Actions registered and not yet run
    pub fn len(&self) -> usize {
        self.registry.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleaner").field("len", &self.len()).finish()
    }
}

/// Handle to a registered cleanup action
///
/// Dropping the handle does not cancel the action.
#[derive(Clone)]
pub struct Cleanable {
    record: Arc<Record>,
}

impl Cleanable {
    fn cleanup(&self) -> &Cleanup {
        match &self.record.kind {
            RecordKind::Cleanup(cleanup) => cleanup,
            RecordKind::Plain => unreachable!("cleanable built from a plain record"),
        }
    }

    /// Unregister and run the action now, unless it already ran
    ///
    /// Safe to call any number of times from any number of threads; the
    /// action runs at most once overall. A panic in the action propagates
    /// to the caller that ran it.
    pub fn clean(&self) {
        let cleanup = self.cleanup();
        let Some(action) = cleanup.claim() else {
            return;
        };
        self.record.activity.retire();
        cleanup.unregister(self.record.id());
        self.record.clear();
        action();
    }

    /// Whether the action has been claimed, by `clean` or the dispatcher
    pub fn is_cleaned(&self) -> bool {
        self.cleanup().is_claimed()
    }
}

impl fmt::Debug for Cleanable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cleanable")
            .field("id", &self.record.id())
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}
