//! Nachruf - reference queues and cleaners for `Arc` targets
//!
//! This library lets a program learn that an object died, without keeping it
//! alive. A collector notices targets whose last strong reference is gone and
//! hands their tracking records to a single dispatcher thread, which either
//! pushes them onto a reference queue or runs a one-shot cleanup action.
//!
//! # Features
//!
//! - **Weak and phantom references**: observe an `Arc<T>` with or without the
//!   ability to retrieve it
//! - **Reference queues**: poll or block for references whose targets died
//! - **Cleaners**: actions that run exactly once, on death or on demand
//! - **Pluggable producers**: the dispatcher consumes any [`PendingSource`]
//!
//! # Example
//!
//! ```
//! use nachruf::{RefContext, ReferenceQueue};
//! use std::sync::Arc;
//!
//! let ctx = RefContext::new().unwrap();
//! let queue = ReferenceQueue::new();
//!
//! let session = Arc::new("session-42");
//! let watcher = ctx.phantom(&session, Some(&queue));
//!
//! drop(session);
//! ctx.collect();
//!
//! let dead = queue.remove_timeout(1_000).unwrap().unwrap();
//! assert_eq!(dead, watcher);
//! ```

mod cleaner;
mod collector;
mod context;
mod dispatcher;
mod error;
mod pending;
mod queue;
mod record;
mod reference;
mod state;

pub use cleaner::{Cleanable, Cleaner};
pub use collector::Collector;
pub use context::{RefContext, RefOptions};
pub use dispatcher::{Dispatcher, Progress, dispatch_pending, process_batch};
pub use error::{RefError, SourceError};
pub use pending::{PendingBatch, PendingList, PendingSource};
pub use queue::ReferenceQueue;
pub use record::{RecordRef, Strength};
pub use reference::Reference;
pub use state::{Activity, QueueTag};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn basic_registration() {
        let ctx = RefContext::new().unwrap();
        let target = Arc::new(42);
        let reference = ctx.weak(&target, None);
        assert_eq!(*reference.get().unwrap(), 42);
    }

    #[test]
    fn registration_and_delivery() {
        let ctx = RefContext::new().unwrap();
        let queue = ReferenceQueue::new();
        let keep = Arc::new(100);
        let lose = Arc::new(200);
        let kept = ctx.weak(&keep, Some(&queue));
        let lost = ctx.weak(&lose, Some(&queue));
        drop(lose);
        ctx.collect();
        ctx.wait_for_processing();
        assert_eq!(queue.poll().unwrap(), lost);
        assert!(queue.poll().is_none());
        assert_eq!(*kept.get().unwrap(), 100);
    }

    #[test]
    fn concurrent_registration() {
        use std::thread;

        let ctx = Arc::new(RefContext::new().unwrap());
        let queue = ReferenceQueue::<i32>::new();
        let mut handles = vec![];

        for i in 0..4 {
            let ctx_clone = Arc::clone(&ctx);
            let queue_clone = queue.clone();
            let handle = thread::spawn(move || {
                let target = Arc::new(i);
                let reference = ctx_clone.weak(&target, Some(&queue_clone));
                drop(target);
                reference
            });
            handles.push(handle);
        }

        let references: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ctx.collect(), 4);
        ctx.wait_for_processing();
        assert_eq!(queue.len(), references.len());
    }
}
