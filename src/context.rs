//! Subsystem context and main API
//!
//! A `RefContext` owns one collector, one dispatcher thread and,
//! optionally, a scanner thread that sweeps the collector periodically.
//! Dropping the context shuts both threads down after the work already
//! handed off has been dispatched.

use crate::cleaner::Cleaner;
use crate::collector::Collector;
use crate::dispatcher::{Dispatcher, Progress};
use crate::error::RefError;
use crate::queue::ReferenceQueue;
use crate::record::Strength;
use crate::reference::Reference;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration for a [`RefContext`]
#[derive(Debug, Clone)]
pub struct RefOptions {
    /// Sweep the collector in the background at this interval. With
    /// `None`, sweeps only happen through [`RefContext::collect`].
    pub scan_interval: Option<Duration>,
    /// Name of the dispatcher thread
    pub dispatcher_thread_name: &'static str,
    /// Name of the scanner thread
    pub scanner_thread_name: &'static str,
}

impl RefOptions {
    pub const DEFAULT: Self = Self {
        scan_interval: None,
        dispatcher_thread_name: "nachruf-dispatcher",
        scanner_thread_name: "nachruf-scanner",
    };
}

impl Default for RefOptions {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Entry point: registration, cleaners and collection control
///
/// # Example
///
/// ```
/// use nachruf::{RefContext, ReferenceQueue};
/// use std::sync::Arc;
///
/// let ctx = RefContext::new().unwrap();
/// let queue = ReferenceQueue::new();
///
/// let target = Arc::new(vec![1, 2, 3]);
/// let weak = ctx.weak(&target, Some(&queue));
/// assert_eq!(weak.get().unwrap().len(), 3);
///
/// drop(target);
/// ctx.collect();
/// let delivered = queue.remove_timeout(1_000).unwrap().unwrap();
/// assert_eq!(delivered, weak);
/// assert!(weak.get().is_none());
/// ```
pub struct RefContext {
    collector: Arc<Collector>,
    dispatcher: Dispatcher,
    scanner: Option<JoinHandle<()>>,
    cleaner: Cleaner,
}

impl RefContext {
    /// Create a context with [`RefOptions::DEFAULT`]
    pub fn new() -> Result<Self, RefError> {
        Self::with_options(RefOptions::DEFAULT)
    }

    /// Create a context and start its threads
    pub fn with_options(options: RefOptions) -> Result<Self, RefError> {
        let collector = Collector::new();
        let dispatcher = Dispatcher::spawn(collector.clone(), options.dispatcher_thread_name)?;

        let scanner = match options.scan_interval {
            Some(interval) => {
                let scanner_collector = Arc::clone(&collector);
                let spawned = thread::Builder::new()
                    .name(options.scanner_thread_name.to_owned())
                    .spawn(move || scanner_collector.scan_until_closed(interval));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(source) => {
                        collector.close();
                        let mut dispatcher = dispatcher;
                        dispatcher.join_thread();
                        return Err(RefError::Spawn {
                            name: options.scanner_thread_name,
                            source,
                        });
                    }
                }
            }
            None => None,
        };

        tracing::info!(scan_interval = ?options.scan_interval, "reference context started");
        Ok(Self {
            cleaner: Cleaner::new(Arc::clone(&collector)),
            collector,
            dispatcher,
            scanner,
        })
    }

    /// Observe `target` weakly; `get()` works while it is alive
    pub fn weak<T: Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        queue: Option<&ReferenceQueue<T>>,
    ) -> Reference<T> {
        self.collector.register(target, Strength::Weak, queue)
    }

    /// Observe only the death of `target`
    pub fn phantom<T: Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        queue: Option<&ReferenceQueue<T>>,
    ) -> Reference<T> {
        self.collector.register(target, Strength::Phantom, queue)
    }

    /// The context's shared cleaner
    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    /// Sweep once and hand dead targets to the dispatcher
    ///
    /// Returns how many records were handed off. Dispatch happens
    /// asynchronously; see [`wait_for_processing`](Self::wait_for_processing).
    pub fn collect(&self) -> usize {
        self.collector.collect()
    }

    /// Block until everything handed off so far has been dispatched
    ///
    /// Returns true if there was pending work to wait for.
    pub fn wait_for_processing(&self) -> bool {
        self.dispatcher.progress().wait_for_idle(&*self.collector)
    }

    /// Whether the dispatcher has work in hand or waiting
    pub fn is_processing(&self) -> bool {
        self.dispatcher.progress().is_processing(&*self.collector)
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn progress(&self) -> &Arc<Progress> {
        self.dispatcher.progress()
    }
}

impl Drop for RefContext {
    fn drop(&mut self) {
        self.collector.close();
        if let Some(scanner) = self.scanner.take() {
            if scanner.join().is_err() {
                tracing::error!("reference scanner thread panicked");
            }
        }
        self.dispatcher.join_thread();
        tracing::info!("reference context stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn options_default_has_no_scanner() {
        let options = RefOptions::default();
        assert!(options.scan_interval.is_none());
        assert_eq!(options.dispatcher_thread_name, "nachruf-dispatcher");
    }

    #[test]
    fn collect_and_wait_delivers() {
        let ctx = RefContext::new().unwrap();
        let queue = ReferenceQueue::new();
        let target = Arc::new(String::from("gone soon"));
        let reference = ctx.phantom(&target, Some(&queue));
        assert!(!ctx.is_processing());

        drop(target);
        assert_eq!(ctx.collect(), 1);
        ctx.wait_for_processing();
        assert!(!ctx.is_processing());
        assert_eq!(queue.poll().unwrap(), reference);
        assert!(ctx.progress().rounds() >= 1);
    }

    #[test]
    fn scanner_collects_without_explicit_calls() {
        let mut options = RefOptions::DEFAULT;
        options.scan_interval = Some(Duration::from_millis(5));
        let ctx = RefContext::with_options(options).unwrap();
        let cleaned = Arc::new(AtomicUsize::new(0));

        let target = Arc::new(0u64);
        let hits = Arc::clone(&cleaned);
        ctx.cleaner().register(&target, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let queue = ReferenceQueue::new();
        let reference = ctx.weak(&target, Some(&queue));
        drop(target);

        assert_eq!(queue.remove_timeout(5_000).unwrap().unwrap(), reference);
        // The cleanup record may be found one sweep later.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while cleaned.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(ctx.progress().wait_for_idle_timeout(&**ctx.collector(), Duration::from_secs(5)));
    }

    #[test]
    fn drop_drains_handed_off_work() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        {
            let ctx = RefContext::new().unwrap();
            for _ in 0..32 {
                let target = Arc::new(());
                let hits = Arc::clone(&cleaned);
                ctx.cleaner().register(&target, move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
            }
            assert_eq!(ctx.collect(), 32);
        }
        assert_eq!(cleaned.load(Ordering::SeqCst), 32);
    }
}
