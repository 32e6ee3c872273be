//! The single consumer of pending records
//!
//! One dispatcher thread per context drains the pending source in
//! rounds. Each record of a round is either run (cleanup records) or
//! pushed onto its reference queue (everything else).
//!
//! A panicking cleanup action only loses its own record. A source that
//! fails for any reason other than shutting down aborts the process: a
//! stalled dispatcher would silently stop every queue notification.

use crate::error::{RefError, SourceError};
use crate::pending::{PendingBatch, PendingSource};
use crate::record::RecordKind;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct ProgressState {
    rounds: u64,
    cleanups: u64,
    busy: bool,
}

/// Counters and wake-ups published by the dispatcher
///
/// Lets other threads wait until everything handed off so far has been
/// dispatched.
pub struct Progress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState {
                rounds: 0,
                cleanups: 0,
                busy: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn begin_round(&self) {
        self.state.lock().busy = true;
    }

    fn end_round(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        state.rounds += 1;
        drop(state);
        self.changed.notify_all();
    }

    fn cleanup_ran(&self) {
        self.state.lock().cleanups += 1;
        self.changed.notify_all();
    }

    /// Completed dispatch rounds
    pub fn rounds(&self) -> u64 {
        self.state.lock().rounds
    }

    /// Cleanup actions run by the dispatcher, panicking ones included
    pub fn cleanups_run(&self) -> u64 {
        self.state.lock().cleanups
    }

    /// Whether a round is running or `source` holds undelivered work
    pub fn is_processing(&self, source: &dyn PendingSource) -> bool {
        self.state.lock().busy || source.has_pending_work()
    }

    /// Block until no round is running and `source` is empty
    ///
    /// Returns true if there was anything to wait for. Only meaningful
    /// while a dispatcher is draining `source`.
    pub fn wait_for_idle(&self, source: &dyn PendingSource) -> bool {
        let mut state = self.state.lock();
        let mut waited = false;
        while state.busy || source.has_pending_work() {
            waited = true;
            self.changed.wait(&mut state);
        }
        waited
    }

    /// Like [`wait_for_idle`](Self::wait_for_idle), giving up after
    /// `timeout`. Returns whether the dispatcher went idle.
    pub fn wait_for_idle_timeout(&self, source: &dyn PendingSource, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.busy || source.has_pending_work() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // The source is not tied to this condvar, so re-check often.
            let slice = (deadline - now).min(Duration::from_millis(10));
            let _ = self.changed.wait_for(&mut state, slice);
        }
        true
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Progress")
            .field("rounds", &state.rounds)
            .field("cleanups", &state.cleanups)
            .field("busy", &state.busy)
            .finish()
    }
}

/// Dispatch every record of `batch`, in order
///
/// Returns how many records were processed.
pub fn process_batch(batch: PendingBatch, progress: &Progress) -> usize {
    let mut processed = 0;
    for record in batch {
        let record = record.0;
        record.activity.mark_inactive();
        match &record.kind {
            RecordKind::Cleanup(cleanup) => {
                if cleanup.run_isolated(&record) {
                    progress.cleanup_ran();
                }
            }
            RecordKind::Plain => {
                // Refused when the queue is missing or it was enqueued
                // explicitly already.
                let _ = record.enqueue();
            }
        }
        processed += 1;
    }
    processed
}

/// Marks a round busy until dropped, unwinding included
struct Round<'a>(&'a Progress);

impl<'a> Round<'a> {
    fn begin(progress: &'a Progress) -> Self {
        progress.begin_round();
        Self(progress)
    }
}

impl Drop for Round<'_> {
    fn drop(&mut self) {
        self.0.end_round();
    }
}

/// Run one round: take everything `source` holds and dispatch it
///
/// This is what the dispatcher thread does after each wake-up; hosts
/// without a dispatcher thread can call it directly. The round ends even
/// if `source` panics.
pub fn dispatch_pending(
    source: &dyn PendingSource,
    progress: &Progress,
) -> Result<usize, SourceError> {
    let _round = Round::begin(progress);
    source
        .take_pending()
        .map(|batch| process_batch(batch, progress))
}

/// Aborts the process if the dispatcher thread unwinds
struct AbortOnUnwind;

impl Drop for AbortOnUnwind {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("reference dispatcher panicked, aborting");
            std::process::abort();
        }
    }
}

fn run(source: &dyn PendingSource, progress: &Progress) {
    // Cleanup panics are caught per record; anything else reaching here
    // came from the source.
    let _fatal = AbortOnUnwind;
    tracing::info!("reference dispatcher started");
    loop {
        match source
            .wait_for_pending_work()
            .and_then(|()| dispatch_pending(source, progress))
        {
            Ok(processed) => tracing::debug!(processed, "pending batch dispatched"),
            Err(SourceError::Closed) => break,
            Err(err) => {
                tracing::error!(error = %err, "reference dispatcher cannot continue, aborting");
                std::process::abort();
            }
        }
    }
    tracing::info!("reference dispatcher stopped");
}

/// Handle to the dispatcher thread
///
/// The thread runs until its source reports [`SourceError::Closed`].
pub struct Dispatcher {
    thread: Option<JoinHandle<()>>,
    progress: Arc<Progress>,
}

impl Dispatcher {
    /// Start the dispatcher on a thread called `name`
    pub fn spawn(source: Arc<dyn PendingSource>, name: &'static str) -> Result<Self, RefError> {
        let progress = Arc::new(Progress::new());
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn({
                let progress = Arc::clone(&progress);
                move || run(source.as_ref(), &progress)
            })
            .map_err(|source| RefError::Spawn { name, source })?;
        Ok(Self {
            thread: Some(thread),
            progress,
        })
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Wait for the thread to exit; close the source first
    pub fn join(mut self) {
        self.join_thread();
    }

    pub(crate) fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("reference dispatcher thread panicked");
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.thread.is_some())
            .field("progress", &self.progress)
            .finish()
    }
}
