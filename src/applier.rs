use crate::catalog::types::Record;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::identity::IdentityKey;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A materialized row as handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridRow {
    pub key: IdentityKey,
    pub record: Record,
}

/// One batched, low-level update instruction for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridTransaction {
    pub update: Vec<GridRow>,
    pub add: Vec<GridRow>,
    pub remove: Vec<IdentityKey>,
    pub suppress_flash: bool,
    pub suppress_vertical_scroll: bool,
}

impl GridTransaction {
    pub fn with_flags(config: &SyncConfig) -> Self {
        Self {
            suppress_flash: config.suppress_flash,
            suppress_vertical_scroll: config.suppress_vertical_scroll,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.update.len() + self.add.len() + self.remove.len()
    }

    /// Folds a later transaction into this one so that submitting the result
    /// once has the same effect as submitting both in order.
    pub fn merge(&mut self, later: GridTransaction) {
        for key in later.remove {
            if let Some(i) = position(&self.add, &key) {
                self.add.remove(i);
                continue;
            }
            self.update.retain(|row| row.key != key);
            if !self.remove.contains(&key) {
                self.remove.push(key);
            }
        }
        for row in later.add {
            if row.key.is_unknown() {
                self.add.push(row);
            } else if let Some(i) = self.remove.iter().position(|key| *key == row.key) {
                // The row is still materialized; replace its content.
                self.remove.remove(i);
                self.update.push(row);
            } else if let Some(i) = position(&self.add, &row.key) {
                self.add[i] = row;
            } else if let Some(i) = position(&self.update, &row.key) {
                self.update[i] = row;
            } else {
                self.add.push(row);
            }
        }
        for row in later.update {
            if let Some(i) = position(&self.add, &row.key) {
                self.add[i] = row;
            } else if let Some(i) = position(&self.update, &row.key) {
                self.update[i] = row;
            } else if !self.remove.contains(&row.key) {
                self.update.push(row);
            }
        }
        self.suppress_flash |= later.suppress_flash;
        self.suppress_vertical_scroll |= later.suppress_vertical_scroll;
    }
}

fn position(rows: &[GridRow], key: &IdentityKey) -> Option<usize> {
    if key.is_unknown() {
        return None;
    }
    rows.iter().position(|row| row.key == *key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
}

/// Boundary to the grid component that materializes rows.
///
/// `submit` must not block: it queues the transaction and reports completion
/// through `done`. Dropping `done` without sending counts as completion.
pub trait PresentationSink: Send + Sync {
    fn is_attached(&self) -> bool;
    fn submit(
        &self,
        transaction: GridTransaction,
        done: oneshot::Sender<ApplyReport>,
    ) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Submitted,
    /// Another apply is in flight; merged into the deferred transaction.
    Deferred,
    Empty,
    /// Presentation layer unavailable. Canonical state is already correct.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplierStats {
    pub submitted: u64,
    pub completed: u64,
    pub dropped: u64,
    pub deferred: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct ApplierState {
    in_flight: bool,
    deferred: Option<GridTransaction>,
    retry_requested: bool,
}

type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Submits grid transactions one at a time. While an apply is in flight,
/// further transactions are merged and submitted once it completes.
pub struct TransactionApplier {
    sink: Arc<dyn PresentationSink>,
    runtime: Handle,
    apply_timeout: Duration,
    state: Mutex<ApplierState>,
    idle_hook: Mutex<Option<IdleHook>>,
    detached: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    dropped: AtomicU64,
    deferred: AtomicU64,
    timed_out: AtomicU64,
}

impl TransactionApplier {
    pub fn new(sink: Arc<dyn PresentationSink>, config: &SyncConfig, runtime: Handle) -> Self {
        Self {
            sink,
            runtime,
            apply_timeout: config.apply_timeout(),
            state: Mutex::new(ApplierState::default()),
            idle_hook: Mutex::new(None),
            detached: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Hook run after an in-flight apply completes and a flush was requested
    /// while it was running.
    pub fn set_idle_hook(&self, hook: IdleHook) {
        *self.idle_hook.lock() = Some(hook);
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Records that a flush was skipped because of an in-flight apply.
    /// Returns false if no apply is in flight any more.
    pub fn request_retry(&self) -> bool {
        let mut state = self.state.lock();
        if !state.in_flight {
            return false;
        }
        state.retry_requested = true;
        true
    }

    pub fn apply(self: &Arc<Self>, transaction: GridTransaction) -> ApplyOutcome {
        if transaction.is_empty() {
            return ApplyOutcome::Empty;
        }
        {
            let mut state = self.state.lock();
            if state.in_flight {
                match state.deferred.as_mut() {
                    Some(pending) => pending.merge(transaction),
                    None => state.deferred = Some(transaction),
                }
                self.deferred.fetch_add(1, Ordering::Relaxed);
                return ApplyOutcome::Deferred;
            }
            if !self.sink.is_attached() {
                drop(state);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(rows = transaction.len(), "presentation detached; dropping apply");
                return ApplyOutcome::Dropped;
            }
            state.in_flight = true;
        }
        self.submit(transaction)
    }

    fn submit(self: &Arc<Self>, transaction: GridTransaction) -> ApplyOutcome {
        let rows = transaction.len();
        let (done_tx, done_rx) = oneshot::channel();
        if let Err(err) = self.sink.submit(transaction, done_tx) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(rows, error = %err, "grid transaction submit failed");
            self.finish();
            return ApplyOutcome::Dropped;
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let applier = Arc::clone(self);
        let timeout = self.apply_timeout;
        self.runtime.spawn(async move {
            match tokio::time::timeout(timeout, done_rx).await {
                Ok(_) => {
                    applier.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    applier.timed_out.fetch_add(1, Ordering::Relaxed);
                    warn!(rows, "grid transaction completion timed out");
                }
            }
            applier.finish();
        });
        ApplyOutcome::Submitted
    }

    fn finish(self: &Arc<Self>) {
        let (next, retry) = {
            let mut state = self.state.lock();
            state.in_flight = false;
            (
                state.deferred.take(),
                std::mem::take(&mut state.retry_requested),
            )
        };
        if let Some(next) = next {
            self.apply(next);
        }
        if retry && !self.detached.load(Ordering::Acquire) {
            let hook = self.idle_hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Stops retry callbacks. A transaction already in flight is allowed to
    /// complete but nothing is retried after it.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.idle_hook.lock().take();
    }

    pub fn stats(&self) -> ApplierStats {
        ApplierStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
