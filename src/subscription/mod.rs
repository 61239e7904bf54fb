
use crate::applier::{ApplierStats, ApplyOutcome, PresentationSink, TransactionApplier};
use crate::buffer::{Batch, BufferOutcome, BufferStats, MutationBuffer};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Fields, MutationEvent};
use crate::config::SyncConfig;
use crate::coordinator::page::{NewRecordsNotice, PageView};
use crate::coordinator::{ChangeOrigin, CoordinatorStats, MergeCoordinator};
use crate::error::SyncError;
use crate::identity::IdentityKey;
use crate::scheduler::{FlushReason, FlushScheduler, FlushTarget};
use crate::source::PageSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LIFECYCLE_OPEN: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_DETACHED: u8 = 2;

/// Observable state of one table subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Buffering,
    Applying,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// An apply or a page fetch is in flight; the buffer is kept and flushed
    /// once it completes.
    Deferred,
    /// The subscription is closing or detached.
    Skipped,
    Flushed { net_changes: usize, apply: ApplyOutcome },
}

#[derive(Debug, Default)]
struct SyncTelemetry {
    flushes_total: AtomicU64,
    flushes_deferred: AtomicU64,
    flushes_empty: AtomicU64,
    local_edits: AtomicU64,
    events_rejected: AtomicU64,
    reconcile_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMetrics {
    pub state: SubscriptionState,
    pub buffer: BufferStats,
    pub coordinator: CoordinatorStats,
    pub applier: ApplierStats,
    pub flushes_total: u64,
    pub flushes_deferred: u64,
    pub flushes_empty: u64,
    pub local_edits: u64,
    pub events_rejected: u64,
    pub reconcile_failures: u64,
    pub debounce_ms: u64,
}

/// Per-table pipeline owner: mutation buffer, flush timers, canonical cache
/// and transaction applier all live and die with the subscription.
pub struct TableSubscription {
    schema: Arc<TableSchema>,
    buffer: MutationBuffer,
    coordinator: Mutex<MergeCoordinator>,
    applier: Arc<TransactionApplier>,
    scheduler: FlushScheduler<TableSubscription>,
    source: Arc<dyn PageSource>,
    flush_lock: Mutex<()>,
    /// Page fetches in progress. Buffered events wait for the new page.
    navigations: AtomicUsize,
    lifecycle: AtomicU8,
    telemetry: SyncTelemetry,
    runtime: Handle,
}

impl TableSubscription {
    /// Starts a subscription and materializes page 0.
    pub async fn open(
        config: Arc<SyncConfig>,
        schema: TableSchema,
        sink: Arc<dyn PresentationSink>,
        source: Arc<dyn PageSource>,
    ) -> Result<Arc<Self>, SyncError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| SyncError::Unavailable {
            message: "table subscriptions require a tokio runtime".into(),
        })?;
        let load = source
            .fetch_page(&schema.table_id, 0, config.default_page_size)
            .await?;

        let schema = Arc::new(schema);
        let applier = Arc::new(TransactionApplier::new(sink, &config, runtime.clone()));
        let mut coordinator = MergeCoordinator::new(Arc::clone(&schema), &config);
        coordinator.load_page(0, load);

        let subscription = Arc::new_cyclic(|weak| Self {
            buffer: MutationBuffer::new(Arc::clone(&schema)),
            coordinator: Mutex::new(coordinator),
            applier: Arc::clone(&applier),
            scheduler: FlushScheduler::new(Arc::clone(&config), weak.clone(), runtime.clone()),
            schema,
            source,
            flush_lock: Mutex::new(()),
            navigations: AtomicUsize::new(0),
            lifecycle: AtomicU8::new(LIFECYCLE_OPEN),
            telemetry: SyncTelemetry::default(),
            runtime,
        });

        let weak = Arc::downgrade(&subscription);
        applier.set_idle_hook(Arc::new(move || {
            if let Some(subscription) = weak.upgrade() {
                subscription.flush(FlushReason::Retry);
            }
        }));
        subscription.scheduler.start();
        info!(table_id = %subscription.schema.table_id, "table subscription opened");
        Ok(subscription)
    }

    pub fn table_id(&self) -> &str {
        &self.schema.table_id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    fn is_open(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == LIFECYCLE_OPEN
    }

    fn detached_error(&self) -> SyncError {
        SyncError::Detached {
            table_id: self.schema.table_id.to_string(),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        if self.lifecycle.load(Ordering::Acquire) == LIFECYCLE_DETACHED {
            SubscriptionState::Detached
        } else if self.applier.is_in_flight() {
            SubscriptionState::Applying
        } else if !self.buffer.is_empty() {
            SubscriptionState::Buffering
        } else {
            SubscriptionState::Idle
        }
    }

    /// Buffers one inbound mutation and re-arms the debounce timer.
    pub fn push_event(&self, event: MutationEvent) -> Result<BufferOutcome, SyncError> {
        if !self.is_open() {
            self.telemetry
                .events_rejected
                .fetch_add(1, Ordering::Relaxed);
            return Err(self.detached_error());
        }
        let outcome = self.buffer.buffer_event(event);
        if outcome != BufferOutcome::Dropped {
            self.scheduler.schedule();
        }
        Ok(outcome)
    }

    /// Drains the buffer into canonical state and submits the visible part to
    /// the presentation layer. Flushes of one table never overlap.
    pub fn flush(&self, reason: FlushReason) -> FlushOutcome {
        if !self.is_open() && reason != FlushReason::Teardown {
            return FlushOutcome::Skipped;
        }
        let _serial = self.flush_lock.lock();
        let navigating =
            reason != FlushReason::Teardown && self.navigations.load(Ordering::Acquire) > 0;
        if navigating || (!reason.is_forced() && self.applier.request_retry()) {
            self.telemetry
                .flushes_deferred
                .fetch_add(1, Ordering::Relaxed);
            return FlushOutcome::Deferred;
        }
        let batch = self.buffer.drain();
        if batch.is_empty() {
            self.telemetry.flushes_empty.fetch_add(1, Ordering::Relaxed);
            return FlushOutcome::Empty;
        }
        let net_changes = batch.len();
        let transaction = self.coordinator.lock().integrate(batch, ChangeOrigin::Remote);
        self.scheduler.observe_flush(net_changes);
        self.telemetry.flushes_total.fetch_add(1, Ordering::Relaxed);
        let visible = transaction.len();
        let apply = self.applier.apply(transaction);
        debug!(
            table_id = %self.schema.table_id,
            reason = reason.as_str(),
            net_changes,
            visible,
            ?apply,
            "flushed mutation buffer"
        );
        FlushOutcome::Flushed { net_changes, apply }
    }

    /// Cancels the pending debounce and flushes immediately, even while an
    /// apply is in flight.
    pub fn force_flush(&self) -> FlushOutcome {
        self.scheduler.cancel_pending();
        self.flush(FlushReason::Forced)
    }

    /// Optimistic edit by the current user. Bypasses the buffer and is
    /// applied synchronously through the same integration path.
    pub fn apply_local_edit(
        &self,
        key: IdentityKey,
        partial: Fields,
    ) -> Result<ApplyOutcome, SyncError> {
        if !self.is_open() {
            return Err(self.detached_error());
        }
        let transaction = {
            let _serial = self.flush_lock.lock();
            self.coordinator
                .lock()
                .integrate(Batch::single_update(key, partial), ChangeOrigin::Local)
        };
        self.telemetry.local_edits.fetch_add(1, Ordering::Relaxed);
        Ok(self.applier.apply(transaction))
    }

    /// Navigates to `page`. The buffer is force-flushed first so no stale
    /// mutation leaks into the newly loaded page.
    pub async fn change_page(&self, page: usize) -> Result<PageView, SyncError> {
        if !self.is_open() {
            return Err(self.detached_error());
        }
        let (page_size, total_pages) = {
            let coordinator = self.coordinator.lock();
            let state = coordinator.page();
            (state.page_size, state.total_pages())
        };
        if page >= total_pages {
            return Err(SyncError::PageOutOfRange { page, total_pages });
        }
        self.scheduler.cancel_pending();
        self.flush(FlushReason::PageChange);
        {
            let _navigating = NavigationGuard::enter(&self.navigations);
            let load = self
                .source
                .fetch_page(&self.schema.table_id, page, page_size)
                .await?;
            if !self.is_open() {
                return Err(self.detached_error());
            }
            self.coordinator.lock().load_page(page, load);
        }
        // Events held back during the fetch belong to the new page.
        self.flush(FlushReason::PageChange);
        Ok(self.view())
    }

    pub async fn set_page_size(&self, page_size: usize) -> Result<PageView, SyncError> {
        if page_size == 0 {
            return Err(SyncError::Validation("page size must be > 0".into()));
        }
        self.coordinator.lock().set_page_size(page_size);
        self.change_page(0).await
    }

    /// The "new records available" action: jumps to page 0, which clears the
    /// table's new-records flag.
    pub async fn view_new_records(&self) -> Result<PageView, SyncError> {
        self.change_page(0).await
    }

    pub fn new_records_notice(&self) -> Option<NewRecordsNotice> {
        self.coordinator.lock().new_records_notice()
    }

    pub fn clear_realtime_flags(&self) {
        self.coordinator.lock().clear_realtime_flags();
    }

    pub fn view(&self) -> PageView {
        self.coordinator.lock().view()
    }

    pub fn is_locally_added(&self, key: &IdentityKey) -> bool {
        self.coordinator
            .lock()
            .get(key)
            .is_some_and(|cached| cached.locally_added)
    }

    /// Re-queries the authoritative row count and overwrites the incremental
    /// one. Returns the corrected drift.
    pub async fn reconcile_total_count(&self) -> Result<Option<i64>, SyncError> {
        let total = self.source.fetch_total_count(&self.schema.table_id).await?;
        Ok(self.coordinator.lock().reconcile_total(total))
    }

    /// Forwards a transport channel into the buffer until the channel closes
    /// or the subscription is torn down.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<MutationEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(subscription) = weak.upgrade() else {
                    break;
                };
                if subscription.push_event(event).is_err() {
                    break;
                }
            }
        })
    }

    /// Cancels timers, runs a final forced flush, discards anything that
    /// raced in afterwards and detaches. Safe to call repeatedly.
    pub fn teardown(&self) {
        if self
            .lifecycle
            .compare_exchange(
                LIFECYCLE_OPEN,
                LIFECYCLE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.scheduler.cancel();
        let outcome = self.flush(FlushReason::Teardown);
        let discarded = self.buffer.discard();
        if discarded > 0 {
            warn!(
                table_id = %self.schema.table_id,
                discarded,
                "discarded events that arrived during teardown"
            );
        }
        self.applier.detach();
        self.lifecycle.store(LIFECYCLE_DETACHED, Ordering::Release);
        info!(table_id = %self.schema.table_id, ?outcome, "table subscription detached");
    }

    pub fn metrics(&self) -> SyncMetrics {
        SyncMetrics {
            state: self.state(),
            buffer: self.buffer.stats(),
            coordinator: self.coordinator.lock().stats(),
            applier: self.applier.stats(),
            flushes_total: self.telemetry.flushes_total.load(Ordering::Relaxed),
            flushes_deferred: self.telemetry.flushes_deferred.load(Ordering::Relaxed),
            flushes_empty: self.telemetry.flushes_empty.load(Ordering::Relaxed),
            local_edits: self.telemetry.local_edits.load(Ordering::Relaxed),
            events_rejected: self.telemetry.events_rejected.load(Ordering::Relaxed),
            reconcile_failures: self.telemetry.reconcile_failures.load(Ordering::Relaxed),
            debounce_ms: self.scheduler.current_debounce_ms(),
        }
    }
}

struct NavigationGuard<'a>(&'a AtomicUsize);

impl<'a> NavigationGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for NavigationGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl FlushTarget for TableSubscription {
    fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn flush(&self, reason: FlushReason) {
        TableSubscription::flush(self, reason);
    }

    async fn reconcile_count(self: Arc<Self>) {
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.reconcile_total_count().await {
            self.telemetry
                .reconcile_failures
                .fetch_add(1, Ordering::Relaxed);
            debug!(table_id = %self.schema.table_id, error = %err, "count reconciliation failed");
        }
    }
}
