use crate::applier::{ApplyReport, GridTransaction, PresentationSink};
use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Fields, MutationEvent, Record};
use crate::error::SyncError;
use crate::source::{PageLoad, PageSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

pub(crate) fn people() -> TableSchema {
    TableSchema::new("people").with_unique_field("id")
}

pub(crate) fn person(id: &str, name: &str) -> Record {
    people().record(Fields::new().with("id", id).with("name", name))
}

pub(crate) fn add(id: &str, name: &str) -> MutationEvent {
    MutationEvent::Add {
        record: person(id, name),
    }
}

pub(crate) fn update(id: &str, name: &str) -> MutationEvent {
    MutationEvent::Update {
        key: id.into(),
        partial: Fields::new().with("name", name),
    }
}

pub(crate) fn delete(id: &str) -> MutationEvent {
    MutationEvent::Delete { key: id.into() }
}

/// Records every transaction. Completes immediately unless `hold` is set, in
/// which case completions wait for [`GridSink::complete_all`].
pub(crate) struct GridSink {
    pub attached: AtomicBool,
    pub hold: AtomicBool,
    pub received: Mutex<Vec<GridTransaction>>,
    pending: Mutex<Vec<oneshot::Sender<ApplyReport>>>,
}

impl GridSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attached: AtomicBool::new(true),
            hold: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn holding() -> Arc<Self> {
        let sink = Self::new();
        sink.hold.store(true, Ordering::SeqCst);
        sink
    }

    pub fn complete_all(&self) {
        for done in self.pending.lock().drain(..) {
            let _ = done.send(ApplyReport::default());
        }
    }

    pub fn transactions(&self) -> Vec<GridTransaction> {
        self.received.lock().clone()
    }
}

impl PresentationSink for GridSink {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn submit(
        &self,
        transaction: GridTransaction,
        done: oneshot::Sender<ApplyReport>,
    ) -> Result<(), SyncError> {
        let applied = transaction.len();
        self.received.lock().push(transaction);
        if self.hold.load(Ordering::SeqCst) {
            self.pending.lock().push(done);
        } else {
            let _ = done.send(ApplyReport { applied });
        }
        Ok(())
    }
}

/// In-memory backend keyed by page index.
#[derive(Default)]
pub(crate) struct MemorySource {
    pages: Mutex<HashMap<usize, Vec<Record>>>,
    slow_pages: Mutex<HashMap<usize, Duration>>,
    pub total: AtomicU64,
    pub fail: AtomicBool,
    pub fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new(total: u64) -> Arc<Self> {
        let source = Self::default();
        source.total.store(total, Ordering::SeqCst);
        Arc::new(source)
    }

    pub fn with_page(self: Arc<Self>, page: usize, records: Vec<Record>) -> Arc<Self> {
        self.pages.lock().insert(page, records);
        self
    }

    /// Delays every fetch of `page` by `latency`.
    pub fn with_latency(self: Arc<Self>, page: usize, latency: Duration) -> Arc<Self> {
        self.slow_pages.lock().insert(page, latency);
        self
    }
}

#[async_trait]
impl PageSource for MemorySource {
    async fn fetch_page(
        &self,
        _table_id: &str,
        page: usize,
        _page_size: usize,
    ) -> Result<PageLoad, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let latency = self.slow_pages.lock().get(&page).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::source_error("backend offline"));
        }
        Ok(PageLoad {
            records: self.pages.lock().get(&page).cloned().unwrap_or_default(),
            total_count: self.total.load(Ordering::SeqCst),
        })
    }

    async fn fetch_total_count(&self, _table_id: &str) -> Result<u64, SyncError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::source_error("backend offline"));
        }
        Ok(self.total.load(Ordering::SeqCst))
    }
}
