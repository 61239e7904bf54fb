use async_trait::async_trait;
use gridsync::identity::composite_key;
use gridsync::{
    ApplyReport, Fields, GridTransaction, MutationEvent, PageLoad, PageSource, PageView,
    PresentationSink, Record, SubscriptionState, SyncConfig, SyncEngine, SyncError, TableSchema,
    Value,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

fn stress_scale() -> usize {
    std::env::var("GRIDSYNC_STRESS_SCALE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(1)
}

fn scaled(base: usize) -> usize {
    base.saturating_mul(stress_scale())
}

fn test_config(page_size: usize) -> SyncConfig {
    SyncConfig {
        default_page_size: page_size,
        count_reconcile_interval_ms: 0,
        ..SyncConfig::default()
    }
}

fn schema() -> TableSchema {
    TableSchema::new("tickets").with_unique_field("id")
}

fn ticket(id: &str, title: &str) -> Record {
    schema().record(Fields::new().with("id", id).with("title", title))
}

fn add(id: &str, title: &str) -> MutationEvent {
    MutationEvent::Add {
        record: ticket(id, title),
    }
}

fn update(id: &str, title: &str) -> MutationEvent {
    MutationEvent::Update {
        key: id.into(),
        partial: Fields::new().with("title", title),
    }
}

fn titles(view: &PageView) -> Vec<String> {
    view.rows
        .iter()
        .map(|row| {
            row.record
                .get("title")
                .map(Value::render)
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

/// Grid double that tracks how many submissions are outstanding at once.
struct TrackingGrid {
    hold: bool,
    received: Mutex<Vec<GridTransaction>>,
    pending: Mutex<Vec<oneshot::Sender<ApplyReport>>>,
    max_outstanding: AtomicUsize,
}

impl TrackingGrid {
    fn new(hold: bool) -> Arc<Self> {
        Arc::new(Self {
            hold,
            received: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            max_outstanding: AtomicUsize::new(0),
        })
    }

    fn complete_all(&self) {
        for done in self.pending.lock().drain(..) {
            let _ = done.send(ApplyReport::default());
        }
    }
}

impl PresentationSink for TrackingGrid {
    fn is_attached(&self) -> bool {
        true
    }

    fn submit(
        &self,
        transaction: GridTransaction,
        done: oneshot::Sender<ApplyReport>,
    ) -> Result<(), SyncError> {
        self.received.lock().push(transaction);
        if self.hold {
            let mut pending = self.pending.lock();
            pending.push(done);
            self.max_outstanding
                .fetch_max(pending.len(), Ordering::SeqCst);
        } else {
            self.max_outstanding.fetch_max(1, Ordering::SeqCst);
            let _ = done.send(ApplyReport::default());
        }
        Ok(())
    }
}

#[derive(Default)]
struct PagedBackend {
    pages: Mutex<HashMap<usize, Vec<Record>>>,
    total: Mutex<u64>,
    offline: AtomicBool,
}

impl PagedBackend {
    fn new(total: u64, pages: Vec<(usize, Vec<Record>)>) -> Arc<Self> {
        let backend = Self::default();
        *backend.total.lock() = total;
        backend.pages.lock().extend(pages);
        Arc::new(backend)
    }
}

#[async_trait]
impl PageSource for PagedBackend {
    async fn fetch_page(
        &self,
        _table_id: &str,
        page: usize,
        _page_size: usize,
    ) -> Result<PageLoad, SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::source_error("offline"));
        }
        Ok(PageLoad {
            records: self.pages.lock().get(&page).cloned().unwrap_or_default(),
            total_count: *self.total.lock(),
        })
    }

    async fn fetch_total_count(&self, _table_id: &str) -> Result<u64, SyncError> {
        Ok(*self.total.lock())
    }
}

#[tokio::test(start_paused = true)]
async fn first_page_update_add_delete_settles_in_one_transaction() {
    let engine = SyncEngine::new(test_config(2)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(3, vec![(0, vec![ticket("A", "A"), ticket("B", "B")])]);
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    sub.push_event(update("A", "A2")).expect("push");
    sub.push_event(add("D", "D")).expect("push");
    sub.push_event(MutationEvent::Delete { key: "B".into() })
        .expect("push");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let view = sub.view();
    assert_eq!(titles(&view), vec!["A2", "D"]);
    assert_eq!(view.total_records, 3);
    assert!(!view.has_new_records_on_previous_pages);
    assert_eq!(grid.received.lock().len(), 1);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn first_page_stays_bounded_under_a_stream_of_additions() {
    let engine = SyncEngine::new(test_config(3)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(
        3,
        vec![(0, vec![ticket("A", "A"), ticket("B", "B"), ticket("C", "C")])],
    );
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    for i in 0..10 {
        let id = format!("n{i:02}");
        sub.push_event(add(&id, &id)).expect("push");
        sub.force_flush();
        assert_eq!(sub.view().rows.len(), 3);
    }
    assert_eq!(titles(&sub.view()), vec!["A", "B", "n09"]);

    for i in 10..20 {
        let id = format!("n{i:02}");
        sub.push_event(add(&id, &id)).expect("push");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let view = sub.view();
    assert_eq!(titles(&view), vec!["n17", "n18", "n19"]);
    assert_eq!(view.total_records, 23);
    assert_eq!(sub.metrics().coordinator.evictions, 20);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn burst_on_one_row_collapses_to_latest_value() {
    let engine = SyncEngine::new(test_config(10)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(1, vec![(0, vec![ticket("hot", "v0")])]);
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    let burst = scaled(1_000);
    for i in 1..=burst {
        sub.push_event(update("hot", &format!("v{i}"))).expect("push");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let received = grid.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].update.len(), 1);
    assert_eq!(titles(&sub.view()), vec![format!("v{burst}")]);
    assert_eq!(sub.metrics().buffer.events_coalesced, (burst - 1) as u64);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn later_page_stays_stable_while_new_records_arrive() {
    let engine = SyncEngine::new(test_config(2)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(
        6,
        vec![
            (0, vec![ticket("A", "A"), ticket("B", "B")]),
            (2, vec![ticket("E", "E"), ticket("F", "F")]),
        ],
    );
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");
    sub.change_page(2).await.expect("page 2");

    for i in 0..5 {
        sub.push_event(add(&format!("new-{i}"), "fresh")).expect("push");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let view = sub.view();
    assert_eq!(titles(&view), vec!["E", "F"]);
    assert_eq!(view.current_page, 2);
    assert_eq!(view.total_records, 11);
    assert!(view.has_new_records_on_previous_pages);
    assert!(sub.new_records_notice().is_some());
    assert!(
        grid.received.lock().iter().all(|tx| tx.add.is_empty()),
        "additions must not materialize on a later page"
    );
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn at_most_one_transaction_is_ever_outstanding() {
    let engine = SyncEngine::new(test_config(100)).expect("engine");
    let grid = TrackingGrid::new(true);
    let backend = PagedBackend::new(0, vec![]);
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    for round in 0..10 {
        for i in 0..5 {
            sub.push_event(add(&format!("r{round}-{i}"), "x")).expect("push");
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        if round % 3 == 2 {
            grid.complete_all();
        }
    }
    for _ in 0..5 {
        grid.complete_all();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert_eq!(grid.max_outstanding.load(Ordering::SeqCst), 1);
    let added: usize = grid.received.lock().iter().map(|tx| tx.add.len()).sum();
    assert_eq!(added, 50, "every row applied exactly once");
    assert_eq!(sub.view().rows.len(), 50);
    assert_eq!(sub.state(), SubscriptionState::Idle);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn composite_keyed_rows_are_tracked_without_unique_field() {
    let engine = SyncEngine::new(test_config(10)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(0, vec![]);
    let memberships = TableSchema::new("memberships");
    let sub = engine
        .subscribe(memberships.clone(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    let fields = Fields::new()
        .with("__typename", "Membership")
        .with("user", "u1")
        .with("team", "t9");
    let key = composite_key(&memberships, &fields);
    assert_eq!(key.as_str(), "team:t9|user:u1");

    sub.push_event(MutationEvent::Add {
        record: memberships.record(fields),
    })
    .expect("push");
    sub.force_flush();
    assert_eq!(sub.view().rows.len(), 1);

    sub.push_event(MutationEvent::Delete { key }).expect("push");
    sub.force_flush();
    assert!(sub.view().rows.is_empty());
    assert_eq!(sub.view().total_records, 0);
    engine.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_converge_to_one_row_per_key() {
    let producers = 4;
    let per_producer = scaled(100);
    let engine = SyncEngine::new(test_config(producers * per_producer)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(0, vec![]);
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    let mut handles = Vec::new();
    for p in 0..producers {
        let sub = Arc::clone(&sub);
        handles.push(tokio::spawn(async move {
            for i in 0..per_producer {
                let id = format!("p{p}-{i}");
                sub.push_event(add(&id, "new")).expect("push");
                sub.push_event(update(&id, "edited")).expect("push");
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.expect("producer");
    }
    sub.force_flush();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let view = sub.view();
    assert_eq!(view.rows.len(), producers * per_producer);
    assert_eq!(view.total_records, (producers * per_producer) as u64);
    assert!(titles(&view).iter().all(|t| t == "edited"));
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn offline_backend_fails_navigation_but_keeps_syncing() {
    let engine = SyncEngine::new(test_config(2)).expect("engine");
    let grid = TrackingGrid::new(false);
    let backend = PagedBackend::new(4, vec![(0, vec![ticket("A", "A"), ticket("B", "B")])]);
    let sub = engine
        .subscribe(schema(), grid.clone(), backend.clone())
        .await
        .expect("subscribe");

    backend.offline.store(true, Ordering::SeqCst);
    assert!(sub.change_page(1).await.is_err());

    sub.push_event(update("B", "B2")).expect("push");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(titles(&sub.view()), vec!["A", "B2"]);
    engine.shutdown();
}
