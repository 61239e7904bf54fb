mod adaptive;

use crate::config::SyncConfig;
use adaptive::AdaptiveFlushState;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Debounce,
    Periodic,
    /// Re-attempt after an in-flight apply completed.
    Retry,
    Forced,
    PageChange,
    Teardown,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Debounce => "debounce",
            FlushReason::Periodic => "periodic",
            FlushReason::Retry => "retry",
            FlushReason::Forced => "forced",
            FlushReason::PageChange => "page_change",
            FlushReason::Teardown => "teardown",
        }
    }

    /// Forced flushes must drain even while an apply is in flight.
    pub fn is_forced(self) -> bool {
        matches!(
            self,
            FlushReason::Forced | FlushReason::PageChange | FlushReason::Teardown
        )
    }
}

/// What the scheduler's timers drive. Timers hold only a weak reference, so a
/// dropped target stops its timers on their next tick.
pub trait FlushTarget: Send + Sync + 'static {
    fn has_pending(&self) -> bool;
    fn flush(&self, reason: FlushReason);
    fn reconcile_count(self: Arc<Self>) -> impl Future<Output = ()> + Send;
}

#[derive(Default)]
struct DebounceState {
    deadline: Option<Instant>,
    armed: bool,
    handle: Option<JoinHandle<()>>,
}

/// Decides when a table's buffer is drained: a trailing debounce from the most
/// recent event plus an unconditional periodic timer. Both timers, and the
/// optional count-reconcile timer, belong to one subscription and are
/// cancelled together.
pub struct FlushScheduler<T: FlushTarget> {
    config: Arc<SyncConfig>,
    target: Weak<T>,
    runtime: Handle,
    debounce: Arc<Mutex<DebounceState>>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    reconcile: Mutex<Option<JoinHandle<()>>>,
    adaptive: Mutex<AdaptiveFlushState>,
    cancelled: AtomicBool,
}

impl<T: FlushTarget> FlushScheduler<T> {
    pub fn new(config: Arc<SyncConfig>, target: Weak<T>, runtime: Handle) -> Self {
        let adaptive = AdaptiveFlushState::from_config(&config);
        Self {
            config,
            target,
            runtime,
            debounce: Arc::new(Mutex::new(DebounceState::default())),
            periodic: Mutex::new(None),
            reconcile: Mutex::new(None),
            adaptive: Mutex::new(adaptive),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Starts the periodic flush timer and, when configured, the count
    /// reconciliation timer.
    pub fn start(&self) {
        if self.is_cancelled() {
            return;
        }
        let period = self.config.periodic_flush();
        let target = self.target.clone();
        let periodic = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(target) = target.upgrade() else {
                    break;
                };
                if target.has_pending() {
                    target.flush(FlushReason::Periodic);
                }
            }
        });
        replace_handle(&self.periodic, periodic);

        if let Some(every) = self.config.count_reconcile_interval() {
            let target = self.target.clone();
            let reconcile = self.runtime.spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(target) = target.upgrade() else {
                        break;
                    };
                    target.reconcile_count().await;
                }
            });
            replace_handle(&self.reconcile, reconcile);
        }
    }

    /// Pushes the debounce deadline out to one quiet interval from now,
    /// arming the debounce timer if it is idle.
    pub fn schedule(&self) {
        if self.is_cancelled() {
            return;
        }
        let wait = self.adaptive.lock().debounce(&self.config);
        let mut state = self.debounce.lock();
        state.deadline = Some(Instant::now() + wait);
        if state.armed {
            return;
        }
        state.armed = true;
        let shared = Arc::clone(&self.debounce);
        let target = self.target.clone();
        state.handle = Some(self.runtime.spawn(async move {
            loop {
                let wait_until = {
                    let mut st = shared.lock();
                    match st.deadline {
                        Some(deadline) if Instant::now() < deadline => Some(deadline),
                        _ => {
                            st.deadline = None;
                            st.armed = false;
                            None
                        }
                    }
                };
                match wait_until {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => break,
                }
            }
            if let Some(target) = target.upgrade() {
                target.flush(FlushReason::Debounce);
            }
        }));
    }

    /// Disarms a pending debounce without cancelling the periodic timer.
    pub fn cancel_pending(&self) {
        let mut state = self.debounce.lock();
        state.deadline = None;
        state.armed = false;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    pub fn observe_flush(&self, batch_len: usize) {
        let mut adaptive = self.adaptive.lock();
        let before = adaptive.current_debounce_ms();
        adaptive.observe_flush(&self.config, batch_len);
        let after = adaptive.current_debounce_ms();
        if before != after {
            debug!(before, after, batch_len, "adaptive debounce adjusted");
        }
    }

    pub fn current_debounce_ms(&self) -> u64 {
        self.adaptive.lock().debounce(&self.config).as_millis() as u64
    }

    /// Cancels every timer. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_pending();
        for slot in [&self.periodic, &self.reconcile] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T: FlushTarget> Drop for FlushScheduler<T> {
    fn drop(&mut self) {
        if !self.is_cancelled() {
            warn!("flush scheduler dropped without cancel; aborting timers");
            self.cancel();
        }
    }
}

fn replace_handle(slot: &Mutex<Option<JoinHandle<()>>>, handle: JoinHandle<()>) {
    if let Some(previous) = slot.lock().replace(handle) {
        previous.abort();
    }
}
