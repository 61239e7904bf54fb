pub mod applier;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod scheduler;
pub mod source;
pub mod subscription;
#[cfg(test)]
pub(crate) mod test_support;

pub use crate::applier::{ApplyOutcome, ApplyReport, GridRow, GridTransaction, PresentationSink};
pub use crate::buffer::{BufferOutcome, BufferStats};
pub use crate::catalog::schema::TableSchema;
pub use crate::catalog::types::{Fields, MutationEvent, Record, Value};
pub use crate::config::SyncConfig;
pub use crate::coordinator::page::{NewRecordsNotice, PageView};
pub use crate::error::{SyncError, SyncErrorCode};
pub use crate::identity::IdentityKey;
pub use crate::scheduler::FlushReason;
pub use crate::source::{PageLoad, PageSource};
pub use crate::subscription::{FlushOutcome, SubscriptionState, SyncMetrics, TableSubscription};

use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Subscribed { table_id: String },
    /// An existing subscription was torn down to make room for a new one.
    Resubscribed { table_id: String },
    Unsubscribed { table_id: String },
}

pub trait LifecycleHook: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Registry of live table subscriptions. At most one subscription exists per
/// table id; subscribing again tears the old one down first.
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    tables: Mutex<HashMap<CompactString, Arc<TableSubscription>>>,
    lifecycle_hooks: Mutex<Vec<Arc<dyn LifecycleHook>>>,
    shut_down: AtomicBool,
}

impl SyncEngine {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            tables: Mutex::new(HashMap::new()),
            lifecycle_hooks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn add_lifecycle_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.lifecycle_hooks.lock().push(hook);
    }

    pub fn remove_lifecycle_hook(&self, hook: &Arc<dyn LifecycleHook>) {
        let mut hooks = self.lifecycle_hooks.lock();
        hooks.retain(|existing| !Arc::ptr_eq(existing, hook));
    }

    fn dispatch(&self, event: LifecycleEvent) {
        let hooks = self.lifecycle_hooks.lock().clone();
        for hook in &hooks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook.on_event(&event)))
                .is_err()
            {
                warn!("lifecycle hook panicked while handling event");
            }
        }
    }

    /// Opens a subscription for `schema.table_id` and loads its first page.
    pub async fn subscribe(
        &self,
        schema: TableSchema,
        sink: Arc<dyn PresentationSink>,
        source: Arc<dyn PageSource>,
    ) -> Result<Arc<TableSubscription>, SyncError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SyncError::Detached {
                table_id: schema.table_id.to_string(),
            });
        }
        let table_id = schema.table_id.clone();
        let previous = self.tables.lock().remove(&table_id);
        if let Some(previous) = &previous {
            previous.teardown();
        }

        let subscription =
            TableSubscription::open(Arc::clone(&self.config), schema, sink, source).await?;
        let raced = self
            .tables
            .lock()
            .insert(table_id.clone(), Arc::clone(&subscription));
        if let Some(raced) = raced {
            raced.teardown();
        }

        info!(table_id = %table_id, resubscribed = previous.is_some(), "table subscribed");
        let table_id = table_id.to_string();
        self.dispatch(if previous.is_some() {
            LifecycleEvent::Resubscribed { table_id }
        } else {
            LifecycleEvent::Subscribed { table_id }
        });
        Ok(subscription)
    }

    /// Tears down the table's subscription. Returns false if none was live.
    pub fn unsubscribe(&self, table_id: &str) -> bool {
        let Some(subscription) = self.tables.lock().remove(table_id) else {
            return false;
        };
        subscription.teardown();
        self.dispatch(LifecycleEvent::Unsubscribed {
            table_id: table_id.to_string(),
        });
        true
    }

    pub fn get(&self, table_id: &str) -> Option<Arc<TableSubscription>> {
        self.tables.lock().get(table_id).cloned()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.lock().keys().map(|id| id.to_string()).collect();
        ids.sort();
        ids
    }

    /// Routes a transport event to the table's buffer.
    pub fn push_event(
        &self,
        table_id: &str,
        event: MutationEvent,
    ) -> Result<BufferOutcome, SyncError> {
        match self.get(table_id) {
            Some(subscription) => subscription.push_event(event),
            None => Err(SyncError::Detached {
                table_id: table_id.to_string(),
            }),
        }
    }

    pub fn metrics(&self) -> Vec<(String, SyncMetrics)> {
        let subscriptions: Vec<Arc<TableSubscription>> =
            self.tables.lock().values().cloned().collect();
        let mut out: Vec<(String, SyncMetrics)> = subscriptions
            .iter()
            .map(|sub| (sub.table_id().to_string(), sub.metrics()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Tears down every subscription and refuses new ones.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<(CompactString, Arc<TableSubscription>)> =
            self.tables.lock().drain().collect();
        for (table_id, subscription) in drained {
            subscription.teardown();
            self.dispatch(LifecycleEvent::Unsubscribed {
                table_id: table_id.to_string(),
            });
        }
        info!("sync engine shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
