pub mod page;

use crate::applier::{GridRow, GridTransaction};
use crate::buffer::{Batch, PendingAddition, PendingUpdate};
use crate::catalog::schema::TableSchema;
use crate::config::SyncConfig;
use crate::identity::{IdentityKey, identity_key};
use crate::source::PageLoad;
use im::OrdMap;
use page::{NewRecordsNotice, PageState, PageView};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Out-of-band mutation delivered by the transport.
    Remote,
    /// Optimistic edit made by the current user.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    pub row: GridRow,
    pub integrated_seq: u64,
    /// Inserted by a live addition rather than a page load.
    pub locally_added: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub batches_integrated: u64,
    pub stale_updates: u64,
    pub additions_on_previous_pages: u64,
    pub count_corrections: u64,
    pub page_loads: u64,
    /// Rows pushed off the first page by live additions.
    pub evictions: u64,
}

/// Owns a table's canonical cache and pagination metadata. The only writer:
/// remote batches and optimistic edits both go through [`Self::integrate`].
#[derive(Debug, Clone)]
pub struct MergeCoordinator {
    schema: Arc<TableSchema>,
    /// Empty transaction carrying the configured presentation flags.
    blank: GridTransaction,
    cache: OrdMap<IdentityKey, CachedRecord>,
    /// Rows without a derivable identity; never targeted by key.
    unkeyed: Vec<CachedRecord>,
    page: PageState,
    next_seq: u64,
    stats: CoordinatorStats,
}

impl MergeCoordinator {
    pub fn new(schema: Arc<TableSchema>, config: &SyncConfig) -> Self {
        Self {
            schema,
            blank: GridTransaction::with_flags(config),
            cache: OrdMap::new(),
            unkeyed: Vec::new(),
            page: PageState::new(config.default_page_size),
            next_seq: 0,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn page(&self) -> PageState {
        self.page
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&CachedRecord> {
        self.cache.get(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys inserted by live additions since the last page load.
    pub fn locally_added_keys(&self) -> HashSet<IdentityKey> {
        self.cache
            .values()
            .filter(|cached| cached.locally_added)
            .map(|cached| cached.row.key.clone())
            .collect()
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Replaces the canonical cache with a freshly loaded page. Rows from the
    /// previous page are evicted, not deleted.
    pub fn load_page(&mut self, page_index: usize, load: PageLoad) {
        let rows: Vec<GridRow> = load
            .records
            .into_iter()
            .map(|record| GridRow {
                key: identity_key(&self.schema, &record),
                record,
            })
            .collect();
        let rows = deduplicate(&self.schema, rows);

        self.cache = OrdMap::new();
        self.unkeyed.clear();
        for row in rows {
            let cached = CachedRecord {
                row,
                integrated_seq: self.take_seq(),
                locally_added: false,
            };
            if cached.row.key.is_unknown() {
                self.unkeyed.push(cached);
            } else {
                self.cache.insert(cached.row.key.clone(), cached);
            }
        }
        self.page.current_page = page_index;
        self.page.total_records = load.total_count;
        self.page.has_new_records_on_previous_pages = false;
        self.stats.page_loads += 1;
        debug!(
            table_id = %self.schema.table_id,
            page = page_index,
            rows = self.len(),
            total = load.total_count,
            "page loaded"
        );
    }

    pub fn set_page_size(&mut self, page_size: usize) {
        self.page.page_size = page_size.max(1);
    }

    /// Applies a drained batch to canonical state and returns the part of it
    /// that is visible on the materialized page.
    pub fn integrate(&mut self, batch: Batch, origin: ChangeOrigin) -> GridTransaction {
        let mut tx = self.blank.clone();
        if batch.is_empty() {
            return tx;
        }
        let first_seq = self.next_seq;
        let Batch {
            updates,
            additions,
            deletions,
        } = batch;

        for PendingAddition { key, record } in additions {
            if key.is_unknown() {
                self.page.add_records(1);
                if self.page.current_page == 0 {
                    let row = GridRow { key, record };
                    tx.add.push(row.clone());
                    let seq = self.take_seq();
                    self.unkeyed.push(CachedRecord {
                        row,
                        integrated_seq: seq,
                        locally_added: true,
                    });
                } else {
                    self.note_addition_on_previous_page();
                }
                continue;
            }
            let seq = self.take_seq();
            if let Some(cached) = self.cache.get_mut(&key) {
                // Already materialized: duplicate delivery or a resurrected row.
                cached.row.record = record;
                cached.integrated_seq = seq;
                tx.update.push(cached.row.clone());
                continue;
            }
            self.page.add_records(1);
            if self.page.current_page == 0 {
                let row = GridRow { key, record };
                tx.add.push(row.clone());
                self.cache.insert(
                    row.key.clone(),
                    CachedRecord {
                        row,
                        integrated_seq: seq,
                        locally_added: true,
                    },
                );
            } else {
                self.note_addition_on_previous_page();
            }
        }

        for PendingUpdate { key, partial } in updates {
            let seq = self.take_seq();
            match self.cache.get_mut(&key) {
                Some(cached) => {
                    cached.row.record.merge(&partial);
                    cached.integrated_seq = seq;
                    tx.update.push(cached.row.clone());
                }
                None => self.stats.stale_updates += 1,
            }
        }

        for key in deletions {
            if self.cache.remove(&key).is_some() {
                tx.remove.push(key);
            }
            self.page.remove_records(1);
        }

        if self.page.current_page == 0 {
            self.evict_past_page_end(&mut tx, first_seq);
        }
        if origin == ChangeOrigin::Remote {
            self.page.has_realtime_updates = true;
            self.page.last_realtime_update_ms = Some(now_millis());
        }
        self.stats.batches_integrated += 1;
        tx
    }

    /// Bounds the first page to `page_size` after live additions. Rows pushed
    /// off the end leave the cache but still count toward `total_records`.
    /// Rows already shown give way first, from the tail of the projection;
    /// after that the earliest additions of this batch.
    fn evict_past_page_end(&mut self, tx: &mut GridTransaction, first_seq: u64) {
        let mut excess = self.len().saturating_sub(self.page.page_size);
        if excess == 0 {
            return;
        }
        let fresh: HashSet<&IdentityKey> = tx.add.iter().map(|row| &row.key).collect();
        let mut settled: Vec<GridRow> = self
            .cache
            .values()
            .filter(|cached| !fresh.contains(&cached.row.key))
            .map(|cached| cached.row.clone())
            .collect();
        settled.sort_by(|a, b| projection_order(&self.schema, a, b));

        while excess > 0 {
            let Some(row) = settled.pop() else {
                break;
            };
            self.cache.remove(&row.key);
            tx.update.retain(|updated| updated.key != row.key);
            tx.remove.push(row.key);
            excess -= 1;
            self.stats.evictions += 1;
        }
        while excess > 0 && !tx.add.is_empty() {
            let row = tx.add.remove(0);
            if row.key.is_unknown() {
                if let Some(pos) = self.unkeyed.iter().position(|cached| {
                    cached.integrated_seq >= first_seq && cached.row.record == row.record
                }) {
                    self.unkeyed.remove(pos);
                }
            } else {
                self.cache.remove(&row.key);
            }
            excess -= 1;
            self.stats.evictions += 1;
        }
        if excess > 0 {
            debug!(
                table_id = %self.schema.table_id,
                excess,
                "unkeyed rows keep the first page over its size"
            );
        }
    }

    fn note_addition_on_previous_page(&mut self) {
        self.page.has_new_records_on_previous_pages = true;
        self.stats.additions_on_previous_pages += 1;
    }

    /// Overwrites the incremental count with an authoritative one. Returns the
    /// drift that was corrected, if any.
    pub fn reconcile_total(&mut self, authoritative: u64) -> Option<i64> {
        let drift = authoritative as i64 - self.page.total_records as i64;
        if drift == 0 {
            return None;
        }
        info!(
            table_id = %self.schema.table_id,
            incremental = self.page.total_records,
            authoritative,
            "correcting record count drift"
        );
        self.page.total_records = authoritative;
        self.stats.count_corrections += 1;
        Some(drift)
    }

    pub fn new_records_notice(&self) -> Option<NewRecordsNotice> {
        (self.page.has_new_records_on_previous_pages && self.page.current_page > 0).then_some(
            NewRecordsNotice {
                current_page: self.page.current_page,
                total_records: self.page.total_records,
            },
        )
    }

    pub fn clear_realtime_flags(&mut self) {
        self.page.has_realtime_updates = false;
        self.page.has_new_records_on_previous_pages = false;
    }

    /// Deduplicated, order-stable projection of the current page.
    pub fn view(&self) -> PageView {
        let mut rows: Vec<GridRow> = self
            .cache
            .values()
            .map(|cached| cached.row.clone())
            .collect();
        rows.extend(self.unkeyed.iter().map(|cached| cached.row.clone()));
        rows.sort_by(|a, b| projection_order(&self.schema, a, b));
        PageView {
            rows,
            current_page: self.page.current_page,
            page_size: self.page.page_size,
            total_records: self.page.total_records,
            total_pages: self.page.total_pages(),
            has_new_records_on_previous_pages: self.page.has_new_records_on_previous_pages,
            has_realtime_updates: self.page.has_realtime_updates,
            last_realtime_update_ms: self.page.last_realtime_update_ms,
        }
    }
}

/// Keeps the last occurrence of each key (unknown identities are never
/// merged) and returns rows in projection order.
pub fn deduplicate(schema: &TableSchema, rows: Vec<GridRow>) -> Vec<GridRow> {
    let mut slots: Vec<Option<GridRow>> = Vec::with_capacity(rows.len());
    let mut latest: HashMap<IdentityKey, usize> = HashMap::with_capacity(rows.len());
    for row in rows {
        if !row.key.is_unknown()
            && let Some(previous) = latest.insert(row.key.clone(), slots.len())
        {
            slots[previous] = None;
        }
        slots.push(Some(row));
    }
    let mut out: Vec<GridRow> = slots.into_iter().flatten().collect();
    out.sort_by(|a, b| projection_order(schema, a, b));
    out
}

/// `created_at` ascending, ties and rows without it by identity key; rows
/// lacking `created_at` sort after rows carrying it.
fn projection_order(schema: &TableSchema, a: &GridRow, b: &GridRow) -> Ordering {
    match (schema.created_at(&a.record), schema.created_at(&b.record)) {
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.key.cmp(&b.key)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.key.cmp(&b.key),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
