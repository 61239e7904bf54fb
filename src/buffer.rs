use crate::catalog::schema::TableSchema;
use crate::catalog::types::{Fields, MutationEvent, Record};
use crate::identity::{IdentityKey, identity_key};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Net effect of every event seen for one key since the last drain.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Added(Record),
    Updated(Fields),
    Deleted,
    /// Delete followed by add. Drains as an addition, but a later delete must
    /// still reach the cache because the original row existed.
    Replaced(Record),
}

#[derive(Debug, Clone)]
struct BufferEntry {
    seq: u64,
    op: PendingOp,
}

#[derive(Debug, Default)]
struct BufferState {
    entries: HashMap<IdentityKey, BufferEntry>,
    unkeyed_additions: Vec<(u64, Record)>,
    next_seq: u64,
}

impl BufferState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unkeyed_additions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub key: IdentityKey,
    pub partial: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAddition {
    pub key: IdentityKey,
    pub record: Record,
}

/// Drained, deduplicated net effect of a flush window. Each list keeps the
/// arrival order of the first event that touched each key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub updates: Vec<PendingUpdate>,
    pub additions: Vec<PendingAddition>,
    pub deletions: Vec<IdentityKey>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.additions.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len() + self.additions.len() + self.deletions.len()
    }

    pub fn single_update(key: IdentityKey, partial: Fields) -> Self {
        Self {
            updates: vec![PendingUpdate { key, partial }],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    /// First pending operation for this key in the current window.
    Buffered,
    /// Collapsed into an already-pending entry (possibly cancelling it).
    Coalesced,
    /// Carried no usable identity; logged and discarded.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub pending_updates: usize,
    pub pending_additions: usize,
    pub pending_deletions: usize,
    pub events_received: u64,
    pub events_coalesced: u64,
    pub events_dropped: u64,
    pub drains: u64,
}

#[derive(Debug, Default)]
struct BufferCounters {
    events_received: AtomicU64,
    events_coalesced: AtomicU64,
    events_dropped: AtomicU64,
    drains: AtomicU64,
}

/// Per-table accumulator that coalesces raw mutation events by identity key.
///
/// At most one pending entry exists per key, so memory is bounded by the number
/// of distinct keys touched since the last drain rather than by event volume.
#[derive(Debug)]
pub struct MutationBuffer {
    schema: Arc<TableSchema>,
    state: Mutex<BufferState>,
    counters: BufferCounters,
}

impl MutationBuffer {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self {
            schema,
            state: Mutex::new(BufferState::default()),
            counters: BufferCounters::default(),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn buffer_event(&self, event: MutationEvent) -> BufferOutcome {
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();
        let outcome = {
            let mut state = self.state.lock();
            match event {
                MutationEvent::Add { record } => {
                    let key = identity_key(&self.schema, &record);
                    if key.is_unknown() {
                        warn!(
                            table_id = %self.schema.table_id,
                            "addition without derivable identity buffered as always-new"
                        );
                        let seq = state.take_seq();
                        state.unkeyed_additions.push((seq, record));
                        BufferOutcome::Buffered
                    } else {
                        buffer_add(&mut state, key, record)
                    }
                }
                MutationEvent::Update { key, partial } => {
                    if key.is_unknown() {
                        BufferOutcome::Dropped
                    } else {
                        buffer_update(&mut state, key, partial)
                    }
                }
                MutationEvent::Delete { key } => {
                    if key.is_unknown() {
                        BufferOutcome::Dropped
                    } else {
                        buffer_delete(&mut state, key)
                    }
                }
            }
        };
        match outcome {
            BufferOutcome::Coalesced => {
                self.counters
                    .events_coalesced
                    .fetch_add(1, Ordering::Relaxed);
            }
            BufferOutcome::Dropped => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table_id = %self.schema.table_id,
                    kind,
                    "dropping event that targets an unknown identity"
                );
            }
            BufferOutcome::Buffered => {}
        }
        outcome
    }

    /// Atomically takes the pending net effect and leaves a fresh buffer behind.
    /// Events arriving after the swap land in the new buffer.
    pub fn drain(&self) -> Batch {
        let taken = std::mem::take(&mut *self.state.lock());
        if taken.is_empty() {
            return Batch::default();
        }
        self.counters.drains.fetch_add(1, Ordering::Relaxed);

        let mut entries: Vec<(IdentityKey, BufferEntry)> = taken.entries.into_iter().collect();
        entries.sort_by_key(|(_, entry)| entry.seq);

        let mut additions: Vec<(u64, PendingAddition)> = Vec::new();
        let mut batch = Batch::default();
        for (key, entry) in entries {
            match entry.op {
                PendingOp::Added(record) | PendingOp::Replaced(record) => {
                    additions.push((entry.seq, PendingAddition { key, record }));
                }
                PendingOp::Updated(partial) => batch.updates.push(PendingUpdate { key, partial }),
                PendingOp::Deleted => batch.deletions.push(key),
            }
        }
        additions.extend(taken.unkeyed_additions.into_iter().map(|(seq, record)| {
            (
                seq,
                PendingAddition {
                    key: IdentityKey::unknown(),
                    record,
                },
            )
        }));
        additions.sort_by_key(|(seq, _)| *seq);
        batch.additions = additions.into_iter().map(|(_, a)| a).collect();
        batch
    }

    /// Drops everything pending without producing a batch.
    pub fn discard(&self) -> usize {
        let taken = std::mem::take(&mut *self.state.lock());
        taken.entries.len() + taken.unkeyed_additions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock();
        let mut stats = BufferStats {
            pending_additions: state.unkeyed_additions.len(),
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            events_coalesced: self.counters.events_coalesced.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            drains: self.counters.drains.load(Ordering::Relaxed),
            ..BufferStats::default()
        };
        for entry in state.entries.values() {
            match entry.op {
                PendingOp::Added(_) | PendingOp::Replaced(_) => stats.pending_additions += 1,
                PendingOp::Updated(_) => stats.pending_updates += 1,
                PendingOp::Deleted => stats.pending_deletions += 1,
            }
        }
        stats
    }
}

fn buffer_add(state: &mut BufferState, key: IdentityKey, record: Record) -> BufferOutcome {
    if let Some(entry) = state.entries.get_mut(&key) {
        entry.op = match std::mem::replace(&mut entry.op, PendingOp::Deleted) {
            PendingOp::Deleted | PendingOp::Replaced(_) => PendingOp::Replaced(record),
            PendingOp::Added(_) | PendingOp::Updated(_) => PendingOp::Added(record),
        };
        return BufferOutcome::Coalesced;
    }
    let seq = state.take_seq();
    state.entries.insert(
        key,
        BufferEntry {
            seq,
            op: PendingOp::Added(record),
        },
    );
    BufferOutcome::Buffered
}

fn buffer_update(state: &mut BufferState, key: IdentityKey, partial: Fields) -> BufferOutcome {
    if let Some(entry) = state.entries.get_mut(&key) {
        match &mut entry.op {
            PendingOp::Added(record) | PendingOp::Replaced(record) => record.merge(&partial),
            PendingOp::Updated(pending) => pending.merge(&partial),
            // The row is gone; a late update cannot revive it.
            PendingOp::Deleted => {}
        }
        return BufferOutcome::Coalesced;
    }
    let seq = state.take_seq();
    state.entries.insert(
        key,
        BufferEntry {
            seq,
            op: PendingOp::Updated(partial),
        },
    );
    BufferOutcome::Buffered
}

fn buffer_delete(state: &mut BufferState, key: IdentityKey) -> BufferOutcome {
    match state.entries.get_mut(&key) {
        Some(entry) => {
            if matches!(entry.op, PendingOp::Added(_)) {
                // Never became visible: net effect is nothing.
                state.entries.remove(&key);
            } else {
                entry.op = PendingOp::Deleted;
            }
            BufferOutcome::Coalesced
        }
        None => {
            let seq = state.take_seq();
            state.entries.insert(
                key,
                BufferEntry {
                    seq,
                    op: PendingOp::Deleted,
                },
            );
            BufferOutcome::Buffered
        }
    }
}
