//! Lazily-flushed row-count statistics.
//!
//! Each mutation adjusts a delta: immediately when autocommitting, or into
//! `pending_delta` inside a transaction (applied on commit, discarded on
//! rollback). Every `STATS_FLUSH_INTERVAL` mutations the record is written
//! back to the stats store; flush failures are logged and never propagate
//! into the foreground statement. Cross-connection drift is permitted and
//! corrected on the next flush.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::warn;

use crate::codec::{StatsRecord, deserialize_stats, serialize_stats};
use crate::storage::KvStore;

use super::StoreTable;

/// Mutations between deferred stats flushes.
pub(crate) const STATS_FLUSH_INTERVAL: u32 = 100;

/// The fixed key of the single stats record (empty bytes).
pub(crate) const STATS_KEY: &[u8] = &[];

pub(crate) struct StatsState {
    store: Option<Arc<dyn KvStore>>,
    cached: Option<StatsRecord>,
    /// Delta accumulated inside the open transaction.
    pending_delta: i64,
    pending_mutations: u32,
    /// Committed mutations since the last flush.
    mutations_since_flush: u32,
    dirty: bool,
}

impl StatsState {
    pub(crate) fn new() -> Self {
        Self {
            store: None,
            cached: None,
            pending_delta: 0,
            pending_mutations: 0,
            mutations_since_flush: 0,
            dirty: false,
        }
    }

    pub(crate) fn attach_store(&mut self, store: Arc<dyn KvStore>) {
        if self.store.is_none() {
            self.store = Some(store);
        }
    }

    /// Committed row count, loading the record on first use; absent ⇒ 0.
    pub(crate) fn row_count(&mut self) -> u64 {
        self.load();
        self.cached.map(|s| s.row_count).unwrap_or(0)
    }

    fn load(&mut self) {
        if self.cached.is_some() {
            return;
        }
        let Some(store) = &self.store else { return };
        let record = match store.get(STATS_KEY) {
            Ok(Some(bytes)) => match deserialize_stats(&bytes) {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "discarding unreadable stats record");
                    StatsRecord { row_count: 0, updated_at: 0 }
                }
            },
            Ok(None) => StatsRecord { row_count: 0, updated_at: 0 },
            Err(err) => {
                warn!(error = %err, "stats load failed");
                StatsRecord { row_count: 0, updated_at: 0 }
            }
        };
        self.cached = Some(record);
    }

    fn apply(&mut self, delta: i64) {
        self.load();
        let record = self.cached.get_or_insert(StatsRecord { row_count: 0, updated_at: 0 });
        record.row_count = if delta.is_negative() {
            record.row_count.saturating_sub(delta.unsigned_abs())
        } else {
            record.row_count.saturating_add(delta as u64)
        };
        self.dirty = true;
    }

    pub(crate) fn note_mutation(&mut self, delta: i64, in_transaction: bool) {
        if in_transaction {
            self.pending_delta += delta;
            self.pending_mutations += 1;
        } else {
            self.apply(delta);
            self.mutations_since_flush += 1;
            self.maybe_flush();
        }
    }

    pub(crate) fn commit_pending(&mut self) {
        if self.pending_mutations == 0 {
            return;
        }
        let delta = self.pending_delta;
        let mutations = self.pending_mutations;
        self.pending_delta = 0;
        self.pending_mutations = 0;
        self.apply(delta);
        self.mutations_since_flush += mutations;
        self.maybe_flush();
    }

    pub(crate) fn discard_pending(&mut self) {
        self.pending_delta = 0;
        self.pending_mutations = 0;
    }

    fn maybe_flush(&mut self) {
        if self.mutations_since_flush >= STATS_FLUSH_INTERVAL {
            self.flush();
        }
    }

    pub(crate) fn flush_if_dirty(&mut self) {
        if self.dirty {
            self.flush();
        }
    }

    fn flush(&mut self) {
        let Some(store) = &self.store else { return };
        let Some(record) = &mut self.cached else { return };
        record.updated_at = now_millis();
        // Background bookkeeping: a failed flush must not abort the statement.
        if let Err(err) = store.put(STATS_KEY, &serialize_stats(record)) {
            warn!(error = %err, "stats flush failed");
            return;
        }
        self.mutations_since_flush = 0;
        self.dirty = false;
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn apply_committed_delta(stats: &Arc<Mutex<StatsState>>) {
    stats.lock().commit_pending();
}

impl StoreTable {
    pub(crate) fn note_stats_mutation(&self, delta: i64) {
        self.stats
            .lock()
            .note_mutation(delta, self.coordinator().in_transaction());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn state_with_store() -> (StatsState, Arc<dyn KvStore>) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut state = StatsState::new();
        state.attach_store(Arc::clone(&store));
        (state, store)
    }

    #[test]
    fn autocommit_mutations_apply_immediately() {
        let (mut state, _store) = state_with_store();
        state.note_mutation(1, false);
        state.note_mutation(1, false);
        state.note_mutation(-1, false);
        assert_eq!(state.row_count(), 1);
    }

    #[test]
    fn pending_delta_waits_for_commit() {
        let (mut state, _store) = state_with_store();
        state.note_mutation(1, true);
        assert_eq!(state.row_count(), 0);
        state.commit_pending();
        assert_eq!(state.row_count(), 1);
    }

    #[test]
    fn rollback_discards_pending_delta() {
        let (mut state, _store) = state_with_store();
        state.note_mutation(1, true);
        state.discard_pending();
        state.commit_pending();
        assert_eq!(state.row_count(), 0);
    }

    #[test]
    fn flush_happens_at_interval() {
        let (mut state, store) = state_with_store();
        for _ in 0..STATS_FLUSH_INTERVAL {
            state.note_mutation(1, false);
        }
        let bytes = store.get(STATS_KEY).unwrap().expect("flushed record");
        let record = deserialize_stats(&bytes).unwrap();
        assert_eq!(record.row_count, STATS_FLUSH_INTERVAL as u64);
    }

    #[test]
    fn no_flush_before_interval() {
        let (mut state, store) = state_with_store();
        state.note_mutation(1, false);
        assert_eq!(store.get(STATS_KEY).unwrap(), None);
        state.flush_if_dirty();
        assert!(store.get(STATS_KEY).unwrap().is_some());
    }

    #[test]
    fn row_count_never_goes_negative() {
        let (mut state, _store) = state_with_store();
        state.note_mutation(-5, false);
        assert_eq!(state.row_count(), 0);
    }

    #[test]
    fn flush_failure_is_swallowed() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let mut state = StatsState::new();
        state.attach_store(Arc::clone(&store));
        state.note_mutation(1, false);
        store.close().unwrap();
        // closed store: the flush fails, but the call must not error
        state.flush_if_dirty();
        assert_eq!(state.row_count(), 1);
    }
}
