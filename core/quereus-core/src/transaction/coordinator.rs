//! The transaction coordinator for one virtual-table instance.
//!
//! Between `begin` and `commit`/`rollback` the coordinator buffers every
//! write (data, index and stats stores alike) in one ordered pending log,
//! answers read-your-own-writes lookups from an overlay map, queues row
//! change events for at-commit delivery, and tracks savepoint marks as
//! (log length, event length) pairs.
//!
//! Commit builds one atomic batch per distinct backing store, applies them,
//! drains the event queue in FIFO order, then runs the commit hooks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{QuereusError, QuereusResult};
use crate::storage::{IterateOptions, KvEntry, KvIter, KvStore};
use crate::types::Row;

/// Kind of row change produced by DML.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row change announced to subscribers when its transaction commits.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table_name: String,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

pub type EventSink = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type TxHook = Arc<dyn Fn() + Send + Sync>;

struct PendingWrite {
    slot: usize,
    key: Vec<u8>,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

struct SavepointMark {
    depth: u32,
    log_len: usize,
    event_len: usize,
}

#[derive(Default)]
struct Inner {
    active: bool,
    /// Distinct backing stores touched by buffered writes, in first-use order.
    stores: Vec<Arc<dyn KvStore>>,
    log: Vec<PendingWrite>,
    /// (slot, key) → latest buffered value; rebuilt on savepoint rollback.
    overlay: HashMap<(usize, Vec<u8>), Option<Vec<u8>>>,
    events: Vec<ChangeEvent>,
    savepoints: Vec<SavepointMark>,
}

impl Inner {
    fn slot_for(&mut self, store: &Arc<dyn KvStore>) -> usize {
        if let Some(i) = self.stores.iter().position(|s| Arc::ptr_eq(s, store)) {
            return i;
        }
        self.stores.push(Arc::clone(store));
        self.stores.len() - 1
    }

    fn rebuild_overlay(&mut self) {
        self.overlay.clear();
        for write in &self.log {
            self.overlay
                .insert((write.slot, write.key.clone()), write.value.clone());
        }
    }

    fn clear(&mut self) {
        self.active = false;
        self.log.clear();
        self.overlay.clear();
        self.events.clear();
        self.savepoints.clear();
    }
}

/// Transaction state for one table instance.
pub struct TransactionCoordinator {
    inner: Mutex<Inner>,
    sinks: Mutex<Vec<EventSink>>,
    commit_hooks: Mutex<Vec<TxHook>>,
    rollback_hooks: Mutex<Vec<TxHook>>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sinks: Mutex::new(Vec::new()),
            commit_hooks: Mutex::new(Vec::new()),
            rollback_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Enter a transaction. Idempotent when one is already open.
    pub fn begin(&self) {
        self.inner.lock().active = true;
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().active
    }

    /// Buffer an upsert. Fails with `Misuse` outside a transaction.
    pub fn put(&self, store: &Arc<dyn KvStore>, key: &[u8], value: &[u8]) -> QuereusResult<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(QuereusError::Misuse(
                "coordinator write outside a transaction".into(),
            ));
        }
        let slot = inner.slot_for(store);
        inner.log.push(PendingWrite {
            slot,
            key: key.to_vec(),
            value: Some(value.to_vec()),
        });
        inner
            .overlay
            .insert((slot, key.to_vec()), Some(value.to_vec()));
        Ok(())
    }

    /// Buffer a deletion. Fails with `Misuse` outside a transaction.
    pub fn delete(&self, store: &Arc<dyn KvStore>, key: &[u8]) -> QuereusResult<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(QuereusError::Misuse(
                "coordinator write outside a transaction".into(),
            ));
        }
        let slot = inner.slot_for(store);
        inner.log.push(PendingWrite {
            slot,
            key: key.to_vec(),
            value: None,
        });
        inner.overlay.insert((slot, key.to_vec()), None);
        Ok(())
    }

    /// Read-your-own-writes lookup: `Some(None)` is a buffered tombstone,
    /// outer `None` means "no buffered write, consult the store".
    pub fn pending_lookup(
        &self,
        store: &Arc<dyn KvStore>,
        key: &[u8],
    ) -> Option<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        if !inner.active {
            return None;
        }
        let slot = inner
            .stores
            .iter()
            .position(|s| Arc::ptr_eq(s, store))?;
        inner.overlay.get(&(slot, key.to_vec())).cloned()
    }

    /// Buffered writes for `store` inside the iteration bounds, sorted in
    /// iteration order. Feed to [`merge_with_pending`].
    pub fn pending_in_range(
        &self,
        store: &Arc<dyn KvStore>,
        opts: &IterateOptions,
    ) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let inner = self.inner.lock();
        if !inner.active {
            return Vec::new();
        }
        let Some(slot) = inner.stores.iter().position(|s| Arc::ptr_eq(s, store)) else {
            return Vec::new();
        };
        let mut entries: Vec<(Vec<u8>, Option<Vec<u8>>)> = inner
            .overlay
            .iter()
            .filter(|((s, key), _)| *s == slot && key_in_bounds(key, opts))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        if opts.reverse {
            entries.reverse();
        }
        entries
    }

    /// Queue an event for at-commit delivery; outside a transaction the
    /// event is delivered immediately.
    pub fn queue_event(&self, event: ChangeEvent) {
        let deliver_now = {
            let mut inner = self.inner.lock();
            if inner.active {
                inner.events.push(event.clone());
                false
            } else {
                true
            }
        };
        if deliver_now {
            self.deliver(&[event]);
        }
    }

    /// Record a savepoint at the given depth.
    pub fn create_savepoint(&self, depth: u32) -> QuereusResult<()> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(QuereusError::Misuse(
                "savepoint outside a transaction".into(),
            ));
        }
        let mark = SavepointMark {
            depth,
            log_len: inner.log.len(),
            event_len: inner.events.len(),
        };
        inner.savepoints.push(mark);
        Ok(())
    }

    /// Truncate the pending log and event queue back to the savepoint.
    /// The mark itself survives, so the savepoint can be rolled back to again.
    pub fn rollback_to_savepoint(&self, depth: u32) -> QuereusResult<()> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.savepoints.iter().rposition(|m| m.depth == depth) else {
            return Err(QuereusError::NotFound(format!("savepoint {depth}")));
        };
        let (log_len, event_len) = {
            let mark = &inner.savepoints[pos];
            (mark.log_len, mark.event_len)
        };
        inner.log.truncate(log_len);
        inner.events.truncate(event_len);
        inner.savepoints.truncate(pos + 1);
        inner.rebuild_overlay();
        Ok(())
    }

    /// Discard the savepoint mark without touching the log.
    pub fn release_savepoint(&self, depth: u32) -> QuereusResult<()> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.savepoints.iter().rposition(|m| m.depth == depth) else {
            return Err(QuereusError::NotFound(format!("savepoint {depth}")));
        };
        inner.savepoints.truncate(pos);
        Ok(())
    }

    /// Apply the pending log atomically (one batch per store), deliver
    /// queued events in FIFO order, run commit hooks, clear state.
    /// A commit with no open transaction is a no-op.
    pub fn commit(&self) -> QuereusResult<()> {
        let (stores, log, events) = {
            let mut inner = self.inner.lock();
            if !inner.active {
                return Ok(());
            }
            let stores = std::mem::take(&mut inner.stores);
            let log = std::mem::take(&mut inner.log);
            let events = std::mem::take(&mut inner.events);
            inner.clear();
            (stores, log, events)
        };

        let mut batches: Vec<Option<Box<dyn crate::storage::WriteBatch>>> =
            (0..stores.len()).map(|_| None).collect();
        for write in &log {
            let batch = match &mut batches[write.slot] {
                Some(b) => b,
                slot @ None => {
                    *slot = Some(stores[write.slot].batch()?);
                    slot.as_mut().unwrap()
                }
            };
            match &write.value {
                Some(value) => batch.put(&write.key, value),
                None => batch.delete(&write.key),
            }
        }
        for batch in batches.into_iter().flatten() {
            batch.write()?;
        }

        debug!(writes = log.len(), events = events.len(), "transaction committed");
        self.deliver(&events);
        for hook in self.commit_hooks.lock().iter() {
            hook();
        }
        Ok(())
    }

    /// Discard pending writes and events, run rollback hooks.
    pub fn rollback(&self) {
        {
            let mut inner = self.inner.lock();
            if !inner.active {
                return;
            }
            inner.stores.clear();
            inner.clear();
        }
        debug!("transaction rolled back");
        for hook in self.rollback_hooks.lock().iter() {
            hook();
        }
    }

    pub fn subscribe(&self, sink: EventSink) {
        self.sinks.lock().push(sink);
    }

    pub fn on_commit(&self, hook: TxHook) {
        self.commit_hooks.lock().push(hook);
    }

    pub fn on_rollback(&self, hook: TxHook) {
        self.rollback_hooks.lock().push(hook);
    }

    pub fn pending_write_count(&self) -> usize {
        self.inner.lock().log.len()
    }

    fn deliver(&self, events: &[ChangeEvent]) {
        let sinks = self.sinks.lock().clone();
        for event in events {
            for sink in &sinks {
                sink(event);
            }
        }
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn key_in_bounds(key: &[u8], opts: &IterateOptions) -> bool {
    if let Some(gte) = &opts.gte
        && key < gte.as_slice()
    {
        return false;
    }
    if let Some(gt) = &opts.gt
        && key <= gt.as_slice()
    {
        return false;
    }
    if let Some(lte) = &opts.lte
        && key > lte.as_slice()
    {
        return false;
    }
    if let Some(lt) = &opts.lt
        && key >= lt.as_slice()
    {
        return false;
    }
    true
}

/// Merge a store iteration with the transaction's buffered writes for the
/// same range. Buffered values shadow store values; tombstones drop them.
pub fn merge_with_pending(
    base: KvIter,
    pending: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    reverse: bool,
) -> KvIter {
    Box::new(MergedIter {
        base: base.peekable(),
        pending: pending.into_iter().peekable(),
        reverse,
    })
}

struct MergedIter {
    base: std::iter::Peekable<KvIter>,
    pending: std::iter::Peekable<std::vec::IntoIter<(Vec<u8>, Option<Vec<u8>>)>>,
    reverse: bool,
}

impl MergedIter {
    /// In iteration order, does `a` come before `b`?
    fn precedes(&self, a: &[u8], b: &[u8]) -> bool {
        if self.reverse { a > b } else { a < b }
    }
}

impl Iterator for MergedIter {
    type Item = QuereusResult<KvEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let take_pending = match (self.base.peek(), self.pending.peek()) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(Err(_)), _) => false,
                (Some(Ok(entry)), Some((pkey, _))) => !self.precedes(&entry.key, pkey),
            };
            if take_pending {
                let (key, value) = self.pending.next().expect("peeked");
                // Consume the shadowed store entry, if any.
                if let Some(Ok(entry)) = self.base.peek()
                    && entry.key == key
                {
                    self.base.next();
                }
                match value {
                    Some(value) => return Some(Ok(KvEntry { key, value })),
                    None => continue, // tombstone
                }
            }
            return match self.base.next() {
                Some(Ok(entry)) => Some(Ok(entry)),
                Some(Err(err)) => Some(Err(err)),
                None => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KvStore, MemoryKvStore};
    use parking_lot::Mutex as PlMutex;

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemoryKvStore::new())
    }

    #[test]
    fn writes_outside_transaction_are_misuse() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        assert!(matches!(
            coordinator.put(&s, b"k", b"v"),
            Err(QuereusError::Misuse(_))
        ));
        assert!(matches!(
            coordinator.delete(&s, b"k"),
            Err(QuereusError::Misuse(_))
        ));
    }

    #[test]
    fn begin_is_idempotent_and_commit_applies_in_order() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        coordinator.begin();
        coordinator.begin();
        coordinator.put(&s, b"k", b"v1").unwrap();
        coordinator.put(&s, b"k", b"v2").unwrap();
        coordinator.commit().unwrap();
        assert_eq!(s.get(b"k").unwrap(), Some(b"v2".to_vec()));
        assert!(!coordinator.in_transaction());
        // commit when idle is a no-op
        coordinator.commit().unwrap();
    }

    #[test]
    fn read_your_own_writes() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        s.put(b"k", b"committed").unwrap();
        coordinator.begin();
        coordinator.put(&s, b"k", b"buffered").unwrap();
        assert_eq!(
            coordinator.pending_lookup(&s, b"k"),
            Some(Some(b"buffered".to_vec()))
        );
        coordinator.delete(&s, b"k").unwrap();
        assert_eq!(coordinator.pending_lookup(&s, b"k"), Some(None));
        // the store itself is untouched until commit
        assert_eq!(s.get(b"k").unwrap(), Some(b"committed".to_vec()));
    }

    // Rollback idempotence: begin; ops; rollback leaves the store unchanged.
    #[test]
    fn rollback_discards_everything() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        s.put(b"keep", b"1").unwrap();
        coordinator.begin();
        coordinator.put(&s, b"new", b"2").unwrap();
        coordinator.delete(&s, b"keep").unwrap();
        coordinator.rollback();
        assert_eq!(s.get(b"keep").unwrap(), Some(b"1".to_vec()));
        assert_eq!(s.get(b"new").unwrap(), None);
        assert!(!coordinator.in_transaction());
    }

    // Savepoint nesting: begin; A; sp(0); B; sp(1); C; rollbackTo(1); commit
    // persists A and B, not C.
    #[test]
    fn savepoint_rollback_truncates_to_mark() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        coordinator.begin();
        coordinator.put(&s, b"a", b"1").unwrap();
        coordinator.create_savepoint(0).unwrap();
        coordinator.put(&s, b"b", b"2").unwrap();
        coordinator.create_savepoint(1).unwrap();
        coordinator.put(&s, b"c", b"3").unwrap();
        coordinator.rollback_to_savepoint(1).unwrap();
        coordinator.commit().unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(s.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(s.get(b"c").unwrap(), None);
    }

    #[test]
    fn savepoint_rollback_restores_overlay() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        coordinator.begin();
        coordinator.put(&s, b"k", b"old").unwrap();
        coordinator.create_savepoint(0).unwrap();
        coordinator.put(&s, b"k", b"new").unwrap();
        coordinator.rollback_to_savepoint(0).unwrap();
        assert_eq!(
            coordinator.pending_lookup(&s, b"k"),
            Some(Some(b"old".to_vec()))
        );
    }

    #[test]
    fn unknown_savepoint_depth_is_not_found() {
        let coordinator = TransactionCoordinator::new();
        coordinator.begin();
        assert!(matches!(
            coordinator.rollback_to_savepoint(7),
            Err(QuereusError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.release_savepoint(7),
            Err(QuereusError::NotFound(_))
        ));
    }

    #[test]
    fn release_keeps_log_but_forgets_mark() {
        let coordinator = TransactionCoordinator::new();
        let s = store();
        coordinator.begin();
        coordinator.create_savepoint(0).unwrap();
        coordinator.put(&s, b"a", b"1").unwrap();
        coordinator.release_savepoint(0).unwrap();
        assert!(coordinator.rollback_to_savepoint(0).is_err());
        coordinator.commit().unwrap();
        assert_eq!(s.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    // Event order: events delivered by a committed transaction match the
    // order of the DML that produced them.
    #[test]
    fn events_deliver_fifo_on_commit() {
        let coordinator = TransactionCoordinator::new();
        let seen: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        coordinator.subscribe(Arc::new(move |ev: &ChangeEvent| {
            sink_seen.lock().push(format!("{:?}:{}", ev.kind, ev.table_name));
        }));
        coordinator.begin();
        for (kind, table) in [
            (ChangeKind::Insert, "t1"),
            (ChangeKind::Update, "t2"),
            (ChangeKind::Delete, "t1"),
        ] {
            coordinator.queue_event(ChangeEvent {
                kind,
                table_name: table.to_string(),
                before: None,
                after: None,
            });
        }
        assert!(seen.lock().is_empty());
        coordinator.commit().unwrap();
        assert_eq!(
            seen.lock().clone(),
            vec!["Insert:t1", "Update:t2", "Delete:t1"]
        );
    }

    #[test]
    fn events_outside_transaction_deliver_immediately() {
        let coordinator = TransactionCoordinator::new();
        let seen: Arc<PlMutex<Vec<ChangeKind>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        coordinator.subscribe(Arc::new(move |ev: &ChangeEvent| {
            sink_seen.lock().push(ev.kind);
        }));
        coordinator.queue_event(ChangeEvent {
            kind: ChangeKind::Insert,
            table_name: "t".into(),
            before: None,
            after: None,
        });
        assert_eq!(seen.lock().clone(), vec![ChangeKind::Insert]);
    }

    #[test]
    fn rollback_drops_queued_events_and_runs_hooks() {
        let coordinator = TransactionCoordinator::new();
        let delivered: Arc<PlMutex<usize>> = Arc::new(PlMutex::new(0));
        let rolled_back: Arc<PlMutex<bool>> = Arc::new(PlMutex::new(false));
        let d = Arc::clone(&delivered);
        coordinator.subscribe(Arc::new(move |_| *d.lock() += 1));
        let r = Arc::clone(&rolled_back);
        coordinator.on_rollback(Arc::new(move || *r.lock() = true));
        coordinator.begin();
        coordinator.queue_event(ChangeEvent {
            kind: ChangeKind::Insert,
            table_name: "t".into(),
            before: None,
            after: None,
        });
        coordinator.rollback();
        assert_eq!(*delivered.lock(), 0);
        assert!(*rolled_back.lock());
    }

    #[test]
    fn merged_iteration_prefers_pending_and_skips_tombstones() {
        let s = store();
        s.put(&[1], b"one").unwrap();
        s.put(&[2], b"two").unwrap();
        s.put(&[4], b"four").unwrap();
        let coordinator = TransactionCoordinator::new();
        coordinator.begin();
        coordinator.put(&s, &[2], b"TWO").unwrap();
        coordinator.put(&s, &[3], b"THREE").unwrap();
        coordinator.delete(&s, &[4]).unwrap();

        let opts = IterateOptions::default();
        let base = s.iterate(opts.clone()).unwrap();
        let pending = coordinator.pending_in_range(&s, &opts);
        let merged: Vec<KvEntry> = merge_with_pending(base, pending, false)
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(
            merged,
            vec![
                KvEntry { key: vec![1], value: b"one".to_vec() },
                KvEntry { key: vec![2], value: b"TWO".to_vec() },
                KvEntry { key: vec![3], value: b"THREE".to_vec() },
            ]
        );
    }

    #[test]
    fn merged_iteration_reverse_order() {
        let s = store();
        s.put(&[1], b"one").unwrap();
        s.put(&[3], b"three").unwrap();
        let coordinator = TransactionCoordinator::new();
        coordinator.begin();
        coordinator.put(&s, &[2], b"two").unwrap();

        let opts = IterateOptions { reverse: true, ..Default::default() };
        let base = s.iterate(opts.clone()).unwrap();
        let pending = coordinator.pending_in_range(&s, &opts);
        let keys: Vec<Vec<u8>> = merge_with_pending(base, pending, true)
            .map(|e| e.unwrap().key)
            .collect();
        assert_eq!(keys, vec![vec![3], vec![2], vec![1]]);
    }
}
