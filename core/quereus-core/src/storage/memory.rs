//! Reference in-memory KV backend.
//!
//! A `BTreeMap` behind an `RwLock`. Iteration is lazy: the iterator re-seeks
//! past its last yielded key on every step, so it never holds the lock
//! between steps and starts in O(1). Interleaved writes during an iteration
//! are therefore visible to later steps, which the store contract permits.
//!
//! Reverse iteration applies the upper bound as "skip until at-or-below"
//! and the lower bound as "stop when below"; both bounds constrain the
//! range, on either end, regardless of direction.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{QuereusError, QuereusResult};
use crate::storage::provider::{StoreId, StoreProvider};
use crate::storage::{IterateOptions, KvEntry, KvIter, KvStore, WriteBatch};

type Tree = BTreeMap<Vec<u8>, Arc<Vec<u8>>>;

/// In-memory [`KvStore`].
pub struct MemoryKvStore {
    tree: Arc<RwLock<Tree>>,
    closed: Arc<AtomicBool>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(RwLock::new(BTreeMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_open(&self) -> QuereusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(QuereusError::Misuse("store is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The effective `(bound, inclusive)` pair for one end, combining the
/// inclusive and exclusive options when both are present.
fn effective_lower(opts: &IterateOptions) -> Bound<Vec<u8>> {
    match (&opts.gte, &opts.gt) {
        (Some(gte), Some(gt)) => {
            if gt >= gte {
                Bound::Excluded(gt.clone())
            } else {
                Bound::Included(gte.clone())
            }
        }
        (Some(gte), None) => Bound::Included(gte.clone()),
        (None, Some(gt)) => Bound::Excluded(gt.clone()),
        (None, None) => Bound::Unbounded,
    }
}

fn effective_upper(opts: &IterateOptions) -> Bound<Vec<u8>> {
    match (&opts.lte, &opts.lt) {
        (Some(lte), Some(lt)) => {
            if lt <= lte {
                Bound::Excluded(lt.clone())
            } else {
                Bound::Included(lte.clone())
            }
        }
        (Some(lte), None) => Bound::Included(lte.clone()),
        (None, Some(lt)) => Bound::Excluded(lt.clone()),
        (None, None) => Bound::Unbounded,
    }
}

struct MemoryIter {
    tree: Arc<RwLock<Tree>>,
    closed: Arc<AtomicBool>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    /// Last key yielded; the next step seeks strictly past it.
    cursor: Option<Vec<u8>>,
    remaining: usize,
    reverse: bool,
    done: bool,
}

impl Iterator for MemoryIter {
    type Item = QuereusResult<KvEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        if self.closed.load(Ordering::Acquire) {
            self.done = true;
            return Some(Err(QuereusError::Misuse("store is closed".into())));
        }
        let tree = self.tree.read();
        let entry = if self.reverse {
            // Walk down from the upper bound; the cursor tightens the top end.
            let upper = match &self.cursor {
                Some(last) => Bound::Excluded(last.clone()),
                None => self.upper.clone(),
            };
            tree.range::<Vec<u8>, _>((self.lower.clone(), upper))
                .next_back()
                .map(|(k, v)| (k.clone(), v.clone()))
        } else {
            let lower = match &self.cursor {
                Some(last) => Bound::Excluded(last.clone()),
                None => self.lower.clone(),
            };
            tree.range::<Vec<u8>, _>((lower, self.upper.clone()))
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
        };
        drop(tree);
        match entry {
            Some((key, value)) => {
                self.cursor = Some(key.clone());
                self.remaining -= 1;
                Some(Ok(KvEntry {
                    key,
                    value: value.as_ref().clone(),
                }))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> QuereusResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.tree.read().get(key).map(|v| v.as_ref().clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> QuereusResult<()> {
        self.check_open()?;
        self.tree.write().insert(key.to_vec(), Arc::new(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> QuereusResult<()> {
        self.check_open()?;
        self.tree.write().remove(key);
        Ok(())
    }

    fn has(&self, key: &[u8]) -> QuereusResult<bool> {
        self.check_open()?;
        Ok(self.tree.read().contains_key(key))
    }

    fn iterate(&self, opts: IterateOptions) -> QuereusResult<KvIter> {
        self.check_open()?;
        Ok(Box::new(MemoryIter {
            tree: Arc::clone(&self.tree),
            closed: Arc::clone(&self.closed),
            lower: effective_lower(&opts),
            upper: effective_upper(&opts),
            cursor: None,
            remaining: opts.limit.unwrap_or(usize::MAX),
            reverse: opts.reverse,
            done: false,
        }))
    }

    fn batch(&self) -> QuereusResult<Box<dyn WriteBatch>> {
        self.check_open()?;
        Ok(Box::new(MemoryWriteBatch {
            tree: Arc::clone(&self.tree),
            closed: Arc::clone(&self.closed),
            ops: Vec::new(),
        }))
    }

    fn approximate_count(&self, opts: &IterateOptions) -> QuereusResult<u64> {
        self.check_open()?;
        let tree = self.tree.read();
        let count = tree
            .range::<Vec<u8>, _>((effective_lower(opts), effective_upper(opts)))
            .count();
        Ok(count as u64)
    }

    fn close(&self) -> QuereusResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemoryWriteBatch {
    tree: Arc<RwLock<Tree>>,
    closed: Arc<AtomicBool>,
    ops: Vec<BatchOp>,
}

impl WriteBatch for MemoryWriteBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    fn clear(&mut self) {
        self.ops.clear();
    }

    fn write(self: Box<Self>) -> QuereusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuereusError::Misuse("store is closed".into()));
        }
        // One write lock for the whole batch: atomic w.r.t. readers.
        let mut tree = self.tree.write();
        for op in self.ops {
            match op {
                BatchOp::Put(key, value) => {
                    tree.insert(key, Arc::new(value));
                }
                BatchOp::Delete(key) => {
                    tree.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// [`StoreProvider`] handing out in-memory stores keyed by logical identity:
/// repeated requests for the same logical store return the same instance.
pub struct MemoryStoreProvider {
    stores: DashMap<StoreId, Arc<MemoryKvStore>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
        }
    }

    fn open(&self, id: StoreId) -> Arc<dyn KvStore> {
        self.stores
            .entry(id)
            .or_insert_with(|| Arc::new(MemoryKvStore::new()))
            .value()
            .clone()
    }
}

impl Default for MemoryStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn store(&self, id: &StoreId) -> QuereusResult<Arc<dyn KvStore>> {
        Ok(self.open(id.clone()))
    }

    fn close_store(&self, id: &StoreId) -> QuereusResult<()> {
        if let Some((_, store)) = self.stores.remove(id) {
            store.close()?;
        }
        Ok(())
    }

    fn close_all(&self) -> QuereusResult<()> {
        for entry in self.stores.iter() {
            entry.value().close()?;
        }
        self.stores.clear();
        Ok(())
    }

    fn delete_table_stores(&self, schema_name: &str, table_name: &str) -> QuereusResult<()> {
        let doomed: Vec<StoreId> = self
            .stores
            .iter()
            .filter(|e| e.key().belongs_to_table(schema_name, table_name))
            .map(|e| e.key().clone())
            .collect();
        for id in doomed {
            self.close_store(&id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_keys(keys: &[&[u8]]) -> MemoryKvStore {
        let store = MemoryKvStore::new();
        for k in keys {
            store.put(k, b"v").unwrap();
        }
        store
    }

    fn collect_keys(iter: KvIter) -> Vec<Vec<u8>> {
        iter.map(|e| e.unwrap().key).collect()
    }

    #[test]
    fn basic_crud() {
        let store = MemoryKvStore::new();
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert!(store.has(b"a").unwrap());
        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        // delete is idempotent
        store.delete(b"a").unwrap();
    }

    #[test]
    fn forward_iteration_with_bounds() {
        let store = store_with_keys(&[&[1], &[2], &[3], &[4], &[5]]);
        let keys = collect_keys(
            store
                .iterate(IterateOptions {
                    gt: Some(vec![1]),
                    lt: Some(vec![4]),
                    ..Default::default()
                })
                .unwrap(),
        );
        assert_eq!(keys, vec![vec![2], vec![3]]);
    }

    // Regression test: reverse iteration over [0x01..0x05] with
    // gte 0x02 / lte 0x04 must yield 0x04, 0x03, 0x02 in that order.
    #[test]
    fn reverse_iteration_honors_both_bounds() {
        let store = store_with_keys(&[&[1], &[2], &[3], &[4], &[5]]);
        let keys = collect_keys(
            store
                .iterate(IterateOptions {
                    gte: Some(vec![2]),
                    lte: Some(vec![4]),
                    reverse: true,
                    ..Default::default()
                })
                .unwrap(),
        );
        assert_eq!(keys, vec![vec![4], vec![3], vec![2]]);
    }

    #[test]
    fn reverse_iteration_with_exclusive_bounds() {
        let store = store_with_keys(&[&[1], &[2], &[3], &[4], &[5]]);
        let keys = collect_keys(
            store
                .iterate(IterateOptions {
                    gt: Some(vec![1]),
                    lt: Some(vec![5]),
                    reverse: true,
                    ..Default::default()
                })
                .unwrap(),
        );
        assert_eq!(keys, vec![vec![4], vec![3], vec![2]]);
    }

    #[test]
    fn limit_caps_entries() {
        let store = store_with_keys(&[&[1], &[2], &[3]]);
        let keys = collect_keys(
            store
                .iterate(IterateOptions {
                    limit: Some(2),
                    ..Default::default()
                })
                .unwrap(),
        );
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn batch_is_atomic_and_ordered() {
        let store = MemoryKvStore::new();
        store.put(b"a", b"old").unwrap();
        let mut batch = store.batch().unwrap();
        batch.put(b"a", b"mid");
        batch.delete(b"a");
        batch.put(b"b", b"new");
        batch.write().unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn batch_clear_discards_pending_ops() {
        let store = MemoryKvStore::new();
        let mut batch = store.batch().unwrap();
        batch.put(b"a", b"1");
        batch.clear();
        batch.write().unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = MemoryKvStore::new();
        store.close().unwrap();
        store.close().unwrap(); // idempotent
        assert!(matches!(store.get(b"a"), Err(QuereusError::Misuse(_))));
        assert!(matches!(store.put(b"a", b"1"), Err(QuereusError::Misuse(_))));
        assert!(matches!(
            store.iterate(IterateOptions::default()),
            Err(QuereusError::Misuse(_))
        ));
    }

    #[test]
    fn approximate_count_is_exact_here() {
        let store = store_with_keys(&[&[1], &[2], &[3]]);
        let count = store
            .approximate_count(&IterateOptions {
                gte: Some(vec![2]),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn provider_returns_identical_instances() {
        let provider = MemoryStoreProvider::new();
        let id = StoreId::data("main", "users");
        let a = provider.store(&id).unwrap();
        let b = provider.store(&id).unwrap();
        a.put(b"k", b"v").unwrap();
        assert_eq!(b.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn delete_table_stores_removes_all_table_stores() {
        let provider = MemoryStoreProvider::new();
        provider.store(&StoreId::data("main", "users")).unwrap();
        provider.store(&StoreId::index("main", "users", "ix_name")).unwrap();
        provider.store(&StoreId::stats("main", "users")).unwrap();
        let catalog = provider.store(&StoreId::Catalog).unwrap();
        provider.delete_table_stores("main", "users").unwrap();
        // table stores are gone and closed; the catalog survives
        assert!(catalog.put(b"k", b"v").is_ok());
        let fresh = provider.store(&StoreId::data("main", "users")).unwrap();
        assert_eq!(fresh.get(b"k").unwrap(), None);
    }
}
