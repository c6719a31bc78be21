//! The generic KV-backed relational table.
//!
//! A [`StoreTable`] presents a [`TableSchema`] over four logical stores:
//! data (rows under order-preserving pk keys), one store per secondary
//! index (empty values, the key is the entry), a single-record stats store,
//! and the shared catalog (owned by the module). All mutations (data,
//! index and stats alike) route through the table's transaction
//! coordinator when one is open.

mod dml;
mod module;
mod query;
mod stats;

pub use module::StoreModule;

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{QuereusError, QuereusResult};
use crate::schema::{CollationRegistry, IndexSchema, TableSchema};
use crate::storage::{IterateOptions, KvIter, KvStore, StoreId, StoreProvider};
use crate::transaction::{TransactionCoordinator, merge_with_pending};
use crate::vtab::access_plan::{
    BestAccessPlanRequest, BestAccessPlanResult, CandidateIndex, OrderingSpec, PRIMARY_INDEX,
    choose_best_access,
};
use crate::vtab::module::{
    FilterInfo, RowIter, UpdateArgs, VirtualTable, VirtualTableConnection,
};

use self::stats::StatsState;

/// Resolved store handles for one table. Built once per table instance.
pub(crate) struct TableStores {
    pub data: Arc<dyn KvStore>,
    pub indexes: Vec<(IndexSchema, Arc<dyn KvStore>)>,
    pub stats: Arc<dyn KvStore>,
}

pub struct StoreTable {
    schema: Arc<TableSchema>,
    provider: Arc<dyn StoreProvider>,
    collations: Arc<CollationRegistry>,
    coordinator: Arc<TransactionCoordinator>,
    /// Single-flight store initialization: the mutex serializes first use,
    /// so concurrent first queries share one resolution.
    stores: Mutex<Option<Arc<TableStores>>>,
    stats: Arc<Mutex<StatsState>>,
    connection: Mutex<Option<Arc<StoreTableConnection>>>,
}

impl StoreTable {
    pub fn new(
        schema: Arc<TableSchema>,
        provider: Arc<dyn StoreProvider>,
        collations: Arc<CollationRegistry>,
    ) -> Arc<Self> {
        let coordinator = Arc::new(TransactionCoordinator::new());
        let stats = Arc::new(Mutex::new(StatsState::new()));
        let table = Arc::new(Self {
            schema,
            provider,
            collations,
            coordinator: Arc::clone(&coordinator),
            stores: Mutex::new(None),
            stats: Arc::clone(&stats),
            connection: Mutex::new(None),
        });

        // Pending stats deltas follow the transaction outcome.
        let commit_stats = Arc::clone(&stats);
        coordinator.on_commit(Arc::new(move || {
            stats::apply_committed_delta(&commit_stats);
        }));
        let rollback_stats = Arc::clone(&stats);
        coordinator.on_rollback(Arc::new(move || {
            rollback_stats.lock().discard_pending();
        }));

        table
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub(crate) fn ensure_stores(&self) -> QuereusResult<Arc<TableStores>> {
        let mut guard = self.stores.lock();
        if let Some(stores) = guard.as_ref() {
            return Ok(Arc::clone(stores));
        }
        let schema = &self.schema;
        let data = self
            .provider
            .store(&StoreId::data(&schema.schema_name, &schema.name))?;
        let mut indexes = Vec::with_capacity(schema.indexes.len());
        for index in &schema.indexes {
            let store = self.provider.store(&StoreId::index(
                &schema.schema_name,
                &schema.name,
                &index.name,
            ))?;
            indexes.push((index.clone(), store));
        }
        let stats_store = self
            .provider
            .store(&StoreId::stats(&schema.schema_name, &schema.name))?;
        self.stats.lock().attach_store(Arc::clone(&stats_store));
        let stores = Arc::new(TableStores {
            data,
            indexes,
            stats: stats_store,
        });
        *guard = Some(Arc::clone(&stores));
        Ok(stores)
    }

    /// Read through the coordinator's pending overlay, then the store.
    pub(crate) fn read_kv(
        &self,
        store: &Arc<dyn KvStore>,
        key: &[u8],
    ) -> QuereusResult<Option<Vec<u8>>> {
        if let Some(pending) = self.coordinator.pending_lookup(store, key) {
            return Ok(pending);
        }
        store.get(key)
    }

    /// Write through the coordinator inside a transaction, else directly.
    pub(crate) fn write_kv(
        &self,
        store: &Arc<dyn KvStore>,
        key: &[u8],
        value: &[u8],
    ) -> QuereusResult<()> {
        if self.coordinator.in_transaction() {
            self.coordinator.put(store, key, value)
        } else {
            store.put(key, value)
        }
    }

    pub(crate) fn delete_kv(&self, store: &Arc<dyn KvStore>, key: &[u8]) -> QuereusResult<()> {
        if self.coordinator.in_transaction() {
            self.coordinator.delete(store, key)
        } else {
            store.delete(key)
        }
    }

    /// Iterate a store with the transaction's buffered writes merged in.
    pub(crate) fn iterate_kv(
        &self,
        store: &Arc<dyn KvStore>,
        opts: IterateOptions,
    ) -> QuereusResult<KvIter> {
        let pending = self.coordinator.pending_in_range(store, &opts);
        let base = store.iterate(opts.clone())?;
        if pending.is_empty() {
            Ok(base)
        } else {
            Ok(merge_with_pending(base, pending, opts.reverse))
        }
    }

    fn candidate_indexes(&self) -> Vec<CandidateIndex> {
        let mut candidates = vec![CandidateIndex {
            name: PRIMARY_INDEX.into(),
            columns: self
                .schema
                .primary_key
                .iter()
                .map(|k| OrderingSpec {
                    column_index: k.column_index,
                    desc: k.direction.is_desc(),
                })
                .collect(),
        }];
        for index in &self.schema.indexes {
            candidates.push(CandidateIndex {
                name: index.name.clone(),
                columns: index
                    .columns
                    .iter()
                    .map(|k| OrderingSpec {
                        column_index: k.column_index,
                        desc: k.direction.is_desc(),
                    })
                    .collect(),
            });
        }
        candidates
    }
}

impl VirtualTable for StoreTable {
    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    fn query(&self, filter: &FilterInfo) -> QuereusResult<RowIter> {
        self.scan(filter)
    }

    fn update(&self, args: UpdateArgs) -> QuereusResult<Option<crate::types::Row>> {
        self.apply_update(args)
    }

    fn best_access_plan(
        &self,
        request: &BestAccessPlanRequest,
    ) -> QuereusResult<BestAccessPlanResult> {
        Ok(choose_best_access(
            self.estimated_row_count(),
            &self.candidate_indexes(),
            request,
        ))
    }

    fn connection(&self) -> QuereusResult<Arc<dyn VirtualTableConnection>> {
        let mut guard = self.connection.lock();
        if let Some(connection) = guard.as_ref() {
            return Ok(Arc::clone(connection) as Arc<dyn VirtualTableConnection>);
        }
        let connection = Arc::new(StoreTableConnection {
            id: Uuid::new_v4(),
            schema_name: self.schema.schema_name.clone(),
            table_name: self.schema.name.clone(),
            coordinator: Arc::clone(&self.coordinator),
        });
        *guard = Some(Arc::clone(&connection));
        Ok(connection)
    }

    fn estimated_row_count(&self) -> u64 {
        match self.ensure_stores() {
            Ok(_) => self.stats.lock().row_count(),
            Err(_) => self.schema.estimated_rows,
        }
    }

    fn disconnect(&self) -> QuereusResult<()> {
        self.stats.lock().flush_if_dirty();
        *self.stores.lock() = None;
        *self.connection.lock() = None;
        Ok(())
    }
}

/// Connection handle delegating transaction control to the coordinator.
pub struct StoreTableConnection {
    id: Uuid,
    schema_name: String,
    table_name: String,
    coordinator: Arc<TransactionCoordinator>,
}

impl VirtualTableConnection for StoreTableConnection {
    fn id(&self) -> Uuid {
        self.id
    }

    fn table_key(&self) -> (String, String) {
        (self.schema_name.clone(), self.table_name.clone())
    }

    fn begin(&self) -> QuereusResult<()> {
        self.coordinator.begin();
        Ok(())
    }

    fn commit(&self) -> QuereusResult<()> {
        self.coordinator.commit()
    }

    fn rollback(&self) -> QuereusResult<()> {
        self.coordinator.rollback();
        Ok(())
    }

    fn create_savepoint(&self, depth: u32) -> QuereusResult<()> {
        self.coordinator.create_savepoint(depth)
    }

    fn rollback_to_savepoint(&self, depth: u32) -> QuereusResult<()> {
        self.coordinator.rollback_to_savepoint(depth)
    }

    fn release_savepoint(&self, depth: u32) -> QuereusResult<()> {
        self.coordinator.release_savepoint(depth)
    }
}

#[allow(unused)]
fn _assert_traits() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<StoreTable>();
}

pub(crate) fn internal(msg: impl Into<String>) -> QuereusError {
    QuereusError::Internal(msg.into())
}
