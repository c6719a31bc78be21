//! The virtual-table module contract.
//!
//! Every table in the engine is backed by a module: the module owns storage
//! lifecycle (create/connect/destroy), index creation, and access planning.
//! The core only ever holds these trait objects.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::QuereusResult;
use crate::schema::{IndexSchema, SchemaChangeSink, TableSchema};
use crate::types::{Row, SqlValue};
use crate::vtab::access_plan::{BestAccessPlanRequest, BestAccessPlanResult, FilterConstraint};

/// Lazy, single-consumer row sequence. Dropping it abandons the scan.
pub type RowIter = Box<dyn Iterator<Item = QuereusResult<Row>> + Send>;

/// What a scan asks of a table: the constraints the planner pushed down and
/// the index the access plan selected (None means primary-key access).
#[derive(Debug, Clone, Default)]
pub struct FilterInfo {
    pub constraints: Vec<FilterConstraint>,
    pub index_name: Option<String>,
}

/// DML operation kinds accepted by [`VirtualTable::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
}

/// Conflict policy for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Abort,
    Replace,
}

/// Arguments to one row mutation.
#[derive(Debug, Clone)]
pub struct UpdateArgs {
    pub op: DmlOp,
    /// Full new row for insert/update.
    pub values: Option<Row>,
    /// Primary-key values identifying the existing row for update/delete.
    pub old_key_values: Option<Vec<SqlValue>>,
    pub on_conflict: ConflictPolicy,
}

/// A live table instance.
pub trait VirtualTable: Send + Sync {
    fn schema(&self) -> Arc<TableSchema>;

    /// Lazy scan under the pushed-down constraints.
    fn query(&self, filter: &FilterInfo) -> QuereusResult<RowIter>;

    /// Mutate one row; returns the new row for insert/update, `None` for
    /// delete or when the target row does not exist.
    fn update(&self, args: UpdateArgs) -> QuereusResult<Option<Row>>;

    fn best_access_plan(
        &self,
        request: &BestAccessPlanRequest,
    ) -> QuereusResult<BestAccessPlanResult>;

    /// The stable per-table connection. Registration with the database is
    /// required before transactional DML.
    fn connection(&self) -> QuereusResult<Arc<dyn VirtualTableConnection>>;

    fn estimated_row_count(&self) -> u64;

    /// Flush pending state and release this table's handle on its stores
    /// without closing them (other tables may share them).
    fn disconnect(&self) -> QuereusResult<()>;
}

/// A table's participation handle in a database transaction.
pub trait VirtualTableConnection: Send + Sync {
    fn id(&self) -> Uuid;
    fn table_key(&self) -> (String, String);
    fn begin(&self) -> QuereusResult<()>;
    fn commit(&self) -> QuereusResult<()>;
    fn rollback(&self) -> QuereusResult<()>;
    fn create_savepoint(&self, depth: u32) -> QuereusResult<()>;
    fn rollback_to_savepoint(&self, depth: u32) -> QuereusResult<()>;
    fn release_savepoint(&self, depth: u32) -> QuereusResult<()>;
}

/// A registered table module.
pub trait VtabModule: Send + Sync {
    /// Create a fresh table: storage, catalog DDL entry, change event.
    fn create(&self, schema: Arc<TableSchema>) -> QuereusResult<Arc<dyn VirtualTable>>;

    /// Reattach to an existing table's storage.
    fn connect(&self, schema: Arc<TableSchema>) -> QuereusResult<Arc<dyn VirtualTable>>;

    /// Tear a table down: disconnect, close stores, remove catalog entries.
    /// Idempotent after the first call.
    fn destroy(&self, schema_name: &str, table_name: &str) -> QuereusResult<()>;

    /// Persist index metadata and backfill entries from existing rows.
    fn create_index(
        &self,
        schema_name: &str,
        table_name: &str,
        index: &IndexSchema,
    ) -> QuereusResult<()>;

    /// DDL statements persisted in the catalog, for boot-time schema
    /// reconstruction.
    fn stored_ddl(&self) -> QuereusResult<Vec<String>>;

    /// Wire schema-change notifications (create/drop/create index) from
    /// this module into the given sink.
    fn set_change_sink(&self, sink: SchemaChangeSink);
}
