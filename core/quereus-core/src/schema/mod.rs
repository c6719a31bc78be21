//! Schema catalog: namespaced table definitions, function and collation
//! registries, and the schema-change notification bus that drives plan
//! cache invalidation.

pub mod collation;
pub mod function;
pub mod table;

pub use collation::{CollationFn, CollationRegistry};
pub use function::{
    AggregateFactory, AggregateFunction, AggregateState, FunctionRegistry, ScalarFn,
    ScalarFunction, TableFunction,
};
pub use table::{ColumnSchema, IndexSchema, KeyColumn, TableSchema};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{QuereusError, QuereusResult};

/// The default namespace for unqualified names.
pub const MAIN_SCHEMA: &str = "main";
pub const TEMP_SCHEMA: &str = "temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeKind {
    CreateTable,
    DropTable,
    CreateIndex,
}

/// Broadcast when a catalog object changes; plan caches evict on these.
#[derive(Debug, Clone)]
pub struct SchemaChangeEvent {
    pub kind: SchemaChangeKind,
    pub schema_name: String,
    pub object_name: String,
}

pub type SchemaChangeSink = Arc<dyn Fn(&SchemaChangeEvent) + Send + Sync>;

/// Owner of every schema object for the lifetime of a database.
pub struct SchemaManager {
    schemas: DashMap<String, Arc<DashMap<String, Arc<TableSchema>>>>,
    pub functions: Arc<FunctionRegistry>,
    pub collations: Arc<CollationRegistry>,
    version_counter: AtomicU64,
    sinks: Mutex<Vec<SchemaChangeSink>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        let manager = Self {
            schemas: DashMap::new(),
            functions: Arc::new(FunctionRegistry::new()),
            collations: Arc::new(CollationRegistry::new()),
            version_counter: AtomicU64::new(0),
            sinks: Mutex::new(Vec::new()),
        };
        manager.schemas.insert(MAIN_SCHEMA.into(), Arc::new(DashMap::new()));
        manager.schemas.insert(TEMP_SCHEMA.into(), Arc::new(DashMap::new()));
        manager
    }

    /// Resolve an optional qualifier to a namespace name.
    pub fn resolve_schema_name(schema: Option<&str>) -> String {
        schema.unwrap_or(MAIN_SCHEMA).to_lowercase()
    }

    pub fn lookup_table(
        &self,
        schema: Option<&str>,
        name: &str,
    ) -> QuereusResult<Arc<TableSchema>> {
        let schema_name = Self::resolve_schema_name(schema);
        self.schemas
            .get(&schema_name)
            .and_then(|tables| tables.get(&name.to_lowercase()).map(|t| t.value().clone()))
            .ok_or_else(|| QuereusError::Resolve {
                kind: "table",
                name: format!("{schema_name}.{name}"),
            })
    }

    /// Register a table, assigning it a fresh catalog version.
    /// Fails with `Misuse` if the name is already taken.
    pub fn register_table(&self, mut schema: TableSchema) -> QuereusResult<Arc<TableSchema>> {
        let namespace = self
            .schemas
            .entry(schema.schema_name.to_lowercase())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone();
        let key = schema.name.to_lowercase();
        if namespace.contains_key(&key) {
            return Err(QuereusError::Misuse(format!(
                "table {}.{} already exists",
                schema.schema_name, schema.name
            )));
        }
        schema.version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let arc = Arc::new(schema);
        namespace.insert(key, Arc::clone(&arc));
        self.publish(SchemaChangeEvent {
            kind: SchemaChangeKind::CreateTable,
            schema_name: arc.schema_name.clone(),
            object_name: arc.name.clone(),
        });
        Ok(arc)
    }

    pub fn drop_table(&self, schema: Option<&str>, name: &str) -> QuereusResult<Arc<TableSchema>> {
        let schema_name = Self::resolve_schema_name(schema);
        let removed = self
            .schemas
            .get(&schema_name)
            .and_then(|tables| tables.remove(&name.to_lowercase()))
            .map(|(_, t)| t)
            .ok_or_else(|| QuereusError::Resolve {
                kind: "table",
                name: format!("{schema_name}.{name}"),
            })?;
        self.publish(SchemaChangeEvent {
            kind: SchemaChangeKind::DropTable,
            schema_name: removed.schema_name.clone(),
            object_name: removed.name.clone(),
        });
        Ok(removed)
    }

    /// Attach a secondary index to an existing table, bumping its version.
    pub fn add_index(
        &self,
        schema: Option<&str>,
        table: &str,
        index: IndexSchema,
    ) -> QuereusResult<Arc<TableSchema>> {
        let existing = self.lookup_table(schema, table)?;
        if existing.indexes.iter().any(|i| i.name.eq_ignore_ascii_case(&index.name)) {
            return Err(QuereusError::Misuse(format!(
                "index {} already exists on {}.{}",
                index.name, existing.schema_name, existing.name
            )));
        }
        let mut updated = (*existing).clone();
        updated.indexes.push(index);
        updated.version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let arc = Arc::new(updated);
        let namespace = self
            .schemas
            .get(&arc.schema_name.to_lowercase())
            .map(|e| e.value().clone())
            .ok_or_else(|| QuereusError::Internal("namespace vanished".into()))?;
        namespace.insert(arc.name.to_lowercase(), Arc::clone(&arc));
        self.publish(SchemaChangeEvent {
            kind: SchemaChangeKind::CreateIndex,
            schema_name: arc.schema_name.clone(),
            object_name: arc.name.clone(),
        });
        Ok(arc)
    }

    /// Current catalog version of a table, if it exists.
    pub fn table_version(&self, schema: Option<&str>, name: &str) -> Option<u64> {
        self.lookup_table(schema, name).ok().map(|t| t.version)
    }

    pub fn tables_in(&self, schema: &str) -> Vec<Arc<TableSchema>> {
        self.schemas
            .get(&schema.to_lowercase())
            .map(|tables| tables.iter().map(|e| e.value().clone()).collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, sink: SchemaChangeSink) {
        self.sinks.lock().push(sink);
    }

    fn publish(&self, event: SchemaChangeEvent) {
        let sinks = self.sinks.lock().clone();
        for sink in &sinks {
            sink(&event);
        }
    }
}

impl Default for SchemaManager {
    fn default() -> Self {
        Self::new()
    }
}
