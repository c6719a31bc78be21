//! The KV-backed table module.
//!
//! Owns the live-instance registry (at most one [`StoreTable`] per
//! `(schema, table)`), persists DDL and per-index metadata to the catalog
//! store, and rebuilds entries when an index is created over existing rows.
//!
//! Catalog layout:
//! - `ddl|<schema>|<table>` → UTF-8 `CREATE TABLE …` text
//! - `index|<schema>|<table>|<index>` → JSON `{name, columns}`

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{
    build_data_key, build_index_key, build_meta_key, build_meta_scan_bounds, data_scan_bounds,
    deserialize_row, prefix_successor,
};
use crate::error::{QuereusError, QuereusResult};
use crate::schema::{
    CollationRegistry, IndexSchema, SchemaChangeEvent, SchemaChangeKind, SchemaChangeSink,
    TableSchema,
};
use crate::storage::{IterateOptions, StoreId, StoreProvider};
use crate::vtab::module::{VirtualTable, VtabModule};

use super::StoreTable;

pub struct StoreModule {
    provider: Arc<dyn StoreProvider>,
    collations: Arc<CollationRegistry>,
    tables: DashMap<(String, String), Arc<StoreTable>>,
    sink: Mutex<Option<SchemaChangeSink>>,
}

impl StoreModule {
    pub fn new(provider: Arc<dyn StoreProvider>, collations: Arc<CollationRegistry>) -> Self {
        Self {
            provider,
            collations,
            tables: DashMap::new(),
            sink: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    fn table_key(schema: &TableSchema) -> (String, String) {
        (
            schema.schema_name.to_lowercase(),
            schema.name.to_lowercase(),
        )
    }

    fn emit(&self, kind: SchemaChangeKind, schema_name: &str, object_name: &str) {
        if let Some(sink) = self.sink.lock().clone() {
            sink(&SchemaChangeEvent {
                kind,
                schema_name: schema_name.to_string(),
                object_name: object_name.to_string(),
            });
        }
    }

    fn persist_ddl(&self, schema: &TableSchema) -> QuereusResult<()> {
        let catalog = self.provider.store(&StoreId::Catalog)?;
        let key = build_meta_key("ddl", &[&schema.schema_name, &schema.name]);
        catalog.put(&key, schema.render_ddl().as_bytes())?;
        for index in &schema.indexes {
            self.persist_index_meta(&schema.schema_name, &schema.name, index)?;
        }
        Ok(())
    }

    fn persist_index_meta(
        &self,
        schema_name: &str,
        table_name: &str,
        index: &IndexSchema,
    ) -> QuereusResult<()> {
        let catalog = self.provider.store(&StoreId::Catalog)?;
        let key = build_meta_key("index", &[schema_name, table_name, &index.name]);
        let payload = serde_json::to_vec(index)
            .map_err(|e| QuereusError::Internal(format!("index metadata encoding: {e}")))?;
        catalog.put(&key, &payload)?;
        Ok(())
    }

    fn remove_catalog_entries(&self, schema_name: &str, table_name: &str) -> QuereusResult<()> {
        let catalog = self.provider.store(&StoreId::Catalog)?;
        catalog.delete(&build_meta_key("ddl", &[schema_name, table_name]))?;
        let prefix = build_meta_key("index", &[schema_name, table_name]);
        let upper = prefix_successor(&prefix);
        let mut opts = IterateOptions::default();
        opts.gte = Some(prefix);
        if !upper.is_empty() {
            opts.lt = Some(upper);
        }
        let doomed: Vec<Vec<u8>> = catalog
            .iterate(opts)?
            .map(|entry| entry.map(|e| e.key))
            .collect::<QuereusResult<_>>()?;
        for key in doomed {
            catalog.delete(&key)?;
        }
        Ok(())
    }
}

impl VtabModule for StoreModule {
    fn create(&self, schema: Arc<TableSchema>) -> QuereusResult<Arc<dyn VirtualTable>> {
        let key = Self::table_key(&schema);
        if self.tables.contains_key(&key) {
            return Err(QuereusError::Misuse(format!(
                "table {}.{} already has a live instance",
                schema.schema_name, schema.name
            )));
        }
        self.persist_ddl(&schema)?;
        let table = StoreTable::new(
            Arc::clone(&schema),
            Arc::clone(&self.provider),
            Arc::clone(&self.collations),
        );
        table.ensure_stores()?;
        self.tables.insert(key, Arc::clone(&table));
        debug!(table = %schema.name, schema = %schema.schema_name, "created store table");
        self.emit(SchemaChangeKind::CreateTable, &schema.schema_name, &schema.name);
        Ok(table)
    }

    fn connect(&self, schema: Arc<TableSchema>) -> QuereusResult<Arc<dyn VirtualTable>> {
        let key = Self::table_key(&schema);
        let table = self
            .tables
            .entry(key)
            .or_insert_with(|| {
                StoreTable::new(
                    Arc::clone(&schema),
                    Arc::clone(&self.provider),
                    Arc::clone(&self.collations),
                )
            })
            .value()
            .clone();
        Ok(table)
    }

    fn destroy(&self, schema_name: &str, table_name: &str) -> QuereusResult<()> {
        let key = (schema_name.to_lowercase(), table_name.to_lowercase());
        if let Some((_, table)) = self.tables.remove(&key) {
            table.disconnect()?;
        }
        self.provider.delete_table_stores(schema_name, table_name)?;
        self.remove_catalog_entries(schema_name, table_name)?;
        debug!(table = table_name, schema = schema_name, "destroyed store table");
        self.emit(SchemaChangeKind::DropTable, schema_name, table_name);
        Ok(())
    }

    fn create_index(
        &self,
        schema_name: &str,
        table_name: &str,
        index: &IndexSchema,
    ) -> QuereusResult<()> {
        let key = (schema_name.to_lowercase(), table_name.to_lowercase());
        let table = self
            .tables
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                QuereusError::NotFound(format!("table {schema_name}.{table_name}"))
            })?;
        let schema = table.schema();

        self.persist_index_meta(schema_name, table_name, index)?;

        // Backfill: one entry per existing row.
        let data = self
            .provider
            .store(&StoreId::data(schema_name, table_name))?;
        let index_store =
            self.provider
                .store(&StoreId::index(schema_name, table_name, &index.name))?;
        let pk_opts = schema.pk_encoding_options();
        let index_opts = schema.index_encoding_options(index);
        let bounds = data_scan_bounds();
        let entries = data.iterate(IterateOptions::half_open(bounds.lower, bounds.upper))?;
        for entry in entries {
            let entry = entry?;
            let row = deserialize_row(&entry.value)?;
            let pk = schema.key_values(&schema.primary_key, &row);
            let data_key = build_data_key(&pk, &pk_opts)?;
            debug_assert_eq!(data_key, entry.key);
            let values = schema.key_values(&index.columns, &row);
            index_store.put(&build_index_key(&values, &index_opts, &pk, &pk_opts)?, &[])?;
        }

        // The live instance was built against the old schema; drop it so the
        // next connect sees the index.
        if let Some((_, table)) = self.tables.remove(&key) {
            table.disconnect()?;
        }
        self.emit(SchemaChangeKind::CreateIndex, schema_name, table_name);
        Ok(())
    }

    fn stored_ddl(&self) -> QuereusResult<Vec<String>> {
        let catalog = self.provider.store(&StoreId::Catalog)?;
        let bounds = build_meta_scan_bounds("ddl");
        let mut statements = Vec::new();
        for entry in catalog.iterate(IterateOptions::half_open(bounds.lower, bounds.upper))? {
            let entry = entry?;
            let text = String::from_utf8(entry.value)
                .map_err(|_| QuereusError::Internal("catalog DDL is not UTF-8".into()))?;
            statements.push(text);
        }
        Ok(statements)
    }

    fn set_change_sink(&self, sink: SchemaChangeSink) {
        *self.sink.lock() = Some(sink);
    }
}
