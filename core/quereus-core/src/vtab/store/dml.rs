//! Row mutations for [`StoreTable`].
//!
//! Every step, from the data key to each secondary index entry to the stats delta,
//! routes through the transaction coordinator when a transaction is open,
//! so a rollback leaves data and indexes consistent.

use crate::codec::{build_data_key, build_index_key, deserialize_row, serialize_row};
use crate::error::{QuereusError, QuereusResult};
use crate::transaction::{ChangeEvent, ChangeKind};
use crate::types::{Row, SqlValue};
use crate::vtab::module::{ConflictPolicy, DmlOp, UpdateArgs};

use super::{StoreTable, TableStores, internal};
use std::sync::Arc;

impl StoreTable {
    pub(crate) fn apply_update(&self, args: UpdateArgs) -> QuereusResult<Option<Row>> {
        let stores = self.ensure_stores()?;
        match args.op {
            DmlOp::Insert => {
                let values = args.values.ok_or_else(|| {
                    QuereusError::Misuse("insert requires row values".into())
                })?;
                self.insert_row(&stores, values, args.on_conflict).map(Some)
            }
            DmlOp::Update => {
                let values = args.values.ok_or_else(|| {
                    QuereusError::Misuse("update requires row values".into())
                })?;
                let old_key = args.old_key_values.ok_or_else(|| {
                    QuereusError::Misuse("update requires the old key values".into())
                })?;
                self.update_row(&stores, old_key, values)
            }
            DmlOp::Delete => {
                let old_key = args.old_key_values.ok_or_else(|| {
                    QuereusError::Misuse("delete requires the old key values".into())
                })?;
                self.delete_row(&stores, old_key)?;
                Ok(None)
            }
        }
    }

    fn insert_row(
        &self,
        stores: &Arc<TableStores>,
        row: Row,
        on_conflict: ConflictPolicy,
    ) -> QuereusResult<Row> {
        self.check_not_null(&row)?;
        let pk_opts = self.schema.pk_encoding_options();
        let pk = self.schema.key_values(&self.schema.primary_key, &row);
        let data_key = build_data_key(&pk, &pk_opts)?;

        let existing = self.read_kv(&stores.data, &data_key)?;
        let replaced = match existing {
            Some(bytes) => {
                if on_conflict != ConflictPolicy::Replace {
                    return Err(QuereusError::Constraint(format!(
                        "UNIQUE constraint failed: {} primary key",
                        self.schema.name
                    )));
                }
                Some(deserialize_row(&bytes)?)
            }
            None => None,
        };

        self.write_kv(&stores.data, &data_key, &serialize_row(&row))?;

        for (index, store) in &stores.indexes {
            let index_opts = self.schema.index_encoding_options(index);
            if let Some(old_row) = &replaced {
                let old_values = self.schema.key_values(&index.columns, old_row);
                let old_key = build_index_key(&old_values, &index_opts, &pk, &pk_opts)?;
                self.delete_kv(store, &old_key)?;
            }
            let values = self.schema.key_values(&index.columns, &row);
            let key = build_index_key(&values, &index_opts, &pk, &pk_opts)?;
            self.write_kv(store, &key, &[])?;
        }

        if replaced.is_none() {
            self.note_stats_mutation(1);
        }

        self.coordinator().queue_event(ChangeEvent {
            kind: ChangeKind::Insert,
            table_name: self.schema.name.clone(),
            before: replaced,
            after: Some(row.clone()),
        });
        Ok(row)
    }

    fn update_row(
        &self,
        stores: &Arc<TableStores>,
        old_key_values: Vec<SqlValue>,
        row: Row,
    ) -> QuereusResult<Option<Row>> {
        self.check_not_null(&row)?;
        let pk_opts = self.schema.pk_encoding_options();
        let old_data_key = build_data_key(&old_key_values, &pk_opts)?;
        let Some(old_bytes) = self.read_kv(&stores.data, &old_data_key)? else {
            return Ok(None);
        };
        let old_row = deserialize_row(&old_bytes)?;

        let new_pk = self.schema.key_values(&self.schema.primary_key, &row);
        let new_data_key = build_data_key(&new_pk, &pk_opts)?;
        if new_data_key != old_data_key {
            self.delete_kv(&stores.data, &old_data_key)?;
        }
        self.write_kv(&stores.data, &new_data_key, &serialize_row(&row))?;

        for (index, store) in &stores.indexes {
            let index_opts = self.schema.index_encoding_options(index);
            let old_values = self.schema.key_values(&index.columns, &old_row);
            let old_key = build_index_key(&old_values, &index_opts, &old_key_values, &pk_opts)?;
            self.delete_kv(store, &old_key)?;
            let new_values = self.schema.key_values(&index.columns, &row);
            let new_key = build_index_key(&new_values, &index_opts, &new_pk, &pk_opts)?;
            self.write_kv(store, &new_key, &[])?;
        }

        self.coordinator().queue_event(ChangeEvent {
            kind: ChangeKind::Update,
            table_name: self.schema.name.clone(),
            before: Some(old_row),
            after: Some(row.clone()),
        });
        Ok(Some(row))
    }

    fn delete_row(
        &self,
        stores: &Arc<TableStores>,
        old_key_values: Vec<SqlValue>,
    ) -> QuereusResult<()> {
        let pk_opts = self.schema.pk_encoding_options();
        let data_key = build_data_key(&old_key_values, &pk_opts)?;
        let Some(old_bytes) = self.read_kv(&stores.data, &data_key)? else {
            return Ok(());
        };
        let old_row = deserialize_row(&old_bytes)?;

        self.delete_kv(&stores.data, &data_key)?;
        for (index, store) in &stores.indexes {
            let index_opts = self.schema.index_encoding_options(index);
            let values = self.schema.key_values(&index.columns, &old_row);
            let key = build_index_key(&values, &index_opts, &old_key_values, &pk_opts)?;
            self.delete_kv(store, &key)?;
        }

        self.note_stats_mutation(-1);
        self.coordinator().queue_event(ChangeEvent {
            kind: ChangeKind::Delete,
            table_name: self.schema.name.clone(),
            before: Some(old_row),
            after: None,
        });
        Ok(())
    }

    fn check_not_null(&self, row: &Row) -> QuereusResult<()> {
        if row.len() != self.schema.columns.len() {
            return Err(internal(format!(
                "row arity {} does not match table {} ({} columns)",
                row.len(),
                self.schema.name,
                self.schema.columns.len()
            )));
        }
        for (column, value) in self.schema.columns.iter().zip(row) {
            if !column.logical_type.nullable && value.is_null() {
                return Err(QuereusError::Constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    self.schema.name, column.name
                )));
            }
        }
        Ok(())
    }
}
