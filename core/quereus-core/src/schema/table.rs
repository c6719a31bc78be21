//! Table and index schema objects.
//!
//! A [`TableSchema`] is owned by the schema catalog for its lifetime; tables
//! and plans hold `Arc` clones. The `version` field is assigned by the
//! catalog on registration and changes whenever the object is re-created,
//! which is how captured plan references detect staleness.

use serde::{Deserialize, Serialize};

use crate::codec::KeyEncodingOptions;
use crate::types::{LogicalType, SortDirection, TextCollation};

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub logical_type: LogicalType,
}

/// One component of a primary key or secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyColumn {
    /// Index into [`TableSchema::columns`].
    #[serde(rename = "index")]
    pub column_index: usize,
    #[serde(default, skip_serializing_if = "is_asc")]
    pub direction: SortDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collation: Option<String>,
}

fn is_asc(d: &SortDirection) -> bool {
    !d.is_desc()
}

impl KeyColumn {
    pub fn asc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: SortDirection::Asc,
            collation: None,
        }
    }

    pub fn desc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: SortDirection::Desc,
            collation: None,
        }
    }

    pub fn with_collation(mut self, name: impl Into<String>) -> Self {
        self.collation = Some(name.into());
        self
    }
}

/// A secondary index definition. Serialized as-is into the catalog store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<KeyColumn>,
}

/// A table definition.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub schema_name: String,
    pub columns: Vec<ColumnSchema>,
    /// Ordered primary-key components. Never empty for a store-backed table.
    pub primary_key: Vec<KeyColumn>,
    pub indexes: Vec<IndexSchema>,
    /// CHECK constraint expressions, stored as SQL text and parsed at
    /// emission time.
    pub checks: Vec<String>,
    pub is_view: bool,
    pub module_name: String,
    pub module_args: serde_json::Value,
    /// Cached cardinality estimate, refreshed from the stats store.
    pub estimated_rows: u64,
    /// Catalog-assigned version; changes when the object is re-created.
    pub version: u64,
    /// Original DDL text when the table came from SQL.
    pub sql: Option<String>,
}

impl TableSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Collation name effective for a key component: the component's own,
    /// else its column's, else BINARY.
    pub fn key_collation_name(&self, key: &KeyColumn) -> String {
        key.collation
            .clone()
            .or_else(|| {
                self.columns
                    .get(key.column_index)
                    .and_then(|c| c.logical_type.collation.clone())
            })
            .unwrap_or_else(|| "BINARY".to_string())
    }

    /// Encoding options for the primary key composite. Custom collations
    /// encode binary and rely on the residual comparator.
    pub fn pk_encoding_options(&self) -> KeyEncodingOptions {
        self.key_encoding_options(&self.primary_key)
    }

    pub fn index_encoding_options(&self, index: &IndexSchema) -> KeyEncodingOptions {
        self.key_encoding_options(&index.columns)
    }

    fn key_encoding_options(&self, keys: &[KeyColumn]) -> KeyEncodingOptions {
        KeyEncodingOptions {
            collations: keys
                .iter()
                .map(|k| {
                    TextCollation::parse(&self.key_collation_name(k)).unwrap_or_default()
                })
                .collect(),
            directions: keys.iter().map(|k| k.direction).collect(),
            strict: false,
        }
    }

    /// Values of the given key components extracted from a full row.
    pub fn key_values(&self, keys: &[KeyColumn], row: &[crate::types::SqlValue]) -> Vec<crate::types::SqlValue> {
        keys.iter()
            .map(|k| row.get(k.column_index).cloned().unwrap_or(crate::types::SqlValue::Null))
            .collect()
    }

    /// Canonical `CREATE TABLE` text for catalog persistence when the
    /// original SQL is unavailable.
    pub fn render_ddl(&self) -> String {
        if let Some(sql) = &self.sql {
            return sql.clone();
        }
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut s = format!("{} {}", c.name, c.logical_type.class.name());
                if !c.logical_type.nullable {
                    s.push_str(" NOT NULL");
                }
                s
            })
            .collect();
        let pk: Vec<String> = self
            .primary_key
            .iter()
            .filter_map(|k| self.columns.get(k.column_index))
            .map(|c| c.name.clone())
            .collect();
        format!(
            "CREATE TABLE {}.{} ({}, PRIMARY KEY ({}))",
            self.schema_name,
            self.name,
            cols.join(", "),
            pk.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SqlValue, TypeClass};

    fn users_schema() -> TableSchema {
        TableSchema {
            name: "users".into(),
            schema_name: "main".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    logical_type: LogicalType::integer(),
                },
                ColumnSchema {
                    name: "name".into(),
                    logical_type: LogicalType::text().nullable().with_collation("NOCASE"),
                },
            ],
            primary_key: vec![KeyColumn::asc(0)],
            indexes: vec![IndexSchema {
                name: "ix_name".into(),
                columns: vec![KeyColumn::asc(1)],
            }],
            checks: vec![],
            is_view: false,
            module_name: "memory".into(),
            module_args: serde_json::Value::Null,
            estimated_rows: 0,
            version: 1,
            sql: None,
        }
    }

    #[test]
    fn column_lookup_is_case_insensitive() {
        let schema = users_schema();
        assert_eq!(schema.column_index("NAME"), Some(1));
        assert_eq!(schema.column_index("missing"), None);
    }

    #[test]
    fn key_collation_falls_back_to_column_then_binary() {
        let schema = users_schema();
        assert_eq!(schema.key_collation_name(&schema.primary_key[0]), "BINARY");
        assert_eq!(
            schema.key_collation_name(&schema.indexes[0].columns[0]),
            "NOCASE"
        );
        let opts = schema.index_encoding_options(&schema.indexes[0]);
        assert_eq!(opts.collations, vec![TextCollation::NoCase]);
    }

    #[test]
    fn key_values_extracts_in_key_order() {
        let schema = users_schema();
        let row = vec![SqlValue::Integer(7), SqlValue::Text("bob".into())];
        assert_eq!(
            schema.key_values(&schema.primary_key, &row),
            vec![SqlValue::Integer(7)]
        );
    }

    #[test]
    fn rendered_ddl_mentions_pk() {
        let schema = users_schema();
        let ddl = schema.render_ddl();
        assert!(ddl.contains("CREATE TABLE main.users"));
        assert!(ddl.contains("PRIMARY KEY (id)"));
        assert_eq!(TypeClass::from_declared("INTEGER"), TypeClass::Integer);
    }

    #[test]
    fn index_schema_serializes_for_catalog() {
        let schema = users_schema();
        let json = serde_json::to_string(&schema.indexes[0]).unwrap();
        let back: IndexSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema.indexes[0]);
    }
}
