//! Logical store naming and the provider contract.
//!
//! Each table owns four logical stores (data, one per index, stats) plus the
//! shared catalog. Stores are shared by key identity: two tables opened
//! against the same logical id observe the same underlying KV.

use std::sync::Arc;

use crate::error::QuereusResult;
use crate::storage::KvStore;

/// Identity of one logical store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreId {
    Data {
        schema_name: String,
        table_name: String,
    },
    Index {
        schema_name: String,
        table_name: String,
        index_name: String,
    },
    Stats {
        schema_name: String,
        table_name: String,
    },
    Catalog,
}

impl StoreId {
    pub fn data(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        StoreId::Data {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn index(
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        index_name: impl Into<String>,
    ) -> Self {
        StoreId::Index {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            index_name: index_name.into(),
        }
    }

    pub fn stats(schema_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        StoreId::Stats {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Whether this store belongs to the given table (data, index or stats).
    pub fn belongs_to_table(&self, schema: &str, table: &str) -> bool {
        match self {
            StoreId::Data {
                schema_name,
                table_name,
            }
            | StoreId::Index {
                schema_name,
                table_name,
                ..
            }
            | StoreId::Stats {
                schema_name,
                table_name,
            } => schema_name == schema && table_name == table,
            StoreId::Catalog => false,
        }
    }
}

/// Maps logical store ids onto live [`KvStore`] instances and owns their
/// lifecycle. Implementations guarantee identity: repeated requests for the
/// same id return the same underlying store.
pub trait StoreProvider: Send + Sync {
    fn store(&self, id: &StoreId) -> QuereusResult<Arc<dyn KvStore>>;

    /// Close one store and forget it. Missing ids are ignored.
    fn close_store(&self, id: &StoreId) -> QuereusResult<()>;

    /// Close every store this provider handed out.
    fn close_all(&self) -> QuereusResult<()>;

    /// Close and drop the data, index and stats stores of one table.
    fn delete_table_stores(&self, schema_name: &str, table_name: &str) -> QuereusResult<()>;
}
