//! # Quereus: Embeddable SQL over pluggable virtual tables
//!
//! Quereus is an embeddable SQL engine whose tables are always backed by
//! virtual-table modules. The bundled module implements a relational table
//! (primary key, secondary indexes, statistics) over any byte-ordered
//! key/value store through the [`storage::KvStore`] contract, with a
//! per-table transaction coordinator providing read-your-writes, savepoints
//! and at-commit event delivery.
//!
//! ## Quick start
//!
//! ```rust
//! use quereus_core::Database;
//!
//! # fn main() -> quereus_core::QuereusResult<()> {
//! let db = Database::new();
//! db.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", ())?;
//! db.exec("INSERT INTO users VALUES (1, 'Alice'), (2, 'Bob')", ())?;
//!
//! let rows = db.eval("SELECT name FROM users WHERE id = 2", ())?;
//! for row in rows {
//!     println!("{:?}", row?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Query pipeline
//!
//! ```text
//! SQL text → AST (sqlparser) → Plan tree → Optimized plan
//!         → Instruction DAG → Scheduler → virtual-table calls
//! ```
//!
//! ## Module structure
//! - [`engine`] — [`Database`], prepared statements, options
//! - [`sql`] — planner, optimizer, emission, scheduler
//! - [`vtab`] — virtual-table contract, access planning, the KV-backed table
//! - [`storage`] — the `KvStore` contract and the in-memory reference backend
//! - [`transaction`] — per-table transaction coordinator
//! - [`codec`] — order-preserving keys, row/stats serialization
//! - [`schema`] — catalog, functions, collations
//! - [`types`] — values and logical types

pub mod codec;
pub mod engine;
pub mod error;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod vtab;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use engine::{Database, Params, Statement};
pub use error::{ErrorCode, QuereusError, QuereusResult, format_error_chain};
pub use types::{Row, SqlValue};
