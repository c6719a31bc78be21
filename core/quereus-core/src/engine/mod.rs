//! Database engine: connection/transaction management, statement
//! lifecycle, options.

pub mod database;
pub mod options;
pub mod statement;

#[cfg(test)]
mod tests;

pub use database::Database;
pub use options::{ColumnNullability, Options};
pub use statement::{Params, Statement};
