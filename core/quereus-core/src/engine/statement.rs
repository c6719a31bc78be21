//! Prepared statements.
//!
//! `prepare` is cheap: parsing and planning are deferred to the first
//! step. The compiled plan retains the table schema objects it was planned
//! against, so a schema change between preparation and execution surfaces
//! as an error at execution start rather than as silently stale results.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{QuereusError, QuereusResult};
use crate::sql::planner::builder::{BuiltStatement, PlanBuilder, parse_sql};
use crate::types::{Row, SqlValue};
use crate::vtab::module::RowIter;

use super::database::{Database, drain_value};

/// Bound statement parameters, keyed by name. Positional `?` parameters
/// bind as `?1`, `?2`, … in order.
#[derive(Debug, Clone, Default)]
pub struct Params(pub HashMap<String, SqlValue>);

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::default()
    }
}

impl From<Vec<SqlValue>> for Params {
    fn from(values: Vec<SqlValue>) -> Self {
        Params(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (format!("?{}", i + 1), v))
                .collect(),
        )
    }
}

impl From<HashMap<String, SqlValue>> for Params {
    fn from(map: HashMap<String, SqlValue>) -> Self {
        Params(map)
    }
}

struct Compiled {
    built: BuiltStatement,
    cache_key: String,
}

pub struct Statement {
    db: Arc<Database>,
    sql: String,
    compiled: Mutex<Option<Arc<Compiled>>>,
    finalized: AtomicBool,
}

impl Statement {
    pub(crate) fn new(db: Arc<Database>, sql: &str) -> Self {
        Self {
            db,
            sql: sql.to_string(),
            compiled: Mutex::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn compile(&self) -> QuereusResult<Arc<Compiled>> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(QuereusError::Misuse("statement is finalized".into()));
        }
        let mut guard = self.compiled.lock();
        if let Some(compiled) = guard.as_ref() {
            return Ok(Arc::clone(compiled));
        }
        let statements = parse_sql(&self.sql)?;
        let [statement] = statements.as_slice() else {
            return Err(QuereusError::Misuse(
                "prepare expects exactly one statement".into(),
            ));
        };
        let planning = self.db.planning_context();
        let built = PlanBuilder::new(&planning).build_statement(statement)?;
        let compiled = Arc::new(Compiled {
            built,
            cache_key: statement.to_string(),
        });
        *guard = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Run and return rows lazily. Non-query statements yield no rows.
    pub fn query(&self, params: impl Into<Params>) -> QuereusResult<RowIter> {
        let compiled = self.compile()?;
        let value = self
            .db
            .run_built(&compiled.built, Some(&compiled.cache_key), &params.into())?;
        match value {
            crate::sql::executor::instruction::Value::Rows(stream) => Ok(stream.iter),
            other => {
                drain_value(other)?;
                Ok(Box::new(std::iter::empty()))
            }
        }
    }

    /// Run to completion and return the affected-row count.
    pub fn execute(&self, params: impl Into<Params>) -> QuereusResult<u64> {
        let compiled = self.compile()?;
        let value = self
            .db
            .run_built(&compiled.built, Some(&compiled.cache_key), &params.into())?;
        drain_value(value)
    }

    /// Convenience: run and materialize every row.
    pub fn query_all(&self, params: impl Into<Params>) -> QuereusResult<Vec<Row>> {
        self.query(params)?.collect()
    }

    /// The optimized plan rendered as an indented tree.
    pub fn explain(&self) -> QuereusResult<String> {
        let compiled = self.compile()?;
        match &compiled.built {
            BuiltStatement::Plan(plan) => {
                let optimized = self.db.explain_plan(plan)?;
                Ok(optimized)
            }
            other => Ok(format!("{}\n", describe_control(other))),
        }
    }

    /// Release the compiled plan and mark the statement unusable.
    /// Idempotent.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
        self.compiled.lock().take();
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn describe_control(statement: &BuiltStatement) -> &'static str {
    match statement {
        BuiltStatement::Plan(_) => "plan",
        BuiltStatement::CreateTable { .. } => "create table",
        BuiltStatement::CreateIndex { .. } => "create index",
        BuiltStatement::DropTable { .. } => "drop table",
        BuiltStatement::Begin(_) => "begin",
        BuiltStatement::Commit => "commit",
        BuiltStatement::Rollback => "rollback",
        BuiltStatement::RollbackToSavepoint(_) => "rollback to savepoint",
        BuiltStatement::Savepoint(_) => "savepoint",
        BuiltStatement::ReleaseSavepoint(_) => "release savepoint",
    }
}
