//! The runtime instruction graph.
//!
//! Emission lowers each plan node to an [`Instruction`] whose `params` are
//! the child instructions; the scheduler linearizes the tree post-order and
//! feeds each instruction's output to its unique consumer. Values are moved,
//! never cloned; a row stream has exactly one consumer.

use crate::error::QuereusResult;
use crate::types::Row;

use super::scheduler::ExecContext;

/// Lazy, single-consumer row sequence.
pub type RowSeq = Box<dyn Iterator<Item = QuereusResult<Row>> + Send>;

/// A deferred value: forced by the scheduler before its consumer runs.
/// This is the suspension point that flips the scheduler into async mode.
pub struct Thunk(pub Box<dyn FnOnce(&mut ExecContext) -> QuereusResult<Value> + Send>);

impl std::fmt::Debug for Thunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Thunk(..)")
    }
}

/// A row stream plus the sentinel marking it as already trace-wrapped, so
/// the tracing wrapper is applied at most once.
pub struct RowStream {
    pub iter: RowSeq,
    pub traced: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RowStream(..)")
    }
}

/// Everything an instruction can produce or consume.
#[derive(Debug)]
pub enum Value {
    Unit,
    Scalar(crate::types::SqlValue),
    Row(Row),
    Rows(RowStream),
    Deferred(Thunk),
    Affected(u64),
}

impl Value {
    pub fn rows(iter: RowSeq) -> Self {
        Value::Rows(RowStream {
            iter,
            traced: false,
        })
    }

    /// Move the row stream out; anything else is an emission bug.
    pub fn into_rows(self) -> QuereusResult<RowSeq> {
        match self {
            Value::Rows(stream) => Ok(stream.iter),
            other => Err(crate::error::QuereusError::Internal(format!(
                "expected a row stream, got {other:?}"
            ))),
        }
    }

    /// Argument cardinality for metrics: scalars count one, streams count
    /// one (size unknown until drained).
    pub fn metric_size(&self) -> u64 {
        match self {
            Value::Unit => 0,
            _ => 1,
        }
    }
}

pub type RunFn = Box<dyn Fn(&mut ExecContext, Vec<Value>) -> QuereusResult<Value> + Send>;

/// One node of the runtime DAG.
pub struct Instruction {
    pub params: Vec<Instruction>,
    pub run: RunFn,
    /// Human-readable note for tracing and EXPLAIN-style output.
    pub note: String,
}

impl Instruction {
    pub fn leaf(note: impl Into<String>, run: RunFn) -> Self {
        Self {
            params: vec![],
            run,
            note: note.into(),
        }
    }

    pub fn with_params(note: impl Into<String>, params: Vec<Instruction>, run: RunFn) -> Self {
        Self {
            params,
            run,
            note: note.into(),
        }
    }
}
