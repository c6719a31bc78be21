//! Runtime: expression evaluation, the instruction DAG produced by
//! emission, and the scheduler that executes it.

pub mod emit;
pub mod expr;
pub mod instruction;
pub mod scheduler;

pub use emit::{EmissionContext, SchemaDependency};
pub use expr::{RuntimeServices, eval_expr};
pub use instruction::{Instruction, RowSeq, Value};
pub use scheduler::{ExecContext, ExecTracer, Scheduler};
