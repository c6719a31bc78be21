//! Plan algebra and the AST → plan builder.

pub mod builder;
pub mod types;

pub use builder::{BuiltStatement, PlanBuilder, PlanningContext, TransactionMode, parse_sql};
pub use types::{
    AggregateExpr, BinaryOp, JoinType, OutputColumn, OutputSchema, PlanNode, ScalarExpr, SortKey,
    UnaryOp, infer_expr_type,
};
