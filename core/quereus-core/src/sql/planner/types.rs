//! Plan algebra: relational nodes and the scalar sub-algebra.
//!
//! Every relational node carries a typed output schema (column logical
//! types, nullability and a set-semantics flag). Scalar expressions
//! reference input columns by flat index; a join concatenates outer and
//! inner rows, so inner columns are offset by the outer arity.

use std::sync::Arc;

use crate::schema::TableSchema;
use crate::types::{LogicalType, SqlValue};
use crate::vtab::access_plan::{BestAccessPlanResult, FilterConstraint};
use crate::vtab::module::ConflictPolicy;

/// One output column of a relational node.
#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub name: String,
    pub logical_type: LogicalType,
}

/// The typed shape of a node's output.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub columns: Vec<OutputColumn>,
    /// No duplicate rows (e.g. a full primary-key equality match).
    pub is_set: bool,
}

impl OutputSchema {
    pub fn new(columns: Vec<OutputColumn>) -> Self {
        Self {
            columns,
            is_set: false,
        }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn from_table(table: &TableSchema) -> Self {
        Self::new(
            table
                .columns
                .iter()
                .map(|c| OutputColumn {
                    name: c.name.clone(),
                    logical_type: c.logical_type.clone(),
                })
                .collect(),
        )
    }
}

/// Binary scalar operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Scalar expression tree.
#[derive(Debug, Clone)]
pub enum ScalarExpr {
    /// Reference into the node's flat input row.
    Column { index: usize, name: String },
    Literal(SqlValue),
    /// Named or positional statement parameter.
    Param(String),
    Binary {
        op: BinaryOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<ScalarExpr>,
    },
    FunctionCall {
        name: String,
        args: Vec<ScalarExpr>,
    },
    Case {
        operand: Option<Box<ScalarExpr>>,
        branches: Vec<(ScalarExpr, ScalarExpr)>,
        otherwise: Option<Box<ScalarExpr>>,
    },
    IsNull {
        operand: Box<ScalarExpr>,
        negated: bool,
    },
    InList {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<ScalarExpr>,
        subquery: Box<PlanNode>,
        negated: bool,
    },
    /// Scalar subquery: first column of the first row, NULL when empty.
    Subquery(Box<PlanNode>),
    Like {
        expr: Box<ScalarExpr>,
        pattern: Box<ScalarExpr>,
        negated: bool,
    },
}

impl ScalarExpr {
    pub fn column(index: usize, name: impl Into<String>) -> Self {
        ScalarExpr::Column {
            index,
            name: name.into(),
        }
    }

    /// Column indexes referenced anywhere in this expression.
    pub fn referenced_columns(&self, out: &mut Vec<usize>) {
        match self {
            ScalarExpr::Column { index, .. } => out.push(*index),
            ScalarExpr::Literal(_) | ScalarExpr::Param(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            ScalarExpr::Unary { operand, .. } => operand.referenced_columns(out),
            ScalarExpr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.referenced_columns(out);
                }
            }
            ScalarExpr::Case {
                operand,
                branches,
                otherwise,
            } => {
                if let Some(op) = operand {
                    op.referenced_columns(out);
                }
                for (when, then) in branches {
                    when.referenced_columns(out);
                    then.referenced_columns(out);
                }
                if let Some(e) = otherwise {
                    e.referenced_columns(out);
                }
            }
            ScalarExpr::IsNull { operand, .. } => operand.referenced_columns(out),
            ScalarExpr::InList { expr, list, .. } => {
                expr.referenced_columns(out);
                for item in list {
                    item.referenced_columns(out);
                }
            }
            ScalarExpr::InSubquery { expr, .. } => expr.referenced_columns(out),
            ScalarExpr::Subquery(_) => {}
            ScalarExpr::Like { expr, pattern, .. } => {
                expr.referenced_columns(out);
                pattern.referenced_columns(out);
            }
        }
    }

    /// A pure subtree has no column, parameter or subquery references and
    /// can be folded at plan time.
    pub fn is_pure(&self) -> bool {
        match self {
            ScalarExpr::Literal(_) => true,
            ScalarExpr::Column { .. } | ScalarExpr::Param(_) => false,
            ScalarExpr::Binary { left, right, .. } => left.is_pure() && right.is_pure(),
            ScalarExpr::Unary { operand, .. } => operand.is_pure(),
            // Function purity is unknown in general; fold only operators.
            ScalarExpr::FunctionCall { .. } => false,
            ScalarExpr::Case { .. } => false,
            ScalarExpr::IsNull { operand, .. } => operand.is_pure(),
            ScalarExpr::InList { expr, list, .. } => {
                expr.is_pure() && list.iter().all(|e| e.is_pure())
            }
            ScalarExpr::InSubquery { .. } | ScalarExpr::Subquery(_) => false,
            ScalarExpr::Like { expr, pattern, .. } => expr.is_pure() && pattern.is_pure(),
        }
    }

    /// Remap column references through `mapping[old] = new`.
    pub fn remap_columns(&mut self, mapping: &[usize]) {
        match self {
            ScalarExpr::Column { index, .. } => {
                if let Some(new) = mapping.get(*index) {
                    *index = *new;
                }
            }
            ScalarExpr::Literal(_) | ScalarExpr::Param(_) => {}
            ScalarExpr::Binary { left, right, .. } => {
                left.remap_columns(mapping);
                right.remap_columns(mapping);
            }
            ScalarExpr::Unary { operand, .. } => operand.remap_columns(mapping),
            ScalarExpr::FunctionCall { args, .. } => {
                for arg in args {
                    arg.remap_columns(mapping);
                }
            }
            ScalarExpr::Case {
                operand,
                branches,
                otherwise,
            } => {
                if let Some(op) = operand {
                    op.remap_columns(mapping);
                }
                for (when, then) in branches {
                    when.remap_columns(mapping);
                    then.remap_columns(mapping);
                }
                if let Some(e) = otherwise {
                    e.remap_columns(mapping);
                }
            }
            ScalarExpr::IsNull { operand, .. } => operand.remap_columns(mapping),
            ScalarExpr::InList { expr, list, .. } => {
                expr.remap_columns(mapping);
                for item in list {
                    item.remap_columns(mapping);
                }
            }
            ScalarExpr::InSubquery { expr, .. } => expr.remap_columns(mapping),
            ScalarExpr::Subquery(_) => {}
            ScalarExpr::Like { expr, pattern, .. } => {
                expr.remap_columns(mapping);
                pattern.remap_columns(mapping);
            }
        }
    }
}

/// One aggregate in an Aggregate node.
#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub function: String,
    /// Empty for `count(*)`.
    pub args: Vec<ScalarExpr>,
    pub alias: Option<String>,
}

/// One ORDER BY key.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: ScalarExpr,
    pub desc: bool,
    pub collation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

/// Relational plan node.
#[derive(Debug, Clone)]
pub enum PlanNode {
    TableScan {
        table: Arc<TableSchema>,
        /// Filled in by the optimizer's access-path rule.
        access: Option<BestAccessPlanResult>,
        /// Constraints pushed down to the table layer.
        pushed: Vec<FilterConstraint>,
        output: OutputSchema,
    },
    Filter {
        input: Box<PlanNode>,
        predicate: ScalarExpr,
    },
    Project {
        input: Box<PlanNode>,
        exprs: Vec<(ScalarExpr, Option<String>)>,
        output: OutputSchema,
    },
    Values {
        rows: Vec<Vec<ScalarExpr>>,
        output: OutputSchema,
    },
    /// Exactly one empty row; the FROM-less SELECT source.
    SingleRow,
    NestedLoopJoin {
        outer: Box<PlanNode>,
        inner: Box<PlanNode>,
        join_type: JoinType,
        condition: Option<ScalarExpr>,
        output: OutputSchema,
    },
    Aggregate {
        input: Box<PlanNode>,
        group_exprs: Vec<ScalarExpr>,
        aggregates: Vec<AggregateExpr>,
        output: OutputSchema,
    },
    Sort {
        input: Box<PlanNode>,
        order_by: Vec<SortKey>,
    },
    Limit {
        input: Box<PlanNode>,
        limit: Option<u64>,
        offset: u64,
    },
    TvfCall {
        name: String,
        args: Vec<ScalarExpr>,
        output: OutputSchema,
    },
    Insert {
        table: Arc<TableSchema>,
        /// Produces full rows in table column order.
        source: Box<PlanNode>,
        on_conflict: ConflictPolicy,
        /// Parsed CHECK constraints, evaluated per row.
        checks: Vec<ScalarExpr>,
    },
    Update {
        table: Arc<TableSchema>,
        /// Scan producing the rows to update, in table column order.
        source: Box<PlanNode>,
        /// (column index, new value expression) pairs.
        assignments: Vec<(usize, ScalarExpr)>,
        checks: Vec<ScalarExpr>,
    },
    Delete {
        table: Arc<TableSchema>,
        source: Box<PlanNode>,
    },
    /// Sequential statements; the block's value is the last statement's.
    Block {
        statements: Vec<PlanNode>,
    },
}

impl PlanNode {
    /// The node's typed output shape. Pass-through nodes defer to their
    /// input; DML nodes expose a single affected-count column.
    pub fn output_schema(&self) -> OutputSchema {
        match self {
            PlanNode::TableScan { output, .. }
            | PlanNode::Project { output, .. }
            | PlanNode::Values { output, .. }
            | PlanNode::NestedLoopJoin { output, .. }
            | PlanNode::Aggregate { output, .. }
            | PlanNode::TvfCall { output, .. } => output.clone(),
            PlanNode::Filter { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => input.output_schema(),
            PlanNode::SingleRow => OutputSchema::new(vec![]),
            PlanNode::Insert { .. } | PlanNode::Update { .. } | PlanNode::Delete { .. } => {
                OutputSchema::new(vec![OutputColumn {
                    name: "affected".into(),
                    logical_type: LogicalType::integer(),
                }])
            }
            PlanNode::Block { statements } => statements
                .last()
                .map(|s| s.output_schema())
                .unwrap_or_else(|| OutputSchema::new(vec![])),
        }
    }

    /// One-line summary used by EXPLAIN output and tracing notes.
    pub fn describe(&self) -> String {
        match self {
            PlanNode::TableScan { table, access, .. } => match access {
                Some(plan) => format!("scan {} [{}]", table.name, plan.explains),
                None => format!("scan {}", table.name),
            },
            PlanNode::Filter { .. } => "filter".into(),
            PlanNode::Project { exprs, .. } => format!("project ({} cols)", exprs.len()),
            PlanNode::Values { rows, .. } => format!("values ({} rows)", rows.len()),
            PlanNode::SingleRow => "single row".into(),
            PlanNode::NestedLoopJoin { join_type, .. } => {
                format!("nested loop join ({join_type:?})")
            }
            PlanNode::Aggregate { group_exprs, aggregates, .. } => format!(
                "aggregate ({} groups, {} aggs)",
                group_exprs.len(),
                aggregates.len()
            ),
            PlanNode::Sort { order_by, .. } => format!("sort ({} keys)", order_by.len()),
            PlanNode::Limit { limit, offset, .. } => {
                format!("limit {:?} offset {}", limit, offset)
            }
            PlanNode::TvfCall { name, .. } => format!("table function {name}"),
            PlanNode::Insert { table, .. } => format!("insert into {}", table.name),
            PlanNode::Update { table, .. } => format!("update {}", table.name),
            PlanNode::Delete { table, .. } => format!("delete from {}", table.name),
            PlanNode::Block { statements } => format!("block ({} stmts)", statements.len()),
        }
    }

    /// Render the tree, one node per line, children indented.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&self.describe());
        out.push('\n');
        match self {
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Aggregate { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => input.explain_into(out, depth + 1),
            PlanNode::NestedLoopJoin { outer, inner, .. } => {
                outer.explain_into(out, depth + 1);
                inner.explain_into(out, depth + 1);
            }
            PlanNode::Insert { source, .. }
            | PlanNode::Update { source, .. }
            | PlanNode::Delete { source, .. } => source.explain_into(out, depth + 1),
            PlanNode::Block { statements } => {
                for statement in statements {
                    statement.explain_into(out, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Infer the result type of a scalar expression against an input schema.
pub fn infer_expr_type(expr: &ScalarExpr, input: &OutputSchema) -> LogicalType {
    match expr {
        ScalarExpr::Column { index, .. } => input
            .columns
            .get(*index)
            .map(|c| c.logical_type.clone())
            .unwrap_or_else(|| LogicalType::any().nullable()),
        ScalarExpr::Literal(value) => match value {
            SqlValue::Null => LogicalType::any().nullable(),
            SqlValue::Integer(_) | SqlValue::BigInt(_) => LogicalType::integer(),
            SqlValue::Real(_) => LogicalType::real(),
            SqlValue::Text(_) => LogicalType::text(),
            SqlValue::Blob(_) => LogicalType::blob(),
        },
        ScalarExpr::Param(_) => LogicalType::any().nullable(),
        ScalarExpr::Binary { op, left, right } => {
            if op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or) {
                LogicalType::boolean().nullable()
            } else if matches!(op, BinaryOp::Concat) {
                LogicalType::text().nullable()
            } else {
                let args = [infer_expr_type(left, input), infer_expr_type(right, input)];
                crate::types::logical::infer_result_type(&args)
            }
        }
        ScalarExpr::Unary { op, operand } => match op {
            UnaryOp::Neg => infer_expr_type(operand, input),
            UnaryOp::Not => LogicalType::boolean().nullable(),
        },
        ScalarExpr::FunctionCall { args, .. } => {
            let arg_types: Vec<LogicalType> =
                args.iter().map(|a| infer_expr_type(a, input)).collect();
            crate::types::logical::infer_result_type(&arg_types)
        }
        ScalarExpr::Case { branches, otherwise, .. } => {
            let mut types: Vec<LogicalType> = branches
                .iter()
                .map(|(_, then)| infer_expr_type(then, input))
                .collect();
            if let Some(e) = otherwise {
                types.push(infer_expr_type(e, input));
            }
            crate::types::logical::infer_result_type(&types)
        }
        ScalarExpr::IsNull { .. }
        | ScalarExpr::InList { .. }
        | ScalarExpr::InSubquery { .. }
        | ScalarExpr::Like { .. } => LogicalType::boolean().nullable(),
        ScalarExpr::Subquery(plan) => plan
            .output_schema()
            .columns
            .first()
            .map(|c| c.logical_type.clone().nullable())
            .unwrap_or_else(|| LogicalType::any().nullable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeClass;

    #[test]
    fn comparison_types_are_boolean() {
        let schema = OutputSchema::new(vec![OutputColumn {
            name: "x".into(),
            logical_type: LogicalType::integer(),
        }]);
        let expr = ScalarExpr::Binary {
            op: BinaryOp::Lt,
            left: Box::new(ScalarExpr::column(0, "x")),
            right: Box::new(ScalarExpr::Literal(SqlValue::Integer(5))),
        };
        assert_eq!(infer_expr_type(&expr, &schema).class, TypeClass::Boolean);
    }

    #[test]
    fn mixed_arithmetic_promotes_to_real() {
        let schema = OutputSchema::new(vec![OutputColumn {
            name: "x".into(),
            logical_type: LogicalType::integer(),
        }]);
        let expr = ScalarExpr::Binary {
            op: BinaryOp::Add,
            left: Box::new(ScalarExpr::column(0, "x")),
            right: Box::new(ScalarExpr::Literal(SqlValue::Real(1.5))),
        };
        assert_eq!(infer_expr_type(&expr, &schema).class, TypeClass::Real);
    }

    #[test]
    fn referenced_columns_walks_the_tree() {
        let expr = ScalarExpr::Binary {
            op: BinaryOp::And,
            left: Box::new(ScalarExpr::IsNull {
                operand: Box::new(ScalarExpr::column(2, "a")),
                negated: false,
            }),
            right: Box::new(ScalarExpr::column(0, "b")),
        };
        let mut cols = Vec::new();
        expr.referenced_columns(&mut cols);
        assert_eq!(cols, vec![2, 0]);
    }

    #[test]
    fn purity_excludes_columns_and_params() {
        let pure = ScalarExpr::Binary {
            op: BinaryOp::Add,
            left: Box::new(ScalarExpr::Literal(SqlValue::Integer(1))),
            right: Box::new(ScalarExpr::Literal(SqlValue::Integer(2))),
        };
        assert!(pure.is_pure());
        assert!(!ScalarExpr::Param("p".into()).is_pure());
        assert!(!ScalarExpr::column(0, "x").is_pure());
    }

    #[test]
    fn explain_renders_tree() {
        let plan = PlanNode::Limit {
            input: Box::new(PlanNode::SingleRow),
            limit: Some(1),
            offset: 0,
        };
        let text = plan.explain();
        assert!(text.starts_with("limit"));
        assert!(text.contains("\n  single row"));
    }
}
