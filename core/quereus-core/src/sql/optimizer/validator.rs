//! Structural plan validation, run after each optimizer pass when the
//! `validate_plan` option is set. A failure here is an engine bug, so every
//! violation maps to `Internal`.

use crate::error::{QuereusError, QuereusResult};
use crate::sql::planner::types::{PlanNode, ScalarExpr};

pub fn validate_plan(plan: &PlanNode) -> QuereusResult<()> {
    match plan {
        PlanNode::TableScan { table, output, .. } => {
            if output.arity() != table.columns.len() {
                return Err(violation(format!(
                    "scan of {} yields {} columns for a {}-column table",
                    table.name,
                    output.arity(),
                    table.columns.len()
                )));
            }
            Ok(())
        }
        PlanNode::Filter { input, predicate } => {
            validate_plan(input)?;
            check_scope(predicate, input.output_schema().arity(), "filter predicate")
        }
        PlanNode::Project {
            input,
            exprs,
            output,
        } => {
            validate_plan(input)?;
            if exprs.len() != output.arity() {
                return Err(violation(format!(
                    "projection emits {} expressions but declares {} columns",
                    exprs.len(),
                    output.arity()
                )));
            }
            let arity = input.output_schema().arity();
            for (expr, _) in exprs {
                check_scope(expr, arity, "projection expression")?;
            }
            Ok(())
        }
        PlanNode::Values { rows, output } => {
            for row in rows {
                if row.len() != output.arity() {
                    return Err(violation(format!(
                        "values row arity {} does not match declared {}",
                        row.len(),
                        output.arity()
                    )));
                }
            }
            Ok(())
        }
        PlanNode::SingleRow => Ok(()),
        PlanNode::NestedLoopJoin {
            outer,
            inner,
            condition,
            output,
            ..
        } => {
            validate_plan(outer)?;
            validate_plan(inner)?;
            let combined = outer.output_schema().arity() + inner.output_schema().arity();
            if output.arity() != combined {
                return Err(violation(format!(
                    "join declares {} columns for {} combined inputs",
                    output.arity(),
                    combined
                )));
            }
            if let Some(condition) = condition {
                check_scope(condition, combined, "join condition")?;
            }
            Ok(())
        }
        PlanNode::Aggregate {
            input,
            group_exprs,
            aggregates,
            output,
        } => {
            validate_plan(input)?;
            let arity = input.output_schema().arity();
            for expr in group_exprs {
                check_scope(expr, arity, "group expression")?;
            }
            for agg in aggregates {
                for arg in &agg.args {
                    check_scope(arg, arity, "aggregate argument")?;
                }
            }
            if output.arity() != group_exprs.len() + aggregates.len() {
                return Err(violation(format!(
                    "aggregate declares {} columns for {} groups + {} aggregates",
                    output.arity(),
                    group_exprs.len(),
                    aggregates.len()
                )));
            }
            Ok(())
        }
        PlanNode::Sort { input, order_by } => {
            validate_plan(input)?;
            let arity = input.output_schema().arity();
            for key in order_by {
                check_scope(&key.expr, arity, "sort key")?;
            }
            Ok(())
        }
        PlanNode::Limit { input, .. } => validate_plan(input),
        PlanNode::TvfCall { args, .. } => {
            for arg in args {
                check_scope(arg, 0, "table function argument")?;
            }
            Ok(())
        }
        PlanNode::Insert { table, source, .. } | PlanNode::Update { table, source, .. } => {
            validate_plan(source)?;
            if source.output_schema().arity() != table.columns.len() {
                return Err(violation(format!(
                    "DML source yields {} columns for table {} with {}",
                    source.output_schema().arity(),
                    table.name,
                    table.columns.len()
                )));
            }
            Ok(())
        }
        PlanNode::Delete { source, .. } => validate_plan(source),
        PlanNode::Block { statements } => {
            for statement in statements {
                validate_plan(statement)?;
            }
            Ok(())
        }
    }
}

fn check_scope(expr: &ScalarExpr, arity: usize, what: &str) -> QuereusResult<()> {
    let mut columns = Vec::new();
    expr.referenced_columns(&mut columns);
    for column in columns {
        if column >= arity {
            return Err(violation(format!(
                "{what} references column {column} outside the {arity}-column scope"
            )));
        }
    }
    Ok(())
}

fn violation(message: String) -> QuereusError {
    QuereusError::Internal(format!("plan validation: {message}"))
}
