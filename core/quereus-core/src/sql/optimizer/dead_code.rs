//! Dead-node elimination and column pruning.
//!
//! Removes projections that are an identity mapping of their input,
//! collapses stacked projections when the outer one references only bare
//! columns of the inner, and drops limits that cannot constrain anything.

use crate::error::QuereusResult;
use crate::sql::planner::types::{PlanNode, ScalarExpr};

use super::{OptimizationRule, OptimizerContext};

pub struct DeadCodeRule;

impl OptimizationRule for DeadCodeRule {
    fn name(&self) -> &str {
        "DeadCode"
    }

    fn apply(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        self.prune(plan, ctx)
    }
}

impl DeadCodeRule {
    fn prune(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        match plan {
            PlanNode::Project {
                input,
                exprs,
                output,
            } => {
                let input = self.prune(*input, ctx)?;

                // Stacked projections: substitute the inner expressions
                // into the outer list.
                if let PlanNode::Project {
                    input: inner_input,
                    exprs: inner_exprs,
                    output: inner_output,
                } = input
                {
                    let substituted: Option<Vec<(ScalarExpr, Option<String>)>> = exprs
                        .iter()
                        .map(|(expr, alias)| {
                            substitute(expr, &inner_exprs).map(|e| (e, alias.clone()))
                        })
                        .collect();
                    if let Some(exprs) = substituted {
                        return self.prune(
                            PlanNode::Project {
                                input: inner_input,
                                exprs,
                                output,
                            },
                            ctx,
                        );
                    }
                    let rebuilt = PlanNode::Project {
                        input: inner_input,
                        exprs: inner_exprs,
                        output: inner_output,
                    };
                    return Ok(PlanNode::Project {
                        input: Box::new(rebuilt),
                        exprs,
                        output,
                    });
                }

                // Identity projection over the full input is a no-op.
                let input_schema = input.output_schema();
                let identity = exprs.len() == input_schema.arity()
                    && exprs.iter().enumerate().all(|(i, (expr, alias))| {
                        alias.is_none()
                            && matches!(expr, ScalarExpr::Column { index, .. } if *index == i)
                    });
                if identity {
                    return Ok(input);
                }

                Ok(PlanNode::Project {
                    input: Box::new(input),
                    exprs,
                    output,
                })
            }
            PlanNode::Limit {
                input,
                limit: None,
                offset: 0,
            } => self.prune(*input, ctx),
            PlanNode::Filter { input, predicate } => Ok(PlanNode::Filter {
                input: Box::new(self.prune(*input, ctx)?),
                predicate,
            }),
            PlanNode::Sort { input, order_by } => Ok(PlanNode::Sort {
                input: Box::new(self.prune(*input, ctx)?),
                order_by,
            }),
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => Ok(PlanNode::Limit {
                input: Box::new(self.prune(*input, ctx)?),
                limit,
                offset,
            }),
            PlanNode::Aggregate {
                input,
                group_exprs,
                aggregates,
                output,
            } => Ok(PlanNode::Aggregate {
                input: Box::new(self.prune(*input, ctx)?),
                group_exprs,
                aggregates,
                output,
            }),
            PlanNode::NestedLoopJoin {
                outer,
                inner,
                join_type,
                condition,
                output,
            } => Ok(PlanNode::NestedLoopJoin {
                outer: Box::new(self.prune(*outer, ctx)?),
                inner: Box::new(self.prune(*inner, ctx)?),
                join_type,
                condition,
                output,
            }),
            PlanNode::Insert {
                table,
                source,
                on_conflict,
                checks,
            } => Ok(PlanNode::Insert {
                table,
                source: Box::new(self.prune(*source, ctx)?),
                on_conflict,
                checks,
            }),
            PlanNode::Update {
                table,
                source,
                assignments,
                checks,
            } => Ok(PlanNode::Update {
                table,
                source: Box::new(self.prune(*source, ctx)?),
                assignments,
                checks,
            }),
            PlanNode::Delete { table, source } => Ok(PlanNode::Delete {
                table,
                source: Box::new(self.prune(*source, ctx)?),
            }),
            PlanNode::Block { statements } => Ok(PlanNode::Block {
                statements: statements
                    .into_iter()
                    .map(|s| self.prune(s, ctx))
                    .collect::<QuereusResult<_>>()?,
            }),
            other => Ok(other),
        }
    }
}

/// Replace column references with the inner projection's expressions.
/// Returns `None` when a referenced inner expression is not substitutable
/// (would duplicate a non-trivial computation).
fn substitute(
    expr: &ScalarExpr,
    inner: &[(ScalarExpr, Option<String>)],
) -> Option<ScalarExpr> {
    match expr {
        ScalarExpr::Column { index, .. } => {
            let (inner_expr, _) = inner.get(*index)?;
            match inner_expr {
                ScalarExpr::Column { .. } | ScalarExpr::Literal(_) | ScalarExpr::Param(_) => {
                    Some(inner_expr.clone())
                }
                _ => None,
            }
        }
        ScalarExpr::Literal(_) | ScalarExpr::Param(_) => Some(expr.clone()),
        ScalarExpr::Binary { op, left, right } => Some(ScalarExpr::Binary {
            op: *op,
            left: Box::new(substitute(left, inner)?),
            right: Box::new(substitute(right, inner)?),
        }),
        ScalarExpr::Unary { op, operand } => Some(ScalarExpr::Unary {
            op: *op,
            operand: Box::new(substitute(operand, inner)?),
        }),
        ScalarExpr::IsNull { operand, negated } => Some(ScalarExpr::IsNull {
            operand: Box::new(substitute(operand, inner)?),
            negated: *negated,
        }),
        ScalarExpr::FunctionCall { name, args } => Some(ScalarExpr::FunctionCall {
            name: name.clone(),
            args: args
                .iter()
                .map(|a| substitute(a, inner))
                .collect::<Option<_>>()?,
        }),
        _ => None,
    }
}
