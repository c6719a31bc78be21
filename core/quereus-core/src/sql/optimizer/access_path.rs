//! Access-path selection.
//!
//! For each Filter-over-TableScan pair, extract the conjuncts of the form
//! `column op literal`, offer them to the table module together with any
//! ordering requirement visible above the scan, validate the module's
//! answer, record it on the scan, and drop the conjuncts the module
//! committed to enforce. A sort whose keys the access plan provides is
//! removed.

use crate::error::QuereusResult;
use crate::sql::planner::types::{BinaryOp, PlanNode, ScalarExpr, SortKey};
use crate::vtab::access_plan::{
    BestAccessPlanRequest, ConstraintOp, FilterConstraint, OrderingSpec, validate_access_plan,
};

use super::predicate_pushdown::{join_conjuncts, split_conjuncts};
use super::{OptimizationRule, OptimizerContext};

pub struct AccessPathRule;

impl OptimizationRule for AccessPathRule {
    fn name(&self) -> &str {
        "AccessPath"
    }

    fn apply(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        self.rewrite(plan, ctx, None)
    }
}

impl AccessPathRule {
    /// `ordering` carries a Sort requirement downward while the shape is
    /// Sort → (Filter) → TableScan.
    fn rewrite(
        &self,
        plan: PlanNode,
        ctx: &OptimizerContext,
        ordering: Option<&[SortKey]>,
    ) -> QuereusResult<PlanNode> {
        match plan {
            PlanNode::Sort { input, order_by } => {
                let rewritten = self.rewrite(*input, ctx, Some(&order_by))?;
                if ordering_satisfied(&rewritten, &order_by) {
                    return Ok(rewritten);
                }
                Ok(PlanNode::Sort {
                    input: Box::new(rewritten),
                    order_by,
                })
            }
            PlanNode::Filter { input, predicate } => {
                if let PlanNode::TableScan {
                    table,
                    access,
                    pushed,
                    output,
                } = *input
                {
                    if access.is_some() {
                        // Already negotiated on a previous pass.
                        return Ok(PlanNode::Filter {
                            input: Box::new(PlanNode::TableScan {
                                table,
                                access,
                                pushed,
                                output,
                            }),
                            predicate,
                        });
                    }
                    let conjuncts = split_conjuncts(predicate);
                    let mut constraints = Vec::new();
                    let mut constraint_source = Vec::new();
                    for (i, conjunct) in conjuncts.iter().enumerate() {
                        if let Some(constraint) = extract_constraint(conjunct) {
                            constraints.push(constraint);
                            constraint_source.push(i);
                        }
                    }
                    let request = BestAccessPlanRequest {
                        filters: constraints.clone(),
                        required_ordering: ordering.and_then(ordering_request),
                        estimated_rows: Some(table.estimated_rows),
                    };
                    let instance = (ctx.resolve_table)(&table)?;
                    let result = instance.best_access_plan(&request)?;
                    validate_access_plan(&request, &result)?;

                    // Conjuncts the module enforces need no Filter re-check.
                    let handled: Vec<usize> = result
                        .handled_filters
                        .iter()
                        .enumerate()
                        .filter(|(_, h)| **h)
                        .map(|(i, _)| constraint_source[i])
                        .collect();
                    let residual: Vec<ScalarExpr> = conjuncts
                        .into_iter()
                        .enumerate()
                        .filter(|(i, _)| !handled.contains(i))
                        .map(|(_, c)| c)
                        .collect();

                    let pushed: Vec<FilterConstraint> = constraints
                        .into_iter()
                        .zip(&result.handled_filters)
                        .filter(|(_, h)| **h)
                        .map(|(c, _)| c)
                        .collect();

                    let scan = PlanNode::TableScan {
                        table,
                        access: Some(result),
                        pushed,
                        output,
                    };
                    return Ok(match join_conjuncts(residual) {
                        Some(residual) => PlanNode::Filter {
                            input: Box::new(scan),
                            predicate: residual,
                        },
                        None => scan,
                    });
                }
                Ok(PlanNode::Filter {
                    input: Box::new(self.rewrite(*input, ctx, ordering)?),
                    predicate,
                })
            }
            PlanNode::TableScan {
                table,
                access: None,
                pushed,
                output,
            } => {
                let request = BestAccessPlanRequest {
                    filters: vec![],
                    required_ordering: ordering.and_then(ordering_request),
                    estimated_rows: Some(table.estimated_rows),
                };
                let instance = (ctx.resolve_table)(&table)?;
                let result = instance.best_access_plan(&request)?;
                validate_access_plan(&request, &result)?;
                Ok(PlanNode::TableScan {
                    table,
                    access: Some(result),
                    pushed,
                    output,
                })
            }
            PlanNode::Project {
                input,
                exprs,
                output,
            } => Ok(PlanNode::Project {
                input: Box::new(self.rewrite(*input, ctx, None)?),
                exprs,
                output,
            }),
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => Ok(PlanNode::Limit {
                input: Box::new(self.rewrite(*input, ctx, ordering)?),
                limit,
                offset,
            }),
            PlanNode::Aggregate {
                input,
                group_exprs,
                aggregates,
                output,
            } => Ok(PlanNode::Aggregate {
                input: Box::new(self.rewrite(*input, ctx, None)?),
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
                // Nested-loop joins preserve outer order.
                outer: Box::new(self.rewrite(*outer, ctx, ordering)?),
                inner: Box::new(self.rewrite(*inner, ctx, None)?),
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
                source: Box::new(self.rewrite(*source, ctx, None)?),
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
                source: Box::new(self.rewrite(*source, ctx, None)?),
                assignments,
                checks,
            }),
            PlanNode::Delete { table, source } => Ok(PlanNode::Delete {
                table,
                source: Box::new(self.rewrite(*source, ctx, None)?),
            }),
            PlanNode::Block { statements } => Ok(PlanNode::Block {
                statements: statements
                    .into_iter()
                    .map(|s| self.rewrite(s, ctx, None))
                    .collect::<QuereusResult<_>>()?,
            }),
            other => Ok(other),
        }
    }
}

/// `column op literal` (either side) → a pushable constraint.
fn extract_constraint(expr: &ScalarExpr) -> Option<FilterConstraint> {
    let ScalarExpr::Binary { op, left, right } = expr else {
        return None;
    };
    let op = match op {
        BinaryOp::Eq => ConstraintOp::Eq,
        BinaryOp::Lt => ConstraintOp::Lt,
        BinaryOp::LtEq => ConstraintOp::Le,
        BinaryOp::Gt => ConstraintOp::Gt,
        BinaryOp::GtEq => ConstraintOp::Ge,
        _ => return None,
    };
    match (left.as_ref(), right.as_ref()) {
        (ScalarExpr::Column { index, .. }, ScalarExpr::Literal(value)) => Some(FilterConstraint {
            column_index: *index,
            op,
            usable: true,
            value: Some(value.clone()),
        }),
        (ScalarExpr::Literal(value), ScalarExpr::Column { index, .. }) => Some(FilterConstraint {
            column_index: *index,
            op: mirror(op),
            usable: true,
            value: Some(value.clone()),
        }),
        _ => None,
    }
}

fn mirror(op: ConstraintOp) -> ConstraintOp {
    match op {
        ConstraintOp::Lt => ConstraintOp::Gt,
        ConstraintOp::Le => ConstraintOp::Ge,
        ConstraintOp::Gt => ConstraintOp::Lt,
        ConstraintOp::Ge => ConstraintOp::Le,
        other => other,
    }
}

/// A sort requirement is expressible to a module only as bare columns.
fn ordering_request(keys: &[SortKey]) -> Option<Vec<OrderingSpec>> {
    keys.iter()
        .map(|key| match &key.expr {
            ScalarExpr::Column { index, .. } => Some(OrderingSpec {
                column_index: *index,
                desc: key.desc,
            }),
            _ => None,
        })
        .collect()
}

/// True when the rewritten subtree guarantees the requested ordering.
fn ordering_satisfied(plan: &PlanNode, keys: &[SortKey]) -> bool {
    let Some(request) = ordering_request(keys) else {
        return false;
    };
    match plan {
        PlanNode::TableScan {
            access: Some(result),
            ..
        } => match &result.provides_ordering {
            Some(provided) => provided.as_slice() == request.as_slice(),
            None => false,
        },
        PlanNode::Filter { input, .. } => ordering_satisfied(input, keys),
        _ => false,
    }
}
