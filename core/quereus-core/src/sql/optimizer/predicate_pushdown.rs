//! Predicate placement.
//!
//! Conjuncts sink toward their scans: out of sorts, through projections
//! whose referenced outputs are plain column references, and into the
//! preserved side of inner/left joins. What reaches a scan stays in a
//! Filter directly above it; the access-path rule then decides which
//! conjuncts the table will enforce itself.

use crate::error::QuereusResult;
use crate::sql::planner::types::{BinaryOp, JoinType, PlanNode, ScalarExpr};

use super::{OptimizationRule, OptimizerContext};

pub struct PredicatePushdownRule;

impl OptimizationRule for PredicatePushdownRule {
    fn name(&self) -> &str {
        "PredicatePushdown"
    }

    fn apply(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        self.push_down(plan, ctx)
    }
}

impl PredicatePushdownRule {
    fn push_down(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        match plan {
            PlanNode::Filter { input, predicate } => {
                let input = self.push_down(*input, ctx)?;
                self.place(split_conjuncts(predicate), input, ctx)
            }
            PlanNode::Project {
                input,
                exprs,
                output,
            } => Ok(PlanNode::Project {
                input: Box::new(self.push_down(*input, ctx)?),
                exprs,
                output,
            }),
            PlanNode::Sort { input, order_by } => Ok(PlanNode::Sort {
                input: Box::new(self.push_down(*input, ctx)?),
                order_by,
            }),
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => Ok(PlanNode::Limit {
                input: Box::new(self.push_down(*input, ctx)?),
                limit,
                offset,
            }),
            PlanNode::Aggregate {
                input,
                group_exprs,
                aggregates,
                output,
            } => Ok(PlanNode::Aggregate {
                input: Box::new(self.push_down(*input, ctx)?),
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
                outer: Box::new(self.push_down(*outer, ctx)?),
                inner: Box::new(self.push_down(*inner, ctx)?),
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
                source: Box::new(self.push_down(*source, ctx)?),
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
                source: Box::new(self.push_down(*source, ctx)?),
                assignments,
                checks,
            }),
            PlanNode::Delete { table, source } => Ok(PlanNode::Delete {
                table,
                source: Box::new(self.push_down(*source, ctx)?),
            }),
            PlanNode::Block { statements } => Ok(PlanNode::Block {
                statements: statements
                    .into_iter()
                    .map(|s| self.push_down(s, ctx))
                    .collect::<QuereusResult<_>>()?,
            }),
            other => Ok(other),
        }
    }

    /// Sink a set of conjuncts into `input`, rebuilding Filters for what
    /// cannot move further.
    fn place(
        &self,
        conjuncts: Vec<ScalarExpr>,
        input: PlanNode,
        ctx: &OptimizerContext,
    ) -> QuereusResult<PlanNode> {
        match input {
            PlanNode::Sort { input, order_by } => {
                // A filter commutes with sorting.
                let inner = self.place(conjuncts, *input, ctx)?;
                Ok(PlanNode::Sort {
                    input: Box::new(inner),
                    order_by,
                })
            }
            PlanNode::Project {
                input,
                exprs,
                output,
            } => {
                // Push through when every referenced projection output is a
                // bare column of the projection input.
                let mut pushed = Vec::new();
                let mut kept = Vec::new();
                for conjunct in conjuncts {
                    match remap_through_projection(&conjunct, &exprs) {
                        Some(remapped) => pushed.push(remapped),
                        None => kept.push(conjunct),
                    }
                }
                let inner = if pushed.is_empty() {
                    *input
                } else {
                    self.place(pushed, *input, ctx)?
                };
                let projected = PlanNode::Project {
                    input: Box::new(inner),
                    exprs,
                    output,
                };
                Ok(wrap_filter(projected, kept))
            }
            PlanNode::NestedLoopJoin {
                outer,
                inner,
                join_type,
                condition,
                output,
            } => {
                let outer_arity = outer.output_schema().arity();
                let inner_arity = inner.output_schema().arity();
                let mut to_outer = Vec::new();
                let mut to_inner = Vec::new();
                let mut kept = Vec::new();
                for conjunct in conjuncts {
                    let mut columns = Vec::new();
                    conjunct.referenced_columns(&mut columns);
                    let all_outer = columns.iter().all(|&c| c < outer_arity);
                    let all_inner = columns.iter().all(|&c| c >= outer_arity);
                    // Only the preserved side of an outer join accepts
                    // pushed predicates.
                    if all_outer && matches!(join_type, JoinType::Inner | JoinType::Left | JoinType::Cross)
                    {
                        to_outer.push(conjunct);
                    } else if all_inner
                        && matches!(join_type, JoinType::Inner | JoinType::Right | JoinType::Cross)
                    {
                        let mapping: Vec<usize> = (0..outer_arity + inner_arity)
                            .map(|i| i.saturating_sub(outer_arity))
                            .collect();
                        let mut remapped = conjunct;
                        remapped.remap_columns(&mapping);
                        to_inner.push(remapped);
                    } else {
                        kept.push(conjunct);
                    }
                }
                let outer = if to_outer.is_empty() {
                    *outer
                } else {
                    self.place(to_outer, *outer, ctx)?
                };
                let inner = if to_inner.is_empty() {
                    *inner
                } else {
                    self.place(to_inner, *inner, ctx)?
                };
                let joined = PlanNode::NestedLoopJoin {
                    outer: Box::new(outer),
                    inner: Box::new(inner),
                    join_type,
                    condition,
                    output,
                };
                Ok(wrap_filter(joined, kept))
            }
            PlanNode::Filter { input, predicate } => {
                // Merge adjacent filters into one conjunct set.
                let mut all = split_conjuncts(predicate);
                all.extend(conjuncts);
                self.place(all, *input, ctx)
            }
            other => Ok(wrap_filter(other, conjuncts)),
        }
    }
}

/// Split a predicate on AND into its conjuncts.
pub(crate) fn split_conjuncts(expr: ScalarExpr) -> Vec<ScalarExpr> {
    match expr {
        ScalarExpr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            let mut out = split_conjuncts(*left);
            out.extend(split_conjuncts(*right));
            out
        }
        other => vec![other],
    }
}

pub(crate) fn join_conjuncts(mut conjuncts: Vec<ScalarExpr>) -> Option<ScalarExpr> {
    let first = conjuncts.pop()?;
    Some(conjuncts.into_iter().rev().fold(first, |acc, c| {
        ScalarExpr::Binary {
            op: BinaryOp::And,
            left: Box::new(c),
            right: Box::new(acc),
        }
    }))
}

fn wrap_filter(input: PlanNode, conjuncts: Vec<ScalarExpr>) -> PlanNode {
    match join_conjuncts(conjuncts) {
        Some(predicate) => PlanNode::Filter {
            input: Box::new(input),
            predicate,
        },
        None => input,
    }
}

/// Rewrite a conjunct over projection outputs into one over projection
/// inputs, when every referenced output is a bare column reference.
fn remap_through_projection(
    conjunct: &ScalarExpr,
    exprs: &[(ScalarExpr, Option<String>)],
) -> Option<ScalarExpr> {
    let mut columns = Vec::new();
    conjunct.referenced_columns(&mut columns);
    let mut mapping = vec![usize::MAX; exprs.len()];
    for &column in &columns {
        match exprs.get(column)? {
            (ScalarExpr::Column { index, .. }, _) => mapping[column] = *index,
            _ => return None,
        }
    }
    let mut remapped = conjunct.clone();
    remapped.remap_columns(&mapping);
    Some(remapped)
}
