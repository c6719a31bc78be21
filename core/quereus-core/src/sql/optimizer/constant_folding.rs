//! Fold pure scalar subtrees at plan time.
//!
//! Only operator trees over literals fold; function calls are left alone
//! (purity is not declared at registration). A filter whose predicate folds
//! to TRUE disappears; one that folds to FALSE or NULL collapses its input
//! to an empty Values node.

use crate::error::QuereusResult;
use crate::sql::executor::expr::{apply_binary, apply_unary};
use crate::sql::planner::types::{OutputSchema, PlanNode, ScalarExpr};

use super::{OptimizationRule, OptimizerContext};

pub struct ConstantFoldingRule;

impl OptimizationRule for ConstantFoldingRule {
    fn name(&self) -> &str {
        "ConstantFolding"
    }

    fn apply(&self, plan: PlanNode, _ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        self.fold(plan)
    }
}

impl ConstantFoldingRule {
    fn fold(&self, plan: PlanNode) -> QuereusResult<PlanNode> {
        match plan {
            PlanNode::Filter { input, predicate } => {
                let predicate = fold_expr(predicate);
                if let ScalarExpr::Literal(value) = &predicate {
                    return match value.is_truthy() {
                        Some(true) => self.fold(*input),
                        // FALSE or NULL: nothing passes
                        _ => {
                            let output = input.output_schema();
                            Ok(empty_relation(output))
                        }
                    };
                }
                Ok(PlanNode::Filter {
                    input: Box::new(self.fold(*input)?),
                    predicate,
                })
            }
            PlanNode::Project {
                input,
                exprs,
                output,
            } => Ok(PlanNode::Project {
                input: Box::new(self.fold(*input)?),
                exprs: exprs
                    .into_iter()
                    .map(|(e, alias)| (fold_expr(e), alias))
                    .collect(),
                output,
            }),
            PlanNode::Values { rows, output } => Ok(PlanNode::Values {
                rows: rows
                    .into_iter()
                    .map(|row| row.into_iter().map(fold_expr).collect())
                    .collect(),
                output,
            }),
            PlanNode::Sort { input, order_by } => Ok(PlanNode::Sort {
                input: Box::new(self.fold(*input)?),
                order_by,
            }),
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => Ok(PlanNode::Limit {
                input: Box::new(self.fold(*input)?),
                limit,
                offset,
            }),
            PlanNode::Aggregate {
                input,
                group_exprs,
                aggregates,
                output,
            } => Ok(PlanNode::Aggregate {
                input: Box::new(self.fold(*input)?),
                group_exprs: group_exprs.into_iter().map(fold_expr).collect(),
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
                outer: Box::new(self.fold(*outer)?),
                inner: Box::new(self.fold(*inner)?),
                join_type,
                condition: condition.map(fold_expr),
                output,
            }),
            PlanNode::Insert {
                table,
                source,
                on_conflict,
                checks,
            } => Ok(PlanNode::Insert {
                table,
                source: Box::new(self.fold(*source)?),
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
                source: Box::new(self.fold(*source)?),
                assignments: assignments
                    .into_iter()
                    .map(|(c, e)| (c, fold_expr(e)))
                    .collect(),
                checks,
            }),
            PlanNode::Delete { table, source } => Ok(PlanNode::Delete {
                table,
                source: Box::new(self.fold(*source)?),
            }),
            PlanNode::Block { statements } => Ok(PlanNode::Block {
                statements: statements
                    .into_iter()
                    .map(|s| self.fold(s))
                    .collect::<QuereusResult<_>>()?,
            }),
            other => Ok(other),
        }
    }
}

fn empty_relation(output: OutputSchema) -> PlanNode {
    PlanNode::Values {
        rows: vec![],
        output,
    }
}

/// Bottom-up literal folding of operator trees.
pub(crate) fn fold_expr(expr: ScalarExpr) -> ScalarExpr {
    match expr {
        ScalarExpr::Binary { op, left, right } => {
            let left = fold_expr(*left);
            let right = fold_expr(*right);
            if let (ScalarExpr::Literal(a), ScalarExpr::Literal(b)) = (&left, &right)
                && let Ok(folded) = apply_binary(op, a, b)
            {
                return ScalarExpr::Literal(folded);
            }
            ScalarExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            }
        }
        ScalarExpr::Unary { op, operand } => {
            let operand = fold_expr(*operand);
            if let ScalarExpr::Literal(value) = &operand
                && let Ok(folded) = apply_unary(op, value)
            {
                return ScalarExpr::Literal(folded);
            }
            ScalarExpr::Unary {
                op,
                operand: Box::new(operand),
            }
        }
        other => other,
    }
}
