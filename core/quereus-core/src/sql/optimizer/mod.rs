//! Rule-driven plan rewrites.
//!
//! Rules are applied in sequence and the whole set is iterated to a fixed
//! point (bounded pass count); each rule is idempotent, so the result does
//! not depend on rule order once the plan stops changing. With the
//! `validate_plan` option set, a structural validator runs after every pass
//! and rejects trees that violate schema or scope constraints.

mod access_path;
mod constant_folding;
mod dead_code;
mod predicate_pushdown;
mod validator;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use crate::error::QuereusResult;
use crate::schema::TableSchema;
use crate::sql::planner::PlanNode;
use crate::vtab::module::VirtualTable;

pub use access_path::AccessPathRule;
pub use constant_folding::ConstantFoldingRule;
pub use dead_code::DeadCodeRule;
pub use predicate_pushdown::PredicatePushdownRule;
pub use validator::validate_plan;

/// Safety bound on fixed-point iteration.
const MAX_PASSES: usize = 5;

/// Resolves a table schema to its live virtual-table instance so the
/// access-path rule can negotiate with the module.
pub type TableResolver =
    Arc<dyn Fn(&TableSchema) -> QuereusResult<Arc<dyn VirtualTable>> + Send + Sync>;

pub struct OptimizerContext {
    pub resolve_table: TableResolver,
    pub validate: bool,
}

/// One rewrite rule.
pub trait OptimizationRule: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode>;
}

pub struct Optimizer {
    rules: Vec<Box<dyn OptimizationRule>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(PredicatePushdownRule),
                Box::new(ConstantFoldingRule),
                Box::new(AccessPathRule),
                Box::new(DeadCodeRule),
            ],
        }
    }

    /// Apply every rule until the plan stops changing or the pass bound is
    /// reached.
    pub fn optimize(&self, plan: PlanNode, ctx: &OptimizerContext) -> QuereusResult<PlanNode> {
        let mut current = plan;
        for _ in 0..MAX_PASSES {
            let before = format!("{current:?}");
            for rule in &self.rules {
                current = rule.apply(current, ctx)?;
            }
            if ctx.validate {
                validate_plan(&current)?;
            }
            if format!("{current:?}") == before {
                break;
            }
        }
        Ok(current)
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}
