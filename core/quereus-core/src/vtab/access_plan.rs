//! Access-plan negotiation between the planner and a table module.
//!
//! The planner describes the usable predicates and the ordering it would
//! like; the module answers with a costed plan and commits to the filters
//! it will enforce itself. Cost values are only meaningful relative to one
//! another.

use crate::error::{QuereusError, QuereusResult};
use crate::types::SqlValue;

/// Predicate operators a module can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Like,
}

impl ConstraintOp {
    pub fn is_range(&self) -> bool {
        matches!(self, ConstraintOp::Lt | ConstraintOp::Le | ConstraintOp::Gt | ConstraintOp::Ge)
    }
}

/// One predicate offered to the module.
#[derive(Debug, Clone)]
pub struct FilterConstraint {
    pub column_index: usize,
    pub op: ConstraintOp,
    /// Whether the planner can supply the comparison value at execution time.
    pub usable: bool,
    /// The comparison value when known at plan time.
    pub value: Option<SqlValue>,
}

/// One component of a requested or provided ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingSpec {
    pub column_index: usize,
    pub desc: bool,
}

/// Planner → module request.
#[derive(Debug, Clone, Default)]
pub struct BestAccessPlanRequest {
    pub filters: Vec<FilterConstraint>,
    pub required_ordering: Option<Vec<OrderingSpec>>,
    pub estimated_rows: Option<u64>,
}

/// Module → planner answer.
#[derive(Debug, Clone)]
pub struct BestAccessPlanResult {
    /// Comparable across candidates for the same request.
    pub cost: f64,
    /// Expected output cardinality.
    pub rows: u64,
    /// Parallel to `request.filters`; `true` means the module enforces it.
    pub handled_filters: Vec<bool>,
    /// The prefix of `required_ordering` the module guarantees, if any.
    pub provides_ordering: Option<Vec<OrderingSpec>>,
    /// Result has no duplicate rows (full primary-key equality match).
    pub is_set: bool,
    pub index_name: Option<String>,
    pub seek_columns: Vec<usize>,
    /// Human-readable strategy, surfaced by EXPLAIN.
    pub explains: String,
}

/// Planner-side validation of a module's answer.
pub fn validate_access_plan(
    request: &BestAccessPlanRequest,
    result: &BestAccessPlanResult,
) -> QuereusResult<()> {
    if result.handled_filters.len() != request.filters.len() {
        return Err(QuereusError::Internal(format!(
            "access plan answered {} filters for a request with {}",
            result.handled_filters.len(),
            request.filters.len()
        )));
    }
    if let Some(provided) = &result.provides_ordering {
        let required = request.required_ordering.as_deref().unwrap_or(&[]);
        if provided.len() > required.len()
            || provided.iter().zip(required).any(|(p, r)| p != r)
        {
            return Err(QuereusError::Internal(
                "access plan provides an ordering that was not requested".into(),
            ));
        }
    }
    if result.is_set && result.rows > 1 {
        return Err(QuereusError::Internal(
            "access plan claims set semantics with more than one row".into(),
        ));
    }
    Ok(())
}

/// An index made visible to the generic selection algorithm. The primary
/// key participates as the synthetic `_primary_` index.
#[derive(Debug, Clone)]
pub struct CandidateIndex {
    pub name: String,
    pub columns: Vec<OrderingSpec>,
}

/// Name of the synthetic primary-key index.
pub const PRIMARY_INDEX: &str = "_primary_";

/// Generic module-side selection: enumerate candidate indexes, cost each as
/// an equality seek, range scan or full scan, pick the cheapest, then apply
/// the ordering discount.
pub fn choose_best_access(
    table_size: u64,
    indexes: &[CandidateIndex],
    request: &BestAccessPlanRequest,
) -> BestAccessPlanResult {
    let n = table_size.max(1) as f64;
    let mut best: Option<(BestAccessPlanResult, &CandidateIndex)> = None;

    for index in indexes {
        let candidate = cost_index(n, table_size, index, request);
        let better = match &best {
            None => true,
            Some((current, _)) => candidate.cost < current.cost,
        };
        if better {
            best = Some((candidate, index));
        }
    }

    let Some((mut result, index)) = best else {
        // No indexes at all: a bare full scan.
        return BestAccessPlanResult {
            cost: 10.0 * n,
            rows: table_size,
            handled_filters: vec![false; request.filters.len()],
            provides_ordering: None,
            is_set: false,
            index_name: None,
            seek_columns: vec![],
            explains: "full scan".into(),
        };
    };

    if let Some(required) = request.required_ordering.as_deref()
        && !required.is_empty()
        && required.len() <= index.columns.len()
        && required.iter().zip(&index.columns).all(|(r, c)| r == c)
    {
        result.cost *= 0.9;
        result.provides_ordering = Some(required.to_vec());
    }

    result
}

fn cost_index(
    n: f64,
    table_size: u64,
    index: &CandidateIndex,
    request: &BestAccessPlanRequest,
) -> BestAccessPlanResult {
    let usable_eq = |column: usize| {
        request
            .filters
            .iter()
            .position(|f| f.usable && f.column_index == column && f.op == ConstraintOp::Eq)
    };

    // Equality seek: every index column pinned by an `=` filter.
    let eq_positions: Vec<Option<usize>> =
        index.columns.iter().map(|c| usable_eq(c.column_index)).collect();
    if !index.columns.is_empty() && eq_positions.iter().all(|p| p.is_some()) {
        let mut handled = vec![false; request.filters.len()];
        for p in eq_positions.into_iter().flatten() {
            handled[p] = true;
        }
        return BestAccessPlanResult {
            cost: n.log2() + 1.0,
            rows: 1,
            handled_filters: handled,
            provides_ordering: None,
            is_set: true,
            index_name: Some(index.name.clone()),
            seek_columns: index.columns.iter().map(|c| c.column_index).collect(),
            explains: format!("equality seek on {}", index.name),
        };
    }

    // Range scan: a usable range filter on the leading column.
    if let Some(leading) = index.columns.first() {
        let range_positions: Vec<usize> = request
            .filters
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                f.usable && f.column_index == leading.column_index && f.op.is_range()
            })
            .map(|(i, _)| i)
            .collect();
        if !range_positions.is_empty() {
            let rows = table_size / 4;
            let mut handled = vec![false; request.filters.len()];
            for p in range_positions {
                handled[p] = true;
            }
            return BestAccessPlanResult {
                cost: n.log2() * 2.0 + rows as f64,
                rows,
                handled_filters: handled,
                provides_ordering: None,
                is_set: false,
                index_name: Some(index.name.clone()),
                seek_columns: vec![leading.column_index],
                explains: format!("range scan on {}", index.name),
            };
        }
    }

    // Full scan. When filters exist but none is handled, nudge the cost so
    // any useful index wins ties.
    let nudge = if request.filters.is_empty() { 0.0 } else { 0.01 };
    BestAccessPlanResult {
        cost: 10.0 * n + nudge,
        rows: table_size,
        handled_filters: vec![false; request.filters.len()],
        provides_ordering: None,
        is_set: false,
        index_name: Some(index.name.clone()),
        seek_columns: vec![],
        explains: format!("full scan via {}", index.name),
    }
}
