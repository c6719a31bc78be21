//! Plan → instruction lowering.
//!
//! Emission resolves every schema object (tables, functions) at *emission*
//! time, records each lookup as a [`SchemaDependency`], and captures the
//! resolved object under a stable key so execution uses exactly the object
//! that was planned against. `validate_captured_schema_objects` detects
//! schema changes between emission and execution; the dependency
//! fingerprint keys the plan cache.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{QuereusError, QuereusResult};
use crate::schema::{AggregateFunction, KeyColumn, SchemaManager, TableFunction, TableSchema};
use crate::sql::optimizer::TableResolver;
use crate::sql::planner::types::{
    AggregateExpr, JoinType, PlanNode, ScalarExpr, SortKey,
};
use crate::types::{Row, SqlValue, TextCollation, compare_values};
use crate::vtab::module::{ConflictPolicy, DmlOp, FilterInfo, UpdateArgs, VirtualTable};

use super::expr::{RuntimeServices, SubqueryRunner, eval_expr, eval_predicate};
use super::instruction::{Instruction, RowSeq, Value};
use super::scheduler::{ExecContext, Scheduler};

/// One schema object a plan depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDependency {
    pub kind: &'static str,
    pub schema_name: Option<String>,
    pub object_name: String,
    pub version: Option<u64>,
}

impl SchemaDependency {
    /// Stable cache key; versions are deliberately excluded so invalidation
    /// events match by identity.
    pub fn key(&self) -> String {
        match &self.schema_name {
            Some(schema) => format!("{}:{}.{}", self.kind, schema, self.object_name),
            None => format!("{}:{}", self.kind, self.object_name),
        }
    }
}

struct CapturedTable {
    instance: Arc<dyn VirtualTable>,
    schema_name: String,
    table_name: String,
    version: u64,
}

pub struct EmissionContext {
    schema: Arc<SchemaManager>,
    resolve_table: TableResolver,
    dependencies: Vec<SchemaDependency>,
    captured: HashMap<String, CapturedTable>,
}

impl EmissionContext {
    pub fn new(schema: Arc<SchemaManager>, resolve_table: TableResolver) -> Self {
        Self {
            schema,
            resolve_table,
            dependencies: Vec::new(),
            captured: HashMap::new(),
        }
    }

    pub fn dependencies(&self) -> &[SchemaDependency] {
        &self.dependencies
    }

    /// Sorted union of dependency keys; equal plans share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut keys: Vec<String> = self.dependencies.iter().map(|d| d.key()).collect();
        keys.sort();
        keys.dedup();
        keys.join(";")
    }

    /// Early schema-change detection at execution start: every captured
    /// object must still resolve to the same catalog version.
    pub fn validate_captured_schema_objects(&self) -> QuereusResult<()> {
        for captured in self.captured.values() {
            let current = self
                .schema
                .table_version(Some(&captured.schema_name), &captured.table_name);
            if current != Some(captured.version) {
                return Err(QuereusError::General(format!(
                    "Table {}.{} was dropped after query was planned",
                    captured.schema_name, captured.table_name
                )));
            }
        }
        Ok(())
    }

    /// The runner handed to expression evaluation for subquery plans.
    pub fn subquery_runner(&self) -> SubqueryRunner {
        let schema = Arc::clone(&self.schema);
        let resolver = Arc::clone(&self.resolve_table);
        Arc::new(move |plan: &PlanNode, services: &RuntimeServices| {
            let mut emission = EmissionContext::new(Arc::clone(&schema), Arc::clone(&resolver));
            let instruction = emission.emit(plan)?;
            emission.validate_captured_schema_objects()?;
            let mut context = ExecContext::new(services.clone());
            let value = Scheduler::execute(instruction, &mut context)?;
            value.into_rows()?.collect()
        })
    }

    fn capture_table(&mut self, table: &Arc<TableSchema>) -> QuereusResult<Arc<dyn VirtualTable>> {
        let key = format!("table:{}.{}", table.schema_name, table.name);
        if let Some(captured) = self.captured.get(&key) {
            return Ok(Arc::clone(&captured.instance));
        }
        let instance = (self.resolve_table)(table)?;
        self.dependencies.push(SchemaDependency {
            kind: "table",
            schema_name: Some(table.schema_name.clone()),
            object_name: table.name.clone(),
            version: Some(table.version),
        });
        self.captured.insert(
            key,
            CapturedTable {
                instance: Arc::clone(&instance),
                schema_name: table.schema_name.clone(),
                table_name: table.name.clone(),
                version: table.version,
            },
        );
        Ok(instance)
    }

    fn note_function_dependency(&mut self, name: &str) {
        self.dependencies.push(SchemaDependency {
            kind: "function",
            schema_name: None,
            object_name: name.to_string(),
            version: None,
        });
    }

    /// Lower a plan node to its instruction subtree.
    pub fn emit(&mut self, plan: &PlanNode) -> QuereusResult<Instruction> {
        let note = plan.describe();
        match plan {
            PlanNode::TableScan {
                table,
                access,
                pushed,
                ..
            } => {
                let instance = self.capture_table(table)?;
                let filter = FilterInfo {
                    constraints: pushed.clone(),
                    index_name: access.as_ref().and_then(|a| a.index_name.clone()),
                };
                Ok(Instruction::leaf(
                    note,
                    Box::new(move |_, _| Ok(Value::rows(instance.query(&filter)?))),
                ))
            }
            PlanNode::Filter { input, predicate } => {
                let input = self.emit(input)?;
                let predicate = predicate.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![input],
                    Box::new(move |ctx, mut args| {
                        let rows = args.pop().expect("filter input").into_rows()?;
                        let services = ctx.services.clone();
                        let predicate = predicate.clone();
                        Ok(Value::rows(Box::new(FilterRows {
                            inner: rows,
                            predicate,
                            services,
                        })))
                    }),
                ))
            }
            PlanNode::Project { input, exprs, .. } => {
                let input = self.emit(input)?;
                let exprs: Vec<ScalarExpr> = exprs.iter().map(|(e, _)| e.clone()).collect();
                Ok(Instruction::with_params(
                    note,
                    vec![input],
                    Box::new(move |ctx, mut args| {
                        let rows = args.pop().expect("project input").into_rows()?;
                        Ok(Value::rows(Box::new(ProjectRows {
                            inner: rows,
                            exprs: exprs.clone(),
                            services: ctx.services.clone(),
                        })))
                    }),
                ))
            }
            PlanNode::Values { rows, .. } => {
                let rows = rows.clone();
                Ok(Instruction::leaf(
                    note,
                    Box::new(move |ctx, _| {
                        let mut out = Vec::with_capacity(rows.len());
                        for row in &rows {
                            let mut evaluated = Vec::with_capacity(row.len());
                            for expr in row {
                                evaluated.push(eval_expr(expr, &[], &ctx.services)?);
                            }
                            out.push(evaluated);
                        }
                        Ok(Value::rows(Box::new(out.into_iter().map(Ok))))
                    }),
                ))
            }
            PlanNode::SingleRow => Ok(Instruction::leaf(
                note,
                Box::new(|_, _| Ok(Value::rows(Box::new(std::iter::once(Ok(Vec::new())))))),
            )),
            PlanNode::NestedLoopJoin {
                outer,
                inner,
                join_type,
                condition,
                ..
            } => {
                let outer_arity = outer.output_schema().arity();
                let inner_arity = inner.output_schema().arity();
                let outer = self.emit(outer)?;
                let inner = self.emit(inner)?;
                let join_type = *join_type;
                let condition = condition.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![outer, inner],
                    Box::new(move |ctx, mut args| {
                        let inner_rows: Vec<Row> = args
                            .pop()
                            .expect("join inner")
                            .into_rows()?
                            .collect::<QuereusResult<_>>()?;
                        let outer_rows = args.pop().expect("join outer").into_rows()?;
                        let matched = vec![false; inner_rows.len()];
                        Ok(Value::rows(Box::new(JoinRows {
                            outer: outer_rows,
                            inner: inner_rows,
                            inner_matched: matched,
                            join_type,
                            condition: condition.clone(),
                            services: ctx.services.clone(),
                            outer_arity,
                            inner_arity,
                            current: None,
                            inner_pos: 0,
                            current_matched: false,
                            emitting_unmatched: false,
                            unmatched_pos: 0,
                        })))
                    }),
                ))
            }
            PlanNode::Aggregate {
                input,
                group_exprs,
                aggregates,
                ..
            } => {
                let input = self.emit(input)?;
                let mut resolved: Vec<(AggregateExpr, AggregateFunction)> =
                    Vec::with_capacity(aggregates.len());
                for aggregate in aggregates {
                    let function = self
                        .schema
                        .functions
                        .aggregate(&aggregate.function, aggregate.args.len().max(1))
                        .ok_or(QuereusError::Resolve {
                            kind: "aggregate function",
                            name: aggregate.function.clone(),
                        })?;
                    self.note_function_dependency(&aggregate.function);
                    resolved.push((aggregate.clone(), function));
                }
                let group_exprs = group_exprs.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![input],
                    Box::new(move |ctx, mut args| {
                        let rows = args.pop().expect("aggregate input").into_rows()?;
                        run_aggregate(rows, &group_exprs, &resolved, &ctx.services)
                    }),
                ))
            }
            PlanNode::Sort { input, order_by } => {
                let input = self.emit(input)?;
                let keys = order_by.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![input],
                    Box::new(move |ctx, mut args| {
                        let rows: Vec<Row> = args
                            .pop()
                            .expect("sort input")
                            .into_rows()?
                            .collect::<QuereusResult<_>>()?;
                        let sorted = sort_rows(rows, &keys, &ctx.services)?;
                        Ok(Value::rows(Box::new(sorted.into_iter().map(Ok))))
                    }),
                ))
            }
            PlanNode::Limit {
                input,
                limit,
                offset,
            } => {
                let input = self.emit(input)?;
                let limit = *limit;
                let offset = *offset;
                Ok(Instruction::with_params(
                    note,
                    vec![input],
                    Box::new(move |_, mut args| {
                        let rows = args.pop().expect("limit input").into_rows()?;
                        let skipped = rows.skip(offset as usize);
                        let taken: RowSeq = match limit {
                            Some(limit) => Box::new(skipped.take(limit as usize)),
                            None => Box::new(skipped),
                        };
                        Ok(Value::rows(taken))
                    }),
                ))
            }
            PlanNode::TvfCall { name, args, .. } => {
                let function: Arc<TableFunction> =
                    self.schema.functions.table_function(name, args.len())?;
                self.note_function_dependency(name);
                let args = args.clone();
                Ok(Instruction::leaf(
                    note,
                    Box::new(move |ctx, _| {
                        let mut evaluated = Vec::with_capacity(args.len());
                        for arg in &args {
                            evaluated.push(eval_expr(arg, &[], &ctx.services)?);
                        }
                        Ok(Value::rows((function.call)(&evaluated)?))
                    }),
                ))
            }
            PlanNode::Insert {
                table,
                source,
                on_conflict,
                checks,
            } => {
                let instance = self.capture_table(table)?;
                let source = self.emit(source)?;
                let on_conflict = *on_conflict;
                let checks = checks.clone();
                let table_name = table.name.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![source],
                    Box::new(move |ctx, mut args| {
                        // Materialize before mutating so the source scan is
                        // not affected by our own writes.
                        let rows: Vec<Row> = args
                            .pop()
                            .expect("insert source")
                            .into_rows()?
                            .collect::<QuereusResult<_>>()?;
                        let mut affected = 0u64;
                        for row in rows {
                            enforce_checks(&checks, &row, &table_name, &ctx.services)?;
                            instance.update(UpdateArgs {
                                op: DmlOp::Insert,
                                values: Some(row),
                                old_key_values: None,
                                on_conflict,
                            })?;
                            affected += 1;
                        }
                        Ok(Value::Affected(affected))
                    }),
                ))
            }
            PlanNode::Update {
                table,
                source,
                assignments,
                checks,
            } => {
                let instance = self.capture_table(table)?;
                let source = self.emit(source)?;
                let assignments = assignments.clone();
                let checks = checks.clone();
                let pk: Vec<KeyColumn> = table.primary_key.clone();
                let table_name = table.name.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![source],
                    Box::new(move |ctx, mut args| {
                        let old_rows: Vec<Row> = args
                            .pop()
                            .expect("update source")
                            .into_rows()?
                            .collect::<QuereusResult<_>>()?;
                        let mut affected = 0u64;
                        for old_row in old_rows {
                            let mut new_row = old_row.clone();
                            for (column, expr) in &assignments {
                                new_row[*column] = eval_expr(expr, &old_row, &ctx.services)?;
                            }
                            enforce_checks(&checks, &new_row, &table_name, &ctx.services)?;
                            let old_key: Vec<SqlValue> = pk
                                .iter()
                                .map(|k| old_row[k.column_index].clone())
                                .collect();
                            if instance
                                .update(UpdateArgs {
                                    op: DmlOp::Update,
                                    values: Some(new_row),
                                    old_key_values: Some(old_key),
                                    on_conflict: ConflictPolicy::Abort,
                                })?
                                .is_some()
                            {
                                affected += 1;
                            }
                        }
                        Ok(Value::Affected(affected))
                    }),
                ))
            }
            PlanNode::Delete { table, source } => {
                let instance = self.capture_table(table)?;
                let source = self.emit(source)?;
                let pk: Vec<KeyColumn> = table.primary_key.clone();
                Ok(Instruction::with_params(
                    note,
                    vec![source],
                    Box::new(move |_, mut args| {
                        let old_rows: Vec<Row> = args
                            .pop()
                            .expect("delete source")
                            .into_rows()?
                            .collect::<QuereusResult<_>>()?;
                        let mut affected = 0u64;
                        for old_row in old_rows {
                            let old_key: Vec<SqlValue> = pk
                                .iter()
                                .map(|k| old_row[k.column_index].clone())
                                .collect();
                            instance.update(UpdateArgs {
                                op: DmlOp::Delete,
                                values: None,
                                old_key_values: Some(old_key),
                                on_conflict: ConflictPolicy::Abort,
                            })?;
                            affected += 1;
                        }
                        Ok(Value::Affected(affected))
                    }),
                ))
            }
            PlanNode::Block { statements } => {
                let mut params = Vec::with_capacity(statements.len());
                for statement in statements {
                    params.push(self.emit(statement)?);
                }
                Ok(Instruction::with_params(
                    note,
                    params,
                    Box::new(|_, mut args| {
                        let last = args.pop();
                        // Earlier statements run for their effects; drain
                        // any lazy outputs so those effects happen.
                        for arg in args {
                            if let Value::Rows(stream) = arg {
                                for row in stream.iter {
                                    row?;
                                }
                            }
                        }
                        Ok(last.unwrap_or(Value::Unit))
                    }),
                ))
            }
        }
    }
}

fn enforce_checks(
    checks: &[ScalarExpr],
    row: &Row,
    table_name: &str,
    services: &RuntimeServices,
) -> QuereusResult<()> {
    for check in checks {
        // A CHECK fails only when it evaluates to FALSE; unknown passes.
        if eval_expr(check, row, services)?.is_truthy() == Some(false) {
            return Err(QuereusError::Constraint(format!(
                "CHECK constraint failed: {table_name}"
            )));
        }
    }
    Ok(())
}

fn run_aggregate(
    rows: RowSeq,
    group_exprs: &[ScalarExpr],
    aggregates: &[(AggregateExpr, AggregateFunction)],
    services: &RuntimeServices,
) -> QuereusResult<Value> {
    let mut order: Vec<Vec<SqlValue>> = Vec::new();
    let mut groups: AHashMap<Vec<SqlValue>, Vec<Box<dyn crate::schema::AggregateState>>> =
        AHashMap::new();

    for row in rows {
        let row = row?;
        let mut key = Vec::with_capacity(group_exprs.len());
        for expr in group_exprs {
            key.push(eval_expr(expr, &row, services)?);
        }
        if !groups.contains_key(&key) {
            order.push(key.clone());
            groups.insert(
                key.clone(),
                aggregates.iter().map(|(_, f)| (f.factory)()).collect(),
            );
        }
        let states = groups.get_mut(&key).expect("group just ensured");
        for ((aggregate, _), state) in aggregates.iter().zip(states.iter_mut()) {
            let mut args = Vec::with_capacity(aggregate.args.len());
            for arg in &aggregate.args {
                args.push(eval_expr(arg, &row, services)?);
            }
            state.accumulate(&args)?;
        }
    }

    // A global aggregate over zero rows still yields one row.
    if order.is_empty() && group_exprs.is_empty() {
        order.push(Vec::new());
        groups.insert(
            Vec::new(),
            aggregates.iter().map(|(_, f)| (f.factory)()).collect(),
        );
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        let mut states = groups.remove(&key).expect("group present");
        let mut row = key;
        for state in &mut states {
            row.push(state.finalize()?);
        }
        out.push(row);
    }
    Ok(Value::rows(Box::new(out.into_iter().map(Ok))))
}

fn sort_rows(
    rows: Vec<Row>,
    keys: &[SortKey],
    services: &RuntimeServices,
) -> QuereusResult<Vec<Row>> {
    let mut keyed: Vec<(Vec<SqlValue>, Row)> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut key = Vec::with_capacity(keys.len());
        for sort_key in keys {
            key.push(eval_expr(&sort_key.expr, &row, services)?);
        }
        keyed.push((key, row));
    }

    let collations: Vec<TextCollation> = keys
        .iter()
        .map(|k| {
            k.collation
                .as_deref()
                .and_then(TextCollation::parse)
                .unwrap_or_default()
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for (i, sort_key) in keys.iter().enumerate() {
            // NULLs sort first ascending, last descending.
            let order = match (a[i].is_null(), b[i].is_null()) {
                (true, true) => std::cmp::Ordering::Equal,
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => {
                    compare_values(&a[i], &b[i], collations[i]).unwrap_or(std::cmp::Ordering::Equal)
                }
            };
            let order = if sort_key.desc { order.reverse() } else { order };
            if order != std::cmp::Ordering::Equal {
                return order;
            }
        }
        std::cmp::Ordering::Equal
    });

    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}

struct FilterRows {
    inner: RowSeq,
    predicate: ScalarExpr,
    services: RuntimeServices,
}

impl Iterator for FilterRows {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.inner.next()? {
                Ok(row) => row,
                Err(err) => return Some(Err(err)),
            };
            match eval_predicate(&self.predicate, &row, &self.services) {
                Ok(true) => return Some(Ok(row)),
                Ok(false) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

struct ProjectRows {
    inner: RowSeq,
    exprs: Vec<ScalarExpr>,
    services: RuntimeServices,
}

impl Iterator for ProjectRows {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = match self.inner.next()? {
            Ok(row) => row,
            Err(err) => return Some(Err(err)),
        };
        let mut projected = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            match eval_expr(expr, &row, &self.services) {
                Ok(value) => projected.push(value),
                Err(err) => return Some(Err(err)),
            }
        }
        Some(Ok(projected))
    }
}

/// Buffered-inner nested loop. Outer order is preserved; right/full joins
/// emit unmatched inner rows (null-padded on the outer side) after the
/// outer sequence is exhausted.
struct JoinRows {
    outer: RowSeq,
    inner: Vec<Row>,
    inner_matched: Vec<bool>,
    join_type: JoinType,
    condition: Option<ScalarExpr>,
    services: RuntimeServices,
    outer_arity: usize,
    inner_arity: usize,
    current: Option<Row>,
    inner_pos: usize,
    current_matched: bool,
    emitting_unmatched: bool,
    unmatched_pos: usize,
}

impl JoinRows {
    fn combine(&self, outer: &Row, inner: &Row) -> Row {
        let mut combined = Vec::with_capacity(self.outer_arity + self.inner_arity);
        combined.extend(outer.iter().cloned());
        combined.extend(inner.iter().cloned());
        combined
    }

    fn null_padded_outer(&self, outer: &Row) -> Row {
        let mut combined = Vec::with_capacity(self.outer_arity + self.inner_arity);
        combined.extend(outer.iter().cloned());
        combined.extend(std::iter::repeat_n(SqlValue::Null, self.inner_arity));
        combined
    }

    fn null_padded_inner(&self, inner: &Row) -> Row {
        let mut combined = Vec::with_capacity(self.outer_arity + self.inner_arity);
        combined.extend(std::iter::repeat_n(SqlValue::Null, self.outer_arity));
        combined.extend(inner.iter().cloned());
        combined
    }
}

impl Iterator for JoinRows {
    type Item = QuereusResult<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.emitting_unmatched {
                while self.unmatched_pos < self.inner.len() {
                    let index = self.unmatched_pos;
                    self.unmatched_pos += 1;
                    if !self.inner_matched[index] {
                        return Some(Ok(self.null_padded_inner(&self.inner[index])));
                    }
                }
                return None;
            }

            if self.current.is_none() {
                match self.outer.next() {
                    Some(Ok(row)) => {
                        self.current = Some(row);
                        self.inner_pos = 0;
                        self.current_matched = false;
                    }
                    Some(Err(err)) => return Some(Err(err)),
                    None => {
                        if matches!(self.join_type, JoinType::Right | JoinType::Full) {
                            self.emitting_unmatched = true;
                            continue;
                        }
                        return None;
                    }
                }
            }

            let outer_row = self.current.as_ref().expect("current outer row").clone();
            while self.inner_pos < self.inner.len() {
                let index = self.inner_pos;
                self.inner_pos += 1;
                let combined = self.combine(&outer_row, &self.inner[index]);
                let passes = match &self.condition {
                    Some(condition) => {
                        match eval_predicate(condition, &combined, &self.services) {
                            Ok(passes) => passes,
                            Err(err) => return Some(Err(err)),
                        }
                    }
                    None => true,
                };
                if passes {
                    self.current_matched = true;
                    self.inner_matched[index] = true;
                    return Some(Ok(combined));
                }
            }

            // Inner exhausted for this outer row.
            let unmatched = !self.current_matched
                && matches!(self.join_type, JoinType::Left | JoinType::Full);
            let outer_row = self.current.take().expect("current outer row");
            if unmatched {
                return Some(Ok(self.null_padded_outer(&outer_row)));
            }
        }
    }
}
