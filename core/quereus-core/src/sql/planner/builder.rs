//! AST → plan conversion.
//!
//! The parser (an external collaborator, the `sqlparser` crate) hands us a
//! statement batch; the builder resolves names against the schema catalog,
//! assigns flat column indexes, and produces [`PlanNode`] trees. Aliased
//! select items are substituted into WHERE/ORDER BY references the same way
//! the surrounding expression would have been planned.
//!
//! Join order is greedy: each join step is scored in both driving
//! directions by `outer_cost + outer_rows * inner_cost` and the cheaper
//! direction wins, flipping left/right outer types when the sides swap.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    self as ast, SetExpr, Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::error::{QuereusError, QuereusResult};
use crate::schema::{ColumnSchema, IndexSchema, KeyColumn, SchemaManager, TableSchema};
use crate::types::{LogicalType, SortDirection, SqlValue, TypeClass};
use crate::vtab::module::ConflictPolicy;

use super::types::{
    AggregateExpr, BinaryOp, JoinType, OutputColumn, OutputSchema, PlanNode, ScalarExpr, SortKey,
    UnaryOp, infer_expr_type,
};

/// Parse a SQL batch into statements.
pub fn parse_sql(sql: &str) -> QuereusResult<Vec<Statement>> {
    Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| QuereusError::Parse {
        message: e.to_string(),
        sql: sql.to_string(),
    })
}

/// Requested transaction behavior for BEGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

/// A planned statement: either an executable plan or a control/DDL action
/// the engine performs directly.
pub enum BuiltStatement {
    Plan(PlanNode),
    CreateTable {
        schema: TableSchema,
        if_not_exists: bool,
    },
    CreateIndex {
        schema_name: Option<String>,
        table_name: String,
        index: IndexSchema,
    },
    DropTable {
        schema_name: Option<String>,
        table_name: String,
        if_exists: bool,
    },
    Begin(TransactionMode),
    Commit,
    Rollback,
    RollbackToSavepoint(String),
    Savepoint(String),
    ReleaseSavepoint(String),
}

/// Name-resolution services shared by every node of one planning pass.
pub struct PlanningContext {
    pub schema: Arc<SchemaManager>,
    /// Columns without an explicit NULL/NOT NULL marker default to this.
    pub default_nullable: bool,
    pub default_vtab_module: String,
}

/// One visible column during name resolution.
#[derive(Clone)]
struct ScopeColumn {
    qualifier: Option<String>,
    name: String,
    logical_type: LogicalType,
}

#[derive(Clone, Default)]
struct Scope {
    columns: Vec<ScopeColumn>,
}

impl Scope {
    fn from_table(table: &TableSchema, alias: Option<&str>) -> Self {
        let qualifier = Some(alias.unwrap_or(&table.name).to_lowercase());
        Self {
            columns: table
                .columns
                .iter()
                .map(|c| ScopeColumn {
                    qualifier: qualifier.clone(),
                    name: c.name.clone(),
                    logical_type: c.logical_type.clone(),
                })
                .collect(),
        }
    }

    fn from_output(output: &OutputSchema) -> Self {
        Self {
            columns: output
                .columns
                .iter()
                .map(|c| ScopeColumn {
                    qualifier: None,
                    name: c.name.clone(),
                    logical_type: c.logical_type.clone(),
                })
                .collect(),
        }
    }

    fn concat(mut self, other: Scope) -> Scope {
        self.columns.extend(other.columns);
        self
    }

    fn resolve(&self, qualifier: Option<&str>, name: &str) -> QuereusResult<usize> {
        let matches: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.name.eq_ignore_ascii_case(name)
                    && qualifier
                        .map(|q| c.qualifier.as_deref() == Some(&q.to_lowercase()))
                        .unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [index] => Ok(*index),
            [] => Err(QuereusError::Resolve {
                kind: "column",
                name: match qualifier {
                    Some(q) => format!("{q}.{name}"),
                    None => name.to_string(),
                },
            }),
            _ => Err(QuereusError::Type(format!("ambiguous column name {name}"))),
        }
    }

    fn output(&self) -> OutputSchema {
        OutputSchema::new(
            self.columns
                .iter()
                .map(|c| OutputColumn {
                    name: c.name.clone(),
                    logical_type: c.logical_type.clone(),
                })
                .collect(),
        )
    }
}

pub struct PlanBuilder<'a> {
    ctx: &'a PlanningContext,
    /// Positional `?` parameters are numbered in encounter order.
    param_counter: u32,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(ctx: &'a PlanningContext) -> Self {
        Self {
            ctx,
            param_counter: 0,
        }
    }

    pub fn build_statement(&mut self, statement: &Statement) -> QuereusResult<BuiltStatement> {
        match statement {
            Statement::Query(query) => Ok(BuiltStatement::Plan(self.build_query(query)?)),
            Statement::Insert(insert) => Ok(BuiltStatement::Plan(self.build_insert(insert)?)),
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => Ok(BuiltStatement::Plan(self.build_update(
                table,
                assignments,
                selection.as_ref(),
            )?)),
            Statement::Delete(delete) => Ok(BuiltStatement::Plan(self.build_delete(delete)?)),
            Statement::CreateTable(create) => self.build_create_table(create),
            Statement::CreateIndex(create) => self.build_create_index(create),
            Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => match object_type {
                ast::ObjectType::Table => {
                    let (schema_name, table_name) = split_object_name(&names[0]);
                    Ok(BuiltStatement::DropTable {
                        schema_name,
                        table_name,
                        if_exists: *if_exists,
                    })
                }
                other => Err(QuereusError::unsupported(format!("DROP {other:?}"))),
            },
            Statement::StartTransaction { modes, .. } => {
                let mode = modes
                    .iter()
                    .find_map(|m| match m {
                        ast::TransactionMode::AccessMode(ast::TransactionAccessMode::ReadWrite) => {
                            Some(TransactionMode::Immediate)
                        }
                        _ => None,
                    })
                    .unwrap_or_default();
                Ok(BuiltStatement::Begin(mode))
            }
            Statement::Commit { .. } => Ok(BuiltStatement::Commit),
            Statement::Rollback { savepoint, .. } => Ok(match savepoint {
                Some(name) => BuiltStatement::RollbackToSavepoint(name.value.clone()),
                None => BuiltStatement::Rollback,
            }),
            Statement::Savepoint { name } => Ok(BuiltStatement::Savepoint(name.value.clone())),
            Statement::ReleaseSavepoint { name } => {
                Ok(BuiltStatement::ReleaseSavepoint(name.value.clone()))
            }
            other => Err(QuereusError::unsupported(format!(
                "statement {}",
                statement_kind(other)
            ))),
        }
    }

    // ===== SELECT =====

    fn build_query(&mut self, query: &ast::Query) -> QuereusResult<PlanNode> {
        let (mut plan, scope, aliases) = match query.body.as_ref() {
            SetExpr::Select(select) => self.build_select(select)?,
            SetExpr::Values(values) => {
                let plan = self.build_values(values, None)?;
                let scope = Scope::from_output(&plan.output_schema());
                (plan, scope, HashMap::new())
            }
            other => {
                return Err(QuereusError::unsupported(format!(
                    "query body {other:?}"
                )));
            }
        };

        // ORDER BY lives on the Query, planned against the pre-projection
        // scope with select-list aliases substituted.
        if let Some(order_by) = &query.order_by
            && !order_by.exprs.is_empty()
        {
            let mut keys = Vec::with_capacity(order_by.exprs.len());
            for ob in &order_by.exprs {
                let expr = self.build_expr_with_aliases(&ob.expr, &scope, &aliases)?;
                keys.push(SortKey {
                    expr,
                    desc: !ob.asc.unwrap_or(true),
                    collation: None,
                });
            }
            plan = PlanNode::Sort {
                input: Box::new(plan),
                order_by: keys,
            };
        }

        // Projection was deferred so sort keys could see the base scope.
        if let SetExpr::Select(select) = query.body.as_ref() {
            plan = self.apply_projection(plan, &scope, &select.projection)?;
        }

        if query.limit.is_some() || query.offset.is_some() {
            let limit = match &query.limit {
                Some(expr) => Some(extract_u64(expr)?),
                None => None,
            };
            let offset = match &query.offset {
                Some(offset) => extract_u64(&offset.value)?,
                None => 0,
            };
            plan = PlanNode::Limit {
                input: Box::new(plan),
                limit,
                offset,
            };
        }

        Ok(plan)
    }

    /// Build FROM/WHERE/GROUP BY; projection is applied by the caller so
    /// ORDER BY can reference the pre-projection scope.
    fn build_select(
        &mut self,
        select: &ast::Select,
    ) -> QuereusResult<(PlanNode, Scope, HashMap<String, ast::Expr>)> {
        let (mut plan, mut scope) = self.build_from(&select.from)?;

        // Select-list aliases, usable in WHERE and ORDER BY.
        let mut aliases = HashMap::new();
        for item in &select.projection {
            if let ast::SelectItem::ExprWithAlias { expr, alias } = item {
                aliases.insert(alias.value.to_lowercase(), expr.clone());
            }
        }

        if let Some(selection) = &select.selection {
            let predicate = self.build_expr_with_aliases(selection, &scope, &aliases)?;
            plan = PlanNode::Filter {
                input: Box::new(plan),
                predicate,
            };
        }

        let group_exprs: Vec<ScalarExpr> = match &select.group_by {
            ast::GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|e| self.build_expr(e, &scope))
                .collect::<QuereusResult<_>>()?,
            ast::GroupByExpr::All(_) => vec![],
        };
        let aggregates = self.extract_aggregates(&select.projection, &scope)?;

        if !group_exprs.is_empty() || !aggregates.is_empty() {
            let input_schema = plan.output_schema();
            let mut columns = Vec::new();
            for (i, expr) in group_exprs.iter().enumerate() {
                columns.push(OutputColumn {
                    name: group_column_name(expr, i),
                    logical_type: infer_expr_type(expr, &input_schema),
                });
            }
            for agg in &aggregates {
                let name = agg
                    .alias
                    .clone()
                    .unwrap_or_else(|| format!("{}()", agg.function));
                let logical_type = match agg.function.as_str() {
                    "count" => LogicalType::integer(),
                    "avg" => LogicalType::real().nullable(),
                    _ => agg
                        .args
                        .first()
                        .map(|a| infer_expr_type(a, &input_schema).nullable())
                        .unwrap_or_else(|| LogicalType::any().nullable()),
                };
                columns.push(OutputColumn { name, logical_type });
            }
            let output = OutputSchema::new(columns);
            plan = PlanNode::Aggregate {
                input: Box::new(plan),
                group_exprs,
                aggregates,
                output: output.clone(),
            };
            scope = Scope::from_output(&output);
        }

        Ok((plan, scope, aliases))
    }

    fn apply_projection(
        &mut self,
        plan: PlanNode,
        scope: &Scope,
        projection: &[ast::SelectItem],
    ) -> QuereusResult<PlanNode> {
        // Aggregation already shaped the output; a bare aggregate query's
        // select list maps 1:1 onto the aggregate output.
        if matches!(plan, PlanNode::Aggregate { .. })
            || matches!(&plan, PlanNode::Sort { input, .. } if matches!(**input, PlanNode::Aggregate { .. }))
        {
            return Ok(plan);
        }

        let mut exprs: Vec<(ScalarExpr, Option<String>)> = Vec::new();
        for item in projection {
            match item {
                ast::SelectItem::Wildcard(_) => {
                    for (i, column) in scope.columns.iter().enumerate() {
                        exprs.push((ScalarExpr::column(i, column.name.clone()), None));
                    }
                }
                ast::SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = name.to_string().to_lowercase();
                    for (i, column) in scope.columns.iter().enumerate() {
                        if column.qualifier.as_deref() == Some(qualifier.as_str()) {
                            exprs.push((ScalarExpr::column(i, column.name.clone()), None));
                        }
                    }
                }
                ast::SelectItem::UnnamedExpr(expr) => {
                    exprs.push((self.build_expr(expr, scope)?, None));
                }
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    exprs.push((self.build_expr(expr, scope)?, Some(alias.value.clone())));
                }
            }
        }

        let input_schema = plan.output_schema();
        let columns = exprs
            .iter()
            .map(|(expr, alias)| OutputColumn {
                name: alias.clone().unwrap_or_else(|| projected_name(expr)),
                logical_type: infer_expr_type(expr, &input_schema),
            })
            .collect();
        Ok(PlanNode::Project {
            input: Box::new(plan),
            exprs,
            output: OutputSchema::new(columns),
        })
    }

    // ===== FROM and joins =====

    fn build_from(&mut self, from: &[ast::TableWithJoins]) -> QuereusResult<(PlanNode, Scope)> {
        if from.is_empty() {
            return Ok((PlanNode::SingleRow, Scope::default()));
        }

        let (mut plan, mut scope) = self.build_table_factor(&from[0].relation)?;
        for join in &from[0].joins {
            (plan, scope) = self.build_join(plan, scope, join)?;
        }

        // Comma-separated FROM items are cross joins.
        for extra in &from[1..] {
            let (right, right_scope) = self.build_table_factor(&extra.relation)?;
            let mut joined = self.plan_nlj(plan, scope.clone(), right, right_scope.clone(), JoinType::Cross, None)?;
            let mut joined_scope = scope.concat(right_scope);
            for join in &extra.joins {
                (joined, joined_scope) = self.build_join(joined, joined_scope, join)?;
            }
            plan = joined;
            scope = joined_scope;
        }

        Ok((plan, scope))
    }

    fn build_table_factor(&mut self, factor: &TableFactor) -> QuereusResult<(PlanNode, Scope)> {
        match factor {
            TableFactor::Table {
                name, alias, args, ..
            } => {
                if let Some(args) = args {
                    return self.build_tvf(name, args, alias.as_ref());
                }
                let (schema_name, table_name) = split_object_name(name);
                let table = self
                    .ctx
                    .schema
                    .lookup_table(schema_name.as_deref(), &table_name)?;
                let scope = Scope::from_table(&table, alias.as_ref().map(|a| a.name.value.as_str()));
                let output = OutputSchema::from_table(&table);
                Ok((
                    PlanNode::TableScan {
                        table,
                        access: None,
                        pushed: vec![],
                        output,
                    },
                    scope,
                ))
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let plan = self.build_query(subquery)?;
                let output = plan.output_schema();
                let mut scope = Scope::from_output(&output);
                if let Some(alias) = alias {
                    let qualifier = Some(alias.name.value.to_lowercase());
                    for column in &mut scope.columns {
                        column.qualifier = qualifier.clone();
                    }
                }
                Ok((plan, scope))
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                let (mut plan, mut scope) = self.build_table_factor(&table_with_joins.relation)?;
                for join in &table_with_joins.joins {
                    (plan, scope) = self.build_join(plan, scope, join)?;
                }
                Ok((plan, scope))
            }
            other => Err(QuereusError::unsupported(format!(
                "table expression {other:?}"
            ))),
        }
    }

    fn build_tvf(
        &mut self,
        name: &ast::ObjectName,
        args: &ast::TableFunctionArgs,
        alias: Option<&ast::TableAlias>,
    ) -> QuereusResult<(PlanNode, Scope)> {
        let function_name = name.to_string().to_lowercase();
        let mut planned_args = Vec::new();
        for arg in &args.args {
            if let ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(expr)) = arg {
                planned_args.push(self.build_expr(expr, &Scope::default())?);
            }
        }
        let tvf = self
            .ctx
            .schema
            .functions
            .table_function(&function_name, planned_args.len())?;
        let qualifier = Some(
            alias
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| function_name.clone())
                .to_lowercase(),
        );
        let scope = Scope {
            columns: tvf
                .column_names
                .iter()
                .zip(&tvf.column_types)
                .map(|(n, t)| ScopeColumn {
                    qualifier: qualifier.clone(),
                    name: n.clone(),
                    logical_type: t.clone(),
                })
                .collect(),
        };
        let output = scope.output();
        Ok((
            PlanNode::TvfCall {
                name: function_name,
                args: planned_args,
                output,
            },
            scope,
        ))
    }

    fn build_join(
        &mut self,
        left: PlanNode,
        left_scope: Scope,
        join: &ast::Join,
    ) -> QuereusResult<(PlanNode, Scope)> {
        let (right, right_scope) = self.build_table_factor(&join.relation)?;
        let combined = left_scope.clone().concat(right_scope.clone());

        let (join_type, condition) = match &join.join_operator {
            ast::JoinOperator::Inner(constraint) => {
                (JoinType::Inner, self.join_condition(constraint, &combined)?)
            }
            ast::JoinOperator::LeftOuter(constraint) => {
                (JoinType::Left, self.join_condition(constraint, &combined)?)
            }
            ast::JoinOperator::RightOuter(constraint) => {
                (JoinType::Right, self.join_condition(constraint, &combined)?)
            }
            ast::JoinOperator::FullOuter(constraint) => {
                (JoinType::Full, self.join_condition(constraint, &combined)?)
            }
            ast::JoinOperator::CrossJoin => (JoinType::Cross, None),
            other => {
                return Err(QuereusError::unsupported(format!("join {other:?}")));
            }
        };

        let plan = self.plan_nlj(left, left_scope.clone(), right, right_scope.clone(), join_type, condition)?;
        Ok((plan, left_scope.concat(right_scope)))
    }

    fn join_condition(
        &mut self,
        constraint: &ast::JoinConstraint,
        scope: &Scope,
    ) -> QuereusResult<Option<ScalarExpr>> {
        match constraint {
            ast::JoinConstraint::On(expr) => Ok(Some(self.build_expr(expr, scope)?)),
            ast::JoinConstraint::None => Ok(None),
            other => Err(QuereusError::unsupported(format!(
                "join constraint {other:?}"
            ))),
        }
    }

    /// Emit a nested-loop join, greedily choosing the driving side by
    /// `outer_cost + outer_rows * inner_cost`. Swapping sides remaps the
    /// condition's column indexes and flips left/right outer types.
    fn plan_nlj(
        &mut self,
        left: PlanNode,
        left_scope: Scope,
        right: PlanNode,
        right_scope: Scope,
        join_type: JoinType,
        condition: Option<ScalarExpr>,
    ) -> QuereusResult<PlanNode> {
        let (left_cost, left_rows) = estimate(&left);
        let (right_cost, right_rows) = estimate(&right);
        let forward = left_cost + left_rows * right_cost;
        let backward = right_cost + right_rows * left_cost;

        let swappable = matches!(join_type, JoinType::Inner | JoinType::Cross | JoinType::Left | JoinType::Right);
        let (outer, inner, outer_scope, inner_scope, join_type, swapped) =
            if swappable && backward < forward {
                let flipped = match join_type {
                    JoinType::Left => JoinType::Right,
                    JoinType::Right => JoinType::Left,
                    other => other,
                };
                (right, left, right_scope, left_scope, flipped, true)
            } else {
                (left, right, left_scope, right_scope, join_type, false)
            };

        let condition = condition.map(|mut cond| {
            if swapped {
                // Old layout: [left ++ right]; new layout: [right ++ left].
                let old_left_len = inner_scope.columns.len();
                let new_outer_len = outer_scope.columns.len();
                let total = old_left_len + new_outer_len;
                let mapping: Vec<usize> = (0..total)
                    .map(|i| {
                        if i < old_left_len {
                            new_outer_len + i
                        } else {
                            i - old_left_len
                        }
                    })
                    .collect();
                cond.remap_columns(&mapping);
            }
            cond
        });

        let output = outer_scope.concat(inner_scope).output();
        Ok(PlanNode::NestedLoopJoin {
            outer: Box::new(outer),
            inner: Box::new(inner),
            join_type,
            condition,
            output,
        })
    }

    // ===== DML =====

    fn build_insert(&mut self, insert: &ast::Insert) -> QuereusResult<PlanNode> {
        let (schema_name, table_name) = split_object_name(&insert.table_name);
        let table = self
            .ctx
            .schema
            .lookup_table(schema_name.as_deref(), &table_name)?;

        let provided: Vec<usize> = if insert.columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|c| {
                    table.column_index(&c.value).ok_or(QuereusError::Resolve {
                        kind: "column",
                        name: format!("{}.{}", table.name, c.value),
                    })
                })
                .collect::<QuereusResult<_>>()?
        };

        let source = insert
            .source
            .as_ref()
            .ok_or_else(|| QuereusError::unsupported("INSERT without a source"))?;
        let rows_plan = match source.body.as_ref() {
            SetExpr::Values(values) => self.build_values(values, Some((&table, &provided)))?,
            _ => {
                // INSERT ... SELECT: project the select output into table order.
                let select_plan = self.build_query(source)?;
                let select_schema = select_plan.output_schema();
                if select_schema.arity() != provided.len() {
                    return Err(QuereusError::Type(format!(
                        "INSERT supplies {} columns but source yields {}",
                        provided.len(),
                        select_schema.arity()
                    )));
                }
                let exprs = full_row_exprs(&table, &provided, |source_pos| {
                    ScalarExpr::column(source_pos, "value")
                });
                let columns = table_output_columns(&table);
                PlanNode::Project {
                    input: Box::new(select_plan),
                    exprs,
                    output: OutputSchema::new(columns),
                }
            }
        };

        let on_conflict = if insert.or == Some(ast::SqliteOnConflict::Replace)
            || insert.replace_into
        {
            ConflictPolicy::Replace
        } else {
            ConflictPolicy::Abort
        };

        let checks = self.build_checks(&table)?;
        Ok(PlanNode::Insert {
            table,
            source: Box::new(rows_plan),
            on_conflict,
            checks,
        })
    }

    /// VALUES rows; with a target table the rows are widened to full table
    /// arity with NULLs for omitted columns.
    fn build_values(
        &mut self,
        values: &ast::Values,
        target: Option<(&Arc<TableSchema>, &[usize])>,
    ) -> QuereusResult<PlanNode> {
        let scope = Scope::default();
        let mut rows = Vec::with_capacity(values.rows.len());
        for row in &values.rows {
            let exprs: Vec<ScalarExpr> = row
                .iter()
                .map(|e| self.build_expr(e, &scope))
                .collect::<QuereusResult<_>>()?;
            match target {
                Some((table, provided)) => {
                    if exprs.len() != provided.len() {
                        return Err(QuereusError::Type(format!(
                            "{} values supplied for {} columns",
                            exprs.len(),
                            provided.len()
                        )));
                    }
                    let mut full: Vec<ScalarExpr> =
                        vec![ScalarExpr::Literal(SqlValue::Null); table.columns.len()];
                    for (value, target_col) in exprs.into_iter().zip(provided) {
                        full[*target_col] = value;
                    }
                    rows.push(full);
                }
                None => rows.push(exprs),
            }
        }

        let output = match target {
            Some((table, _)) => OutputSchema::new(table_output_columns(table)),
            None => {
                let arity = rows.first().map(|r| r.len()).unwrap_or(0);
                let empty = OutputSchema::new(vec![]);
                OutputSchema::new(
                    (0..arity)
                        .map(|i| OutputColumn {
                            name: format!("column{}", i + 1),
                            logical_type: rows
                                .first()
                                .map(|r| infer_expr_type(&r[i], &empty))
                                .unwrap_or_else(|| LogicalType::any().nullable()),
                        })
                        .collect(),
                )
            }
        };

        Ok(PlanNode::Values { rows, output })
    }

    fn build_update(
        &mut self,
        table: &ast::TableWithJoins,
        assignments: &[ast::Assignment],
        selection: Option<&ast::Expr>,
    ) -> QuereusResult<PlanNode> {
        let TableFactor::Table { name, .. } = &table.relation else {
            return Err(QuereusError::unsupported("UPDATE on a non-table target"));
        };
        let (schema_name, table_name) = split_object_name(name);
        let table = self
            .ctx
            .schema
            .lookup_table(schema_name.as_deref(), &table_name)?;
        let scope = Scope::from_table(&table, None);

        let mut planned = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let column_name = assignment.target.to_string();
            let column = table
                .column_index(column_name.trim_matches('"'))
                .ok_or(QuereusError::Resolve {
                    kind: "column",
                    name: format!("{}.{}", table.name, column_name),
                })?;
            planned.push((column, self.build_expr(&assignment.value, &scope)?));
        }

        let mut source = PlanNode::TableScan {
            table: Arc::clone(&table),
            access: None,
            pushed: vec![],
            output: OutputSchema::from_table(&table),
        };
        if let Some(selection) = selection {
            source = PlanNode::Filter {
                input: Box::new(source),
                predicate: self.build_expr(selection, &scope)?,
            };
        }

        let checks = self.build_checks(&table)?;
        Ok(PlanNode::Update {
            table,
            source: Box::new(source),
            assignments: planned,
            checks,
        })
    }

    fn build_delete(&mut self, delete: &ast::Delete) -> QuereusResult<PlanNode> {
        let tables = match &delete.from {
            ast::FromTable::WithFromKeyword(tables) => tables,
            ast::FromTable::WithoutKeyword(tables) => tables,
        };
        let Some(first) = tables.first() else {
            return Err(QuereusError::unsupported("DELETE without a table"));
        };
        let TableFactor::Table { name, .. } = &first.relation else {
            return Err(QuereusError::unsupported("DELETE on a non-table target"));
        };
        let (schema_name, table_name) = split_object_name(name);
        let table = self
            .ctx
            .schema
            .lookup_table(schema_name.as_deref(), &table_name)?;
        let scope = Scope::from_table(&table, None);

        let mut source = PlanNode::TableScan {
            table: Arc::clone(&table),
            access: None,
            pushed: vec![],
            output: OutputSchema::from_table(&table),
        };
        if let Some(selection) = &delete.selection {
            source = PlanNode::Filter {
                input: Box::new(source),
                predicate: self.build_expr(selection, &scope)?,
            };
        }
        Ok(PlanNode::Delete {
            table,
            source: Box::new(source),
        })
    }

    /// Parse and plan a table's CHECK constraint texts against its scope.
    fn build_checks(&mut self, table: &Arc<TableSchema>) -> QuereusResult<Vec<ScalarExpr>> {
        let scope = Scope::from_table(table, None);
        let mut checks = Vec::with_capacity(table.checks.len());
        for text in &table.checks {
            let statements = parse_sql(&format!("SELECT {text}"))?;
            let Some(Statement::Query(query)) = statements.first() else {
                return Err(QuereusError::Internal(format!(
                    "unparseable CHECK constraint: {text}"
                )));
            };
            let SetExpr::Select(select) = query.body.as_ref() else {
                return Err(QuereusError::Internal(format!(
                    "unparseable CHECK constraint: {text}"
                )));
            };
            let Some(ast::SelectItem::UnnamedExpr(expr)) = select.projection.first() else {
                return Err(QuereusError::Internal(format!(
                    "unparseable CHECK constraint: {text}"
                )));
            };
            checks.push(self.build_expr(expr, &scope)?);
        }
        Ok(checks)
    }

    // ===== DDL =====

    fn build_create_table(&mut self, create: &ast::CreateTable) -> QuereusResult<BuiltStatement> {
        let (schema_name, table_name) = split_object_name(&create.name);

        let mut columns = Vec::with_capacity(create.columns.len());
        let mut pk: Vec<KeyColumn> = Vec::new();
        let mut checks: Vec<String> = Vec::new();

        for (i, column) in create.columns.iter().enumerate() {
            let mut logical_type = LogicalType::new(TypeClass::from_declared(
                &column.data_type.to_string(),
            ));
            logical_type.nullable = self.ctx.default_nullable;
            if let Some(collation) = &column.collation {
                logical_type.collation = Some(collation.to_string());
            }
            for option in &column.options {
                match &option.option {
                    ast::ColumnOption::NotNull => logical_type.nullable = false,
                    ast::ColumnOption::Null => logical_type.nullable = true,
                    ast::ColumnOption::Unique { is_primary, .. } if *is_primary => {
                        logical_type.nullable = false;
                        pk.push(KeyColumn::asc(i));
                    }
                    ast::ColumnOption::Check(expr) => checks.push(expr.to_string()),
                    _ => {}
                }
            }
            columns.push(ColumnSchema {
                name: column.name.value.clone(),
                logical_type,
            });
        }

        for constraint in &create.constraints {
            match constraint {
                ast::TableConstraint::PrimaryKey { columns: pk_cols, .. } => {
                    for ident in pk_cols {
                        let index = columns
                            .iter()
                            .position(|c| c.name.eq_ignore_ascii_case(&ident.value))
                            .ok_or(QuereusError::Resolve {
                                kind: "column",
                                name: ident.value.clone(),
                            })?;
                        columns[index].logical_type.nullable = false;
                        pk.push(KeyColumn::asc(index));
                    }
                }
                ast::TableConstraint::Check { expr, .. } => checks.push(expr.to_string()),
                _ => {}
            }
        }

        if pk.is_empty() {
            return Err(QuereusError::unsupported(format!(
                "table {table_name} without a PRIMARY KEY"
            )));
        }

        let schema = TableSchema {
            name: table_name,
            schema_name: SchemaManager::resolve_schema_name(schema_name.as_deref()),
            columns,
            primary_key: pk,
            indexes: vec![],
            checks,
            is_view: false,
            module_name: self.ctx.default_vtab_module.clone(),
            module_args: serde_json::Value::Null,
            estimated_rows: 0,
            version: 0,
            sql: Some(create.to_string()),
        };
        Ok(BuiltStatement::CreateTable {
            schema,
            if_not_exists: create.if_not_exists,
        })
    }

    fn build_create_index(&mut self, create: &ast::CreateIndex) -> QuereusResult<BuiltStatement> {
        let index_name = create
            .name
            .as_ref()
            .map(|n| split_object_name(n).1)
            .ok_or_else(|| QuereusError::Misuse("CREATE INDEX requires a name".into()))?;
        let (schema_name, table_name) = split_object_name(&create.table_name);
        let table = self
            .ctx
            .schema
            .lookup_table(schema_name.as_deref(), &table_name)?;

        let mut key_columns = Vec::with_capacity(create.columns.len());
        for ob in &create.columns {
            let column_name = match &ob.expr {
                ast::Expr::Identifier(ident) => ident.value.clone(),
                other => {
                    return Err(QuereusError::unsupported(format!(
                        "expression index on {other}"
                    )));
                }
            };
            let column_index = table
                .column_index(&column_name)
                .ok_or(QuereusError::Resolve {
                    kind: "column",
                    name: format!("{}.{}", table.name, column_name),
                })?;
            key_columns.push(KeyColumn {
                column_index,
                direction: if ob.asc == Some(false) {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                },
                collation: None,
            });
        }

        Ok(BuiltStatement::CreateIndex {
            schema_name,
            table_name,
            index: IndexSchema {
                name: index_name,
                columns: key_columns,
            },
        })
    }

    // ===== Expressions =====

    fn build_expr(&mut self, expr: &ast::Expr, scope: &Scope) -> QuereusResult<ScalarExpr> {
        self.build_expr_with_aliases(expr, scope, &HashMap::new())
    }

    fn build_expr_with_aliases(
        &mut self,
        expr: &ast::Expr,
        scope: &Scope,
        aliases: &HashMap<String, ast::Expr>,
    ) -> QuereusResult<ScalarExpr> {
        match expr {
            ast::Expr::Identifier(ident) => {
                // A select-list alias shadows nothing: it only resolves when
                // the name is not a real column.
                match scope.resolve(None, &ident.value) {
                    Ok(index) => Ok(ScalarExpr::column(index, ident.value.clone())),
                    Err(err) => match aliases.get(&ident.value.to_lowercase()) {
                        Some(aliased) => self.build_expr(aliased, scope),
                        None => Err(err),
                    },
                }
            }
            ast::Expr::CompoundIdentifier(idents) => {
                let (qualifier, name) = match idents.as_slice() {
                    [q, n] => (Some(q.value.as_str()), n.value.as_str()),
                    [n] => (None, n.value.as_str()),
                    _ => {
                        return Err(QuereusError::unsupported(
                            "nested compound identifiers",
                        ));
                    }
                };
                let index = scope.resolve(qualifier, name)?;
                Ok(ScalarExpr::column(index, name))
            }
            ast::Expr::Value(value) => Ok(self.build_value(value)?),
            ast::Expr::BinaryOp { left, op, right } => {
                let left = self.build_expr_with_aliases(left, scope, aliases)?;
                let right = self.build_expr_with_aliases(right, scope, aliases)?;
                Ok(ScalarExpr::Binary {
                    op: convert_binary_op(op)?,
                    left: Box::new(left),
                    right: Box::new(right),
                })
            }
            ast::Expr::UnaryOp { op, expr } => {
                let operand = Box::new(self.build_expr_with_aliases(expr, scope, aliases)?);
                match op {
                    ast::UnaryOperator::Minus => Ok(ScalarExpr::Unary {
                        op: UnaryOp::Neg,
                        operand,
                    }),
                    ast::UnaryOperator::Plus => Ok(*operand),
                    ast::UnaryOperator::Not => Ok(ScalarExpr::Unary {
                        op: UnaryOp::Not,
                        operand,
                    }),
                    other => Err(QuereusError::unsupported(format!("operator {other}"))),
                }
            }
            ast::Expr::Nested(inner) => self.build_expr_with_aliases(inner, scope, aliases),
            ast::Expr::IsNull(inner) => Ok(ScalarExpr::IsNull {
                operand: Box::new(self.build_expr_with_aliases(inner, scope, aliases)?),
                negated: false,
            }),
            ast::Expr::IsNotNull(inner) => Ok(ScalarExpr::IsNull {
                operand: Box::new(self.build_expr_with_aliases(inner, scope, aliases)?),
                negated: true,
            }),
            ast::Expr::InList {
                expr,
                list,
                negated,
            } => Ok(ScalarExpr::InList {
                expr: Box::new(self.build_expr_with_aliases(expr, scope, aliases)?),
                list: list
                    .iter()
                    .map(|e| self.build_expr_with_aliases(e, scope, aliases))
                    .collect::<QuereusResult<_>>()?,
                negated: *negated,
            }),
            ast::Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Ok(ScalarExpr::InSubquery {
                expr: Box::new(self.build_expr_with_aliases(expr, scope, aliases)?),
                subquery: Box::new(self.build_query(subquery)?),
                negated: *negated,
            }),
            ast::Expr::Subquery(subquery) => {
                Ok(ScalarExpr::Subquery(Box::new(self.build_query(subquery)?)))
            }
            ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Ok(ScalarExpr::Like {
                expr: Box::new(self.build_expr_with_aliases(expr, scope, aliases)?),
                pattern: Box::new(self.build_expr_with_aliases(pattern, scope, aliases)?),
                negated: *negated,
            }),
            ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                // x BETWEEN a AND b → x >= a AND x <= b
                let operand = self.build_expr_with_aliases(expr, scope, aliases)?;
                let low = self.build_expr_with_aliases(low, scope, aliases)?;
                let high = self.build_expr_with_aliases(high, scope, aliases)?;
                let range = ScalarExpr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(ScalarExpr::Binary {
                        op: BinaryOp::GtEq,
                        left: Box::new(operand.clone()),
                        right: Box::new(low),
                    }),
                    right: Box::new(ScalarExpr::Binary {
                        op: BinaryOp::LtEq,
                        left: Box::new(operand),
                        right: Box::new(high),
                    }),
                };
                if *negated {
                    Ok(ScalarExpr::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(range),
                    })
                } else {
                    Ok(range)
                }
            }
            ast::Expr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.build_expr_with_aliases(op, scope, aliases)?)),
                    None => None,
                };
                let branches = conditions
                    .iter()
                    .zip(results)
                    .map(|(when, then)| {
                        Ok((
                            self.build_expr_with_aliases(when, scope, aliases)?,
                            self.build_expr_with_aliases(then, scope, aliases)?,
                        ))
                    })
                    .collect::<QuereusResult<_>>()?;
                let otherwise = match else_result {
                    Some(e) => Some(Box::new(self.build_expr_with_aliases(e, scope, aliases)?)),
                    None => None,
                };
                Ok(ScalarExpr::Case {
                    operand,
                    branches,
                    otherwise,
                })
            }
            ast::Expr::Function(func) => {
                let name = func.name.to_string().to_lowercase();
                let args = self.build_function_args(&func.args, scope, aliases)?;
                Ok(ScalarExpr::FunctionCall { name, args })
            }
            other => Err(QuereusError::unsupported(format!("expression {other}"))),
        }
    }

    fn build_function_args(
        &mut self,
        args: &ast::FunctionArguments,
        scope: &Scope,
        aliases: &HashMap<String, ast::Expr>,
    ) -> QuereusResult<Vec<ScalarExpr>> {
        match args {
            ast::FunctionArguments::None => Ok(vec![]),
            ast::FunctionArguments::List(list) => {
                let mut out = Vec::with_capacity(list.args.len());
                for arg in &list.args {
                    match arg {
                        ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(expr)) => {
                            out.push(self.build_expr_with_aliases(expr, scope, aliases)?);
                        }
                        // count(*) takes no argument
                        ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard)
                        | ast::FunctionArg::Unnamed(ast::FunctionArgExpr::QualifiedWildcard(_)) => {}
                        other => {
                            return Err(QuereusError::unsupported(format!(
                                "function argument {other:?}"
                            )));
                        }
                    }
                }
                Ok(out)
            }
            ast::FunctionArguments::Subquery(_) => {
                Err(QuereusError::unsupported("subquery function arguments"))
            }
        }
    }

    fn build_value(&mut self, value: &ast::Value) -> QuereusResult<ScalarExpr> {
        Ok(match value {
            ast::Value::Number(text, _) => {
                if let Ok(i) = text.parse::<i64>() {
                    ScalarExpr::Literal(SqlValue::Integer(i))
                } else if let Ok(big) = text.parse::<num_bigint::BigInt>() {
                    ScalarExpr::Literal(SqlValue::BigInt(big))
                } else if let Ok(f) = text.parse::<f64>() {
                    ScalarExpr::Literal(SqlValue::Real(f))
                } else {
                    return Err(QuereusError::Parse {
                        message: format!("invalid numeric literal {text}"),
                        sql: text.clone(),
                    });
                }
            }
            ast::Value::SingleQuotedString(s) => ScalarExpr::Literal(SqlValue::Text(s.clone())),
            ast::Value::Boolean(b) => ScalarExpr::Literal(SqlValue::from_bool(*b)),
            ast::Value::Null => ScalarExpr::Literal(SqlValue::Null),
            ast::Value::HexStringLiteral(hex) => {
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..(i + 2).min(hex.len())], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| QuereusError::Parse {
                        message: format!("invalid blob literal x'{hex}'"),
                        sql: hex.clone(),
                    })?;
                ScalarExpr::Literal(SqlValue::Blob(bytes))
            }
            ast::Value::Placeholder(name) => {
                if name == "?" {
                    self.param_counter += 1;
                    ScalarExpr::Param(format!("?{}", self.param_counter))
                } else {
                    ScalarExpr::Param(name.clone())
                }
            }
            other => {
                return Err(QuereusError::unsupported(format!("literal {other:?}")));
            }
        })
    }

    fn extract_aggregates(
        &mut self,
        projection: &[ast::SelectItem],
        scope: &Scope,
    ) -> QuereusResult<Vec<AggregateExpr>> {
        let mut aggregates = Vec::new();
        for item in projection {
            let (expr, alias) = match item {
                ast::SelectItem::UnnamedExpr(expr) => (expr, None),
                ast::SelectItem::ExprWithAlias { expr, alias } => {
                    (expr, Some(alias.value.clone()))
                }
                _ => continue,
            };
            if let ast::Expr::Function(func) = expr {
                let name = func.name.to_string().to_lowercase();
                let arg_count = match &func.args {
                    ast::FunctionArguments::List(list) => list.args.len(),
                    _ => 0,
                };
                if self.ctx.schema.functions.aggregate(&name, arg_count.max(1)).is_some()
                    || self.ctx.schema.functions.aggregate(&name, 0).is_some()
                {
                    let args = self.build_function_args(&func.args, scope, &HashMap::new())?;
                    aggregates.push(AggregateExpr {
                        function: name,
                        args,
                        alias,
                    });
                }
            }
        }
        Ok(aggregates)
    }
}

// ===== helpers =====

fn split_object_name(name: &ast::ObjectName) -> (Option<String>, String) {
    let parts: Vec<String> = name.0.iter().map(|i| i.value.clone()).collect();
    match parts.as_slice() {
        [schema, object] => (Some(schema.clone()), object.clone()),
        [object] => (None, object.clone()),
        _ => (None, name.to_string()),
    }
}

fn statement_kind(statement: &Statement) -> String {
    format!("{statement:?}")
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .trim_end_matches(['(', '{'])
        .to_string()
}

fn extract_u64(expr: &ast::Expr) -> QuereusResult<u64> {
    match expr {
        ast::Expr::Value(ast::Value::Number(n, _)) => {
            n.parse::<u64>().map_err(|_| QuereusError::Type(format!(
                "LIMIT/OFFSET must be a non-negative integer, got {n}"
            )))
        }
        other => Err(QuereusError::unsupported(format!(
            "non-literal LIMIT/OFFSET {other}"
        ))),
    }
}

fn convert_binary_op(op: &ast::BinaryOperator) -> QuereusResult<BinaryOp> {
    Ok(match op {
        ast::BinaryOperator::Plus => BinaryOp::Add,
        ast::BinaryOperator::Minus => BinaryOp::Sub,
        ast::BinaryOperator::Multiply => BinaryOp::Mul,
        ast::BinaryOperator::Divide => BinaryOp::Div,
        ast::BinaryOperator::Modulo => BinaryOp::Mod,
        ast::BinaryOperator::StringConcat => BinaryOp::Concat,
        ast::BinaryOperator::Eq => BinaryOp::Eq,
        ast::BinaryOperator::NotEq => BinaryOp::NotEq,
        ast::BinaryOperator::Lt => BinaryOp::Lt,
        ast::BinaryOperator::LtEq => BinaryOp::LtEq,
        ast::BinaryOperator::Gt => BinaryOp::Gt,
        ast::BinaryOperator::GtEq => BinaryOp::GtEq,
        ast::BinaryOperator::And => BinaryOp::And,
        ast::BinaryOperator::Or => BinaryOp::Or,
        other => {
            return Err(QuereusError::unsupported(format!("operator {other}")));
        }
    })
}

fn projected_name(expr: &ScalarExpr) -> String {
    match expr {
        ScalarExpr::Column { name, .. } => name.clone(),
        ScalarExpr::FunctionCall { name, .. } => format!("{name}()"),
        ScalarExpr::Literal(value) => value.type_name().to_string(),
        _ => "expr".to_string(),
    }
}

fn group_column_name(expr: &ScalarExpr, position: usize) -> String {
    match expr {
        ScalarExpr::Column { name, .. } => name.clone(),
        _ => format!("group{}", position + 1),
    }
}

fn table_output_columns(table: &TableSchema) -> Vec<OutputColumn> {
    table
        .columns
        .iter()
        .map(|c| OutputColumn {
            name: c.name.clone(),
            logical_type: c.logical_type.clone(),
        })
        .collect()
}

/// Full-row expressions in table order; omitted columns become NULL.
fn full_row_exprs(
    table: &TableSchema,
    provided: &[usize],
    mut source_expr: impl FnMut(usize) -> ScalarExpr,
) -> Vec<(ScalarExpr, Option<String>)> {
    let mut exprs: Vec<(ScalarExpr, Option<String>)> = table
        .columns
        .iter()
        .map(|c| (ScalarExpr::Literal(SqlValue::Null), Some(c.name.clone())))
        .collect();
    for (source_pos, target_col) in provided.iter().enumerate() {
        exprs[*target_col].0 = source_expr(source_pos);
    }
    exprs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaManager;

    fn context() -> PlanningContext {
        let schema = Arc::new(SchemaManager::new());
        schema
            .register_table(TableSchema {
                name: "users".into(),
                schema_name: "main".into(),
                columns: vec![
                    ColumnSchema {
                        name: "id".into(),
                        logical_type: LogicalType::integer(),
                    },
                    ColumnSchema {
                        name: "name".into(),
                        logical_type: LogicalType::text().nullable(),
                    },
                ],
                primary_key: vec![KeyColumn::asc(0)],
                indexes: vec![],
                checks: vec![],
                is_view: false,
                module_name: "memory".into(),
                module_args: serde_json::Value::Null,
                estimated_rows: 100,
                version: 1,
                sql: None,
            })
            .unwrap();
        PlanningContext {
            schema,
            default_nullable: false,
            default_vtab_module: "memory".into(),
        }
    }

    fn plan_one(ctx: &PlanningContext, sql: &str) -> PlanNode {
        let statements = parse_sql(sql).unwrap();
        match PlanBuilder::new(ctx).build_statement(&statements[0]).unwrap() {
            BuiltStatement::Plan(plan) => plan,
            _ => panic!("expected a plan"),
        }
    }

    #[test]
    fn select_where_order_limit_shapes_the_tree() {
        let ctx = context();
        let plan = plan_one(
            &ctx,
            "SELECT name FROM users WHERE id >= 2 ORDER BY id LIMIT 10",
        );
        let PlanNode::Limit { input, limit, .. } = plan else {
            panic!("expected limit on top");
        };
        assert_eq!(limit, Some(10));
        let PlanNode::Project { input, output, .. } = *input else {
            panic!("expected projection under limit");
        };
        assert_eq!(output.columns[0].name, "name");
        assert!(matches!(*input, PlanNode::Sort { .. }));
    }

    #[test]
    fn unknown_column_is_resolve_error() {
        let ctx = context();
        let statements = parse_sql("SELECT wat FROM users").unwrap();
        let err = PlanBuilder::new(&ctx)
            .build_statement(&statements[0])
            .unwrap_err();
        assert!(matches!(err, QuereusError::Resolve { kind: "column", .. }));
    }

    #[test]
    fn insert_values_widen_to_table_arity() {
        let ctx = context();
        let plan = plan_one(&ctx, "INSERT INTO users (id) VALUES (1), (2)");
        let PlanNode::Insert { source, .. } = plan else {
            panic!("expected insert");
        };
        let PlanNode::Values { rows, output } = *source else {
            panic!("expected values source");
        };
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        assert!(matches!(rows[0][1], ScalarExpr::Literal(SqlValue::Null)));
        assert_eq!(output.arity(), 2);
    }

    #[test]
    fn aggregate_query_builds_aggregate_node() {
        let ctx = context();
        let plan = plan_one(&ctx, "SELECT count(*) FROM users");
        assert!(matches!(plan, PlanNode::Aggregate { .. }));
    }

    #[test]
    fn update_builds_scan_filter_source() {
        let ctx = context();
        let plan = plan_one(&ctx, "UPDATE users SET name = 'x' WHERE id = 3");
        let PlanNode::Update {
            assignments,
            source,
            ..
        } = plan
        else {
            panic!("expected update");
        };
        assert_eq!(assignments[0].0, 1);
        assert!(matches!(*source, PlanNode::Filter { .. }));
    }

    #[test]
    fn create_table_requires_primary_key() {
        let ctx = context();
        let statements = parse_sql("CREATE TABLE nopk (x INTEGER)").unwrap();
        let err = PlanBuilder::new(&ctx)
            .build_statement(&statements[0])
            .unwrap_err();
        assert!(matches!(err, QuereusError::Unsupported { .. }));
    }

    #[test]
    fn create_table_collects_pk_and_checks() {
        let ctx = context();
        let statements = parse_sql(
            "CREATE TABLE t (a INTEGER PRIMARY KEY, b TEXT, CHECK (a > 0))",
        )
        .unwrap();
        let BuiltStatement::CreateTable { schema, .. } = PlanBuilder::new(&ctx)
            .build_statement(&statements[0])
            .unwrap()
        else {
            panic!("expected create table");
        };
        assert_eq!(schema.primary_key, vec![KeyColumn::asc(0)]);
        assert_eq!(schema.checks.len(), 1);
        assert!(!schema.columns[0].logical_type.nullable);
    }

    #[test]
    fn positional_params_are_numbered() {
        let ctx = context();
        let plan = plan_one(&ctx, "SELECT * FROM users WHERE id = ? AND name = ?");
        let PlanNode::Project { input, .. } = plan else {
            panic!("expected project");
        };
        let PlanNode::Filter { predicate, .. } = *input else {
            panic!("expected filter");
        };
        let mut names = Vec::new();
        collect_params(&predicate, &mut names);
        assert_eq!(names, vec!["?1", "?2"]);
    }

    fn collect_params(expr: &ScalarExpr, out: &mut Vec<String>) {
        match expr {
            ScalarExpr::Param(name) => out.push(name.clone()),
            ScalarExpr::Binary { left, right, .. } => {
                collect_params(left, out);
                collect_params(right, out);
            }
            _ => {}
        }
    }

    #[test]
    fn join_scope_concatenates_and_condition_resolves() {
        let ctx = context();
        ctx.schema
            .register_table(TableSchema {
                name: "orders".into(),
                schema_name: "main".into(),
                columns: vec![
                    ColumnSchema {
                        name: "oid".into(),
                        logical_type: LogicalType::integer(),
                    },
                    ColumnSchema {
                        name: "user_id".into(),
                        logical_type: LogicalType::integer(),
                    },
                ],
                primary_key: vec![KeyColumn::asc(0)],
                indexes: vec![],
                checks: vec![],
                is_view: false,
                module_name: "memory".into(),
                module_args: serde_json::Value::Null,
                estimated_rows: 10,
                version: 1,
                sql: None,
            })
            .unwrap();
        let plan = plan_one(
            &ctx,
            "SELECT users.name, orders.oid FROM users JOIN orders ON users.id = orders.user_id",
        );
        let PlanNode::Project { input, output, .. } = plan else {
            panic!("expected project");
        };
        assert_eq!(output.arity(), 2);
        assert!(matches!(*input, PlanNode::NestedLoopJoin { .. }));
    }
}

/// Cheap recursive cost/row estimate used only for greedy join ordering.
/// Cross joins keep selectivity 1.0; equality conditions use 0.1.
fn estimate(plan: &PlanNode) -> (f64, f64) {
    match plan {
        PlanNode::TableScan { table, .. } => {
            let rows = (table.estimated_rows.max(1)) as f64;
            (10.0 * rows, rows)
        }
        PlanNode::Filter { input, predicate } => {
            let (cost, rows) = estimate(input);
            let selectivity = if is_equality(predicate) { 0.1 } else { 0.33 };
            (cost, (rows * selectivity).max(1.0))
        }
        PlanNode::Project { input, .. }
        | PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. } => estimate(input),
        PlanNode::NestedLoopJoin {
            outer,
            inner,
            condition,
            ..
        } => {
            let (outer_cost, outer_rows) = estimate(outer);
            let (inner_cost, inner_rows) = estimate(inner);
            let selectivity = match condition {
                Some(cond) if is_equality(cond) => 0.1,
                Some(_) => 0.33,
                None => 1.0,
            };
            (
                outer_cost + outer_rows * inner_cost,
                (outer_rows * inner_rows * selectivity).max(1.0),
            )
        }
        PlanNode::Values { rows, .. } => (rows.len() as f64, rows.len() as f64),
        PlanNode::SingleRow => (1.0, 1.0),
        PlanNode::Aggregate { input, .. } => {
            let (cost, rows) = estimate(input);
            (cost + rows, rows.sqrt().max(1.0))
        }
        PlanNode::TvfCall { .. } => (100.0, 25.0),
        PlanNode::Insert { source, .. }
        | PlanNode::Update { source, .. }
        | PlanNode::Delete { source, .. } => estimate(source),
        PlanNode::Block { statements } => statements
            .iter()
            .map(estimate)
            .fold((0.0, 0.0), |(c, _), (sc, sr)| (c + sc, sr)),
    }
}

fn is_equality(expr: &ScalarExpr) -> bool {
    matches!(
        expr,
        ScalarExpr::Binary {
            op: BinaryOp::Eq,
            ..
        }
    )
}
