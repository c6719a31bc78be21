use std::sync::Arc;

use crate::schema::{CollationRegistry, ColumnSchema, KeyColumn, SchemaManager, TableSchema};
use crate::sql::planner::types::{BinaryOp, PlanNode, ScalarExpr};
use crate::sql::planner::{BuiltStatement, PlanBuilder, PlanningContext, parse_sql};
use crate::storage::MemoryStoreProvider;
use crate::types::{LogicalType, SqlValue};
use crate::vtab::module::{ConflictPolicy, DmlOp, UpdateArgs, VtabModule};
use crate::vtab::store::StoreModule;

use super::{Optimizer, OptimizerContext};

struct Fixture {
    schema: Arc<SchemaManager>,
    module: Arc<StoreModule>,
    planning: PlanningContext,
}

fn fixture() -> Fixture {
    let schema = Arc::new(SchemaManager::new());
    let module = Arc::new(StoreModule::new(
        Arc::new(MemoryStoreProvider::new()),
        Arc::clone(&schema.collations),
    ));
    let table = schema
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
            estimated_rows: 1000,
            version: 1,
            sql: None,
        })
        .unwrap();
    let instance = module.create(Arc::clone(&table)).unwrap();
    for id in 1..=3i64 {
        instance
            .update(UpdateArgs {
                op: DmlOp::Insert,
                values: Some(vec![SqlValue::Integer(id), SqlValue::Text(format!("u{id}"))]),
                old_key_values: None,
                on_conflict: ConflictPolicy::Abort,
            })
            .unwrap();
    }
    Fixture {
        planning: PlanningContext {
            schema: Arc::clone(&schema),
            default_nullable: false,
            default_vtab_module: "memory".into(),
        },
        schema,
        module,
    }
}

fn optimizer_ctx(fixture: &Fixture, validate: bool) -> OptimizerContext {
    let module = Arc::clone(&fixture.module);
    let schema = Arc::clone(&fixture.schema);
    OptimizerContext {
        resolve_table: Arc::new(move |table: &TableSchema| {
            let current = schema.lookup_table(Some(&table.schema_name), &table.name)?;
            module.connect(current)
        }),
        validate,
    }
}

fn plan(fixture: &Fixture, sql: &str) -> PlanNode {
    let statements = parse_sql(sql).unwrap();
    match PlanBuilder::new(&fixture.planning)
        .build_statement(&statements[0])
        .unwrap()
    {
        BuiltStatement::Plan(plan) => plan,
        _ => panic!("expected plan"),
    }
}

fn optimize(fixture: &Fixture, sql: &str) -> PlanNode {
    let ctx = optimizer_ctx(fixture, true);
    Optimizer::new().optimize(plan(fixture, sql), &ctx).unwrap()
}

fn find_scan(plan: &PlanNode) -> Option<&PlanNode> {
    match plan {
        PlanNode::TableScan { .. } => Some(plan),
        PlanNode::Filter { input, .. }
        | PlanNode::Project { input, .. }
        | PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. }
        | PlanNode::Aggregate { input, .. } => find_scan(input),
        PlanNode::NestedLoopJoin { outer, inner, .. } => {
            find_scan(outer).or_else(|| find_scan(inner))
        }
        PlanNode::Insert { source, .. }
        | PlanNode::Update { source, .. }
        | PlanNode::Delete { source, .. } => find_scan(source),
        _ => None,
    }
}

fn has_filter(plan: &PlanNode) -> bool {
    match plan {
        PlanNode::Filter { .. } => true,
        PlanNode::Project { input, .. }
        | PlanNode::Sort { input, .. }
        | PlanNode::Limit { input, .. }
        | PlanNode::Aggregate { input, .. } => has_filter(input),
        _ => false,
    }
}

#[test]
fn equality_filter_is_absorbed_by_the_scan() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT name FROM users WHERE id = 2");
    let scan = find_scan(&optimized).expect("scan survives");
    let PlanNode::TableScan { access, pushed, .. } = scan else {
        unreachable!()
    };
    let access = access.as_ref().expect("access plan resolved");
    assert!(access.is_set);
    assert_eq!(pushed.len(), 1);
    // the handled conjunct no longer needs a Filter node
    assert!(!has_filter(&optimized));
}

#[test]
fn sort_on_pk_prefix_is_elided() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT id FROM users WHERE id >= 2 ORDER BY id");
    fn has_sort(plan: &PlanNode) -> bool {
        match plan {
            PlanNode::Sort { .. } => true,
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Limit { input, .. } => has_sort(input),
            _ => false,
        }
    }
    assert!(!has_sort(&optimized), "pk-order sort should be removed:\n{}", optimized.explain());
}

#[test]
fn sort_on_non_key_column_survives() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT id FROM users ORDER BY name");
    fn has_sort(plan: &PlanNode) -> bool {
        match plan {
            PlanNode::Sort { .. } => true,
            PlanNode::Filter { input, .. }
            | PlanNode::Project { input, .. }
            | PlanNode::Limit { input, .. } => has_sort(input),
            _ => false,
        }
    }
    assert!(has_sort(&optimized));
}

#[test]
fn constant_true_filter_disappears() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT id FROM users WHERE 1 = 1");
    assert!(!has_filter(&optimized));
}

#[test]
fn constant_false_filter_empties_the_relation() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT id FROM users WHERE 1 = 2");
    fn has_empty_values(plan: &PlanNode) -> bool {
        match plan {
            PlanNode::Values { rows, .. } => rows.is_empty(),
            PlanNode::Project { input, .. }
            | PlanNode::Filter { input, .. }
            | PlanNode::Sort { input, .. }
            | PlanNode::Limit { input, .. } => has_empty_values(input),
            _ => false,
        }
    }
    assert!(has_empty_values(&optimized), "{}", optimized.explain());
}

#[test]
fn non_pushable_predicate_stays_in_a_filter() {
    let fixture = fixture();
    let optimized = optimize(&fixture, "SELECT id FROM users WHERE id = id");
    // id = id references a column on both sides; nothing to push
    assert!(has_filter(&optimized));
}

#[test]
fn optimizer_reaches_fixed_point_twice() {
    let fixture = fixture();
    let ctx = optimizer_ctx(&fixture, true);
    let optimizer = Optimizer::new();
    let once = optimizer
        .optimize(plan(&fixture, "SELECT name FROM users WHERE id = 2"), &ctx)
        .unwrap();
    let twice = optimizer.optimize(once.clone(), &ctx).unwrap();
    assert_eq!(format!("{once:?}"), format!("{twice:?}"));
}

#[test]
fn validator_rejects_out_of_scope_columns() {
    let bad = PlanNode::Filter {
        input: Box::new(PlanNode::SingleRow),
        predicate: ScalarExpr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(ScalarExpr::column(3, "ghost")),
            right: Box::new(ScalarExpr::Literal(SqlValue::Integer(1))),
        },
    };
    assert!(super::validate_plan(&bad).is_err());
}

#[test]
fn sort_keys_survive_optimization_with_projection() {
    let fixture = fixture();
    // name is not the pk; sort stays and projection sits above it
    let optimized = optimize(&fixture, "SELECT name FROM users ORDER BY name");
    let PlanNode::Project { input, .. } = &optimized else {
        panic!("projection on top: {}", optimized.explain());
    };
    assert!(matches!(**input, PlanNode::Sort { .. }));
}
