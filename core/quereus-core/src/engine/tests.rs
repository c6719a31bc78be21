//! End-to-end engine tests: the full pipeline from SQL text through the
//! planner, optimizer, scheduler and the KV-backed table module.

use std::sync::Arc;

use crate::error::QuereusError;
use crate::types::SqlValue;

use super::database::Database;

fn db_with_users() -> Arc<Database> {
    let db = Database::new();
    db.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", ())
        .unwrap();
    db.exec(
        "INSERT INTO users VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Carol')",
        (),
    )
    .unwrap();
    db
}

fn all(db: &Arc<Database>, sql: &str) -> Vec<Vec<SqlValue>> {
    db.eval(sql, ()).unwrap().map(|r| r.unwrap()).collect()
}

// Point lookup and range scan: equality access must find exactly Bob, the
// range scan must exclude id=1 and come back in pk order.
#[test]
fn point_lookup_and_range_scan() {
    let db = db_with_users();
    assert_eq!(
        all(&db, "SELECT name FROM users WHERE id = 2"),
        vec![vec![SqlValue::Text("Bob".into())]]
    );
    assert_eq!(
        all(&db, "SELECT id FROM users WHERE id >= 2 ORDER BY id"),
        vec![vec![SqlValue::Integer(2)], vec![SqlValue::Integer(3)]]
    );
}

#[test]
fn planner_chooses_equality_then_range_access() {
    let db = db_with_users();
    let point = db.prepare("SELECT name FROM users WHERE id = 2");
    assert!(point.explain().unwrap().contains("equality seek"));
    let range = db.prepare("SELECT id FROM users WHERE id >= 2 ORDER BY id");
    assert!(range.explain().unwrap().contains("range scan"));
}

// Secondary index under NOCASE: case-folded equality through the index,
// before and after an update and a delete.
#[test]
fn secondary_index_with_nocase_collation() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT COLLATE NOCASE)",
        (),
    )
    .unwrap();
    db.exec(
        "INSERT INTO users VALUES (1, 'alice'), (2, 'bob'), (3, 'alice')",
        (),
    )
    .unwrap();
    db.exec("CREATE INDEX ix_name ON users (name)", ()).unwrap();
    db.exec("UPDATE users SET name = 'ALICE' WHERE id = 3", ())
        .unwrap();

    let ids = all(&db, "SELECT id FROM users WHERE name = 'alice' ORDER BY id");
    assert_eq!(ids, vec![vec![SqlValue::Integer(1)], vec![SqlValue::Integer(3)]]);

    db.exec("DELETE FROM users WHERE id = 1", ()).unwrap();
    let ids = all(&db, "SELECT id FROM users WHERE name = 'alice'");
    assert_eq!(ids, vec![vec![SqlValue::Integer(3)]]);
}

// Implicit transaction rollback: the second insert violates the pk, so the
// whole batch rolls back and the table stays empty.
#[test]
fn implicit_transaction_rolls_back_the_batch() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER)",
        (),
    )
    .unwrap();
    let err = db
        .exec(
            "INSERT INTO accounts VALUES (1, 100); INSERT INTO accounts VALUES (1, 200);",
            (),
        )
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    assert_eq!(
        all(&db, "SELECT count(*) FROM accounts"),
        vec![vec![SqlValue::Integer(0)]]
    );
}

// Savepoint rollback keeps work up to the mark and discards the rest.
#[test]
fn savepoint_rollback_inside_a_transaction() {
    let db = Database::new();
    db.exec("CREATE TABLE t (k INTEGER PRIMARY KEY, v INTEGER)", ())
        .unwrap();
    db.exec(
        "BEGIN; \
         INSERT INTO t VALUES (1, 10); SAVEPOINT a; \
         INSERT INTO t VALUES (2, 20); SAVEPOINT b; \
         INSERT INTO t VALUES (3, 30); ROLLBACK TO b; COMMIT;",
        (),
    )
    .unwrap();
    assert_eq!(
        all(&db, "SELECT k, v FROM t ORDER BY k"),
        vec![
            vec![SqlValue::Integer(1), SqlValue::Integer(10)],
            vec![SqlValue::Integer(2), SqlValue::Integer(20)],
        ]
    );
}

#[test]
fn explicit_rollback_discards_everything() {
    let db = db_with_users();
    db.exec("BEGIN; DELETE FROM users; ROLLBACK;", ()).unwrap();
    assert_eq!(
        all(&db, "SELECT count(*) FROM users"),
        vec![vec![SqlValue::Integer(3)]]
    );
}

// A plan captured at preparation time notices a drop/recreate of its table
// at execution start.
#[test]
fn stale_captured_schema_is_rejected() {
    let db = Database::new();
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY)", ()).unwrap();
    let statement = db.prepare("SELECT id FROM t");
    assert_eq!(statement.query_all(()).unwrap().len(), 0);

    db.exec("DROP TABLE t", ()).unwrap();
    db.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, extra TEXT)", ())
        .unwrap();

    let err = statement.query(()).unwrap_err();
    assert!(
        err.to_string()
            .contains("Table main.t was dropped after query was planned"),
        "unexpected error: {err}"
    );
}

#[test]
fn aggregates_group_and_count() {
    let db = Database::new();
    db.exec("CREATE TABLE orders (id INTEGER PRIMARY KEY, who TEXT, total INTEGER)", ())
        .unwrap();
    db.exec(
        "INSERT INTO orders VALUES (1, 'a', 10), (2, 'a', 20), (3, 'b', 5)",
        (),
    )
    .unwrap();
    let rows = all(
        &db,
        "SELECT who, count(*), sum(total) FROM orders GROUP BY who ORDER BY who",
    );
    assert_eq!(
        rows,
        vec![
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Integer(2),
                SqlValue::Integer(30)
            ],
            vec![
                SqlValue::Text("b".into()),
                SqlValue::Integer(1),
                SqlValue::Integer(5)
            ],
        ]
    );
}

#[test]
fn joins_combine_rows_in_outer_order() {
    let db = db_with_users();
    db.exec(
        "CREATE TABLE pets (pid INTEGER PRIMARY KEY, owner INTEGER, species TEXT)",
        (),
    )
    .unwrap();
    db.exec(
        "INSERT INTO pets VALUES (1, 1, 'cat'), (2, 1, 'dog'), (3, 3, 'fish')",
        (),
    )
    .unwrap();
    let rows = all(
        &db,
        "SELECT users.name, pets.species FROM users \
         JOIN pets ON users.id = pets.owner ORDER BY pets.pid",
    );
    assert_eq!(
        rows,
        vec![
            vec![SqlValue::Text("Alice".into()), SqlValue::Text("cat".into())],
            vec![SqlValue::Text("Alice".into()), SqlValue::Text("dog".into())],
            vec![SqlValue::Text("Carol".into()), SqlValue::Text("fish".into())],
        ]
    );
}

#[test]
fn left_join_pads_missing_inner_side() {
    let db = db_with_users();
    db.exec(
        "CREATE TABLE pets (pid INTEGER PRIMARY KEY, owner INTEGER, species TEXT)",
        (),
    )
    .unwrap();
    db.exec("INSERT INTO pets VALUES (1, 1, 'cat')", ()).unwrap();
    let rows = all(
        &db,
        "SELECT users.id, pets.species FROM users \
         LEFT JOIN pets ON users.id = pets.owner ORDER BY users.id",
    );
    assert_eq!(
        rows,
        vec![
            vec![SqlValue::Integer(1), SqlValue::Text("cat".into())],
            vec![SqlValue::Integer(2), SqlValue::Null],
            vec![SqlValue::Integer(3), SqlValue::Null],
        ]
    );
}

#[test]
fn parameters_bind_positionally() {
    let db = db_with_users();
    let rows: Vec<_> = db
        .eval(
            "SELECT name FROM users WHERE id = ?",
            vec![SqlValue::Integer(3)],
        )
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(rows, vec![vec![SqlValue::Text("Carol".into())]]);
}

#[test]
fn update_and_delete_report_affected_rows() {
    let db = db_with_users();
    let affected = db
        .exec("UPDATE users SET name = 'X' WHERE id >= 2", ())
        .unwrap();
    assert_eq!(affected, 2);
    let affected = db.exec("DELETE FROM users WHERE id = 1", ()).unwrap();
    assert_eq!(affected, 1);
    assert_eq!(
        all(&db, "SELECT count(*) FROM users"),
        vec![vec![SqlValue::Integer(2)]]
    );
}

#[test]
fn failed_single_dml_statement_leaves_no_partial_rows() {
    let db = Database::new();
    db.exec("CREATE TABLE t (k INTEGER PRIMARY KEY, v INTEGER)", ())
        .unwrap();
    db.exec("INSERT INTO t VALUES (5, 0)", ()).unwrap();
    // The multi-row insert hits the existing pk midway; the statement's
    // implicit transaction rolls the earlier rows back.
    let err = db
        .exec("INSERT INTO t VALUES (1, 1), (5, 5), (9, 9)", ())
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    assert_eq!(
        all(&db, "SELECT count(*) FROM t"),
        vec![vec![SqlValue::Integer(1)]]
    );
}

#[test]
fn not_null_violations_surface_as_constraint() {
    let db = Database::new();
    db.exec("CREATE TABLE t (k INTEGER PRIMARY KEY, v INTEGER)", ())
        .unwrap();
    let err = db.exec("INSERT INTO t VALUES (1, NULL)", ()).unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
}

#[test]
fn check_constraints_are_enforced() {
    let db = Database::new();
    db.exec(
        "CREATE TABLE t (k INTEGER PRIMARY KEY, v INTEGER, CHECK (v > 0))",
        (),
    )
    .unwrap();
    db.exec("INSERT INTO t VALUES (1, 5)", ()).unwrap();
    let err = db.exec("INSERT INTO t VALUES (2, -1)", ()).unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
}

#[test]
fn scalar_functions_and_expressions() {
    let db = db_with_users();
    assert_eq!(
        all(&db, "SELECT upper(name) FROM users WHERE id = 1"),
        vec![vec![SqlValue::Text("ALICE".into())]]
    );
    assert_eq!(
        all(&db, "SELECT 1 + 2 * 3"),
        vec![vec![SqlValue::Integer(7)]]
    );
}

#[test]
fn limit_and_offset_apply_after_ordering() {
    let db = db_with_users();
    assert_eq!(
        all(&db, "SELECT id FROM users ORDER BY id LIMIT 1 OFFSET 1"),
        vec![vec![SqlValue::Integer(2)]]
    );
}

#[test]
fn drop_table_removes_catalog_and_data() {
    let db = db_with_users();
    db.exec("DROP TABLE users", ()).unwrap();
    assert!(matches!(
        db.eval("SELECT * FROM users", ()),
        Err(QuereusError::Resolve { .. })
    ));
    // DROP IF EXISTS of a missing table is fine
    db.exec("DROP TABLE IF EXISTS users", ()).unwrap();
}

#[test]
fn custom_scalar_function_registration() {
    let db = db_with_users();
    db.create_scalar_function(
        "shout",
        1,
        Arc::new(|args| {
            Ok(match &args[0] {
                SqlValue::Text(t) => SqlValue::Text(format!("{}!", t.to_uppercase())),
                other => other.clone(),
            })
        }),
    );
    assert_eq!(
        all(&db, "SELECT shout(name) FROM users WHERE id = 2"),
        vec![vec![SqlValue::Text("BOB!".into())]]
    );
}

#[test]
fn in_list_and_like_predicates() {
    let db = db_with_users();
    assert_eq!(
        all(&db, "SELECT id FROM users WHERE id IN (1, 3) ORDER BY id"),
        vec![vec![SqlValue::Integer(1)], vec![SqlValue::Integer(3)]]
    );
    assert_eq!(
        all(&db, "SELECT id FROM users WHERE name LIKE 'a%'"),
        vec![vec![SqlValue::Integer(1)]]
    );
}

#[test]
fn subqueries_evaluate_uncorrelated() {
    let db = db_with_users();
    assert_eq!(
        all(
            &db,
            "SELECT name FROM users WHERE id IN (SELECT id FROM users WHERE id >= 3)"
        ),
        vec![vec![SqlValue::Text("Carol".into())]]
    );
}

#[test]
fn statement_finalize_is_idempotent() {
    let db = db_with_users();
    let statement = db.prepare("SELECT id FROM users");
    statement.query_all(()).unwrap();
    statement.finalize();
    statement.finalize();
    assert!(matches!(
        statement.query(()),
        Err(QuereusError::Misuse(_))
    ));
}

#[test]
fn closed_database_rejects_work() {
    let db = db_with_users();
    db.close().unwrap();
    db.close().unwrap(); // idempotent
    assert!(matches!(
        db.exec("SELECT 1", ()),
        Err(QuereusError::Misuse(_))
    ));
}

#[test]
fn runtime_stats_option_runs_queries_with_metrics() {
    let db = db_with_users();
    db.set_option("runtime_stats", serde_json::Value::Bool(true))
        .unwrap();
    db.set_option("validate_plan", serde_json::Value::Bool(true))
        .unwrap();
    assert_eq!(all(&db, "SELECT count(*) FROM users").len(), 1);
}

#[test]
fn values_without_from() {
    let db = Database::new();
    assert_eq!(
        all(&db, "SELECT 40 + 2"),
        vec![vec![SqlValue::Integer(42)]]
    );
}

#[test]
fn nested_transaction_begin_is_misuse() {
    let db = db_with_users();
    db.begin_transaction().unwrap();
    assert!(matches!(
        db.begin_transaction(),
        Err(QuereusError::Misuse(_))
    ));
    db.rollback().unwrap();
    assert!(matches!(db.commit(), Err(QuereusError::Misuse(_))));
}
