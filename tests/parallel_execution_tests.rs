//! Parallel subquery fan-out must be a pure scheduling choice: identical
//! result multisets with the pool on, off, or sized arbitrarily.

mod common;

use common::*;
use tetrad::query::builders::*;
use tetrad::query::Query;
use tetrad::value::{Identity, Keyword};
use tetrad::{MemoryStore, QueryError, QueryInput, QueryOptions, Value};

const ROWS: i64 = 500;

fn numbers_store() -> MemoryStore {
    let store = MemoryStore::new();
    let num = Keyword::intern(":num");
    let facts: Vec<_> = (0..ROWS)
        .map(|i| (Identity::of(&format!("n{i}")), num, Value::Int64(i)))
        .collect();
    store.assert_facts(facts).expect("assert");
    store
}

/// Pipe an input relation of entities through a per-row subquery that
/// looks each entity's number up.
fn fanout_query() -> Query {
    let nested = query()
        .find_var("?y")
        .in_db()
        .in_scalar("?ent")
        .where_pattern(var("?ent"), kw(":num"), var("?y"))
        .build();
    query()
        .find_var("?x")
        .find_var("?y")
        .in_db()
        .in_relation(["?x"])
        .where_pattern(var("?x"), kw(":num"), blank())
        .where_subquery(nested, [sq_db(), sq_var("?x")], bind_relation(["?y"]))
        .build()
}

fn input_rows() -> Vec<QueryInput> {
    let rows: Vec<Vec<Value>> = (0..ROWS)
        .map(|i| vec![id_val(&format!("n{i}"))])
        .collect();
    vec![QueryInput::Database, QueryInput::Relation(rows)]
}

fn per_row_options(workers: usize) -> QueryOptions {
    QueryOptions {
        parallel_subqueries: workers,
        // Force the per-row path so the pool actually runs.
        enable_decorrelation: false,
        enable_correlated_aggregate_rewrite: false,
        ..QueryOptions::default()
    }
}

#[test]
fn test_parallel_equals_sequential() {
    let store = numbers_store();
    let sequential = run_sorted(&store, &fanout_query(), &input_rows(), per_row_options(0));
    let parallel = run_sorted(&store, &fanout_query(), &input_rows(), per_row_options(8));
    assert_eq!(sequential.len(), ROWS as usize);
    assert_eq!(sequential, parallel);
}

#[test]
fn test_parallel_equals_decorrelated() {
    let store = numbers_store();
    let parallel = run_sorted(&store, &fanout_query(), &input_rows(), per_row_options(8));
    let decorrelated = run_sorted(
        &store,
        &fanout_query(),
        &input_rows(),
        QueryOptions::default(),
    );
    assert_eq!(parallel, decorrelated);
}

#[test]
fn test_single_worker_pool() {
    let store = numbers_store();
    let one = run_sorted(&store, &fanout_query(), &input_rows(), per_row_options(1));
    let many = run_sorted(&store, &fanout_query(), &input_rows(), per_row_options(4));
    assert_eq!(one, many);
}

#[test]
fn test_worker_error_surfaces_once() {
    // Division by zero inside the nested query must abort the fan-out and
    // surface as the query error.
    let store = numbers_store();
    let nested = query()
        .find_var("?z")
        .in_db()
        .in_scalar("?ent")
        .where_pattern(var("?ent"), kw(":num"), var("?y"))
        .where_expr(
            tetrad::query::ExprOp::Div,
            [alit(100i64), avar("?y")],
            "?z",
        )
        .build();
    let q = query()
        .find_var("?x")
        .find_var("?z")
        .in_db()
        .in_relation(["?x"])
        .where_pattern(var("?x"), kw(":num"), blank())
        .where_subquery(nested, [sq_db(), sq_var("?x")], bind_relation(["?z"]))
        .build();
    let engine = tetrad::Engine::new();
    let ctx = tetrad::QueryContext::new(per_row_options(8));
    let snapshot = snapshot_of(&store);
    let result = engine
        .query(&snapshot, &q, &input_rows(), &ctx)
        .and_then(tetrad::Relation::into_tuples);
    assert!(matches!(result, Err(QueryError::DivideByZero { .. })));
}
