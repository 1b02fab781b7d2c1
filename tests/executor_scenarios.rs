//! End-to-end query scenarios: patterns, joins, filters, aggregates,
//! inputs, and the documented boundary cases.

mod common;

use common::*;
use tetrad::query::builders::*;
use tetrad::query::{AggregateOp, CompareOp, ExprOp, SortOrder, StrTest};
use tetrad::value::{Identity, Keyword};
use tetrad::{
    Engine, MemoryStore, QueryContext, QueryError, QueryInput, QueryOptions, Tuple, Value,
};

#[test]
fn test_simple_pattern_join() {
    let q = query()
        .find_var("?n")
        .find_var("?g")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(
        rows,
        vec![
            Tuple(vec![str_val("Alice"), Value::Int64(30)]),
            Tuple(vec![str_val("Bob"), Value::Int64(25)]),
        ]
    );
}

#[test]
fn test_join_through_constant_entity() {
    let store = people_store();
    store
        .assert_facts(vec![(
            Identity::of("a"),
            Keyword::intern(":friend"),
            id_val("b"),
        )])
        .expect("assert");
    let q = query()
        .find_var("?fn")
        .where_pattern(lit(id_val("a")), kw(":friend"), var("?f"))
        .where_pattern(var("?f"), kw(":name"), var("?fn"))
        .build();
    let rows = run_sorted(&store, &q, &[], QueryOptions::default());
    assert_eq!(rows, vec![Tuple(vec![str_val("Bob")])]);
}

#[test]
fn test_grouped_average_is_float() {
    let store = MemoryStore::new();
    let dept = Keyword::intern(":dept");
    let salary = Keyword::intern(":salary");
    store
        .assert_facts(vec![
            (Identity::of("p1"), dept, str_val("eng")),
            (Identity::of("p1"), salary, Value::Int64(100)),
            (Identity::of("p2"), dept, str_val("eng")),
            (Identity::of("p2"), salary, Value::Int64(120)),
            (Identity::of("p3"), dept, str_val("ops")),
            (Identity::of("p3"), salary, Value::Int64(90)),
        ])
        .expect("assert");
    let q = query()
        .find_var("?d")
        .find_agg(AggregateOp::Avg, "?s")
        .where_pattern(var("?e"), kw(":dept"), var("?d"))
        .where_pattern(var("?e"), kw(":salary"), var("?s"))
        .build();
    let rows = run_sorted(&store, &q, &[], QueryOptions::default());
    assert_eq!(
        rows,
        vec![
            Tuple(vec![str_val("eng"), Value::Float64(110.0)]),
            Tuple(vec![str_val("ops"), Value::Float64(90.0)]),
        ]
    );
}

#[test]
fn test_predicate_filters() {
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_compare(CompareOp::Gt, [avar("?g"), alit(26i64)])
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(rows, vec![Tuple(vec![str_val("Alice")])]);
}

#[test]
fn test_string_predicate() {
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_str(StrTest::StartsWith, [avar("?n"), alit("Al")])
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(rows, vec![Tuple(vec![str_val("Alice")])]);
}

#[test]
fn test_numeric_cross_type_comparison() {
    // 5 == 5.0 is true; 5 < 5.000001 is true.
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_compare(CompareOp::Eq, [avar("?g"), alit(25.0f64)])
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(rows, vec![Tuple(vec![str_val("Bob")])]);

    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_compare(CompareOp::Lt, [avar("?g"), alit(25.000001f64)])
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(rows, vec![Tuple(vec![str_val("Bob")])]);
}

#[test]
fn test_expression_binds_new_column() {
    let q = query()
        .find_var("?n")
        .find_var("?next")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_expr(ExprOp::Add, [avar("?g"), alit(1i64)], "?next")
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert_eq!(
        rows,
        vec![
            Tuple(vec![str_val("Alice"), Value::Int64(31)]),
            Tuple(vec![str_val("Bob"), Value::Int64(26)]),
        ]
    );
}

#[test]
fn test_division_by_zero_is_fatal() {
    let store = people_store();
    let q = query()
        .find_var("?x")
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_expr(ExprOp::Div, [avar("?g"), alit(0i64)], "?x")
        .build();
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let snapshot = snapshot_of(&store);
    let result = engine
        .query(&snapshot, &q, &[], &ctx)
        .and_then(tetrad::Relation::into_tuples);
    assert!(matches!(result, Err(QueryError::DivideByZero { .. })));
}

#[test]
fn test_aggregate_over_empty_group() {
    // count = 0, sum/min/max/avg = null.
    let store = MemoryStore::new();
    store
        .assert_facts(vec![(
            Identity::of("x"),
            Keyword::intern(":unrelated"),
            Value::Int64(1),
        )])
        .expect("assert");
    let q = query()
        .find_agg(AggregateOp::Count, "?v")
        .find_agg(AggregateOp::Sum, "?v")
        .find_agg(AggregateOp::Max, "?v")
        .where_pattern(var("?e"), kw(":value"), var("?v"))
        .build();
    let rows = run_sorted(&store, &q, &[], QueryOptions::default());
    assert_eq!(
        rows,
        vec![Tuple(vec![Value::Int64(0), Value::Null, Value::Null])]
    );
}

#[test]
fn test_empty_relation_input_yields_empty_result() {
    let q = query()
        .find_var("?n")
        .in_db()
        .in_relation(["?e", "?g"])
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .build();
    let rows = run_sorted(
        &people_store(),
        &q,
        &[QueryInput::Database, QueryInput::Relation(vec![])],
        QueryOptions::default(),
    );
    assert!(rows.is_empty());
}

#[test]
fn test_collection_input_restricts() {
    let q = query()
        .find_var("?n")
        .in_db()
        .in_collection("?e")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .build();
    let rows = run_sorted(
        &people_store(),
        &q,
        &[
            QueryInput::Database,
            QueryInput::Collection(vec![id_val("a")]),
        ],
        QueryOptions::default(),
    );
    assert_eq!(rows, vec![Tuple(vec![str_val("Alice")])]);
}

#[test]
fn test_order_by_descending() {
    let q = query()
        .find_var("?n")
        .find_var("?g")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .order_by("?g", SortOrder::Desc)
        .build();
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let store = people_store();
    let snapshot = snapshot_of(&store);
    let rows = engine
        .query(&snapshot, &q, &[], &ctx)
        .expect("query")
        .into_tuples()
        .expect("tuples");
    assert_eq!(rows[0].0[0], str_val("Alice"));
    assert_eq!(rows[1].0[0], str_val("Bob"));
}

#[test]
fn test_blank_and_missing_attribute() {
    let q = query()
        .find_var("?e")
        .where_pattern(var("?e"), kw(":no-such-attr"), blank())
        .build();
    let rows = run_sorted(&people_store(), &q, &[], QueryOptions::default());
    assert!(rows.is_empty());
}

#[test]
fn test_tx_position_binds() {
    let store = MemoryStore::new();
    let attr = Keyword::intern(":v");
    store
        .assert_facts(vec![(Identity::of("x"), attr, Value::Int64(1))])
        .expect("assert");
    store
        .assert_facts(vec![(Identity::of("y"), attr, Value::Int64(2))])
        .expect("assert");
    let q = query()
        .find_var("?e")
        .find_var("?tx")
        .where_pattern_tx(var("?e"), kw(":v"), blank(), var("?tx"))
        .build();
    let rows = run_sorted(&store, &q, &[], QueryOptions::default());
    assert_eq!(rows.len(), 2);
    // Transactions are monotone: the second assert got a higher tx.
    let txs: Vec<i64> = rows.iter().map(|t| t.0[1].as_i64().unwrap()).collect();
    assert!(txs[0] != txs[1]);
}

#[test]
fn test_disjoint_patterns_error_mentions_groups() {
    let q = query()
        .find_var("?a")
        .find_var("?b")
        .where_pattern(var("?x"), kw(":p"), var("?a"))
        .where_pattern(var("?y"), kw(":q"), var("?b"))
        .build();
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let store = people_store();
    let snapshot = snapshot_of(&store);
    match engine.query(&snapshot, &q, &[], &ctx) {
        Err(QueryError::DisjointGroups { groups }) => assert_eq!(groups, 2),
        other => panic!("expected DisjointGroups, got {other:?}"),
    }
}
