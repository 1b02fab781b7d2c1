//! Property suites over randomized inputs: encoding laws, value algebra,
//! plan invariants, and rewrite equivalence on generated datasets.

mod common;

use common::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tetrad::query::builders::*;
use tetrad::query::{AggregateOp, CompareOp, Var};
use tetrad::value::{l85_decode, l85_encode, Identity, Keyword};
use tetrad::{Engine, MemoryStore, QueryContext, QueryOptions, Value};

proptest! {
    #[test]
    fn prop_l85_round_trip(bytes in prop::array::uniform20(any::<u8>())) {
        let encoded = l85_encode(&bytes);
        prop_assert_eq!(encoded.len(), 25);
        prop_assert!(encoded.is_ascii());
        prop_assert_eq!(l85_decode(&encoded).unwrap(), bytes);
    }

    #[test]
    fn prop_l85_preserves_order(
        a in prop::array::uniform20(any::<u8>()),
        b in prop::array::uniform20(any::<u8>()),
    ) {
        let (ea, eb) = (l85_encode(&a), l85_encode(&b));
        prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
    }

    #[test]
    fn prop_identity_equality_ignores_preserved_string(
        bytes in prop::array::uniform20(any::<u8>()),
        name in "[a-z]{1,12}",
    ) {
        let plain = Identity::from_bytes(bytes);
        let named = Identity::intern(bytes, Some(&name));
        prop_assert_eq!(&plain, &named);
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let hash_of = |id: &Identity| {
            let mut h = DefaultHasher::new();
            id.hash(&mut h);
            h.finish()
        };
        prop_assert_eq!(hash_of(&plain), hash_of(&named));
    }

    #[test]
    fn prop_int_float_equality_matches_order(i in any::<i64>(), f in any::<f64>()) {
        let a = Value::Int64(i);
        let b = Value::Float64(f);
        prop_assert_eq!(a == b, a.cmp(&b) == std::cmp::Ordering::Equal);
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn prop_value_order_is_total(i in any::<i64>(), f in any::<f64>(), s in ".{0,8}") {
        let values = [Value::Int64(i), Value::Float64(f), Value::String(s), Value::Null];
        for a in &values {
            for b in &values {
                prop_assert_eq!(a.cmp(b), b.cmp(a).reverse());
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Predicate pushdown and dynamic reordering must not change results
    /// on randomized age datasets.
    #[test]
    fn prop_rewrites_preserve_results(
        ages in prop::collection::vec(0i64..100, 1..40),
        threshold in 0i64..100,
    ) {
        let store = MemoryStore::new();
        let age = Keyword::intern(":age");
        let name = Keyword::intern(":name");
        let facts: Vec<_> = ages
            .iter()
            .enumerate()
            .flat_map(|(i, &g)| {
                let e = Identity::of(&format!("p{i}"));
                vec![
                    (e.clone(), age, Value::Int64(g)),
                    (e, name, Value::String(format!("p{i}"))),
                ]
            })
            .collect();
        store.assert_facts(facts).expect("assert");

        let q = query()
            .find_var("?n")
            .find_var("?g")
            .where_pattern(var("?e"), kw(":age"), var("?g"))
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .where_compare(CompareOp::Ge, [avar("?g"), alit(threshold)])
            .build();

        let baseline = run_sorted(&store, &q, &[], QueryOptions {
            enable_predicate_pushdown: false,
            enable_dynamic_reordering: false,
            enable_true_streaming: false,
            ..QueryOptions::default()
        });
        let tuned = run_sorted(&store, &q, &[], QueryOptions::default());
        prop_assert_eq!(&baseline, &tuned);

        let expected = ages.iter().filter(|&&g| g >= threshold).count();
        prop_assert_eq!(baseline.len(), expected);
    }

    /// Aggregation is order-insensitive: shuffled assertion order yields
    /// the same grouped aggregates.
    #[test]
    fn prop_aggregation_order_insensitive(
        mut salaries in prop::collection::vec((0i64..5, 1i64..1000), 1..30),
    ) {
        let build = |rows: &[(i64, i64)]| {
            let store = MemoryStore::new();
            let dept = Keyword::intern(":dept");
            let pay = Keyword::intern(":pay");
            let facts: Vec<_> = rows
                .iter()
                .enumerate()
                .flat_map(|(i, &(d, s))| {
                    let e = Identity::of(&format!("w{i}"));
                    vec![
                        (e.clone(), dept, Value::Int64(d)),
                        (e, pay, Value::Int64(s)),
                    ]
                })
                .collect();
            store.assert_facts(facts).expect("assert");
            store
        };
        let q = query()
            .find_var("?d")
            .find_agg(AggregateOp::Sum, "?s")
            .find_agg(AggregateOp::Count, "?s")
            .where_pattern(var("?e"), kw(":dept"), var("?d"))
            .where_pattern(var("?e"), kw(":pay"), var("?s"))
            .build();

        let forward = run_sorted(&build(&salaries), &q, &[], QueryOptions::default());
        salaries.reverse();
        let reversed = run_sorted(&build(&salaries), &q, &[], QueryOptions::default());
        prop_assert_eq!(forward, reversed);
    }
}

/// Plan invariants over a corpus of representative queries: every clause
/// input is within Available ∪ Provides, and Keep never escapes it.
#[test]
fn test_plan_invariants_over_corpus() {
    let corpus = vec![
        query()
            .find_var("?n")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build(),
        query()
            .find_var("?n")
            .find_var("?g")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .where_pattern(var("?e"), kw(":age"), var("?g"))
            .where_compare(CompareOp::Gt, [avar("?g"), alit(21i64)])
            .build(),
        query()
            .find_var("?d")
            .find_agg(AggregateOp::Avg, "?s")
            .where_pattern(var("?e"), kw(":dept"), var("?d"))
            .where_pattern(var("?e"), kw(":salary"), var("?s"))
            .build(),
        query()
            .find_var("?e")
            .where_pattern(var("?e"), kw(":event/time"), var("?t"))
            .where_expr(tetrad::query::ExprOp::Year, [avar("?t")], "?y")
            .where_compare(CompareOp::Eq, [avar("?y"), alit(2024i64)])
            .build(),
        query()
            .find_var("?n")
            .in_db()
            .in_collection("?e")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build(),
    ];
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    for q in corpus {
        let plan = engine.plan(&q, &ctx).expect("plan");
        for phase in &plan.phases {
            let visible: BTreeSet<Var> = phase.available.union(&phase.provides).cloned().collect();
            for var in phase.referenced_vars() {
                assert!(visible.contains(&var), "clause input {var} not visible");
            }
            for var in &phase.keep {
                assert!(visible.contains(var), "keep {var} outside visible set");
            }
        }
    }
}

/// Streaming relations are consumed exactly once.
#[test]
fn test_streaming_single_use_law() {
    let store = people_store();
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let snapshot = snapshot_of(&store);
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .build();
    let rel = engine.query(&snapshot, &q, &[], &ctx).expect("query");
    assert!(rel.is_streaming());
    let first = rel.iterate().expect("first pass");
    drop(first.collect::<Vec<_>>());
    assert!(matches!(
        rel.iterate(),
        Err(tetrad::QueryError::IteratorConsumed)
    ));
}

/// The buffered wrapper restores multi-pass access.
#[test]
fn test_buffered_wrapper_allows_reiteration() {
    let store = people_store();
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let snapshot = snapshot_of(&store);
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .build();
    let rel = engine.query(&snapshot, &q, &[], &ctx).expect("query").buffered();
    assert_eq!(rel.iterate().expect("one").count(), 2);
    assert_eq!(rel.iterate().expect("two").count(), 2);
}
