//! Query pipeline benchmarks: pattern scans, joins, aggregation, and the
//! plan cache.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tetrad::query::builders::*;
use tetrad::query::{AggregateOp, CompareOp};
use tetrad::value::{Identity, Keyword};
use tetrad::{Engine, MemoryStore, QueryContext, QueryOptions, SnapshotRef, Value};

fn seeded_store(entities: i64) -> MemoryStore {
    let store = MemoryStore::new();
    let name = Keyword::intern(":name");
    let age = Keyword::intern(":age");
    let dept = Keyword::intern(":dept");
    let facts: Vec<_> = (0..entities)
        .flat_map(|i| {
            let e = Identity::of(&format!("p{i}"));
            vec![
                (e.clone(), name, Value::String(format!("person-{i}"))),
                (e.clone(), age, Value::Int64(i % 90)),
                (e, dept, Value::Int64(i % 10)),
            ]
        })
        .collect();
    store.assert_facts(facts).expect("seed");
    store
}

fn bench_pattern_join(c: &mut Criterion) {
    let store = seeded_store(2000);
    let snapshot: SnapshotRef = Arc::new(store.snapshot());
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let q = query()
        .find_var("?n")
        .find_var("?g")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .where_compare(CompareOp::Gt, [avar("?g"), alit(45i64)])
        .build();
    c.bench_function("pattern_join_filtered_2k", |b| {
        b.iter(|| {
            let rows = engine
                .query(&snapshot, &q, &[], &ctx)
                .expect("query")
                .into_tuples()
                .expect("tuples");
            black_box(rows.len())
        });
    });
}

fn bench_grouped_aggregation(c: &mut Criterion) {
    let store = seeded_store(2000);
    let snapshot: SnapshotRef = Arc::new(store.snapshot());
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let q = query()
        .find_var("?d")
        .find_agg(AggregateOp::Avg, "?g")
        .find_agg(AggregateOp::Count, "?g")
        .where_pattern(var("?e"), kw(":dept"), var("?d"))
        .where_pattern(var("?e"), kw(":age"), var("?g"))
        .build();
    c.bench_function("grouped_aggregation_2k", |b| {
        b.iter(|| {
            let rows = engine
                .query(&snapshot, &q, &[], &ctx)
                .expect("query")
                .into_tuples()
                .expect("tuples");
            black_box(rows.len())
        });
    });
}

fn bench_plan_cache(c: &mut Criterion) {
    let engine = Engine::new();
    let ctx = QueryContext::new(QueryOptions::default());
    let q = query()
        .find_var("?n")
        .where_pattern(var("?e"), kw(":name"), var("?n"))
        .build();
    engine.plan(&q, &ctx).expect("warm");
    c.bench_function("plan_cache_hit", |b| {
        b.iter(|| black_box(engine.plan(&q, &ctx).expect("plan")));
    });
}

criterion_group!(
    benches,
    bench_pattern_join,
    bench_grouped_aggregation,
    bench_plan_cache
);
criterion_main!(benches);
