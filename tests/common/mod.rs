//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use tetrad::query::Query;
use tetrad::value::{Identity, Keyword};
use tetrad::{
    Engine, MemoryStore, QueryContext, QueryInput, QueryOptions, Relation, SnapshotRef, Tuple,
    Value,
};

pub fn snapshot_of(store: &MemoryStore) -> SnapshotRef {
    Arc::new(store.snapshot())
}

/// The two-person dataset most scenarios start from.
pub fn people_store() -> MemoryStore {
    let store = MemoryStore::new();
    let name = Keyword::intern(":name");
    let age = Keyword::intern(":age");
    store
        .assert_facts(vec![
            (Identity::of("a"), name, Value::String("Alice".into())),
            (Identity::of("a"), age, Value::Int64(30)),
            (Identity::of("b"), name, Value::String("Bob".into())),
            (Identity::of("b"), age, Value::Int64(25)),
        ])
        .expect("assert facts");
    store
}

/// Run a query and return its rows sorted, for multiset comparisons.
pub fn run_sorted(
    store: &MemoryStore,
    query: &Query,
    inputs: &[QueryInput],
    options: QueryOptions,
) -> Vec<Tuple> {
    let engine = Engine::new();
    let ctx = QueryContext::new(options);
    let snapshot = snapshot_of(store);
    let rel = engine
        .query(&snapshot, query, inputs, &ctx)
        .expect("query execution");
    sorted_tuples(rel)
}

pub fn sorted_tuples(rel: Relation) -> Vec<Tuple> {
    let mut rows = rel.into_tuples().expect("tuples");
    rows.sort();
    rows
}

pub fn str_val(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn id_val(name: &str) -> Value {
    Value::Identity(Identity::of(name))
}
