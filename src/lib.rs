//! # Tetrad
//!
//! A Datalog query engine over a persistent, content-addressed,
//! time-versioned triple store. Facts are four-element records
//! `(Entity, Attribute, Value, Transaction)`; queries are the parsed form
//! of an S-expression surface syntax with data patterns, predicates,
//! expressions, subqueries, aggregates, and ordering.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Parsed Query (AST)
//!     ↓
//! [Planner]        → phases with Available/Provides/Keep symbol sets
//!     ↓
//! [Rewriter]       → pushdown, time ranges, conditional aggregates,
//!                    decorrelation, CSE
//!     ↓
//! [Executor]       → frontier relation driven clause by clause
//!     ├── [Matcher]  index-backed pattern streams (EAVT/AEVT/AVET/VAET/TAEV)
//!     ├── [Eval]     predicates, expressions, aggregation
//!     └── [Pool]     parallel subquery fan-out
//!     ↓
//! Result relation (aggregate / order-by / project applied)
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tetrad::query::builders::*;
//! use tetrad::{Engine, MemoryStore, QueryContext, SnapshotRef, Value};
//! use tetrad::value::{Identity, Keyword};
//!
//! let store = MemoryStore::new();
//! store.assert_facts(vec![
//!     (Identity::of("a"), Keyword::intern(":name"), Value::String("Alice".into())),
//!     (Identity::of("a"), Keyword::intern(":age"), Value::Int64(30)),
//! ]).unwrap();
//!
//! let q = query()
//!     .find_var("?n")
//!     .find_var("?g")
//!     .where_pattern(var("?e"), kw(":name"), var("?n"))
//!     .where_pattern(var("?e"), kw(":age"), var("?g"))
//!     .build();
//!
//! let engine = Engine::new();
//! let snapshot: SnapshotRef = Arc::new(store.snapshot());
//! let ctx = QueryContext::default();
//! let rows = engine.query(&snapshot, &q, &[], &ctx).unwrap();
//! assert_eq!(rows.size().unwrap(), 1);
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Tagged values, identity and keyword interning |
//! | `datom` | The immutable fact record |
//! | `query` | Parsed-query AST and builders |
//! | `relation` | Lazy single-use tuple streams and hash joins |
//! | `storage` | Ordered-KV contract, key codec, in-memory store |
//! | `matcher` | Index selection and pattern scans |
//! | `eval` | Predicate/expression evaluation and aggregation |
//! | `planner` | Phases, symbol tracking, statistics, plan cache |
//! | `rewrite` | Semantic plan rewrites |
//! | `executor` | Phase driver and the subquery worker pool |
//! | `annotations` | Structured observability events |
//! | `config` | Options and file/env configuration |

pub mod annotations;
pub mod config;
pub mod context;
pub mod datom;
pub mod error;
pub mod eval;
pub mod executor;
pub mod matcher;
pub mod planner;
pub mod query;
pub mod relation;
pub mod rewrite;
pub mod storage;
pub mod value;

pub use annotations::{Annotation, AnnotationBus, AnnotationHandler, CollectingHandler};
pub use config::{Config, QueryOptions};
pub use context::{CancelToken, QueryContext};
pub use datom::Datom;
pub use error::{QueryError, Result};
pub use executor::{Executor, QueryInput};
pub use planner::{Plan, Planner, Statistics};
pub use query::Query;
pub use relation::{Relation, Tuple};
pub use storage::{MemoryStore, Snapshot, SnapshotRef};
pub use value::{clear_interns, Value};

use std::sync::Arc;

/// Planner-plus-executor facade: plans through the shared cache, executes
/// against a caller-supplied snapshot.
pub struct Engine {
    planner: Planner,
}

impl Engine {
    /// Engine with default statistics and plan-cache capacity.
    pub fn new() -> Self {
        Engine::with_statistics(Statistics::default_estimates(), 1024)
    }

    pub fn with_statistics(stats: Statistics, plan_cache_capacity: usize) -> Self {
        Engine {
            planner: Planner::new(stats, plan_cache_capacity),
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Plan (cached) and execute in one call.
    pub fn query(
        &self,
        snapshot: &SnapshotRef,
        query: &Query,
        inputs: &[QueryInput],
        ctx: &QueryContext,
    ) -> Result<Relation> {
        let plan = self.planner.plan(query, ctx)?;
        Executor::new(snapshot, self.planner.stats(), ctx).execute(&plan, inputs)
    }

    /// Plan only; callers hold the immutable plan.
    pub fn plan(&self, query: &Query, ctx: &QueryContext) -> Result<Arc<Plan>> {
        self.planner.plan(query, ctx)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}
