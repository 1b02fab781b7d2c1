//! Configuration System
//!
//! Planner and executor options, loadable from a TOML file with
//! environment-variable overrides:
//!
//! ```toml
//! # tetrad.toml
//! [query]
//! parallel_subqueries = 8
//! plan_cache_capacity = 2048
//! ```
//!
//! ```bash
//! TETRAD_QUERY__PARALLEL_SUBQUERIES=0
//! TETRAD_QUERY__ENABLE_CSE=true
//! ```
//!
//! Most embedders construct [`QueryOptions`] directly; `Config::load` is
//! for processes that want file/env-driven settings.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Tuning knobs for the planner, rewriter, and executor.
///
/// Defaults match the documented behavior: all semantic rewrites on except
/// CSE, streaming on, worker pool sized to the CPU count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct QueryOptions {
    /// Allow the planner to reorder phases by continuation score
    pub enable_dynamic_reordering: bool,

    /// Fuse pushable predicates into pattern matchers
    pub enable_predicate_pushdown: bool,

    /// Compose time-extraction predicates into AVET scan ranges
    pub enable_time_predicate_rewrite: bool,

    /// Replace per-row aggregate subqueries with conditional aggregates
    /// when the outer phase covers them
    pub enable_correlated_aggregate_rewrite: bool,

    /// Fall-back correlated-to-batched subquery rewrite
    pub enable_decorrelation: bool,

    /// Merge identical filter groups (off: parallel subquery execution
    /// already parallelizes independent groups)
    pub enable_cse: bool,

    /// Keep filters/projections/transforms lazy
    pub enable_iterator_composition: bool,

    /// Matchers return streams rather than materialized relations
    pub enable_true_streaming: bool,

    /// Worker count for parallel subquery fan-out; 0 runs sequentially
    pub parallel_subqueries: usize,

    /// LRU capacity of the process-wide plan cache
    pub plan_cache_capacity: usize,

    /// Bound-relation row count beyond which the matcher switches from
    /// per-key prefix scans to one batched scan with post-filtering
    pub multi_row_binding_threshold: usize,

    /// Permit queries whose patterns form disjoint groups (explicit
    /// cross product)
    pub allow_cartesian: bool,

    /// Pre-size cap for join build tables
    pub join_presize_cap: usize,

    /// Build-side tuple count beyond which a symmetric hash join spills
    /// to a temp file
    pub symmetric_join_spill_threshold: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            enable_dynamic_reordering: true,
            enable_predicate_pushdown: true,
            enable_time_predicate_rewrite: true,
            enable_correlated_aggregate_rewrite: true,
            enable_decorrelation: true,
            enable_cse: false,
            enable_iterator_composition: true,
            enable_true_streaming: true,
            parallel_subqueries: num_cpus::get(),
            plan_cache_capacity: 1024,
            multi_row_binding_threshold: 100,
            allow_cartesian: false,
            join_presize_cap: 1 << 16,
            symmetric_join_spill_threshold: 1 << 20,
        }
    }
}

impl QueryOptions {
    /// Sequential-execution variant, used by tests comparing parallel and
    /// sequential fan-out.
    pub fn sequential() -> Self {
        QueryOptions {
            parallel_subqueries: 0,
            ..QueryOptions::default()
        }
    }

    pub fn with_parallel_subqueries(mut self, workers: usize) -> Self {
        self.parallel_subqueries = workers;
        self
    }
}

/// Top-level file/env configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub query: QueryOptions,
}

impl Config {
    /// Load `tetrad.toml` (if present) with `TETRAD_*` env overrides.
    pub fn load() -> Result<Self, figment::Error> {
        Self::from_file("tetrad.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TETRAD_").split("__"))
            .extract()
    }
}
