//! # Rewriter
//!
//! Semantic plan rewrites, applied in a fixed order after phase
//! construction. Every rewrite preserves query semantics and is
//! idempotent; after each one the planner re-derives phase symbols, so a
//! rewrite never has to maintain Available/Provides/Keep itself.
//!
//! - Predicate pushdown: fuse single-pattern predicates into matchers.
//! - Time-predicate rewrite: fold `(year ?t)`-style extractions plus
//!   equality predicates into AVET scan ranges.
//! - Correlated-aggregate rewrite: inline a per-row aggregate subquery as
//!   a conditional aggregate over the outer relation.
//! - Decorrelation: run a single-input correlated subquery once over its
//!   distinct inputs and join back.
//! - Common-subexpression elimination: drop exact-duplicate clauses
//!   (default off; parallel subquery execution already covers the win).

mod cse;
mod pushdown;
mod subquery;
mod time_range;

use crate::context::QueryContext;
use crate::error::Result;
use crate::planner::{recompute_symbols, Plan};
use crate::value::Value;

/// Run every enabled rewrite over the plan.
pub fn apply_rewrites(plan: &mut Plan, ctx: &QueryContext) -> Result<()> {
    if ctx.options.enable_predicate_pushdown {
        let moved = pushdown::apply(plan);
        if moved > 0 {
            recompute_symbols(plan)?;
            ctx.annotations.emit_point(
                "plan/rewrite.predicate-pushdown",
                None,
                [("predicates", Value::Int64(moved as i64))],
            );
        }
    }
    if ctx.options.enable_time_predicate_rewrite {
        let ranges = time_range::apply(plan);
        if ranges > 0 {
            recompute_symbols(plan)?;
            ctx.annotations.emit_point(
                "plan/rewrite.time-ranges",
                None,
                [("ranges", Value::Int64(ranges as i64))],
            );
        }
    }
    if ctx.options.enable_correlated_aggregate_rewrite {
        let rewritten = subquery::conditional_aggregates(plan)?;
        if rewritten > 0 {
            recompute_symbols(plan)?;
            ctx.annotations.emit_point(
                "query/rewrite.conditional-aggregates",
                None,
                [("subqueries", Value::Int64(rewritten as i64))],
            );
        }
    }
    if ctx.options.enable_decorrelation {
        let decorrelated = subquery::decorrelate(plan);
        if decorrelated > 0 {
            recompute_symbols(plan)?;
            ctx.annotations.emit_point(
                "plan/rewrite.decorrelation",
                None,
                [("subqueries", Value::Int64(decorrelated as i64))],
            );
        }
    }
    if ctx.options.enable_cse {
        let merged = cse::apply(plan);
        if merged > 0 {
            recompute_symbols(plan)?;
            ctx.annotations.emit_point(
                "plan/rewrite.cse",
                None,
                [("clauses", Value::Int64(merged as i64))],
            );
        }
    }
    Ok(())
}
