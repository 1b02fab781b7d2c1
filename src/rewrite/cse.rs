//! Common-subexpression elimination.
//!
//! Drops exact-duplicate clauses inside a phase: a repeated pattern,
//! predicate, expression, or subquery (same nested query, same arguments,
//! same binding) evaluates once instead of twice. Off by default; parallel
//! subquery execution already parallelizes independent groups, and the
//! duplicate-scan win rarely pays for the pass.

use crate::planner::Plan;

pub fn apply(plan: &mut Plan) -> usize {
    let mut removed = 0;
    for phase in &mut plan.phases {
        removed += dedup_by(&mut phase.patterns, |a, b| {
            a.pattern == b.pattern && a.pushed == b.pushed
        });
        removed += dedup_by(&mut phase.predicates, |a, b| a == b);
        removed += dedup_by(&mut phase.expressions, |a, b| a == b);
        removed += dedup_by(&mut phase.subqueries, |a, b| {
            a.clause == b.clause && a.strategy == b.strategy
        });
    }
    removed
}

fn dedup_by<T>(items: &mut Vec<T>, same: impl Fn(&T, &T) -> bool) -> usize {
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    let mut removed = 0;
    for item in items.drain(..) {
        if kept.iter().any(|k| same(k, &item)) {
            removed += 1;
        } else {
            kept.push(item);
        }
    }
    *items = kept;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;
    use crate::context::QueryContext;
    use crate::planner::{plan_query, Statistics};
    use crate::query::builders::*;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_pattern_merged_when_enabled() {
        let q = query()
            .find_var("?n")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build();
        let ctx = QueryContext::new(QueryOptions {
            enable_cse: true,
            ..QueryOptions::default()
        });
        let plan =
            plan_query(Arc::new(q), &Statistics::default_estimates(), &ctx).expect("plan");
        assert_eq!(plan.phases[0].patterns.len(), 1);
    }

    #[test]
    fn test_cse_off_by_default() {
        let q = query()
            .find_var("?n")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build();
        let ctx = QueryContext::new(QueryOptions::default());
        let plan =
            plan_query(Arc::new(q), &Statistics::default_estimates(), &ctx).expect("plan");
        assert_eq!(plan.phases[0].patterns.len(), 2);
    }
}
