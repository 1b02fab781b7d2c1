//! Time-predicate rewrite.
//!
//! Detects the `(year ?t) ?y` + `(= ?y 2024)` shape (optionally refined by
//! month, day, and hour on the same `?t`) and folds it into a `[lo, hi)`
//! UTC range attached to the phase metadata, which the matcher turns into
//! AVET range scans. The consumed equality predicates are dropped, and an
//! extraction expression is dropped too once nothing else references its
//! binding.
//!
//! Refinements must be contiguous from the year down: year+month composes,
//! year+day does not (the day predicate simply stays behind as a filter).
//! An impossible field value (month 13) leaves the clauses untouched, so
//! the query still evaluates to its honest empty result.

use crate::matcher::TimeRange;
use crate::planner::{Phase, Plan};
use crate::query::{Arg, CompareOp, ExprOp, Predicate, Var};
use crate::value::Value;
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Field {
    Year,
    Month,
    Day,
    Hour,
}

pub fn apply(plan: &mut Plan) -> usize {
    let mut attached = 0;
    for phase_idx in 0..plan.phases.len() {
        attached += rewrite_phase(plan, phase_idx);
    }
    attached
}

fn rewrite_phase(plan: &mut Plan, phase_idx: usize) -> usize {
    // Extraction expressions in this phase: binding -> (time var, field).
    let extractions: Vec<(Var, Var, Field)> = plan.phases[phase_idx]
        .expressions
        .iter()
        .filter_map(|e| {
            let field = match e.op {
                ExprOp::Year => Field::Year,
                ExprOp::Month => Field::Month,
                ExprOp::Day => Field::Day,
                ExprOp::Hour => Field::Hour,
                _ => return None,
            };
            match e.args.as_slice() {
                [Arg::Var(t)] => Some((e.binding.clone(), t.clone(), field)),
                _ => None,
            }
        })
        .collect();
    if extractions.is_empty() {
        return 0;
    }

    // Equality predicates pinning an extraction binding to an integer.
    let pinned: BTreeMap<Var, (usize, i64)> = plan.phases[phase_idx]
        .predicates
        .iter()
        .enumerate()
        .filter_map(|(i, p)| match p {
            Predicate::Compare {
                op: CompareOp::Eq,
                args,
            } => match args.as_slice() {
                [Arg::Var(v), Arg::Lit(Value::Int64(n))]
                | [Arg::Lit(Value::Int64(n)), Arg::Var(v)] => Some((v.clone(), (i, *n))),
                _ => None,
            },
            _ => None,
        })
        .collect();

    // Group pinned fields per time variable.
    let mut per_time_var: BTreeMap<Var, BTreeMap<Field, (Var, usize, i64)>> = BTreeMap::new();
    for (binding, time_var, field) in &extractions {
        if let Some((pred_idx, value)) = pinned.get(binding) {
            per_time_var
                .entry(time_var.clone())
                .or_default()
                .entry(*field)
                .or_insert((binding.clone(), *pred_idx, *value));
        }
    }

    let mut attached = 0;
    for (time_var, fields) in per_time_var {
        // Only worth a range when some pattern scans this variable as V
        // under a constant attribute.
        let scannable = plan.phases[phase_idx].patterns.iter().any(|p| {
            p.pattern.a.lit().and_then(Value::as_keyword).is_some()
                && p.pattern.v.var() == Some(&time_var)
        });
        if !scannable {
            continue;
        }
        if plan.phases[phase_idx]
            .metadata
            .time_ranges
            .contains_key(&time_var)
        {
            continue;
        }
        let Some(range) = compose_range(&fields) else {
            continue;
        };

        // Contiguous prefix only: the consumed fields are year, then
        // month/day/hour as far as the chain reaches.
        let mut consumed: Vec<(Var, i64)> = Vec::new();
        for field in [Field::Year, Field::Month, Field::Day, Field::Hour] {
            match fields.get(&field) {
                Some((binding, _, value)) => consumed.push((binding.clone(), *value)),
                None => break,
            }
        }

        let phase = &mut plan.phases[phase_idx];
        phase
            .metadata
            .time_ranges
            .insert(time_var.clone(), vec![range]);
        for (binding, value) in &consumed {
            remove_eq_predicate(phase, binding, *value);
        }
        for (binding, _) in &consumed {
            drop_expression_if_dead(plan, phase_idx, binding);
        }
        attached += 1;
    }
    attached
}

/// Compose `[lo, hi)` from a contiguous year-anchored field chain.
fn compose_range(fields: &BTreeMap<Field, (Var, usize, i64)>) -> Option<TimeRange> {
    let year = fields.get(&Field::Year)?.2;
    let year = i32::try_from(year).ok()?;
    let month = fields.get(&Field::Month).map(|f| f.2);
    let day = fields.get(&Field::Day).map(|f| f.2);
    let hour = fields.get(&Field::Hour).map(|f| f.2);

    match (month, day, hour) {
        (None, _, _) => {
            let lo = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
            let hi = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?;
            Some(TimeRange { lo, hi })
        }
        (Some(m), None, _) => {
            let m = u32::try_from(m).ok()?;
            let lo = Utc.with_ymd_and_hms(year, m, 1, 0, 0, 0).single()?;
            let hi = if m == 12 {
                Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?
            } else {
                Utc.with_ymd_and_hms(year, m + 1, 1, 0, 0, 0).single()?
            };
            Some(TimeRange { lo, hi })
        }
        (Some(m), Some(d), None) => {
            let (m, d) = (u32::try_from(m).ok()?, u32::try_from(d).ok()?);
            let lo = Utc.with_ymd_and_hms(year, m, d, 0, 0, 0).single()?;
            Some(TimeRange {
                lo,
                hi: lo + Duration::days(1),
            })
        }
        (Some(m), Some(d), Some(h)) => {
            let (m, d, h) = (
                u32::try_from(m).ok()?,
                u32::try_from(d).ok()?,
                u32::try_from(h).ok()?,
            );
            let lo = Utc.with_ymd_and_hms(year, m, d, h, 0, 0).single()?;
            Some(TimeRange {
                lo,
                hi: lo + Duration::hours(1),
            })
        }
    }
}

/// Drop the folded `(= ?binding N)` predicate.
fn remove_eq_predicate(phase: &mut Phase, binding: &Var, value: i64) {
    let matches_shape = |p: &Predicate| {
        let Predicate::Compare {
            op: CompareOp::Eq,
            args,
        } = p
        else {
            return false;
        };
        matches!(
            args.as_slice(),
            [Arg::Var(v), Arg::Lit(Value::Int64(n))] | [Arg::Lit(Value::Int64(n)), Arg::Var(v)]
                if v == binding && *n == value
        )
    };
    if let Some(pos) = phase.predicates.iter().position(matches_shape) {
        phase.predicates.remove(pos);
    }
}

/// Drop the extraction expression for `binding` when nothing else in the
/// plan (nor the find/order-by clauses) reads it.
fn drop_expression_if_dead(plan: &mut Plan, phase_idx: usize, binding: &Var) {
    if plan.query.find_vars().contains(binding) {
        return;
    }
    if plan.query.order_by.iter().any(|(v, _)| v == binding) {
        return;
    }
    let referenced = plan.phases.iter().any(|phase: &Phase| {
        phase.referenced_vars().contains(binding)
    });
    if referenced {
        return;
    }
    plan.phases[phase_idx]
        .expressions
        .retain(|e| &e.binding != binding);
}
