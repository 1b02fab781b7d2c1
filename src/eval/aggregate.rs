//! Grouping aggregation.
//!
//! One pass over the input: rows are bucketed by the grouping-column tuple
//! (first-seen order preserved) and fed to per-group accumulators. An
//! aggregate may carry a Bool condition column; rows whose condition is
//! not `true` are skipped for that aggregate, which is how rewritten
//! correlated-aggregate subqueries evaluate.
//!
//! Empty groups only materialize for a global aggregate (no grouping
//! columns) over empty input: `count` yields 0, everything else null.

use crate::error::{QueryError, Result};
use crate::query::{Aggregate, AggregateOp, Var};
use crate::relation::{Relation, Tuple};
use crate::value::Value;
use std::collections::HashMap;

/// One aggregate column: the spec plus the output column name.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub aggregate: Aggregate,
    pub output: Var,
}

enum Accumulator {
    Count(i64),
    /// Sum with the output type fixed by the first non-null input
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
}

impl Accumulator {
    fn new(op: AggregateOp) -> Self {
        match op {
            AggregateOp::Count => Accumulator::Count(0),
            AggregateOp::Sum => Accumulator::Sum(None),
            AggregateOp::Min => Accumulator::Min(None),
            AggregateOp::Max => Accumulator::Max(None),
            AggregateOp::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
        }
    }

    fn update(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(acc) => {
                *acc = Some(match acc.take() {
                    None => value.clone(),
                    Some(Value::Int64(a)) => match value {
                        Value::Int64(b) => Value::Int64(a.wrapping_add(*b)),
                        Value::Float64(b) => Value::Float64(a as f64 + b),
                        _ => Value::Int64(a),
                    },
                    Some(Value::Float64(a)) => match value.as_f64() {
                        Some(b) => Value::Float64(a + b),
                        None => Value::Float64(a),
                    },
                    Some(other) => other,
                });
            }
            Accumulator::Min(acc) => {
                if acc.as_ref().is_none_or(|m| value < m) {
                    *acc = Some(value.clone());
                }
            }
            Accumulator::Max(acc) => {
                if acc.as_ref().is_none_or(|m| value > m) {
                    *acc = Some(value.clone());
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(f) = value.as_f64() {
                    *sum += f;
                    *count += 1;
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int64(n),
            Accumulator::Sum(acc) | Accumulator::Min(acc) | Accumulator::Max(acc) => {
                acc.unwrap_or(Value::Null)
            }
            Accumulator::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float64(sum / count as f64)
                }
            }
        }
    }
}

/// Aggregate `input` grouped by `group_by`.
///
/// Output columns are `group_by` followed by each spec's output column.
pub fn aggregate_relation(
    input: Relation,
    group_by: &[Var],
    specs: &[AggregateSpec],
) -> Result<Relation> {
    let group_idx = group_by
        .iter()
        .map(|v| {
            input.col_index(v).ok_or_else(|| {
                QueryError::invalid_plan(format!("aggregate group column {v} missing"), 0)
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let value_idx = specs
        .iter()
        .map(|s| {
            input.col_index(&s.aggregate.var).ok_or_else(|| {
                QueryError::invalid_plan(
                    format!("aggregate input column {} missing", s.aggregate.var),
                    0,
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let condition_idx = specs
        .iter()
        .map(|s| match &s.aggregate.condition {
            Some(cond) => input
                .col_index(cond)
                .map(Some)
                .ok_or_else(|| {
                    QueryError::invalid_plan(format!("aggregate condition column {cond} missing"), 0)
                }),
            None => Ok(None),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out_cols = group_by.to_vec();
    out_cols.extend(specs.iter().map(|s| s.output.clone()));

    // First-seen group order is preserved in the output.
    let mut group_slots: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<Accumulator>)> = Vec::new();

    for item in input.iterate()? {
        let tuple = item?;
        let key: Vec<Value> = group_idx.iter().map(|&i| tuple.0[i].normalized()).collect();
        let slot = match group_slots.get(&key) {
            Some(&slot) => slot,
            None => {
                let raw_key: Vec<Value> = group_idx.iter().map(|&i| tuple.0[i].clone()).collect();
                groups.push((
                    raw_key,
                    specs
                        .iter()
                        .map(|s| Accumulator::new(s.aggregate.op))
                        .collect(),
                ));
                group_slots.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        let accs = &mut groups[slot].1;
        for (i, acc) in accs.iter_mut().enumerate() {
            if let Some(cond) = condition_idx[i] {
                if tuple.0[cond] != Value::Bool(true) {
                    continue;
                }
            }
            acc.update(&tuple.0[value_idx[i]]);
        }
    }

    // Global aggregate over empty input still yields one row.
    if groups.is_empty() && group_by.is_empty() {
        groups.push((
            Vec::new(),
            specs
                .iter()
                .map(|s| Accumulator::new(s.aggregate.op))
                .collect(),
        ));
    }

    let tuples = groups
        .into_iter()
        .map(|(mut key, accs)| {
            key.extend(accs.into_iter().map(Accumulator::finish));
            Tuple(key)
        })
        .collect();
    Ok(Relation::materialized(out_cols, tuples))
}
