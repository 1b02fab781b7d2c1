//! Bounded worker pool for parallel subquery fan-out.
//!
//! OS threads fed by a bounded crossbeam channel: the producer blocks when
//! the queue is full, workers append result batches to a shared buffer in
//! completion order. Any worker error flips a pool-local abort flag; the
//! first error wins, later ones are logged to the annotation channel and
//! discarded. Result order is not preserved.

use crate::context::QueryContext;
use crate::error::{QueryError, Result};
use crate::relation::Tuple;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run `f` over every row on `workers` threads; collect all produced
/// tuples in nondeterministic order.
pub fn map_rows<F>(
    rows: Vec<Tuple>,
    workers: usize,
    ctx: &QueryContext,
    f: F,
) -> Result<Vec<Tuple>>
where
    F: Fn(&Tuple) -> Result<Vec<Tuple>> + Send + Sync,
{
    debug_assert!(workers > 1);
    let (tx, rx) = crossbeam_channel::bounded::<Tuple>(workers * 2);
    let aborted = AtomicBool::new(false);
    let first_error: Mutex<Option<QueryError>> = Mutex::new(None);
    let results: Mutex<Vec<Tuple>> = Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let rx = rx.clone();
            let aborted = &aborted;
            let first_error = &first_error;
            let results = &results;
            let f = &f;
            let ctx = ctx.clone();
            scope.spawn(move || {
                while let Ok(row) = rx.recv() {
                    if aborted.load(Ordering::Relaxed) || ctx.cancel.is_cancelled() {
                        continue;
                    }
                    match f(&row) {
                        Ok(mut batch) => results.lock().append(&mut batch),
                        Err(e) => {
                            let mut slot = first_error.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                                aborted.store(true, Ordering::Relaxed);
                            } else {
                                ctx.annotations.emit_point(
                                    "subquery/worker-error",
                                    None,
                                    [("error", Value::String(e.to_string()))],
                                );
                                tracing::debug!(error = %e, "discarding secondary worker error");
                            }
                        }
                    }
                }
            });
        }
        drop(rx);
        for row in rows {
            if aborted.load(Ordering::Relaxed) {
                break;
            }
            // Blocks when the queue is full; workers drain it.
            if tx.send(row).is_err() {
                break;
            }
        }
        drop(tx);
    });

    if let Some(e) = first_error.into_inner() {
        return Err(e);
    }
    Ok(results.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryOptions;

    fn ctx() -> QueryContext {
        QueryContext::new(QueryOptions::default())
    }

    fn row(i: i64) -> Tuple {
        Tuple(vec![Value::Int64(i)])
    }

    #[test]
    fn test_collects_all_results() {
        let rows: Vec<Tuple> = (0..100).map(row).collect();
        let out = map_rows(rows, 4, &ctx(), |t| {
            let v = t.0[0].as_i64().expect("int");
            Ok(vec![Tuple(vec![Value::Int64(v * 2)])])
        })
        .expect("pool");
        let mut values: Vec<i64> = out.iter().map(|t| t.0[0].as_i64().unwrap()).collect();
        values.sort_unstable();
        let expected: Vec<i64> = (0..100).map(|i| i * 2).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_first_error_wins_and_aborts() {
        let rows: Vec<Tuple> = (0..1000).map(row).collect();
        let out = map_rows(rows, 4, &ctx(), |t| {
            let v = t.0[0].as_i64().expect("int");
            if v == 10 {
                Err(QueryError::DivideByZero {
                    binding: "?x".into(),
                    phase: 0,
                })
            } else {
                Ok(vec![t.clone()])
            }
        });
        assert!(matches!(out, Err(QueryError::DivideByZero { .. })));
    }

    #[test]
    fn test_empty_input() {
        let out = map_rows(Vec::new(), 2, &ctx(), |t| Ok(vec![t.clone()])).expect("pool");
        assert!(out.is_empty());
    }
}
