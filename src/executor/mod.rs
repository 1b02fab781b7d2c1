//! # Executor
//!
//! Drives a compiled plan phase by phase. The frontier relation starts as
//! the unit relation joined with the `:in` bindings; each phase applies
//! its data patterns (through the matcher), expressions, predicates,
//! rewrite-installed conditional aggregates, and subqueries, then projects
//! to the phase's keep-set. After the last phase the find aggregation,
//! ordering, and final projection run.
//!
//! Low-cardinality frontiers are handed to the matcher as binding
//! relations (multi-row binding); streaming frontiers join against the
//! pattern's stream instead, symmetric-hash when both sides stream.
//!
//! Correlated subqueries execute once per outer row — fanned out to the
//! bounded worker pool when `parallel_subqueries` allows — while
//! decorrelated ones run a single batched execution over the distinct
//! input tuples and join back.

pub mod parallel;

use crate::context::QueryContext;
use crate::error::{QueryError, Result};
use crate::eval::aggregate::AggregateSpec;
use crate::eval::{aggregate_relation, CompiledExpression, CompiledPredicate};
use crate::planner::{Phase, PhaseSubquery, Plan, Statistics, SubqueryStrategy};
use crate::query::{
    Aggregate, FindElem, InputSpec, Query, SubqueryArg, SubqueryBinding, Var,
};
use crate::relation::{join_relations, JoinKind, Relation, Tuple};
use crate::storage::SnapshotRef;
use crate::value::Value;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::time::Instant;

/// One actual argument for a query's `:in` clause.
#[derive(Debug, Clone)]
pub enum QueryInput {
    /// `$`: the snapshot (carried separately; this is a positional marker)
    Database,
    Scalar(Value),
    Tuple(Vec<Value>),
    Collection(Vec<Value>),
    Relation(Vec<Vec<Value>>),
}

/// Executes plans against one snapshot.
pub struct Executor<'a> {
    snapshot: &'a SnapshotRef,
    stats: &'a Statistics,
    ctx: &'a QueryContext,
}

impl<'a> Executor<'a> {
    pub fn new(snapshot: &'a SnapshotRef, stats: &'a Statistics, ctx: &'a QueryContext) -> Self {
        Executor {
            snapshot,
            stats,
            ctx,
        }
    }

    /// Run a plan to its final find-shaped relation.
    pub fn execute(&self, plan: &Plan, inputs: &[QueryInput]) -> Result<Relation> {
        let initial = self.bind_inputs(&plan.query.inputs, inputs)?;
        let frontier = self.run_phases(plan, initial, &[])?;
        self.finish(plan, frontier, &[])
    }

    /// Seed the frontier from the `:in` bindings.
    fn bind_inputs(&self, specs: &[InputSpec], inputs: &[QueryInput]) -> Result<Relation> {
        if specs.len() != inputs.len() {
            return Err(QueryError::InputMismatch {
                message: format!(
                    "query declares {} inputs, {} were supplied",
                    specs.len(),
                    inputs.len()
                ),
            });
        }
        let mut frontier = Relation::unit();
        for (spec, input) in specs.iter().zip(inputs) {
            let rel = match (spec, input) {
                (InputSpec::Database, QueryInput::Database) => continue,
                (InputSpec::Scalar(v), QueryInput::Scalar(value)) => Relation::materialized(
                    vec![v.clone()],
                    vec![Tuple(vec![value.clone()])],
                ),
                (InputSpec::Tuple(vars), QueryInput::Tuple(values)) => {
                    if vars.len() != values.len() {
                        return Err(QueryError::InputMismatch {
                            message: format!(
                                "tuple input arity {} != declared {}",
                                values.len(),
                                vars.len()
                            ),
                        });
                    }
                    Relation::materialized(vars.clone(), vec![Tuple(values.clone())])
                }
                (InputSpec::Collection(v), QueryInput::Collection(values)) => {
                    Relation::materialized(
                        vec![v.clone()],
                        values.iter().map(|value| Tuple(vec![value.clone()])).collect(),
                    )
                }
                (InputSpec::Relation(vars), QueryInput::Relation(rows)) => {
                    for row in rows {
                        if row.len() != vars.len() {
                            return Err(QueryError::InputMismatch {
                                message: format!(
                                    "relation input row arity {} != declared {}",
                                    row.len(),
                                    vars.len()
                                ),
                            });
                        }
                    }
                    Relation::materialized(
                        vars.clone(),
                        rows.iter().map(|row| Tuple(row.clone())).collect(),
                    )
                }
                _ => {
                    return Err(QueryError::InputMismatch {
                        message: "input value form does not match the declared :in spec"
                            .to_string(),
                    })
                }
            };
            frontier = join_relations(frontier, rel, JoinKind::Inner, self.ctx, None)?;
        }
        Ok(frontier)
    }

    /// Walk the phases. `keep_extra` columns (batched-subquery inputs) are
    /// retained through every keep projection.
    fn run_phases(&self, plan: &Plan, initial: Relation, keep_extra: &[Var]) -> Result<Relation> {
        let mut frontier = initial;
        for (idx, phase) in plan.phases.iter().enumerate() {
            self.ctx.check_cancelled()?;
            let started = Instant::now();
            self.ctx.annotations.emit_point(
                "phase/begin",
                Some(idx),
                [
                    ("patterns", Value::Int64(phase.patterns.len() as i64)),
                    ("expressions", Value::Int64(phase.expressions.len() as i64)),
                    ("predicates", Value::Int64(phase.predicates.len() as i64)),
                    ("subqueries", Value::Int64(phase.subqueries.len() as i64)),
                ],
            );
            frontier = self.run_phase(phase, idx, frontier, keep_extra)?;
            self.ctx.annotations.emit("phase/end", Some(idx), started, []);
        }
        Ok(frontier)
    }

    fn run_phase(
        &self,
        phase: &Phase,
        idx: usize,
        mut frontier: Relation,
        keep_extra: &[Var],
    ) -> Result<Relation> {
        let options = &self.ctx.options;

        for pp in &phase.patterns {
            let ranges = pp
                .pattern
                .v
                .var()
                .and_then(|v| phase.metadata.time_ranges.get(v))
                .map(Vec::as_slice);
            let low_cardinality = frontier
                .known_size()
                .is_some_and(|n| n <= options.multi_row_binding_threshold);
            let request = |bound| crate::matcher::MatchRequest {
                pattern: &pp.pattern,
                bound,
                pushed: &pp.pushed,
                time_ranges: ranges,
                phase_id: Some(idx),
            };
            frontier = if low_cardinality {
                crate::matcher::match_pattern(self.snapshot, self.stats, self.ctx, request(Some(frontier)))?
            } else {
                let scanned =
                    crate::matcher::match_pattern(self.snapshot, self.stats, self.ctx, request(None))?;
                join_relations(frontier, scanned, JoinKind::Inner, self.ctx, Some(idx))?
            };
            if !options.enable_iterator_composition {
                frontier = frontier.materialize()?;
            }
        }

        for expr in &phase.expressions {
            let compiled = CompiledExpression::compile(expr, frontier.columns(), idx)?;
            frontier = frontier.extend(expr.binding.clone(), move |t| compiled.eval(t))?;
            if !options.enable_iterator_composition {
                frontier = frontier.materialize()?;
            }
        }

        for pred in &phase.predicates {
            let compiled = CompiledPredicate::compile(pred, frontier.columns(), idx)?;
            let bus = self.ctx.annotations.clone();
            frontier = frontier.filter(move |t| match compiled.eval_checked(t) {
                Some(keep) => keep,
                None => {
                    bus.emit_point("predicate/type-mismatch", Some(idx), []);
                    false
                }
            })?;
        }

        if !phase.aggregates.is_empty() {
            frontier = self.run_phase_aggregates(phase, idx, frontier)?;
        }

        for sub in &phase.subqueries {
            let started = Instant::now();
            self.ctx.annotations.emit_point(
                "subquery/begin",
                Some(idx),
                [(
                    "strategy",
                    Value::String(format!("{:?}", sub.strategy)),
                )],
            );
            frontier = match sub.strategy {
                SubqueryStrategy::PerRow => self.run_per_row(sub, frontier, idx)?,
                SubqueryStrategy::Decorrelated => self.run_decorrelated(sub, frontier, idx)?,
            };
            self.ctx
                .annotations
                .emit("subquery/end", Some(idx), started, []);
        }

        let mut keep = phase.keep.clone();
        for extra in keep_extra {
            if !keep.contains(extra) && frontier.col_index(extra).is_some() {
                keep.push(extra.clone());
            }
        }
        frontier.project(&keep)
    }

    /// Conditional aggregates installed by the correlated-aggregate
    /// rewrite: one grouped pass collapsing the inlined columns.
    fn run_phase_aggregates(
        &self,
        phase: &Phase,
        idx: usize,
        frontier: Relation,
    ) -> Result<Relation> {
        let started = Instant::now();
        let mut collapsed: BTreeSet<Var> = BTreeSet::new();
        let mut specs = Vec::new();
        for agg in &phase.aggregates {
            collapsed.extend(agg.inner_vars.iter().cloned());
            collapsed.insert(agg.output.clone());
            specs.push(AggregateSpec {
                aggregate: agg.aggregate.clone(),
                output: agg.output.clone(),
            });
        }
        let group_by: Vec<Var> = frontier
            .columns()
            .iter()
            .filter(|c| !collapsed.contains(c))
            .cloned()
            .collect();
        let result = aggregate_relation(frontier, &group_by, &specs)?;
        self.ctx.annotations.emit(
            "aggregation/executed",
            Some(idx),
            started,
            [
                ("aggregates", Value::Int64(specs.len() as i64)),
                (
                    "groups",
                    Value::Int64(result.known_size().unwrap_or(0) as i64),
                ),
            ],
        );
        Ok(result)
    }

    /// Correlated subquery: once per outer row, optionally fanned out to
    /// the worker pool.
    fn run_per_row(
        &self,
        sub: &PhaseSubquery,
        frontier: Relation,
        idx: usize,
    ) -> Result<Relation> {
        let frontier = frontier.materialize()?;
        let outer_cols = frontier.columns().to_vec();

        enum ArgSrc {
            Database,
            Col(usize),
            Lit(Value),
        }
        let arg_srcs: Vec<ArgSrc> = sub
            .clause
            .args
            .iter()
            .map(|arg| match arg {
                SubqueryArg::Database => Ok(ArgSrc::Database),
                SubqueryArg::Lit(v) => Ok(ArgSrc::Lit(v.clone())),
                SubqueryArg::Var(v) => frontier
                    .col_index(v)
                    .map(ArgSrc::Col)
                    .ok_or_else(|| QueryError::UnboundVariable {
                        var: v.to_string(),
                        phase: idx,
                    }),
            })
            .collect::<Result<_>>()?;

        let binding_vars = sub.clause.binding.vars();
        // A binding var that is already an outer column is an equality
        // constraint, not a fresh binding.
        let equality_idx: Vec<Option<usize>> = binding_vars
            .iter()
            .map(|v| frontier.col_index(v))
            .collect();
        let mut out_cols = outer_cols.clone();
        for (var, eq) in binding_vars.iter().zip(&equality_idx) {
            if eq.is_none() {
                out_cols.push(var.clone());
            }
        }

        let plan = &sub.plan;
        let binding = &sub.clause.binding;
        let run_one = |row: &Tuple| -> Result<Vec<Tuple>> {
            let inputs: Vec<QueryInput> = arg_srcs
                .iter()
                .map(|src| match src {
                    ArgSrc::Database => QueryInput::Database,
                    ArgSrc::Col(i) => QueryInput::Scalar(row.0[*i].clone()),
                    ArgSrc::Lit(v) => QueryInput::Scalar(v.clone()),
                })
                .collect();
            let result = self.execute(plan, &inputs)?;
            let bound = destructure_binding(binding, result)?;
            let mut out = Vec::with_capacity(bound.len());
            'rows: for values in bound {
                let mut tuple = row.0.clone();
                for (value, eq) in values.into_iter().zip(&equality_idx) {
                    match eq {
                        Some(col) => {
                            if row.0[*col] != value {
                                continue 'rows;
                            }
                        }
                        None => tuple.push(value),
                    }
                }
                out.push(Tuple(tuple));
            }
            Ok(out)
        };

        let rows: Vec<Tuple> = frontier.into_tuples()?;
        let workers = self.ctx.options.parallel_subqueries;
        let row_count = rows.len();
        let results = if workers > 1 && row_count > 1 {
            parallel::map_rows(rows, workers.min(row_count), self.ctx, run_one)?
        } else {
            let mut all = Vec::new();
            for row in &rows {
                self.ctx.check_cancelled()?;
                all.extend(run_one(row)?);
            }
            all
        };
        Ok(Relation::materialized(out_cols, results))
    }

    /// Decorrelated subquery: one batched nested execution over the
    /// distinct input tuples, joined back to the outer relation.
    fn run_decorrelated(
        &self,
        sub: &PhaseSubquery,
        frontier: Relation,
        idx: usize,
    ) -> Result<Relation> {
        let frontier = frontier.materialize()?;
        let nested = &sub.clause.query;

        let mut params: Vec<Var> = Vec::new();
        let mut outer_vars: Vec<Var> = Vec::new();
        let mut const_params: Vec<(Var, Value)> = Vec::new();
        for (spec, arg) in nested.inputs.iter().zip(&sub.clause.args) {
            match (spec, arg) {
                (InputSpec::Database, SubqueryArg::Database) => {}
                (InputSpec::Scalar(p), SubqueryArg::Var(o)) => {
                    params.push(p.clone());
                    outer_vars.push(o.clone());
                }
                (InputSpec::Scalar(p), SubqueryArg::Lit(v)) => {
                    const_params.push((p.clone(), v.clone()));
                }
                _ => {
                    return Err(QueryError::invalid_plan(
                        "subquery argument form does not match nested :in spec".to_string(),
                        idx,
                    ))
                }
            }
        }

        let outer_idx: Vec<usize> = outer_vars
            .iter()
            .map(|v| {
                frontier.col_index(v).ok_or_else(|| QueryError::UnboundVariable {
                    var: v.to_string(),
                    phase: idx,
                })
            })
            .collect::<Result<_>>()?;
        let mut seen = HashSet::new();
        let mut distinct = Vec::new();
        for item in frontier.iterate()? {
            let tuple = item?;
            let key = tuple.select(&outer_idx);
            let norm: Vec<Value> = key.0.iter().map(Value::normalized).collect();
            if seen.insert(norm) {
                distinct.push(key);
            }
        }

        let mut initial = Relation::materialized(params.clone(), distinct);
        for (p, v) in const_params {
            let value = v.clone();
            initial = initial.extend(p, move |_| Ok(value.clone()))?;
        }

        let inner = self.run_phases(&sub.plan, initial, &params)?;
        let finished = self.finish(&sub.plan, inner, &params)?;

        // Rename nested parameter columns to their outer names and the
        // nested find columns to the binding variables.
        let binding_vars = sub.clause.binding.vars();
        let mut renamed_cols = Vec::with_capacity(finished.columns().len());
        for col in finished.columns() {
            if let Some(pos) = params.iter().position(|p| p == col) {
                renamed_cols.push(outer_vars[pos].clone());
            } else {
                renamed_cols.push(col.clone());
            }
        }
        let find_cols = find_columns(nested);
        for (find_col, binding_var) in find_cols.iter().zip(&binding_vars) {
            if let Some(pos) = renamed_cols.iter().position(|c| c == find_col) {
                renamed_cols[pos] = binding_var.clone();
            }
        }
        let renamed = finished.rename_columns(renamed_cols)?;
        join_relations(frontier, renamed, JoinKind::Inner, self.ctx, Some(idx))
    }

    /// Find aggregation, ordering, and final projection. `group_extra`
    /// prepends batched-subquery input columns to the aggregation keys and
    /// the output shape.
    fn finish(&self, plan: &Plan, frontier: Relation, group_extra: &[Var]) -> Result<Relation> {
        let query = &plan.query;
        let mut frontier = frontier;

        if query.has_aggregates() {
            let started = Instant::now();
            let mut group: Vec<Var> = group_extra.to_vec();
            for elem in &query.find {
                if let FindElem::Var(v) = elem {
                    if !group.contains(v) {
                        group.push(v.clone());
                    }
                }
            }
            let specs: Vec<AggregateSpec> = query
                .find
                .iter()
                .filter_map(|elem| match elem {
                    FindElem::Agg(agg) => Some(AggregateSpec {
                        aggregate: agg.clone(),
                        output: agg_output_var(agg),
                    }),
                    FindElem::Var(_) => None,
                })
                .collect();
            frontier = aggregate_relation(frontier, &group, &specs)?;
            self.ctx.annotations.emit(
                "aggregation/executed",
                None,
                started,
                [
                    ("aggregates", Value::Int64(specs.len() as i64)),
                    (
                        "groups",
                        Value::Int64(frontier.known_size().unwrap_or(0) as i64),
                    ),
                ],
            );
        }

        if !query.order_by.is_empty() {
            frontier = frontier.sort_by(&query.order_by)?;
        }

        let mut cols: Vec<Var> = Vec::new();
        let find_cols = find_columns(query);
        for extra in group_extra {
            if !find_cols.contains(extra) {
                cols.push(extra.clone());
            }
        }
        cols.extend(find_cols);
        frontier.project(&cols)
    }
}

/// Output column per find element; aggregates get a synthetic name.
fn find_columns(query: &Query) -> Vec<Var> {
    query
        .find
        .iter()
        .map(|elem| match elem {
            FindElem::Var(v) => v.clone(),
            FindElem::Agg(agg) => agg_output_var(agg),
        })
        .collect()
}

fn agg_output_var(agg: &Aggregate) -> Var {
    Var::new(&format!("{}__{}", agg.op.symbol(), agg.var.name()))
}

/// Destructure a nested query's result per the binding form.
fn destructure_binding(binding: &SubqueryBinding, result: Relation) -> Result<Vec<Vec<Value>>> {
    let rows = result.into_tuples()?;
    Ok(match binding {
        SubqueryBinding::Scalar(_) => rows
            .into_iter()
            .take(1)
            .map(|t| vec![t.0.into_iter().next().unwrap_or(Value::Null)])
            .collect(),
        SubqueryBinding::Tuple(_) => rows.into_iter().take(1).map(Tuple::into_values).collect(),
        SubqueryBinding::Collection(_) => rows
            .into_iter()
            .map(|t| vec![t.0.into_iter().next().unwrap_or(Value::Null)])
            .collect(),
        SubqueryBinding::Relation(_) => rows.into_iter().map(Tuple::into_values).collect(),
    })
}
