//! Subquery rewrites: correlated-aggregate inlining and decorrelation.
//!
//! **Conditional aggregates.** A per-row subquery of the shape
//! `(q [:find (agg ?v) :in $ ?p... :where ...] $ ?outer...)` is inlined
//! into its phase: the nested patterns and expressions join the outer
//! relation under fresh names, the single correlating equality becomes a
//! Bool condition column, and the subquery becomes a conditional aggregate
//! grouped by the surviving outer columns. Per-row nested execution
//! disappears entirely.
//!
//! The rewrite requires a witnessing outer pattern (same attribute as one
//! of the nested patterns), which keeps the inlined join non-empty for
//! every outer row the way the per-row form is.
//!
//! **Decorrelation.** The fallback when the aggregate shape does not
//! apply: a subquery correlated through exactly one outer symbol is
//! flagged for batched execution — run once over the distinct inputs and
//! joined back by the executor.

use crate::error::Result;
use crate::planner::{Phase, PhaseAggregate, PhasePattern, Plan, SubqueryStrategy};
use crate::query::{
    Aggregate, Arg, Clause, CompareOp, DataPattern, ExprOp, Expression, FindElem, InputSpec,
    Predicate, SubqueryArg, Term, Var,
};
use crate::value::Value;
use std::collections::BTreeMap;

pub fn conditional_aggregates(plan: &mut Plan) -> Result<usize> {
    let mut rewritten = 0;
    let mut counter = 0usize;
    for phase in &mut plan.phases {
        let mut idx = 0;
        while idx < phase.subqueries.len() {
            if let Some(parts) = try_inline(phase, idx, counter) {
                counter += 1;
                phase.subqueries.remove(idx);
                phase
                    .patterns
                    .extend(parts.patterns.into_iter().map(|pattern| PhasePattern {
                        pattern,
                        pushed: Vec::new(),
                    }));
                phase.expressions.extend(parts.expressions);
                phase.predicates.extend(parts.predicates);
                phase.aggregates.push(parts.aggregate);
                rewritten += 1;
            } else {
                idx += 1;
            }
        }
    }
    Ok(rewritten)
}

struct InlineParts {
    patterns: Vec<DataPattern>,
    expressions: Vec<Expression>,
    predicates: Vec<Predicate>,
    aggregate: PhaseAggregate,
}

enum Mapping {
    Outer(Var),
    Fresh(Var),
    Lit(Value),
}

fn try_inline(phase: &Phase, sub_idx: usize, counter: usize) -> Option<InlineParts> {
    let clause = &phase.subqueries[sub_idx].clause;
    let nested = &clause.query;

    if !nested.order_by.is_empty() {
        return None;
    }
    let [FindElem::Agg(agg)] = nested.find.as_slice() else {
        return None;
    };
    if agg.condition.is_some() {
        return None;
    }
    let binding_vars = clause.binding.vars();
    let [output] = binding_vars.as_slice() else {
        return None;
    };

    // Rename map: :in parameters to outer symbols or literals, everything
    // else to a fresh suffixed name.
    let mut mapping: BTreeMap<Var, Mapping> = BTreeMap::new();
    for (spec, arg) in nested.inputs.iter().zip(&clause.args) {
        match (spec, arg) {
            (InputSpec::Database, SubqueryArg::Database) => {}
            (InputSpec::Scalar(param), SubqueryArg::Var(outer)) => {
                mapping.insert(param.clone(), Mapping::Outer(outer.clone()));
            }
            (InputSpec::Scalar(param), SubqueryArg::Lit(value)) => {
                mapping.insert(param.clone(), Mapping::Lit(value.clone()));
            }
            _ => return None,
        }
    }

    let mut fresh_vars = Vec::new();
    let mut map_var = |mapping: &mut BTreeMap<Var, Mapping>, v: &Var| -> Mapping {
        if let Some(existing) = mapping.get(v) {
            return match existing {
                Mapping::Outer(o) => Mapping::Outer(o.clone()),
                Mapping::Fresh(f) => Mapping::Fresh(f.clone()),
                Mapping::Lit(l) => Mapping::Lit(l.clone()),
            };
        }
        let fresh = Var::new(&format!("{}__q{counter}", v.name()));
        fresh_vars.push(fresh.clone());
        mapping.insert(v.clone(), Mapping::Fresh(fresh.clone()));
        Mapping::Fresh(fresh)
    };

    let mut patterns = Vec::new();
    let mut expressions = Vec::new();
    let mut predicates = Vec::new();
    let mut condition: Option<Expression> = None;

    for nested_clause in &nested.clauses {
        match nested_clause {
            Clause::Pattern(p) => {
                let mut map_term = |mapping: &mut BTreeMap<Var, Mapping>, t: &Term| match t {
                    Term::Var(v) => match map_var(mapping, v) {
                        Mapping::Outer(o) => Term::Var(o),
                        Mapping::Fresh(f) => Term::Var(f),
                        Mapping::Lit(l) => Term::Lit(l),
                    },
                    other => other.clone(),
                };
                patterns.push(DataPattern {
                    e: map_term(&mut mapping, &p.e),
                    a: map_term(&mut mapping, &p.a),
                    v: map_term(&mut mapping, &p.v),
                    tx: p.tx.as_ref().map(|t| map_term(&mut mapping, t)),
                });
            }
            Clause::Expression(e) => {
                let args = e
                    .args
                    .iter()
                    .map(|a| map_arg(&mut mapping, &mut map_var, a))
                    .collect();
                let binding = match map_var(&mut mapping, &e.binding) {
                    Mapping::Fresh(f) => f,
                    // An expression rebinding an :in parameter or constant
                    // makes the inline ill-defined.
                    _ => return None,
                };
                expressions.push(Expression {
                    op: e.op,
                    args,
                    binding,
                });
            }
            Clause::Predicate(p) => {
                let mapped = map_predicate(&mut mapping, &mut map_var, p)?;
                if references_outer(&mapped, &mapping) {
                    // The correlating predicate: exactly one, an equality,
                    // and it becomes the condition column.
                    let Predicate::Compare {
                        op: CompareOp::Eq,
                        args,
                    } = &mapped
                    else {
                        return None;
                    };
                    if args.len() != 2 || condition.is_some() {
                        return None;
                    }
                    condition = Some(Expression {
                        op: ExprOp::Cmp(CompareOp::Eq),
                        args: args.clone(),
                        binding: Var::new(&format!("__cond_q{counter}")),
                    });
                } else {
                    predicates.push(mapped);
                }
            }
            Clause::Subquery(_) => return None,
        }
    }

    // Witness: some inlined pattern shares its attribute with an existing
    // outer pattern, so every outer row keeps at least one inner candidate.
    let outer_attrs: Vec<Value> = phase
        .patterns
        .iter()
        .filter_map(|p| p.pattern.a.lit().cloned())
        .collect();
    let witnessed = patterns
        .iter()
        .any(|p| p.a.lit().is_some_and(|a| outer_attrs.contains(a)));
    if !witnessed {
        return None;
    }

    let agg_var = match mapping.get(&agg.var) {
        Some(Mapping::Fresh(f)) => f.clone(),
        Some(Mapping::Outer(o)) => o.clone(),
        _ => return None,
    };

    let mut inner_vars = fresh_vars;
    let cond_binding = condition.as_ref().map(|c| c.binding.clone());
    if let Some(cond) = condition {
        inner_vars.push(cond.binding.clone());
        expressions.push(cond);
    }

    Some(InlineParts {
        patterns,
        expressions,
        predicates,
        aggregate: PhaseAggregate {
            inner_vars,
            aggregate: Aggregate {
                op: agg.op,
                var: agg_var,
                condition: cond_binding,
            },
            output: output.clone(),
        },
    })
}

fn map_arg(
    mapping: &mut BTreeMap<Var, Mapping>,
    map_var: &mut impl FnMut(&mut BTreeMap<Var, Mapping>, &Var) -> Mapping,
    arg: &Arg,
) -> Arg {
    match arg {
        Arg::Var(v) => match map_var(mapping, v) {
            Mapping::Outer(o) => Arg::Var(o),
            Mapping::Fresh(f) => Arg::Var(f),
            Mapping::Lit(l) => Arg::Lit(l),
        },
        Arg::Lit(l) => Arg::Lit(l.clone()),
    }
}

fn map_predicate(
    mapping: &mut BTreeMap<Var, Mapping>,
    map_var: &mut impl FnMut(&mut BTreeMap<Var, Mapping>, &Var) -> Mapping,
    pred: &Predicate,
) -> Option<Predicate> {
    Some(match pred {
        Predicate::Compare { op, args } => Predicate::Compare {
            op: *op,
            args: args.iter().map(|a| map_arg(mapping, map_var, a)).collect(),
        },
        Predicate::Str { test, args } => Predicate::Str {
            test: *test,
            args: args.iter().map(|a| map_arg(mapping, map_var, a)).collect(),
        },
        Predicate::Ground(v) | Predicate::Missing(v) => {
            let mapped = match map_var(mapping, v) {
                Mapping::Outer(o) => o,
                Mapping::Fresh(f) => f,
                Mapping::Lit(_) => return None,
            };
            match pred {
                Predicate::Ground(_) => Predicate::Ground(mapped),
                _ => Predicate::Missing(mapped),
            }
        }
    })
}

/// Whether a mapped predicate reads an outer symbol (a rename target of
/// the subquery's `:in` parameters).
fn references_outer(pred: &Predicate, mapping: &BTreeMap<Var, Mapping>) -> bool {
    let outer: Vec<&Var> = mapping
        .values()
        .filter_map(|m| match m {
            Mapping::Outer(o) => Some(o),
            _ => None,
        })
        .collect();
    pred.input_vars().iter().any(|v| outer.contains(&v))
}

/// Flag single-input correlated subqueries for batched execution.
pub fn decorrelate(plan: &mut Plan) -> usize {
    let mut flagged = 0;
    for phase in &mut plan.phases {
        for sub in &mut phase.subqueries {
            if sub.strategy != SubqueryStrategy::PerRow {
                continue;
            }
            let var_args = sub
                .clause
                .args
                .iter()
                .filter(|a| matches!(a, SubqueryArg::Var(_)))
                .count();
            if var_args == 1 {
                sub.strategy = SubqueryStrategy::Decorrelated;
                flagged += 1;
            }
        }
    }
    flagged
}
