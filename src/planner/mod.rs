//! # Planner
//!
//! Turns a parsed query into an ordered sequence of phases.
//!
//! 1. Separate clauses into patterns, predicates, expressions, subqueries.
//! 2. Collect input symbols from `:in`.
//! 3. One phase per connected component of the patterns' shared-variable
//!    graph; predicates and expressions land in the earliest phase whose
//!    symbols cover their inputs, subqueries in the earliest phase binding
//!    their arguments (nested plans are compiled once, here).
//! 4. Greedy phase reordering by continuation score, validity-checked.
//! 5. Symbol recomputation (Available / Provides / Keep) for every phase.
//! 6. Semantic rewrites (see [`crate::rewrite`]), then recomputation again.
//! 7. Validation: every clause input bound, every find variable kept.
//!
//! Scoring is a heuristic, not an optimality claim; reordering never
//! survives a validity violation because every accepted order is
//! re-validated.
//!
//! Plans are cached process-wide keyed by the stable hash of the query AST
//! plus the options; cache hits return the same immutable `Arc<Plan>`.

pub mod cache;
pub mod stats;

pub use cache::PlanCache;
pub use stats::Statistics;

use crate::config::QueryOptions;
use crate::context::QueryContext;
use crate::error::{QueryError, Result};
use crate::matcher::TimeRange;
use crate::query::{
    Aggregate, Clause, DataPattern, Expression, Predicate, Query, SubqueryArg, SubqueryClause, Var,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Rewrite-produced phase metadata.
#[derive(Debug, Clone, Default)]
pub struct PhaseMetadata {
    /// Extracted scan ranges per time-typed variable.
    pub time_ranges: BTreeMap<Var, Vec<TimeRange>>,
}

/// A data pattern plus the predicates fused into its scan.
#[derive(Debug, Clone)]
pub struct PhasePattern {
    pub pattern: DataPattern,
    pub pushed: Vec<Predicate>,
}

/// How the executor evaluates a subquery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryStrategy {
    /// Execute once per outer row (parallelizable)
    PerRow,
    /// Execute once over the distinct input tuples and join back
    Decorrelated,
}

/// A subquery clause with its compiled nested plan.
#[derive(Debug, Clone)]
pub struct PhaseSubquery {
    pub clause: SubqueryClause,
    pub strategy: SubqueryStrategy,
    pub plan: Arc<Plan>,
}

/// A conditional aggregate installed by the correlated-aggregate rewrite.
///
/// The executor groups the working relation by everything except
/// `inner_vars`, feeding `aggregate` (whose condition column gates
/// contribution), and binds the result as `output`.
#[derive(Debug, Clone)]
pub struct PhaseAggregate {
    /// Inlined subquery columns that the grouping collapses away
    pub inner_vars: Vec<Var>,
    pub aggregate: Aggregate,
    pub output: Var,
}

/// One executor step.
#[derive(Debug, Clone, Default)]
pub struct Phase {
    pub patterns: Vec<PhasePattern>,
    pub expressions: Vec<Expression>,
    pub predicates: Vec<Predicate>,
    pub subqueries: Vec<PhaseSubquery>,
    pub aggregates: Vec<PhaseAggregate>,
    /// Symbols bound on entry
    pub available: BTreeSet<Var>,
    /// Symbols produced by this phase's clauses
    pub provides: BTreeSet<Var>,
    /// Projection applied on exit; always within Available ∪ Provides
    pub keep: Vec<Var>,
    pub metadata: PhaseMetadata,
}

impl Phase {
    fn with_patterns(patterns: Vec<DataPattern>) -> Self {
        Phase {
            patterns: patterns
                .into_iter()
                .map(|pattern| PhasePattern {
                    pattern,
                    pushed: Vec::new(),
                })
                .collect(),
            ..Phase::default()
        }
    }

    /// Symbols this phase's clauses produce.
    pub fn provides_set(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        for p in &self.patterns {
            out.extend(p.pattern.vars());
        }
        for e in &self.expressions {
            out.insert(e.binding.clone());
        }
        for s in &self.subqueries {
            out.extend(s.clause.binding.vars());
        }
        for a in &self.aggregates {
            out.insert(a.output.clone());
        }
        out
    }

    /// Symbols this phase's clauses read, including pattern variables
    /// (join keys against the frontier).
    pub fn referenced_vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        for p in &self.patterns {
            out.extend(p.pattern.vars());
            for pushed in &p.pushed {
                out.extend(pushed.input_vars());
            }
        }
        for e in &self.expressions {
            out.extend(e.input_vars());
        }
        for pred in &self.predicates {
            out.extend(pred.input_vars());
        }
        for s in &self.subqueries {
            out.extend(s.clause.input_vars());
        }
        for a in &self.aggregates {
            out.insert(a.aggregate.var.clone());
            if let Some(cond) = &a.aggregate.condition {
                out.insert(cond.clone());
            }
        }
        out
    }

    /// External inputs: referenced symbols this phase does not produce.
    pub fn external_inputs(&self) -> BTreeSet<Var> {
        let provides = self.provides_set();
        self.referenced_vars()
            .into_iter()
            .filter(|v| !provides.contains(v))
            .collect()
    }
}

/// A compiled, immutable plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub query: Arc<Query>,
    pub phases: Vec<Phase>,
    /// Stable hash of the query AST plus planner options
    pub plan_hash: u64,
}

impl Plan {
    /// Diagnostic dump; stable for a given plan, so two structurally
    /// identical plans print identically.
    pub fn pretty(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan {:016x}", self.plan_hash)?;
        for (i, phase) in self.phases.iter().enumerate() {
            writeln!(
                f,
                "  phase {i}: available={:?} provides={:?} keep={:?}",
                phase.available, phase.provides, phase.keep
            )?;
            for p in &phase.patterns {
                if p.pushed.is_empty() {
                    writeln!(f, "    pattern {}", p.pattern)?;
                } else {
                    let pushed: Vec<String> = p.pushed.iter().map(ToString::to_string).collect();
                    writeln!(f, "    pattern {} pushed={}", p.pattern, pushed.join(" "))?;
                }
            }
            for e in &phase.expressions {
                writeln!(f, "    expression {e}")?;
            }
            for p in &phase.predicates {
                writeln!(f, "    predicate {p}")?;
            }
            for a in &phase.aggregates {
                writeln!(
                    f,
                    "    aggregate {} -> {} (collapsing {:?})",
                    a.aggregate, a.output, a.inner_vars
                )?;
            }
            for s in &phase.subqueries {
                writeln!(
                    f,
                    "    subquery ({:?}) args={:?} binding={:?}",
                    s.strategy,
                    s.clause.args,
                    s.clause.binding.vars()
                )?;
            }
            for (var, ranges) in &phase.metadata.time_ranges {
                writeln!(f, "    time-ranges {var}: {ranges:?}")?;
            }
        }
        Ok(())
    }
}

/// Stable hash of the query AST plus planner options; the plan-cache key.
pub fn plan_hash(query: &Query, options: &QueryOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    options.hash(&mut hasher);
    hasher.finish()
}

/// Caching planner front end, shared across threads.
pub struct Planner {
    cache: PlanCache,
    stats: Statistics,
}

impl Planner {
    pub fn new(stats: Statistics, cache_capacity: usize) -> Self {
        Planner {
            cache: PlanCache::new(cache_capacity),
            stats,
        }
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Plan through the cache. Hits return the same immutable instance.
    pub fn plan(&self, query: &Query, ctx: &QueryContext) -> Result<Arc<Plan>> {
        let hash = plan_hash(query, &ctx.options);
        if let Some(plan) = self.cache.get(hash) {
            ctx.annotations.emit_point(
                "plan/cache.hit",
                None,
                [("hash", crate::value::Value::Int64(hash as i64))],
            );
            return Ok(plan);
        }
        ctx.annotations.emit_point(
            "plan/cache.miss",
            None,
            [("hash", crate::value::Value::Int64(hash as i64))],
        );
        let plan = plan_query(Arc::new(query.clone()), &self.stats, ctx)?;
        Ok(self.cache.insert(hash, Arc::new(plan)))
    }
}

/// Plan without the cache.
pub fn plan_query(query: Arc<Query>, stats: &Statistics, ctx: &QueryContext) -> Result<Plan> {
    let input_vars = query.input_vars();

    let mut patterns = Vec::new();
    let mut predicates = Vec::new();
    let mut expressions = Vec::new();
    let mut subqueries = Vec::new();
    for clause in &query.clauses {
        match clause {
            Clause::Pattern(p) => patterns.push(p.clone()),
            Clause::Predicate(p) => predicates.push(p.clone()),
            Clause::Expression(e) => expressions.push(e.clone()),
            Clause::Subquery(s) => subqueries.push(s.clone()),
        }
    }

    check_connectivity(&query, &ctx.options)?;

    let mut phases = build_pattern_phases(patterns);
    assign_clauses(
        &mut phases,
        predicates,
        expressions,
        subqueries,
        &input_vars,
        stats,
        ctx,
    )?;

    if ctx.options.enable_dynamic_reordering {
        reorder_phases(&mut phases, &input_vars, stats);
    }

    let mut plan = Plan {
        plan_hash: plan_hash(&query, &ctx.options),
        query,
        phases,
    };
    recompute_symbols(&mut plan)?;
    crate::rewrite::apply_rewrites(&mut plan, ctx)?;
    recompute_symbols(&mut plan)?;
    validate(&plan)?;
    Ok(plan)
}

/// Union-find connectivity over every clause's variable set plus the
/// input symbols: patterns left in separate groups by the whole query are
/// a genuine Cartesian product.
fn check_connectivity(query: &Query, options: &QueryOptions) -> Result<()> {
    let clause_vars: Vec<BTreeSet<Var>> = query
        .clauses
        .iter()
        .map(|clause| match clause {
            Clause::Pattern(p) => p.vars().into_iter().collect(),
            Clause::Predicate(p) => p.input_vars().into_iter().collect(),
            Clause::Expression(e) => {
                let mut vars: BTreeSet<Var> = e.input_vars().into_iter().collect();
                vars.insert(e.binding.clone());
                vars
            }
            Clause::Subquery(s) => {
                let mut vars: BTreeSet<Var> = s.input_vars().into_iter().collect();
                vars.extend(s.binding.vars());
                vars
            }
        })
        .collect();

    let pattern_indices: Vec<usize> = query
        .clauses
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Clause::Pattern(_)))
        .map(|(i, _)| i)
        .collect();
    if pattern_indices.len() <= 1 {
        return Ok(());
    }

    // Shared variables (input symbols included) connect clauses.
    let mut uf = UnionFind::new(clause_vars.len());
    let mut owner: BTreeMap<Var, usize> = BTreeMap::new();
    for (i, vars) in clause_vars.iter().enumerate() {
        for var in vars {
            match owner.get(var) {
                Some(&first) => uf.union(first, i),
                None => {
                    owner.insert(var.clone(), i);
                }
            }
        }
    }

    let groups: BTreeSet<usize> = pattern_indices.iter().map(|&i| uf.find(i)).collect();
    if groups.len() > 1 && !options.allow_cartesian {
        return Err(QueryError::DisjointGroups {
            groups: groups.len(),
        });
    }
    Ok(())
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// One phase per connected component of the patterns' shared-variable
/// graph, in first-appearance order.
fn build_pattern_phases(patterns: Vec<DataPattern>) -> Vec<Phase> {
    if patterns.is_empty() {
        return vec![Phase::default()];
    }
    let var_sets: Vec<BTreeSet<Var>> = patterns
        .iter()
        .map(|p| p.vars().into_iter().collect())
        .collect();
    let mut uf = UnionFind::new(patterns.len());
    for i in 0..patterns.len() {
        for j in (i + 1)..patterns.len() {
            if !var_sets[i].is_disjoint(&var_sets[j]) {
                uf.union(i, j);
            }
        }
    }
    let mut groups: Vec<(usize, Vec<DataPattern>)> = Vec::new();
    for (i, pattern) in patterns.into_iter().enumerate() {
        let root = uf.find(i);
        match groups.iter_mut().find(|(r, _)| *r == root) {
            Some((_, group)) => group.push(pattern),
            None => groups.push((root, vec![pattern])),
        }
    }
    groups
        .into_iter()
        .map(|(_, group)| Phase::with_patterns(group))
        .collect()
}

enum Pending {
    Predicate(Predicate),
    Expression(Expression),
    Subquery(SubqueryClause),
}

impl Pending {
    fn input_vars(&self) -> Vec<Var> {
        match self {
            Pending::Predicate(p) => p.input_vars(),
            Pending::Expression(e) => e.input_vars(),
            Pending::Subquery(s) => s.input_vars(),
        }
    }
}

/// Assign non-pattern clauses to their earliest admissible phase, growing
/// phase provides to fixpoint. Expressions and predicates may read the
/// phase's patterns and earlier expressions but not its subquery bindings
/// (the executor runs subqueries last).
fn assign_clauses(
    phases: &mut [Phase],
    predicates: Vec<Predicate>,
    expressions: Vec<Expression>,
    subqueries: Vec<SubqueryClause>,
    input_vars: &BTreeSet<Var>,
    stats: &Statistics,
    ctx: &QueryContext,
) -> Result<()> {
    let mut pending: Vec<Pending> = expressions
        .into_iter()
        .map(Pending::Expression)
        .chain(predicates.into_iter().map(Pending::Predicate))
        .chain(subqueries.into_iter().map(Pending::Subquery))
        .collect();

    loop {
        let mut progressed = false;
        let mut still_pending = Vec::new();

        for item in pending {
            let placed = place_clause(phases, &item, input_vars);
            match placed {
                Some(phase_idx) => {
                    progressed = true;
                    match item {
                        Pending::Predicate(p) => phases[phase_idx].predicates.push(p),
                        Pending::Expression(e) => phases[phase_idx].expressions.push(e),
                        Pending::Subquery(s) => {
                            check_subquery_args(&s, phase_idx)?;
                            let nested = plan_query(Arc::clone(&s.query), stats, ctx)?;
                            phases[phase_idx].subqueries.push(PhaseSubquery {
                                clause: s,
                                strategy: SubqueryStrategy::PerRow,
                                plan: Arc::new(nested),
                            });
                        }
                    }
                }
                None => still_pending.push(item),
            }
        }

        if still_pending.is_empty() {
            return Ok(());
        }
        if !progressed {
            return Err(stuck_error(phases, &still_pending, input_vars));
        }
        pending = still_pending;
    }
}

/// Earliest phase whose accumulated symbols cover the clause's inputs.
fn place_clause(phases: &[Phase], item: &Pending, input_vars: &BTreeSet<Var>) -> Option<usize> {
    let inputs = item.input_vars();
    let mut bound = input_vars.clone();
    for (i, phase) in phases.iter().enumerate() {
        let mut local = bound.clone();
        for p in &phase.patterns {
            local.extend(p.pattern.vars());
        }
        for e in &phase.expressions {
            local.insert(e.binding.clone());
        }
        // Subqueries run after everything else in the phase, so earlier
        // subquery bindings are visible to them and to nothing else.
        if matches!(item, Pending::Subquery(_)) {
            for s in &phase.subqueries {
                local.extend(s.clause.binding.vars());
            }
        }
        if inputs.iter().all(|v| local.contains(v)) {
            return Some(i);
        }
        bound.extend(phase.provides_set());
    }
    None
}

/// No clause could be placed: unknown variable, or a dependency cycle
/// among the stuck clauses.
fn stuck_error(phases: &[Phase], pending: &[Pending], input_vars: &BTreeSet<Var>) -> QueryError {
    let mut producible: BTreeSet<Var> = input_vars.clone();
    for phase in phases {
        producible.extend(phase.provides_set());
    }
    for item in pending {
        if let Pending::Expression(e) = item {
            producible.insert(e.binding.clone());
        }
        if let Pending::Subquery(s) = item {
            producible.extend(s.binding.vars());
        }
    }
    for item in pending {
        for var in item.input_vars() {
            if !producible.contains(&var) {
                return QueryError::UnboundVariable {
                    var: var.to_string(),
                    phase: phases.len(),
                };
            }
        }
    }
    let var = pending
        .first()
        .and_then(|item| item.input_vars().into_iter().next())
        .map_or_else(|| "?".to_string(), |v| v.to_string());
    QueryError::Cycle { var }
}

/// Greedy reorder: repeatedly take the highest-scoring phase that stays
/// valid under the symbols bound so far.
fn reorder_phases(phases: &mut Vec<Phase>, input_vars: &BTreeSet<Var>, stats: &Statistics) {
    let mut remaining = std::mem::take(phases);
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut bound = input_vars.clone();

    while !remaining.is_empty() {
        let mut best: Option<(usize, f64)> = None;
        for (i, phase) in remaining.iter().enumerate() {
            if !phase_admissible(phase, &bound) {
                continue;
            }
            let score = continuation_score(phase, &bound, stats);
            if best.is_none_or(|(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        // With no admissible candidate, fall back to source order and let
        // validation report the real problem.
        let idx = best.map_or(0, |(i, _)| i);
        let phase = remaining.remove(idx);
        bound.extend(phase.provides_set());
        ordered.push(phase);
    }
    *phases = ordered;
}

fn phase_admissible(phase: &Phase, bound: &BTreeSet<Var>) -> bool {
    phase
        .external_inputs()
        .iter()
        .all(|v| bound.contains(v))
}

/// Continuation score: estimated selectivity × overlap with bound symbols
/// minus (log-damped) estimated cardinality. A heuristic only.
fn continuation_score(phase: &Phase, bound: &BTreeSet<Var>, stats: &Statistics) -> f64 {
    let mut selectivity = 1.0f64;
    let mut cardinality = 1.0f64;
    for p in &phase.patterns {
        let attr_card = match p.pattern.a.lit().and_then(crate::value::Value::as_keyword) {
            Some(attr) => stats.cardinality(attr) as f64,
            None => stats.entity_count as f64,
        };
        let mut sel = 1.0f64;
        let bound_term = |t: &crate::query::Term| match t {
            crate::query::Term::Lit(_) => true,
            crate::query::Term::Var(v) => bound.contains(v),
            crate::query::Term::Blank => false,
        };
        if bound_term(&p.pattern.e) {
            sel *= 0.01;
        }
        if bound_term(&p.pattern.v) {
            sel *= 0.1;
        }
        selectivity = selectivity.min(sel);
        cardinality = cardinality.max(attr_card * sel);
    }
    let overlap = phase
        .provides_set()
        .iter()
        .chain(phase.external_inputs().iter())
        .filter(|v| bound.contains(*v))
        .count() as f64;
    selectivity * (1.0 + overlap) - cardinality.max(1.0).ln()
}

/// Recompute Available, Provides, and Keep for every phase: a forward
/// availability pass, then a backward needed-set pass. Run after any
/// rewrite that touches clauses.
pub fn recompute_symbols(plan: &mut Plan) -> Result<()> {
    let input_vars = plan.query.input_vars();

    let mut available = input_vars;
    for phase in &mut plan.phases {
        phase.available = available.clone();
        phase.provides = phase.provides_set();
        available.extend(phase.provides.iter().cloned());
    }

    let mut needed: BTreeSet<Var> = plan.query.find_vars().into_iter().collect();
    for elem in &plan.query.find {
        if let crate::query::FindElem::Agg(agg) = elem {
            if let Some(cond) = &agg.condition {
                needed.insert(cond.clone());
            }
        }
    }
    for (var, _) in &plan.query.order_by {
        needed.insert(var.clone());
    }
    for phase in plan.phases.iter_mut().rev() {
        let visible: BTreeSet<Var> = phase
            .available
            .union(&phase.provides)
            .cloned()
            .collect();
        phase.keep = visible.intersection(&needed).cloned().collect();
        needed.extend(phase.referenced_vars());
    }
    Ok(())
}

/// Final invariant check; failures here after rewrites are bug-class.
fn validate(plan: &Plan) -> Result<()> {
    let last_keep: BTreeSet<Var> = match plan.phases.last() {
        Some(phase) => phase.keep.iter().cloned().collect(),
        None => BTreeSet::new(),
    };
    for var in plan.query.find_vars() {
        if !last_keep.contains(&var) {
            return Err(QueryError::UnboundVariable {
                var: var.to_string(),
                phase: plan.phases.len().saturating_sub(1),
            });
        }
    }

    for (i, phase) in plan.phases.iter().enumerate() {
        let visible: BTreeSet<Var> = phase.available.union(&phase.provides).cloned().collect();
        for var in phase.referenced_vars() {
            if !visible.contains(&var) {
                return Err(QueryError::UnboundVariable {
                    var: var.to_string(),
                    phase: i,
                });
            }
        }
        for var in &phase.keep {
            if !visible.contains(var) {
                return Err(QueryError::invalid_plan(
                    format!("keep symbol {var} outside available ∪ provides"),
                    i,
                ));
            }
        }
        for sub in &phase.subqueries {
            for var in sub.clause.input_vars() {
                if !visible.contains(&var) {
                    return Err(QueryError::UnboundVariable {
                        var: var.to_string(),
                        phase: i,
                    });
                }
            }
            // Nested plan must produce what the binding destructures.
            let nested_find = sub.plan.query.find.len();
            let binding_arity = sub.clause.binding.vars().len();
            if nested_find != binding_arity {
                return Err(QueryError::invalid_plan(
                    format!(
                        "subquery binding arity {binding_arity} != nested find arity {nested_find}"
                    ),
                    i,
                ));
            }
        }
    }
    Ok(())
}

/// Check a subquery's argument list against its nested query's `:in`.
pub fn check_subquery_args(clause: &SubqueryClause, phase: usize) -> Result<()> {
    let expected = clause.query.inputs.len();
    if clause.args.len() != expected {
        return Err(QueryError::invalid_plan(
            format!(
                "subquery passes {} args, nested :in declares {expected}",
                clause.args.len()
            ),
            phase,
        ));
    }
    for (arg, spec) in clause.args.iter().zip(&clause.query.inputs) {
        let ok = matches!(
            (arg, spec),
            (SubqueryArg::Database, crate::query::InputSpec::Database)
                | (SubqueryArg::Var(_), crate::query::InputSpec::Scalar(_))
                | (SubqueryArg::Lit(_), crate::query::InputSpec::Scalar(_))
        );
        if !ok {
            return Err(QueryError::invalid_plan(
                "subquery argument form does not match nested :in spec".to_string(),
                phase,
            ));
        }
    }
    Ok(())
}
