//! # Pattern Matcher
//!
//! Turns one data pattern (plus an optional bound relation) into a tuple
//! stream backed by an index scan.
//!
//! Index choice follows the position classification: every positional
//! element is Bound (constant or bound variable), Free (unbound variable),
//! or Any (blank). The first index in the preference order whose leading
//! components are all Bound wins: AVET, AEVT, EAVT, VAET, TAEV, then a
//! full EAVT sweep as the last resort.
//!
//! A bound relation with rows constraining pattern positions triggers
//! multi-row binding: up to the configured threshold the matcher runs one
//! prefix scan per distinct binding key; past it, one batched scan with a
//! hash-set post-filter. Either way the scan output is joined back to the
//! bound relation, so the emitted columns are the bound columns followed
//! by the pattern's remaining variables.
//!
//! Matchers check the cancel token between pages (1024 entries) and emit
//! `pattern/storage-scan` / `pattern/multi-match` annotations.

use crate::context::QueryContext;
use crate::error::Result;
use crate::eval::CompiledPredicate;
use crate::planner::stats::Statistics;
use crate::query::{DataPattern, Predicate, Term, Var};
use crate::relation::{join_relations, JoinKind, Relation, Tuple};
use crate::storage::codec::{self, KeyPart};
use crate::storage::{Index, KvStream, SnapshotRef};
use crate::value::{Identity, Keyword, Value};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Instant;

/// Half-open UTC interval `[lo, hi)` pushed into an AVET scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub lo: DateTime<Utc>,
    pub hi: DateTime<Utc>,
}

/// One matcher invocation.
pub struct MatchRequest<'a> {
    pub pattern: &'a DataPattern,
    /// Frontier rows constraining the pattern's shared variables
    pub bound: Option<Relation>,
    /// Predicates fused into the scan by the pushdown rewrite
    pub pushed: &'a [Predicate],
    /// Extracted scan ranges for the pattern's V variable
    pub time_ranges: Option<&'a [TimeRange]>,
    pub phase_id: Option<usize>,
}

/// Scan page size between cancellation checks.
const PAGE: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    E,
    A,
    V,
    Tx,
}

const POSITIONS: [Pos; 4] = [Pos::E, Pos::A, Pos::V, Pos::Tx];

#[derive(Debug, Clone)]
enum PosTerm {
    Const(Value),
    Var(Var),
    Any,
}

/// Constants available for key-prefix construction, either from pattern
/// literals or from one multi-row binding key.
#[derive(Debug, Clone, Default)]
struct PrefixConsts {
    e: Option<Identity>,
    a: Option<Keyword>,
    v: Option<Value>,
    tx: Option<u64>,
}

impl PrefixConsts {
    fn bound(&self, pos: Pos) -> bool {
        match pos {
            Pos::E => self.e.is_some(),
            Pos::A => self.a.is_some(),
            Pos::V => self.v.is_some(),
            Pos::Tx => self.tx.is_some(),
        }
    }

    /// Record a constant for a position; `false` means the constant's type
    /// can never occur there, so the pattern matches nothing.
    fn set(&mut self, pos: Pos, value: &Value) -> bool {
        match pos {
            Pos::E => match value {
                Value::Identity(id) => {
                    self.e = Some(id.clone());
                    true
                }
                _ => false,
            },
            Pos::A => match value {
                Value::Keyword(k) => {
                    self.a = Some(*k);
                    true
                }
                _ => false,
            },
            Pos::V => {
                self.v = Some(value.clone());
                true
            }
            Pos::Tx => match value {
                Value::Int64(tx) if *tx >= 0 => {
                    self.tx = Some(*tx as u64);
                    true
                }
                _ => false,
            },
        }
    }

    fn key_part(&self, pos: Pos) -> Option<KeyPart> {
        match pos {
            Pos::E => self.e.clone().map(KeyPart::Entity),
            Pos::A => self.a.map(KeyPart::Attribute),
            Pos::V => self.v.clone().map(KeyPart::Value),
            Pos::Tx => self.tx.map(KeyPart::Tx),
        }
    }
}

enum ScanBounds {
    Prefix(Vec<u8>),
    Range(Vec<u8>, Vec<u8>),
}

/// Match a pattern against the snapshot.
pub fn match_pattern(
    snapshot: &SnapshotRef,
    stats: &Statistics,
    ctx: &QueryContext,
    mut req: MatchRequest<'_>,
) -> Result<Relation> {
    let terms = position_terms(req.pattern);
    let pattern_cols = pattern_columns(&terms);

    // Constants from pattern literals. A type that cannot occur at its
    // position (say an integer entity) matches nothing.
    let mut consts = PrefixConsts::default();
    for (pos, term) in POSITIONS.iter().zip(&terms) {
        if let PosTerm::Const(value) = term {
            if !consts.set(*pos, value) {
                return Ok(empty_result(req.bound, &pattern_cols));
            }
        }
    }

    let bound = match req.bound.take() {
        Some(rel) => Some(rel.materialize()?),
        None => None,
    };
    let binding_vars: Vec<Var> = match &bound {
        Some(rel) => pattern_cols
            .iter()
            .filter(|v| rel.columns().contains(v))
            .cloned()
            .collect(),
        None => Vec::new(),
    };

    let pattern_rel = if binding_vars.is_empty() {
        scan_relation(snapshot, stats, ctx, &req, &terms, &pattern_cols, consts, None)?
    } else {
        multi_row_match(
            snapshot,
            stats,
            ctx,
            &req,
            &terms,
            &pattern_cols,
            consts,
            bound.as_ref().expect("binding vars imply bound"),
            &binding_vars,
        )?
    };

    let result = match bound {
        Some(bound) => join_relations(bound, pattern_rel, JoinKind::Inner, ctx, req.phase_id)?,
        None => pattern_rel,
    };
    if ctx.options.enable_true_streaming {
        Ok(result)
    } else {
        result.materialize()
    }
}

fn empty_result(bound: Option<Relation>, pattern_cols: &[Var]) -> Relation {
    let mut cols = match &bound {
        Some(rel) => rel.columns().to_vec(),
        None => Vec::new(),
    };
    for c in pattern_cols {
        if !cols.contains(c) {
            cols.push(c.clone());
        }
    }
    Relation::empty(cols)
}

/// The multi-row binding paths: per-key prefix scans below the threshold,
/// one batched scan with post-filtering above it.
#[allow(clippy::too_many_arguments)]
fn multi_row_match(
    snapshot: &SnapshotRef,
    stats: &Statistics,
    ctx: &QueryContext,
    req: &MatchRequest<'_>,
    terms: &[PosTerm; 4],
    pattern_cols: &[Var],
    consts: PrefixConsts,
    bound: &Relation,
    binding_vars: &[Var],
) -> Result<Relation> {
    let started = Instant::now();
    let binding_idx: Vec<usize> = binding_vars
        .iter()
        .map(|v| bound.col_index(v).expect("binding var in bound"))
        .collect();
    let mut keys: Vec<Vec<Value>> = Vec::new();
    let mut seen = HashSet::new();
    for item in bound.iterate()? {
        let tuple = item?;
        let key: Vec<Value> = binding_idx
            .iter()
            .map(|&i| tuple.0[i].normalized())
            .collect();
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    }

    if keys.is_empty() {
        return Ok(Relation::empty(pattern_cols.to_vec()));
    }

    // Per-key scans are only sound when the key prefix covers every
    // binding-constrained position; otherwise two keys would share a
    // prefix and emit the same datoms twice.
    let per_key = keys.len() <= ctx.options.multi_row_binding_threshold
        && keys
            .first()
            .and_then(|key| augment_consts(&consts, terms, binding_vars, key))
            .is_some_and(|augmented| prefix_covers_bindings(stats, terms, &augmented, binding_vars));
    ctx.annotations.emit(
        "pattern/multi-match",
        req.phase_id,
        started,
        [
            ("keys", Value::Int64(keys.len() as i64)),
            (
                "strategy",
                Value::String(if per_key { "per-key" } else { "batched" }.into()),
            ),
        ],
    );

    if per_key {
        // One compiled key prefix per distinct binding key, all feeding a
        // single chained stream.
        let mut all_scans = Vec::new();
        let mut index = Index::Eavt;
        for key in &keys {
            let Some(augmented) = augment_consts(&consts, terms, binding_vars, key) else {
                continue;
            };
            let (idx, scans) = plan_scans(stats, terms, &augmented, req.time_ranges);
            index = idx;
            all_scans.extend(scans);
        }
        build_stream(
            snapshot, ctx, req, terms, pattern_cols, consts, index, all_scans, None,
        )
    } else {
        let (index, scans) = plan_scans(stats, terms, &consts, req.time_ranges);
        // Positions of binding vars inside the pattern output layout.
        let filter_idx: Vec<usize> = binding_vars
            .iter()
            .map(|v| {
                pattern_cols
                    .iter()
                    .position(|c| c == v)
                    .expect("binding var is a pattern column")
            })
            .collect();
        let allowed: HashSet<Vec<Value>> = keys.into_iter().collect();
        build_stream(
            snapshot,
            ctx,
            req,
            terms,
            pattern_cols,
            consts,
            index,
            scans,
            Some((filter_idx, allowed)),
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn scan_relation(
    snapshot: &SnapshotRef,
    stats: &Statistics,
    ctx: &QueryContext,
    req: &MatchRequest<'_>,
    terms: &[PosTerm; 4],
    pattern_cols: &[Var],
    consts: PrefixConsts,
    allowed: Option<(Vec<usize>, HashSet<Vec<Value>>)>,
) -> Result<Relation> {
    let (index, scans) = plan_scans(stats, terms, &consts, req.time_ranges);
    build_stream(
        snapshot, ctx, req, terms, pattern_cols, consts, index, scans, allowed,
    )
}

/// Extend the pattern constants with one binding key's values. `None`
/// when a value's type cannot occur at its position.
fn augment_consts(
    consts: &PrefixConsts,
    terms: &[PosTerm; 4],
    binding_vars: &[Var],
    key: &[Value],
) -> Option<PrefixConsts> {
    let mut augmented = consts.clone();
    for (var, value) in binding_vars.iter().zip(key) {
        for (pos, term) in POSITIONS.iter().zip(terms) {
            if matches!(term, PosTerm::Var(v) if v == var) && !augmented.bound(*pos) {
                if !augmented.set(*pos, value) {
                    return None;
                }
            }
        }
    }
    Some(augmented)
}

/// Whether the index chosen for an augmented key consumes every
/// binding-constrained position into the key prefix.
fn prefix_covers_bindings(
    stats: &Statistics,
    terms: &[PosTerm; 4],
    augmented: &PrefixConsts,
    binding_vars: &[Var],
) -> bool {
    let index = select_index(stats, augmented);
    let mut consumed = Vec::new();
    for component in index.components() {
        let pos = component_pos(component);
        if augmented.bound(pos) {
            consumed.push(pos);
        } else {
            break;
        }
    }
    POSITIONS.iter().zip(terms).all(|(pos, term)| {
        match term {
            PosTerm::Var(v) if binding_vars.contains(v) => consumed.contains(pos),
            _ => true,
        }
    })
}

fn component_pos(component: crate::storage::Component) -> Pos {
    match component {
        crate::storage::Component::Entity => Pos::E,
        crate::storage::Component::Attribute => Pos::A,
        crate::storage::Component::Value => Pos::V,
        crate::storage::Component::Tx => Pos::Tx,
    }
}

fn position_terms(pattern: &DataPattern) -> [PosTerm; 4] {
    let conv = |t: &Term| match t {
        Term::Var(v) => PosTerm::Var(v.clone()),
        Term::Blank => PosTerm::Any,
        Term::Lit(v) => PosTerm::Const(v.clone()),
    };
    [
        conv(&pattern.e),
        conv(&pattern.a),
        conv(&pattern.v),
        pattern.tx.as_ref().map_or(PosTerm::Any, |t| conv(t)),
    ]
}

/// Distinct pattern variables in E, A, V, Tx order.
fn pattern_columns(terms: &[PosTerm; 4]) -> Vec<Var> {
    let mut cols = Vec::new();
    for term in terms {
        if let PosTerm::Var(v) = term {
            if !cols.contains(v) {
                cols.push(v.clone());
            }
        }
    }
    cols
}

/// Choose the index and concrete scan bounds for one set of constants.
fn plan_scans(
    stats: &Statistics,
    terms: &[PosTerm; 4],
    consts: &PrefixConsts,
    time_ranges: Option<&[TimeRange]>,
) -> (Index, Vec<ScanBounds>) {
    let index = select_index(stats, consts);

    // Time-range pushdown: with the attribute bound and ranges extracted
    // for the free V variable, scan AVET range by range.
    if let (Some(attr), Some(ranges)) = (consts.a, time_ranges) {
        if consts.v.is_none() && matches!(terms[2], PosTerm::Var(_)) && !ranges.is_empty() {
            let prefix = codec::encode_key_prefix(Index::Avet, &[KeyPart::Attribute(attr)])
                .expect("attribute prefix");
            let scans = ranges
                .iter()
                .map(|range| {
                    let mut lo = prefix.clone();
                    codec::encode_value(&Value::Time(range.lo), &mut lo);
                    let mut hi = prefix.clone();
                    codec::encode_value(&Value::Time(range.hi), &mut hi);
                    ScanBounds::Range(lo, hi)
                })
                .collect();
            return (Index::Avet, scans);
        }
    }

    let mut parts = Vec::new();
    for component in index.components() {
        match consts.key_part(component_pos(component)) {
            Some(part) => parts.push(part),
            None => break,
        }
    }
    let prefix = codec::encode_key_prefix(index, &parts).expect("parts follow component order");
    (index, vec![ScanBounds::Prefix(prefix)])
}

/// Preference order: AVET (A+V), AEVT (A+E), EAVT (E), VAET (V with A
/// free), TAEV (Tx), full EAVT sweep. An attribute-only pattern prefers
/// AEVT unless the attribute is high-cardinality enough that value order
/// buys nothing either way.
fn select_index(stats: &Statistics, consts: &PrefixConsts) -> Index {
    let (e, a, v, tx) = (
        consts.e.is_some(),
        consts.a.is_some(),
        consts.v.is_some(),
        consts.tx.is_some(),
    );
    if a && v {
        Index::Avet
    } else if a && e {
        Index::Aevt
    } else if e {
        Index::Eavt
    } else if v {
        Index::Vaet
    } else if tx {
        Index::Taev
    } else if a {
        // AEVT and AVET reach the same rows through the attribute prefix.
        // Value-major order serves small attributes feeding comparisons and
        // range predicates; entity-major locality wins once the attribute
        // is large and downstream joins key on E.
        if stats.cardinality(consts.a.expect("attribute bound")) <= 1024 {
            Index::Avet
        } else {
            Index::Aevt
        }
    } else {
        Index::Eavt
    }
}

/// Assemble the streaming relation over the planned scans.
#[allow(clippy::too_many_arguments)]
fn build_stream(
    snapshot: &SnapshotRef,
    ctx: &QueryContext,
    req: &MatchRequest<'_>,
    terms: &[PosTerm; 4],
    pattern_cols: &[Var],
    consts: PrefixConsts,
    index: Index,
    scans: Vec<ScanBounds>,
    allowed: Option<(Vec<usize>, HashSet<Vec<Value>>)>,
) -> Result<Relation> {
    // Per-column source positions: the first occurrence of a var emits,
    // later occurrences of the same var filter for equality.
    let mut first_pos_of_slot: Vec<Option<Pos>> = vec![None; pattern_cols.len()];
    let mut dup_checks: Vec<(Pos, usize)> = Vec::new();
    for (pos, term) in POSITIONS.iter().zip(terms) {
        if let PosTerm::Var(v) = term {
            let slot = pattern_cols.iter().position(|c| c == v).expect("var in cols");
            if first_pos_of_slot[slot].is_none() {
                first_pos_of_slot[slot] = Some(*pos);
            } else {
                dup_checks.push((*pos, slot));
            }
        }
    }
    let first_positions: Vec<Pos> = first_pos_of_slot
        .into_iter()
        .map(|p| p.expect("every column has a source position"))
        .collect();

    let pushed: Vec<CompiledPredicate> = req
        .pushed
        .iter()
        .filter(|p| {
            p.input_vars()
                .iter()
                .all(|v| pattern_cols.contains(v))
        })
        .map(|p| CompiledPredicate::compile(p, pattern_cols, req.phase_id.unwrap_or(0)))
        .collect::<Result<_>>()?;

    let scan_iter = DatomScan {
        snapshot: snapshot.clone(),
        ctx: ctx.clone(),
        index,
        scans: scans.into(),
        current: None,
        count: 0,
        phase_id: req.phase_id,
    };

    let iter = scan_iter.filter_map(move |item| {
        let datom = match item {
            Ok(d) => d,
            Err(e) => return Some(Err(e)),
        };
        // Constant positions not covered by the key prefix.
        if let Some(e) = &consts.e {
            if &datom.e != e {
                return None;
            }
        }
        if let Some(a) = consts.a {
            if datom.a != a {
                return None;
            }
        }
        if let Some(v) = &consts.v {
            if &datom.v != v {
                return None;
            }
        }
        if let Some(tx) = consts.tx {
            if datom.tx != tx {
                return None;
            }
        }
        let tuple = Tuple(
            first_positions
                .iter()
                .map(|pos| position_value(&datom, *pos))
                .collect(),
        );
        for (pos, slot) in &dup_checks {
            if position_value(&datom, *pos) != tuple.0[*slot] {
                return None;
            }
        }
        if let Some((filter_idx, allowed)) = &allowed {
            let key: Vec<Value> = filter_idx
                .iter()
                .map(|&i| tuple.0[i].normalized())
                .collect();
            if !allowed.contains(&key) {
                return None;
            }
        }
        for pred in &pushed {
            if !pred.eval(&tuple) {
                return None;
            }
        }
        Some(Ok(tuple))
    });

    Ok(Relation::streaming(pattern_cols.to_vec(), Box::new(iter)))
}

fn position_value(datom: &crate::datom::Datom, pos: Pos) -> Value {
    match pos {
        Pos::E => Value::Identity(datom.e.clone()),
        Pos::A => Value::Keyword(datom.a),
        Pos::V => datom.v.clone(),
        Pos::Tx => Value::Int64(datom.tx as i64),
    }
}

/// Lazily walks the planned scans, decoding datoms and checking the cancel
/// token between pages.
struct DatomScan {
    snapshot: SnapshotRef,
    ctx: QueryContext,
    index: Index,
    scans: VecDeque<ScanBounds>,
    current: Option<KvStream>,
    count: u64,
    phase_id: Option<usize>,
}

impl Iterator for DatomScan {
    type Item = Result<crate::datom::Datom>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stream) = &mut self.current {
                match stream.next() {
                    Some(Ok((_key, payload))) => {
                        self.count += 1;
                        if self.count % PAGE == 0 {
                            if let Err(e) = self.ctx.check_cancelled() {
                                return Some(Err(e));
                            }
                        }
                        return Some(codec::decode_datom(&payload));
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => self.current = None,
                }
            }
            let bounds = self.scans.pop_front()?;
            self.ctx.annotations.emit_point(
                "pattern/storage-scan",
                self.phase_id,
                [
                    ("index", Value::String(self.index.name().into())),
                    (
                        "kind",
                        Value::String(
                            match &bounds {
                                ScanBounds::Prefix(_) => "prefix",
                                ScanBounds::Range(_, _) => "range",
                            }
                            .into(),
                        ),
                    ),
                ],
            );
            self.current = Some(match &bounds {
                ScanBounds::Prefix(prefix) => self.snapshot.scan(self.index, prefix),
                ScanBounds::Range(lo, hi) => self.snapshot.scan_range(self.index, lo, hi),
            });
        }
    }
}
