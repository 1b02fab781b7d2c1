//! Hash joins over relations.
//!
//! Inner joins build a hash table on the smaller side keyed by the shared
//! column tuple and probe the larger side lazily. Semi and anti joins share
//! the build path and emit probe-side tuples where a key did or did not
//! exist. When both inputs are streaming, a symmetric hash join pulls from
//! the sides alternately; each side's build table is capped, with overflow
//! spilled to a temp file and joined in an endgame pass.
//!
//! Key hashing normalizes numeric values, so `Int64(5)` and `Float64(5.0)`
//! land in the same bucket exactly when they compare equal.

use super::{Relation, Tuple, TupleIter};
use crate::context::QueryContext;
use crate::error::{QueryError, Result};
use crate::query::Var;
use crate::value::Value;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::time::Instant;

/// How to combine the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Semi,
    Anti,
}

/// Hash table from shared-column key tuples to rows.
///
/// Pre-sized to `min(expected, cap)` so bulk builds avoid growth; keys are
/// normalized on the way in.
pub struct TupleKeyMap {
    map: HashMap<Vec<Value>, Vec<Tuple>>,
}

impl TupleKeyMap {
    pub fn new(expected: usize, cap: usize) -> Self {
        TupleKeyMap {
            map: HashMap::with_capacity(expected.min(cap)),
        }
    }

    /// Normalized key for a tuple under the given column indices.
    pub fn key_of(tuple: &Tuple, indices: &[usize]) -> Vec<Value> {
        indices.iter().map(|&i| tuple.0[i].normalized()).collect()
    }

    pub fn insert(&mut self, key: Vec<Value>, tuple: Tuple) {
        self.map.entry(key).or_default().push(tuple);
    }

    pub fn get(&self, key: &[Value]) -> Option<&Vec<Tuple>> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &[Value]) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total tuple count across all keys.
    pub fn tuple_count(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }
}

/// Columns shared by both sides, in left-column order.
pub fn shared_columns(left: &[Var], right: &[Var]) -> Vec<Var> {
    left.iter()
        .filter(|c| right.contains(c))
        .cloned()
        .collect()
}

fn indices_of(cols: &[Var], wanted: &[Var]) -> Vec<usize> {
    wanted
        .iter()
        .map(|w| cols.iter().position(|c| c == w).expect("column present"))
        .collect()
}

/// Join two relations on their shared columns.
///
/// Output columns for an inner join are the left columns followed by the
/// right's non-shared columns; semi and anti joins keep the left columns.
/// With no shared columns every pair matches (Cartesian product); the
/// executor gates that case behind an explicit declaration.
pub fn join_relations(
    left: Relation,
    right: Relation,
    kind: JoinKind,
    ctx: &QueryContext,
    phase_id: Option<usize>,
) -> Result<Relation> {
    let shared = shared_columns(left.columns(), right.columns());
    match kind {
        JoinKind::Semi | JoinKind::Anti => filter_join(left, right, &shared, kind, ctx, phase_id),
        JoinKind::Inner => inner_join(left, right, &shared, ctx, phase_id),
    }
}

fn filter_join(
    left: Relation,
    right: Relation,
    shared: &[Var],
    kind: JoinKind,
    ctx: &QueryContext,
    phase_id: Option<usize>,
) -> Result<Relation> {
    let left_key = indices_of(left.columns(), shared);
    let right_key = indices_of(right.columns(), shared);

    let build_start = Instant::now();
    let right_tuples = right.into_tuples()?;
    let mut keys = TupleKeyMap::new(right_tuples.len(), ctx.options.join_presize_cap);
    for tuple in right_tuples {
        let key = TupleKeyMap::key_of(&tuple, &right_key);
        keys.insert(key, tuple);
    }
    ctx.annotations.emit(
        "join/build",
        phase_id,
        build_start,
        [
            ("rows", Value::Int64(keys.tuple_count() as i64)),
            ("keys", Value::Int64(keys.len() as i64)),
        ],
    );

    let want_present = kind == JoinKind::Semi;
    left.filter(move |tuple| {
        let key = TupleKeyMap::key_of(tuple, &left_key);
        keys.contains_key(&key) == want_present
    })
}

fn inner_join(
    left: Relation,
    right: Relation,
    shared: &[Var],
    ctx: &QueryContext,
    phase_id: Option<usize>,
) -> Result<Relation> {
    let right_extra: Vec<Var> = right
        .columns()
        .iter()
        .filter(|c| !shared.contains(c))
        .cloned()
        .collect();
    let mut out_cols: Vec<Var> = left.columns().to_vec();
    out_cols.extend(right_extra.iter().cloned());

    let left_key = indices_of(left.columns(), shared);
    let right_key = indices_of(right.columns(), shared);
    let right_extra_idx = indices_of(right.columns(), &right_extra);

    let both_streaming = left.is_streaming() && right.is_streaming();
    if both_streaming && ctx.options.enable_true_streaming {
        return symmetric_join(
            left,
            right,
            out_cols,
            left_key,
            right_key,
            right_extra_idx,
            ctx,
            phase_id,
        );
    }

    // Build on the smaller side when sizes are known; an unknown-size
    // (streaming) side is always the probe side, except that with two
    // unknown sides the right one is materialized.
    let build_left = match (left.known_size(), right.known_size()) {
        (Some(l), Some(r)) => l <= r,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let build_start = Instant::now();
    let (build_rel, probe_rel, build_key, probe_key) = if build_left {
        (left, right, left_key, right_key)
    } else {
        (right, left, right_key, left_key)
    };
    let build_tuples = build_rel.into_tuples()?;
    let mut map = TupleKeyMap::new(build_tuples.len(), ctx.options.join_presize_cap);
    for tuple in build_tuples {
        let key = TupleKeyMap::key_of(&tuple, &build_key);
        map.insert(key, tuple);
    }
    ctx.annotations.emit(
        "join/build",
        phase_id,
        build_start,
        [
            ("rows", Value::Int64(map.tuple_count() as i64)),
            ("keys", Value::Int64(map.len() as i64)),
            (
                "side",
                Value::String(if build_left { "left" } else { "right" }.into()),
            ),
        ],
    );

    // Composers orient probe/build tuples back into left-then-right-extra
    // output order.
    let compose = move |probe: &Tuple, build: &Tuple| -> Tuple {
        if build_left {
            // build = left, probe = right
            let mut values = build.0.clone();
            values.extend(right_extra_idx.iter().map(|&i| probe.0[i].clone()));
            Tuple(values)
        } else {
            let mut values = probe.0.clone();
            values.extend(right_extra_idx.iter().map(|&i| build.0[i].clone()));
            Tuple(values)
        }
    };

    let probe_iter = probe_rel.iterate()?;
    let iter = HashProbeIter {
        probe: probe_iter,
        map,
        probe_key,
        compose: Box::new(compose),
        pending: VecDeque::new(),
        ctx: ctx.clone(),
        phase_id,
        started: Instant::now(),
        probed: 0,
        matched: 0,
        reported: false,
    };
    Ok(Relation::streaming(out_cols, Box::new(iter)))
}

type Composer = Box<dyn Fn(&Tuple, &Tuple) -> Tuple + Send>;

struct HashProbeIter {
    probe: TupleIter,
    map: TupleKeyMap,
    probe_key: Vec<usize>,
    compose: Composer,
    pending: VecDeque<Tuple>,
    ctx: QueryContext,
    phase_id: Option<usize>,
    started: Instant,
    probed: u64,
    matched: u64,
    reported: bool,
}

impl Iterator for HashProbeIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Some(Ok(tuple));
            }
            match self.probe.next() {
                Some(Ok(tuple)) => {
                    self.probed += 1;
                    if self.probed % 1024 == 0 {
                        if let Err(e) = self.ctx.check_cancelled() {
                            return Some(Err(e));
                        }
                    }
                    let key = TupleKeyMap::key_of(&tuple, &self.probe_key);
                    if let Some(matches) = self.map.get(&key) {
                        self.matched += matches.len() as u64;
                        for build in matches {
                            self.pending.push_back((self.compose)(&tuple, build));
                        }
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    if !self.reported {
                        self.reported = true;
                        self.ctx.annotations.emit(
                            "join/probe",
                            self.phase_id,
                            self.started,
                            [
                                ("rows", Value::Int64(self.probed as i64)),
                                ("matches", Value::Int64(self.matched as i64)),
                            ],
                        );
                    }
                    return None;
                }
            }
        }
    }
}

/// One side of a symmetric hash join.
struct SymmetricSide {
    iter: TupleIter,
    map: TupleKeyMap,
    key: Vec<usize>,
    in_memory: usize,
    spill: Option<BufWriter<File>>,
    spilled: usize,
    done: bool,
}

impl SymmetricSide {
    fn new(iter: TupleIter, key: Vec<usize>, cap: usize) -> Self {
        SymmetricSide {
            iter,
            map: TupleKeyMap::new(1024, cap),
            key,
            in_memory: 0,
            spill: None,
            spilled: 0,
            done: false,
        }
    }

    /// Store an arrived tuple, spilling past the threshold. Returns whether
    /// the tuple went to memory (and may probe/be probed online).
    fn store(&mut self, tuple: Tuple, threshold: usize) -> Result<bool> {
        if self.in_memory < threshold {
            let key = TupleKeyMap::key_of(&tuple, &self.key);
            self.map.insert(key, tuple);
            self.in_memory += 1;
            Ok(true)
        } else {
            let writer = match &mut self.spill {
                Some(w) => w,
                None => {
                    let file = tempfile::tempfile()
                        .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
                    self.spill.insert(BufWriter::new(file))
                }
            };
            bincode::serialize_into(writer, &tuple)
                .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
            self.spilled += 1;
            Ok(false)
        }
    }

    /// Finish writing and reopen the spill for reading from the start.
    fn spill_reader(&mut self) -> Result<Option<BufReader<File>>> {
        let Some(writer) = self.spill.take() else {
            return Ok(None);
        };
        let mut file = writer
            .into_inner()
            .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
        file.flush()
            .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
        // Keep the spill readable again for the spill-vs-spill pass.
        let reread = file
            .try_clone()
            .map_err(|e| QueryError::storage(format!("join spill: {e}")))?;
        self.spill = Some(BufWriter::new(reread));
        Ok(Some(BufReader::new(file)))
    }
}

fn read_spilled(reader: &mut BufReader<File>) -> Result<Option<Tuple>> {
    match bincode::deserialize_from::<_, Tuple>(reader) {
        Ok(tuple) => Ok(Some(tuple)),
        Err(e) => match &*e {
            bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            _ => Err(QueryError::storage(format!("join spill: {e}"))),
        },
    }
}

/// Symmetric hash join: alternate pulls, insert into the arriving side's
/// table, probe the opposite table, emit lazily.
///
/// Pairs between spilled tuples and the rest are produced in an endgame
/// after both inputs are exhausted: each spill is replayed against the
/// opposite in-memory table, then the smaller spill is loaded and the other
/// replayed against it.
#[allow(clippy::too_many_arguments)]
fn symmetric_join(
    left: Relation,
    right: Relation,
    out_cols: Vec<Var>,
    left_key: Vec<usize>,
    right_key: Vec<usize>,
    right_extra_idx: Vec<usize>,
    ctx: &QueryContext,
    phase_id: Option<usize>,
) -> Result<Relation> {
    let threshold = ctx.options.symmetric_join_spill_threshold;
    let iter = SymmetricJoinIter {
        left: SymmetricSide::new(left.iterate()?, left_key, ctx.options.join_presize_cap),
        right: SymmetricSide::new(right.iterate()?, right_key, ctx.options.join_presize_cap),
        threshold,
        pull_left: true,
        pending: VecDeque::new(),
        right_extra_idx,
        endgame: None,
        ctx: ctx.clone(),
        phase_id,
        started: Instant::now(),
        pulled: 0,
        emitted: 0,
        reported: false,
    };
    Ok(Relation::streaming(out_cols, Box::new(iter)))
}

enum Endgame {
    LeftSpill(BufReader<File>),
    RightSpill(BufReader<File>),
    SpillVsSpill {
        reader: BufReader<File>,
        loaded: TupleKeyMap,
        reader_is_left: bool,
    },
    Done,
}

struct SymmetricJoinIter {
    left: SymmetricSide,
    right: SymmetricSide,
    threshold: usize,
    pull_left: bool,
    pending: VecDeque<Tuple>,
    right_extra_idx: Vec<usize>,
    endgame: Option<Endgame>,
    ctx: QueryContext,
    phase_id: Option<usize>,
    started: Instant,
    pulled: u64,
    emitted: u64,
    reported: bool,
}

impl SymmetricJoinIter {
    fn compose(&self, left: &Tuple, right: &Tuple) -> Tuple {
        let mut values = left.0.clone();
        values.extend(self.right_extra_idx.iter().map(|&i| right.0[i].clone()));
        Tuple(values)
    }

    fn probe_online(&mut self, from_left: bool, tuple: &Tuple) {
        let (key_idx, other) = if from_left {
            (&self.left.key, &self.right)
        } else {
            (&self.right.key, &self.left)
        };
        let key = TupleKeyMap::key_of(tuple, key_idx);
        if let Some(matches) = other.map.get(&key) {
            for m in matches {
                let composed = if from_left {
                    self.compose(tuple, m)
                } else {
                    self.compose(m, tuple)
                };
                self.pending.push_back(composed);
            }
        }
    }

    /// Pull one tuple from a side; store, probe, queue matches.
    fn step_side(&mut self, from_left: bool) -> Result<bool> {
        let side = if from_left {
            &mut self.left
        } else {
            &mut self.right
        };
        match side.iter.next() {
            Some(Ok(tuple)) => {
                self.pulled += 1;
                if self.pulled % 1024 == 0 {
                    self.ctx.check_cancelled()?;
                }
                let in_memory = if from_left {
                    self.left.store(tuple.clone(), self.threshold)?
                } else {
                    self.right.store(tuple.clone(), self.threshold)?
                };
                // Spilled tuples neither probe nor get probed online; every
                // pair involving them is produced in the endgame.
                if in_memory {
                    self.probe_online(from_left, &tuple);
                }
                Ok(true)
            }
            Some(Err(e)) => Err(e),
            None => {
                if from_left {
                    self.left.done = true;
                } else {
                    self.right.done = true;
                }
                Ok(false)
            }
        }
    }

    fn start_endgame(&mut self) -> Result<Endgame> {
        match self.left.spill_reader()? {
            Some(reader) => Ok(Endgame::LeftSpill(reader)),
            None => self.after_left_spill(),
        }
    }

    fn after_left_spill(&mut self) -> Result<Endgame> {
        match self.right.spill_reader()? {
            Some(reader) => Ok(Endgame::RightSpill(reader)),
            None => Ok(Endgame::Done),
        }
    }

    fn after_right_spill(&mut self) -> Result<Endgame> {
        // Spill-vs-spill: load the smaller spill, replay the larger.
        if self.left.spilled == 0 || self.right.spilled == 0 {
            return Ok(Endgame::Done);
        }
        let load_left = self.left.spilled <= self.right.spilled;
        let (to_load, to_read) = if load_left {
            (&mut self.left, &mut self.right)
        } else {
            (&mut self.right, &mut self.left)
        };
        let Some(mut load_reader) = to_load.spill_reader()? else {
            return Ok(Endgame::Done);
        };
        let mut loaded = TupleKeyMap::new(to_load.spilled, usize::MAX);
        while let Some(tuple) = read_spilled(&mut load_reader)? {
            let key = TupleKeyMap::key_of(&tuple, &to_load.key);
            loaded.insert(key, tuple);
        }
        let Some(reader) = to_read.spill_reader()? else {
            return Ok(Endgame::Done);
        };
        Ok(Endgame::SpillVsSpill {
            reader,
            loaded,
            reader_is_left: !load_left,
        })
    }

    fn endgame_step(&mut self) -> Result<bool> {
        let mut state = self.endgame.take().unwrap_or(Endgame::Done);
        let more = loop {
            match &mut state {
                Endgame::LeftSpill(reader) => match read_spilled(reader)? {
                    Some(tuple) => {
                        let key = TupleKeyMap::key_of(&tuple, &self.left.key);
                        if let Some(matches) = self.right.map.get(&key) {
                            for m in matches {
                                let composed = self.compose(&tuple, m);
                                self.pending.push_back(composed);
                            }
                        }
                        break true;
                    }
                    None => state = self.after_left_spill()?,
                },
                Endgame::RightSpill(reader) => match read_spilled(reader)? {
                    Some(tuple) => {
                        let key = TupleKeyMap::key_of(&tuple, &self.right.key);
                        if let Some(matches) = self.left.map.get(&key) {
                            for m in matches {
                                let composed = self.compose(m, &tuple);
                                self.pending.push_back(composed);
                            }
                        }
                        break true;
                    }
                    None => state = self.after_right_spill()?,
                },
                Endgame::SpillVsSpill {
                    reader,
                    loaded,
                    reader_is_left,
                } => match read_spilled(reader)? {
                    Some(tuple) => {
                        let key_idx = if *reader_is_left {
                            &self.left.key
                        } else {
                            &self.right.key
                        };
                        let key = TupleKeyMap::key_of(&tuple, key_idx);
                        if let Some(matches) = loaded.get(&key) {
                            for m in matches {
                                let composed = if *reader_is_left {
                                    self.compose(&tuple, m)
                                } else {
                                    self.compose(m, &tuple)
                                };
                                self.pending.push_back(composed);
                            }
                        }
                        break true;
                    }
                    None => state = Endgame::Done,
                },
                Endgame::Done => break false,
            }
        };
        self.endgame = Some(state);
        Ok(more)
    }
}

impl Iterator for SymmetricJoinIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                self.emitted += 1;
                return Some(Ok(tuple));
            }
            if !(self.left.done && self.right.done) {
                // Alternate sides while both are live; drain the survivor.
                let from_left = if self.left.done {
                    false
                } else if self.right.done {
                    true
                } else {
                    self.pull_left = !self.pull_left;
                    self.pull_left
                };
                match self.step_side(from_left) {
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }
            if self.endgame.is_none() {
                match self.start_endgame() {
                    Ok(state) => self.endgame = Some(state),
                    Err(e) => return Some(Err(e)),
                }
            }
            match self.endgame_step() {
                Ok(true) => continue,
                Ok(false) => {
                    if !self.reported {
                        self.reported = true;
                        self.ctx.annotations.emit(
                            "join/probe",
                            self.phase_id,
                            self.started,
                            [
                                ("rows", Value::Int64(self.pulled as i64)),
                                ("matches", Value::Int64(self.emitted as i64)),
                                (
                                    "spilled",
                                    Value::Int64((self.left.spilled + self.right.spilled) as i64),
                                ),
                            ],
                        );
                    }
                    return None;
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
