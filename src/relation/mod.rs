//! # Relation Algebra
//!
//! Relations are sequences of tuples over a declared, ordered column set.
//! Two concrete shapes:
//!
//! - **Materialized**: a vector of tuples; every `iterate` returns a fresh
//!   multi-pass view.
//! - **Streaming**: a lazy, single-use tuple stream; iterating consumes it,
//!   and a second `iterate` fails with `IteratorConsumed`.
//!
//! A **buffered** relation upgrades a stream to multi-pass by spooling on
//! first iteration. Filter/project/transform compose lazily on streams and
//! apply eagerly on materialized data, so the source's materialization kind
//! is preserved either way.
//!
//! Joins live in [`join`].

pub mod join;

pub use join::{join_relations, JoinKind, TupleKeyMap};

use crate::error::{QueryError, Result};
use crate::query::{SortOrder, Var};
use crate::value::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One row of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tuple(pub Vec<Value>);

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Tuple(values)
    }

    pub fn empty() -> Self {
        Tuple(Vec::new())
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Project through a precomputed index list.
    pub fn select(&self, indices: &[usize]) -> Tuple {
        Tuple(indices.iter().map(|&i| self.0[i].clone()).collect())
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

impl FromIterator<Value> for Tuple {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Tuple(iter.into_iter().collect())
    }
}

/// A single-use tuple stream.
pub type TupleIter = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

struct MaterializedIter {
    data: Arc<Vec<Tuple>>,
    idx: usize,
}

impl Iterator for MaterializedIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.data.get(self.idx)?.clone();
        self.idx += 1;
        Some(Ok(item))
    }
}

enum Body {
    Materialized(Arc<Vec<Tuple>>),
    Streaming(Option<TupleIter>),
    Buffered {
        source: Option<TupleIter>,
        cache: Option<Arc<Vec<Tuple>>>,
    },
}

/// A relation: ordered columns plus tuples, materialized or streaming.
pub struct Relation {
    cols: Arc<Vec<Var>>,
    body: Mutex<Body>,
    meta: BTreeMap<String, Value>,
}

impl Relation {
    /// The unit relation: no columns, one empty tuple. Joining against it
    /// is the identity, which is what seeds a phase pipeline.
    pub fn unit() -> Relation {
        Relation::materialized(Vec::new(), vec![Tuple::empty()])
    }

    pub fn empty(cols: Vec<Var>) -> Relation {
        Relation::materialized(cols, Vec::new())
    }

    pub fn materialized(cols: Vec<Var>, tuples: Vec<Tuple>) -> Relation {
        Relation {
            cols: Arc::new(cols),
            body: Mutex::new(Body::Materialized(Arc::new(tuples))),
            meta: BTreeMap::new(),
        }
    }

    pub fn streaming(cols: Vec<Var>, iter: TupleIter) -> Relation {
        Relation {
            cols: Arc::new(cols),
            body: Mutex::new(Body::Streaming(Some(iter))),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Relation {
        self.meta.insert(key.to_string(), value);
        self
    }

    pub fn meta(&self) -> &BTreeMap<String, Value> {
        &self.meta
    }

    /// Ordered column set.
    pub fn columns(&self) -> &[Var] {
        &self.cols
    }

    pub fn col_index(&self, var: &Var) -> Option<usize> {
        self.cols.iter().position(|c| c == var)
    }

    /// Whether iteration would consume this relation.
    pub fn is_streaming(&self) -> bool {
        match &*self.body.lock() {
            Body::Materialized(_) => false,
            Body::Streaming(_) => true,
            Body::Buffered { cache, .. } => cache.is_none(),
        }
    }

    /// Tuple count when it is known without consuming anything.
    pub fn known_size(&self) -> Option<usize> {
        match &*self.body.lock() {
            Body::Materialized(data) => Some(data.len()),
            Body::Streaming(_) => None,
            Body::Buffered { cache, .. } => cache.as_ref().map(|c| c.len()),
        }
    }

    /// Exact tuple count. Materializes a streaming relation in place.
    pub fn size(&self) -> Result<usize> {
        let mut body = self.body.lock();
        match &mut *body {
            Body::Materialized(data) => Ok(data.len()),
            Body::Streaming(iter) => {
                let iter = iter.take().ok_or(QueryError::IteratorConsumed)?;
                let tuples = iter.collect::<Result<Vec<_>>>()?;
                let len = tuples.len();
                *body = Body::Materialized(Arc::new(tuples));
                Ok(len)
            }
            Body::Buffered { source, cache } => {
                if cache.is_none() {
                    let iter = source.take().ok_or(QueryError::IteratorConsumed)?;
                    *cache = Some(Arc::new(iter.collect::<Result<Vec<_>>>()?));
                }
                Ok(cache.as_ref().map(|c| c.len()).unwrap_or(0))
            }
        }
    }

    /// Produce a tuple stream.
    ///
    /// Consumes a streaming relation; returns a fresh view of a
    /// materialized one; spools a buffered one on first call.
    pub fn iterate(&self) -> Result<TupleIter> {
        let mut body = self.body.lock();
        match &mut *body {
            Body::Materialized(data) => Ok(Box::new(MaterializedIter {
                data: Arc::clone(data),
                idx: 0,
            })),
            Body::Streaming(iter) => iter.take().ok_or(QueryError::IteratorConsumed),
            Body::Buffered { source, cache } => {
                if cache.is_none() {
                    let iter = source.take().ok_or(QueryError::IteratorConsumed)?;
                    *cache = Some(Arc::new(iter.collect::<Result<Vec<_>>>()?));
                }
                let data = Arc::clone(cache.as_ref().expect("cache just filled"));
                Ok(Box::new(MaterializedIter { data, idx: 0 }))
            }
        }
    }

    /// Multi-pass upgrade: a streaming relation spools on first iteration,
    /// anything else is returned unchanged.
    pub fn buffered(self) -> Relation {
        let meta = self.meta.clone();
        let cols = Arc::clone(&self.cols);
        let body = self.body.into_inner();
        let body = match body {
            Body::Streaming(Some(iter)) => Body::Buffered {
                source: Some(iter),
                cache: None,
            },
            other => other,
        };
        Relation {
            cols,
            body: Mutex::new(body),
            meta,
        }
    }

    /// Force materialization now.
    pub fn materialize(self) -> Result<Relation> {
        let cols = (*self.cols).clone();
        let meta = self.meta.clone();
        let tuples = self.into_tuples()?;
        let mut rel = Relation::materialized(cols, tuples);
        rel.meta = meta;
        Ok(rel)
    }

    /// Consume into a tuple vector.
    pub fn into_tuples(self) -> Result<Vec<Tuple>> {
        match self.body.into_inner() {
            Body::Materialized(data) => {
                Ok(Arc::try_unwrap(data).unwrap_or_else(|arc| (*arc).clone()))
            }
            Body::Streaming(iter) => iter
                .ok_or(QueryError::IteratorConsumed)?
                .collect::<Result<Vec<_>>>(),
            Body::Buffered { source, cache } => match cache {
                Some(data) => Ok(Arc::try_unwrap(data).unwrap_or_else(|arc| (*arc).clone())),
                None => source
                    .ok_or(QueryError::IteratorConsumed)?
                    .collect::<Result<Vec<_>>>(),
            },
        }
    }

    /// Lazy filter. Preserves materialization kind.
    pub fn filter<F>(self, mut pred: F) -> Result<Relation>
    where
        F: FnMut(&Tuple) -> bool + Send + 'static,
    {
        let cols = (*self.cols).clone();
        if self.is_streaming() {
            let iter = self.iterate()?;
            Ok(Relation::streaming(
                cols,
                Box::new(iter.filter(move |item| match item {
                    Ok(tuple) => pred(tuple),
                    Err(_) => true,
                })),
            ))
        } else {
            let tuples = self
                .into_tuples()?
                .into_iter()
                .filter(|t| pred(t))
                .collect();
            Ok(Relation::materialized(cols, tuples))
        }
    }

    /// Lazy projection onto a column subset (or reordering).
    pub fn project(self, keep: &[Var]) -> Result<Relation> {
        if keep == self.columns() {
            return Ok(self);
        }
        let indices = keep
            .iter()
            .map(|v| {
                self.col_index(v).ok_or_else(|| {
                    QueryError::invalid_plan(format!("projection references missing column {v}"), 0)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let cols = keep.to_vec();
        if self.is_streaming() {
            let iter = self.iterate()?;
            Ok(Relation::streaming(
                cols,
                Box::new(iter.map(move |item| item.map(|t| t.select(&indices)))),
            ))
        } else {
            let tuples = self
                .into_tuples()?
                .into_iter()
                .map(|t| t.select(&indices))
                .collect();
            Ok(Relation::materialized(cols, tuples))
        }
    }

    /// Lazy row transform onto a new column set.
    pub fn transform<F>(self, new_cols: Vec<Var>, mut f: F) -> Result<Relation>
    where
        F: FnMut(Tuple) -> Result<Tuple> + Send + 'static,
    {
        if self.is_streaming() {
            let iter = self.iterate()?;
            Ok(Relation::streaming(
                new_cols,
                Box::new(iter.map(move |item| item.and_then(&mut f))),
            ))
        } else {
            let tuples = self
                .into_tuples()?
                .into_iter()
                .map(f)
                .collect::<Result<Vec<_>>>()?;
            Ok(Relation::materialized(new_cols, tuples))
        }
    }

    /// Append one computed column.
    pub fn extend<F>(self, col: Var, mut f: F) -> Result<Relation>
    where
        F: FnMut(&Tuple) -> Result<Value> + Send + 'static,
    {
        let mut cols = (*self.cols).clone();
        cols.push(col);
        self.transform(cols, move |mut tuple| {
            let value = f(&tuple)?;
            tuple.0.push(value);
            Ok(tuple)
        })
    }

    /// Rename columns positionally; arity must match.
    pub fn rename_columns(self, new_cols: Vec<Var>) -> Result<Relation> {
        if new_cols.len() != self.cols.len() {
            return Err(QueryError::invalid_plan(
                format!(
                    "rename arity mismatch: {} columns renamed to {}",
                    self.cols.len(),
                    new_cols.len()
                ),
                0,
            ));
        }
        let meta = self.meta.clone();
        let body = self.body.into_inner();
        Ok(Relation {
            cols: Arc::new(new_cols),
            body: Mutex::new(body),
            meta,
        })
    }

    /// Deduplicate, preserving first-seen order. Materializes.
    pub fn distinct(self) -> Result<Relation> {
        let cols = (*self.cols).clone();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tuple in self.into_tuples()? {
            let key: Vec<Value> = tuple.values().iter().map(Value::normalized).collect();
            if seen.insert(key) {
                out.push(tuple);
            }
        }
        Ok(Relation::materialized(cols, out))
    }

    /// Stable sort by the given keys. Materializes.
    pub fn sort_by(self, keys: &[(Var, SortOrder)]) -> Result<Relation> {
        let indices = keys
            .iter()
            .map(|(v, order)| {
                self.col_index(v)
                    .map(|i| (i, *order))
                    .ok_or_else(|| {
                        QueryError::invalid_plan(format!("order-by references missing column {v}"), 0)
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let cols = (*self.cols).clone();
        let mut tuples = self.into_tuples()?;
        tuples.sort_by(|a, b| {
            for (idx, order) in &indices {
                let ord = a.0[*idx].cmp(&b.0[*idx]);
                let ord = match order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(Relation::materialized(cols, tuples))
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("cols", &self.cols)
            .field("size", &self.known_size())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(rel: Relation) -> Vec<Tuple> {
        rel.into_tuples().expect("iterable")
    }

    fn int_rel(cols: &[&str], data: &[&[i64]]) -> Relation {
        Relation::materialized(
            cols.iter().map(|c| Var::new(c)).collect(),
            data.iter()
                .map(|row| Tuple(row.iter().map(|&i| Value::Int64(i)).collect()))
                .collect(),
        )
    }

    fn streaming_ints(cols: &[&str], data: Vec<Vec<i64>>) -> Relation {
        Relation::streaming(
            cols.iter().map(|c| Var::new(c)).collect(),
            Box::new(data.into_iter().map(|row| {
                Ok(Tuple(row.into_iter().map(Value::Int64).collect()))
            })),
        )
    }

    #[test]
    fn test_materialized_is_multi_pass() {
        let rel = int_rel(&["x"], &[&[1], &[2]]);
        assert_eq!(rel.iterate().unwrap().count(), 2);
        assert_eq!(rel.iterate().unwrap().count(), 2);
    }

    #[test]
    fn test_streaming_is_single_use() {
        let rel = streaming_ints(&["x"], vec![vec![1], vec![2]]);
        assert_eq!(rel.iterate().unwrap().count(), 2);
        assert!(matches!(rel.iterate(), Err(QueryError::IteratorConsumed)));
    }

    #[test]
    fn test_buffered_upgrades_to_multi_pass() {
        let rel = streaming_ints(&["x"], vec![vec![1], vec![2], vec![3]]).buffered();
        assert_eq!(rel.iterate().unwrap().count(), 3);
        assert_eq!(rel.iterate().unwrap().count(), 3);
        assert_eq!(rel.known_size(), Some(3));
    }

    #[test]
    fn test_filter_preserves_kind() {
        let mat = int_rel(&["x"], &[&[1], &[2], &[3]])
            .filter(|t| t.0[0].as_i64().unwrap() > 1)
            .unwrap();
        assert!(!mat.is_streaming());
        assert_eq!(rows(mat).len(), 2);

        let stream = streaming_ints(&["x"], vec![vec![1], vec![2], vec![3]])
            .filter(|t| t.0[0].as_i64().unwrap() > 1)
            .unwrap();
        assert!(stream.is_streaming());
        assert_eq!(rows(stream).len(), 2);
    }

    #[test]
    fn test_project_reorders() {
        let rel = int_rel(&["x", "y"], &[&[1, 10], &[2, 20]]);
        let projected = rel.project(&[Var::new("y"), Var::new("x")]).unwrap();
        assert_eq!(projected.columns(), &[Var::new("y"), Var::new("x")]);
        assert_eq!(
            rows(projected)[0],
            Tuple(vec![Value::Int64(10), Value::Int64(1)])
        );
    }

    #[test]
    fn test_project_missing_column_is_plan_bug() {
        let rel = int_rel(&["x"], &[&[1]]);
        assert!(matches!(
            rel.project(&[Var::new("nope")]),
            Err(QueryError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn test_unit_seeds_pipelines() {
        let unit = Relation::unit();
        assert_eq!(unit.columns().len(), 0);
        assert_eq!(unit.known_size(), Some(1));
    }

    #[test]
    fn test_distinct_normalizes_numerics() {
        let rel = Relation::materialized(
            vec![Var::new("x")],
            vec![
                Tuple(vec![Value::Int64(5)]),
                Tuple(vec![Value::Float64(5.0)]),
                Tuple(vec![Value::Int64(6)]),
            ],
        );
        assert_eq!(rows(rel.distinct().unwrap()).len(), 2);
    }

    #[test]
    fn test_sort_desc() {
        let rel = int_rel(&["x"], &[&[2], &[3], &[1]]);
        let sorted = rel.sort_by(&[(Var::new("x"), SortOrder::Desc)]).unwrap();
        let values: Vec<i64> = rows(sorted)
            .into_iter()
            .map(|t| t.0[0].as_i64().unwrap())
            .collect();
        assert_eq!(values, vec![3, 2, 1]);
    }

    #[test]
    fn test_size_materializes_stream_in_place() {
        let rel = streaming_ints(&["x"], vec![vec![1], vec![2]]);
        assert_eq!(rel.size().unwrap(), 2);
        // After size(), the relation became materialized and multi-pass.
        assert_eq!(rel.iterate().unwrap().count(), 2);
        assert_eq!(rel.iterate().unwrap().count(), 2);
    }
}
