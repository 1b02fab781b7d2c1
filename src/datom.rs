//! The atomic unit of fact.

use crate::value::{Identity, Keyword, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An immutable `(Entity, Attribute, Value, Transaction)` record.
///
/// `tx` is a monotone logical timestamp; higher values are newer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datom {
    pub e: Identity,
    pub a: Keyword,
    pub v: Value,
    pub tx: u64,
}

impl Datom {
    pub fn new(e: Identity, a: Keyword, v: impl Into<Value>, tx: u64) -> Self {
        Datom {
            e,
            a,
            v: v.into(),
            tx,
        }
    }
}

impl fmt::Display for Datom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.e, self.a, self.v, self.tx)
    }
}
