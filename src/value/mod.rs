//! # Value Type System
//!
//! The tagged value sum stored in datoms and flowing through relations:
//! Null, Bool, Int64, Float64, Bytes, String, Time, Keyword, Identity.
//!
//! Equality and ordering are total. Within a type the natural order is
//! used (floats via IEEE total order, identities by raw hash bytes);
//! Int64/Float64 pairs compare numerically; any other cross-type pair is
//! ranked by a fixed type ordinal. Hashing normalizes integral floats to
//! their integer form so `5` and `5.0` land in the same hash bucket, which
//! joins rely on.

pub mod identity;
pub mod keyword;

pub use identity::{
    clear_identity_interns, l85_decode, l85_encode, Identity, ENCODED_LEN, HASH_LEN,
};
pub use keyword::{clear_keyword_interns, Keyword};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single stored or computed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
    String(String),
    Time(DateTime<Utc>),
    Keyword(Keyword),
    Identity(Identity),
}

impl Value {
    /// Fixed rank used for cross-type ordering.
    pub fn type_ordinal(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int64(_) => 2,
            Value::Float64(_) => 3,
            Value::Bytes(_) => 4,
            Value::String(_) => 5,
            Value::Time(_) => 6,
            Value::Keyword(_) => 7,
            Value::Identity(_) => 8,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Time(_) => "time",
            Value::Keyword(_) => "keyword",
            Value::Identity(_) => "identity",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<Keyword> {
        match self {
            Value::Keyword(k) => Some(*k),
            _ => None,
        }
    }

    pub fn as_identity(&self) -> Option<&Identity> {
        match self {
            Value::Identity(id) => Some(id),
            _ => None,
        }
    }

    /// Join-key normalization: integral floats become their Int64 form so
    /// numeric cross-type equality and hashing agree.
    pub fn normalized(&self) -> Value {
        if let Value::Float64(f) = self {
            if f.fract() == 0.0 && *f >= -9.007_199_254_740_992e15 && *f <= 9.007_199_254_740_992e15
            {
                return Value::Int64(*f as i64);
            }
        }
        self.clone()
    }
}

/// Numeric comparison of an Int64 against a Float64.
///
/// Exact for every i64: compares against the float's floor as i64 with a
/// fraction tiebreak rather than rounding the integer through f64.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        // IEEE total order puts NaN above every finite value.
        return Ordering::Less;
    }
    if f == f64::INFINITY {
        return Ordering::Less;
    }
    if f == f64::NEG_INFINITY {
        return Ordering::Greater;
    }
    let floor = f.floor();
    if floor >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    if floor < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    let floor_i = floor as i64;
    match i.cmp(&floor_i) {
        Ordering::Equal => {
            if f > floor {
                Ordering::Less
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            // Primitive equality first so -0.0 and 0.0 collapse into one
            // equivalence class, keeping Eq transitive through Int64(0).
            (Float64(a), Float64(b)) => {
                if a == b {
                    Ordering::Equal
                } else {
                    a.total_cmp(b)
                }
            }
            (Int64(a), Float64(b)) => cmp_int_float(*a, *b),
            (Float64(a), Int64(b)) => cmp_int_float(*b, *a).reverse(),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (Keyword(a), Keyword(b)) => a.cmp(b),
            (Identity(a), Identity(b)) => a.cmp(b),
            _ => self.type_ordinal().cmp(&other.type_ordinal()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.normalized() {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                b.hash(state);
            }
            Value::Int64(i) => {
                state.write_u8(2);
                i.hash(state);
            }
            Value::Float64(f) => {
                state.write_u8(3);
                f.to_bits().hash(state);
            }
            Value::Bytes(b) => {
                state.write_u8(4);
                b.hash(state);
            }
            Value::String(s) => {
                state.write_u8(5);
                s.hash(state);
            }
            Value::Time(t) => {
                state.write_u8(6);
                t.timestamp().hash(state);
                t.timestamp_subsec_nanos().hash(state);
            }
            Value::Keyword(k) => {
                state.write_u8(7);
                k.name().hash(state);
            }
            Value::Identity(id) => {
                state.write_u8(8);
                id.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::Float64(v) => write!(f, "{v:?}"),
            Value::Bytes(b) => {
                write!(f, "#bytes\"")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "\"")
            }
            Value::String(s) => write!(f, "{s:?}"),
            Value::Time(t) => {
                write!(f, "#inst \"{}\"", t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Keyword(k) => write!(f, "{k}"),
            Value::Identity(id) => write!(f, "{id}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<Keyword> for Value {
    fn from(v: Keyword) -> Self {
        Value::Keyword(v)
    }
}

impl From<Identity> for Value {
    fn from(v: Identity) -> Self {
        Value::Identity(v)
    }
}

/// Drop both process-wide intern tables. Test teardown only.
pub fn clear_interns() {
    clear_identity_interns();
    clear_keyword_interns();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_numeric_cross_type_equality() {
        assert_eq!(Value::Int64(5), Value::Float64(5.0));
        assert_ne!(Value::Int64(5), Value::Float64(5.000001));
        assert!(Value::Int64(5) < Value::Float64(5.000001));
        assert!(Value::Float64(4.5) < Value::Int64(5));
    }

    #[test]
    fn test_numeric_equal_values_hash_equal() {
        assert_eq!(hash_of(&Value::Int64(5)), hash_of(&Value::Float64(5.0)));
        // Non-integral floats keep their own bucket.
        assert_ne!(hash_of(&Value::Int64(5)), hash_of(&Value::Float64(5.5)));
    }

    #[test]
    fn test_large_int_float_comparison_is_exact() {
        // 2^53 + 1 is not representable as f64; the comparison must not
        // round it into equality.
        let big = (1i64 << 53) + 1;
        assert_ne!(Value::Int64(big), Value::Float64((1i64 << 53) as f64));
        assert!(Value::Float64((1i64 << 53) as f64) < Value::Int64(big));
    }

    #[test]
    fn test_cross_type_order_is_total_and_stable() {
        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int64(1),
            Value::Bytes(vec![1]),
            Value::String("a".into()),
            Value::Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            Value::Keyword(Keyword::intern(":k")),
            Value::Identity(Identity::of("x")),
        ];
        for a in &values {
            for b in &values {
                let ab = a.cmp(b);
                let ba = b.cmp(a);
                assert_eq!(ab, ba.reverse());
            }
        }
    }

    #[test]
    fn test_identity_equality_by_hash_bytes() {
        let a = Identity::of("alice");
        let b = Identity::from_bytes(*a.bytes());
        assert_eq!(Value::Identity(a), Value::Identity(b));
    }

    #[test]
    fn test_nan_is_self_equal_under_total_order() {
        assert_eq!(Value::Float64(f64::NAN), Value::Float64(f64::NAN));
        assert!(Value::Float64(1.0) < Value::Float64(f64::NAN));
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Int64(42).to_string(), "42");
        assert_eq!(Value::Float64(42.0).to_string(), "42.0");
        assert_eq!(Value::String("hi".into()).to_string(), "\"hi\"");
        assert_eq!(Value::Null.to_string(), "nil");
        assert_eq!(
            Value::Keyword(Keyword::intern("person/name")).to_string(),
            ":person/name"
        );
    }
}
