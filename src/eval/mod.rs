//! # Predicate and Expression Engine
//!
//! Typed evaluation over bound tuples. Predicates are tri-valued: a type
//! mismatch yields `false` (reported through the annotation bus by the
//! caller), never an error. Expressions produce one new value and recover
//! from type mismatches by yielding null; the only fatal arithmetic error
//! is integer division by zero.
//!
//! Arguments are compiled once per phase against the tuple layout, so
//! per-row evaluation is slot lookups and no name resolution.

pub mod aggregate;

pub use aggregate::{aggregate_relation, AggregateSpec};

use crate::error::{QueryError, Result};
use crate::query::{Arg, CompareOp, ExprOp, Expression, Predicate, StrTest, Var};
use crate::relation::Tuple;
use crate::value::{Identity, Value};
use chrono::{Datelike, Timelike};

/// A predicate/expression argument resolved against a tuple layout.
#[derive(Debug, Clone)]
enum Slot {
    Col(usize),
    Lit(Value),
}

impl Slot {
    fn compile(arg: &Arg, cols: &[Var], phase: usize) -> Result<Slot> {
        match arg {
            Arg::Var(v) => cols
                .iter()
                .position(|c| c == v)
                .map(Slot::Col)
                .ok_or_else(|| QueryError::UnboundVariable {
                    var: v.to_string(),
                    phase,
                }),
            Arg::Lit(value) => Ok(Slot::Lit(value.clone())),
        }
    }

    fn get<'a>(&'a self, tuple: &'a Tuple) -> &'a Value {
        match self {
            Slot::Col(i) => &tuple.0[*i],
            Slot::Lit(v) => v,
        }
    }
}

/// Whether two values are comparable without a type mismatch: same type,
/// or the numeric Int64/Float64 pair.
fn comparable(a: &Value, b: &Value) -> bool {
    if a.type_ordinal() == b.type_ordinal() {
        return true;
    }
    matches!(
        (a, b),
        (Value::Int64(_), Value::Float64(_)) | (Value::Float64(_), Value::Int64(_))
    )
}

fn chain_compare(op: CompareOp, values: &[&Value]) -> Option<bool> {
    for pair in values.windows(2) {
        if !comparable(pair[0], pair[1]) {
            return None;
        }
        if !op.matches(pair[0].cmp(pair[1])) {
            return Some(false);
        }
    }
    Some(true)
}

/// A predicate compiled against one tuple layout.
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Compare { op: CompareOp, slots: Vec<Slot> },
    Ground(usize),
    Missing(usize),
    Str { test: StrTest, slots: Vec<Slot> },
}

impl CompiledPredicate {
    pub fn compile(pred: &Predicate, cols: &[Var], phase: usize) -> Result<Self> {
        let compile_all = |args: &[Arg]| -> Result<Vec<Slot>> {
            args.iter().map(|a| Slot::compile(a, cols, phase)).collect()
        };
        Ok(match pred {
            Predicate::Compare { op, args } => CompiledPredicate::Compare {
                op: *op,
                slots: compile_all(args)?,
            },
            Predicate::Ground(v) => CompiledPredicate::Ground(resolve(v, cols, phase)?),
            Predicate::Missing(v) => CompiledPredicate::Missing(resolve(v, cols, phase)?),
            Predicate::Str { test, args } => CompiledPredicate::Str {
                test: *test,
                slots: compile_all(args)?,
            },
        })
    }

    /// Tri-valued evaluation: `None` is a type mismatch, which callers
    /// treat as `false` and may report.
    pub fn eval_checked(&self, tuple: &Tuple) -> Option<bool> {
        match self {
            CompiledPredicate::Compare { op, slots } => {
                let values: Vec<&Value> = slots.iter().map(|s| s.get(tuple)).collect();
                chain_compare(*op, &values)
            }
            CompiledPredicate::Ground(idx) => Some(!tuple.0[*idx].is_null()),
            CompiledPredicate::Missing(idx) => Some(tuple.0[*idx].is_null()),
            CompiledPredicate::Str { test, slots } => {
                let resolved: Vec<&Value> = slots.iter().map(|s| s.get(tuple)).collect();
                let [Value::String(s), Value::String(arg)] = resolved.as_slice() else {
                    return None;
                };
                Some(match test {
                    StrTest::StartsWith => s.starts_with(arg.as_str()),
                    StrTest::EndsWith => s.ends_with(arg.as_str()),
                    StrTest::Contains => s.contains(arg.as_str()),
                })
            }
        }
    }

    pub fn eval(&self, tuple: &Tuple) -> bool {
        self.eval_checked(tuple).unwrap_or(false)
    }
}

fn resolve(var: &Var, cols: &[Var], phase: usize) -> Result<usize> {
    cols.iter()
        .position(|c| c == var)
        .ok_or_else(|| QueryError::UnboundVariable {
            var: var.to_string(),
            phase,
        })
}

/// An expression compiled against one tuple layout.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    op: ExprOp,
    slots: Vec<Slot>,
    binding: Var,
    phase: usize,
}

impl CompiledExpression {
    pub fn compile(expr: &Expression, cols: &[Var], phase: usize) -> Result<Self> {
        Ok(CompiledExpression {
            op: expr.op,
            slots: expr
                .args
                .iter()
                .map(|a| Slot::compile(a, cols, phase))
                .collect::<Result<_>>()?,
            binding: expr.binding.clone(),
            phase,
        })
    }

    pub fn binding(&self) -> &Var {
        &self.binding
    }

    /// Evaluate against one tuple. Type mismatches yield null; integer
    /// division by zero is the one fatal case.
    pub fn eval(&self, tuple: &Tuple) -> Result<Value> {
        let args: Vec<&Value> = self.slots.iter().map(|s| s.get(tuple)).collect();
        match self.op {
            ExprOp::Add => Ok(self.fold_numeric(&args, i64::wrapping_add, |a, b| a + b)),
            ExprOp::Sub => Ok(self.fold_numeric(&args, i64::wrapping_sub, |a, b| a - b)),
            ExprOp::Mul => Ok(self.fold_numeric(&args, i64::wrapping_mul, |a, b| a * b)),
            ExprOp::Div => self.divide(&args),
            ExprOp::Str => {
                let mut out = String::new();
                for v in &args {
                    stringify(v, &mut out);
                }
                Ok(Value::String(out))
            }
            ExprOp::Year => Ok(time_field(&args, |t| i64::from(t.year()))),
            ExprOp::Month => Ok(time_field(&args, |t| i64::from(t.month()))),
            ExprOp::Day => Ok(time_field(&args, |t| i64::from(t.day()))),
            ExprOp::Hour => Ok(time_field(&args, |t| i64::from(t.hour()))),
            ExprOp::Minute => Ok(time_field(&args, |t| i64::from(t.minute()))),
            ExprOp::Second => Ok(time_field(&args, |t| i64::from(t.second()))),
            ExprOp::Ground => Ok(args.first().map_or(Value::Null, |v| (*v).clone())),
            ExprOp::Identity => Ok(match args.first() {
                Some(Value::String(s)) => Value::Identity(Identity::of(s)),
                Some(Value::Identity(id)) => Value::Identity(id.clone()),
                _ => Value::Null,
            }),
            ExprOp::Cmp(op) => Ok(chain_compare(op, &args)
                .map_or(Value::Null, Value::Bool)),
        }
    }

    /// Left fold with Int64/Float64 promotion; Int64 arithmetic wraps.
    fn fold_numeric(
        &self,
        args: &[&Value],
        int_op: fn(i64, i64) -> i64,
        float_op: fn(f64, f64) -> f64,
    ) -> Value {
        let mut iter = args.iter();
        let Some(first) = iter.next() else {
            return Value::Null;
        };
        let mut acc = (*first).clone();
        for next in iter {
            acc = match (&acc, next) {
                (Value::Int64(a), Value::Int64(b)) => Value::Int64(int_op(*a, *b)),
                (Value::Int64(a), Value::Float64(b)) => Value::Float64(float_op(*a as f64, *b)),
                (Value::Float64(a), Value::Int64(b)) => Value::Float64(float_op(*a, *b as f64)),
                (Value::Float64(a), Value::Float64(b)) => Value::Float64(float_op(*a, *b)),
                _ => return Value::Null,
            };
        }
        match acc {
            Value::Int64(_) | Value::Float64(_) => acc,
            _ => Value::Null,
        }
    }

    fn divide(&self, args: &[&Value]) -> Result<Value> {
        let mut iter = args.iter();
        let Some(first) = iter.next() else {
            return Ok(Value::Null);
        };
        let mut acc = (*first).clone();
        for next in iter {
            acc = match (&acc, next) {
                (Value::Int64(_), Value::Int64(0)) => {
                    return Err(QueryError::DivideByZero {
                        binding: self.binding.to_string(),
                        phase: self.phase,
                    })
                }
                (Value::Int64(a), Value::Int64(b)) => Value::Int64(a.wrapping_div(*b)),
                (Value::Int64(a), Value::Float64(b)) => Value::Float64(*a as f64 / *b),
                (Value::Float64(a), Value::Int64(b)) => Value::Float64(*a / *b as f64),
                (Value::Float64(a), Value::Float64(b)) => Value::Float64(*a / *b),
                _ => return Ok(Value::Null),
            };
        }
        match acc {
            Value::Int64(_) | Value::Float64(_) => Ok(acc),
            _ => Ok(Value::Null),
        }
    }
}

/// Raw stringification for `str`: strings concatenate unquoted.
fn stringify(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Null => {}
        other => {
            use std::fmt::Write;
            let _ = write!(out, "{other}");
        }
    }
}

fn time_field(args: &[&Value], f: impl Fn(&chrono::DateTime<chrono::Utc>) -> i64) -> Value {
    match args.first() {
        Some(Value::Time(t)) => Value::Int64(f(t)),
        _ => Value::Null,
    }
}
