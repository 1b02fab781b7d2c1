//! # Parsed Query AST
//!
//! The types the planner consumes. The surface S-expression parser is an
//! external collaborator; embedders and tests construct these types
//! directly or through [`builders`].
//!
//! A query is `{find, in, where, order-by}`. Where-clauses are a tagged
//! sum of data patterns, predicates, expressions, and subqueries; the
//! planner and executor dispatch on the tag.
//!
//! Every type here hashes stably (for a fixed intern state), which is what
//! keys the plan cache.

pub mod builders;

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A query variable (`?name`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Var(Arc<str>);

impl Var {
    /// Build from a name; a leading `?` is accepted and stripped.
    pub fn new(name: &str) -> Self {
        Var(Arc::from(name.strip_prefix('?').unwrap_or(name)))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl From<&str> for Var {
    fn from(name: &str) -> Self {
        Var::new(name)
    }
}

/// One positional element of a data pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    /// Binds (or is constrained by) a variable
    Var(Var),
    /// `_`: matches anything, never binds
    Blank,
    /// Ground constant
    Lit(Value),
}

impl Term {
    pub fn var(&self) -> Option<&Var> {
        match self {
            Term::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn lit(&self) -> Option<&Value> {
        match self {
            Term::Lit(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => write!(f, "{v}"),
            Term::Blank => write!(f, "_"),
            Term::Lit(v) => write!(f, "{v}"),
        }
    }
}

/// A 3- or 4-element `[?e :attr ?v ?tx]` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataPattern {
    pub e: Term,
    pub a: Term,
    pub v: Term,
    pub tx: Option<Term>,
}

impl DataPattern {
    /// Distinct variables in E, A, V, Tx order.
    pub fn vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for term in [Some(&self.e), Some(&self.a), Some(&self.v), self.tx.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Term::Var(v) = term {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        out
    }
}

impl fmt::Display for DataPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tx {
            Some(tx) => write!(f, "[{} {} {} {}]", self.e, self.a, self.v, tx),
            None => write!(f, "[{} {} {}]", self.e, self.a, self.v),
        }
    }
}

/// Comparison operators, usable binary or chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
        }
    }

    pub fn matches(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Lt => ord == Less,
            CompareOp::Le => ord != Greater,
            CompareOp::Gt => ord == Greater,
            CompareOp::Ge => ord != Less,
            CompareOp::Eq => ord == Equal,
            CompareOp::Ne => ord != Equal,
        }
    }
}

/// Argument to a predicate or expression: a variable or a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arg {
    Var(Var),
    Lit(Value),
}

impl Arg {
    pub fn var(&self) -> Option<&Var> {
        match self {
            Arg::Var(v) => Some(v),
            Arg::Lit(_) => None,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Var(v) => write!(f, "{v}"),
            Arg::Lit(v) => write!(f, "{v}"),
        }
    }
}

/// Typed string test functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrTest {
    StartsWith,
    EndsWith,
    Contains,
}

impl StrTest {
    pub fn symbol(&self) -> &'static str {
        match self {
            StrTest::StartsWith => "str/starts-with?",
            StrTest::EndsWith => "str/ends-with?",
            StrTest::Contains => "str/contains?",
        }
    }
}

/// A filtering clause. Tri-valued: a type mismatch yields false, never an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    /// `(< ?a ?b ?c ...)`: chained over adjacent argument pairs
    Compare { op: CompareOp, args: Vec<Arg> },
    /// `(ground ?x)`: bound to a non-null value
    Ground(Var),
    /// `(missing ?x)`: bound to null
    Missing(Var),
    /// `(str/starts-with? ?s "prefix")` and friends
    Str { test: StrTest, args: Vec<Arg> },
}

impl Predicate {
    /// Variables this predicate reads.
    pub fn input_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        let mut push = |arg: &Arg| {
            if let Arg::Var(v) = arg {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        };
        match self {
            Predicate::Compare { args, .. } | Predicate::Str { args, .. } => {
                args.iter().for_each(&mut push);
            }
            Predicate::Ground(v) | Predicate::Missing(v) => out.push(v.clone()),
        }
        out
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { op, args } => {
                write!(f, "({}", op.symbol())?;
                for a in args {
                    write!(f, " {a}")?;
                }
                write!(f, ")")
            }
            Predicate::Ground(v) => write!(f, "(ground {v})"),
            Predicate::Missing(v) => write!(f, "(missing {v})"),
            Predicate::Str { test, args } => {
                write!(f, "({}", test.symbol())?;
                for a in args {
                    write!(f, " {a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Functions usable in value-producing expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExprOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Concatenating stringification of all arguments
    Str,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    /// Pass a constant (or rebind a variable) unchanged
    Ground,
    /// Hash a string argument into an identity
    Identity,
    /// Boolean-producing comparison, `(= ?a ?b) -> ?flag`
    Cmp(CompareOp),
}

impl ExprOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ExprOp::Add => "+",
            ExprOp::Sub => "-",
            ExprOp::Mul => "*",
            ExprOp::Div => "/",
            ExprOp::Str => "str",
            ExprOp::Year => "year",
            ExprOp::Month => "month",
            ExprOp::Day => "day",
            ExprOp::Hour => "hour",
            ExprOp::Minute => "minute",
            ExprOp::Second => "second",
            ExprOp::Ground => "ground",
            ExprOp::Identity => "identity",
            ExprOp::Cmp(op) => op.symbol(),
        }
    }
}

/// `(fn args...) -> ?binding`: computes one new bound column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Expression {
    pub op: ExprOp,
    pub args: Vec<Arg>,
    pub binding: Var,
}

impl Expression {
    pub fn input_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for arg in &self.args {
            if let Arg::Var(v) = arg {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        }
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[({}", self.op.symbol())?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        write!(f, ") {}]", self.binding)
    }
}

/// Aggregate operators for find elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateOp {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Sum => "sum",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Avg => "avg",
        }
    }
}

/// `(op ?var)`, optionally gated by a Bool-valued condition column: only
/// rows whose condition column is `true` contribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    pub op: AggregateOp,
    pub var: Var,
    pub condition: Option<Var>,
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(cond) => write!(f, "({} {} :when {})", self.op.symbol(), self.var, cond),
            None => write!(f, "({} {})", self.op.symbol(), self.var),
        }
    }
}

/// One element of the `:find` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FindElem {
    Var(Var),
    Agg(Aggregate),
}

impl FindElem {
    /// The variable this element reads.
    pub fn var(&self) -> &Var {
        match self {
            FindElem::Var(v) => v,
            FindElem::Agg(a) => &a.var,
        }
    }
}

impl fmt::Display for FindElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FindElem::Var(v) => write!(f, "{v}"),
            FindElem::Agg(a) => write!(f, "{a}"),
        }
    }
}

/// One element of the `:in` clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputSpec {
    /// `$`: the database snapshot
    Database,
    /// `?x`: one scalar
    Scalar(Var),
    /// `[?x ?y]`: one tuple
    Tuple(Vec<Var>),
    /// `[?x ...]`: a collection of scalars
    Collection(Var),
    /// `[[?x ?y] ...]`: a full relation
    Relation(Vec<Var>),
}

impl InputSpec {
    /// Variables this input binds.
    pub fn vars(&self) -> Vec<Var> {
        match self {
            InputSpec::Database => Vec::new(),
            InputSpec::Scalar(v) | InputSpec::Collection(v) => vec![v.clone()],
            InputSpec::Tuple(vs) | InputSpec::Relation(vs) => vs.clone(),
        }
    }
}

/// Sort direction for `:order-by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Actual argument wired into a subquery invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubqueryArg {
    /// `$`: pass the same snapshot through
    Database,
    /// Outer variable
    Var(Var),
    /// Constant
    Lit(Value),
}

/// Destructuring form binding a subquery's result rows into outer columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubqueryBinding {
    /// `?x`: single row, single column
    Scalar(Var),
    /// `[?x ?y]`: single row
    Tuple(Vec<Var>),
    /// `[?x ...]`: many rows, single column
    Collection(Var),
    /// `[[?x ?y]]`: many rows
    Relation(Vec<Var>),
}

impl SubqueryBinding {
    pub fn vars(&self) -> Vec<Var> {
        match self {
            SubqueryBinding::Scalar(v) | SubqueryBinding::Collection(v) => vec![v.clone()],
            SubqueryBinding::Tuple(vs) | SubqueryBinding::Relation(vs) => vs.clone(),
        }
    }
}

/// `(q [..nested query..] $ ?arg ...)` with a result binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubqueryClause {
    pub query: Arc<Query>,
    pub args: Vec<SubqueryArg>,
    pub binding: SubqueryBinding,
}

impl SubqueryClause {
    /// Outer variables this subquery reads.
    pub fn input_vars(&self) -> Vec<Var> {
        self.args
            .iter()
            .filter_map(|a| match a {
                SubqueryArg::Var(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A where-clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Clause {
    Pattern(DataPattern),
    Predicate(Predicate),
    Expression(Expression),
    Subquery(SubqueryClause),
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub find: Vec<FindElem>,
    pub inputs: Vec<InputSpec>,
    pub clauses: Vec<Clause>,
    pub order_by: Vec<(Var, SortOrder)>,
}

impl Query {
    /// Distinct variables referenced by the find clause.
    pub fn find_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for elem in &self.find {
            let v = elem.var();
            if !out.contains(v) {
                out.push(v.clone());
            }
        }
        out
    }

    /// Whether any find element aggregates.
    pub fn has_aggregates(&self) -> bool {
        self.find.iter().any(|e| matches!(e, FindElem::Agg(_)))
    }

    /// Distinct variables bound by the `:in` clause.
    pub fn input_vars(&self) -> BTreeSet<Var> {
        self.inputs.iter().flat_map(InputSpec::vars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::builders::*;
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    #[test]
    fn test_pattern_vars_in_eav_order() {
        let p = DataPattern {
            e: Term::Var(Var::new("?e")),
            a: Term::Lit(Value::Keyword(crate::value::Keyword::intern(":age"))),
            v: Term::Var(Var::new("?v")),
            tx: Some(Term::Var(Var::new("?tx"))),
        };
        assert_eq!(
            p.vars(),
            vec![Var::new("?e"), Var::new("?v"), Var::new("?tx")]
        );
    }

    #[test]
    fn test_query_hash_is_stable() {
        let q1 = query()
            .find_var("?n")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build();
        let q2 = query()
            .find_var("?n")
            .where_pattern(var("?e"), kw(":name"), var("?n"))
            .build();
        let mut h1 = DefaultHasher::new();
        let mut h2 = DefaultHasher::new();
        q1.hash(&mut h1);
        q2.hash(&mut h2);
        assert_eq!(h1.finish(), h2.finish());
        assert_eq!(q1, q2);
    }

    #[test]
    fn test_var_strips_question_mark() {
        assert_eq!(Var::new("?x"), Var::new("x"));
        assert_eq!(Var::new("?x").to_string(), "?x");
    }
}
