//! Builder patterns for query construction.
//!
//! The surface parser is an external collaborator, so embedders and tests
//! build queries through this fluent API.
//!
//! ## Example
//!
//! ```rust
//! use tetrad::query::builders::*;
//! use tetrad::query::{AggregateOp, CompareOp};
//!
//! // [:find ?n ?g :where [?e :name ?n] [?e :age ?g] [(> ?g 21)]]
//! let q = query()
//!     .find_var("?n")
//!     .find_var("?g")
//!     .where_pattern(var("?e"), kw(":name"), var("?n"))
//!     .where_pattern(var("?e"), kw(":age"), var("?g"))
//!     .where_compare(CompareOp::Gt, [avar("?g"), alit(21i64)])
//!     .build();
//!
//! // [:find ?d (avg ?s) ...]
//! let agg = query()
//!     .find_var("?d")
//!     .find_agg(AggregateOp::Avg, "?s")
//!     .where_pattern(var("?e"), kw(":dept"), var("?d"))
//!     .where_pattern(var("?e"), kw(":salary"), var("?s"))
//!     .build();
//! ```

use super::{
    Aggregate, AggregateOp, Arg, Clause, CompareOp, DataPattern, ExprOp, Expression, FindElem,
    InputSpec, Predicate, Query, SortOrder, StrTest, SubqueryArg, SubqueryBinding, SubqueryClause,
    Term, Var,
};
use crate::value::{Keyword, Value};
use std::sync::Arc;

/// Variable pattern element.
pub fn var(name: &str) -> Term {
    Term::Var(Var::new(name))
}

/// Blank pattern element (`_`).
pub fn blank() -> Term {
    Term::Blank
}

/// Keyword constant pattern element.
pub fn kw(name: &str) -> Term {
    Term::Lit(Value::Keyword(Keyword::intern(name)))
}

/// Constant pattern element.
pub fn lit(value: impl Into<Value>) -> Term {
    Term::Lit(value.into())
}

/// Variable argument to a predicate or expression.
pub fn avar(name: &str) -> Arg {
    Arg::Var(Var::new(name))
}

/// Constant argument to a predicate or expression.
pub fn alit(value: impl Into<Value>) -> Arg {
    Arg::Lit(value.into())
}

/// Start a query builder.
pub fn query() -> QueryBuilder {
    QueryBuilder::default()
}

/// Fluent builder for [`Query`].
#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    find: Vec<FindElem>,
    inputs: Vec<InputSpec>,
    clauses: Vec<Clause>,
    order_by: Vec<(Var, SortOrder)>,
}

impl QueryBuilder {
    pub fn find_var(mut self, name: &str) -> Self {
        self.find.push(FindElem::Var(Var::new(name)));
        self
    }

    pub fn find_agg(mut self, op: AggregateOp, name: &str) -> Self {
        self.find.push(FindElem::Agg(Aggregate {
            op,
            var: Var::new(name),
            condition: None,
        }));
        self
    }

    /// Aggregate gated on a Bool condition column.
    pub fn find_agg_when(mut self, op: AggregateOp, name: &str, condition: &str) -> Self {
        self.find.push(FindElem::Agg(Aggregate {
            op,
            var: Var::new(name),
            condition: Some(Var::new(condition)),
        }));
        self
    }

    pub fn in_db(mut self) -> Self {
        self.inputs.push(InputSpec::Database);
        self
    }

    pub fn in_scalar(mut self, name: &str) -> Self {
        self.inputs.push(InputSpec::Scalar(Var::new(name)));
        self
    }

    pub fn in_tuple<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.inputs
            .push(InputSpec::Tuple(names.into_iter().map(Var::new).collect()));
        self
    }

    pub fn in_collection(mut self, name: &str) -> Self {
        self.inputs.push(InputSpec::Collection(Var::new(name)));
        self
    }

    pub fn in_relation<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.inputs.push(InputSpec::Relation(
            names.into_iter().map(Var::new).collect(),
        ));
        self
    }

    pub fn where_pattern(mut self, e: Term, a: Term, v: Term) -> Self {
        self.clauses
            .push(Clause::Pattern(DataPattern { e, a, v, tx: None }));
        self
    }

    pub fn where_pattern_tx(mut self, e: Term, a: Term, v: Term, tx: Term) -> Self {
        self.clauses.push(Clause::Pattern(DataPattern {
            e,
            a,
            v,
            tx: Some(tx),
        }));
        self
    }

    pub fn where_compare(mut self, op: CompareOp, args: impl IntoIterator<Item = Arg>) -> Self {
        self.clauses.push(Clause::Predicate(Predicate::Compare {
            op,
            args: args.into_iter().collect(),
        }));
        self
    }

    pub fn where_ground(mut self, name: &str) -> Self {
        self.clauses
            .push(Clause::Predicate(Predicate::Ground(Var::new(name))));
        self
    }

    pub fn where_missing(mut self, name: &str) -> Self {
        self.clauses
            .push(Clause::Predicate(Predicate::Missing(Var::new(name))));
        self
    }

    pub fn where_str(mut self, test: StrTest, args: impl IntoIterator<Item = Arg>) -> Self {
        self.clauses.push(Clause::Predicate(Predicate::Str {
            test,
            args: args.into_iter().collect(),
        }));
        self
    }

    /// `[(op args...) ?binding]`
    pub fn where_expr(
        mut self,
        op: ExprOp,
        args: impl IntoIterator<Item = Arg>,
        binding: &str,
    ) -> Self {
        self.clauses.push(Clause::Expression(Expression {
            op,
            args: args.into_iter().collect(),
            binding: Var::new(binding),
        }));
        self
    }

    /// `[(q <nested> args...) <binding>]`
    pub fn where_subquery(
        mut self,
        nested: Query,
        args: impl IntoIterator<Item = SubqueryArg>,
        binding: SubqueryBinding,
    ) -> Self {
        self.clauses.push(Clause::Subquery(SubqueryClause {
            query: Arc::new(nested),
            args: args.into_iter().collect(),
            binding,
        }));
        self
    }

    pub fn order_by(mut self, name: &str, order: SortOrder) -> Self {
        self.order_by.push((Var::new(name), order));
        self
    }

    pub fn build(self) -> Query {
        Query {
            find: self.find,
            inputs: self.inputs,
            clauses: self.clauses,
            order_by: self.order_by,
        }
    }
}

/// Subquery argument: the database placeholder.
pub fn sq_db() -> SubqueryArg {
    SubqueryArg::Database
}

/// Subquery argument: an outer variable.
pub fn sq_var(name: &str) -> SubqueryArg {
    SubqueryArg::Var(Var::new(name))
}

/// Subquery argument: a constant.
pub fn sq_lit(value: impl Into<Value>) -> SubqueryArg {
    SubqueryArg::Lit(value.into())
}

/// Subquery result binding: `[[?a ?b]]` relation destructuring.
pub fn bind_relation<'a>(names: impl IntoIterator<Item = &'a str>) -> SubqueryBinding {
    SubqueryBinding::Relation(names.into_iter().map(Var::new).collect())
}

/// Subquery result binding: single-row tuple.
pub fn bind_tuple<'a>(names: impl IntoIterator<Item = &'a str>) -> SubqueryBinding {
    SubqueryBinding::Tuple(names.into_iter().map(Var::new).collect())
}

/// Subquery result binding: scalar.
pub fn bind_scalar(name: &str) -> SubqueryBinding {
    SubqueryBinding::Scalar(Var::new(name))
}

/// Subquery result binding: single-column collection.
pub fn bind_collection(name: &str) -> SubqueryBinding {
    SubqueryBinding::Collection(Var::new(name))
}
