//! Query Engine Error Types
//!
//! One error enum for the whole pipeline. Predicate/expression type
//! mismatches are recovered locally (tri-valued false / null) and never
//! appear here; everything else carries enough context to point at the
//! offending phase and clause.

use thiserror::Error;

/// Errors surfaced by the planner and executor.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// Parse error passed through from the parser collaborator
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// A find or subquery input has no producer in any phase
    #[error("Unbound variable {var} (phase {phase})")]
    UnboundVariable { var: String, phase: usize },

    /// Internal plan invariant violated after a rewrite
    #[error("Invalid plan: {message} (phase {phase})")]
    InvalidPlan { message: String, phase: usize },

    /// Patterns form unconnected groups and no explicit cross product
    /// was declared
    #[error("Patterns form {groups} disjoint groups; declare an explicit cross product to allow this")]
    DisjointGroups { groups: usize },

    /// Dependency cycle between clauses; no valid phase order exists
    #[error("Clause dependency cycle involving {var}")]
    Cycle { var: String },

    /// Integer division by zero in an expression
    #[error("Division by zero in expression binding {binding} (phase {phase})")]
    DivideByZero { binding: String, phase: usize },

    /// A streaming relation was iterated twice
    #[error("Streaming relation iterated twice; buffer it for multi-pass access")]
    IteratorConsumed,

    /// Cancel token fired or deadline exceeded
    #[error("Query cancelled after {elapsed_ms}ms")]
    Cancelled { elapsed_ms: u64 },

    /// Malformed identity literal
    #[error("Invalid identity: {input}")]
    InvalidIdentity { input: String },

    /// Passed through from the storage collaborator
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Inputs supplied to `execute` do not match the query's `:in` specs
    #[error("Input mismatch: {message}")]
    InputMismatch { message: String },
}

impl QueryError {
    pub fn storage(message: impl Into<String>) -> Self {
        QueryError::Storage {
            message: message.into(),
        }
    }

    pub fn invalid_plan(message: impl Into<String>, phase: usize) -> Self {
        QueryError::InvalidPlan {
            message: message.into(),
            phase,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QueryError>;
