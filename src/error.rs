//! Error kinds for the solver (spec.md §7).
//!
//! Most of these are recovered internally rather than propagated: a bad effector or a
//! degenerate QCP input never poisons the solve, it just means that bone's pass is a no-op
//! this frame. Only the public configuration setters return `Err` — the core itself never
//! produces a fatal error.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IkError {
    /// Mismatched point-set lengths in QCP, empty inputs, all-zero weights, or non-finite
    /// values. Recovered internally: the QCP kernel returns identity rotation and zero
    /// translation without mutating caller state.
    #[error("invalid QCP input: {0}")]
    InvalidInput(String),

    /// Solver invoked before a skeleton is bound, or with an empty effector set. Recovered as
    /// a silent no-op.
    #[error("solver not configured: {0}")]
    Unconfigured(String),

    /// The QCP Newton loop hit its iteration cap, or all four eigenvector fallbacks failed.
    /// Logged once per solve; the containing segment treats the pass as a no-op.
    #[error("QCP solve did not converge: {0}")]
    NumericallyDegenerate(String),

    /// Configuration value out of its valid range (cone radius > π, negative twist range,
    /// negative damping, ...). Returned by public setters; never reaches the core.
    #[error("configuration value out of range: {0}")]
    OutOfRangeConfig(String),

    /// Malformed configuration JSON from `Solver::from_json`. A host-facing I/O boundary, not
    /// one of spec.md §7's four solve-time kinds above — the solve path never produces it.
    #[error("invalid configuration json: {0}")]
    Serialization(String),
}

pub type IkResult<T> = Result<T, IkError>;
