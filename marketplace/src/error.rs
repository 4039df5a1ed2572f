//! Typed domain errors callers branch on.
//!
//! Plumbing errors (file I/O, parsing) stay in `anyhow`; these variants mark
//! conditions with a defined recovery policy.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MarketError {
    /// Configuration failed validation at load or write time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Derived state drifted from its invariants. Indicates a fold or
    /// allocation defect; the projection must be recomputed, never persisted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Weight bounds cannot hold for the current competitor count.
    #[error("weight constraints [{min}, {max}] infeasible for {count} competitors")]
    InfeasibleConstraints { min: f64, max: f64, count: usize },

    #[error("unknown competitor '{0}'")]
    UnknownCompetitor(String),
}
