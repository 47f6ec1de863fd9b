//! Crate-wide error type.
//!
//! Crystal-local failures (a bad solve, too few observations, scale out of bounds) are *not*
//! represented here: per §7 of the design, those are recorded on the [`crate::reflection::Crystal`]
//! itself via a rejection flag and must never abort a batch. Only failures that make the whole run
//! meaningless reach this type.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed stream record, invalid point-group string, or invalid unit cell.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Overflow detected in exact rational arithmetic (symmetry or cell transforms).
    #[error("overflow in rational arithmetic: {0}")]
    Overflow(String),

    /// The worker pool itself failed (not a per-crystal failure).
    #[error("worker pool failure: {0}")]
    PoolFailure(String),

    /// Error that does not originate in this crate (propagated from a caller-supplied reader).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias for this crate's [`Result`](std::result::Result).
pub type Result<T> = std::result::Result<T, Error>;
