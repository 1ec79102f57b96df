//! Errors surfaced while building or mounting a filter.

use thiserror::Error;

/// Everything that can go wrong constructing or deserializing a filter.
///
/// Queries never fail; once a filter exists, [`point`](crate::RangeFilter::point) and
/// [`range`](crate::RangeFilter::range) return plain booleans. All error paths are at
/// build or load time and are reported to the caller without retry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The key set or build parameters cannot produce a filter.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The requested bit budget cannot fund any filter at all.
    #[error("bit budget too small: {0} bits per key")]
    BudgetTooSmall(f64),

    /// A serialized blob failed structural validation.
    #[error("corrupt filter blob: {0}")]
    Corrupt(&'static str),
}
