//! Failures the metering and rating rules themselves can raise.
//!
//! Storage and stream faults carry their own error types in the
//! infrastructure layer; everything here is deterministic, a property of
//! the inputs alone.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input rejected before any state was touched (bad timestamps,
    /// malformed tier tables, events that do not belong to the targeted
    /// window).
    #[error("invalid input: {0}")]
    Validation(String),

    /// The operation would leave metering or pricing state in a shape the
    /// rules forbid (negative usage, unordered windows, overlapping
    /// catalog effectivity).
    #[error("rule violation: {0}")]
    InvariantViolation(String),

    /// An identifier failed to parse.
    #[error("malformed id: {0}")]
    InvalidId(String),

    /// Write attempted against an aggregate the watermark has already
    /// frozen. The event belongs on the late stream, not in this row.
    #[error("aggregate already finalized: {0}")]
    FrozenAggregate(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn frozen(msg: impl Into<String>) -> Self {
        Self::FrozenAggregate(msg.into())
    }
}
