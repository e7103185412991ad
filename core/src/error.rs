//! Error types for the filter core.
//!
//! The filter distinguishes four failure kinds with different recovery semantics:
//!
//! - [`EskfError::Configuration`]: malformed tuning parameters, surfaced at construction
//!   time. Fatal; no filter instance is produced.
//! - [`EskfError::NonMonotonicTime`]: a measurement timestamp earlier than the state it is
//!   applied to. Fatal for that step; the step performs no computation and the caller's state
//!   pair is untouched.
//! - [`EskfError::SingularInnovation`]: the innovation covariance could not be inverted at
//!   update time. Caller-recoverable: because every operation returns new values instead of
//!   mutating, the caller still holds the prior pair and may skip the update and keep
//!   predicting.
//! - [`EskfError::InvariantViolation`]: a state invariant (unit quaternion norm, covariance
//!   symmetry/positive-semi-definiteness) failed a strict check. Produced only by the explicit
//!   `check_invariants` entry points; the hot path uses `debug_assert!` instead.

use thiserror::Error;

/// Errors produced by filter construction and filter steps.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EskfError {
    /// A tuning parameter was malformed (non-positive noise standard deviation, negative bias
    /// decay rate, singular correction matrix).
    #[error("invalid filter configuration: {0}")]
    Configuration(String),

    /// A measurement timestamp precedes the timestamp of the state it is applied to.
    #[error("non-monotonic timestamp: state at t = {prev}, measurement at t = {current}")]
    NonMonotonicTime {
        /// Timestamp of the state the measurement was applied to (seconds).
        prev: f64,
        /// Timestamp of the offending measurement (seconds).
        current: f64,
    },

    /// The innovation covariance was not invertible at update time.
    #[error("singular innovation covariance at t = {ts}")]
    SingularInnovation {
        /// Timestamp of the offending measurement (seconds).
        ts: f64,
    },

    /// A state invariant failed a strict check.
    #[error("state invariant violated: {0}")]
    InvariantViolation(String),
}
