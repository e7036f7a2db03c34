//! Error types for the vicinity-core crate.
//!
//! [`EngineError`] is the single error type returned by every fallible public
//! API in this crate. Each variant maps onto one of the abstract error kinds
//! the engine distinguishes: configuration mistakes, malformed input schema,
//! illegal state transitions, a metric locked by a loaded matrix, resource
//! exhaustion, and malformed persisted artifacts. Non-fatal conditions
//! (skipped lines, deviating exemplar weights, singleton values) are not
//! errors at all — they are reported through [`crate::experiment::DataWarning`]
//! and counted, never propagated as `Err`.

use thiserror::Error;

/// The main error type for engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EngineError {
    /// An option value is invalid, or a combination of options is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An input instance has the wrong feature count, or a feature declared
    /// numeric contains a non-numeric token.
    #[error("schema error: {0}")]
    Schema(String),

    /// An operation was attempted in a phase of the experiment lifecycle that
    /// does not allow it (e.g. classify before learn, mutate during Testing).
    #[error("illegal operation for current state {state:?}: {operation}")]
    State {
        state: crate::experiment::Phase,
        operation: String,
    },

    /// An attempt was made to change the metric of a feature whose
    /// value-difference matrix was loaded from disk (and is therefore
    /// read-only).
    #[error("metric is locked for feature {feature_index} (matrix loaded from disk)")]
    MetricLocked { feature_index: usize },

    /// A probability array or metric matrix could not be allocated or sized.
    #[error("resource error: {0}")]
    Resource(String),

    /// A persisted instance-base or weight file is malformed, has an
    /// unsupported version, or is truncated.
    #[error("serialization error: {0}")]
    Serial(String),

    /// A numeric computation produced a non-finite result the engine cannot
    /// recover from (e.g. DotProduct similarity overflow, §4.4).
    #[error("numeric error: {0}")]
    Numeric(String),
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, EngineError>;
