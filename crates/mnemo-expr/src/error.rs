//! Error types for values, codecs, and expression evaluation.

use thiserror::Error;

/// Errors raised by value handling and expression evaluation.
#[derive(Debug, Error)]
pub enum Error {
    /// A value did not match the expected kind.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The kind that was required.
        expected: String,
        /// The kind that was supplied.
        actual: String,
    },

    /// Encoded data could not be decoded.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// An unrecognized value tag was encountered while decoding.
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),

    /// An expression referenced a parameter index outside the row set.
    #[error("parameter index {0} out of range")]
    ParamOutOfRange(usize),

    /// Exact evaluation was requested for an imperfect expression that
    /// carries no fallback predicate.
    #[error("expression is imperfect and has no fallback predicate")]
    MissingFallback,

    /// A value could not be represented in the requested form.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// JSON conversion failure.
    #[error("json conversion: {0}")]
    Json(String),
}
