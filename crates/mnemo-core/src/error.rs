//! Core error types and conflict handling.

use std::fmt;

use thiserror::Error;

/// Core persistence errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A field was assigned a value of the wrong type.
    #[error("type mismatch for {class}.{field}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Class name.
        class: String,
        /// Field name.
        field: String,
        /// Declared field type.
        expected: String,
        /// Kind of the assigned value.
        actual: String,
    },

    /// Invalid class, field, or association definition.
    #[error("definition error: {0}")]
    Definition(String),

    /// A different instance with the same identity is already resident.
    #[error("duplicate identity for {class}: {identity}")]
    DuplicateIdentity {
        /// Class name.
        class: String,
        /// Rendered identity tuple.
        identity: String,
    },

    /// A backend returned more than one raw record for one identity.
    #[error("ambiguous identity for {class}: {identity}")]
    AmbiguousIdentity {
        /// Class name.
        class: String,
        /// Rendered identity tuple.
        identity: String,
    },

    /// Model/storage mismatch under the `error` conflict mode.
    #[error("mapping conflict: {0}")]
    Mapping(String),

    /// No single backend covers every class of a join.
    #[error("no backend covers the join {0:?}")]
    UnsupportedJoin(Vec<String>),

    /// The association graph does not connect two classes.
    #[error("no association path from {from} to {to}")]
    NoPath {
        /// Starting class.
        from: String,
        /// Target class.
        to: String,
    },

    /// The named class is not known to the registry or backend.
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// The named field does not exist on the class.
    #[error("unknown field {class}.{field}")]
    UnknownField {
        /// Class name.
        class: String,
        /// Field name.
        field: String,
    },

    /// A record lacks identity values and none could be assigned.
    #[error("missing identity for {0}")]
    MissingIdentity(String),

    /// The record was destroyed; no further operations are valid.
    #[error("unit has been destroyed")]
    Destroyed,

    /// A field hook vetoed an assignment.
    #[error("assignment to {class}.{field} rejected: {reason}")]
    HookVeto {
        /// Class name.
        class: String,
        /// Field name.
        field: String,
        /// Reason supplied by the hook.
        reason: String,
    },

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Value, codec, or expression error.
    #[error("expression error: {0}")]
    Expr(#[from] mnemo_expr::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Aggregated failures from `flush_all`.
    #[error(transparent)]
    Flush(#[from] FlushError),
}

/// One failed save from a flush pass.
#[derive(Debug)]
pub struct FlushFailure {
    /// Class of the failed record.
    pub class: String,
    /// Rendered identity of the failed record.
    pub identity: String,
    /// The underlying error, rendered.
    pub error: String,
}

/// The complete set of records a flush pass failed to persist.
///
/// A flush attempts every dirty resident record and reports all failures at
/// once rather than stopping at the first.
#[derive(Debug)]
pub struct FlushError {
    /// Every failed identity with its error.
    pub failures: Vec<FlushFailure>,
}

impl std::error::Error for FlushError {}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flush failed for {} unit(s):", self.failures.len())?;
        for failure in &self.failures {
            write!(
                f,
                " {}({}): {};",
                failure.class, failure.identity, failure.error
            )?;
        }
        Ok(())
    }
}

/// Behavior on discrepancies between the model and live storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictMode {
    /// Abort and report the first conflict (the default).
    #[default]
    Error,
    /// Report every conflict as a warning; do not abort.
    Warn,
    /// Reconcile live storage to match the model where possible; operations
    /// that cannot repair fall back to `Error` behavior.
    Repair,
    /// Suppress conflict detection entirely. Unsafe; documented as such.
    Ignore,
}

/// A non-fatal conflict report, collected and surfaced as a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageWarning {
    /// Class the conflict concerns.
    pub class: String,
    /// Description of the conflict.
    pub message: String,
}

/// The batch of warnings collected by a schema operation.
pub type Warnings = Vec<StorageWarning>;

/// React to a conflict that the caller cannot repair.
///
/// `Error` and `Repair` abort (repair was not possible here), `Warn` records
/// the conflict, `Ignore` drops it.
pub fn conflict(
    mode: ConflictMode,
    warnings: &mut Warnings,
    class: &str,
    message: impl Into<String>,
) -> Result<(), Error> {
    let message = message.into();
    match mode {
        ConflictMode::Ignore => Ok(()),
        ConflictMode::Warn => {
            tracing::warn!(class, %message, "storage conflict");
            warnings.push(StorageWarning {
                class: class.to_owned(),
                message,
            });
            Ok(())
        }
        ConflictMode::Error | ConflictMode::Repair => {
            Err(Error::Mapping(format!("{class}: {message}")))
        }
    }
}

/// Render an identity tuple for error messages.
pub(crate) fn render_identity(identity: &[mnemo_expr::Value]) -> String {
    let parts: Vec<String> = identity.iter().map(|v| v.to_string()).collect();
    parts.join(", ")
}
