use thiserror::Error;

/// Errors raised by the iteration scheduler.
///
/// Only configuration-class errors (`InvalidField`, `Config`) propagate to
/// callers; per-entity runtime failures are contained and logged by the
/// engine loop.
#[derive(Debug, Error)]
pub enum IteratorError {
    /// The entity type does not expose the requested schedule field. This is
    /// a programming error by the integrating caller and fails fast.
    #[error("Invalid schedule field: {field}")]
    InvalidField { field: String },

    /// The iterator was built with an inconsistent or incomplete
    /// configuration.
    #[error("Iterator configuration error: {0}")]
    Config(String),

    /// A cron expression could not be parsed or expanded.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    /// Failure at the storage boundary.
    #[error("Store error: {0}")]
    Store(#[from] rotor_store::StoreError),
}

pub type Result<T> = std::result::Result<T, IteratorError>;
