use thiserror::Error;

/// Errors that can occur at the storage boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A document serialized to something other than a JSON object.
    #[error("Document {id} is not a JSON object")]
    NotAnObject { id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
