use thiserror::Error;

#[derive(Error, Debug)]
pub enum VellumError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Attempt made to modify a read-only store")]
    ReadOnlyViolation,

    #[error("Attempt made to persist a no-persist store")]
    PersistDisabled,

    #[error("Not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("Missing id: {0}")]
    MissingId(String),

    #[error("Attempt made to store a non-scalar value in field '{0}'")]
    InvalidFieldType(String),

    #[error("Unrecognised linetype: {0}")]
    UnrecognisedLinetype(String),

    #[error("Line validation failed: {0}")]
    LineValidation(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Lock acquisition failed: {0}")]
    LockAcquisitionFailed(String),

    #[error("Incorrect locker PIN provided for unlocking")]
    LockOwnershipMismatch,

    #[error("Version timeout waiting for [{version}]; still at {stalled_at}")]
    VersionTimeout { version: String, stalled_at: String },

    #[error("Unknown affected action: {0}")]
    UnknownAffectedAction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VellumError>;
