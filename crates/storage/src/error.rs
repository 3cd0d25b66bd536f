use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("bundle key {key} already used by account {account_id}")]
    DuplicateBundleKey { account_id: String, key: String },

    #[error("view of bundle {bundle_id} changed: expected {expected}, found {current}")]
    ViewChanged {
        bundle_id: String,
        expected: String,
        current: String,
    },

    #[error("core error: {0}")]
    Core(#[from] entitlement_core::CoreError),
}
