use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("malformed http_users blob: {0}")]
    MalformedUsersBlob(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
