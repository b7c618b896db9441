use guildvote_db::DbError;
use guildvote_models::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The guild is busy; the caller should ask the user to try again later.
    #[error("timed out waiting for the lock of guild {guild_id}")]
    LockTimeout { guild_id: i64 },
    #[error("waiting for the lock of guild {guild_id} was cancelled")]
    Interrupted { guild_id: i64 },
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("storage unavailable: {0}")]
    Transient(#[source] DbError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Whether repeating the whole operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::Interrupted { .. } | StoreError::Transient(_)
        )
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => StoreError::NotFound,
            DbError::AlreadyExists => StoreError::AlreadyExists,
            DbError::Corrupt(msg) => StoreError::Fatal(format!("corrupt stored data: {msg}")),
            err @ DbError::Sqlx(_) => StoreError::Transient(err),
        }
    }
}

impl From<ModelError> for StoreError {
    fn from(e: ModelError) -> Self {
        StoreError::Invalid(e.to_string())
    }
}
