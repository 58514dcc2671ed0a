use crate::llm::DispatchError;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("stored message {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("no signed-in user")]
    SignedOut,
}

/// Everything the controller can run into. Converted into the user-visible
/// `error` field, never returned to the UI as a failure.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
