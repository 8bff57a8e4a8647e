use thiserror::Error;

use crate::llm_client::CompletionError;

/// Input problems caught locally, before any store or network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message is empty.")]
    EmptyMessage,

    #[error("Please add some text or media to save.")]
    EmptyEntry,

    #[error("User is not logged in.")]
    SignedOut,

    #[error("Invalid identity '{0}'")]
    InvalidIdentity(String),
}

#[derive(Debug, Error)]
pub enum DaybookError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Another action is already in progress on this screen.")]
    Busy,

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type DaybookResult<T> = std::result::Result<T, DaybookError>;
