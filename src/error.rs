//! Top-level error type unifying the component error enums.

use thiserror::Error;

use crate::{runner::RunnerError, selector::SelectorError, store::StoreError};

/// Crate-wide error returned by `Runtime` operations and the CLI.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("queue error: {0}")]
    Queue(#[from] crate::domain::queue::QueueError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("ambiguous reference {reference:?}: matches {candidates:?}")]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
