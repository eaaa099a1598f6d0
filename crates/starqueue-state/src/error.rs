//! Failures of the task record store.

use starqueue_core::TaskId;
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// A record store failure. Backend errors carry the redb message as text.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open task database: {0}")]
    Open(String),

    #[error("task database transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open task table: {0}")]
    Table(String),

    #[error("cannot read task row: {0}")]
    Read(String),

    #[error("cannot write task row: {0}")]
    Write(String),

    #[error("cannot encode task row: {0}")]
    Serialize(String),

    #[error("corrupt task row: {0}")]
    Deserialize(String),

    #[error("no task row with id {0}")]
    NotFound(TaskId),
}
