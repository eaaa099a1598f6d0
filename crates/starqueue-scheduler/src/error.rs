//! Scheduler error types.

use thiserror::Error;

use starqueue_core::TaskId;
use starqueue_state::StateError;

use crate::queue::QueueState;

/// Errors returned by task queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot {operation} while the queue is {state}")]
    BadState {
        operation: &'static str,
        state: QueueState,
    },

    #[error("cannot restart into state {0}")]
    InvalidTarget(QueueState),

    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("task {0} is executing and cannot be removed")]
    RemovalConflict(TaskId),

    #[error("task queue is gone")]
    Closed,

    #[error("record store error: {0}")]
    State(#[from] StateError),
}

pub type QueueResult<T> = Result<T, QueueError>;
