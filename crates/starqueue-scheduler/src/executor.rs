//! Executor contract — what the queue requires from the worker that runs a task.
//!
//! The queue never runs work itself. For every admitted task it asks an
//! [`ExecutorFactory`] for an [`Executor`], keeps it while the task is
//! `executing`, and retires it once the executor has reported a terminal
//! state through its [`TaskReporter`].

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;

use starqueue_core::{TaskEntry, TaskId};

use crate::error::{QueueError, QueueResult};
use crate::queue::Shared;

/// Construction of an executor failed. The queue records the message as the
/// task's failure cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct LaunchError(String);

impl LaunchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Live handle to one running task.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Would running `candidate` concurrently with this executor's task
    /// contend for an exclusively held resource?
    fn blocks(&self, candidate: &TaskEntry) -> bool;

    /// Current view of the task, including its state.
    fn task(&self) -> TaskEntry;

    /// Ask the work to stop. Returns once the resulting terminal state has
    /// been posted to the queue.
    async fn cancel(&self);

    /// Wait for the executor's worker to finish.
    async fn join(&self);
}

/// Creates executors for admitted tasks.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Start an executor for `entry`. Must not return before the executor's
    /// worker has started.
    async fn construct(
        &self,
        entry: TaskEntry,
        reporter: TaskReporter,
    ) -> Result<Arc<dyn Executor>, LaunchError>;
}

/// Back channel from an executor to the queue that owns it.
#[derive(Clone)]
pub struct TaskReporter {
    queue: Weak<Shared>,
}

impl TaskReporter {
    pub(crate) fn new(queue: Weak<Shared>) -> Self {
        Self { queue }
    }

    /// Report that the state of task `id` has changed. The queue re-reads
    /// the state from the executor and persists it.
    pub async fn post(&self, id: TaskId) -> QueueResult<()> {
        let shared = self.queue.upgrade().ok_or(QueueError::Closed)?;
        shared.post(id).await
    }
}
