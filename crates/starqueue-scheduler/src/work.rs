//! Work-backed executors.
//!
//! A [`TaskWork`] is the device-facing part of a task: it takes exposures,
//! moves the mount, sleeps. [`WorkExecutor`] wraps one run of a work item
//! in a worker task and translates its outcome into the task's terminal
//! state. [`WorkExecutorFactory`] picks the work by task type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use starqueue_core::{DeviceBindings, ImageFrame, TaskEntry, TaskId, TaskState, TaskType};

use crate::executor::{Executor, ExecutorFactory, LaunchError, TaskReporter};

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkOutcome {
    /// Artifact reference of the produced image, if any.
    pub filename: Option<String>,
    pub frame: Option<ImageFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

/// Cancellation request observed by running work.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested, or once the executor
    /// holding the other end is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// The device-facing body of a task.
#[async_trait]
pub trait TaskWork: Send + Sync {
    /// Validate the task before its worker starts. An error here becomes a
    /// launch failure.
    fn prepare(&self, _entry: &TaskEntry) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn run(&self, entry: TaskEntry, cancel: CancelSignal) -> Result<WorkOutcome, WorkError>;
}

// ── Executor ────────────────────────────────────────────────────────

/// Runs one [`TaskWork`] in a spawned worker.
pub struct WorkExecutor {
    id: TaskId,
    devices: DeviceBindings,
    entry: Arc<Mutex<TaskEntry>>,
    cancel_tx: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WorkExecutor {
    /// Spawn the worker for `entry` and wait until it is running.
    pub async fn launch(
        entry: TaskEntry,
        work: Arc<dyn TaskWork>,
        reporter: TaskReporter,
    ) -> Result<Self, LaunchError> {
        work.prepare(&entry)?;

        let id = entry.id;
        let devices = entry.devices.clone();
        let shared_entry = Arc::new(Mutex::new(entry));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done) = watch::channel(false);
        let (started_tx, started_rx) = oneshot::channel();

        let worker_entry = Arc::clone(&shared_entry);
        let worker = tokio::spawn(async move {
            let _ = started_tx.send(());
            let snapshot = lock(&worker_entry).clone();
            let signal = CancelSignal::new(cancel_rx);

            // A panicking work item must still produce a terminal state.
            let result = tokio::spawn(async move { work.run(snapshot, signal).await }).await;

            {
                let mut entry = lock(&worker_entry);
                match result {
                    Ok(Ok(outcome)) => {
                        entry.transition(TaskState::Complete);
                        entry.filename = outcome.filename;
                        entry.frame = outcome.frame;
                    }
                    Ok(Err(WorkError::Cancelled)) => {
                        entry.terminate(TaskState::Cancelled, "cancelled");
                    }
                    Ok(Err(WorkError::Failed(cause))) => {
                        entry.terminate(TaskState::Failed, cause);
                    }
                    Err(e) => {
                        error!(task_id = id, error = %e, "work panicked");
                        entry.terminate(TaskState::Failed, "work panicked");
                    }
                }
                debug!(task_id = id, state = %entry.state, "work finished");
            }

            if let Err(e) = reporter.post(id).await {
                warn!(task_id = id, error = %e, "failed to report final state");
            }
            let _ = done_tx.send(true);
        });

        started_rx
            .await
            .map_err(|_| LaunchError::new(format!("worker for task {id} did not start")))?;

        Ok(Self {
            id,
            devices,
            entry: shared_entry,
            cancel_tx,
            done,
            worker: tokio::sync::Mutex::new(Some(worker)),
        })
    }
}

#[async_trait]
impl Executor for WorkExecutor {
    fn blocks(&self, candidate: &TaskEntry) -> bool {
        candidate.id != self.id && self.devices.conflicts_with(&candidate.devices)
    }

    fn task(&self) -> TaskEntry {
        lock(&self.entry).clone()
    }

    async fn cancel(&self) {
        // The worker may already have dropped its receiver.
        let _ = self.cancel_tx.send(true);
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    async fn join(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(task_id = self.id, error = %e, "worker did not finish cleanly");
            }
        }
    }
}

fn lock(entry: &Mutex<TaskEntry>) -> MutexGuard<'_, TaskEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Factory ─────────────────────────────────────────────────────────

/// Builds [`WorkExecutor`]s, selecting the work by task type.
#[derive(Default)]
pub struct WorkExecutorFactory {
    works: HashMap<TaskType, Arc<dyn TaskWork>>,
}

impl WorkExecutorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `work` for `task_type`, returning the previous registration.
    pub fn register(
        &mut self,
        task_type: TaskType,
        work: Arc<dyn TaskWork>,
    ) -> Option<Arc<dyn TaskWork>> {
        self.works.insert(task_type, work)
    }

    pub fn with_work(mut self, task_type: TaskType, work: Arc<dyn TaskWork>) -> Self {
        self.register(task_type, work);
        self
    }
}

#[async_trait]
impl ExecutorFactory for WorkExecutorFactory {
    async fn construct(
        &self,
        entry: TaskEntry,
        reporter: TaskReporter,
    ) -> Result<Arc<dyn Executor>, LaunchError> {
        let task_type = entry.parameters.task_type;
        let work = self.works.get(&task_type).cloned().ok_or_else(|| {
            LaunchError::new(format!("no work registered for task type {task_type}"))
        })?;
        let executor = WorkExecutor::launch(entry, work, reporter).await?;
        Ok(Arc::new(executor))
    }
}

// ── Built-in work ───────────────────────────────────────────────────

/// Waits for the task's exposure time. Used for `sleep` tasks.
pub struct SleepWork;

#[async_trait]
impl TaskWork for SleepWork {
    fn prepare(&self, entry: &TaskEntry) -> Result<(), LaunchError> {
        let seconds = entry.parameters.exposure.exposure_time;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(LaunchError::new(format!("invalid sleep time {seconds}")));
        }
        Ok(())
    }

    async fn run(&self, entry: TaskEntry, mut cancel: CancelSignal) -> Result<WorkOutcome, WorkError> {
        let duration = Duration::from_secs_f64(entry.parameters.exposure.exposure_time);
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(WorkOutcome::default()),
            _ = cancel.cancelled() => Err(WorkError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starqueue_core::TaskParameters;

    fn sleep_entry(seconds: f64) -> TaskEntry {
        let mut parameters = TaskParameters::default();
        parameters.task_type = TaskType::Sleep;
        parameters.exposure.exposure_time = seconds;
        TaskEntry::pending(parameters, DeviceBindings::default())
    }

    #[test]
    fn sleep_rejects_negative_time() {
        let err = SleepWork.prepare(&sleep_entry(-1.0)).unwrap_err();
        assert!(err.to_string().contains("invalid sleep time"));
        assert!(SleepWork.prepare(&sleep_entry(f64::NAN)).is_err());
        assert!(SleepWork.prepare(&sleep_entry(0.5)).is_ok());
    }

    #[tokio::test]
    async fn sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        let outcome = SleepWork
            .run(sleep_entry(0.0), CancelSignal::new(rx))
            .await
            .unwrap();
        assert_eq!(outcome, WorkOutcome::default());
    }

    #[tokio::test]
    async fn sleep_observes_cancel() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let result = SleepWork.run(sleep_entry(3600.0), CancelSignal::new(rx)).await;
        assert_eq!(result, Err(WorkError::Cancelled));
    }

    #[test]
    fn cancel_signal_reports_state() {
        let (tx, rx) = watch::channel(false);
        let signal = CancelSignal::new(rx);
        assert!(!signal.is_cancelled());
        tx.send(true).unwrap();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn factory_registration() {
        let mut factory = WorkExecutorFactory::new();
        assert!(factory.register(TaskType::Sleep, Arc::new(SleepWork)).is_none());
        assert!(factory.register(TaskType::Sleep, Arc::new(SleepWork)).is_some());
        assert!(factory.works.contains_key(&TaskType::Sleep));
        assert!(!factory.works.contains_key(&TaskType::Exposure));
    }
}
