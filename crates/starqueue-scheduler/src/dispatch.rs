//! Dispatch loop — retires finished executors and launches pending tasks.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use starqueue_core::{TaskEntry, TaskId, TaskState};

use crate::executor::TaskReporter;
use crate::queue::{Inner, QueueState, Shared};

impl Shared {
    /// Body of the dispatch task. Exits when the queue returns to `Idle`.
    pub(crate) async fn run(self: Arc<Self>, started: oneshot::Sender<()>) {
        let _ = started.send(());
        debug!("dispatch loop running");

        loop {
            {
                let mut inner = self.inner.lock().await;

                if self.cleanup(&mut inner).await > 0 {
                    self.signal_drained();
                }

                if inner.state == QueueState::Idle {
                    break;
                }

                if inner.state == QueueState::Stopping && inner.executors.is_empty() {
                    inner.state = QueueState::Stopped;
                    info!("task queue stopped");
                    self.signal_drained();
                }

                self.launch(&mut inner).await;
            }
            self.statechange.notified().await;
        }

        debug!("dispatch loop terminated");
    }

    /// Join and discard every executor that has posted a terminal state.
    async fn cleanup(&self, inner: &mut Inner) -> usize {
        let mut retired = 0;
        while let Some(id) = inner.retired.pop_front() {
            let Some(executor) = inner.executors.remove(&id) else {
                continue;
            };
            executor.join().await;
            debug!(task_id = id, "executor retired");
            retired += 1;
        }
        retired
    }

    /// Start an executor for every pending task no running executor blocks.
    async fn launch(self: &Arc<Self>, inner: &mut Inner) {
        if inner.state != QueueState::Launching {
            return;
        }
        let pending = match inner.store.select_ids_by_state(TaskState::Pending) {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to list pending tasks");
                return;
            }
        };

        for id in pending {
            if inner.executors.contains_key(&id) {
                continue;
            }
            let entry = match inner.store.get(id) {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    error!(task_id = id, error = %e, "failed to read pending task");
                    continue;
                }
            };
            if let Some(blocker) = blocking_executor(inner, &entry) {
                debug!(task_id = id, blocked_by = blocker, "task blocked");
                continue;
            }
            self.launch_one(inner, entry).await;
        }
    }

    async fn launch_one(self: &Arc<Self>, inner: &mut Inner, mut entry: TaskEntry) {
        let id = entry.id;
        entry.transition(TaskState::Executing);
        let reporter = TaskReporter::new(Arc::downgrade(self));

        match self.factory.construct(entry.clone(), reporter).await {
            Ok(executor) => {
                if let Err(e) = self.update(inner, &entry) {
                    error!(task_id = id, error = %e, "failed to record task launch");
                }
                inner.executors.insert(id, executor);
                info!(task_id = id, "task launched");
            }
            Err(launch_error) => {
                warn!(task_id = id, error = %launch_error, "task launch failed");
                entry.terminate(TaskState::Failed, launch_error.to_string());
                if let Err(e) = self.update(inner, &entry) {
                    error!(task_id = id, error = %e, "failed to record launch failure");
                }
            }
        }
    }
}

fn blocking_executor(inner: &Inner, candidate: &TaskEntry) -> Option<TaskId> {
    inner
        .executors
        .iter()
        .find(|(_, executor)| executor.blocks(candidate))
        .map(|(id, _)| *id)
}
