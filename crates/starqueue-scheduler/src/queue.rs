//! The task queue — admission, lifecycle control, and the client API.
//!
//! All mutable scheduler state lives in [`Inner`] behind one async mutex.
//! Helpers that need the state take `&Inner` / `&mut Inner`, so calling
//! them proves the lock is held. The dispatch loop (see `dispatch.rs`)
//! is woken through `statechange`; waiters for executor drain subscribe to
//! the `drained` generation counter.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use starqueue_core::{
    DeviceBindings, TaskEntry, TaskId, TaskInfo, TaskParameters, TaskState, epoch_secs,
};
use starqueue_state::TaskStore;

use crate::artifacts::ArtifactStore;
use crate::error::{QueueError, QueueResult};
use crate::executor::{Executor, ExecutorFactory};
use crate::monitor::{MonitorEvent, TaskMonitor};

/// Cause recorded on rows found `executing` by [`TaskQueue::recover`].
pub const CRASH_CAUSE: &str = "server crash";

/// Lifecycle state of the queue as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// No dispatch loop is running.
    Idle,
    /// The loop is running and admits pending tasks.
    Launching,
    /// No new admissions; waiting for running executors to finish.
    Stopping,
    /// The loop is running but admits nothing, and no executors remain.
    Stopped,
}

impl QueueState {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueState::Idle => "idle",
            QueueState::Launching => "launching",
            QueueState::Stopping => "stopping",
            QueueState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Shared state ───────────────────────────────────────────────────

pub(crate) struct Inner {
    pub(crate) state: QueueState,
    pub(crate) executors: BTreeMap<TaskId, Arc<dyn Executor>>,
    /// Ids whose executors posted a terminal state and await cleanup.
    pub(crate) retired: VecDeque<TaskId>,
    pub(crate) store: Arc<dyn TaskStore>,
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) factory: Arc<dyn ExecutorFactory>,
    pub(crate) artifacts: Option<Arc<dyn ArtifactStore>>,
    monitor: RwLock<Option<Arc<dyn TaskMonitor>>>,
    /// Wakes the dispatch loop.
    pub(crate) statechange: Notify,
    /// Bumped whenever executors are retired or the queue reaches `Stopped`.
    drained: watch::Sender<u64>,
    pub(crate) dispatch: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn signal_drained(&self) {
        self.drained.send_modify(|generation| *generation += 1);
    }

    /// Deliver a state change to the current monitor.
    pub(crate) fn call(&self, info: &TaskInfo) {
        let monitor = self
            .monitor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(monitor) = monitor {
            monitor.update(&MonitorEvent::from_info(info));
        }
    }

    /// Persist `entry` and notify the monitor. Rows already in a terminal
    /// state are left alone; returns whether the write happened.
    pub(crate) fn update(&self, inner: &Inner, entry: &TaskEntry) -> QueueResult<bool> {
        let current = inner
            .store
            .get(entry.id)?
            .ok_or(QueueError::UnknownTask(entry.id))?;
        if current.state.is_terminal() {
            debug!(
                task_id = entry.id,
                state = %current.state,
                "ignoring update of terminated task"
            );
            return Ok(false);
        }
        inner.store.update(entry)?;
        self.call(&entry.info());
        Ok(true)
    }

    /// Executor for `id` reports a state change.
    pub(crate) async fn post(&self, id: TaskId) -> QueueResult<()> {
        let mut inner = self.inner.lock().await;
        let executor = inner
            .executors
            .get(&id)
            .cloned()
            .ok_or(QueueError::UnknownTask(id))?;
        let mut entry = executor.task();
        entry.lastchange = epoch_secs();
        debug!(task_id = id, state = %entry.state, "executor posted state");

        let written = self.update(&inner, &entry);
        // A terminal executor is retired even when its row could not be written.
        if entry.state.is_terminal() && !inner.retired.contains(&id) {
            inner.retired.push_back(id);
            self.statechange.notify_one();
        }
        if let Err(e) = &written {
            error!(task_id = id, state = %entry.state, error = %e, "failed to record posted state");
        }
        written.map(|_| ())
    }
}

// ── Builder ────────────────────────────────────────────────────────

pub struct TaskQueueBuilder {
    store: Arc<dyn TaskStore>,
    factory: Arc<dyn ExecutorFactory>,
    monitor: Option<Arc<dyn TaskMonitor>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
}

impl TaskQueueBuilder {
    pub fn monitor(mut self, monitor: Arc<dyn TaskMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Where the files referenced by completed rows live. Without one,
    /// `remove` leaves artifacts in place.
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn build(self) -> TaskQueue {
        let (drained, _) = watch::channel(0);
        let shared = Shared {
            inner: Mutex::new(Inner {
                state: QueueState::Idle,
                executors: BTreeMap::new(),
                retired: VecDeque::new(),
                store: self.store,
            }),
            factory: self.factory,
            artifacts: self.artifacts,
            monitor: RwLock::new(self.monitor),
            statechange: Notify::new(),
            drained,
            dispatch: std::sync::Mutex::new(None),
        };
        TaskQueue {
            shared: Arc::new(shared),
        }
    }
}

// ── Task queue ─────────────────────────────────────────────────────

/// Persistent queue of exposure tasks with device-conflict-aware dispatch.
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// An idle queue. Call [`start`](Self::start) to begin dispatching.
    pub fn new(store: Arc<dyn TaskStore>, factory: Arc<dyn ExecutorFactory>) -> Self {
        Self::builder(store, factory).build()
    }

    pub fn builder(
        store: Arc<dyn TaskStore>,
        factory: Arc<dyn ExecutorFactory>,
    ) -> TaskQueueBuilder {
        TaskQueueBuilder {
            store,
            factory,
            monitor: None,
            artifacts: None,
        }
    }

    /// Replace the monitor. The previous monitor, if any, is stopped.
    pub fn set_monitor(&self, monitor: Option<Arc<dyn TaskMonitor>>) {
        let previous = {
            let mut slot = self
                .shared
                .monitor
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, monitor)
        };
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    // ── Lifecycle ──

    /// Begin (or resume) admitting pending tasks.
    pub async fn start(&self) -> QueueResult<()> {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            QueueState::Idle => {
                drop(inner);
                self.restart(QueueState::Launching).await
            }
            QueueState::Stopped => {
                inner.state = QueueState::Launching;
                info!("task queue launching");
                self.shared.statechange.notify_one();
                Ok(())
            }
            state => Err(QueueError::BadState {
                operation: "start",
                state,
            }),
        }
    }

    /// Spawn the dispatch loop from `Idle`, entering `new_state`. Returns
    /// once the loop is running.
    pub async fn restart(&self, new_state: QueueState) -> QueueResult<()> {
        if !matches!(new_state, QueueState::Launching | QueueState::Stopped) {
            return Err(QueueError::InvalidTarget(new_state));
        }
        let started = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != QueueState::Idle {
                return Err(QueueError::BadState {
                    operation: "restart",
                    state: inner.state,
                });
            }
            inner.state = new_state;

            let (started_tx, started_rx) = oneshot::channel();
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(shared.run(started_tx));
            let previous = self
                .shared
                .dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(handle);
            if previous.is_some() {
                warn!("replacing handle of a finished dispatch loop");
            }
            started_rx
        };
        started.await.map_err(|_| QueueError::Closed)?;
        info!(state = %new_state, "task queue dispatch loop started");
        Ok(())
    }

    /// Stop admitting tasks. Running executors continue; the queue reaches
    /// `Stopped` once they have all finished.
    pub async fn stop(&self) -> QueueResult<()> {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != QueueState::Launching {
            return Err(QueueError::BadState {
                operation: "stop",
                state: inner.state,
            });
        }
        if inner.executors.is_empty() {
            inner.state = QueueState::Stopped;
            self.shared.signal_drained();
        } else {
            inner.state = QueueState::Stopping;
        }
        info!(state = %inner.state, running = inner.executors.len(), "task queue stopping");
        self.shared.statechange.notify_one();
        Ok(())
    }

    /// Terminate the dispatch loop. Only valid in `Stopped`.
    pub async fn shutdown(&self) -> QueueResult<()> {
        {
            let mut inner = self.shared.inner.lock().await;
            if inner.state != QueueState::Stopped {
                return Err(QueueError::BadState {
                    operation: "shutdown",
                    state: inner.state,
                });
            }
            inner.state = QueueState::Idle;
            self.shared.statechange.notify_one();
        }
        let handle = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop did not exit cleanly");
            }
        }
        info!("task queue shut down");
        Ok(())
    }

    /// Wait until the queue is `Stopped`. Fails if nothing would ever
    /// bring it there.
    pub async fn wait(&self) -> QueueResult<()> {
        let mut drained = self.shared.drained.subscribe();
        loop {
            {
                let inner = self.shared.inner.lock().await;
                match inner.state {
                    QueueState::Stopped => return Ok(()),
                    QueueState::Stopping => {}
                    state => {
                        return Err(QueueError::BadState {
                            operation: "wait",
                            state,
                        });
                    }
                }
            }
            if drained.changed().await.is_err() {
                return Err(QueueError::Closed);
            }
        }
    }

    /// Wait until no executor for task `id` remains.
    pub async fn wait_task(&self, id: TaskId) -> QueueResult<()> {
        let mut drained = self.shared.drained.subscribe();
        loop {
            if !self.shared.inner.lock().await.executors.contains_key(&id) {
                return Ok(());
            }
            if drained.changed().await.is_err() {
                return Err(QueueError::Closed);
            }
        }
    }

    /// Stop, cancel everything, and terminate the dispatch loop. Each step
    /// is best-effort.
    pub async fn close(&self) {
        if let Err(e) = self.stop().await {
            debug!(error = %e, "close: stop skipped");
        }
        self.cancel_all().await;
        if let Err(e) = self.wait().await {
            debug!(error = %e, "close: wait skipped");
        }
        if let Err(e) = self.shutdown().await {
            debug!(error = %e, "close: shutdown skipped");
        }
    }

    // ── Tasks ──

    /// Add a pending task and return its id.
    pub async fn submit(
        &self,
        parameters: TaskParameters,
        devices: DeviceBindings,
    ) -> QueueResult<TaskId> {
        let inner = self.shared.inner.lock().await;
        let mut entry = TaskEntry::pending(parameters, devices);
        entry.id = inner.store.insert(&entry)?;
        info!(
            task_id = entry.id,
            task_type = %entry.parameters.task_type,
            "task submitted"
        );
        self.shared.call(&entry.info());
        self.shared.statechange.notify_one();
        Ok(entry.id)
    }

    /// Cancel task `id`. Pending tasks are cancelled directly; executing
    /// tasks are asked to stop and this returns once they have. Tasks in
    /// other states are left alone.
    pub async fn cancel(&self, id: TaskId) -> QueueResult<()> {
        let executor = {
            let inner = self.shared.inner.lock().await;
            match inner.executors.get(&id) {
                Some(executor) => Arc::clone(executor),
                None => {
                    let mut entry = inner
                        .store
                        .get(id)?
                        .ok_or(QueueError::UnknownTask(id))?;
                    if entry.state == TaskState::Pending {
                        entry.terminate(TaskState::Cancelled, "cancelled before execution");
                        self.shared.update(&inner, &entry)?;
                        info!(task_id = id, "pending task cancelled");
                    } else {
                        debug!(task_id = id, state = %entry.state, "nothing to cancel");
                    }
                    return Ok(());
                }
            }
        };
        info!(task_id = id, "cancelling executing task");
        executor.cancel().await;
        Ok(())
    }

    /// Cancel every running executor. Pending tasks stay pending.
    pub async fn cancel_all(&self) {
        let executors: Vec<(TaskId, Arc<dyn Executor>)> = {
            let inner = self.shared.inner.lock().await;
            inner
                .executors
                .iter()
                .map(|(id, executor)| (*id, Arc::clone(executor)))
                .collect()
        };
        for (id, executor) in executors {
            debug!(task_id = id, "cancelling executor");
            executor.cancel().await;
        }
    }

    /// Delete a finished or pending task. The image of a completed task is
    /// deleted as well.
    ///
    /// A terminal row can be removed while its executor still awaits
    /// retirement; the loop only joins that executor afterwards.
    pub async fn remove(&self, id: TaskId) -> QueueResult<()> {
        let entry = {
            let inner = self.shared.inner.lock().await;
            let entry = inner
                .store
                .get(id)?
                .ok_or(QueueError::UnknownTask(id))?;
            let live = inner.executors.contains_key(&id);
            if entry.state == TaskState::Executing || (live && !entry.state.is_terminal()) {
                return Err(QueueError::RemovalConflict(id));
            }
            inner.store.delete(id)?;
            self.shared.call(&entry.info());
            entry
        };
        info!(task_id = id, state = %entry.state, "task removed");

        if entry.state == TaskState::Complete {
            if let (Some(filename), Some(artifacts)) = (&entry.filename, &self.shared.artifacts) {
                if let Err(e) = artifacts.delete(filename) {
                    warn!(task_id = id, error = %e, "failed to delete task artifact");
                }
            }
        }
        Ok(())
    }

    /// Atomic state update of a stored task; see [`Shared::update`].
    pub async fn update(&self, entry: &TaskEntry) -> QueueResult<bool> {
        let inner = self.shared.inner.lock().await;
        self.shared.update(&inner, entry)
    }

    /// Fail every row left `executing` by a previous run. Rows owned by a
    /// live executor are skipped. Returns the repaired ids.
    pub async fn recover(&self) -> Vec<TaskId> {
        let inner = self.shared.inner.lock().await;
        let live: HashSet<TaskId> = inner.executors.keys().copied().collect();
        let repaired = match inner.store.fail_executing(CRASH_CAUSE, epoch_secs(), &live) {
            Ok(repaired) => repaired,
            Err(e) => {
                warn!(error = %e, "crash recovery failed");
                return Vec::new();
            }
        };
        for id in &repaired {
            match inner.store.get(*id) {
                Ok(Some(entry)) => self.shared.call(&entry.info()),
                Ok(None) => {}
                Err(e) => warn!(task_id = id, error = %e, "failed to read recovered task"),
            }
        }
        if !repaired.is_empty() {
            info!(count = repaired.len(), "recovered tasks interrupted by crash");
        }
        repaired
    }

    // ── Queries ──

    pub async fn state(&self) -> QueueState {
        self.shared.inner.lock().await.state
    }

    pub async fn info(&self, id: TaskId) -> QueueResult<TaskInfo> {
        Ok(self.entry(id).await?.info())
    }

    pub async fn parameters(&self, id: TaskId) -> QueueResult<TaskParameters> {
        Ok(self.entry(id).await?.parameters)
    }

    pub async fn entry(&self, id: TaskId) -> QueueResult<TaskEntry> {
        let inner = self.shared.inner.lock().await;
        inner.store.get(id)?.ok_or(QueueError::UnknownTask(id))
    }

    /// Ids of all tasks in `state`, ascending.
    pub async fn tasklist(&self, state: TaskState) -> QueueResult<Vec<TaskId>> {
        let inner = self.shared.inner.lock().await;
        Ok(inner.store.select_ids_by_state(state)?)
    }

    pub async fn exists(&self, id: TaskId) -> QueueResult<bool> {
        let inner = self.shared.inner.lock().await;
        Ok(inner.store.exists(id)?)
    }

    /// Ids of tasks with a live executor, ascending.
    pub async fn running(&self) -> Vec<TaskId> {
        let inner = self.shared.inner.lock().await;
        inner.executors.keys().copied().collect()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let handle = self
            .shared
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if !handle.is_finished() {
                warn!("task queue dropped while dispatching; aborting loop");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{SleepWork, WorkExecutorFactory};
    use starqueue_core::TaskType;
    use starqueue_state::StateStore;

    fn test_queue() -> (TaskQueue, Arc<StateStore>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let factory = WorkExecutorFactory::new().with_work(TaskType::Sleep, Arc::new(SleepWork));
        let queue = TaskQueue::new(store.clone(), Arc::new(factory));
        (queue, store)
    }

    #[test]
    fn queue_state_display() {
        assert_eq!(QueueState::Idle.to_string(), "idle");
        assert_eq!(QueueState::Stopping.to_string(), "stopping");
    }

    #[tokio::test]
    async fn new_queue_is_idle() {
        let (queue, _store) = test_queue();
        assert_eq!(queue.state().await, QueueState::Idle);
        assert!(queue.running().await.is_empty());
    }

    #[tokio::test]
    async fn submit_while_idle_stays_pending() {
        let (queue, _store) = test_queue();
        let id = queue
            .submit(TaskParameters::default(), DeviceBindings::default())
            .await
            .unwrap();
        assert_eq!(queue.info(id).await.unwrap().state, TaskState::Pending);
        assert_eq!(queue.tasklist(TaskState::Pending).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn lifecycle_errors_name_state() {
        let (queue, _store) = test_queue();
        let err = queue.stop().await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::BadState {
                operation: "stop",
                state: QueueState::Idle
            }
        ));
        assert!(queue.shutdown().await.is_err());
        assert!(queue.wait().await.is_err());
        assert!(matches!(
            queue.restart(QueueState::Stopping).await,
            Err(QueueError::InvalidTarget(QueueState::Stopping))
        ));
    }

    #[tokio::test]
    async fn restart_into_stopped_admits_nothing() {
        let (queue, _store) = test_queue();
        queue.restart(QueueState::Stopped).await.unwrap();
        assert_eq!(queue.state().await, QueueState::Stopped);
        assert!(queue.start().await.is_ok());
        assert_eq!(queue.state().await, QueueState::Launching);
        queue.close().await;
        assert_eq!(queue.state().await, QueueState::Idle);
    }

    #[tokio::test]
    async fn start_twice_is_bad_state() {
        let (queue, _store) = test_queue();
        queue.start().await.unwrap();
        assert!(matches!(
            queue.start().await,
            Err(QueueError::BadState {
                operation: "start",
                state: QueueState::Launching
            })
        ));
        queue.close().await;
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let (queue, _store) = test_queue();
        let id = queue
            .submit(TaskParameters::default(), DeviceBindings::default())
            .await
            .unwrap();
        queue.cancel(id).await.unwrap();
        let info = queue.info(id).await.unwrap();
        assert_eq!(info.state, TaskState::Cancelled);
        assert!(info.cause.is_some());

        // cancelling again is a no-op
        queue.cancel(id).await.unwrap();
        assert!(matches!(
            queue.cancel(999).await,
            Err(QueueError::UnknownTask(999))
        ));
    }

    #[tokio::test]
    async fn update_ignores_terminal_rows() {
        let (queue, _store) = test_queue();
        let id = queue
            .submit(TaskParameters::default(), DeviceBindings::default())
            .await
            .unwrap();
        queue.cancel(id).await.unwrap();

        let mut entry = queue.entry(id).await.unwrap();
        entry.transition(TaskState::Executing);
        assert!(!queue.update(&entry).await.unwrap());
        assert_eq!(queue.info(id).await.unwrap().state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn remove_unknown_and_pending() {
        let (queue, _store) = test_queue();
        assert!(matches!(
            queue.remove(42).await,
            Err(QueueError::UnknownTask(42))
        ));
        let id = queue
            .submit(TaskParameters::default(), DeviceBindings::default())
            .await
            .unwrap();
        queue.remove(id).await.unwrap();
        assert!(!queue.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn remove_executing_row_conflicts() {
        let (queue, store) = test_queue();
        let mut entry = TaskEntry::pending(TaskParameters::default(), DeviceBindings::default());
        entry.state = TaskState::Executing;
        let id = store.insert(&entry).unwrap();
        assert!(matches!(
            queue.remove(id).await,
            Err(QueueError::RemovalConflict(_))
        ));
    }

    /// Executor that has already finished and only waits to be retired.
    struct FinishedExecutor(TaskEntry);

    #[async_trait::async_trait]
    impl Executor for FinishedExecutor {
        fn blocks(&self, _candidate: &TaskEntry) -> bool {
            false
        }

        fn task(&self) -> TaskEntry {
            self.0.clone()
        }

        async fn cancel(&self) {}

        async fn join(&self) {}
    }

    async fn insert_with_executor(queue: &TaskQueue, store: &StateStore, state: TaskState) -> TaskId {
        let mut entry = TaskEntry::pending(TaskParameters::default(), DeviceBindings::default());
        entry.state = state;
        entry.id = store.insert(&entry).unwrap();
        let id = entry.id;
        queue
            .shared
            .inner
            .lock()
            .await
            .executors
            .insert(id, Arc::new(FinishedExecutor(entry)));
        id
    }

    #[tokio::test]
    async fn remove_completed_row_before_retirement() {
        let (queue, store) = test_queue();
        let id = insert_with_executor(&queue, &store, TaskState::Complete).await;
        queue.remove(id).await.unwrap();
        assert!(!queue.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn remove_unfinished_row_of_live_executor_conflicts() {
        let (queue, store) = test_queue();
        let id = insert_with_executor(&queue, &store, TaskState::Pending).await;
        assert!(matches!(
            queue.remove(id).await,
            Err(QueueError::RemovalConflict(_))
        ));
        assert!(queue.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn recover_fails_stale_executing_rows() {
        let (queue, store) = test_queue();
        let mut entry = TaskEntry::pending(TaskParameters::default(), DeviceBindings::default());
        entry.state = TaskState::Executing;
        let stale = store.insert(&entry).unwrap();
        let pending = queue
            .submit(TaskParameters::default(), DeviceBindings::default())
            .await
            .unwrap();

        assert_eq!(queue.recover().await, vec![stale]);
        let info = queue.info(stale).await.unwrap();
        assert_eq!(info.state, TaskState::Failed);
        assert_eq!(info.cause.as_deref(), Some(CRASH_CAUSE));
        assert_eq!(queue.info(pending).await.unwrap().state, TaskState::Pending);
        assert!(queue.recover().await.is_empty());
    }
}
