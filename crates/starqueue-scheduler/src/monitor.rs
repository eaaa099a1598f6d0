//! State-change notification for queue clients.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use starqueue_core::{TaskId, TaskInfo, TaskState, epoch_secs};

/// One task state change, as delivered to a [`TaskMonitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub id: TaskId,
    pub state: TaskState,
    /// Unix timestamp (seconds) at which the event was raised.
    pub when: u64,
}

impl MonitorEvent {
    pub fn from_info(info: &TaskInfo) -> Self {
        Self {
            id: info.id,
            state: info.state,
            when: epoch_secs(),
        }
    }
}

/// Receives every task state change the queue records.
///
/// `update` is called while the queue's lock is held, so events arrive in
/// the order they were recorded. Implementations must return promptly and
/// must not call back into the queue.
pub trait TaskMonitor: Send + Sync {
    fn update(&self, event: &MonitorEvent);

    /// The queue no longer reports to this monitor.
    fn stop(&self) {}
}

/// Forwards events into an unbounded channel until stopped.
pub struct ChannelMonitor {
    tx: mpsc::UnboundedSender<MonitorEvent>,
    stopped: AtomicBool,
}

impl ChannelMonitor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            tx,
            stopped: AtomicBool::new(false),
        };
        (monitor, rx)
    }
}

impl TaskMonitor for ChannelMonitor {
    fn update(&self, event: &MonitorEvent) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.tx.send(*event).is_err() {
            debug!(task_id = event.id, "monitor receiver dropped");
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Logs every event through `tracing`.
pub struct LogMonitor;

impl TaskMonitor for LogMonitor {
    fn update(&self, event: &MonitorEvent) {
        info!(
            task_id = event.id,
            state = %event.state,
            when = event.when,
            "task state changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: TaskId, state: TaskState) -> MonitorEvent {
        MonitorEvent {
            id,
            state,
            when: 0,
        }
    }

    #[test]
    fn channel_monitor_forwards_in_order() {
        let (monitor, mut rx) = ChannelMonitor::new();
        monitor.update(&event(1, TaskState::Pending));
        monitor.update(&event(1, TaskState::Executing));

        assert_eq!(rx.try_recv().unwrap().state, TaskState::Pending);
        assert_eq!(rx.try_recv().unwrap().state, TaskState::Executing);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_monitor_drops_events_after_stop() {
        let (monitor, mut rx) = ChannelMonitor::new();
        monitor.stop();
        monitor.update(&event(3, TaskState::Complete));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn channel_monitor_survives_dropped_receiver() {
        let (monitor, rx) = ChannelMonitor::new();
        drop(rx);
        monitor.update(&event(1, TaskState::Failed));
    }
}
