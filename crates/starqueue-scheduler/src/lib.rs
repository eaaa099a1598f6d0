//! starqueue-scheduler — task admission and executor supervision.
//!
//! Turns submitted [`TaskParameters`](starqueue_core::TaskParameters) into
//! running executors. The queue:
//!
//! - Persists every task row and state change to a [`TaskStore`](starqueue_state::TaskStore)
//! - Launches pending tasks in id order, skipping tasks whose devices are
//!   held by a running executor
//! - Retires executors once they report a terminal state
//! - Repairs rows left `executing` by a crashed predecessor
//!
//! # Architecture
//!
//! ```text
//! TaskQueue
//!   ├── Inner (one async mutex)
//!   │   ├── TaskStore (task rows)
//!   │   ├── executors: TaskId → Executor
//!   │   └── retire queue
//!   ├── ExecutorFactory (builds executors, e.g. WorkExecutorFactory)
//!   ├── TaskMonitor (state-change events)
//!   ├── ArtifactStore (images of completed tasks)
//!   └── dispatch loop (woken by submit / post / stop / start)
//! ```

pub mod artifacts;
mod dispatch;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod queue;
pub mod work;

pub use artifacts::{ArtifactError, ArtifactStore, FsArtifactStore};
pub use error::{QueueError, QueueResult};
pub use executor::{Executor, ExecutorFactory, LaunchError, TaskReporter};
pub use monitor::{ChannelMonitor, LogMonitor, MonitorEvent, TaskMonitor};
pub use queue::{CRASH_CAUSE, QueueState, TaskQueue, TaskQueueBuilder};
pub use work::{
    CancelSignal, SleepWork, TaskWork, WorkError, WorkExecutor, WorkExecutorFactory, WorkOutcome,
};
