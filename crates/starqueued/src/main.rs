//! starqueued — the starqueue daemon.
//!
//! Single binary that assembles the task queue:
//! - Task record store (redb)
//! - Crash recovery of interrupted tasks
//! - Task queue with the built-in work items
//! - Artifact store for completed images
//!
//! # Usage
//!
//! ```text
//! starqueued run --data-dir /var/lib/starqueue --submit tonight.toml
//! starqueued list --data-dir /var/lib/starqueue --state pending
//! starqueued recover --config /etc/starqueue.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use starqueue_core::{QueueConfig, TaskFile, TaskState, TaskType};
use starqueue_scheduler::{
    FsArtifactStore, LogMonitor, SleepWork, TaskQueue, WorkExecutorFactory,
};
use starqueue_state::{StateStore, TaskStore};

const DEFAULT_DATA_DIR: &str = "/var/lib/starqueue";

#[derive(Parser)]
#[command(name = "starqueued", about = "starqueue task queue daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct StoreArgs {
    /// Path to starqueue.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the task store and images; overrides the paths
    /// in --config.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the task queue until interrupted.
    Run {
        #[command(flatten)]
        store: StoreArgs,

        /// Task file whose `[[tasks]]` are submitted at startup.
        #[arg(long)]
        submit: Option<PathBuf>,
    },

    /// Print stored tasks as JSON lines.
    List {
        #[command(flatten)]
        store: StoreArgs,

        /// Only tasks in this state.
        #[arg(long)]
        state: Option<TaskState>,
    },

    /// Fail tasks left executing by a crashed daemon.
    Recover {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,starqueued=debug,starqueue_scheduler=debug"
                    .parse()
                    .unwrap()
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { store, submit } => run(resolve_config(&store)?, submit).await,
        Command::List { store, state } => list(&resolve_config(&store)?, state),
        Command::Recover { store } => recover(&resolve_config(&store)?).await,
    }
}

fn resolve_config(args: &StoreArgs) -> anyhow::Result<QueueConfig> {
    let mut config = match &args.config {
        Some(path) => QueueConfig::from_file(path)?,
        None => QueueConfig::in_data_dir(Path::new(DEFAULT_DATA_DIR)),
    };
    if let Some(data_dir) = &args.data_dir {
        let rooted = QueueConfig::in_data_dir(data_dir);
        config.store = rooted.store;
        config.artifacts = rooted.artifacts;
    }
    Ok(config)
}

fn open_store(path: &Path) -> anyhow::Result<Arc<StateStore>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(path)?;
    info!(path = ?path, "task store opened");
    Ok(Arc::new(store))
}

fn build_queue(config: &QueueConfig, store: Arc<StateStore>) -> anyhow::Result<TaskQueue> {
    let factory = WorkExecutorFactory::new().with_work(TaskType::Sleep, Arc::new(SleepWork));
    let mut builder = TaskQueue::builder(store, Arc::new(factory)).monitor(Arc::new(LogMonitor));
    if let Some(artifacts) = &config.artifacts {
        std::fs::create_dir_all(&artifacts.directory)?;
        builder = builder.artifacts(Arc::new(FsArtifactStore::new(&artifacts.directory)));
        info!(directory = ?artifacts.directory, "artifact store ready");
    }
    Ok(builder.build())
}

async fn run(config: QueueConfig, submit: Option<PathBuf>) -> anyhow::Result<()> {
    info!("starqueue daemon starting");

    let store = open_store(&config.store.path)?;
    let queue = build_queue(&config, store)?;

    if config.queue.recover {
        let repaired = queue.recover().await;
        info!(count = repaired.len(), "crash recovery complete");
    }

    if config.queue.autostart {
        queue.start().await?;
    } else {
        info!("autostart disabled; tasks stay pending");
    }

    if let Some(path) = submit {
        let file = TaskFile::from_file(&path)?;
        for task in file.tasks {
            let id = queue.submit(task.parameters, task.devices).await?;
            info!(task_id = id, file = ?path, "task queued from file");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    queue.close().await;
    info!("starqueue daemon stopped");
    Ok(())
}

fn list(config: &QueueConfig, state: Option<TaskState>) -> anyhow::Result<()> {
    let store = StateStore::open(&config.store.path)?;
    let entries = match state {
        Some(state) => {
            let mut entries = Vec::new();
            for id in store.select_ids_by_state(state)? {
                match store.get(id)? {
                    Some(entry) => entries.push(entry),
                    None => warn!(task_id = id, "task vanished while listing"),
                }
            }
            entries
        }
        None => store.list()?,
    };
    for entry in entries {
        println!("{}", serde_json::to_string(&entry.info())?);
    }
    Ok(())
}

async fn recover(config: &QueueConfig) -> anyhow::Result<()> {
    let store = open_store(&config.store.path)?;
    let queue = TaskQueue::new(store, Arc::new(WorkExecutorFactory::new()));
    let repaired = queue.recover().await;
    println!("{}", serde_json::to_string(&repaired)?);
    Ok(())
}
