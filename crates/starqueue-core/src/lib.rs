pub mod config;
pub mod types;

pub use config::{QueueConfig, TaskFile, TaskSubmission};
pub use types::*;
