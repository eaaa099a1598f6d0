//! starqueue-state — durable task record store.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage of task rows for the scheduler.
//!
//! # Architecture
//!
//! Task rows are JSON-serialized into redb's `&[u8]` value column, keyed by
//! the numeric task id so that table iteration yields ascending id order.
//! A small metadata table holds the id counter, which keeps ids unique
//! across deletions and restarts.
//!
//! The [`TaskStore`] trait is the seam the scheduler depends on;
//! [`StateStore`] is the redb implementation. `StateStore` is `Clone` +
//! `Send` + `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{StateStore, TaskStore};
