//! redb table definitions for the task record store.

use redb::TableDefinition;

/// Task rows keyed by task id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Store metadata (id counter) keyed by name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the next task id to assign.
pub const NEXT_TASK_ID: &str = "next_task_id";
