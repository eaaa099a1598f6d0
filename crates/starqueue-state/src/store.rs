//! The [`TaskStore`] seam and its redb implementation.
//!
//! Each call runs in its own redb transaction, so a row change is durable
//! once the call returns.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use starqueue_core::{TaskEntry, TaskId, TaskState};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// `store_err!(Read)` is a closure wrapping a backend error's text in
/// `StateError::Read`.
macro_rules! store_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Durable, queryable storage of task rows.
///
/// Implementations must be safe to call from the scheduler's dispatch loop
/// and from client tasks concurrently.
pub trait TaskStore: Send + Sync {
    /// Store a new row and return the id assigned to it. The id field of
    /// `entry` is ignored.
    fn insert(&self, entry: &TaskEntry) -> StateResult<TaskId>;

    fn get(&self, id: TaskId) -> StateResult<Option<TaskEntry>>;

    /// Overwrite an existing row. Fails with `NotFound` if the row is absent.
    fn update(&self, entry: &TaskEntry) -> StateResult<()>;

    /// Delete a row. Returns true if it existed.
    fn delete(&self, id: TaskId) -> StateResult<bool>;

    /// Ids of all rows in `state`, ascending.
    fn select_ids_by_state(&self, state: TaskState) -> StateResult<Vec<TaskId>>;

    fn exists(&self, id: TaskId) -> StateResult<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// Force every `executing` row not listed in `except` to `failed` with
    /// `cause`, in one transaction. Returns the ids that were changed.
    fn fail_executing(
        &self,
        cause: &str,
        when: u64,
        except: &HashSet<TaskId>,
    ) -> StateResult<Vec<TaskId>>;
}

/// Thread-safe task record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Task database file at `path`; the file is created on first use.
    pub fn open(path: &Path) -> StateResult<Self> {
        let store = Self::with_database(Database::create(path).map_err(store_err!(Open))?)?;
        debug!(?path, "task store opened");
        Ok(store)
    }

    /// Store that lives only as long as the process. Tests use it.
    pub fn open_in_memory() -> StateResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(store_err!(Open))?;
        let store = Self::with_database(db)?;
        debug!("in-memory task store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> StateResult<Self> {
        let txn = db.begin_write().map_err(store_err!(Transaction))?;
        txn.open_table(TASKS).map_err(store_err!(Table))?;
        txn.open_table(META).map_err(store_err!(Table))?;
        txn.commit().map_err(store_err!(Transaction))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// List all rows, ascending by id.
    pub fn list(&self) -> StateResult<Vec<TaskEntry>> {
        let txn = self.db.begin_read().map_err(store_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(store_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(store_err!(Read))? {
            let (_, value) = entry.map_err(store_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }
}

impl TaskStore for StateStore {
    fn insert(&self, entry: &TaskEntry) -> StateResult<TaskId> {
        let txn = self.db.begin_write().map_err(store_err!(Transaction))?;
        let id;
        {
            let mut meta = txn.open_table(META).map_err(store_err!(Table))?;
            id = meta
                .get(NEXT_TASK_ID)
                .map_err(store_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(1);
            meta.insert(NEXT_TASK_ID, id + 1).map_err(store_err!(Write))?;

            let mut row = entry.clone();
            row.id = id;
            let value = encode(&row)?;
            let mut table = txn.open_table(TASKS).map_err(store_err!(Table))?;
            table
                .insert(id, value.as_slice())
                .map_err(store_err!(Write))?;
        }
        txn.commit().map_err(store_err!(Transaction))?;
        debug!(task_id = id, "task row inserted");
        Ok(id)
    }

    fn get(&self, id: TaskId) -> StateResult<Option<TaskEntry>> {
        let txn = self.db.begin_read().map_err(store_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(store_err!(Table))?;
        match table.get(id).map_err(store_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn update(&self, entry: &TaskEntry) -> StateResult<()> {
        let value = encode(entry)?;
        let txn = self.db.begin_write().map_err(store_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(store_err!(Table))?;
            if table.get(entry.id).map_err(store_err!(Read))?.is_none() {
                return Err(StateError::NotFound(entry.id));
            }
            table
                .insert(entry.id, value.as_slice())
                .map_err(store_err!(Write))?;
        }
        txn.commit().map_err(store_err!(Transaction))?;
        debug!(task_id = entry.id, state = %entry.state, "task row updated");
        Ok(())
    }

    fn delete(&self, id: TaskId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(store_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(store_err!(Table))?;
            existed = table.remove(id).map_err(store_err!(Write))?.is_some();
        }
        txn.commit().map_err(store_err!(Transaction))?;
        debug!(task_id = id, existed, "task row deleted");
        Ok(existed)
    }

    fn select_ids_by_state(&self, state: TaskState) -> StateResult<Vec<TaskId>> {
        let txn = self.db.begin_read().map_err(store_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(store_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(store_err!(Read))? {
            let (key, value) = entry.map_err(store_err!(Read))?;
            if decode(value.value())?.state == state {
                ids.push(key.value());
            }
        }
        Ok(ids)
    }

    fn exists(&self, id: TaskId) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(store_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(store_err!(Table))?;
        Ok(table.get(id).map_err(store_err!(Read))?.is_some())
    }

    fn fail_executing(
        &self,
        cause: &str,
        when: u64,
        except: &HashSet<TaskId>,
    ) -> StateResult<Vec<TaskId>> {
        let txn = self.db.begin_write().map_err(store_err!(Transaction))?;
        let mut repaired = Vec::new();
        {
            let mut table = txn.open_table(TASKS).map_err(store_err!(Table))?;
            // Collect first: the table cannot be written while iterating.
            let mut stale = Vec::new();
            for entry in table.iter().map_err(store_err!(Read))? {
                let (key, value) = entry.map_err(store_err!(Read))?;
                if except.contains(&key.value()) {
                    continue;
                }
                let row = decode(value.value())?;
                if row.state == TaskState::Executing {
                    stale.push(row);
                }
            }
            for mut row in stale {
                row.state = TaskState::Failed;
                row.lastchange = when;
                row.cause = Some(cause.to_string());
                let value = encode(&row)?;
                table
                    .insert(row.id, value.as_slice())
                    .map_err(store_err!(Write))?;
                repaired.push(row.id);
            }
        }
        txn.commit().map_err(store_err!(Transaction))?;
        debug!(count = repaired.len(), "executing rows marked failed");
        Ok(repaired)
    }
}

fn encode(entry: &TaskEntry) -> StateResult<Vec<u8>> {
    serde_json::to_vec(entry).map_err(store_err!(Serialize))
}

fn decode(bytes: &[u8]) -> StateResult<TaskEntry> {
    serde_json::from_slice(bytes).map_err(store_err!(Deserialize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use starqueue_core::{DeviceBindings, TaskParameters, TaskType};

    fn test_entry(camera: &str) -> TaskEntry {
        TaskEntry::pending(
            TaskParameters {
                task_type: TaskType::Exposure,
                instrument: "test-instrument".to_string(),
                camera_index: 0,
                ccd_index: 0,
                ..TaskParameters::default()
            },
            DeviceBindings {
                camera: Some(camera.to_string()),
                ..DeviceBindings::default()
            },
        )
    }

    fn insert_in_state(store: &StateStore, state: TaskState) -> TaskId {
        let id = store.insert(&test_entry("camera1")).unwrap();
        let mut row = store.get(id).unwrap().unwrap();
        row.state = state;
        store.update(&row).unwrap();
        id
    }

    // ── Row CRUD ───────────────────────────────────────────────────

    #[test]
    fn insert_assigns_ascending_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.insert(&test_entry("camera1")).unwrap();
        let b = store.insert(&test_entry("camera2")).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        let row = store.get(b).unwrap().unwrap();
        assert_eq!(row.id, b);
        assert_eq!(row.devices.camera.as_deref(), Some("camera2"));
        assert_eq!(row.state, TaskState::Pending);
    }

    #[test]
    fn ids_are_not_reused_after_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.insert(&test_entry("camera1")).unwrap();
        assert!(store.delete(a).unwrap());
        let b = store.insert(&test_entry("camera1")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get(42).unwrap().is_none());
        assert!(!store.exists(42).unwrap());
    }

    #[test]
    fn update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.insert(&test_entry("camera1")).unwrap();

        let mut row = store.get(id).unwrap().unwrap();
        row.terminate(TaskState::Failed, "no camera");
        store.update(&row).unwrap();

        let retrieved = store.get(id).unwrap().unwrap();
        assert_eq!(retrieved.state, TaskState::Failed);
        assert_eq!(retrieved.cause.as_deref(), Some("no camera"));
    }

    #[test]
    fn update_missing_row_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let mut row = test_entry("camera1");
        row.id = 7;
        let err = store.update(&row).unwrap_err();
        assert!(matches!(err, StateError::NotFound(7)));
        assert_eq!(err.to_string(), "no task row with id 7");
        assert!(store.get(7).unwrap().is_none());
    }

    #[test]
    fn delete_row() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.insert(&test_entry("camera1")).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(!store.exists(id).unwrap());
    }

    // ── Queries ────────────────────────────────────────────────────

    #[test]
    fn select_ids_by_state_is_ordered() {
        let store = StateStore::open_in_memory().unwrap();
        let p1 = insert_in_state(&store, TaskState::Pending);
        let e1 = insert_in_state(&store, TaskState::Executing);
        let p2 = insert_in_state(&store, TaskState::Pending);
        let c1 = insert_in_state(&store, TaskState::Complete);

        assert_eq!(store.select_ids_by_state(TaskState::Pending).unwrap(), vec![p1, p2]);
        assert_eq!(store.select_ids_by_state(TaskState::Executing).unwrap(), vec![e1]);
        assert_eq!(store.select_ids_by_state(TaskState::Complete).unwrap(), vec![c1]);
        assert!(store.select_ids_by_state(TaskState::Failed).unwrap().is_empty());
        assert_eq!(store.list().unwrap().len(), 4);
    }

    // ── Crash repair ───────────────────────────────────────────────

    #[test]
    fn fail_executing_repairs_only_executing_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let pending = insert_in_state(&store, TaskState::Pending);
        let executing = insert_in_state(&store, TaskState::Executing);
        let complete = insert_in_state(&store, TaskState::Complete);

        let repaired = store
            .fail_executing("server crash", 2000, &HashSet::new())
            .unwrap();
        assert_eq!(repaired, vec![executing]);

        let row = store.get(executing).unwrap().unwrap();
        assert_eq!(row.state, TaskState::Failed);
        assert_eq!(row.cause.as_deref(), Some("server crash"));
        assert_eq!(row.lastchange, 2000);

        assert_eq!(store.get(pending).unwrap().unwrap().state, TaskState::Pending);
        assert_eq!(store.get(complete).unwrap().unwrap().state, TaskState::Complete);
    }

    #[test]
    fn fail_executing_skips_excepted_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let live = insert_in_state(&store, TaskState::Executing);
        let stale = insert_in_state(&store, TaskState::Executing);

        let except: HashSet<TaskId> = [live].into_iter().collect();
        let repaired = store.fail_executing("server crash", 2000, &except).unwrap();
        assert_eq!(repaired, vec![stale]);
        assert_eq!(store.get(live).unwrap().unwrap().state, TaskState::Executing);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.redb");

        let first;
        {
            let store = StateStore::open(&db_path).unwrap();
            first = store.insert(&test_entry("camera1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let row = store.get(first).unwrap();
        assert!(row.is_some());
        assert_eq!(row.unwrap().parameters.instrument, "test-instrument");

        let second = store.insert(&test_entry("camera1")).unwrap();
        assert!(second > first);
    }

    #[test]
    fn fresh_file_answers_queries_before_first_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("tasks.redb")).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(
            store
                .select_ids_by_state(TaskState::Pending)
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.insert(&test_entry("camera1")).unwrap(), 1);
    }

    #[test]
    fn open_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = StateStore::open(&dir.path().join("absent/tasks.redb")).err().unwrap();
        assert!(matches!(err, StateError::Open(_)));
        assert!(err.to_string().starts_with("cannot open task database"));
    }
}
