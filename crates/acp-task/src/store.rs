// store.rs: TaskStore trait and its JSON-file and in-memory implementations.
//
// The TaskStore is the durable keyed store behind the task registry and the
// approval/progress ledgers. Nothing else touches rows directly.
//
// JsonFileStore layout under the store directory:
//   tasks/<task_id>.json
//   approvals/<task_id>/<step_id>.json
//   progress/<task_id>.json
//
// Every write goes to a temporary file first and is renamed into place, so a
// crash never leaves a half-written row behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use uuid::Uuid;

use crate::approval::ApprovalItem;
use crate::error::TaskError;
use crate::progress::ProgressLedger;
use crate::task::{Task, TaskStatus};

/// Durable keyed storage for tasks, approval items and progress ledgers.
///
/// Implementations must be safe to share across threads. Per-task write
/// ordering is the caller's job (the control plane serializes writers per
/// task), so implementations only need row-level atomicity.
pub trait TaskStore: Send + Sync {
    /// Get a task by id.
    fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, TaskError>;

    /// Create or overwrite a task row.
    fn put_task(&self, task: &Task) -> Result<(), TaskError>;

    /// Remove a task row. Only used to roll back a creation whose event
    /// could not be recorded; committed tasks are never deleted.
    fn remove_task(&self, task_id: Uuid) -> Result<(), TaskError>;

    /// List all tasks, newest first.
    fn list_tasks(&self) -> Result<Vec<Task>, TaskError>;

    fn get_approval(&self, task_id: Uuid, step_id: &str)
        -> Result<Option<ApprovalItem>, TaskError>;

    fn put_approval(&self, item: &ApprovalItem) -> Result<(), TaskError>;

    /// Remove an approval row (rollback only, see [`TaskStore::remove_task`]).
    fn remove_approval(&self, task_id: Uuid, step_id: &str) -> Result<(), TaskError>;

    /// All approval items of one task, ordered by step id.
    fn list_approvals(&self, task_id: Uuid) -> Result<Vec<ApprovalItem>, TaskError>;

    /// The progress ledger of a task; empty when nothing was recorded yet.
    fn get_progress(&self, task_id: Uuid) -> Result<ProgressLedger, TaskError>;

    fn put_progress(&self, ledger: &ProgressLedger) -> Result<(), TaskError>;

    /// List tasks with the given status, newest first.
    fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, TaskError> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }
}

/// File-backed store: one pretty-printed JSON file per row.
pub struct JsonFileStore {
    store_dir: PathBuf,
}

impl JsonFileStore {
    /// Create a new store backed by the given directory.
    /// Creates the directory tree if it doesn't exist.
    pub fn new(store_dir: impl AsRef<Path>) -> Result<Self, TaskError> {
        let store_dir = store_dir.as_ref().to_path_buf();
        for sub in ["tasks", "approvals", "progress"] {
            let dir = store_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        }
        Ok(Self { store_dir })
    }

    fn task_file(&self, task_id: Uuid) -> PathBuf {
        self.store_dir.join("tasks").join(format!("{}.json", task_id))
    }

    fn approvals_dir(&self, task_id: Uuid) -> PathBuf {
        self.store_dir.join("approvals").join(task_id.to_string())
    }

    fn approval_file(&self, task_id: Uuid, step_id: &str) -> PathBuf {
        self.approvals_dir(task_id).join(format!("{}.json", step_id))
    }

    fn progress_file(&self, task_id: Uuid) -> PathBuf {
        self.store_dir
            .join("progress")
            .join(format!("{}.json", task_id))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> TaskError {
    TaskError::IoError {
        path: path.display().to_string(),
        source,
    }
}

/// Write `value` to `path` atomically (temp file + fsync + rename).
fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), TaskError> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp).map_err(|source| io_error(&tmp, source))?;
        file.write_all(json.as_bytes())
            .map_err(|source| io_error(&tmp, source))?;
        file.sync_all().map_err(|source| io_error(&tmp, source))?;
    }
    fs::rename(&tmp, path).map_err(|source| io_error(path, source))?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, TaskError> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
    Ok(Some(serde_json::from_str(&json)?))
}

fn remove_if_exists(path: &Path) -> Result<(), TaskError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(path, source)),
    }
}

/// Read every `*.json` row in `dir`, skipping (and logging) unreadable ones.
fn read_rows<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>, TaskError> {
    let mut rows = Vec::new();
    if !dir.exists() {
        return Ok(rows);
    }
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        if !path.extension().is_some_and(|ext| ext == "json") {
            continue;
        }
        let json = fs::read_to_string(&path).map_err(|source| io_error(&path, source))?;
        match serde_json::from_str::<T>(&json) {
            Ok(row) => rows.push(row),
            Err(e) => tracing::warn!(path = %path.display(), "skipping unreadable row: {}", e),
        }
    }
    Ok(rows)
}

impl TaskStore for JsonFileStore {
    fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, TaskError> {
        read_json(&self.task_file(task_id))
    }

    fn put_task(&self, task: &Task) -> Result<(), TaskError> {
        write_json_atomic(&self.task_file(task.id), task)
    }

    fn remove_task(&self, task_id: Uuid) -> Result<(), TaskError> {
        remove_if_exists(&self.task_file(task_id))
    }

    fn list_tasks(&self) -> Result<Vec<Task>, TaskError> {
        let mut tasks: Vec<Task> = read_rows(&self.store_dir.join("tasks"))?;
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    fn get_approval(
        &self,
        task_id: Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalItem>, TaskError> {
        read_json(&self.approval_file(task_id, step_id))
    }

    fn put_approval(&self, item: &ApprovalItem) -> Result<(), TaskError> {
        write_json_atomic(&self.approval_file(item.task_id, &item.step_id), item)
    }

    fn remove_approval(&self, task_id: Uuid, step_id: &str) -> Result<(), TaskError> {
        remove_if_exists(&self.approval_file(task_id, step_id))
    }

    fn list_approvals(&self, task_id: Uuid) -> Result<Vec<ApprovalItem>, TaskError> {
        let mut items: Vec<ApprovalItem> = read_rows(&self.approvals_dir(task_id))?;
        items.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(items)
    }

    fn get_progress(&self, task_id: Uuid) -> Result<ProgressLedger, TaskError> {
        Ok(read_json(&self.progress_file(task_id))?.unwrap_or_else(|| ProgressLedger::new(task_id)))
    }

    fn put_progress(&self, ledger: &ProgressLedger) -> Result<(), TaskError> {
        write_json_atomic(&self.progress_file(ledger.task_id), ledger)
    }
}

#[derive(Default)]
struct MemoryRows {
    tasks: HashMap<Uuid, Task>,
    approvals: HashMap<(Uuid, String), ApprovalItem>,
    progress: HashMap<Uuid, ProgressLedger>,
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<MemoryRows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryRows>, TaskError> {
        self.rows
            .read()
            .map_err(|_| TaskError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryRows>, TaskError> {
        self.rows
            .write()
            .map_err(|_| TaskError::Unavailable("memory store lock poisoned".into()))
    }
}

impl TaskStore for MemoryStore {
    fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, TaskError> {
        Ok(self.read()?.tasks.get(&task_id).cloned())
    }

    fn put_task(&self, task: &Task) -> Result<(), TaskError> {
        self.write()?.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn remove_task(&self, task_id: Uuid) -> Result<(), TaskError> {
        self.write()?.tasks.remove(&task_id);
        Ok(())
    }

    fn list_tasks(&self) -> Result<Vec<Task>, TaskError> {
        let mut tasks: Vec<Task> = self.read()?.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    fn get_approval(
        &self,
        task_id: Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalItem>, TaskError> {
        Ok(self
            .read()?
            .approvals
            .get(&(task_id, step_id.to_string()))
            .cloned())
    }

    fn put_approval(&self, item: &ApprovalItem) -> Result<(), TaskError> {
        self.write()?
            .approvals
            .insert((item.task_id, item.step_id.clone()), item.clone());
        Ok(())
    }

    fn remove_approval(&self, task_id: Uuid, step_id: &str) -> Result<(), TaskError> {
        self.write()?
            .approvals
            .remove(&(task_id, step_id.to_string()));
        Ok(())
    }

    fn list_approvals(&self, task_id: Uuid) -> Result<Vec<ApprovalItem>, TaskError> {
        let mut items: Vec<ApprovalItem> = self
            .read()?
            .approvals
            .values()
            .filter(|item| item.task_id == task_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(items)
    }

    fn get_progress(&self, task_id: Uuid) -> Result<ProgressLedger, TaskError> {
        Ok(self
            .read()?
            .progress
            .get(&task_id)
            .cloned()
            .unwrap_or_else(|| ProgressLedger::new(task_id)))
    }

    fn put_progress(&self, ledger: &ProgressLedger) -> Result<(), TaskError> {
        self.write()?
            .progress
            .insert(ledger.task_id, ledger.clone());
        Ok(())
    }
}
