//! Durable per-task storage and the in-memory slot table.
//!
//! Layout under the data root:
//!
//! ```text
//! tasks/{id}/record.json   # whole-record snapshot, atomic rename
//! tasks/{id}/steps.jsonl   # append-only step log
//! tasks/{id}/chat.jsonl    # append-only chat log
//! tasks/{id}/browser/      # opaque browser profile
//! ```
//!
//! The store owns every task by id and hands out `Arc<TaskSlot>` handles; the
//! slot's async mutex is the per-task lock the engine and the VNC broker take
//! for any non-append mutation.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::engine::runner::CancelFlag;
use crate::error::reason;
use crate::task::{ChatMessage, TaskRecord, TaskStatus, TaskStep};

/// A live runner attached to a task. Exactly one exists per task while the
/// task is `running` or `waiting_for_input`.
pub struct LiveRun {
    pub join: JoinHandle<()>,
    pub cancel: CancelFlag,
}

impl LiveRun {
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }
}

/// Mutable per-task state guarded by the slot mutex.
pub struct TaskState {
    pub record: TaskRecord,
    pub steps: Vec<TaskStep>,
    pub chat: Vec<ChatMessage>,
    pub run: Option<LiveRun>,
    /// One-shot channel resolving a pending `ask_human` suspension.
    pub assist_tx: Option<oneshot::Sender<String>>,
}

impl TaskState {
    pub fn runner_alive(&self) -> bool {
        self.run.as_ref().is_some_and(LiveRun::is_alive)
    }
}

pub struct TaskSlot {
    pub id: String,
    pub state: Mutex<TaskState>,
}

/// What startup recovery found and did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub loaded: usize,
    pub failed_on_restart: Vec<String>,
    pub scheduled: Vec<(String, DateTime<Utc>)>,
}

pub struct TaskStore {
    root: PathBuf,
    slots: RwLock<HashMap<String, Arc<TaskSlot>>>,
}

impl TaskStore {
    /// Open (and create) the tasks directory. Call [`TaskStore::recover`]
    /// afterwards to load persisted state.
    pub fn open(tasks_root: &Path) -> Result<Self> {
        fs::create_dir_all(tasks_root)
            .with_context(|| format!("create tasks directory {}", tasks_root.display()))?;
        Ok(Self {
            root: tasks_root.to_path_buf(),
            slots: RwLock::new(HashMap::new()),
        })
    }

    // ── Paths ────────────────────────────────────────────────────────────

    pub fn task_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("record.json")
    }

    fn steps_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("steps.jsonl")
    }

    fn chat_path(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("chat.jsonl")
    }

    pub fn browser_profile_dir(&self, id: &str) -> PathBuf {
        self.task_dir(id).join("browser")
    }

    // ── Slot table ───────────────────────────────────────────────────────

    pub fn slot(&self, id: &str) -> Option<Arc<TaskSlot>> {
        self.slots.read().expect("slot table poisoned").get(id).cloned()
    }

    pub fn slots(&self) -> Vec<Arc<TaskSlot>> {
        self.slots
            .read()
            .expect("slot table poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.read().expect("slot table poisoned").contains_key(id)
    }

    /// Detach a slot from the table. Later lookups return `None`; the caller
    /// still holds the slot and is responsible for teardown.
    pub fn detach(&self, id: &str) -> Option<Arc<TaskSlot>> {
        self.slots.write().expect("slot table poisoned").remove(id)
    }

    /// Create a brand-new task: directory tree, record, seed chat messages.
    pub fn insert(&self, record: TaskRecord, chat: Vec<ChatMessage>) -> Result<Arc<TaskSlot>> {
        let id = record.id.clone();
        {
            let slots = self.slots.read().expect("slot table poisoned");
            if slots.contains_key(&id) {
                bail!("task {id} already exists");
            }
        }
        fs::create_dir_all(self.browser_profile_dir(&id))
            .with_context(|| format!("create task directory for {id}"))?;
        self.persist_record(&record)?;
        for message in &chat {
            self.append_chat(&id, message)?;
        }
        let slot = Arc::new(TaskSlot {
            id: id.clone(),
            state: Mutex::new(TaskState {
                record,
                steps: Vec::new(),
                chat,
                run: None,
                assist_tx: None,
            }),
        });
        self.slots
            .write()
            .expect("slot table poisoned")
            .insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    /// Remove a task's directory from disk.
    pub fn delete_dir(&self, id: &str) -> Result<()> {
        let dir = self.task_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("remove task directory {}", dir.display()))?;
        }
        Ok(())
    }

    // ── Persistence primitives (call with the slot lock held) ───────────

    /// Write the record via `write tmp → fsync → rename`, so an interrupted
    /// write leaves either the old or the new JSON on disk, never a partial.
    pub fn persist_record(&self, record: &TaskRecord) -> Result<()> {
        let dir = self.task_dir(&record.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create task directory {}", dir.display()))?;
        let tmp = dir.join("record.json.tmp");
        let json = serde_json::to_vec_pretty(record).context("serialize task record")?;
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&json).context("write task record")?;
        file.sync_all().context("fsync task record")?;
        drop(file);
        fs::rename(&tmp, self.record_path(&record.id)).context("publish task record")?;
        Ok(())
    }

    pub fn append_step(&self, id: &str, step: &TaskStep) -> Result<()> {
        append_jsonl(&self.steps_path(id), step)
    }

    pub fn append_chat(&self, id: &str, message: &ChatMessage) -> Result<()> {
        append_jsonl(&self.chat_path(id), message)
    }

    // ── Startup recovery ─────────────────────────────────────────────────

    /// Scan the data root and rebuild the slot table. Tasks that had a live
    /// runner before the restart are failed with `node_restart` (no runner
    /// state survives a process death); scheduled tasks are returned so the
    /// scheduler can re-enqueue them; `browser_open` is always reset because
    /// the browser process did not survive either.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("scan tasks directory {}", self.root.display()))?;

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let record_path = dir.join("record.json");
            if !record_path.exists() {
                continue;
            }
            let mut record: TaskRecord = match fs::read_to_string(&record_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
            {
                Ok(record) => record,
                Err(error) => {
                    tracing::warn!(path = %record_path.display(), %error, "skipping unreadable task record");
                    continue;
                }
            };

            let id = record.id.clone();
            let steps: Vec<TaskStep> = load_jsonl(&self.steps_path(&id));
            let chat: Vec<ChatMessage> = load_jsonl(&self.chat_path(&id));

            let mut dirty = false;
            let persisted_count = u32::try_from(steps.len()).unwrap_or(u32::MAX);
            if record.step_count != persisted_count {
                record.step_count = persisted_count;
                dirty = true;
            }
            if record.browser_open {
                record.browser_open = false;
                dirty = true;
            }
            if record.vnc_token.is_some() {
                record.vnc_token = None;
                dirty = true;
            }
            match record.status {
                TaskStatus::Running | TaskStatus::WaitingForInput | TaskStatus::Pending => {
                    record.status = TaskStatus::Failed;
                    record.last_error = Some(reason::NODE_RESTART.to_string());
                    record.needs_attention = false;
                    report.failed_on_restart.push(id.clone());
                    dirty = true;
                }
                TaskStatus::Scheduled => match record.scheduled_for {
                    Some(due) => report.scheduled.push((id.clone(), due)),
                    None => {
                        // Scheduled without a due time cannot be woken; treat
                        // it like any other interrupted task.
                        record.status = TaskStatus::Failed;
                        record.last_error = Some(reason::NODE_RESTART.to_string());
                        report.failed_on_restart.push(id.clone());
                        dirty = true;
                    }
                },
                _ => {}
            }
            if dirty {
                record.touch();
                self.persist_record(&record)?;
            }

            let slot = Arc::new(TaskSlot {
                id: id.clone(),
                state: Mutex::new(TaskState {
                    record,
                    steps,
                    chat,
                    run: None,
                    assist_tx: None,
                }),
            });
            self.slots
                .write()
                .expect("slot table poisoned")
                .insert(id, slot);
            report.loaded += 1;
        }

        Ok(report)
    }
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).context("serialize log line")?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(&line)
        .with_context(|| format!("append to {}", path.display()))?;
    Ok(())
}

/// Load a JSON-lines file, dropping everything from the first corrupt line
/// onwards. A torn tail from a crash mid-append restores to the last good
/// prefix.
fn load_jsonl<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut items = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(item) => items.push(item),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "dropping corrupt log tail");
                break;
            }
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChatRole;
    use tempfile::TempDir;

    fn test_record(id: &str, status: TaskStatus) -> TaskRecord {
        TaskRecord {
            id: id.into(),
            node_id: "node-1".into(),
            title: "test task".into(),
            instructions: "do the thing".into(),
            model_name: "gpt-5-mini".into(),
            temperature: None,
            reasoning_effort: None,
            max_steps: 10,
            leave_browser_open: false,
            status,
            scheduled_for: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            step_count: 0,
            browser_open: false,
            needs_attention: false,
            last_error: None,
            result_summary: None,
            assistance: None,
            vnc_token: None,
        }
    }

    fn test_step(n: u32) -> TaskStep {
        TaskStep {
            step_number: n,
            summary_html: Some(format!("<p>step {n}</p>")),
            screenshot_b64: None,
            url: Some("https://example.com".into()),
            title: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_creates_directory_tree() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        let record = test_record("t1", TaskStatus::Pending);
        store
            .insert(record, vec![ChatMessage::new(ChatRole::User, "go")])
            .unwrap();

        assert!(tmp.path().join("t1/record.json").exists());
        assert!(tmp.path().join("t1/chat.jsonl").exists());
        assert!(tmp.path().join("t1/browser").is_dir());
        assert!(store.contains("t1"));
    }

    #[test]
    fn record_roundtrips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        let mut record = test_record("t1", TaskStatus::Completed);
        record.result_summary = Some("done".into());
        store.insert(record, Vec::new()).unwrap();

        let reopened = TaskStore::open(tmp.path()).unwrap();
        reopened.recover().unwrap();
        let slot = reopened.slot("t1").unwrap();
        let state = slot.state.try_lock().unwrap();
        assert_eq!(state.record.status, TaskStatus::Completed);
        assert_eq!(state.record.result_summary.as_deref(), Some("done"));
    }

    #[test]
    fn persist_leaves_no_tmp_file() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        let record = test_record("t1", TaskStatus::Pending);
        store.insert(record.clone(), Vec::new()).unwrap();
        store.persist_record(&record).unwrap();
        assert!(!tmp.path().join("t1/record.json.tmp").exists());
    }

    #[test]
    fn corrupt_step_tail_is_dropped_on_load() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        let record = test_record("t1", TaskStatus::Completed);
        store.insert(record, Vec::new()).unwrap();
        store.append_step("t1", &test_step(1)).unwrap();
        store.append_step("t1", &test_step(2)).unwrap();
        // Simulate a torn append.
        let steps_path = tmp.path().join("t1/steps.jsonl");
        let mut file = OpenOptions::new().append(true).open(&steps_path).unwrap();
        file.write_all(b"{\"step_number\":3,\"summ").unwrap();
        drop(file);

        let reopened = TaskStore::open(tmp.path()).unwrap();
        reopened.recover().unwrap();
        let slot = reopened.slot("t1").unwrap();
        let state = slot.state.try_lock().unwrap();
        assert_eq!(state.steps.len(), 2);
        assert_eq!(state.record.step_count, 2);
        let numbers: Vec<u32> = state.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn recovery_fails_interrupted_tasks() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        for (id, status) in [
            ("running", TaskStatus::Running),
            ("waiting", TaskStatus::WaitingForInput),
            ("pending", TaskStatus::Pending),
        ] {
            let mut record = test_record(id, status);
            record.browser_open = true;
            record.vnc_token = Some("tok".into());
            store.insert(record, Vec::new()).unwrap();
        }

        let reopened = TaskStore::open(tmp.path()).unwrap();
        let report = reopened.recover().unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.failed_on_restart.len(), 3);
        for id in ["running", "waiting", "pending"] {
            let slot = reopened.slot(id).unwrap();
            let state = slot.state.try_lock().unwrap();
            assert_eq!(state.record.status, TaskStatus::Failed);
            assert_eq!(state.record.last_error.as_deref(), Some(reason::NODE_RESTART));
            assert!(!state.record.browser_open);
            assert!(state.record.vnc_token.is_none());
        }
    }

    #[test]
    fn recovery_reenqueues_scheduled_tasks() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        let due = Utc::now() + chrono::Duration::minutes(10);
        let mut record = test_record("sched", TaskStatus::Scheduled);
        record.scheduled_for = Some(due);
        store.insert(record, Vec::new()).unwrap();

        let reopened = TaskStore::open(tmp.path()).unwrap();
        let report = reopened.recover().unwrap();
        assert_eq!(report.scheduled.len(), 1);
        assert_eq!(report.scheduled[0].0, "sched");
        let slot = reopened.slot("sched").unwrap();
        let state = slot.state.try_lock().unwrap();
        assert_eq!(state.record.status, TaskStatus::Scheduled);
    }

    #[test]
    fn recovery_reconciles_step_count_with_log() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        // Record says 1 step but the log holds 3 (crash between append and
        // record publish).
        let mut record = test_record("t1", TaskStatus::Completed);
        record.step_count = 1;
        store.insert(record, Vec::new()).unwrap();
        for n in 1..=3 {
            store.append_step("t1", &test_step(n)).unwrap();
        }

        let reopened = TaskStore::open(tmp.path()).unwrap();
        reopened.recover().unwrap();
        let slot = reopened.slot("t1").unwrap();
        let state = slot.state.try_lock().unwrap();
        assert_eq!(state.record.step_count, 3);
    }

    #[test]
    fn delete_dir_removes_everything() {
        let tmp = TempDir::new().unwrap();
        let store = TaskStore::open(tmp.path()).unwrap();
        store.insert(test_record("t1", TaskStatus::Pending), Vec::new()).unwrap();
        let _ = store.detach("t1");
        store.delete_dir("t1").unwrap();
        assert!(!tmp.path().join("t1").exists());
        assert!(store.slot("t1").is_none());
    }
}
