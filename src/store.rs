use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::RunnerError;
use crate::lock;
use crate::log_warn;
use crate::types::{Event, Lifecycle, PhasePlan, RunState, RunStatus, TaskQueue};

const TASK_QUEUE_FILE: &str = "task_queue.yaml";
const PHASE_PLAN_FILE: &str = "phase_plan.yaml";
const RUN_STATE_FILE: &str = "run_state.yaml";
const RUNNER_BLOCKED_FILE: &str = "runner_blocked.json";
const EVENTS_FILE: &str = "artifacts/events.jsonl";

/// Durable, file-locked store for task queue, phase plan, run state and the
/// event log. A single cross-process exclusive file lock protects every
/// mutation; an in-process mutex additionally serializes same-process
/// transactions so the file lock is only ever contended across processes.
pub struct StateStore {
    state_dir: PathBuf,
    txn_guard: Mutex<()>,
}

/// One line of `artifacts/events.jsonl`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub at: String,
    pub task_id: String,
    #[serde(flatten)]
    pub event: Event,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            txn_guard: Mutex::new(()),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Creates the state directory and its `artifacts/`/`runs/` subdirectories
    /// if they don't already exist. Idempotent.
    pub fn init(&self) -> Result<(), RunnerError> {
        for sub in ["artifacts", "runs"] {
            fs::create_dir_all(self.state_dir.join(sub))
                .map_err(|e| RunnerError::Unexpected(format!("create {sub}: {e}")))?;
        }
        Ok(())
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.state_dir.join(rel)
    }

    // -- transactions --------------------------------------------------

    pub fn task_queue_transaction<R>(
        &self,
        f: impl FnOnce(&mut TaskQueue) -> R,
    ) -> Result<R, RunnerError> {
        self.transaction(TASK_QUEUE_FILE, f)
    }

    pub fn phase_plan_transaction<R>(
        &self,
        f: impl FnOnce(&mut PhasePlan) -> R,
    ) -> Result<R, RunnerError> {
        self.transaction(PHASE_PLAN_FILE, f)
    }

    pub fn run_state_transaction<R>(
        &self,
        f: impl FnOnce(&mut RunState) -> R,
    ) -> Result<R, RunnerError> {
        self.transaction(RUN_STATE_FILE, f)
    }

    pub fn read_task_queue(&self) -> Result<TaskQueue, RunnerError> {
        self.task_queue_transaction(|q| q.clone())
    }

    pub fn read_phase_plan(&self) -> Result<PhasePlan, RunnerError> {
        self.phase_plan_transaction(|p| p.clone())
    }

    pub fn read_run_state(&self) -> Result<RunState, RunnerError> {
        self.run_state_transaction(|s| s.clone())
    }

    /// Generic load-mutate-save transaction: acquires the in-process mutex,
    /// then the cross-process file lock, loads the YAML document (or its
    /// default if missing), runs `f`, and always saves the (possibly
    /// mutated) value back — mirroring the original store's "dirty" flag
    /// with an unconditional save, since every caller here mutates in place.
    fn transaction<T, R>(
        &self,
        file_name: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, RunnerError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _in_process = self
            .txn_guard
            .lock()
            .map_err(|_| RunnerError::InternalPanic("state store mutex poisoned".to_string()))?;

        let _file_lock = lock::try_acquire_transaction_lock(&self.state_dir, file_name)
            .map_err(RunnerError::Unexpected)?;

        let path = self.path(file_name);
        let mut value = load_yaml::<T>(&path)?;
        let result = f(&mut value);
        write_yaml_atomic(&path, &value)?;
        Ok(result)
    }

    // -- events ----------------------------------------------------------

    /// Append one event to `artifacts/events.jsonl`, fsyncing before return.
    pub fn append_event(&self, task_id: &str, event: &Event, now: DateTime<Utc>) -> Result<(), RunnerError> {
        let record = EventRecord {
            at: now.to_rfc3339(),
            task_id: task_id.to_string(),
            event: event.clone(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| RunnerError::Unexpected(format!("serialize event: {e}")))?;

        let path = self.path(EVENTS_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RunnerError::Unexpected(format!("create {}: {e}", parent.display())))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RunnerError::Unexpected(format!("open {}: {e}", path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| RunnerError::Unexpected(format!("write {}: {e}", path.display())))?;
        file.sync_all()
            .map_err(|e| RunnerError::Unexpected(format!("fsync {}: {e}", path.display())))?;
        Ok(())
    }

    // -- blocked report ----------------------------------------------------

    pub fn write_runner_blocked(
        &self,
        report: &crate::types::RunnerBlockedReport,
    ) -> Result<(), RunnerError> {
        write_json_atomic(&self.path(RUNNER_BLOCKED_FILE), report)
    }

    pub fn clear_runner_blocked(&self) -> Result<(), RunnerError> {
        let path = self.path(RUNNER_BLOCKED_FILE);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| RunnerError::Unexpected(format!("remove {}: {e}", path.display())))?;
        }
        Ok(())
    }

    // -- artifact paths ----------------------------------------------------

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.path(&format!("runs/{run_id}"))
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.path("artifacts")
    }

    // -- stale-run detection / crash recovery -------------------------------

    /// Returns `Some(reason)` if the recorded run state claims `running` but
    /// its last heartbeat is older than the stale-run grace window (or the
    /// value is missing entirely, which is treated as infinitely stale).
    pub fn detect_stale_run(
        &self,
        run_state: &RunState,
        grace_seconds: u64,
        now: DateTime<Utc>,
    ) -> Option<String> {
        if run_state.status != RunStatus::Running {
            return None;
        }
        let age_seconds = match &run_state.last_heartbeat {
            Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                Ok(parsed) => (now - parsed.with_timezone(&Utc)).num_seconds().max(0) as u64,
                Err(_) => return Some(format!("last_heartbeat '{ts}' is not valid RFC3339")),
            },
            None => return Some("run state is 'running' with no recorded heartbeat".to_string()),
        };
        if age_seconds > grace_seconds {
            Some(format!(
                "last heartbeat is {age_seconds}s old, exceeding the {grace_seconds}s stale-run grace window"
            ))
        } else {
            None
        }
    }

    /// Forcibly resets a stale run state to idle, clearing the fields the
    /// owning (now-gone) process would otherwise own.
    pub fn reset_stale_run(&self) -> Result<(), RunnerError> {
        self.run_state_transaction(|state| {
            state.status = RunStatus::Idle;
            state.current_task_id = None;
            state.current_phase_id = None;
            state.current_run_id = None;
            state.coordinator_pid = None;
            state.last_heartbeat = None;
        })
    }

    /// Demotes any task with lifecycle `running` back to `ready`. The owning
    /// process is by definition gone; the next orchestrator cycle re-selects
    /// it. Idempotent because every step's effect is either fully applied or
    /// fully absent (verified by the Output Interpreter's snapshot diff).
    /// Returns the number of tasks demoted.
    pub fn recover_running_tasks(&self) -> Result<usize, RunnerError> {
        self.task_queue_transaction(|queue| {
            let mut recovered = 0;
            for task in &mut queue.tasks {
                if task.lifecycle == Lifecycle::Running {
                    task.lifecycle = Lifecycle::Ready;
                    recovered += 1;
                }
            }
            recovered
        })
    }
}

// -- atomic I/O --------------------------------------------------------

fn write_yaml_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RunnerError> {
    let text = serde_yaml_ng::to_string(value)
        .map_err(|e| RunnerError::Unexpected(format!("serialize {}: {e}", path.display())))?;
    atomic_write(path, text.as_bytes())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RunnerError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| RunnerError::Unexpected(format!("serialize {}: {e}", path.display())))?;
    atomic_write(path, text.as_bytes())
}

/// Write `bytes` to `path` via temp-file-then-rename in the same directory,
/// fsyncing the temp file before the rename so a crash never leaves a
/// half-written target.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RunnerError> {
    let parent = path.parent().ok_or_else(|| {
        RunnerError::Unexpected(format!("{} has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent)
        .map_err(|e| RunnerError::Unexpected(format!("create {}: {e}", parent.display())))?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        std::process::id()
    ));

    let write_result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(RunnerError::Unexpected(format!(
            "write {}: {e}",
            tmp_path.display()
        )));
    }

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        RunnerError::Unexpected(format!("rename {} -> {}: {e}", tmp_path.display(), path.display()))
    })
}

/// Load a YAML document, returning `T::default()` if the file doesn't exist.
/// A file that exists but fails to parse is reported as `StorageCorruption`
/// rather than silently discarded, so callers refuse to overwrite it.
fn load_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T, RunnerError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path)
        .map_err(|e| RunnerError::Unexpected(format!("read {}: {e}", path.display())))?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml_ng::from_str(&text).map_err(|e| {
        RunnerError::StorageCorruption(e.to_string(), path.display().to_string())
    })
}

// -- bounded log reading -------------------------------------------------

/// Read up to the last `max_bytes` of `path` as UTF-8 (lossily, since a
/// worker's raw stdout/stderr is not guaranteed to be valid UTF-8 at the
/// point it's truncated).
pub fn read_text_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

const TRUNCATION_MARKER: &str = "\n... [truncated] ...\n";

/// Read a bounded head+tail window of `path`, inserting a truncation marker
/// in the middle when the file exceeds `head_bytes + tail_bytes`. Used to
/// build prompt-sized excerpts of long verification logs.
pub fn read_text_window(path: &Path, head_bytes: u64, tail_bytes: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    if len <= head_bytes + tail_bytes {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        return Ok(String::from_utf8_lossy(&buf).into_owned());
    }

    let mut head = vec![0u8; head_bytes as usize];
    file.read_exact(&mut head)?;

    file.seek(SeekFrom::Start(len - tail_bytes))?;
    let mut tail = vec![0u8; tail_bytes as usize];
    file.read_exact(&mut tail)?;

    let mut out = String::from_utf8_lossy(&head).into_owned();
    out.push_str(TRUNCATION_MARKER);
    out.push_str(&String::from_utf8_lossy(&tail));
    Ok(out)
}

/// Heartbeat timestamp from a worker's progress file, falling back to the
/// file's own modification time if the `heartbeat` field is absent or the
/// file doesn't parse as JSON — log-file liveness stands in for an explicit
/// heartbeat per `SPEC_FULL.md` §4.2.
pub fn heartbeat_from_progress(path: &Path) -> Option<DateTime<Utc>> {
    if let Ok(text) = fs::read_to_string(path) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(ts) = value.get("heartbeat").and_then(|v| v.as_str()) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
                    return Some(parsed.with_timezone(&Utc));
                }
                log_warn!("progress file {} has an unparseable heartbeat '{}'", path.display(), ts);
            }
        }
    }
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
