use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;

/// A lock guard that releases the lock file on drop.
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Warning: Failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Acquires the whole-run orchestrator lock (`taskforge.lock`), held for the
/// lifetime of a `run`/`resume` invocation so two orchestrator processes
/// never drive the same state directory at once.
pub fn try_acquire_runner_lock(state_dir: &Path) -> Result<LockGuard, String> {
    try_acquire(state_dir, "taskforge.lock", "taskforge.pid")
}

/// Acquires a short-lived lock scoped to a single load-mutate-save
/// transaction against the named state file (e.g. `task_queue`), so
/// concurrent CLI invocations (`status` while `run` is active) don't
/// interleave writes. Distinct from [`try_acquire_runner_lock`]: many
/// transaction locks can be taken and released while the runner lock is
/// held for the whole run.
pub fn try_acquire_transaction_lock(state_dir: &Path, name: &str) -> Result<LockGuard, String> {
    try_acquire(
        state_dir,
        &format!("{name}.txn.lock"),
        &format!("{name}.txn.pid"),
    )
}

/// Shared acquire logic: creates `state_dir` if needed, takes the named
/// flock first (atomic mutual exclusion), then writes a PID file for
/// diagnostics. On contention, inspects the PID file to give an actionable
/// error message about the holding process.
fn try_acquire(state_dir: &Path, lock_name: &str, pid_name: &str) -> Result<LockGuard, String> {
    fs::create_dir_all(state_dir)
        .map_err(|e| format!("Failed to create {}: {}", state_dir.display(), e))?;

    let lock_path = state_dir.join(lock_name);
    let pid_path = state_dir.join(pid_name);

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock: {}", e))?;

    if !acquired {
        let holder_info = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        return match holder_info {
            Some(pid) if is_pid_alive(pid) => {
                Err(format!("Another taskforge instance is running (PID {})", pid))
            }
            Some(pid) => Err(format!(
                "Lock file {} is held but recorded PID {} is not alive. \
                 Remove {} and {} to recover",
                lock_path.display(),
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!(
                "Another taskforge instance holds {}. If this is stale, remove it",
                lock_path.display()
            )),
        };
    }

    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(LockGuard { lock, pid_path })
}

pub fn is_pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_pid_alive_current_process() {
        let pid = std::process::id() as i32;
        assert!(is_pid_alive(pid));
    }

    #[test]
    fn test_is_pid_alive_nonexistent() {
        assert!(!is_pid_alive(99_999_999));
    }

    #[test]
    fn runner_lock_rejects_second_holder() {
        let dir = tempdir().unwrap();
        let _guard = try_acquire_runner_lock(dir.path()).expect("first acquire succeeds");
        let err = try_acquire_runner_lock(dir.path()).unwrap_err();
        assert!(err.contains("running"));
    }

    #[test]
    fn transaction_lock_is_independent_of_runner_lock() {
        let dir = tempdir().unwrap();
        let _runner = try_acquire_runner_lock(dir.path()).expect("runner lock");
        let _txn = try_acquire_transaction_lock(dir.path(), "task_queue")
            .expect("transaction lock does not contend with the runner lock");
    }

    #[test]
    fn transaction_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _txn = try_acquire_transaction_lock(dir.path(), "task_queue").unwrap();
        }
        let _again = try_acquire_transaction_lock(dir.path(), "task_queue")
            .expect("lock released after guard drop");
    }
}
