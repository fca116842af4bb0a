use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use nix::unistd::Pid;

use crate::config::{CodexWorkerConfig, OllamaWorkerConfig};
use crate::store::heartbeat_from_progress;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before sending SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Process-group supervision shared between the installed signal handlers
/// and every dispatcher that spawns a worker subprocess: one shutdown flag
/// plus the set of live worker process groups, instead of two independent
/// globals that happen to be updated together.
struct WorkerSupervisor {
    shutdown: Arc<AtomicBool>,
    live_groups: std::sync::Mutex<HashSet<Pid>>,
}

fn supervisor() -> &'static WorkerSupervisor {
    static SUPERVISOR: OnceLock<WorkerSupervisor> = OnceLock::new();
    SUPERVISOR.get_or_init(|| WorkerSupervisor {
        shutdown: Arc::new(AtomicBool::new(false)),
        live_groups: std::sync::Mutex::new(HashSet::new()),
    })
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    supervisor().shutdown.load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(&supervisor().shutdown);
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Register a worker's process group as live, so a shutdown can reach it.
pub fn register_child(pgid: Pid) {
    if let Ok(mut live_groups) = supervisor().live_groups.lock() {
        live_groups.insert(pgid);
    }
}

/// Drop a worker's process group once it has exited on its own.
pub fn unregister_child(pgid: Pid) {
    if let Ok(mut live_groups) = supervisor().live_groups.lock() {
        live_groups.remove(&pgid);
    }
}

/// Kill every live worker process group.
///
/// Sends SIGTERM to all of them, waits for the grace period, then SIGKILLs
/// any survivors. Clears the live set when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(live_groups) = supervisor().live_groups.lock() else {
            return;
        };
        live_groups.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut live_groups) = supervisor().live_groups.lock() {
        live_groups.clear();
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls for exit, then SIGKILL if needed.
///
/// Runs on the tokio blocking thread pool via `spawn_blocking` to avoid
/// stalling async worker threads with the poll-and-sleep loop.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return;
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    })
    .await
    .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

/// Outcome of one dispatched worker run, shared by both worker shapes.
///
/// `timed_out` and `no_heartbeat` are reported as distinct signals (per the
/// dispatcher contract) so the FSM can classify a transient hang separately
/// from shift exhaustion, even though both are retried the same way today.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub command: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub no_heartbeat: bool,
    pub runtime_seconds: u64,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Full captured response text. Empty for subprocess workers, whose
    /// effect is applying repository changes directly; populated for HTTP
    /// workers, whose output must still be parsed as structured JSON.
    pub response_text: String,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && !self.no_heartbeat && self.exit_code == 0
    }
}

/// Runs one worker invocation: spawn/stream, enforce heartbeat and timeout,
/// capture output. Implemented once per `WorkerKind` (§4.2); callers select
/// the impl to use via `config.worker.kind`.
pub trait WorkerDispatcher: Send + Sync {
    fn dispatch(
        &self,
        prompt: &str,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
        timeout: Duration,
        heartbeat_seconds: u64,
        heartbeat_grace_seconds: u64,
    ) -> impl std::future::Future<Output = Result<DispatchOutcome, String>> + Send;
}

/// Agentic subprocess worker: a CLI tool that accepts a prompt, writes
/// repository changes directly, and reports progress via a heartbeat file.
pub struct CodexSubprocessDispatcher {
    pub config: CodexWorkerConfig,
}

impl CodexSubprocessDispatcher {
    pub fn new(config: CodexWorkerConfig) -> Self {
        Self { config }
    }

    /// Verify that the configured CLI tool is available on PATH.
    pub fn verify_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(&self.config.binary)
            .args(self.config.version_args())
            .output()
            .map_err(|e| {
                format!(
                    "{} not found on PATH. {} ({})",
                    self.config.binary,
                    self.config.install_hint(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "{} found but `{} {}` failed",
                self.config.binary,
                self.config.binary,
                self.config.version_args().join(" ")
            ));
        }
        Ok(())
    }
}

impl WorkerDispatcher for CodexSubprocessDispatcher {
    async fn dispatch(
        &self,
        prompt: &str,
        run_id: &str,
        run_dir: &Path,
        progress_path: &Path,
        timeout: Duration,
        heartbeat_seconds: u64,
        heartbeat_grace_seconds: u64,
    ) -> Result<DispatchOutcome, String> {
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(|e| format!("Failed to create run dir {}: {}", run_dir.display(), e))?;

        let stdout_path = run_dir.join("stdout.log");
        let stderr_path = run_dir.join("stderr.log");
        let args = self.config.build_args(prompt, run_id, &progress_path.display().to_string());

        let mut cmd = tokio::process::Command::new(&self.config.binary);
        cmd.args(&args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::fs::File::create(&stdout_path).map_err(|e| e.to_string())?);
        cmd.stderr(std::fs::File::create(&stderr_path).map_err(|e| e.to_string())?);
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only
        // async-signal-safe functions are permitted; setpgid is
        // async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        log_debug!("[agent] Spawning codex subprocess (run_id={})...", run_id);
        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn subprocess: {}", e))?;

        let child_pid = child
            .id()
            .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
        let pgid = Pid::from_raw(child_pid);
        register_child(pgid);

        let poll_interval = Duration::from_secs(heartbeat_seconds.div_ceil(2).clamp(5, 30));
        let start_wall = Utc::now();
        let mut last_heartbeat: Option<DateTime<Utc>> = None;
        let mut timed_out = false;
        let mut no_heartbeat = false;

        loop {
            if start.elapsed() > timeout {
                timed_out = true;
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                break;
            }

            if let Some(hb) = heartbeat_from_progress(progress_path) {
                if hb >= start_wall - chrono::Duration::seconds(poll_interval.as_secs() as i64) {
                    last_heartbeat = Some(hb);
                }
            }

            let log_activity = latest_mtime(&[&stdout_path, &stderr_path]);
            let mut last_activity = start_wall;
            if let Some(hb) = last_heartbeat {
                if hb > last_activity {
                    last_activity = hb;
                }
            }
            if let Some(activity) = log_activity {
                if activity > last_activity {
                    last_activity = activity;
                }
            }

            let age = (Utc::now() - last_activity).num_seconds().max(0) as u64;
            if age > heartbeat_grace_seconds {
                no_heartbeat = true;
                kill_process_group(child_pid).await;
                let _ = child.wait().await;
                break;
            }

            match tokio::time::timeout(poll_interval, child.wait()).await {
                Ok(_) => break,
                Err(_) => continue,
            }
        }

        unregister_child(pgid);

        if is_shutdown_requested() {
            kill_process_group(child_pid).await;
            let _ = child.wait().await;
            return Err("Shutdown requested".to_string());
        }

        let exit_code = child.wait().await.ok().and_then(|s| s.code()).unwrap_or(-1);

        Ok(DispatchOutcome {
            command: format!("{} {}", self.config.binary, args.join(" ")),
            exit_code,
            timed_out,
            no_heartbeat,
            runtime_seconds: start.elapsed().as_secs(),
            stdout_path,
            stderr_path,
            response_text: String::new(),
        })
    }
}

fn latest_mtime(paths: &[&Path]) -> Option<DateTime<Utc>> {
    paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok()?.modified().ok())
        .map(DateTime::<Utc>::from)
        .max()
}

/// Non-agentic HTTP worker: streams a `{model, prompt, stream:true}` request
/// against an Ollama-compatible `/api/generate` endpoint and accumulates the
/// newline-delimited `{response, done}` chunks into a full response string.
pub struct OllamaHttpDispatcher {
    pub config: OllamaWorkerConfig,
    client: reqwest::Client,
}

impl OllamaHttpDispatcher {
    pub fn new(config: OllamaWorkerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl WorkerDispatcher for OllamaHttpDispatcher {
    async fn dispatch(
        &self,
        prompt: &str,
        _run_id: &str,
        run_dir: &Path,
        _progress_path: &Path,
        timeout: Duration,
        _heartbeat_seconds: u64,
        _heartbeat_grace_seconds: u64,
    ) -> Result<DispatchOutcome, String> {
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(|e| format!("Failed to create run dir {}: {}", run_dir.display(), e))?;

        let stdout_path = run_dir.join("stdout.log");
        let stderr_path = run_dir.join("stderr.log");
        tokio::fs::write(run_dir.join("prompt.txt"), prompt)
            .await
            .map_err(|e| e.to_string())?;

        let payload = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": true,
        });

        let start = std::time::Instant::now();
        let send = self
            .client
            .post(&self.config.endpoint)
            .json(&payload)
            .send();

        let response = match tokio::time::timeout(timeout, send).await {
            Err(_) => {
                tokio::fs::write(
                    &stderr_path,
                    format!("[runner] Ollama timed out after {}s\n", timeout.as_secs()),
                )
                .await
                .ok();
                return Ok(DispatchOutcome {
                    command: format!("POST {}", self.config.endpoint),
                    exit_code: 124,
                    timed_out: true,
                    no_heartbeat: false,
                    runtime_seconds: start.elapsed().as_secs(),
                    stdout_path,
                    stderr_path,
                    response_text: String::new(),
                });
            }
            Ok(result) => result.map_err(|e| format!("Ollama request failed: {e}"))?,
        };

        let mut stream = response.bytes_stream();
        let mut response_text = String::new();
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut timed_out = false;
        let mut leftover = String::new();

        loop {
            let chunk_fut = stream.next();
            let chunk = match tokio::time::timeout(
                timeout.saturating_sub(start.elapsed()),
                chunk_fut,
            )
            .await
            {
                Err(_) => {
                    timed_out = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    stderr_buf.push_str(&format!("[runner] Ollama stream error: {e}\n"));
                    break;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            leftover.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = leftover.find('\n') {
                let line = leftover[..pos].to_string();
                leftover = leftover[pos + 1..].to_string();
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(obj) => {
                        if let Some(text) = obj.get("response").and_then(|v| v.as_str()) {
                            response_text.push_str(text);
                            stdout_buf.push_str(text);
                        }
                        if obj.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                            tokio::fs::write(&stdout_path, &stdout_buf).await.ok();
                            tokio::fs::write(&stderr_path, &stderr_buf).await.ok();
                            return Ok(DispatchOutcome {
                                command: format!("POST {}", self.config.endpoint),
                                exit_code: if stderr_buf.trim().is_empty() { 0 } else { 1 },
                                timed_out: false,
                                no_heartbeat: false,
                                runtime_seconds: start.elapsed().as_secs(),
                                stdout_path,
                                stderr_path,
                                response_text,
                            });
                        }
                    }
                    Err(_) => stderr_buf.push_str(&line),
                }
            }
        }

        tokio::fs::write(&stdout_path, &stdout_buf).await.ok();
        tokio::fs::write(&stderr_path, &stderr_buf).await.ok();

        Ok(DispatchOutcome {
            command: format!("POST {}", self.config.endpoint),
            exit_code: if timed_out { 124 } else if stderr_buf.trim().is_empty() { 0 } else { 1 },
            timed_out,
            no_heartbeat: false,
            runtime_seconds: start.elapsed().as_secs(),
            stdout_path,
            stderr_path,
            response_text,
        })
    }
}

/// Extract a JSON object from worker response text, tolerating markdown code
/// fences and extra surrounding prose by locating the outermost `{...}`.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let text = text.trim();
    let text = if let Some(rest) = text.strip_prefix("```") {
        let body = rest.splitn(2, '\n').nth(1).unwrap_or(rest);
        body.rsplit_once("```").map(|(before, _)| before).unwrap_or(body).trim()
    } else {
        text
    };

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Extract candidate file paths from a unified diff, reading both
/// `diff --git a/... b/...` headers and `+++ b/...` lines.
pub fn extract_diff_paths(patch: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some((_, b)) = rest.split_once(' ') {
                if let Some(path) = b.strip_prefix("b/") {
                    paths.push(path.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(path) = rest.strip_prefix("b/") {
                if path != "/dev/null" {
                    paths.push(path.trim().to_string());
                }
            }
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

/// Apply a unified diff to the working tree via `git apply`. Failure to
/// apply is surfaced as a retriable worker failure by the caller.
pub fn apply_patch(repo_dir: &Path, patch: &str) -> Result<(), String> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new("git")
        .args(["apply", "--whitespace=nowarn", "--recount", "-"])
        .current_dir(repo_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to spawn git apply: {e}"))?;

    child
        .stdin
        .take()
        .ok_or("missing stdin")?
        .write_all(patch.as_bytes())
        .map_err(|e| format!("Failed to write patch to git apply: {e}"))?;

    let output = child
        .wait_with_output()
        .map_err(|e| format!("Failed to wait on git apply: {e}"))?;

    if !output.status.success() {
        return Err(format!(
            "git apply failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Mock dispatcher for pipeline tests. Returns predefined outcomes in order.
pub struct MockWorkerDispatcher {
    outcomes: tokio::sync::Mutex<Vec<Result<DispatchOutcome, String>>>,
}

impl MockWorkerDispatcher {
    pub fn new(outcomes: Vec<Result<DispatchOutcome, String>>) -> Self {
        let mut reversed = outcomes;
        reversed.reverse();
        Self {
            outcomes: tokio::sync::Mutex::new(reversed),
        }
    }
}

impl WorkerDispatcher for MockWorkerDispatcher {
    async fn dispatch(
        &self,
        _prompt: &str,
        _run_id: &str,
        _run_dir: &Path,
        _progress_path: &Path,
        _timeout: Duration,
        _heartbeat_seconds: u64,
        _heartbeat_grace_seconds: u64,
    ) -> Result<DispatchOutcome, String> {
        let mut outcomes = self.outcomes.lock().await;
        outcomes
            .pop()
            .unwrap_or_else(|| Err("MockWorkerDispatcher: no more outcomes in sequence".to_string()))
    }
}
