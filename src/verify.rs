//! Verification Runner (§4.4): runs the resolved test command, extracts a
//! bounded excerpt, and derives failing repo paths plus the
//! needs-allowlist-expansion signal from them.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::interpret::path_is_allowed;
use crate::store::read_text_window;
use crate::types::VerificationResult;

const EXCLUDE_PREFIXES: &[&str] = &[
    ".git/",
    ".venv/",
    "venv/",
    "__pycache__/",
    ".pytest_cache/",
    ".mypy_cache/",
    ".ruff_cache/",
    ".tox/",
    ".nox/",
];

/// True when `command` looks like a pytest invocation, directly or behind a
/// common wrapper (`python -m pytest`, `poetry run pytest`, ...).
pub fn is_pytest_command(command: &str) -> bool {
    let cmd = command.trim();
    if cmd.is_empty() {
        return false;
    }
    if cmd.starts_with("pytest") {
        return true;
    }
    if cmd.starts_with("python") && cmd.contains(" -m pytest") {
        return true;
    }
    let tokens: Vec<&str> = cmd.split_whitespace().collect();
    if tokens.iter().any(|t| *t == "pytest") {
        return true;
    }
    for window in tokens.windows(2) {
        if window[0] == "-m" && window[1] == "pytest" {
            return true;
        }
    }
    false
}

/// Appends pytest's verbose-failure flags when missing, matching the
/// original's "robust pytest flags" behavior.
fn with_pytest_flags(command: &str) -> String {
    let mut out = command.to_string();
    if !out.contains("--tb=") {
        out.push_str(" --tb=long");
    }
    if !out.contains("--disable-warnings") {
        out.push_str(" --disable-warnings");
    }
    if !out.split_whitespace().any(|t| t == "-q") {
        out.push_str(" -q");
    }
    out
}

/// Extracts the text between pytest's `FAILURES` banner and the next banner
/// line (or end of text). Banners look like
/// `================================= FAILURES =================================`.
pub fn extract_failures_section(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let is_banner = |l: &str| {
        let t = l.trim();
        t.len() > 4 && t.chars().filter(|c| *c == '=').count() >= 4
    };
    let start = lines
        .iter()
        .position(|l| is_banner(l) && l.contains("FAILURES"));
    let Some(start) = start else {
        return text.to_string();
    };
    let end = lines[start + 1..]
        .iter()
        .position(|l| is_banner(l))
        .map(|i| start + 1 + i)
        .unwrap_or(lines.len());
    lines[start..end].join("\n")
}

/// Extracts repo-relative `.py` paths from pytest's `FAILED path::test` lines.
pub fn extract_failed_test_files(fail_text: &str, project_dir: &Path) -> Vec<String> {
    let mut out = std::collections::BTreeSet::new();
    for line in fail_text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("FAILED ") else {
            continue;
        };
        let path_part = rest.split("::").next().unwrap_or(rest).trim();
        if existing_repo_relative(path_part, project_dir).is_some() {
            out.insert(path_part.trim_start_matches("./").to_string());
        }
    }
    out.into_iter().collect()
}

/// Extracts repo-relative paths from Python traceback `File "path", line N`
/// lines.
pub fn extract_traceback_repo_paths(text: &str, project_dir: &Path) -> Vec<String> {
    let mut out = std::collections::BTreeSet::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("File \"") else {
            continue;
        };
        let Some(end) = rest.find('"') else { continue };
        let path = &rest[..end];
        if let Some(rel) = existing_repo_relative(path, project_dir) {
            out.insert(rel);
        }
    }
    out.into_iter().collect()
}

/// Maps a failing test module to plausible source files:
/// `tests/test_<name>.py` → `src/<name>.py` and `<name>.py`. Resolved as
/// Open Question 1 (single-root heuristic, documented rather than solved
/// generally for monorepos).
pub fn infer_suspect_source_files(failed_test_files: &[String], project_dir: &Path) -> Vec<String> {
    let mut out = std::collections::BTreeSet::new();
    for test_path in failed_test_files {
        let file_name = Path::new(test_path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        let Some(stem) = file_name.strip_prefix("test_").and_then(|s| s.strip_suffix(".py")) else {
            continue;
        };
        for candidate in [format!("src/{stem}.py"), format!("{stem}.py")] {
            if existing_repo_relative(&candidate, project_dir).is_some() {
                out.insert(candidate);
            }
        }
    }
    out.into_iter().collect()
}

/// Tokenizes free-form log text into path-shaped candidates (contiguous runs
/// of path characters containing a `.`), keeping only those that resolve to
/// real files under the repo.
pub fn extract_paths_from_log(log_text: &str, project_dir: &Path) -> Vec<String> {
    let is_path_char = |c: char| c.is_ascii_alphanumeric() || "_./\\-".contains(c);
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in log_text.chars() {
        if is_path_char(c) {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for token in tokens {
        if !token.contains('.') {
            continue;
        }
        let cleaned = token.replace('\\', "/");
        let cleaned = cleaned.split("::").next().unwrap_or(&cleaned).trim_start_matches("./");
        if cleaned.is_empty() || seen.contains(cleaned) {
            continue;
        }
        if let Some(rel) = existing_repo_relative(cleaned, project_dir) {
            seen.insert(cleaned.to_string());
            out.push(rel);
        }
    }
    out
}

fn existing_repo_relative(path: &str, project_dir: &Path) -> Option<String> {
    let candidate = Path::new(path);
    let rel = if candidate.is_absolute() {
        candidate.strip_prefix(project_dir).ok()?.to_path_buf()
    } else {
        PathBuf::from(path.trim_start_matches("./"))
    };
    let full = project_dir.join(&rel);
    if full.is_file() {
        Some(rel.to_string_lossy().replace('\\', "/"))
    } else {
        None
    }
}

/// First few `FAILED` test ids plus the first `E   ` assertion line, used for
/// a short human-facing log summary. Not consumed for control flow.
pub fn summarize_pytest_failures(log_tail: &str, max_failed: usize) -> (Vec<String>, Option<String>) {
    let mut failed = Vec::new();
    for line in log_tail.lines() {
        if let Some(rest) = line.trim().strip_prefix("FAILED ") {
            if failed.len() < max_failed {
                failed.push(rest.trim().to_string());
            }
        }
    }
    let first_error = log_tail
        .lines()
        .find(|l| l.trim_start().starts_with("E "))
        .map(|l| l.trim().to_string());
    (failed, first_error)
}

/// Runs `command` from `project_dir` via the shell, writing combined output
/// to `log_path`, and returns `(exit_code, timed_out)`.
async fn run_command(
    command: &str,
    project_dir: &Path,
    log_path: &Path,
    timeout: Duration,
) -> Result<(i32, bool), String> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(project_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn test command: {e}"))?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let mut log_file = tokio::fs::File::create(log_path)
        .await
        .map_err(|e| format!("create {}: {e}", log_path.display()))?;

    // Drain stdout and stderr concurrently: reading one to completion before
    // starting the other risks deadlocking the child on a full pipe buffer.
    let wait_result = tokio::time::timeout(timeout, async {
        let mut sink = tokio::io::sink();
        let (_, _, status) = tokio::join!(
            tokio::io::copy(&mut stdout, &mut log_file),
            tokio::io::copy(&mut stderr, &mut sink),
            child.wait(),
        );
        status
    })
    .await;

    log_file.flush().await.ok();

    match wait_result {
        Ok(Ok(status)) => Ok((status.code().unwrap_or(-1), false)),
        Ok(Err(e)) => Err(format!("test command wait failed: {e}")),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok((124, true))
        }
    }
}

/// Diagnostic dump of one verification run, written alongside the raw log
/// and excerpt for post-mortem debugging without needing to replay the run.
#[derive(Debug, Serialize)]
struct VerifyManifest<'a> {
    command: &'a str,
    exit_code: i32,
    timed_out: bool,
    passed: bool,
    duration_ms: u128,
    log_path: &'a str,
    excerpt_path: &'a str,
    captured_at: &'a str,
    allowlist_used: &'a [String],
    failed_test_files: &'a [String],
    trace_files: &'a [String],
    suspect_source_files: &'a [String],
    candidate_paths: &'a [String],
    failing_paths: &'a [String],
    needs_allowlist_expansion: bool,
}

/// Runs verification for a phase: resolves nothing itself (the caller passes
/// an already-resolved `test_command`), executes it, and derives failing
/// paths plus the allowlist-expansion signal. Writes the raw log, a compact
/// excerpt, and a `verify_manifest.json` diagnostic dump into `run_dir`.
pub async fn run_verification(
    project_dir: &Path,
    run_dir: &Path,
    test_command: &str,
    allowlist: &[String],
    timeout: Duration,
    state_dir_name: &str,
) -> Result<VerificationResult, String> {
    if test_command.trim().is_empty() {
        return Ok(VerificationResult {
            command: String::new(),
            exit_code: 0,
            log_path: String::new(),
            passed: true,
            failing_paths: Vec::new(),
            needs_allowlist_expansion: false,
            log_tail: "No test command configured".to_string(),
            captured_at: Utc::now().to_rfc3339(),
        });
    }

    let is_pytest = is_pytest_command(test_command);
    let effective_command = if is_pytest {
        with_pytest_flags(test_command)
    } else {
        test_command.to_string()
    };

    let log_path = run_dir.join("verify.log");
    let started_at = std::time::Instant::now();
    let (exit_code, timed_out) = run_command(&effective_command, project_dir, &log_path, timeout).await?;
    let duration_ms = started_at.elapsed().as_millis();

    let log_tail = read_text_window(&log_path, 20_000, 20_000).unwrap_or_default();
    let excerpt = if is_pytest {
        extract_failures_section(&log_tail)
    } else {
        log_tail.clone()
    };

    let failed_test_files = if is_pytest {
        extract_failed_test_files(&excerpt, project_dir)
    } else {
        Vec::new()
    };
    let trace_files = extract_traceback_repo_paths(&excerpt, project_dir);
    let src_in_traces = trace_files.iter().any(|p| p.starts_with("src/"));
    let suspect_source_files = if !src_in_traces && !failed_test_files.is_empty() {
        infer_suspect_source_files(&failed_test_files, project_dir)
    } else {
        Vec::new()
    };
    let candidate_paths = if !is_pytest {
        extract_paths_from_log(&excerpt, project_dir)
            .into_iter()
            .filter(|p| (p.starts_with("src/") || p.starts_with("tests/")) && p.ends_with(".py"))
            .collect()
    } else {
        Vec::new()
    };

    let state_dir_prefix = format!("{}/", state_dir_name.trim_end_matches('/'));
    let mut failing_paths: Vec<String> = failed_test_files
        .iter()
        .chain(trace_files.iter())
        .chain(suspect_source_files.iter())
        .chain(candidate_paths.iter())
        .cloned()
        .filter(|p| !EXCLUDE_PREFIXES.iter().any(|prefix| p.starts_with(prefix)))
        .filter(|p| !p.starts_with(&state_dir_prefix))
        .collect();
    failing_paths.sort();
    failing_paths.dedup();

    let meaningful_allowlist: Vec<&String> = allowlist.iter().filter(|p| !p.is_empty() && *p != "README.md").collect();
    let needs_allowlist_expansion = if meaningful_allowlist.is_empty() {
        false
    } else {
        failing_paths.iter().any(|p| !path_is_allowed(p, allowlist))
    };

    let passed = exit_code == 0 && !timed_out;
    let captured_at = Utc::now().to_rfc3339();
    let log_path_str = log_path.display().to_string();

    let excerpt_path = run_dir.join("verify_excerpt.log");
    tokio::fs::write(&excerpt_path, &excerpt)
        .await
        .map_err(|e| format!("write {}: {e}", excerpt_path.display()))?;
    let excerpt_path_str = excerpt_path.display().to_string();

    let manifest = VerifyManifest {
        command: &effective_command,
        exit_code,
        timed_out,
        passed,
        duration_ms,
        log_path: &log_path_str,
        excerpt_path: &excerpt_path_str,
        captured_at: &captured_at,
        allowlist_used: allowlist,
        failed_test_files: &failed_test_files,
        trace_files: &trace_files,
        suspect_source_files: &suspect_source_files,
        candidate_paths: &candidate_paths,
        failing_paths: &failing_paths,
        needs_allowlist_expansion,
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(|e| e.to_string())?;
    tokio::fs::write(run_dir.join("verify_manifest.json"), manifest_json)
        .await
        .map_err(|e| format!("write verify_manifest.json: {e}"))?;

    Ok(VerificationResult {
        command: effective_command,
        exit_code,
        log_path: log_path_str,
        passed,
        failing_paths,
        needs_allowlist_expansion,
        log_tail,
        captured_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detects_pytest_prefix_and_wrapped_invocations() {
        assert!(is_pytest_command("pytest -q"));
        assert!(is_pytest_command("python -m pytest tests/"));
        assert!(is_pytest_command("poetry run pytest"));
        assert!(!is_pytest_command("cargo test"));
        assert!(!is_pytest_command(""));
    }

    #[test]
    fn adds_missing_pytest_flags_without_duplicating_present_ones() {
        let out = with_pytest_flags("pytest --tb=short");
        assert!(out.contains("--tb=short"));
        assert!(!out.contains("--tb=long"));
        assert!(out.contains("--disable-warnings"));
        assert!(out.contains("-q"));
    }

    #[test]
    fn extracts_failures_section_between_banners() {
        let log = "===== test session starts =====\nsome setup output\n================================= FAILURES =================================\n_____ test_thing _____\nAssertionError\n================= short test summary info =================\nFAILED tests/test_thing.py::test_thing\n";
        let section = extract_failures_section(log);
        assert!(section.contains("test_thing"));
        assert!(!section.contains("test session starts"));
        assert!(!section.contains("short test summary"));
    }

    #[test]
    fn extracts_failed_test_files_from_failed_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join("tests/test_thing.py"), "").unwrap();
        let log = "FAILED tests/test_thing.py::test_one - AssertionError\n";
        let files = extract_failed_test_files(log, dir.path());
        assert_eq!(files, vec!["tests/test_thing.py".to_string()]);
    }

    #[test]
    fn infers_suspect_source_from_failing_test_name() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/thing.py"), "").unwrap();
        let suspects = infer_suspect_source_files(&["tests/test_thing.py".to_string()], dir.path());
        assert_eq!(suspects, vec!["src/thing.py".to_string()]);
    }

    #[test]
    fn extracts_traceback_paths_for_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/thing.py"), "").unwrap();
        let text = "Traceback (most recent call last):\n  File \"src/thing.py\", line 10, in run\n    raise ValueError\n";
        let paths = extract_traceback_repo_paths(text, dir.path());
        assert_eq!(paths, vec!["src/thing.py".to_string()]);
    }

    #[test]
    fn summarizes_up_to_max_failed_with_first_error_line() {
        let log = "FAILED tests/test_a.py::test_1\nFAILED tests/test_b.py::test_2\nE   assert 1 == 2\n";
        let (failed, first_error) = summarize_pytest_failures(log, 1);
        assert_eq!(failed, vec!["tests/test_a.py::test_1".to_string()]);
        assert_eq!(first_error, Some("E   assert 1 == 2".to_string()));
    }

    #[tokio::test]
    async fn run_verification_reports_pass_on_zero_exit() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        let result = run_verification(dir.path(), &run_dir, "true", &[], Duration::from_secs(5), ".taskforge")
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn run_verification_reports_failure_on_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        let result = run_verification(dir.path(), &run_dir, "exit 1", &[], Duration::from_secs(5), ".taskforge")
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn run_verification_skips_execution_when_no_command_configured() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        let result = run_verification(dir.path(), &run_dir, "", &[], Duration::from_secs(5), ".taskforge")
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.command, "");
    }

    #[tokio::test]
    async fn run_verification_times_out_long_running_commands() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        let result = run_verification(dir.path(), &run_dir, "sleep 5", &[], Duration::from_millis(200), ".taskforge")
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.exit_code, 124);
    }

    #[tokio::test]
    async fn run_verification_writes_excerpt_and_manifest_files() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("run");
        run_verification(dir.path(), &run_dir, "exit 1", &[], Duration::from_secs(5), ".taskforge")
            .await
            .unwrap();

        let manifest_raw = std::fs::read_to_string(run_dir.join("verify_manifest.json")).expect("manifest written");
        let manifest: serde_json::Value = serde_json::from_str(&manifest_raw).expect("valid manifest JSON");
        assert_eq!(manifest["exit_code"], 1);
        assert_eq!(manifest["command"], "exit 1");
        assert!(run_dir.join("verify_excerpt.log").is_file());
    }

    #[tokio::test]
    async fn run_verification_excludes_state_dir_paths_from_candidates() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".taskforge")).unwrap();
        std::fs::write(dir.path().join(".taskforge/worker.py"), "").unwrap();
        let run_dir = dir.path().join("run");
        let script = dir.path().join("emit.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'Traceback (most recent call last):'\necho '  File \".taskforge/worker.py\", line 10, in run'\nexit 1\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script, perms).unwrap();
        }
        let command = script.display().to_string();
        let result = run_verification(dir.path(), &run_dir, &command, &[], Duration::from_secs(5), ".taskforge")
            .await
            .unwrap();
        assert!(!result.failing_paths.iter().any(|p| p.starts_with(".taskforge/")));
    }

    #[test]
    fn non_pytest_candidate_paths_require_a_python_extension() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/config.toml"), "").unwrap();
        std::fs::write(dir.path().join("src/thing.py"), "").unwrap();
        let log = "error in src/config.toml and also src/thing.py\n";
        let candidates: Vec<String> = extract_paths_from_log(log, dir.path())
            .into_iter()
            .filter(|p| (p.starts_with("src/") || p.starts_with("tests/")) && p.ends_with(".py"))
            .collect();
        assert_eq!(candidates, vec!["src/thing.py".to_string()]);
    }
}
