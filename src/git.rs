use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Entries the `.gitignore` setup in [`ensure_state_dir_ignored`] is allowed
/// to add. Mirrors the original runner's three-entry set exactly (resolved
/// Open Question, see `DESIGN.md`).
fn ignore_entries(state_dir_name: &str) -> [String; 3] {
    [
        format!("{state_dir_name}/"),
        format!("{state_dir_name}.bak-*/"),
        format!("{state_dir_name}.bak-*"),
    ]
}

/// A single entry from `git status --porcelain` output.
///
/// Note: porcelain v1 format uses ASCII for the two-character status code and space separator,
/// so byte-offset slicing at positions 0..2 and 3.. is safe. File paths with special characters
/// may be quoted by git.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    /// Two-character status code (e.g., "M ", "??", "A ")
    pub status_code: String,
    /// The file path
    pub path: String,
}

/// Verify only that a git repository exists in the given directory.
///
/// Does not check working tree cleanliness, branch state, or rebase/merge status.
/// Use this when you only need to confirm git is available (e.g., `init`).
pub fn is_git_repo(repo_dir: Option<&Path>) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// Verify git preconditions for safe orchestrator operation.
///
/// Checks:
/// - Git repo exists (`git rev-parse --git-dir`)
/// - Working tree is clean (`git status --porcelain` is empty)
/// - Not in detached HEAD or rebase/merge state
pub fn check_preconditions(repo_dir: Option<&Path>) -> Result<(), String> {
    // Verify git repo exists and capture git dir path for later checks
    let git_dir_output = run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;

    // Check for clean working tree
    let status_output = run_git_command(&["status", "--porcelain"], repo_dir)?;
    if !status_output.trim().is_empty() {
        return Err(
            "Working tree is not clean. Commit or stash changes before running the orchestrator."
                .to_string(),
        );
    }

    // Check for detached HEAD
    let head_check = run_git_command(&["symbolic-ref", "--quiet", "HEAD"], repo_dir);
    if head_check.is_err() {
        return Err(
            "Detached HEAD state detected. Check out a branch before running the orchestrator."
                .to_string(),
        );
    }

    // Check for rebase/merge in progress
    let git_dir_path = if let Some(base) = repo_dir {
        base.join(git_dir_output.trim())
    } else {
        std::path::PathBuf::from(git_dir_output.trim())
    };

    if git_dir_path.join("rebase-merge").exists() || git_dir_path.join("rebase-apply").exists() {
        return Err(
            "Rebase in progress. Complete or abort the rebase before running the orchestrator."
                .to_string(),
        );
    }

    if git_dir_path.join("MERGE_HEAD").exists() {
        return Err(
            "Merge in progress. Complete or abort the merge before running the orchestrator."
                .to_string(),
        );
    }

    Ok(())
}

/// Stage specific file paths for commit in a specific repo directory.
///
/// Uses `git add` with explicit paths only (never `-A` or `.`).
pub fn stage_paths(paths: &[&Path], repo_dir: Option<&Path>) -> Result<(), String> {
    if paths.is_empty() {
        return Ok(());
    }

    let mut args = vec!["add".to_string(), "--".to_string()];
    for p in paths {
        args.push(
            p.to_str()
                .ok_or_else(|| format!("Path contains invalid UTF-8: {:?}", p))?
                .to_string(),
        );
    }

    let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    run_git_command(&args_ref, repo_dir)?;
    Ok(())
}

/// Create a git commit with the given message.
///
/// Returns the commit hash on success. If the commit fails, returns an error
/// (caller treats as phase failure).
pub fn commit(message: &str, repo_dir: Option<&Path>) -> Result<String, String> {
    run_git_command(&["commit", "-m", message], repo_dir)?;
    let hash = run_git_command(&["rev-parse", "HEAD"], repo_dir)?;
    Ok(hash.trim().to_string())
}

/// Parse `git status --porcelain` output into structured entries.
pub fn get_status(repo_dir: Option<&Path>) -> Result<Vec<StatusEntry>, String> {
    let output = run_git_command(&["status", "--porcelain"], repo_dir)?;

    let entries = output
        .lines()
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.len() < 3 {
                // Malformed porcelain output line -- skip
                None
            } else {
                Some(StatusEntry {
                    status_code: line[..2].to_string(),
                    path: line[3..].to_string(),
                })
            }
        })
        .collect();

    Ok(entries)
}

/// Returns the full 40-character SHA of HEAD.
pub fn get_head_sha(project_root: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], Some(project_root))?;
    Ok(output.trim().to_string())
}

/// Checks whether `sha` is an ancestor of the current HEAD.
///
/// Uses `git merge-base --is-ancestor`:
/// - Exit 0 → true (sha is an ancestor of HEAD)
/// - Exit 1 → false (sha is not an ancestor)
/// - Exit 128 → Err (unknown commit / other git error)
pub fn is_ancestor(sha: &str, project_root: &Path) -> Result<bool, String> {
    if sha.is_empty() || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("Invalid SHA: '{}'", sha));
    }

    let mut cmd = Command::new("git");
    cmd.args(["merge-base", "--is-ancestor", sha, "HEAD"]);
    cmd.current_dir(project_root);

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git merge-base: {}", e))?;

    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        Some(128) | None => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git merge-base failed: {}", stderr.trim()))
        }
        Some(code) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "git merge-base exited with unexpected code {}: {}",
                code,
                stderr.trim()
            ))
        }
    }
}

/// Current branch name, or `None` in detached HEAD.
pub fn current_branch(repo_dir: &Path) -> Result<Option<String>, String> {
    let name = run_git_command(&["rev-parse", "--abbrev-ref", "HEAD"], Some(repo_dir))?;
    let name = name.trim();
    if name.is_empty() || name == "HEAD" {
        Ok(None)
    } else {
        Ok(Some(name.to_string()))
    }
}

pub fn branch_exists(repo_dir: &Path, branch: &str) -> Result<bool, String> {
    let refname = format!("refs/heads/{branch}");
    let mut cmd = Command::new("git");
    cmd.args(["show-ref", "--verify", &refname]);
    cmd.current_dir(repo_dir);
    let status = cmd
        .status()
        .map_err(|e| format!("Failed to run git show-ref: {e}"))?;
    Ok(status.success())
}

/// Checks out `branch`, creating it from the current HEAD if it doesn't
/// already exist. No-op if it's already checked out.
pub fn checkout_or_create_branch(repo_dir: &Path, branch: &str) -> Result<(), String> {
    if current_branch(repo_dir)?.as_deref() == Some(branch) {
        return Ok(());
    }
    if branch_exists(repo_dir, branch)? {
        run_git_command(&["checkout", branch], Some(repo_dir))?;
    } else {
        run_git_command(&["checkout", "-b", branch], Some(repo_dir))?;
    }
    Ok(())
}

pub fn has_changes(repo_dir: &Path) -> Result<bool, String> {
    let output = run_git_command(&["status", "--porcelain"], Some(repo_dir))?;
    Ok(!output.trim().is_empty())
}

/// Lists changed paths: unstaged diff + staged diff + untracked files,
/// deduplicated and sorted. Used to build before/after snapshots for
/// allowlist validation (the Output Interpreter diffs two calls to this).
pub fn changed_files(repo_dir: &Path) -> Result<Vec<String>, String> {
    let mut changed = std::collections::BTreeSet::new();
    for args in [
        vec!["diff", "--name-only"],
        vec!["diff", "--name-only", "--staged"],
        vec!["ls-files", "--others", "--exclude-standard"],
    ] {
        let args_ref: Vec<&str> = args.clone();
        if let Ok(output) = run_git_command(&args_ref, Some(repo_dir)) {
            for line in output.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    changed.insert(line.to_string());
                }
            }
        }
    }
    Ok(changed.into_iter().collect())
}

/// `added = after - before`, `removed = before - after`. Building block for
/// pre/post repo snapshot diffing (Output Interpreter).
pub fn diff_file_sets(before: &[String], after: &[String]) -> (Vec<String>, Vec<String>) {
    let before_set: std::collections::BTreeSet<&String> = before.iter().collect();
    let after_set: std::collections::BTreeSet<&String> = after.iter().collect();
    let added = after_set.difference(&before_set).map(|s| s.to_string()).collect();
    let removed = before_set.difference(&after_set).map(|s| s.to_string()).collect();
    (added, removed)
}

/// Bounded unstaged+staged diff text, truncated to `max_chars` (returns
/// whether it was truncated).
pub fn diff_text(repo_dir: &Path, max_chars: usize) -> Result<(String, bool), String> {
    bounded_sections(
        repo_dir,
        max_chars,
        &[
            ("UNSTAGED DIFF", &["diff"]),
            ("STAGED DIFF", &["diff", "--staged"]),
        ],
    )
}

pub fn diff_stat(repo_dir: &Path, max_chars: usize) -> Result<(String, bool), String> {
    bounded_sections(
        repo_dir,
        max_chars,
        &[
            ("UNSTAGED DIFFSTAT", &["diff", "--stat"]),
            ("STAGED DIFFSTAT", &["diff", "--stat", "--staged"]),
        ],
    )
}

pub fn status_porcelain(repo_dir: &Path, max_chars: usize) -> Result<(String, bool), String> {
    let content = run_git_command(&["status", "--porcelain"], Some(repo_dir))?
        .trim()
        .to_string();
    Ok(truncate(&content, max_chars))
}

fn bounded_sections(
    repo_dir: &Path,
    max_chars: usize,
    sections: &[(&str, &[&str])],
) -> Result<(String, bool), String> {
    let mut parts = Vec::new();
    for (label, args) in sections {
        if let Ok(output) = run_git_command(args, Some(repo_dir)) {
            let content = output.trim();
            if !content.is_empty() {
                parts.push(format!("{label}:\n{content}"));
            }
        }
    }
    Ok(truncate(parts.join("\n\n").trim(), max_chars))
}

fn truncate(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        (text.to_string(), false)
    } else {
        (text.chars().take(max_chars).collect(), true)
    }
}

pub fn is_ignored(repo_dir: &Path, path: &str) -> bool {
    let mut cmd = Command::new("git");
    cmd.args(["check-ignore", "-q", path]);
    cmd.current_dir(repo_dir);
    cmd.status().map(|s| s.success()).unwrap_or(false)
}

fn tracked_paths(repo_dir: &Path, path: &str) -> Vec<String> {
    run_git_command(&["ls-files", path], Some(repo_dir))
        .map(|out| out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
        .unwrap_or_default()
}

/// Adds the state-directory ignore entries to `.gitignore` if missing.
pub fn ensure_state_dir_ignored(repo_dir: &Path, state_dir_name: &str) -> Result<(), String> {
    let gitignore_path = repo_dir.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore_path).unwrap_or_default();
    let present: std::collections::HashSet<String> = existing
        .lines()
        .map(|l| l.trim().trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();

    let mut contents = existing.clone();
    let mut changed = false;
    for entry in ignore_entries(state_dir_name) {
        let normalized = entry.trim_end_matches('/').to_string();
        if present.contains(&normalized) {
            continue;
        }
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&entry);
        contents.push('\n');
        changed = true;
    }
    if changed {
        std::fs::write(&gitignore_path, contents)
            .map_err(|e| format!("Failed to write {}: {}", gitignore_path.display(), e))?;
    }
    Ok(())
}

/// True iff every changed line in `.gitignore` (staged or unstaged) is a pure
/// addition drawn from the state-dir ignore set, with no removals. This is
/// the one exception `interpret.rs`'s mode validation carves out of the
/// "plan/plan_impl/review touches nothing outside the state dir" rule.
pub fn gitignore_change_is_state_dir_only(repo_dir: &Path, state_dir_name: &str) -> bool {
    let mut changed_lines = Vec::new();
    for args in [
        vec!["diff", "--", ".gitignore"],
        vec!["diff", "--staged", "--", ".gitignore"],
    ] {
        if let Ok(output) = run_git_command(&args, Some(repo_dir)) {
            for line in output.lines() {
                if line.starts_with("+++ ") || line.starts_with("--- ") || line.starts_with("@@ ") {
                    continue;
                }
                if line.starts_with('+') || line.starts_with('-') {
                    changed_lines.push(line.to_string());
                }
            }
        }
    }
    if changed_lines.is_empty() {
        return false;
    }
    if changed_lines.iter().any(|l| l.starts_with('-')) {
        return false;
    }
    let allowed: std::collections::HashSet<String> = {
        let mut set: std::collections::HashSet<String> =
            ignore_entries(state_dir_name).into_iter().collect();
        set.insert(state_dir_name.to_string());
        set
    };
    let additions: Vec<String> = changed_lines
        .iter()
        .filter(|l| l.starts_with('+'))
        .map(|l| l[1..].trim().to_string())
        .collect();
    !additions.is_empty() && additions.iter().all(|a| allowed.contains(a))
}

/// Stages everything, commits, and pushes `branch` to `origin`. Refuses if
/// the state directory is tracked or not ignored, probing wildcard-ignore
/// effectiveness with a throwaway backup-glob file first so a broken
/// `.gitignore` pattern is caught before it would leak state into history.
pub fn commit_all_and_push(repo_dir: &Path, state_dir_name: &str, branch: &str, message: &str) -> Result<String, String> {
    if !tracked_paths(repo_dir, state_dir_name).is_empty() {
        return Err(format!(
            "{state_dir_name} is tracked; remove it from git history before committing"
        ));
    }
    if !is_ignored(repo_dir, state_dir_name) {
        ensure_state_dir_ignored(repo_dir, state_dir_name)?;
        if !is_ignored(repo_dir, state_dir_name) {
            return Err(format!(
                "{state_dir_name} is not ignored; add it to .gitignore before committing"
            ));
        }
    }

    let probe_name = format!("{state_dir_name}.bak-ignore-probe");
    let probe_path = repo_dir.join(&probe_name);
    let probe_created = if !probe_path.exists() {
        std::fs::write(&probe_path, b"").is_ok()
    } else {
        false
    };
    let probe_result = (|| -> Result<(), String> {
        if !is_ignored(repo_dir, &probe_name) {
            ensure_state_dir_ignored(repo_dir, state_dir_name)?;
            if !is_ignored(repo_dir, &probe_name) {
                return Err(format!(
                    "{state_dir_name}.bak-* is not ignored; add it to .gitignore before committing"
                ));
            }
        }
        Ok(())
    })();
    if probe_created {
        let _ = std::fs::remove_file(&probe_path);
    }
    probe_result?;

    run_git_command(&["add", "-A", "--", "."], Some(repo_dir))?;
    let hash = commit(message, Some(repo_dir))?;
    push(repo_dir, branch)?;
    Ok(hash)
}

pub fn push(repo_dir: &Path, branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("Branch is required to push".to_string());
    }
    run_git_command(&["push", "-u", "origin", branch], Some(repo_dir))?;
    Ok(())
}

/// Serializes every git operation across concurrently executing phases.
/// Cloning shares the same underlying lock (`Arc`-backed), so each
/// `PhaseExecutor` can hold its own handle.
///
/// A plain non-reentrant `tokio::sync::Mutex` is sufficient: every method
/// here performs exactly one git invocation and returns without calling
/// back into the coordinator, so nothing ever re-enters the guard (resolved
/// Open Question, see `DESIGN.md`).
#[derive(Clone)]
pub struct GitCoordinator {
    lock: Arc<Mutex<()>>,
}

impl Default for GitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCoordinator {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn checkout_or_create_branch(&self, repo_dir: &Path, branch: &str) -> Result<(), String> {
        let _guard = self.lock.lock().await;
        checkout_or_create_branch(repo_dir, branch)
    }

    pub async fn commit_all_and_push(
        &self,
        repo_dir: &Path,
        state_dir_name: &str,
        branch: &str,
        message: &str,
    ) -> Result<String, String> {
        let _guard = self.lock.lock().await;
        commit_all_and_push(repo_dir, state_dir_name, branch, message)
    }

    pub async fn changed_files(&self, repo_dir: &Path) -> Result<Vec<String>, String> {
        let _guard = self.lock.lock().await;
        changed_files(repo_dir)
    }

    pub async fn head_sha(&self, repo_dir: &Path) -> Result<String, String> {
        let _guard = self.lock.lock().await;
        get_head_sha(repo_dir)
    }

    pub async fn is_ancestor(&self, sha: &str, repo_dir: &Path) -> Result<bool, String> {
        let _guard = self.lock.lock().await;
        is_ancestor(sha, repo_dir)
    }
}

/// Run a git command and return its stdout as a string.
fn run_git_command(args: &[&str], repo_dir: Option<&Path>) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args(args);

    if let Some(dir) = repo_dir {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", args.first().unwrap_or(&""), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        ));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}
