use std::path::Path;

use serde::Deserialize;

use crate::types::{AttemptCaps, WorkerKind};

#[derive(Default, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub project: ProjectConfig,
    pub guardrails: GuardrailsConfig,
    pub execution: ExecutionConfig,
    pub worker: WorkerConfig,
    pub attempt_caps: AttemptCaps,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub state_dir: String,
    pub prd_path: String,
    pub default_branch_prefix: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            state_dir: ".taskforge".to_string(),
            prd_path: "PRD.md".to_string(),
            default_branch_prefix: "feature/".to_string(),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub test_command: String,
    pub review_min_evidence: u32,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            test_command: "true".to_string(),
            review_min_evidence: 2,
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub heartbeat_seconds: u64,
    pub heartbeat_grace_seconds: u64,
    pub shift_minutes: u64,
    pub max_concurrent: u32,
    pub max_auto_resumes: u32,
    pub phase_iteration_cap: u32,
    pub stop_on_blocking_issues: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            heartbeat_seconds: 30,
            heartbeat_grace_seconds: 60,
            shift_minutes: 30,
            max_concurrent: 1,
            max_auto_resumes: 1,
            phase_iteration_cap: 20,
            stop_on_blocking_issues: true,
        }
    }
}

/// Stale-run grace: the larger of the heartbeat grace window and the shift
/// window, per `SPEC_FULL.md` §9's resolved Open Question.
impl ExecutionConfig {
    pub fn stale_run_grace_seconds(&self) -> u64 {
        self.heartbeat_grace_seconds.max(self.shift_minutes * 60)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub kind: WorkerKind,
    pub codex: CodexWorkerConfig,
    pub ollama: OllamaWorkerConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: WorkerKind::CodexSubprocess,
            codex: CodexWorkerConfig::default(),
            ollama: OllamaWorkerConfig::default(),
        }
    }
}

/// Agentic subprocess worker: a CLI tool invoked with a prompt argument that
/// writes progress snapshots to a run-scoped file.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CodexWorkerConfig {
    pub binary: String,
    pub model: Option<String>,
}

impl Default for CodexWorkerConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            model: None,
        }
    }
}

impl CodexWorkerConfig {
    pub fn build_args(&self, prompt: &str, run_id: &str, progress_path: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];
        if let Some(m) = &self.model {
            args.push("--model".to_string());
            args.push(m.clone());
        }
        args.push("--run-id".to_string());
        args.push(run_id.to_string());
        args.push("--progress-file".to_string());
        args.push(progress_path.to_string());
        args.push(prompt.to_string());
        args
    }

    pub fn version_args(&self) -> Vec<&str> {
        vec!["--version"]
    }

    pub fn install_hint(&self) -> &str {
        "Install a Codex-compatible CLI and set worker.codex.binary accordingly"
    }
}

/// Non-agentic HTTP worker: a streaming JSON endpoint (`{model, prompt,
/// stream:true, options?}` in, newline-delimited `{response, done}` chunks
/// out).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OllamaWorkerConfig {
    pub endpoint: String,
    pub model: String,
}

impl Default for OllamaWorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "llama3".to_string(),
        }
    }
}

pub fn validate(config: &RunnerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.execution.max_concurrent < 1 {
        errors.push("execution.max_concurrent must be >= 1".to_string());
    }
    if config.execution.heartbeat_seconds == 0 {
        errors.push("execution.heartbeat_seconds must be > 0".to_string());
    }
    if config.execution.heartbeat_grace_seconds < config.execution.heartbeat_seconds {
        errors.push(
            "execution.heartbeat_grace_seconds must be >= execution.heartbeat_seconds"
                .to_string(),
        );
    }
    if config.execution.shift_minutes == 0 {
        errors.push("execution.shift_minutes must be > 0".to_string());
    }
    if config.guardrails.test_command.trim().is_empty() {
        errors.push("guardrails.test_command must not be empty".to_string());
    }
    if config.project.state_dir.trim().is_empty() {
        errors.push("project.state_dir must not be empty".to_string());
    }

    if let Some(ref model) = config.worker.codex.model {
        let is_valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
        if !is_valid {
            errors.push(
                "worker.codex.model contains invalid characters (allowed: alphanumeric, '.', '_', '/', '-')"
                    .to_string(),
            );
        } else if model.starts_with('-') {
            errors.push(
                "worker.codex.model must not start with '-' (flag-like values are rejected)"
                    .to_string(),
            );
        }
    }

    let caps = &config.attempt_caps;
    for (name, value) in [
        ("worker", caps.worker),
        ("plan", caps.plan),
        ("no_progress", caps.no_progress),
        ("test_fail", caps.test_fail),
        ("review_gen", caps.review_gen),
        ("review_fix", caps.review_fix),
        ("allowlist_expansion", caps.allowlist_expansion),
    ] {
        if value == 0 {
            errors.push(format!("attempt_caps.{name} must be >= 1"));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Load config from an explicit path (if provided) or fall back to
/// `{project_root}/taskforge.toml`.
///
/// When `config_path` is `Some`, the file MUST exist. When `None`, delegates
/// to [`load_config`] which returns defaults if the file is missing.
pub fn load_config_from(
    config_path: Option<&Path>,
    project_root: &Path,
) -> Result<RunnerConfig, String> {
    match config_path {
        Some(path) => load_config_at(path),
        None => load_config(project_root),
    }
}

fn load_config_at(path: &Path) -> Result<RunnerConfig, String> {
    if !path.exists() {
        return Err(format!("Config file not found: {}", path.display()));
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let config: RunnerConfig = toml::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    validate(&config).map_err(|errors| format_errors(&errors))?;

    Ok(config)
}

pub fn load_config(project_root: &Path) -> Result<RunnerConfig, String> {
    let config_path = project_root.join("taskforge.toml");

    if !config_path.exists() {
        return Ok(RunnerConfig::default());
    }

    load_config_at(&config_path)
}

fn format_errors(errors: &[String]) -> String {
    format!(
        "Config validation failed:\n{}",
        errors
            .iter()
            .map(|e| format!("  - {}", e))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
