use taskforge::config::{load_config, load_config_from};
use taskforge::types::WorkerKind;

#[test]
fn missing_config_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = load_config(dir.path()).expect("defaults on missing file");
    assert_eq!(config.worker.kind, WorkerKind::CodexSubprocess);
    assert_eq!(config.execution.max_concurrent, 1);
}

#[test]
fn custom_toml_overrides_selected_fields_only() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("taskforge.toml"),
        r#"
[execution]
max_concurrent = 4
stop_on_blocking_issues = false

[worker]
kind = "ollama-http"

[worker.ollama]
model = "mixtral"
"#,
    )
    .unwrap();

    let config = load_config(dir.path()).expect("parses");
    assert_eq!(config.execution.max_concurrent, 4);
    assert!(!config.execution.stop_on_blocking_issues);
    assert_eq!(config.worker.kind, WorkerKind::OllamaHttp);
    assert_eq!(config.worker.ollama.model, "mixtral");
    // Untouched sections keep their defaults
    assert_eq!(config.project.prd_path, "PRD.md");
    assert_eq!(config.worker.ollama.endpoint, "http://localhost:11434/api/generate");
}

#[test]
fn unknown_worker_field_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("taskforge.toml"),
        r#"
[worker.codex]
binary = "codex"
extra_unknown_field = "nope"
"#,
    )
    .unwrap();

    let err = load_config(dir.path()).unwrap_err();
    assert!(err.contains("Failed to parse"));
}

#[test]
fn explicit_config_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist.toml");
    let err = load_config_from(Some(&missing), dir.path()).unwrap_err();
    assert!(err.contains("not found"));
}

#[test]
fn invalid_execution_values_fail_validation_with_a_readable_message() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("taskforge.toml"),
        r#"
[execution]
max_concurrent = 0
heartbeat_seconds = 0
"#,
    )
    .unwrap();

    let err = load_config(dir.path()).unwrap_err();
    assert!(err.contains("max_concurrent"));
    assert!(err.contains("heartbeat_seconds"));
}
