use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use taskforge::agent::{install_signal_handlers, kill_all_children, CodexSubprocessDispatcher, OllamaHttpDispatcher};
use taskforge::config::{self, RunnerConfig};
use taskforge::fsm;
use taskforge::fsm_executor::{PhaseExecutor, Worker};
use taskforge::git::GitCoordinator;
use taskforge::lock;
use taskforge::log::parse_log_level;
use taskforge::orchestrator::{select_next_task, Orchestrator};
use taskforge::scheduler::PhaseScheduler;
use taskforge::store::StateStore;
use taskforge::types::{Lifecycle, Step, TaskType, WorkerKind};
use taskforge::{log_error, log_info, log_warn};

#[derive(Parser)]
#[command(name = "taskforge", about = "Autonomous coding-agent orchestrator")]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/taskforge.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the task queue to completion (or idle/blocked)
    Run {
        /// Stop after this many iterations (default: unbounded)
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Skip the manual resume-most-recently-blocked-task step
        #[arg(long)]
        no_resume_blocked: bool,
        /// Run phases concurrently via the phase scheduler instead of the
        /// single-threaded serial loop
        #[arg(long)]
        parallel: bool,
    },
    /// Print run state and a task-lifecycle summary
    Status,
    /// List every task with its phase, step, and lifecycle
    List,
    /// Resume a `waiting_human` task at its blocked step
    Resume {
        task_id: String,
    },
    /// Resume a `waiting_human` task and reset its attempt counters
    Retry {
        task_id: String,
    },
    /// Force a task to re-run a specific step
    RerunStep {
        task_id: String,
        #[arg(long)]
        step: String,
    },
    /// Force a task past a specific step without running it
    SkipStep {
        task_id: String,
        #[arg(long)]
        step: String,
    },
    /// Show which task would run next without executing it
    DryRun,
    /// Verify the configured worker is reachable
    Doctor,
    /// Dispatch a single one-off prompt through the configured worker
    Exec {
        prompt: String,
    },
}

fn parse_step(s: &str) -> Result<Step, String> {
    match s {
        "plan_impl" => Ok(Step::PlanImpl),
        "implement" => Ok(Step::Implement),
        "verify" => Ok(Step::Verify),
        "review" => Ok(Step::Review),
        "commit" => Ok(Step::Commit),
        other => Err(format!(
            "unknown step '{other}' (expected plan_impl, implement, verify, review, or commit)"
        )),
    }
}

fn make_worker(config: &RunnerConfig) -> Worker {
    match config.worker.kind {
        WorkerKind::CodexSubprocess => Worker::Codex(CodexSubprocessDispatcher::new(config.worker.codex.clone())),
        WorkerKind::OllamaHttp => Worker::Ollama(OllamaHttpDispatcher::new(config.worker.ollama.clone())),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    taskforge::log::set_log_level(log_level);

    if let Err(e) = install_signal_handlers() {
        log_warn!("failed to install signal handlers: {}", e);
    }

    let root = match cli.root.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            log_error!("project root {} does not exist: {}", cli.root.display(), e);
            std::process::exit(1);
        }
    };

    let config = match config::load_config_from(cli.config.as_deref(), &root) {
        Ok(c) => c,
        Err(e) => {
            log_error!("{}", e);
            std::process::exit(1);
        }
    };

    let state_dir = root.join(&config.project.state_dir);
    let store = Arc::new(StateStore::new(state_dir.as_path()));
    if let Err(e) = store.init() {
        log_error!("failed to initialize state directory: {}", e);
        std::process::exit(2);
    }

    let exit_code = match cli.command {
        Commands::Run { max_iterations, no_resume_blocked, parallel } => {
            run_command(&root, &config, store, max_iterations, !no_resume_blocked, parallel).await
        }
        Commands::Status => status_command(&store),
        Commands::List => list_command(&store),
        Commands::Resume { task_id } => resume_command(&store, &task_id, false),
        Commands::Retry { task_id } => resume_command(&store, &task_id, true),
        Commands::RerunStep { task_id, step } => force_step_command(&store, &task_id, &step),
        Commands::SkipStep { task_id, step } => force_step_command(&store, &task_id, &step),
        Commands::DryRun => dry_run_command(&store),
        Commands::Doctor => doctor_command(&config),
        Commands::Exec { prompt } => exec_command(&store, &config, &prompt).await,
    };

    kill_all_children();
    std::process::exit(exit_code);
}

async fn run_command(
    root: &std::path::Path,
    config: &RunnerConfig,
    store: Arc<StateStore>,
    max_iterations: Option<u32>,
    resume_blocked: bool,
    parallel: bool,
) -> i32 {
    let _lock = match lock::try_acquire_runner_lock(&store.state_dir()) {
        Ok(guard) => guard,
        Err(e) => {
            log_error!("{}", e);
            return 2;
        }
    };

    let git = GitCoordinator::new();

    if parallel {
        let scheduler = PhaseScheduler::new(store.clone(), git, config.clone(), root.to_path_buf());
        let config = config.clone();
        match scheduler.run(move || make_worker(&config)).await {
            Ok(results) => {
                let failed: Vec<&str> = results.iter().filter(|r| !r.success).map(|r| r.phase_id.as_str()).collect();
                if failed.is_empty() {
                    log_info!("all phases completed");
                    0
                } else {
                    log_warn!("phases with unresolved failures: {}", failed.join(", "));
                    2
                }
            }
            Err(e) => {
                log_error!("{}", e);
                2
            }
        }
    } else {
        let worker = make_worker(config);
        let executor = PhaseExecutor::new(store, git, worker, config.clone(), root.to_path_buf());
        let orchestrator = Orchestrator::new(executor);
        match orchestrator.run(max_iterations, resume_blocked).await {
            Ok(()) => 0,
            Err(e) => {
                log_error!("{}", e);
                2
            }
        }
    }
}

fn status_command(store: &StateStore) -> i32 {
    let run_state = match store.read_run_state() {
        Ok(s) => s,
        Err(e) => {
            log_error!("{}", e);
            return 2;
        }
    };
    let queue = match store.read_task_queue() {
        Ok(q) => q,
        Err(e) => {
            log_error!("{}", e);
            return 2;
        }
    };

    println!("status: {:?}", run_state.status);
    println!("current task: {}", run_state.current_task_id.as_deref().unwrap_or("-"));
    println!("current phase: {}", run_state.current_phase_id.as_deref().unwrap_or("-"));
    println!("last run id: {}", run_state.last_run_id.as_deref().unwrap_or("-"));

    let mut ready = 0;
    let mut running = 0;
    let mut done = 0;
    let mut waiting_human = 0;
    for task in &queue.tasks {
        match task.lifecycle {
            Lifecycle::Ready => ready += 1,
            Lifecycle::Running => running += 1,
            Lifecycle::Done => done += 1,
            Lifecycle::WaitingHuman => waiting_human += 1,
            Lifecycle::Cancelled => {}
        }
    }
    println!(
        "tasks: {} ready, {} running, {} done, {} waiting_human ({} total)",
        ready,
        running,
        done,
        waiting_human,
        queue.tasks.len()
    );

    if waiting_human > 0 {
        println!("\nblocked tasks:");
        for task in queue.tasks.iter().filter(|t| t.lifecycle == Lifecycle::WaitingHuman) {
            println!(
                "  {} step={} reason={:?} error={}",
                task.id,
                task.step,
                task.block_reason,
                task.last_error.as_deref().unwrap_or("-")
            );
        }
    }

    0
}

fn list_command(store: &StateStore) -> i32 {
    let queue = match store.read_task_queue() {
        Ok(q) => q,
        Err(e) => {
            log_error!("{}", e);
            return 2;
        }
    };

    for task in &queue.tasks {
        println!(
            "{}\tphase={}\tstep={}\tlifecycle={}",
            task.id,
            task.phase_id.as_deref().unwrap_or("-"),
            task.step,
            task.lifecycle
        );
    }
    0
}

fn resume_command(store: &StateStore, task_id: &str, reset_attempts: bool) -> i32 {
    let outcome = store.task_queue_transaction(|queue| -> Result<(), String> {
        let idx = queue
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| format!("no such task: {task_id}"))?;
        let mut resumed = fsm::resume(&queue.tasks[idx])?;
        if reset_attempts {
            resumed.attempts = Default::default();
        }
        queue.tasks[idx] = resumed;
        Ok(())
    });

    match outcome {
        Ok(Ok(())) => {
            log_info!("resumed task {}", task_id);
            0
        }
        Ok(Err(e)) => {
            log_error!("{}", e);
            1
        }
        Err(e) => {
            log_error!("{}", e);
            2
        }
    }
}

fn force_step_command(store: &StateStore, task_id: &str, step: &str) -> i32 {
    let step = match parse_step(step) {
        Ok(s) => s,
        Err(e) => {
            log_error!("{}", e);
            return 1;
        }
    };

    let outcome = store.task_queue_transaction(|queue| -> Result<(), String> {
        let task = queue
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| format!("no such task: {task_id}"))?;
        task.step = step;
        task.lifecycle = Lifecycle::Ready;
        task.block_reason = None;
        task.blocked_intent = None;
        Ok(())
    });

    match outcome {
        Ok(Ok(())) => {
            log_info!("task {} set to step={}", task_id, step);
            0
        }
        Ok(Err(e)) => {
            log_error!("{}", e);
            1
        }
        Err(e) => {
            log_error!("{}", e);
            2
        }
    }
}

fn dry_run_command(store: &StateStore) -> i32 {
    let queue = match store.read_task_queue() {
        Ok(q) => q,
        Err(e) => {
            log_error!("{}", e);
            return 2;
        }
    };

    match select_next_task(&queue.tasks) {
        Some(task_id) => {
            let task = queue.tasks.iter().find(|t| t.id == task_id).unwrap();
            let label = if task.task_type == TaskType::Plan { "plan" } else { "implement" };
            println!(
                "next: {} ({}) phase={} step={}",
                task_id,
                label,
                task.phase_id.as_deref().unwrap_or("-"),
                task.step
            );
        }
        None => println!("no runnable task"),
    }
    0
}

fn doctor_command(config: &RunnerConfig) -> i32 {
    match config.worker.kind {
        WorkerKind::CodexSubprocess => {
            let dispatcher = CodexSubprocessDispatcher::new(config.worker.codex.clone());
            match dispatcher.verify_available() {
                Ok(()) => {
                    println!("codex worker ok: {}", config.worker.codex.binary);
                    0
                }
                Err(e) => {
                    log_error!("{}", e);
                    2
                }
            }
        }
        WorkerKind::OllamaHttp => {
            println!(
                "ollama worker configured: endpoint={} model={}",
                config.worker.ollama.endpoint, config.worker.ollama.model
            );
            println!("(reachability is checked on first dispatch; no standalone probe for ollama yet)");
            0
        }
    }
}

async fn exec_command(store: &StateStore, config: &RunnerConfig, prompt: &str) -> i32 {
    let worker = make_worker(config);
    let run_id = format!("exec-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"));
    let run_dir = store.run_dir(&run_id);
    if let Err(e) = std::fs::create_dir_all(&run_dir) {
        log_error!("failed to create run directory: {}", e);
        return 2;
    }
    let progress_path = run_dir.join("progress.json");

    let outcome = worker
        .dispatch(
            prompt,
            &run_id,
            &run_dir,
            &progress_path,
            std::time::Duration::from_secs(config.execution.shift_minutes * 60),
            config.execution.heartbeat_seconds,
            config.execution.heartbeat_grace_seconds,
        )
        .await;

    match outcome {
        Ok(outcome) if outcome.succeeded() => {
            println!("{}", outcome.response_text);
            0
        }
        Ok(outcome) => {
            log_error!("worker did not succeed (exit_code={})", outcome.exit_code);
            2
        }
        Err(e) => {
            log_error!("{}", e);
            2
        }
    }
}
