use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

use vibetrees::api::{self, AppState};
use vibetrees::compose::ComposeInspector;
use vibetrees::config::{Config, ConfigOverrides};
use vibetrees::diagnostics::{DiagnosticRunner, Importer};
use vibetrees::git::sync::SyncManager;
use vibetrees::git::{GitDriver, GitOperations};
use vibetrees::lifecycle::{ComposeRuntime, RuntimeBackend, WorktreeLifecycle};
use vibetrees::ports::PortRegistry;
use vibetrees::progress::ProgressBus;
use vibetrees::pty::{LogStreamerManager, PtySessionManager};
use vibetrees::utils;
use vibetrees::validate::SecretSanitizer;
use vibetrees::worktree::Worktree;

/// Command variants a PTY may be spawned as (§4.V "Executable for PTY").
const PTY_ALLOWLIST: &[&str] = &["shell", "claude", "codex"];
/// Ring buffer size for [`SecretSanitizer`]'s recent-detections log.
const SANITIZER_RING_CAPACITY: usize = 256;
/// Default HTTP/WS bind address for `vibetrees serve`.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4317";

#[derive(Parser)]
#[command(name = "vibetrees")]
#[command(version)]
#[command(about = "Run many git branches in parallel as isolated worktree environments")]
#[command(long_about = "\
vibetrees materializes one isolated, fully running environment per git branch:
a checked-out worktree, a private set of container services, a private port
allocation, a per-worktree .env file, and live PTY sessions (shells and AI
coding assistants) attached to it. Many worktrees run concurrently on one
workstation without port or project-name collisions.

`vibetrees serve` runs the control-plane daemon; the browser UI and the thin
one-shot subcommands below (`status`, `ports`) both talk to it.")]
#[command(after_long_help = "\
FILE LOCATIONS:
    ~/.vibetrees/                    Base directory for daemon state
    ~/.vibetrees/logs/                Daily-rotating JSON log files
    ~/.vibetrees/control.sock         Unix socket for CLI <-> daemon IPC
    <project-root>/.worktrees/        Worktree checkouts
    <project-root>/.vibetrees/config.toml       Project-scoped config
    <project-root>/.vibetrees/port-registry.json Host port allocations

ENVIRONMENT VARIABLES:
    RUST_LOG                    Log level filter (default: vibetrees=info)
    VIBETREES_HOME              Override ~/.vibetrees
    VIBETREES_BASE_BRANCH, VIBETREES_COMPOSE_FILE, VIBETREES_PORT_REGISTRY_PATH,
    VIBETREES_LOG_LEVEL, VIBETREES_CONTAINER_RUNTIME, VIBETREES_PTY_SCROLLBACK_CAP,
    VIBETREES_ORPHAN_SWEEP_INTERVAL_SECS, VIBETREES_ENABLE_AUTO_RECONCILE,
    VIBETREES_ENABLE_DB_SEED_COPY, VIBETREES_ENABLE_AI_ASSISTANT_CONFIG")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-plane daemon
    ///
    /// Binds the Control API (HTTP + WebSocket) on `--bind-addr` for the
    /// browser UI, and additionally on the Unix control socket for the
    /// `status`/`ports` subcommands.
    Serve {
        /// Root of the git repository being branched.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Address the Control API listens on.
        #[arg(long)]
        bind_addr: Option<String>,
        /// Override the base branch staleness/sync checks compare against.
        #[arg(long)]
        base_branch: Option<String>,
        /// Override the compose file location.
        #[arg(long)]
        compose_file: Option<PathBuf>,
        /// Override the port registry file location.
        #[arg(long)]
        port_registry: Option<PathBuf>,
        /// Override the `tracing` `EnvFilter` directive.
        #[arg(long)]
        log_level: Option<String>,
        /// Container runtime CLI to shell out to (`docker`, `podman`, ...).
        #[arg(long)]
        runtime: Option<String>,
    },
    /// Run environment health checks once and print findings
    Diagnose {
        /// Root of the git repository being branched.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Apply the auto-fix for this finding id, instead of just reporting.
        #[arg(long)]
        fix: Option<String>,
    },
    /// List or adopt orphaned worktree directories
    Import {
        /// Root of the git repository being branched.
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Directory name under `.worktrees/` to adopt. Omit to list
        /// candidates instead.
        name: Option<String>,
    },
    /// Show every worktree's lifecycle and git status, via the running daemon
    Status,
    /// Show every worktree's allocated ports, via the running daemon
    Ports,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { project_root, bind_addr, base_branch, compose_file, port_registry, log_level, runtime } => {
            initialize_daemon_logging(log_level.as_deref())?;
            let overrides = ConfigOverrides {
                base_branch,
                compose_file,
                port_registry_path: port_registry,
                log_level,
                container_runtime: runtime,
            };
            serve(&project_root, &overrides, bind_addr.as_deref().unwrap_or(DEFAULT_BIND_ADDR)).await
        }
        Commands::Diagnose { project_root, fix } => {
            initialize_cli_logging();
            diagnose(&project_root, fix.as_deref()).await
        }
        Commands::Import { project_root, name } => {
            initialize_cli_logging();
            import(&project_root, name.as_deref()).await
        }
        Commands::Status => {
            initialize_cli_logging();
            let worktrees: Vec<Worktree> = utils::ipc::get_json("/api/worktrees").await?;
            print_status_table(&worktrees);
            Ok(())
        }
        Commands::Ports => {
            initialize_cli_logging();
            let worktrees: Vec<Worktree> = utils::ipc::get_json("/api/worktrees").await?;
            print_ports_table(&worktrees);
            Ok(())
        }
    }
}

fn print_status_table(worktrees: &[Worktree]) {
    println!("{:<24} {:<12} {:<12} {:>6} {:>6}", "NAME", "STATE", "GIT", "AHEAD", "BEHIND");
    for wt in worktrees {
        println!(
            "{:<24} {:<12?} {:<12?} {:>6} {:>6}",
            wt.name, wt.state, wt.git_status, wt.ahead, wt.behind
        );
    }
}

fn print_ports_table(worktrees: &[Worktree]) {
    println!("{:<24} {:<20} {:>6}", "NAME", "SERVICE", "PORT");
    for wt in worktrees {
        if wt.ports.is_empty() {
            println!("{:<24} {:<20} {:>6}", wt.name, "-", "-");
            continue;
        }
        for (service, port) in &wt.ports {
            println!("{:<24} {:<20} {:>6}", wt.name, service, port);
        }
    }
}

/// Builds every core component for `project_root` and returns the shared
/// [`AppState`] (plus a handle to the PTY manager, for background tasks).
async fn build_state(project_root: &PathBuf, overrides: &ConfigOverrides) -> anyhow::Result<(AppState, Arc<PtySessionManager>)> {
    let project_root = project_root.canonicalize().unwrap_or_else(|_| project_root.clone());
    let config = Config::load(&project_root, overrides)?;

    let git: Arc<dyn GitOperations> = Arc::new(GitDriver);
    let runtime: Arc<dyn RuntimeBackend> = Arc::new(ComposeRuntime::new(config.container_runtime.clone()));
    let ports = Arc::new(PortRegistry::load(config.port_registry_path.clone()).await?);
    let compose = Arc::new(ComposeInspector::new(config.container_runtime.clone()));
    let bus = Arc::new(ProgressBus::new());
    let sanitizer = Arc::new(SecretSanitizer::new(SANITIZER_RING_CAPACITY));
    let sync = Arc::new(SyncManager::new(Arc::clone(&git)));
    let importer = Arc::new(Importer::new(Arc::clone(&git)));
    let diagnostics = Arc::new(DiagnosticRunner::new(Arc::clone(&git), Arc::clone(&ports), Arc::clone(&compose)));
    let pty = Arc::new(PtySessionManager::new(PTY_ALLOWLIST.to_vec()));
    let log_streamers = Arc::new(LogStreamerManager::new(config.container_runtime.clone()));

    let lifecycle = Arc::new(WorktreeLifecycle::new(
        config.clone(),
        Arc::clone(&git),
        Arc::clone(&runtime),
        Arc::clone(&ports),
        Arc::clone(&compose),
        Arc::clone(&bus),
        Arc::clone(&sanitizer),
    ));

    if config.feature_flags.enable_auto_reconcile {
        let registered: Vec<String> =
            git.list_worktrees().await?.into_iter().map(|(branch, _)| utils::slugify(&branch)).collect();
        if let Err(err) = ports.sync_from(&registered).await {
            tracing::warn!(%err, "startup port-registry reconciliation failed");
        }
    }

    let state = AppState { lifecycle, git, sync, compose, pty: Arc::clone(&pty), log_streamers, bus, importer, diagnostics, sanitizer, config };
    Ok((state, pty))
}

async fn serve(project_root: &PathBuf, overrides: &ConfigOverrides, bind_addr: &str) -> anyhow::Result<()> {
    let (state, pty) = build_state(project_root, overrides).await?;

    tokio::spawn(Arc::clone(&pty).run_orphan_sweeper());
    tokio::spawn(Arc::clone(&pty).run_autosave());

    let router = api::router(state);

    let socket_path = utils::paths::control_socket_path();
    if socket_path.exists() {
        tokio::fs::remove_file(&socket_path).await?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let unix_listener = tokio::net::UnixListener::bind(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), "control socket listening");

    let tcp_listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = bind_addr, "control API listening");

    tokio::try_join!(axum::serve(tcp_listener, router.clone()), axum::serve(unix_listener, router))?;
    Ok(())
}

async fn diagnose(project_root: &PathBuf, fix: Option<&str>) -> anyhow::Result<()> {
    let (state, _pty) = build_state(project_root, &ConfigOverrides::default()).await?;

    if let Some(id) = fix {
        let outcome = state.diagnostics.auto_fix(id, &state.config).await?;
        println!("{}: {}", outcome.id, if outcome.fixed { "fixed" } else { "not fixed" });
        println!("{}", outcome.message);
        return Ok(());
    }

    let findings = state.diagnostics.run_all(&state.config).await;
    if findings.is_empty() {
        println!("no findings");
        return Ok(());
    }
    for finding in &findings {
        let marker = if finding.autofixable { " (autofixable)" } else { "" };
        println!("[{:?}] {}: {}{}", finding.severity, finding.id, finding.message, marker);
    }
    Ok(())
}

async fn import(project_root: &PathBuf, name: Option<&str>) -> anyhow::Result<()> {
    let (state, _pty) = build_state(project_root, &ConfigOverrides::default()).await?;

    let Some(name) = name else {
        let candidates = state.importer.scan(&state.config).await?;
        if candidates.is_empty() {
            println!("no unregistered worktree directories found");
            return Ok(());
        }
        for candidate in &candidates {
            println!("{}\t{}", candidate.name, candidate.branch.as_deref().unwrap_or("-"));
        }
        return Ok(());
    };

    let worktree = state.importer.import(name, &state.config, &state.lifecycle).await?;
    println!("imported {} ({})", worktree.name, worktree.branch);
    Ok(())
}

/// Console-only logging for one-shot CLI commands (§10.1).
fn initialize_cli_logging() {
    let env_filter = tracing_subscriber::EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(|_| "vibetrees=warn".into()));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(env_filter))
        .init();
}

/// Full daemon logging: a human-readable stderr layer plus a daily-rotating
/// newline-delimited-JSON file layer under `~/.vibetrees/logs/` (§10.1).
fn initialize_daemon_logging(override_level: Option<&str>) -> anyhow::Result<()> {
    let logs_dir = utils::paths::logs_dir();
    std::fs::create_dir_all(&logs_dir)?;

    let directive = override_level.map(str::to_owned).or_else(|| std::env::var("RUST_LOG").ok()).unwrap_or_else(|| "vibetrees=info".into());

    let stderr_filter = tracing_subscriber::EnvFilter::new(&directive);
    let file_filter = tracing_subscriber::EnvFilter::new(&directive);
    let file_appender = tracing_appender::rolling::daily(&logs_dir, "vibetrees.log");

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_filter(stderr_filter))
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_appender).with_filter(file_filter))
        .init();

    Ok(())
}
