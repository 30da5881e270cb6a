use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use skiff_core::provider::ModelStream;
use skiff_core::tools::{PermissionMode, Policy};
use skiff_engine::bus::EventBus;
use skiff_engine::context::ContextBuilder;
use skiff_engine::gate::PermissionGate;
use skiff_engine::registry::ToolRegistry;
use skiff_engine::runner::{RunnerConfig, TurnRunner};
use skiff_engine::sandbox::SandboxFs;
use skiff_engine::subagent::{SubagentConfig, SubagentRunner};
use skiff_engine::tools;
use skiff_engine::tools::subagent::SpawnSubagentTool;
use skiff_llm::UnconfiguredStream;
use skiff_server::{AppState, Orchestrator, ServerConfig};
use skiff_store::Database;

#[derive(Parser)]
#[command(name = "skiff", about = "Self-hosted agent server")]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 4096)]
    port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Path to the SQLite database file. Defaults to ./data/skiff.db.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Sandbox root for filesystem tools. Must exist.
    #[arg(long)]
    fs_root: PathBuf,

    /// Model identifier passed to the provider.
    #[arg(long, default_value = "default")]
    model: String,

    /// Global permission mode (ask, allow).
    #[arg(long)]
    permission_mode: Option<PermissionMode>,

    /// Fallback tool policy (deny, ask, allow) overriding per-tool defaults.
    #[arg(long)]
    default_policy: Option<Policy>,

    /// Shared bearer token required on write endpoints.
    #[arg(long)]
    auth_token: Option<String>,

    /// Brave Search API key for the search tool.
    #[arg(long)]
    search_api_key: Option<String>,

    /// SSE heartbeat interval in seconds.
    #[arg(long, default_value_t = 15)]
    heartbeat_secs: u64,

    /// Event fan-out queue capacity per subscriber.
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,

    /// Seconds before a pending permission request expires.
    #[arg(long, default_value_t = 120)]
    permission_timeout_secs: u64,

    /// Per-tool execution timeout in seconds.
    #[arg(long, default_value_t = 120)]
    tool_timeout_secs: u64,

    /// Maximum agent steps per turn.
    #[arg(long, default_value_t = 24)]
    max_steps: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("data").join("skiff.db"));
    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "failed to open database");
            return ExitCode::FAILURE;
        }
    };

    let sandbox = match SandboxFs::new(&args.fs_root) {
        Ok(fs) => Arc::new(fs),
        Err(e) => {
            tracing::error!(root = %args.fs_root.display(), error = %e, "invalid sandbox root");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(root = %sandbox.root().display(), "sandbox root resolved");

    let search_api_key = args
        .search_api_key
        .clone()
        .or_else(|| std::env::var("BRAVE_API_KEY").ok());

    // Provider wiring is external; until an adapter is configured the agent
    // answers every turn with a clear provider error.
    let provider: Arc<dyn ModelStream> = Arc::new(UnconfiguredStream);
    tracing::warn!("no model provider configured; agent turns will fail with a provider error");

    let mut base_registry = ToolRegistry::new();
    tools::register_builtin(&mut base_registry, Arc::clone(&sandbox), search_api_key);
    let base_registry = Arc::new(base_registry);

    let bus = Arc::new(EventBus::new(db.clone(), args.queue_capacity));
    let gate = Arc::new(
        PermissionGate::new(db.clone())
            .with_timeout(Duration::from_secs(args.permission_timeout_secs))
            .with_default_policy(args.default_policy),
    );
    if let Some(mode) = args.permission_mode {
        if let Err(e) = gate.repo().set_mode(mode) {
            tracing::error!(error = %e, "failed to apply permission mode");
            return ExitCode::FAILURE;
        }
    }

    let context = Arc::new(ContextBuilder::new(db.clone(), Arc::clone(&sandbox)));

    let subagent = Arc::new(SubagentRunner::new(
        Arc::clone(&provider),
        Arc::clone(&base_registry),
        Arc::clone(&gate),
        Arc::clone(&bus),
        Arc::clone(&context),
        db.clone(),
        SubagentConfig {
            model: args.model.clone(),
            ..Default::default()
        },
    ));

    // Full registry = builtin tools plus the sub-agent spawner.
    let mut registry = base_registry.subset(&base_registry.names());
    registry.register(Arc::new(SpawnSubagentTool::new(subagent)));
    let registry = Arc::new(registry);

    let runner = Arc::new(TurnRunner::new(
        provider,
        Arc::clone(&registry),
        Arc::clone(&gate),
        Arc::clone(&bus),
        context,
        db.clone(),
        RunnerConfig {
            model: args.model.clone(),
            max_steps_per_turn: args.max_steps,
            tool_timeout: Duration::from_secs(args.tool_timeout_secs),
        },
    ));
    let orchestrator = Arc::new(Orchestrator::new(runner, db.clone()));

    let state = Arc::new(AppState::new(
        db,
        bus,
        gate,
        registry,
        sandbox,
        Arc::clone(&orchestrator),
        ServerConfig {
            port: args.port,
            heartbeat: Duration::from_secs(args.heartbeat_secs),
            auth_token: args.auth_token.clone(),
        },
    ));

    let handle = match skiff_server::start(state).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(port = handle.port, "skiff ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received");

    let cancelled = orchestrator.abort_all();
    if cancelled > 0 {
        tracing::info!(cancelled, "cancelled active turns");
    }

    handle.shutdown();
    if tokio::time::timeout(Duration::from_secs(10), handle.drain())
        .await
        .is_err()
    {
        tracing::warn!("server drain timed out after 10s");
    }

    tracing::info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_default_values() {
        let args = Args::parse_from(["skiff", "--fs-root", "/tmp"]);
        assert_eq!(args.port, 4096);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.model, "default");
        assert!(args.db_path.is_none());
        assert!(args.auth_token.is_none());
        assert_eq!(args.heartbeat_secs, 15);
    }

    #[test]
    fn cli_parses_overrides() {
        let args = Args::parse_from([
            "skiff",
            "--fs-root",
            "/workspace",
            "--port",
            "8080",
            "--permission-mode",
            "allow",
            "--default-policy",
            "deny",
            "--db-path",
            "/tmp/test.db",
        ]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.fs_root, PathBuf::from("/workspace"));
        assert_eq!(args.permission_mode, Some(PermissionMode::Allow));
        assert_eq!(args.default_policy, Some(Policy::Deny));
        assert_eq!(args.db_path, Some(PathBuf::from("/tmp/test.db")));
    }

    #[test]
    fn cli_requires_fs_root() {
        assert!(Args::try_parse_from(["skiff"]).is_err());
    }
}
