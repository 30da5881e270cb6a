use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use skiff_engine::bus::EventBus;
use skiff_engine::gate::PermissionGate;
use skiff_engine::registry::ToolRegistry;
use skiff_engine::sandbox::SandboxFs;
use skiff_store::context::ContextRepo;
use skiff_store::files::FileRepo;
use skiff_store::sessions::SessionRepo;
use skiff_store::turns::TurnRepo;
use skiff_store::Database;

use crate::auth;
use crate::handlers;
use crate::orchestrator::Orchestrator;
use crate::sse;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub heartbeat: Duration,
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4096,
            heartbeat: Duration::from_secs(15),
            auth_token: None,
        }
    }
}

/// Process-wide runtime handed to every handler. Constructed once at
/// startup; no hidden globals.
pub struct AppState {
    pub sessions: SessionRepo,
    pub turns: TurnRepo,
    pub files: FileRepo,
    pub context: ContextRepo,
    pub bus: Arc<EventBus>,
    pub gate: Arc<PermissionGate>,
    pub registry: Arc<ToolRegistry>,
    pub sandbox: Arc<SandboxFs>,
    pub orchestrator: Arc<Orchestrator>,
    pub config: ServerConfig,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        gate: Arc<PermissionGate>,
        registry: Arc<ToolRegistry>,
        sandbox: Arc<SandboxFs>,
        orchestrator: Arc<Orchestrator>,
        config: ServerConfig,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            turns: TurnRepo::new(db.clone()),
            files: FileRepo::new(db.clone()),
            context: ContextRepo::new(db),
            bus,
            gate,
            registry,
            sandbox,
            orchestrator,
            config,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/sessions/{id}",
            get(handlers::get_session)
                .patch(handlers::patch_session)
                .delete(handlers::delete_session),
        )
        .route(
            "/sessions/{id}/settings",
            put(handlers::put_settings).delete(handlers::delete_settings),
        )
        .route(
            "/sessions/{id}/turns",
            post(handlers::create_turn).get(handlers::list_turns),
        )
        .route("/sessions/{id}/cancel", post(handlers::cancel_turn))
        .route("/sessions/{id}/events", get(handlers::list_events))
        .route(
            "/sessions/{id}/permissions/pending",
            get(handlers::pending_permissions),
        )
        .route("/sessions/{id}/fs/tree", get(handlers::fs_tree))
        .route("/sessions/{id}/fs/read", get(handlers::fs_read))
        .route("/sessions/{id}/fs/versions", get(handlers::fs_versions))
        .route(
            "/sessions/{id}/fs/version/{version_id}",
            get(handlers::fs_get_version),
        )
        .route("/sessions/{id}/fs/rollback", post(handlers::fs_rollback))
        .route(
            "/sessions/{id}/file_changes",
            get(handlers::list_file_changes),
        )
        .route("/sessions/{id}/context", get(handlers::list_context))
        .route("/sessions/{id}/context/pin", post(handlers::pin_context))
        .route("/sessions/{id}/context/unpin", post(handlers::unpin_context))
        .route(
            "/sessions/{id}/context/set_pinned_ref",
            post(handlers::set_pinned_ref),
        )
        .route("/sessions/{id}/export.json", get(handlers::export_json))
        .route("/sessions/{id}/export.md", get(handlers::export_markdown))
        .route("/turns/{id}/steps", get(handlers::list_steps))
        .route("/permissions/mode", get(handlers::get_permission_mode).put(handlers::put_permission_mode))
        .route(
            "/permissions/{id}/resolve",
            post(handlers::resolve_permission),
        )
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{name}/policy", put(handlers::put_tool_policy))
        .route("/event", get(sse::event_stream))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handle returned by `start()`. Call `shutdown()` to stop accepting new
/// connections, then `drain()` to wait for in-flight work.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    pub async fn drain(self) {
        let _ = self.server.await;
    }
}

pub async fn start(state: Arc<AppState>) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let router = build_router(state);
    let shutdown = CancellationToken::new();
    let shutdown_for_axum = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_axum.cancelled().await;
            })
            .await
            .ok();
    });

    info!(port = local_addr.port(), "server listening");

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}
