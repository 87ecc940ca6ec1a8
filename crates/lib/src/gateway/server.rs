//! Gateway HTTP server and bot runtime (sync loop, inbound processing, reload, shutdown).

use crate::config::{self, Config};
use crate::correlator::Correlator;
use crate::error::CorrelationError;
use crate::gateway::protocol::{DmRequest, DmResponse, ErrorBody};
use crate::init;
use crate::matrix::{
    message_content, start_sync, ChatClient, InboundMessage, MatrixClient, MessageKind,
};
use crate::session::{parse_dm_command, DirectSessions};
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub sessions: Arc<DirectSessions>,
    pub port: u16,
}

/// HTTP status for a failed request.
fn status_for(e: &CorrelationError) -> StatusCode {
    match e {
        CorrelationError::Unresponsive => StatusCode::GATEWAY_TIMEOUT,
        CorrelationError::Abandoned => StatusCode::SERVICE_UNAVAILABLE,
        CorrelationError::NoCounterpartConversation => StatusCode::NOT_FOUND,
        CorrelationError::Protocol(_) | CorrelationError::RemoteReportedFailure(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn error_response(e: &CorrelationError, channel: &str) -> Response {
    (status_for(e), Json(ErrorBody::from_error(e, channel))).into_response()
}

/// Checks `Authorization: Bearer <token>` against the configured tokens. No tokens = open.
async fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    let config = state.sessions.config().await;
    let tokens = config::resolve_gateway_tokens(&config);
    if tokens.is_empty() {
        return true;
    }
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("");
    !provided.is_empty() && tokens.iter().any(|t| t == provided)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized", "source": "bot" })),
    )
        .into_response()
}

/// Routes served by the gateway.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/dms", get(list_dms))
        .route("/dm", post(open_dm))
        .with_state(state)
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
    }))
}

/// GET /dms returns the bot's `m.direct` map.
async fn list_dms(State(state): State<GatewayState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized();
    }
    match state.sessions.list_direct_conversations().await {
        Ok(direct) => Json(direct).into_response(),
        Err(e) => error_response(&e, ""),
    }
}

/// POST /dm opens (or reuses) a bridged conversation and optionally sends a message into it.
async fn open_dm(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(req): Json<DmRequest>,
) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized();
    }
    let channel = match req.channel {
        Some(c) => c,
        None => state.sessions.default_channel().await,
    };
    match state
        .sessions
        .open_direct(&channel, &req.id, req.message.as_deref())
        .await
    {
        Ok(room) => Json(DmResponse { room }).into_response(),
        Err(e) => {
            log::info!("POST /dm {} on {} failed: {}", req.id, channel, e);
            error_response(&e, &channel)
        }
    }
}

/// Route one inbound room message: bridge notices go to the correlator, `!dm` commands from admins
/// are served in the background and answered in the same room.
async fn process_inbound_message(
    sessions: Arc<DirectSessions>,
    correlator: Arc<Correlator>,
    client: Arc<dyn ChatClient>,
    msg: InboundMessage,
) {
    match msg.kind {
        MessageKind::Notice => correlator.observe(&msg).await,
        MessageKind::Text => {
            let Some((remote_id, channel)) = parse_dm_command(&msg.body) else {
                return;
            };
            let config = sessions.config().await;
            if !config.admin_users.iter().any(|u| u == &msg.sender) {
                log::info!("ignoring !dm from non-admin {}", msg.sender);
                return;
            }
            let suppress = config.suppress_link_previews;
            // The bridge reply arrives on this same inbound stream, so never wait for it inline.
            tokio::spawn(async move {
                let channel = match channel {
                    Some(c) => c,
                    None => sessions.default_channel().await,
                };
                let reply = match sessions.open_direct(&channel, &remote_id, None).await {
                    Ok(room) => format!("opened {} for {}", room, remote_id),
                    Err(e) => format!("failed ({}): {}", e.source_for(&channel).as_str(), e),
                };
                if let Err(e) = client
                    .send_message(&msg.room_id, message_content(&reply, true, suppress))
                    .await
                {
                    log::warn!("!dm: reply to {} failed: {}", msg.room_id, e);
                }
            });
        }
        MessageKind::Other => {}
    }
}

/// Re-read the config file on SIGHUP and apply it to the running bot.
#[cfg(unix)]
fn spawn_reload_on_sighup(sessions: Arc<DirectSessions>, config_path: PathBuf) {
    tokio::spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("config reload on SIGHUP unavailable: {}", e);
                return;
            }
        };
        while hup.recv().await.is_some() {
            let loaded = config::load_config(Some(config_path.clone()));
            let result = match loaded {
                Ok((c, _)) => sessions.apply_config(c).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => log::info!(
                    "config reloaded from {} (matrix and gateway settings need a restart)",
                    config_path.display()
                ),
                Err(e) => log::warn!("config reload failed: {:#}", e),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_sighup(_sessions: Arc<DirectSessions>, _config_path: PathBuf) {}

/// Run the bot: Matrix sync loop, inbound processing, and the HTTP gateway on config.gateway.bind:port.
/// When bind is not loopback, at least one gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_bot(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::resolve_gateway_tokens(&config).is_empty() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.tokens or VAKSI_HTTP_TOKEN)",
            bind
        );
    }
    let token = config::resolve_matrix_token(&config).context(
        "matrix access token not configured (set matrix.accessToken or VAKSI_MATRIX_TOKEN)",
    )?;
    if config.matrix.user_id.trim().is_empty() {
        anyhow::bail!("matrix.userId is not configured");
    }
    let matrix = Arc::new(
        MatrixClient::new(&config.matrix.homeserver, config.matrix.user_id.trim(), token)
            .context("creating matrix client")?,
    );
    let correlator = Arc::new(Correlator::new(config.channel_routes()?));
    if config.bridges.is_empty() {
        log::warn!("no bridges configured; every /dm request will fail");
    }
    for (name, bridge) in &config.bridges {
        log::info!("bridge {}: trusting replies from {}", name, bridge.bot_user_id);
    }
    let client: Arc<dyn ChatClient> = matrix.clone();
    let sessions = Arc::new(DirectSessions::new(
        client.clone(),
        correlator.clone(),
        config.clone(),
    ));

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(64);
    let sync_handle = start_sync(matrix.clone(), config.matrix.sync_timeout_ms, inbound_tx);
    {
        let sessions = sessions.clone();
        let correlator = correlator.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                process_inbound_message(sessions.clone(), correlator.clone(), client.clone(), msg)
                    .await;
            }
        });
    }
    spawn_reload_on_sighup(sessions.clone(), config_path);

    let app = router(GatewayState {
        sessions,
        port: config.gateway.port,
    });
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(matrix, sync_handle))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Stops the sync loop and waits for its current long poll to finish.
async fn shutdown_signal(matrix: Arc<MatrixClient>, sync_handle: JoinHandle<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping sync loop");

    matrix.stop();
    let _ = sync_handle.await;
    log::info!("sync loop finished");
}
