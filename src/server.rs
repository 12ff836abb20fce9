//! HTTP control and telemetry surface.
//!
//! Exposes the connection manager and distributor to remote clients:
//!
//! - `GET /status`: connection/acquisition status projection
//! - `GET /scan_data`: most recent scan summary
//! - `POST /connect`, `POST /disconnect`: lifecycle control
//! - `POST /start_acquisition`, `POST /stop_acquisition`: acquisition control
//! - `GET /events`: SSE stream of `scan_data` events
//! - `GET /ws`: websocket stream of the same payloads
//!
//! Every response is a JSON envelope `{success, ..., timestamp}`; failures
//! carry a human-readable `error` string and never cross the boundary as
//! panics. Each streaming client gets its own throttled distributor
//! subscription, detached when the client goes away.

use crate::connection::ConnectionManager;
use crate::core::ScanSummary;
use crate::distributor::{LatestScanCache, ScanDistributor};
use crate::error::{AppResult, BridgeError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Shared handles behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Connection state machine.
    pub connection: Arc<ConnectionManager>,
    /// Telemetry distributor feeding the streaming endpoints.
    pub distributor: Arc<ScanDistributor>,
    /// In-process subscriber backing `GET /scan_data`.
    pub latest: Arc<LatestScanCache>,
}

/// Typed websocket message, tagged for client-side dispatch.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum WsMessage {
    ScanData(ScanSummary),
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/scan_data", get(scan_data))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/start_acquisition", post(start_acquisition))
        .route("/stop_acquisition", post(stop_acquisition))
        .route("/events", get(events))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    bind: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> AppResult<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("HTTP server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let status = state.connection.status();
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "status": {
                "instrument_connected": status.instrument_connected,
                "online_access": status.online_access,
                "acquisition_active": status.acquisition_active,
                "connection_state": status.connection_state,
                "timestamp": Utc::now(),
            },
        })),
    )
}

async fn scan_data(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.latest.latest() {
        Some(summary) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "scan_data": &*summary,
                "timestamp": Utc::now(),
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "No data available",
                "timestamp": Utc::now(),
            })),
        ),
    }
}

async fn connect(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    respond(state.connection.connect().await, "Connected to instrument")
}

async fn disconnect(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    respond(
        state.connection.disconnect().await,
        "Disconnected from instrument",
    )
}

async fn start_acquisition(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    respond(
        state.connection.start_acquisition().await,
        "Acquisition started",
    )
}

async fn stop_acquisition(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    respond(
        state.connection.stop_acquisition().await,
        "Acquisition stopped",
    )
}

/// SSE stream of `scan_data` events, one distributor subscription per
/// client. Keep-alive comments flow while no scans arrive.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.distributor.add_subscriber(None);
    debug!(id = %subscription.id(), "SSE client subscribed");

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let summary = subscription.recv().await?;
        let event = Event::default()
            .event("scan_data")
            .json_data(&*summary)
            .ok()?;
        Some((Ok(event), subscription))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(1))
            .text("keep-alive"),
    )
}

async fn ws_upgrade(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| ws_client(socket, state))
}

/// Per-client websocket loop: forward summaries, watch for close. Dropping
/// the subscription on exit detaches this client without touching others.
async fn ws_client(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.distributor.add_subscriber(None);
    debug!(id = %subscription.id(), "websocket client subscribed");

    loop {
        tokio::select! {
            summary = subscription.recv() => {
                let Some(summary) = summary else { break };
                let message = WsMessage::ScanData((*summary).clone());
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("websocket serialization failed: {err}"),
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(id = %subscription.id(), "websocket client disconnected");
}

fn respond(result: AppResult<()>, message: &str) -> (StatusCode, Json<Value>) {
    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "message": message,
                "timestamp": Utc::now(),
            })),
        ),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &BridgeError) -> (StatusCode, Json<Value>) {
    let code = match err {
        BridgeError::NotConnected | BridgeError::InvalidStateTransition { .. } => {
            StatusCode::CONFLICT
        }
        BridgeError::MalformedScan { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        code,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "timestamp": Utc::now(),
        })),
    )
}
