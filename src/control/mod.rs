//! HTTP surface for operators.
//!
//! A thin router over the session registry; no protocol semantics live
//! here. Provides:
//! - `/sessions` — online devices with their last battery and odometer
//! - `/sessions/{imei}` — one device
//! - `/sessions/{imei}/command` — raw text command
//! - convenience actions mapping to literal command strings
//! - `/stats` and `/health`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::server::{CommandOutcome, SessionRegistry};
use crate::types::DeviceId;

/// Relay cut: immobilize the vehicle.
const CMD_IMMOBILIZE: &str = "RELAY,1#";
/// Relay restore.
const CMD_MOBILIZE: &str = "RELAY,0#";
const CMD_STATUS: &str = "STATUS#";
const CMD_LOCATE: &str = "WHERE#";
const CMD_BATTERY: &str = "BATPARAM,0#";
/// Older firmware answers PARAM# where BATPARAM is unknown.
const CMD_BATTERY_FALLBACK: &str = "PARAM#";

/// Shared state for the handlers.
#[derive(Clone)]
struct ControlState {
    registry: Arc<SessionRegistry>,
}

/// The operator HTTP server.
pub struct ControlServer {
    bind_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    pub fn new(bind_addr: SocketAddr, registry: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bind_addr,
            registry,
            shutdown_tx,
        }
    }

    /// Start serving until [`ControlServer::stop`] or the process ends.
    pub async fn start(&self) -> Result<()> {
        let app = self.build_router();
        info!(addr = %self.bind_addr, "control surface up");

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;
        Ok(())
    }

    fn build_router(&self) -> Router {
        let state = ControlState {
            registry: Arc::clone(&self.registry),
        };

        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/sessions", get(list_sessions))
            .route("/sessions/:imei", get(get_session))
            .route("/sessions/:imei/command", post(send_raw_command))
            .route("/sessions/:imei/immobilize", post(immobilize))
            .route("/sessions/:imei/mobilize", post(mobilize))
            .route("/sessions/:imei/status", post(request_status))
            .route("/sessions/:imei/locate", post(request_location))
            .route("/sessions/:imei/battery", post(request_battery))
            .route("/sessions/:imei/battery-interval", post(battery_interval))
            .with_state(state)
    }

    /// Stop the server.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

#[derive(Debug, Deserialize)]
struct BatteryIntervalBody {
    minutes: u32,
}

#[derive(Debug, Default, Deserialize)]
struct BatteryQuery {
    #[serde(default)]
    fallback: bool,
}

#[derive(Debug, Serialize)]
struct CommandAccepted {
    status: &'static str,
    sequence: u16,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn parse_imei(raw: &str) -> std::result::Result<DeviceId, (StatusCode, Json<ErrorBody>)> {
    raw.parse().map_err(|_| {
        error(
            StatusCode::BAD_REQUEST,
            format!("{raw:?} is not a device identifier"),
        )
    })
}

/// Submit a command and map the outcome onto HTTP.
fn submit(
    state: &ControlState,
    imei: &str,
    command: &str,
) -> std::result::Result<CommandAccepted, (StatusCode, Json<ErrorBody>)> {
    let id = parse_imei(imei)?;
    match state.registry.send_command(&id, command) {
        Ok(CommandOutcome::Accepted { sequence }) => Ok(CommandAccepted {
            status: "accepted",
            sequence: sequence.0,
        }),
        Ok(CommandOutcome::NotConnected) => Err(error(
            StatusCode::NOT_FOUND,
            format!("device {id} is not connected"),
        )),
        Err(err) => Err(error(StatusCode::BAD_REQUEST, err.to_string())),
    }
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "slednik",
        "version": crate::VERSION,
        "endpoints": ["/sessions", "/stats", "/health"]
    }))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.registry.stats())
}

async fn list_sessions(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn get_session(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
) -> impl IntoResponse {
    let id = match parse_imei(&imei) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    match state.registry.get_info(&id) {
        Some(info) => Json(info).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("device {id} is not connected"),
        )
        .into_response(),
    }
}

async fn send_raw_command(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
    Json(body): Json<CommandBody>,
) -> impl IntoResponse {
    match submit(&state, &imei, &body.command) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn immobilize(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
) -> impl IntoResponse {
    match submit(&state, &imei, CMD_IMMOBILIZE) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn mobilize(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
) -> impl IntoResponse {
    match submit(&state, &imei, CMD_MOBILIZE) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn request_status(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
) -> impl IntoResponse {
    match submit(&state, &imei, CMD_STATUS) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn request_location(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
) -> impl IntoResponse {
    match submit(&state, &imei, CMD_LOCATE) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn request_battery(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
    Query(query): Query<BatteryQuery>,
) -> impl IntoResponse {
    let command = if query.fallback {
        CMD_BATTERY_FALLBACK
    } else {
        CMD_BATTERY
    };
    match submit(&state, &imei, command) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn battery_interval(
    State(state): State<ControlState>,
    Path(imei): Path<String>,
    Json(body): Json<BatteryIntervalBody>,
) -> impl IntoResponse {
    let command = format!("BATINTERVAL,{}#", body.minutes);
    match submit(&state, &imei, &command) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_strings() {
        // The convenience actions map to the literal strings the devices
        // understand; all must pass the encoder's validation.
        for cmd in [
            CMD_IMMOBILIZE,
            CMD_MOBILIZE,
            CMD_STATUS,
            CMD_LOCATE,
            CMD_BATTERY,
            CMD_BATTERY_FALLBACK,
            "BATINTERVAL,15#",
        ] {
            assert!(crate::protocol::builder::encode_command(
                cmd,
                crate::types::Sequence(0x0001)
            )
            .is_ok());
        }
    }

    #[test]
    fn test_submit_offline_maps_to_not_found() {
        let state = ControlState {
            registry: Arc::new(SessionRegistry::new(5027)),
        };
        let err = submit(&state, "355172107461053", CMD_STATUS).unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_submit_rejects_bad_identifier() {
        let state = ControlState {
            registry: Arc::new(SessionRegistry::new(5027)),
        };
        let err = submit(&state, "not-an-imei", CMD_STATUS).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
