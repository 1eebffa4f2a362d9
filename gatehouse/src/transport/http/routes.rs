//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;

use crate::channel::ChannelState;
use crate::service::{ActionError, ControllerService};

#[derive(Debug, Deserialize)]
pub struct LedRequest {
    pub leds: Vec<u32>,
}

fn channel_state_str(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Unstarted => "UNSTARTED",
        ChannelState::Running => "RUNNING",
        ChannelState::Terminating => "TERMINATING",
        ChannelState::Terminated => "TERMINATED",
    }
}

/// Map an action failure to a status code and structured body. Action errors
/// are data to the caller; they never take the server down.
fn action_error_response(e: ActionError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        ActionError::GateBusy => StatusCode::CONFLICT,
        ActionError::ChannelClosed | ActionError::Aborted => StatusCode::SERVICE_UNAVAILABLE,
        ActionError::Detection(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": e.to_string()
        })),
    )
}

async fn health_check(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    let health = service.health();
    Json(serde_json::json!({
        "status": channel_state_str(health.channel),
        "approval_pending": health.approval_pending,
    }))
}

async fn leds_on(
    State(service): State<Arc<ControllerService>>,
    Json(request): Json<LedRequest>,
) -> impl IntoResponse {
    match service.set_leds(&request.leds, true).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"success": true}))),
        Err(e) => action_error_response(e),
    }
}

async fn leds_off(
    State(service): State<Arc<ControllerService>>,
    Json(request): Json<LedRequest>,
) -> impl IntoResponse {
    match service.set_leds(&request.leds, false).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"success": true}))),
        Err(e) => action_error_response(e),
    }
}

async fn open_door(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    match service.open_door().await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": report.success,
                "adc": report.adc,
                "msg": if report.success { "Door open triggered" } else { "No detection" },
            })),
        ),
        Err(e) => action_error_response(e),
    }
}

async fn close_door(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    match service.close_door().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "msg": "Door closed"})),
        ),
        Err(e) => action_error_response(e),
    }
}

async fn approve(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    if service.approve().await {
        Json(serde_json::json!({"success": true}))
    } else {
        Json(serde_json::json!({"success": false, "msg": "No pending request"}))
    }
}

async fn read_sensor(
    State(service): State<Arc<ControllerService>>,
    Path(channel): Path<String>,
) -> impl IntoResponse {
    match service.read_sensor(&channel).await {
        Ok(value) => (
            StatusCode::OK,
            Json(serde_json::json!({"channel": channel, "value": value})),
        ),
        Err(e) => action_error_response(e),
    }
}

async fn get_logs(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    match service.logs().await {
        Ok(logs) => (StatusCode::OK, Json(serde_json::json!({"logs": logs}))),
        Err(e) => {
            tracing::error!(error = %e, "failed to read journal");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to read logs"})),
            )
        }
    }
}

async fn shutdown(State(service): State<Arc<ControllerService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<ControllerService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/led/on", post(leds_on))
        .route("/led/off", post(leds_off))
        .route("/open", post(open_door))
        .route("/close", post(close_door))
        .route("/auth/approve", post(approve))
        .route("/sensor/{channel}", get(read_sensor))
        .route("/logs", get(get_logs))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
