use crate::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct ScanAccepted {
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct ScanStatus {
    /// "idle" or "running"
    pub state: String,
}

/// Starts a bucket scan in the background.
///
/// Always answers 202; a scan that is already running turns this into a no-op.
#[utoipa::path(
    post,
    path = "/scan",
    responses(
        (status = 202, description = "Scan scheduled", body = ScanAccepted)
    ),
    tag = "scan"
)]
pub async fn trigger_scan(State(state): State<AppState>) -> impl IntoResponse {
    let scanner = state.scanner.clone();
    tokio::spawn(async move {
        let report = scanner.scan().await;
        tracing::info!("Manual scan: {:?}", report);
    });

    (
        StatusCode::ACCEPTED,
        Json(ScanAccepted {
            status: "scan scheduled".to_string(),
        }),
    )
}

#[utoipa::path(
    get,
    path = "/scan",
    responses(
        (status = 200, description = "Current scanner state", body = ScanStatus)
    ),
    tag = "scan"
)]
pub async fn scan_status(State(state): State<AppState>) -> Json<ScanStatus> {
    Json(ScanStatus {
        state: state.scanner.state().as_str().to_string(),
    })
}
