//! `POST /worker`: accepts a worker request and runs it in the background.
//!
//! The response only acknowledges the request; outcomes are written to the
//! job assignment.

use super::AppState;
use crate::{errors::AppError, models::job::WorkerRequest};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde_json::json;
use tracing::{error, info};

pub async fn invoke_worker(
    State(state): State<AppState>,
    Json(request): Json<WorkerRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.operation_name.trim().is_empty() {
        return Err(AppError::bad_request("operationName is required"));
    }

    let operation_name = request.operation_name.clone();
    info!(operation = %operation_name, "accepted worker request");

    let worker = state.worker.clone();
    state.tasks.spawn(async move {
        let operation_name = request.operation_name.clone();
        if let Err(e) = worker.execute(request).await {
            error!(operation = %operation_name, error = %e, "worker request rejected");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "operationName": operation_name })),
    ))
}
