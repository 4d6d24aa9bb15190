//! Run and execution endpoints.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::RunStart;
use crate::error::AppResult;
use crate::model::{Execution, RunRequest, TriggerInfo};
use crate::state::AppState;

/// Body of `POST /api/flows/{id}/runs`. Every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunRequestBody {
    #[serde(default)]
    pub trigger: TriggerInfo,

    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Request a run of a flow.
///
/// `POST /api/flows/{id}/runs`
///
/// # Response
///
/// `202 Accepted`:
/// ```json
/// { "outcome": "started", "execution_id": "..." }
/// ```
/// A trigger that already fired answers with `"outcome": "already_fired"`
/// and the execution it produced. A serialized flow that is running answers
/// `409 Conflict` with the in-flight `execution_id`.
pub async fn request_run(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    body: Option<Json<RunRequestBody>>,
) -> AppResult<(StatusCode, Json<RunStart>)> {
    let Json(body) = body.unwrap_or_default();
    let request = RunRequest {
        flow_id,
        trigger: body.trigger,
        params: body.params,
    };
    let started = state.engine.request_run(request).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// `GET /api/executions/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<Execution>> {
    Ok(Json(state.engine.get_execution_status(execution_id).await?))
}

/// Request cancellation. Steps already running finish; the rest are
/// recorded cancelled.
///
/// `POST /api/executions/{id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> AppResult<Json<Execution>> {
    Ok(Json(state.engine.cancel_run(execution_id).await?))
}

/// Executions of a flow, newest first.
///
/// `GET /api/flows/{id}/executions`
pub async fn list_for_flow(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> AppResult<Json<Vec<Execution>>> {
    Ok(Json(state.engine.ledger().list_executions(&flow_id).await?))
}

/// `GET /api/executions/active`
pub async fn list_active(State(state): State<AppState>) -> AppResult<Json<Vec<Execution>>> {
    Ok(Json(state.engine.ledger().list_active().await?))
}
