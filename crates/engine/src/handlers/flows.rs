//! Flow endpoints, including the queries the trigger scheduler polls.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_connectors::Arrival;

use crate::error::AppResult;
use crate::graph::ExecutionPlan;
use crate::model::Flow;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct LastFiredResponse {
    pub flow_id: String,
    pub instant: Option<DateTime<Utc>>,
}

/// `GET /api/flows`
pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<Flow>>> {
    Ok(Json(state.engine.list_flows().await?))
}

/// Step order and layers the flow would run with.
///
/// `GET /api/flows/{id}/plan`
pub async fn plan(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> AppResult<Json<ExecutionPlan>> {
    Ok(Json(state.engine.plan_flow(&flow_id).await?))
}

/// Latest scheduled instant that produced an execution.
///
/// `GET /api/flows/{id}/last-fired`
pub async fn last_fired(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> AppResult<Json<LastFiredResponse>> {
    let instant = state.engine.last_fired_instant(&flow_id).await?;
    Ok(Json(LastFiredResponse { flow_id, instant }))
}

/// Items beyond the watch watermark, oldest first.
///
/// `GET /api/flows/{id}/arrivals`
pub async fn arrivals(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
) -> AppResult<Json<Vec<Arrival>>> {
    Ok(Json(state.engine.new_arrivals(&flow_id).await?))
}
