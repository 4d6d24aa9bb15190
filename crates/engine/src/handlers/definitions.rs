//! Definition endpoints: validation, storage and rule preview.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult, Violation};
use crate::model::{Entity, EntityKind};
use crate::resolver::EffectiveRules;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl From<Vec<Violation>> for ValidationResponse {
    fn from(violations: Vec<Violation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }
}

fn parse_kind(kind: &str) -> AppResult<EntityKind> {
    kind.parse().map_err(AppError::BadRequest)
}

/// Check a definition against the stored ones without saving it.
///
/// `POST /api/validate`
///
/// ```json
/// { "kind": "mapping", "entity": { "id": "m1", "sources": [...], "target": "orders" } }
/// ```
pub async fn validate(
    State(state): State<AppState>,
    Json(entity): Json<Entity>,
) -> AppResult<Json<ValidationResponse>> {
    let violations = state.engine.validate(&entity).await?;
    Ok(Json(violations.into()))
}

/// Store a definition.
///
/// `PUT /api/definitions/{kind}/{id}`
///
/// - `200 OK` when stored
/// - `422 Unprocessable Entity` with the violations when rejected
pub async fn put(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<(StatusCode, Json<ValidationResponse>)> {
    let kind = parse_kind(&kind)?;
    let entity = Entity::from_body(kind, body)
        .map_err(|e| AppError::BadRequest(format!("Invalid {} definition: {}", kind, e)))?;
    if entity.id() != id {
        return Err(AppError::BadRequest(format!(
            "Definition id '{}' does not match path id '{}'",
            entity.id(),
            id
        )));
    }

    let violations = state.engine.save_definition(entity).await?;
    let status = if violations.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(violations.into())))
}

/// `GET /api/definitions/{kind}/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<Json<Entity>> {
    let kind = parse_kind(&kind)?;
    state
        .engine
        .metadata()
        .get(kind, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{} '{}' not found", kind, id)))
}

/// `GET /api/definitions/{kind}`
pub async fn list(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<Json<Vec<Entity>>> {
    let kind = parse_kind(&kind)?;
    Ok(Json(state.engine.metadata().list(kind).await?))
}

/// `DELETE /api/definitions/{kind}/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let kind = parse_kind(&kind)?;
    if state.engine.metadata().delete(kind, &id).await? {
        tracing::info!(kind = %kind, id = %id, "Definition deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("{} '{}' not found", kind, id)))
    }
}

/// Rules the mapping would apply on write, with their origin.
///
/// `GET /api/mappings/{id}/effective-rules`
pub async fn effective_rules(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<EffectiveRules>> {
    Ok(Json(state.engine.preview_effective_rules(&id).await?))
}
