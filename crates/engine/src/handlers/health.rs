//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub connected: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    pub status: String,

    /// Absent for the in-memory backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,

    pub active_executions: usize,

    pub uptime_seconds: u64,

    pub version: String,
}

/// `GET /health`
///
/// Liveness only; never touches the stores.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// `GET /api/health`
///
/// `503 Service Unavailable` when the database or the run ledger cannot be
/// read.
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let database = match &state.db {
        Some(pool) => {
            let latency = db::ping(pool).await;
            Some(DatabaseHealth {
                connected: latency.is_some(),
                latency_ms: latency.map(|d| d.as_millis() as u64),
            })
        }
        None => None,
    };

    let active = state.engine.ledger().list_active().await;
    let healthy = database.as_ref().map_or(true, |d| d.connected) && active.is_ok();

    let response = ApiHealthResponse {
        status: if healthy { "ok" } else { "unhealthy" }.to_string(),
        database,
        active_executions: active.map(|a| a.len()).unwrap_or_default(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness_is_static() {
        let response = health_check().await;
        assert_eq!(response.status, "ok");
    }

    #[test]
    fn test_memory_backend_omits_database() {
        let response = ApiHealthResponse {
            status: "ok".into(),
            database: None,
            active_executions: 0,
            uptime_seconds: 3,
            version: "0.0.0".into(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("database").is_none());
        assert_eq!(json["active_executions"], 0);
    }
}
