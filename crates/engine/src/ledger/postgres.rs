//! PostgreSQL run ledger.
//!
//! `tessera.execution` holds the current status of each execution and a
//! partial unique index allows one active execution per serialized flow.
//! The full view is replayed from `tessera.execution_event`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use tessera_connectors::{Location, Watermark};
use uuid::Uuid;

use super::{advance, BeginOutcome, EventKind, ExecutionEvent, RunLedger};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::model::{ConcurrencyPolicy, Execution, RunRequest};

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn events(&self, id: Uuid) -> AppResult<Vec<ExecutionEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT execution_id, payload, created_at
            FROM tessera.execution_event
            WHERE execution_id = $1
            ORDER BY event_id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::decode).collect()
    }

    async fn load_all(&self, ids: Vec<Uuid>) -> AppResult<Vec<Execution>> {
        let mut executions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(execution) = self.get_execution(id).await? {
                executions.push(execution);
            }
        }
        Ok(executions)
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    execution_id: Uuid,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn decode(self) -> AppResult<ExecutionEvent> {
        let kind: EventKind = serde_json::from_value(self.payload).map_err(|e| {
            AppError::Internal(format!(
                "unreadable event for execution {}: {}",
                self.execution_id, e
            ))
        })?;
        Ok(ExecutionEvent {
            execution_id: self.execution_id,
            kind,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    modified: DateTime<Utc>,
    item_path: String,
    token: String,
}

impl From<WatermarkRow> for Watermark {
    fn from(row: WatermarkRow) -> Self {
        Watermark {
            modified: row.modified,
            path: row.item_path,
            token: row.token,
        }
    }
}

async fn insert_event(tx: &mut Transaction<'_, Postgres>, event: &ExecutionEvent) -> AppResult<()> {
    let payload = serde_json::to_value(&event.kind)?;
    sqlx::query(
        r#"
        INSERT INTO tessera.execution_event (execution_id, event_type, step_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.execution_id)
    .bind(event.kind.event_type())
    .bind(event.kind.step_id())
    .bind(payload)
    .bind(event.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl RunLedger for PgLedger {
    async fn begin_execution(
        &self,
        request: &RunRequest,
        policy: ConcurrencyPolicy,
        step_ids: &[String],
    ) -> AppResult<BeginOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes begin_execution per flow across connections.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&request.flow_id)
            .execute(&mut *tx)
            .await?;

        if let Some(key) = &request.trigger.dedup_key {
            let fired: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT execution_id FROM tessera.trigger_fire
                WHERE flow_id = $1 AND dedup_key = $2
                "#,
            )
            .bind(&request.flow_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(id) = fired {
                return Ok(BeginOutcome::AlreadyFired(id));
            }
        }

        let serialized = policy == ConcurrencyPolicy::Serialize;
        if serialized {
            let active: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT execution_id FROM tessera.execution
                WHERE flow_id = $1 AND serialized AND status IN ('pending', 'running')
                LIMIT 1
                "#,
            )
            .bind(&request.flow_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(id) = active {
                return Ok(BeginOutcome::AlreadyRunning(id));
            }
        }

        let id = Uuid::new_v4();
        let created = ExecutionEvent::new(
            id,
            EventKind::ExecutionCreated {
                flow_id: request.flow_id.clone(),
                trigger: request.trigger.clone(),
                params: request.params.clone(),
                steps: step_ids.to_vec(),
            },
        );

        sqlx::query(
            r#"
            INSERT INTO tessera.execution (execution_id, flow_id, status, serialized, created_at, updated_at)
            VALUES ($1, $2, 'pending', $3, $4, $4)
            "#,
        )
        .bind(id)
        .bind(&request.flow_id)
        .bind(serialized)
        .bind(created.created_at)
        .execute(&mut *tx)
        .await?;
        insert_event(&mut tx, &created).await?;

        if let Some(key) = &request.trigger.dedup_key {
            sqlx::query(
                r#"
                INSERT INTO tessera.trigger_fire (flow_id, dedup_key, execution_id, instant, fired_at)
                VALUES ($1, $2, $3, $4, NOW())
                "#,
            )
            .bind(&request.flow_id)
            .bind(key)
            .bind(id)
            .bind(request.trigger.instant)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(advance_to) = &request.trigger.watermark {
            let location = &advance_to.location;
            let current = sqlx::query_as::<_, WatermarkRow>(
                r#"
                SELECT modified, item_path, token FROM tessera.watermark
                WHERE flow_id = $1 AND connection_id = $2 AND path = $3
                FOR UPDATE
                "#,
            )
            .bind(&request.flow_id)
            .bind(&location.connection)
            .bind(&location.path)
            .fetch_optional(&mut *tx)
            .await?
            .map(Watermark::from);

            if advance(current.as_ref(), &advance_to.watermark) {
                sqlx::query(
                    r#"
                    INSERT INTO tessera.watermark (flow_id, connection_id, path, modified, item_path, token, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, NOW())
                    ON CONFLICT (flow_id, connection_id, path) DO UPDATE
                    SET modified = EXCLUDED.modified,
                        item_path = EXCLUDED.item_path,
                        token = EXCLUDED.token,
                        updated_at = NOW()
                    "#,
                )
                .bind(&request.flow_id)
                .bind(&location.connection)
                .bind(&location.path)
                .bind(advance_to.watermark.modified)
                .bind(&advance_to.watermark.path)
                .bind(&advance_to.watermark.token)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            execution_id = %id,
            flow_id = %request.flow_id,
            trigger = %request.trigger.kind,
            "Execution recorded"
        );

        let execution = Execution::from_events(std::slice::from_ref(&created))
            .ok_or_else(|| AppError::Internal("execution_created did not replay".into()))?;
        Ok(BeginOutcome::Started(execution))
    }

    async fn record_event(&self, event: ExecutionEvent) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM tessera.execution WHERE execution_id = $1 FOR UPDATE",
        )
        .bind(event.execution_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(status) = status else {
            return Err(AppError::NotFound(format!("execution {}", event.execution_id)));
        };

        insert_event(&mut tx, &event).await?;

        let current = crate::model::ExecutionStatus::from(status.as_str());
        if let Some(next) = event.kind.status_change() {
            if !current.is_terminal() {
                sqlx::query(
                    r#"
                    UPDATE tessera.execution
                    SET status = $2, updated_at = NOW()
                    WHERE execution_id = $1
                    "#,
                )
                .bind(event.execution_id)
                .bind(next.to_string())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<Execution>> {
        let events = self.events(id).await?;
        Ok(Execution::from_events(&events))
    }

    async fn active_execution(&self, flow_id: &str) -> AppResult<Option<Uuid>> {
        let id = sqlx::query_scalar(
            r#"
            SELECT execution_id FROM tessera.execution
            WHERE flow_id = $1 AND serialized AND status IN ('pending', 'running')
            LIMIT 1
            "#,
        )
        .bind(flow_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_active(&self) -> AppResult<Vec<Execution>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT execution_id FROM tessera.execution
            WHERE status IN ('pending', 'running')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        self.load_all(ids).await
    }

    async fn list_executions(&self, flow_id: &str) -> AppResult<Vec<Execution>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT execution_id FROM tessera.execution
            WHERE flow_id = $1
            ORDER BY created_at DESC
            LIMIT 100
            "#,
        )
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await?;
        self.load_all(ids).await
    }

    async fn watermark(&self, flow_id: &str, location: &Location) -> AppResult<Option<Watermark>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            r#"
            SELECT modified, item_path, token FROM tessera.watermark
            WHERE flow_id = $1 AND connection_id = $2 AND path = $3
            "#,
        )
        .bind(flow_id)
        .bind(&location.connection)
        .bind(&location.path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Watermark::from))
    }

    async fn last_fired_instant(&self, flow_id: &str) -> AppResult<Option<DateTime<Utc>>> {
        let instant: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(instant) FROM tessera.trigger_fire WHERE flow_id = $1",
        )
        .bind(flow_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(instant)
    }
}
