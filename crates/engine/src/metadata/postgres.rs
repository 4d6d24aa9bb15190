//! PostgreSQL definition store. Each definition is a JSONB document keyed by
//! `(kind, id)` in `tessera.definition`.

use async_trait::async_trait;

use super::MetadataStore;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::model::{Entity, EntityKind};

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: DbPool,
}

impl PgMetadataStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode(kind: EntityKind, body: serde_json::Value) -> AppResult<Entity> {
    Entity::from_body(kind, body)
        .map_err(|e| AppError::Internal(format!("stored {} is unreadable: {}", kind, e)))
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    async fn get(&self, kind: EntityKind, id: &str) -> AppResult<Option<Entity>> {
        let body: Option<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM tessera.definition
            WHERE kind = $1 AND id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        body.map(|body| decode(kind, body)).transpose()
    }

    async fn list(&self, kind: EntityKind) -> AppResult<Vec<Entity>> {
        let bodies: Vec<serde_json::Value> = sqlx::query_scalar(
            r#"
            SELECT body
            FROM tessera.definition
            WHERE kind = $1
            ORDER BY id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        bodies.into_iter().map(|body| decode(kind, body)).collect()
    }

    async fn put(&self, entity: Entity) -> AppResult<()> {
        let body = entity.body()?;
        sqlx::query(
            r#"
            INSERT INTO tessera.definition (kind, id, body, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (kind, id) DO UPDATE
            SET body = EXCLUDED.body, updated_at = NOW()
            "#,
        )
        .bind(entity.kind().as_str())
        .bind(entity.id())
        .bind(body)
        .execute(&self.pool)
        .await?;

        tracing::debug!(kind = %entity.kind(), id = %entity.id(), "Definition stored");
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM tessera.definition WHERE kind = $1 AND id = $2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
