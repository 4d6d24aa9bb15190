//! Tables used by the PostgreSQL metadata store and run ledger.

use super::DbPool;

const SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS tessera;

CREATE TABLE IF NOT EXISTS tessera.definition (
    kind        TEXT        NOT NULL,
    id          TEXT        NOT NULL,
    body        JSONB       NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (kind, id)
);

CREATE TABLE IF NOT EXISTS tessera.execution (
    execution_id UUID        PRIMARY KEY,
    flow_id      TEXT        NOT NULL,
    status       TEXT        NOT NULL,
    serialized   BOOLEAN     NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS execution_one_active_per_flow
    ON tessera.execution (flow_id)
    WHERE serialized AND status IN ('pending', 'running');

CREATE INDEX IF NOT EXISTS execution_flow_created
    ON tessera.execution (flow_id, created_at DESC);

CREATE TABLE IF NOT EXISTS tessera.execution_event (
    event_id     BIGSERIAL   PRIMARY KEY,
    execution_id UUID        NOT NULL REFERENCES tessera.execution (execution_id),
    event_type   TEXT        NOT NULL,
    step_id      TEXT,
    payload      JSONB       NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS execution_event_execution
    ON tessera.execution_event (execution_id, event_id);

CREATE TABLE IF NOT EXISTS tessera.trigger_fire (
    flow_id      TEXT        NOT NULL,
    dedup_key    TEXT        NOT NULL,
    execution_id UUID        NOT NULL REFERENCES tessera.execution (execution_id),
    instant      TIMESTAMPTZ,
    fired_at     TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (flow_id, dedup_key)
);

CREATE TABLE IF NOT EXISTS tessera.watermark (
    flow_id       TEXT        NOT NULL,
    connection_id TEXT        NOT NULL,
    path          TEXT        NOT NULL,
    modified      TIMESTAMPTZ NOT NULL,
    item_path     TEXT        NOT NULL,
    token         TEXT        NOT NULL DEFAULT '',
    updated_at    TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (flow_id, connection_id, path)
);
"#;

/// Create the `tessera` schema and its tables if they do not exist.
pub async fn init_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("Database schema ready");
    Ok(())
}
