//! Run ledger: durable record of executions, trigger fires and watermarks.

pub mod event;
pub mod memory;
pub mod postgres;

pub use event::{EventKind, ExecutionEvent};
pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tessera_connectors::{Location, Watermark};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{ConcurrencyPolicy, Execution, RunRequest};

/// Result of [`RunLedger::begin_execution`].
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// A new `pending` execution was recorded.
    Started(Execution),
    /// The flow is serialized and this execution is still active.
    AlreadyRunning(Uuid),
    /// The trigger's dedup key already produced this execution.
    AlreadyFired(Uuid),
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Atomically check the trigger dedup key and the flow's active
    /// execution, then record the new execution together with its trigger
    /// fire and watermark advance.
    async fn begin_execution(
        &self,
        request: &RunRequest,
        policy: ConcurrencyPolicy,
        step_ids: &[String],
    ) -> AppResult<BeginOutcome>;

    /// Append an event to an existing execution.
    async fn record_event(&self, event: ExecutionEvent) -> AppResult<()>;

    async fn get_execution(&self, id: Uuid) -> AppResult<Option<Execution>>;

    /// Active (pending or running) execution of a serialized flow.
    async fn active_execution(&self, flow_id: &str) -> AppResult<Option<Uuid>>;

    /// Every execution not yet terminal.
    async fn list_active(&self) -> AppResult<Vec<Execution>>;

    /// Executions of a flow, newest first.
    async fn list_executions(&self, flow_id: &str) -> AppResult<Vec<Execution>>;

    async fn watermark(&self, flow_id: &str, location: &Location) -> AppResult<Option<Watermark>>;

    /// Latest scheduled instant that produced an execution.
    async fn last_fired_instant(&self, flow_id: &str) -> AppResult<Option<DateTime<Utc>>>;
}

/// Keep whichever watermark is further along.
pub(crate) fn advance(current: Option<&Watermark>, next: &Watermark) -> bool {
    match current {
        None => true,
        Some(current) => (&next.modified, &next.path) > (&current.modified, &current.path),
    }
}
