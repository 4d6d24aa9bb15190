//! In-process connector.
//!
//! Tables live in memory keyed by location path. Failures and delays can be
//! injected per path, which makes this connector the workhorse of engine
//! and scheduler tests as well as dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::ConnectorError;
use crate::location::{select_new_arrivals, Arrival, ConnectionKind, Location, Watermark};
use crate::registry::{Capability, Connector};
use crate::row::{deferred, Row, RowStream, WriteMode, WriteRecord, WriteSummary};
use crate::rules::{RuleApplier, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Read,
    Write,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    arrivals: Vec<Arrival>,
    faults: HashMap<(Op, String), VecDeque<ConnectorError>>,
    write_delays: HashMap<String, Duration>,
    reads: HashMap<String, u32>,
    writes: HashMap<String, u32>,
}

/// Connector over in-memory tables. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<State>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows stored at `path`.
    pub async fn insert_table(&self, path: &str, rows: Vec<Row>) {
        self.state.lock().await.tables.insert(path.to_string(), rows);
    }

    /// Rows stored at `path`, if any.
    pub async fn table(&self, path: &str) -> Option<Vec<Row>> {
        self.state.lock().await.tables.get(path).cloned()
    }

    /// Record a new item under a watched prefix.
    pub async fn add_arrival(&self, path: &str, modified: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.arrivals.push(Arrival {
            path: path.to_string(),
            modified,
            token: modified.timestamp_millis().to_string(),
        });
    }

    /// Make the next reads of `path` fail with `errors`, in order.
    pub async fn fail_reads(&self, path: &str, errors: Vec<ConnectorError>) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry((Op::Read, path.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Make the next writes to `path` fail with `errors`, in order.
    pub async fn fail_writes(&self, path: &str, errors: Vec<ConnectorError>) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry((Op::Write, path.to_string()))
            .or_default()
            .extend(errors);
    }

    /// Delay every write to `path`.
    pub async fn delay_writes(&self, path: &str, delay: Duration) {
        self.state
            .lock()
            .await
            .write_delays
            .insert(path.to_string(), delay);
    }

    /// Number of read attempts against `path`.
    pub async fn read_count(&self, path: &str) -> u32 {
        self.state.lock().await.reads.get(path).copied().unwrap_or(0)
    }

    /// Number of write attempts against `path`.
    pub async fn write_count(&self, path: &str) -> u32 {
        self.state.lock().await.writes.get(path).copied().unwrap_or(0)
    }

    async fn take_fault(&self, op: Op, path: &str) -> Option<ConnectorError> {
        let mut state = self.state.lock().await;
        let counter = match op {
            Op::Read => state.reads.entry(path.to_string()).or_default(),
            Op::Write => state.writes.entry(path.to_string()).or_default(),
        };
        *counter += 1;
        state
            .faults
            .get_mut(&(op, path.to_string()))
            .and_then(|queue| queue.pop_front())
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Memory
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Read,
            Capability::Write,
            Capability::ListArrivals,
            Capability::Exists,
        ]
    }

    async fn read(&self, location: &Location) -> Result<RowStream, ConnectorError> {
        let this = self.clone();
        let path = location.path.clone();
        Ok(deferred(async move {
            if let Some(err) = this.take_fault(Op::Read, &path).await {
                return Err(err);
            }
            this.table(&path)
                .await
                .ok_or_else(|| ConnectorError::NotFound(format!("memory table '{}'", path)))
        }))
    }

    async fn write(
        &self,
        location: &Location,
        rules: &RuleSet,
        records: &[WriteRecord],
        mode: WriteMode,
    ) -> Result<WriteSummary, ConnectorError> {
        let delay = self
            .state
            .lock()
            .await
            .write_delays
            .get(&location.path)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.take_fault(Op::Write, &location.path).await {
            return Err(err);
        }

        let rows = RuleApplier::new(rules, Utc::now())?.apply_all(records)?;
        let rows_written = rows.len() as u64;
        let mut state = self.state.lock().await;
        match mode {
            WriteMode::Replace => {
                state.tables.insert(location.path.clone(), rows);
            }
            WriteMode::Append => state
                .tables
                .entry(location.path.clone())
                .or_default()
                .extend(rows),
        }
        Ok(WriteSummary { rows_written })
    }

    async fn list_new_arrivals(
        &self,
        location: &Location,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<Arrival>, ConnectorError> {
        let state = self.state.lock().await;
        let under_prefix = state
            .arrivals
            .iter()
            .filter(|a| a.path.starts_with(&location.path))
            .cloned()
            .collect();
        Ok(select_new_arrivals(under_prefix, watermark))
    }

    async fn exists(&self, location: &Location) -> Result<bool, ConnectorError> {
        let state = self.state.lock().await;
        Ok(state.tables.contains_key(&location.path)
            || state.arrivals.iter().any(|a| a.path.starts_with(&location.path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleExpr;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_read_restartable() {
        let mem = MemoryConnector::new();
        mem.insert_table("raw_orders", vec![row(json!({"id": 1}))]).await;

        let loc = Location::new("mem", "raw_orders");
        let first: Vec<Row> = mem.read(&loc).await.unwrap().try_collect().await.unwrap();
        let second: Vec<Row> = mem.read(&loc).await.unwrap().try_collect().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mem.read_count("raw_orders").await, 2);
    }

    #[tokio::test]
    async fn test_injected_read_failure_then_success() {
        let mem = MemoryConnector::new();
        mem.insert_table("t", vec![]).await;
        mem.fail_reads("t", vec![ConnectorError::Timeout("slow".into())])
            .await;

        let loc = Location::new("mem", "t");
        let failed: Result<Vec<Row>, _> = mem.read(&loc).await.unwrap().try_collect().await;
        assert!(matches!(failed, Err(ConnectorError::Timeout(_))));
        let ok: Result<Vec<Row>, _> = mem.read(&loc).await.unwrap().try_collect().await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_write_applies_rules() {
        let mem = MemoryConnector::new();
        let mut rules = RuleSet::new();
        rules.insert("channel".to_string(), RuleExpr::from("'web'"));

        let loc = Location::new("mem", "orders");
        let summary = mem
            .write(
                &loc,
                &rules,
                &[WriteRecord::new(row(json!({"id": 1})), Row::new())],
                WriteMode::Replace,
            )
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 1);

        let stored = mem.table("orders").await.unwrap();
        assert_eq!(stored[0]["channel"], json!("web"));
    }

    #[tokio::test]
    async fn test_append_keeps_stored_rows() {
        let mem = MemoryConnector::new();
        mem.insert_table("t", vec![row(json!({"id": 1}))]).await;
        let loc = Location::new("mem", "t");
        let batch = [WriteRecord::new(row(json!({"id": 2})), Row::new())];

        mem.write(&loc, &RuleSet::new(), &batch, WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(mem.table("t").await.unwrap().len(), 2);

        mem.write(&loc, &RuleSet::new(), &batch, WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(mem.table("t").await.unwrap(), vec![row(json!({"id": 2}))]);
    }

    #[tokio::test]
    async fn test_list_new_arrivals_respects_watermark() {
        let mem = MemoryConnector::new();
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        mem.add_arrival("inbox/a.jsonl", t(10)).await;
        mem.add_arrival("inbox/b.jsonl", t(20)).await;
        mem.add_arrival("other/c.jsonl", t(30)).await;

        let loc = Location::new("mem", "inbox/");
        let all = mem.list_new_arrivals(&loc, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let wm = Watermark::from(&all[0]);
        let newer = mem.list_new_arrivals(&loc, Some(&wm)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].path, "inbox/b.jsonl");
    }
}
