//! Execution records and run requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_connectors::{Arrival, ConnectorError, Location, Watermark};
use uuid::Uuid;

/// Lifecycle of an execution: `pending` → `running` → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<&str> for ExecutionStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" | "in_progress" => Self::Running,
            "succeeded" | "completed" | "success" => Self::Succeeded,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// State of one step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Machine-readable kind plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: String,
    pub detail: String,
    #[serde(default)]
    pub transient: bool,
}

impl StepError {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            detail: detail.into(),
            transient: false,
        }
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

impl From<&ConnectorError> for StepError {
    fn from(e: &ConnectorError) -> Self {
        Self {
            kind: e.kind().to_string(),
            detail: e.to_string(),
            transient: e.is_transient(),
        }
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

/// Per-step result recorded on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepOutcome {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempts: 0,
            rows_read: 0,
            rows_written: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Manual,
    Schedule,
    Watch,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Schedule => write!(f, "schedule"),
            Self::Watch => write!(f, "watch"),
        }
    }
}

/// Watermark to store when the execution is recorded as started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkAdvance {
    pub location: Location,
    pub watermark: Watermark,
}

/// Why an execution was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    #[serde(default)]
    pub kind: TriggerKind,

    /// Idempotency key; a second request with the same key for the same
    /// flow is answered with the first execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,

    /// Scheduled instant that fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instant: Option<DateTime<Utc>>,

    /// New items that fired a watch trigger.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arrivals: Vec<Arrival>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<WatermarkAdvance>,
}

impl TriggerInfo {
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn schedule(flow_id: &str, instant: DateTime<Utc>) -> Self {
        Self {
            kind: TriggerKind::Schedule,
            dedup_key: Some(format!("{}@schedule:{}", flow_id, instant.to_rfc3339())),
            instant: Some(instant),
            arrivals: Vec::new(),
            watermark: None,
        }
    }

    /// Trigger for `arrivals` (oldest first) seen at `location`.
    pub fn watch(flow_id: &str, location: &Location, arrivals: Vec<Arrival>) -> Option<Self> {
        let newest = arrivals.last()?;
        let watermark = Watermark::from(newest);
        Some(Self {
            kind: TriggerKind::Watch,
            dedup_key: Some(format!(
                "{}@watch:{}:{}:{}",
                flow_id,
                location,
                newest.modified.to_rfc3339(),
                newest.path
            )),
            instant: None,
            watermark: Some(WatermarkAdvance {
                location: location.clone(),
                watermark,
            }),
            arrivals,
        })
    }

    /// Template-visible view of the trigger.
    pub fn to_context(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind.to_string(),
            "instant": self.instant.map(|i| i.to_rfc3339()),
            "arrivals": self.arrivals.iter().map(|a| a.path.clone()).collect::<Vec<_>>(),
        })
    }
}

/// Request to run a flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub flow_id: String,

    #[serde(default)]
    pub trigger: TriggerInfo,

    /// Run-level parameters, visible to every step's templates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl RunRequest {
    pub fn manual(flow_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            trigger: TriggerInfo::manual(),
            params: BTreeMap::new(),
        }
    }
}

/// An attempt to run a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub flow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub trigger: TriggerInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-step outcomes in plan order.
    pub steps: Vec<StepOutcome>,
    /// Execution-level failure not attributable to a step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Execution {
    pub fn step(&self, step_id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> &mut StepOutcome {
        if let Some(pos) = self.steps.iter().position(|s| s.step_id == step_id) {
            return &mut self.steps[pos];
        }
        self.steps.push(StepOutcome::pending(step_id));
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_status_display_and_parse() {
        assert_eq!(ExecutionStatus::Running.to_string(), "running");
        assert_eq!(ExecutionStatus::from("canceled"), ExecutionStatus::Cancelled);
        assert!(ExecutionStatus::Pending.is_active());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_step_error_from_connector_error() {
        let err = StepError::from(&ConnectorError::Timeout("read".into()));
        assert_eq!(err.kind, "timeout");
        assert!(err.transient);
    }

    #[test]
    fn test_schedule_trigger_key() {
        let instant = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let trigger = TriggerInfo::schedule("nightly", instant);
        assert_eq!(
            trigger.dedup_key.as_deref(),
            Some("nightly@schedule:2024-05-01T10:30:00+00:00")
        );
    }

    #[test]
    fn test_watch_trigger_advances_to_newest() {
        let t = |s| Utc.timestamp_opt(s, 0).unwrap();
        let location = Location::new("landing", "inbox/");
        let arrivals = vec![
            Arrival { path: "inbox/a".into(), modified: t(1), token: String::new() },
            Arrival { path: "inbox/b".into(), modified: t(2), token: String::new() },
        ];
        let trigger = TriggerInfo::watch("ingest", &location, arrivals).unwrap();
        let advance = trigger.watermark.unwrap();
        assert_eq!(advance.watermark.path, "inbox/b");
        assert!(TriggerInfo::watch("ingest", &location, vec![]).is_none());
    }

    #[test]
    fn test_step_mut_inserts_missing() {
        let mut execution = Execution {
            id: Uuid::new_v4(),
            flow_id: "f".into(),
            status: ExecutionStatus::Pending,
            trigger: TriggerInfo::manual(),
            params: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            steps: vec![],
            error: None,
            cancel_requested: false,
        };
        execution.step_mut("s1").attempts = 2;
        assert_eq!(execution.step("s1").unwrap().attempts, 2);
        assert_eq!(execution.steps.len(), 1);
    }
}
