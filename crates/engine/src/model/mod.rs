//! Entity model.
//!
//! Definitions (tables, mappings, steps, flows, connections) reference each
//! other by identity only. The engine loads them into an immutable
//! [`Snapshot`](crate::metadata::Snapshot) for the duration of a run.

pub mod execution;
pub mod flow;
pub mod mapping;
pub mod project;
pub mod step;
pub mod table;

pub use execution::{
    Execution, ExecutionStatus, RunRequest, StepError, StepOutcome, StepStatus, TriggerInfo,
    TriggerKind, WatermarkAdvance,
};
pub use flow::{ConcurrencyPolicy, Flow, Schedule, Trigger};
pub use mapping::{Join, JoinKind, Mapping, MappingLogic, SourceRef};
pub use project::Project;
pub use step::Step;
pub use table::{Column, Table, TableKind};
pub use tessera_connectors::{Connection, ConnectionKind};

use serde::{Deserialize, Serialize};

/// Kind tag of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    Mapping,
    Step,
    Flow,
    Connection,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Mapping => "mapping",
            Self::Step => "step",
            Self::Flow => "flow",
            Self::Connection => "connection",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Self::Table),
            "mapping" => Ok(Self::Mapping),
            "step" => Ok(Self::Step),
            "flow" => Ok(Self::Flow),
            "connection" => Ok(Self::Connection),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

/// Any definition, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entity", rename_all = "snake_case")]
pub enum Entity {
    Table(Table),
    Mapping(Mapping),
    Step(Step),
    Flow(Flow),
    Connection(Connection),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Table(_) => EntityKind::Table,
            Self::Mapping(_) => EntityKind::Mapping,
            Self::Step(_) => EntityKind::Step,
            Self::Flow(_) => EntityKind::Flow,
            Self::Connection(_) => EntityKind::Connection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Table(t) => &t.id,
            Self::Mapping(m) => &m.id,
            Self::Step(s) => &s.id,
            Self::Flow(f) => &f.id,
            Self::Connection(c) => &c.id,
        }
    }

    /// The definition body without its kind tag.
    pub fn body(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Self::Table(t) => serde_json::to_value(t),
            Self::Mapping(m) => serde_json::to_value(m),
            Self::Step(s) => serde_json::to_value(s),
            Self::Flow(f) => serde_json::to_value(f),
            Self::Connection(c) => serde_json::to_value(c),
        }
    }

    /// Rebuild a definition from its kind and body.
    pub fn from_body(kind: EntityKind, body: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            EntityKind::Table => Self::Table(serde_json::from_value(body)?),
            EntityKind::Mapping => Self::Mapping(serde_json::from_value(body)?),
            EntityKind::Step => Self::Step(serde_json::from_value(body)?),
            EntityKind::Flow => Self::Flow(serde_json::from_value(body)?),
            EntityKind::Connection => Self::Connection(serde_json::from_value(body)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_tagged_roundtrip() {
        let value = json!({
            "kind": "step",
            "entity": { "id": "load_orders", "mapping": "m1" }
        });
        let entity: Entity = serde_json::from_value(value).unwrap();
        assert_eq!(entity.kind(), EntityKind::Step);
        assert_eq!(entity.id(), "load_orders");

        let body = entity.body().unwrap();
        let rebuilt = Entity::from_body(EntityKind::Step, body).unwrap();
        assert_eq!(rebuilt, entity);
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("flow".parse::<EntityKind>(), Ok(EntityKind::Flow));
        assert!("widget".parse::<EntityKind>().is_err());
    }
}
