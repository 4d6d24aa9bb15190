//! Immutable copy of the definitions a flow run needs.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::MetadataStore;
use crate::error::{AppResult, DefinitionError};
use crate::graph::{DependencyGraph, ExecutionPlan, StepIo};
use crate::model::{Connection, Flow, Mapping, Step, Table};

/// Definitions reachable from one flow, copied at run start. Later edits
/// in the store do not affect a run holding a snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub flow: Flow,
    pub steps: BTreeMap<String, Step>,
    pub mappings: BTreeMap<String, Mapping>,
    pub tables: BTreeMap<String, Table>,
    pub connections: BTreeMap<String, Connection>,
}

impl Snapshot {
    /// Load `flow_id` and everything it references. A dangling reference is
    /// an `UnknownReference` error.
    pub async fn load(store: &dyn MetadataStore, flow_id: &str) -> AppResult<Arc<Self>> {
        let flow = store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| DefinitionError::unknown("flow", flow_id))?;
        Ok(Arc::new(Self::assemble(store, flow).await?))
    }

    /// Resolve the references of `flow`, which need not be stored yet.
    pub async fn assemble(store: &dyn MetadataStore, flow: Flow) -> AppResult<Self> {
        let mut snapshot = Snapshot {
            flow,
            steps: BTreeMap::new(),
            mappings: BTreeMap::new(),
            tables: BTreeMap::new(),
            connections: BTreeMap::new(),
        };

        for step_id in snapshot.flow.steps.clone() {
            if snapshot.steps.contains_key(&step_id) {
                continue;
            }
            let step = store
                .get_step(&step_id)
                .await?
                .ok_or_else(|| DefinitionError::unknown("step", &step_id))?;

            if !snapshot.mappings.contains_key(&step.mapping) {
                let mapping = store
                    .get_mapping(&step.mapping)
                    .await?
                    .ok_or_else(|| DefinitionError::unknown("mapping", &step.mapping))?;

                let table_ids: Vec<String> = mapping
                    .source_tables()
                    .map(str::to_string)
                    .chain(std::iter::once(mapping.target.clone()))
                    .collect();
                for table_id in table_ids {
                    snapshot.load_table(store, &table_id).await?;
                }
                snapshot.mappings.insert(mapping.id.clone(), mapping);
            }
            snapshot.steps.insert(step_id, step);
        }

        if let crate::model::Trigger::Watch { location } = &snapshot.flow.trigger {
            let connection_id = location.connection.clone();
            snapshot.load_connection(store, &connection_id).await?;
        }

        tracing::debug!(
            flow_id = %snapshot.flow.id,
            steps = snapshot.steps.len(),
            tables = snapshot.tables.len(),
            "Snapshot loaded"
        );

        Ok(snapshot)
    }

    async fn load_table(&mut self, store: &dyn MetadataStore, table_id: &str) -> AppResult<()> {
        if self.tables.contains_key(table_id) {
            return Ok(());
        }
        let table = store
            .get_table(table_id)
            .await?
            .ok_or_else(|| DefinitionError::unknown("table", table_id))?;
        let connection_id = table.location.connection.clone();
        self.tables.insert(table.id.clone(), table);
        self.load_connection(store, &connection_id).await
    }

    async fn load_connection(&mut self, store: &dyn MetadataStore, id: &str) -> AppResult<()> {
        if self.connections.contains_key(id) {
            return Ok(());
        }
        let connection = store
            .get_connection(id)
            .await?
            .ok_or_else(|| DefinitionError::unknown("connection", id))?;
        self.connections.insert(connection.id.clone(), connection);
        Ok(())
    }

    pub fn step(&self, id: &str) -> Result<&Step, DefinitionError> {
        self.steps
            .get(id)
            .ok_or_else(|| DefinitionError::unknown("step", id))
    }

    pub fn mapping(&self, id: &str) -> Result<&Mapping, DefinitionError> {
        self.mappings
            .get(id)
            .ok_or_else(|| DefinitionError::unknown("mapping", id))
    }

    pub fn table(&self, id: &str) -> Result<&Table, DefinitionError> {
        self.tables
            .get(id)
            .ok_or_else(|| DefinitionError::unknown("table", id))
    }

    pub fn connection(&self, id: &str) -> Result<&Connection, DefinitionError> {
        self.connections
            .get(id)
            .ok_or_else(|| DefinitionError::unknown("connection", id))
    }

    /// Read/write sets of every step in the flow.
    pub fn step_io(&self) -> Result<Vec<StepIo>, DefinitionError> {
        self.steps
            .values()
            .map(|step| {
                let mapping = self.mapping(&step.mapping)?;
                Ok(StepIo {
                    step_id: step.id.clone(),
                    reads: mapping.source_tables().map(str::to_string).collect(),
                    writes: vec![mapping.target.clone()],
                    depends_on: step.depends_on.clone(),
                })
            })
            .collect()
    }

    pub fn graph(&self) -> Result<DependencyGraph, DefinitionError> {
        DependencyGraph::build(&self.flow.id, &self.step_io()?)
    }

    pub fn plan(&self) -> Result<ExecutionPlan, DefinitionError> {
        self.graph()?.plan()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::metadata::MemoryMetadataStore;

    const PROJECT: &str = r#"
connections:
  - { id: mem, kind: memory }
tables:
  - { id: raw, kind: source, location: { connection: mem, path: raw } }
  - { id: stage, kind: target, location: { connection: mem, path: stage } }
  - { id: mart, kind: target, location: { connection: mem, path: mart } }
mappings:
  - { id: m1, sources: [{ table: raw }], target: stage }
  - { id: m2, sources: [{ table: stage }], target: mart }
steps:
  - { id: S1, mapping: m1 }
  - { id: S2, mapping: m2 }
flows:
  - { id: f, steps: [S2, S1] }
  - { id: broken, steps: [S1, ghost] }
"#;

    #[tokio::test]
    async fn test_load_and_plan() {
        let store = MemoryMetadataStore::from_yaml(PROJECT).unwrap();
        let snapshot = Snapshot::load(&store, "f").await.unwrap();
        assert_eq!(snapshot.tables.len(), 3);
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.plan().unwrap().order, vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn test_dangling_step_reference() {
        let store = MemoryMetadataStore::from_yaml(PROJECT).unwrap();
        let err = Snapshot::load(&store, "broken").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Definition(DefinitionError::UnknownReference { ref kind, ref id })
                if kind == "step" && id == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_edits() {
        let store = MemoryMetadataStore::from_yaml(PROJECT).unwrap();
        let snapshot = Snapshot::load(&store, "f").await.unwrap();
        store
            .put(crate::model::Entity::Step(Step::new("S1", "m2")))
            .await
            .unwrap();
        assert_eq!(snapshot.step("S1").unwrap().mapping, "m1");
    }
}
