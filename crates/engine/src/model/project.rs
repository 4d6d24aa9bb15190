//! Project definitions file.
//!
//! A single YAML document listing every definition of a project:
//!
//! ```yaml
//! connections:
//!   - { id: landing, kind: local-filesystem, config: { root: /data } }
//! tables: [...]
//! mappings: [...]
//! steps: [...]
//! flows: [...]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{Connection, Entity, Flow, Mapping, Step, Table};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl Project {
    /// Parse a project document. Duplicate identities within one kind are
    /// rejected.
    pub fn from_yaml(yaml_content: &str) -> AppResult<Self> {
        let project: Project =
            serde_yaml::from_str(yaml_content).map_err(|e| AppError::Parse(e.to_string()))?;

        let mut seen = HashSet::new();
        for entity in project.entities() {
            if !seen.insert((entity.kind(), entity.id().to_string())) {
                return Err(AppError::Validation(format!(
                    "Duplicate {} '{}' in project file",
                    entity.kind(),
                    entity.id()
                )));
            }
        }

        Ok(project)
    }

    pub async fn from_file(path: &str) -> AppResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Config(format!("cannot read project file {}: {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Every definition, connections first.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        entities.extend(self.connections.iter().cloned().map(Entity::Connection));
        entities.extend(self.tables.iter().cloned().map(Entity::Table));
        entities.extend(self.mappings.iter().cloned().map(Entity::Mapping));
        entities.extend(self.steps.iter().cloned().map(Entity::Step));
        entities.extend(self.flows.iter().cloned().map(Entity::Flow));
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROJECT: &str = r#"
connections:
  - id: mem
    kind: memory
tables:
  - id: raw_orders
    kind: source
    schema: [{ name: id }, { name: modified_ts }]
    location: { connection: mem, path: raw_orders }
  - id: orders
    kind: target
    schema: [{ name: id }, { name: updated_at }]
    default_rules: { updated_at: now }
    location: { connection: mem, path: orders }
mappings:
  - id: m1
    sources: [{ table: raw_orders }]
    target: orders
steps:
  - id: load_orders
    mapping: m1
flows:
  - id: nightly
    steps: [load_orders]
"#;

    #[test]
    fn test_parse_project() {
        let project = Project::from_yaml(PROJECT).unwrap();
        assert_eq!(project.tables.len(), 2);
        assert_eq!(project.entities().len(), 6);
        assert!(matches!(project.entities()[0], Entity::Connection(_)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = "steps:\n  - { id: a, mapping: m }\n  - { id: a, mapping: n }\n";
        let err = Project::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(Project::from_yaml("tables: {"), Err(AppError::Parse(_))));
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.yaml");
        std::fs::write(&path, PROJECT).unwrap();

        let project = Project::from_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(project.flows[0].id, "nightly");

        let missing = Project::from_file("/nonexistent/project.yaml").await;
        assert!(matches!(missing, Err(AppError::Config(_))));
    }
}
