//! In-memory definition store.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::MetadataStore;
use crate::error::AppResult;
use crate::model::{Entity, EntityKind, Project};

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entities: RwLock<BTreeMap<(EntityKind, String), Entity>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_project(project: &Project) -> Self {
        let entities = project
            .entities()
            .into_iter()
            .map(|entity| ((entity.kind(), entity.id().to_string()), entity))
            .collect();
        Self {
            entities: RwLock::new(entities),
        }
    }

    pub fn from_yaml(yaml_content: &str) -> AppResult<Self> {
        Ok(Self::from_project(&Project::from_yaml(yaml_content)?))
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, kind: EntityKind, id: &str) -> AppResult<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .await
            .get(&(kind, id.to_string()))
            .cloned())
    }

    async fn list(&self, kind: EntityKind) -> AppResult<Vec<Entity>> {
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn put(&self, entity: Entity) -> AppResult<()> {
        let key = (entity.kind(), entity.id().to_string());
        self.entities.write().await.insert(key, entity);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool> {
        Ok(self
            .entities
            .write()
            .await
            .remove(&(kind, id.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let store = MemoryMetadataStore::new();
        store.put(Entity::Step(Step::new("s1", "m1"))).await.unwrap();
        store.put(Entity::Step(Step::new("s2", "m1"))).await.unwrap();

        assert_eq!(store.get_step("s1").await.unwrap().unwrap().mapping, "m1");
        assert!(store.get_mapping("s1").await.unwrap().is_none());
        assert_eq!(store.list(EntityKind::Step).await.unwrap().len(), 2);

        assert!(store.delete(EntityKind::Step, "s1").await.unwrap());
        assert!(!store.delete(EntityKind::Step, "s1").await.unwrap());
        assert!(store.get_step("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces() {
        let store = MemoryMetadataStore::new();
        store.put(Entity::Step(Step::new("s1", "m1"))).await.unwrap();
        store.put(Entity::Step(Step::new("s1", "m2"))).await.unwrap();
        assert_eq!(store.get_step("s1").await.unwrap().unwrap().mapping, "m2");
    }
}
