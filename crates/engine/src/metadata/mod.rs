//! Access to stored definitions.
//!
//! The engine only reads definitions through [`MetadataStore`]; the editor
//! or API layer owns them. Runs work on an immutable [`Snapshot`].

pub mod memory;
pub mod postgres;
pub mod snapshot;

pub use memory::MemoryMetadataStore;
pub use postgres::PgMetadataStore;
pub use snapshot::Snapshot;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::model::{Connection, Entity, EntityKind, Flow, Mapping, Step, Table};

/// CRUD access to definitions keyed by `(kind, id)`.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, kind: EntityKind, id: &str) -> AppResult<Option<Entity>>;

    async fn list(&self, kind: EntityKind) -> AppResult<Vec<Entity>>;

    /// Insert or replace a definition.
    async fn put(&self, entity: Entity) -> AppResult<()>;

    async fn delete(&self, kind: EntityKind, id: &str) -> AppResult<bool>;

    async fn get_table(&self, id: &str) -> AppResult<Option<Table>> {
        Ok(match self.get(EntityKind::Table, id).await? {
            Some(Entity::Table(table)) => Some(table),
            _ => None,
        })
    }

    async fn get_mapping(&self, id: &str) -> AppResult<Option<Mapping>> {
        Ok(match self.get(EntityKind::Mapping, id).await? {
            Some(Entity::Mapping(mapping)) => Some(mapping),
            _ => None,
        })
    }

    async fn get_step(&self, id: &str) -> AppResult<Option<Step>> {
        Ok(match self.get(EntityKind::Step, id).await? {
            Some(Entity::Step(step)) => Some(step),
            _ => None,
        })
    }

    async fn get_flow(&self, id: &str) -> AppResult<Option<Flow>> {
        Ok(match self.get(EntityKind::Flow, id).await? {
            Some(Entity::Flow(flow)) => Some(flow),
            _ => None,
        })
    }

    async fn get_connection(&self, id: &str) -> AppResult<Option<Connection>> {
        Ok(match self.get(EntityKind::Connection, id).await? {
            Some(Entity::Connection(connection)) => Some(connection),
            _ => None,
        })
    }

    async fn list_flows(&self) -> AppResult<Vec<Flow>> {
        Ok(self
            .list(EntityKind::Flow)
            .await?
            .into_iter()
            .filter_map(|entity| match entity {
                Entity::Flow(flow) => Some(flow),
                _ => None,
            })
            .collect())
    }
}
