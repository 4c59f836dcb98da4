use anyhow::Result;
use extract::Entity;
use index::{EntityFilter, GraphStorage};

use crate::types::QueryError;

/// Look up an entity by a user-supplied name: exact id, then
/// case-insensitive id or name, then the shortest name containing it.
pub async fn resolve_entity(graph: &dyn GraphStorage, name: &str) -> Result<Option<Entity>> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(None);
    }

    if let Some(entity) = graph.get_entity(name).await? {
        return Ok(Some(entity));
    }

    let lowered = name.to_lowercase();
    let all = graph.get_entities(None).await?;
    if let Some(entity) = all
        .iter()
        .find(|e| e.id.to_lowercase() == lowered || e.name.to_lowercase() == lowered)
    {
        return Ok(Some(entity.clone()));
    }

    let filter = EntityFilter {
        name_contains: Some(name.to_string()),
        ..EntityFilter::default()
    };
    let mut candidates = graph.get_entities(Some(&filter)).await?;
    candidates.sort_by(|a, b| a.name.len().cmp(&b.name.len()).then_with(|| a.id.cmp(&b.id)));
    Ok(candidates.into_iter().next())
}

/// Like [`resolve_entity`], with a miss reported as
/// [`QueryError::EntityNotFound`].
pub async fn require_entity(graph: &dyn GraphStorage, name: &str) -> Result<Entity> {
    resolve_entity(graph, name)
        .await?
        .ok_or_else(|| QueryError::EntityNotFound(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use index::MemoryGraphStorage;

    async fn graph() -> MemoryGraphStorage {
        let graph = MemoryGraphStorage::new();
        for name in ["PaymentService", "PaymentServiceV2", "Postgres"] {
            graph.add_entity(Entity::new(name, "Service", "")).await.unwrap();
        }
        graph
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let graph = graph().await;

        let exact = resolve_entity(&graph, "Postgres").await.unwrap().unwrap();
        assert_eq!(exact.id, "Postgres");

        let folded = resolve_entity(&graph, "postgres").await.unwrap().unwrap();
        assert_eq!(folded.id, "Postgres");

        let partial = resolve_entity(&graph, "payment").await.unwrap().unwrap();
        assert_eq!(partial.id, "PaymentService");

        assert!(resolve_entity(&graph, "Redis").await.unwrap().is_none());
        assert!(resolve_entity(&graph, "  ").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_entity_is_distinct_error() {
        let graph = graph().await;
        let err = require_entity(&graph, "Redis").await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<QueryError>(),
            Some(&QueryError::EntityNotFound("Redis".to_string()))
        );
    }
}
