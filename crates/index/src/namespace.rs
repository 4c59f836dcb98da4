//! Multi-tenant isolation over shared stores.
//!
//! Every key and id is written as `"{namespace}:{id}"` and stripped again on
//! the way out. Vector records also carry a [`NAMESPACE_TAG`] metadata entry
//! that is injected into every search and count filter, so isolation holds
//! even on a vector backend that cannot filter by id prefix.

use anyhow::Result;
use async_trait::async_trait;
use extract::{Entity, Relation};
use serde_json::Value;
use std::sync::Arc;

use crate::storage::{
    Direction, EntityFilter, GraphStats, GraphStorage, KvStorage, MetadataFilter, StorageSet,
    VectorMatch, VectorRecord, VectorStorage,
};

pub const NAMESPACE_TAG: &str = "__ns";

pub fn namespaced(storage: &StorageSet, namespace: &str) -> StorageSet {
    StorageSet {
        kv: Arc::new(NamespacedKv::new(storage.kv.clone(), namespace)),
        vector: Arc::new(NamespacedVector::new(storage.vector.clone(), namespace)),
        graph: Arc::new(NamespacedGraph::new(storage.graph.clone(), namespace)),
    }
}

#[derive(Debug, Clone)]
struct Prefix {
    namespace: String,
    prefix: String,
}

impl Prefix {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix: format!("{}:", namespace),
        }
    }

    fn add(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn strip(&self, id: &str) -> Option<String> {
        id.strip_prefix(&self.prefix).map(str::to_string)
    }

    fn owns(&self, id: &str) -> bool {
        id.starts_with(&self.prefix)
    }

    fn wrap_entity(&self, mut entity: Entity) -> Entity {
        entity.id = self.add(&entity.id);
        entity
    }

    /// Backends that create placeholder endpoints name them after the
    /// stored id, so a prefixed name is stripped along with the id.
    fn unwrap_entity(&self, mut entity: Entity) -> Option<Entity> {
        if entity.name == entity.id {
            entity.name = self.strip(&entity.name)?;
        }
        entity.id = self.strip(&entity.id)?;
        Some(entity)
    }

    fn wrap_relation(&self, mut relation: Relation) -> Relation {
        relation.id = self.add(&relation.id);
        relation.source_id = self.add(&relation.source_id);
        relation.target_id = self.add(&relation.target_id);
        relation
    }

    fn unwrap_relation(&self, mut relation: Relation) -> Option<Relation> {
        relation.id = self.strip(&relation.id)?;
        relation.source_id = self.strip(&relation.source_id)?;
        relation.target_id = self.strip(&relation.target_id)?;
        Some(relation)
    }
}

pub struct NamespacedKv {
    inner: Arc<dyn KvStorage>,
    ns: Prefix,
}

impl NamespacedKv {
    pub fn new(inner: Arc<dyn KvStorage>, namespace: &str) -> Self {
        Self {
            inner,
            ns: Prefix::new(namespace),
        }
    }
}

#[async_trait]
impl KvStorage for NamespacedKv {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.ns.add(key)).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.inner.set(&self.ns.add(key), value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.ns.add(key)).await
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let scoped = self.ns.add(prefix.unwrap_or(""));
        let keys = self.inner.list(Some(&scoped)).await?;
        Ok(keys.iter().filter_map(|k| self.ns.strip(k)).collect())
    }

    /// Deletes only this namespace's keys
    async fn clear(&self) -> Result<()> {
        for key in self.inner.list(Some(&self.ns.prefix)).await? {
            self.inner.delete(&key).await?;
        }
        Ok(())
    }
}

pub struct NamespacedVector {
    inner: Arc<dyn VectorStorage>,
    ns: Prefix,
}

impl NamespacedVector {
    pub fn new(inner: Arc<dyn VectorStorage>, namespace: &str) -> Self {
        Self {
            inner,
            ns: Prefix::new(namespace),
        }
    }

    fn scoped_filter(&self, filter: Option<&MetadataFilter>) -> MetadataFilter {
        let mut scoped = filter.cloned().unwrap_or_default();
        scoped.insert(NAMESPACE_TAG.to_string(), Value::String(self.ns.namespace.clone()));
        scoped
    }
}

#[async_trait]
impl VectorStorage for NamespacedVector {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let tagged = records
            .into_iter()
            .map(|mut record| {
                record.id = self.ns.add(&record.id);
                record
                    .metadata
                    .insert(NAMESPACE_TAG.to_string(), Value::String(self.ns.namespace.clone()));
                record
            })
            .collect();
        self.inner.upsert(tagged).await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let scoped = self.scoped_filter(filter);
        let matches = self.inner.search(vector, limit, Some(&scoped)).await?;

        Ok(matches
            .into_iter()
            .filter_map(|mut m| {
                m.id = self.ns.strip(&m.id)?;
                m.metadata.remove(NAMESPACE_TAG);
                Some(m)
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let scoped: Vec<String> = ids.iter().map(|id| self.ns.add(id)).collect();
        self.inner.delete(&scoped).await
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize> {
        let scoped = self.scoped_filter(filter);
        self.inner.count(Some(&scoped)).await
    }
}

pub struct NamespacedGraph {
    inner: Arc<dyn GraphStorage>,
    ns: Prefix,
}

impl NamespacedGraph {
    pub fn new(inner: Arc<dyn GraphStorage>, namespace: &str) -> Self {
        Self {
            inner,
            ns: Prefix::new(namespace),
        }
    }

    fn unwrap_entities(&self, entities: Vec<Entity>) -> Vec<Entity> {
        entities
            .into_iter()
            .filter(|e| self.ns.owns(&e.id))
            .filter_map(|e| self.ns.unwrap_entity(e))
            .collect()
    }
}

#[async_trait]
impl GraphStorage for NamespacedGraph {
    async fn add_entity(&self, entity: Entity) -> Result<()> {
        self.inner.add_entity(self.ns.wrap_entity(entity)).await
    }

    async fn add_relation(&self, relation: Relation) -> Result<()> {
        self.inner.add_relation(self.ns.wrap_relation(relation)).await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let found = self.inner.get_entity(&self.ns.add(id)).await?;
        Ok(found.and_then(|e| self.ns.unwrap_entity(e)))
    }

    /// The inner store may return every tenant's rows; anything outside this
    /// namespace is dropped before the limit is applied.
    async fn get_entities(&self, filter: Option<&EntityFilter>) -> Result<Vec<Entity>> {
        let unlimited = filter.map(|f| EntityFilter {
            limit: None,
            ..f.clone()
        });
        let entities = self.inner.get_entities(unlimited.as_ref()).await?;

        let mut scoped = self.unwrap_entities(entities);
        if let Some(limit) = filter.and_then(|f| f.limit) {
            scoped.truncate(limit);
        }
        Ok(scoped)
    }

    async fn get_relations(&self, entity_id: &str, direction: Direction) -> Result<Vec<Relation>> {
        let relations = self.inner.get_relations(&self.ns.add(entity_id), direction).await?;
        Ok(relations
            .into_iter()
            .filter_map(|r| self.ns.unwrap_relation(r))
            .collect())
    }

    async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relation_types: Option<&[String]>,
    ) -> Result<Vec<Entity>> {
        let reached = self.inner
            .traverse(&self.ns.add(start_id), depth, relation_types)
            .await?;
        Ok(self.unwrap_entities(reached))
    }

    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: Option<usize>,
    ) -> Result<Vec<Entity>> {
        let path = self.inner
            .find_path(&self.ns.add(from_id), &self.ns.add(to_id), max_depth)
            .await?;
        Ok(self.unwrap_entities(path))
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        self.inner.delete_entity(&self.ns.add(id)).await
    }

    async fn delete_relation(&self, id: &str) -> Result<()> {
        self.inner.delete_relation(&self.ns.add(id)).await
    }

    async fn scoped_stats(&self, id_prefix: &str) -> Result<GraphStats> {
        self.inner.scoped_stats(&self.ns.add(id_prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage};
    use crate::storage::KvStorageExt;

    fn shared() -> StorageSet {
        StorageSet::new(
            Arc::new(MemoryKvStorage::new()),
            Arc::new(MemoryVectorStorage::new()),
            Arc::new(MemoryGraphStorage::new()),
        )
    }

    #[tokio::test]
    async fn test_get_entities_returns_only_own_namespace() {
        let base = shared();
        let a = base.namespaced("a");
        let b = base.namespaced("b");

        a.graph.add_entity(Entity::new("ServiceA", "Service", "")).await.unwrap();
        a.graph.add_entity(Entity::new("DatabaseB", "Database", "")).await.unwrap();
        b.graph.add_entity(Entity::new("ServiceA", "Service", "tenant b")).await.unwrap();
        b.graph.add_entity(Entity::new("Queue", "Component", "")).await.unwrap();

        let ids: Vec<String> = a.graph.get_entities(None).await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["DatabaseB", "ServiceA"]);

        let raw = base.graph.get_entities(None).await.unwrap();
        assert_eq!(raw.len(), 4);
        assert!(raw.iter().any(|e| e.id == "b:ServiceA"));

        let limited = a.graph.get_entities(Some(&EntityFilter { limit: Some(1), ..Default::default() })).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_relations_and_paths_are_stripped() {
        let base = shared();
        let a = base.namespaced("a");
        for name in ["X", "Y"] {
            a.graph.add_entity(Entity::new(name, "Component", "")).await.unwrap();
        }
        a.graph.add_relation(Relation::new("X", "CALLS", "Y", "")).await.unwrap();

        let rels = a.graph.get_relations("X", Direction::Outgoing).await.unwrap();
        assert_eq!(rels[0].id, extract::relation_id("X", "CALLS", "Y"));
        assert_eq!(rels[0].target_id, "Y");

        let path: Vec<String> = a.graph.find_path("X", "Y", None).await.unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(path, vec!["X", "Y"]);

        let stats = a.graph.stats().await.unwrap();
        assert_eq!(stats.relation_count, 1);
        assert!(base.namespaced("b").graph.get_relations("X", Direction::Both).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kv_clear_only_touches_namespace() {
        let base = shared();
        let a = base.namespaced("a");
        let b = base.namespaced("b");
        a.kv.set_json("doc:1", &1).await.unwrap();
        a.kv.set_json("chunk:1-0", &1).await.unwrap();
        b.kv.set_json("doc:1", &2).await.unwrap();
        base.kv.set_json("global", &3).await.unwrap();

        assert_eq!(a.kv.list(Some("doc:")).await.unwrap(), vec!["doc:1"]);
        assert_eq!(a.kv.get_json::<i32>("doc:1").await.unwrap(), Some(1));

        a.kv.clear().await.unwrap();
        assert!(a.kv.list(None).await.unwrap().is_empty());
        assert_eq!(b.kv.get_json::<i32>("doc:1").await.unwrap(), Some(2));
        assert_eq!(base.kv.get_json::<i32>("global").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_vector_search_is_tag_filtered() {
        let base = shared();
        let a = base.namespaced("a");
        let b = base.namespaced("b");
        a.vector
            .upsert(vec![VectorRecord { id: "c1".into(), vector: vec![1.0, 0.0], metadata: Default::default() }])
            .await
            .unwrap();
        b.vector
            .upsert(vec![VectorRecord { id: "c1".into(), vector: vec![1.0, 0.0], metadata: Default::default() }])
            .await
            .unwrap();

        let hits = a.vector.search(&[1.0, 0.0], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c1");
        assert!(!hits[0].metadata.contains_key(NAMESPACE_TAG));
        assert_eq!(a.vector.count(None).await.unwrap(), 1);
        assert_eq!(base.vector.count(None).await.unwrap(), 2);

        a.vector.delete(&["c1".to_string()]).await.unwrap();
        assert_eq!(b.vector.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_scoped_to_namespace() {
        let base = shared();
        let a = base.namespaced("a");
        let b = base.namespaced("b");

        a.graph.add_entity(Entity::new("DatabaseB", "Database", "")).await.unwrap();
        a.graph.add_relation(Relation::new("Ghost", "USES", "DatabaseB", "")).await.unwrap();
        b.graph.add_entity(Entity::new("Queue", "Component", "")).await.unwrap();
        b.graph.add_relation(Relation::new("Queue", "CALLS", "Worker", "")).await.unwrap();
        b.graph.add_relation(Relation::new("Worker", "CALLS", "Queue", "")).await.unwrap();

        let stats = a.graph.stats().await.unwrap();
        assert_eq!((stats.entity_count, stats.relation_count), (1, 1));
        let stats = b.graph.stats().await.unwrap();
        assert_eq!((stats.entity_count, stats.relation_count), (1, 2));
        assert_eq!(base.graph.stats().await.unwrap().relation_count, 3);
    }

    #[tokio::test]
    async fn test_placeholder_names_are_stripped() {
        let base = shared();
        base.graph.add_entity(Entity::new("a:Ghost", "Other", "")).await.unwrap();
        let a = base.namespaced("a");

        let ghost = a.graph.get_entity("Ghost").await.unwrap().unwrap();
        assert_eq!((ghost.id.as_str(), ghost.name.as_str()), ("Ghost", "Ghost"));

        let mut renamed = Entity::new("Svc", "Service", "");
        renamed.name = "a:b".to_string();
        a.graph.add_entity(renamed).await.unwrap();
        assert_eq!(a.graph.get_entity("Svc").await.unwrap().unwrap().name, "a:b");
    }
}
