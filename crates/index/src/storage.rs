//! Storage contracts consumed by the indexing and query pipelines.
//!
//! Three stores back a corpus:
//!
//! - [`KvStorage`]: document and chunk bodies, content-hash markers
//!   (`docHash:{id}`) and the extraction cache (`extraction:{digest}`)
//! - [`VectorStorage`]: one embedding per chunk, keyed by chunk id
//! - [`GraphStorage`]: entities and relations
//!
//! Implementations must be internally consistent per key; concurrent writes
//! to the same key are last-write-wins.

use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::{Entity, Relation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub type Metadata = Map<String, Value>;

/// Equality constraints on metadata keys; every pair must match.
pub type MetadataFilter = Map<String, Value>;

pub const DOC_PREFIX: &str = "doc:";
pub const CHUNK_PREFIX: &str = "chunk:";
pub const DOC_HASH_PREFIX: &str = "docHash:";
pub const EXTRACTION_PREFIX: &str = "extraction:";

/// Metadata keys written on every chunk vector
pub const META_DOCUMENT_ID: &str = "document_id";
pub const META_CHUNK_INDEX: &str = "chunk_index";
pub const META_CONTENT: &str = "content";
pub const META_SOURCE: &str = "source";

#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, or every key when `None`
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;
}

/// Typed access on top of [`KvStorage`].
#[async_trait]
pub trait KvStorageExt: KvStorage {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => {
                let parsed = serde_json::from_value(value)
                    .with_context(|| format!("Stored value for `{}` has an unexpected shape", key))?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize value for `{}`", key))?;
        self.set(key, value).await
    }
}

impl<S: KvStorage + ?Sized> KvStorageExt for S {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One vector search hit. `score` is a similarity: higher is more relevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Metadata,
}

#[async_trait]
pub trait VectorStorage: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Number of stored records matching `filter` (all records when `None`)
    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize>;
}

pub fn matches_filter(metadata: &Metadata, filter: Option<&MetadataFilter>) -> bool {
    match filter {
        Some(filter) => filter.iter().all(|(k, v)| metadata.get(k) == Some(v)),
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityFilter {
    pub entity_type: Option<String>,
    /// Case-insensitive substring of the entity name
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
}

impl EntityFilter {
    pub fn of_type(entity_type: &str) -> Self {
        Self {
            entity_type: Some(entity_type.to_string()),
            ..Self::default()
        }
    }

    /// Type and name constraints only; `limit` is applied by the caller.
    pub fn matches(&self, entity: &Entity) -> bool {
        if let Some(t) = &self.entity_type {
            if entity.entity_type != *t {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !entity.name.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relation_count: usize,
}

#[async_trait]
pub trait GraphStorage: Send + Sync {
    /// Upsert by id. `source_chunk_ids` accumulate across writes.
    async fn add_entity(&self, entity: Entity) -> Result<()>;

    /// Upsert by id, with the same accumulation rule as entities.
    async fn add_relation(&self, relation: Relation) -> Result<()>;

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    async fn get_entities(&self, filter: Option<&EntityFilter>) -> Result<Vec<Entity>>;

    async fn get_relations(&self, entity_id: &str, direction: Direction) -> Result<Vec<Relation>>;

    /// Entities within `depth` hops of `start_id` following relations in
    /// either direction, start entity first, nearest first.
    async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relation_types: Option<&[String]>,
    ) -> Result<Vec<Entity>>;

    /// Shortest chain of outgoing relations, as the entities along it
    /// (both ends included). Empty when no chain exists.
    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: Option<usize>,
    ) -> Result<Vec<Entity>>;

    /// Removes the entity and every relation attached to it
    async fn delete_entity(&self, id: &str) -> Result<()>;

    async fn delete_relation(&self, id: &str) -> Result<()>;

    /// Entities and relations whose ids start with `id_prefix`. Relations
    /// count whether or not their endpoint entities exist.
    async fn scoped_stats(&self, id_prefix: &str) -> Result<GraphStats>;

    async fn stats(&self) -> Result<GraphStats> {
        self.scoped_stats("").await
    }
}

pub const DEFAULT_PATH_DEPTH: usize = 6;

/// The three stores a corpus lives in.
#[derive(Clone)]
pub struct StorageSet {
    pub kv: Arc<dyn KvStorage>,
    pub vector: Arc<dyn VectorStorage>,
    pub graph: Arc<dyn GraphStorage>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub documents: usize,
    pub chunks: usize,
    pub entities: usize,
    pub relations: usize,
    pub vectors: usize,
}

impl StorageSet {
    pub fn new(
        kv: Arc<dyn KvStorage>,
        vector: Arc<dyn VectorStorage>,
        graph: Arc<dyn GraphStorage>,
    ) -> Self {
        Self { kv, vector, graph }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::memory::MemoryKvStorage::new()),
            Arc::new(crate::memory::MemoryVectorStorage::new()),
            Arc::new(crate::memory::MemoryGraphStorage::new()),
        )
    }

    /// Same stores, isolated under `namespace`.
    pub fn namespaced(&self, namespace: &str) -> Self {
        crate::namespace::namespaced(self, namespace)
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        let documents = self.kv.list(Some(DOC_PREFIX)).await?.len();
        let chunks = self.kv.list(Some(CHUNK_PREFIX)).await?.len();
        let graph = self.graph.stats().await?;
        let vectors = self.vector.count(None).await?;

        Ok(CorpusStats {
            documents,
            chunks,
            entities: graph.entity_count,
            relations: graph.relation_count,
            vectors,
        })
    }
}
