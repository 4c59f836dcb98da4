pub mod cancel;
pub mod embeddings;
pub mod json_kv;
pub mod memory;
pub mod metrics;
pub mod namespace;
pub mod neo4j_index;
pub mod pipeline;
pub mod qdrant_index;
pub mod storage;

pub use cancel::{CancelToken, PipelineError};
pub use embeddings::{Embedder, HashEmbedder, OllamaEmbedder};
pub use json_kv::JsonFileKvStorage;
pub use memory::{cosine_similarity, MemoryGraphStorage, MemoryKvStorage, MemoryVectorStorage};
pub use metrics::{IndexMetrics, IndexSummary, TimedOperation};
pub use namespace::{namespaced, NamespacedGraph, NamespacedKv, NamespacedVector, NAMESPACE_TAG};
pub use neo4j_index::Neo4jGraphStorage;
pub use pipeline::{
    extraction_cache_key, ExtractionConsistency, ExtractionHook, IndexOptions, IndexProgress,
    IndexingPipeline, PipelineConfig, ProgressFn,
};
pub use qdrant_index::QdrantVectorStorage;
pub use storage::{
    CorpusStats, Direction, EntityFilter, GraphStats, GraphStorage, KvStorage, KvStorageExt,
    Metadata, MetadataFilter, StorageSet, VectorMatch, VectorRecord, VectorStorage,
};
