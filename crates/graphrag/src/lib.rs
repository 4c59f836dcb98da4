pub mod config;
pub mod telemetry;

use anyhow::{Context, Result};
use extract::{LlmExtractor, OllamaClient, OllamaExtractor, RetryPolicy, Schema};
use index::{
    CancelToken, CorpusStats, Embedder, ExtractionHook, GraphStorage, IndexOptions, IndexSummary,
    IndexingPipeline, JsonFileKvStorage, KvStorage, MemoryGraphStorage, MemoryKvStorage,
    MemoryVectorStorage, Neo4jGraphStorage, OllamaEmbedder, QdrantVectorStorage, StorageSet,
    VectorStorage,
};
use ingest::{Chunker, Document, Scanner};
use query::{LlmReranker, QueryEngine, Reranker, SearchMode, SearchResult, TraceDirection};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use config::RagConfig;
pub use telemetry::{init_tracing, LogFormat};

pub use extract::{Entity, Relation};
pub use index::{IndexProgress, PipelineError};
pub use query::QueryError;

/// Collaborators a [`GraphRag`] is assembled from.
pub struct Components {
    pub storage: StorageSet,
    pub extractor: Arc<dyn LlmExtractor>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl Components {
    pub fn in_memory(extractor: Arc<dyn LlmExtractor>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage: StorageSet::in_memory(),
            extractor,
            embedder,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub mode: SearchMode,
    /// Falls back to the configured default limit
    pub limit: Option<usize>,
    pub cancel: CancelToken,
}

impl SearchOptions {
    pub fn new(mode: SearchMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct GraphRag {
    config: RagConfig,
    storage: StorageSet,
    pipeline: IndexingPipeline,
    engine: QueryEngine,
}

impl GraphRag {
    /// Connect the backends named in `config`: Ollama for extraction and
    /// embeddings, plus Qdrant, Neo4j and a JSON KV file when configured.
    pub async fn from_config(config: RagConfig) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::from_config(&config.retry);
        let timeout = config.request_timeout();
        let ollama = &config.backends.ollama;

        let chat = OllamaClient::new(ollama.base_url.clone(), ollama.chat_model.clone())
            .with_retry(retry.clone())
            .with_timeout(timeout)?;
        let embedder = OllamaEmbedder::new(
            ollama.base_url.clone(),
            ollama.embedding_model.clone(),
            ollama.dimensions,
        )
        .with_retry(retry.clone())
        .with_timeout(timeout)?;

        let kv: Arc<dyn KvStorage> = match &config.backends.kv_path {
            Some(path) => Arc::new(JsonFileKvStorage::open(path).await?),
            None => Arc::new(MemoryKvStorage::new()),
        };

        let vector: Arc<dyn VectorStorage> = match &config.backends.qdrant {
            Some(qdrant) => {
                let store = QdrantVectorStorage::new(qdrant.url.clone(), qdrant.collection.clone())
                    .with_retry(retry.clone());
                store
                    .init_collection(ollama.dimensions)
                    .await
                    .context("Failed to initialize Qdrant collection")?;
                Arc::new(store)
            }
            None => Arc::new(MemoryVectorStorage::new()),
        };

        let graph: Arc<dyn GraphStorage> = match &config.backends.neo4j {
            Some(neo4j) => {
                let store = Neo4jGraphStorage::connect(&neo4j.uri, &neo4j.user, &neo4j.password)
                    .await?
                    .with_retry(retry.clone());
                store.init_schema().await.context("Failed to initialize Neo4j schema")?;
                Arc::new(store)
            }
            None => Arc::new(MemoryGraphStorage::new()),
        };

        let reranker: Option<Arc<dyn Reranker>> = if config.backends.rerank {
            Some(Arc::new(LlmReranker::new(chat.clone())))
        } else {
            None
        };

        let components = Components {
            storage: StorageSet::new(kv, vector, graph),
            extractor: Arc::new(OllamaExtractor::new(chat)),
            embedder: Arc::new(embedder),
            reranker,
        };
        Self::with_components(config, components)
    }

    /// Assemble from injected collaborators. The configured namespace, if
    /// any, is applied on top of `components.storage`.
    pub fn with_components(config: RagConfig, components: Components) -> Result<Self> {
        config.validate()?;
        let schema = Arc::new(config.schema.build()?);

        let storage = match &config.namespace {
            Some(namespace) => components.storage.namespaced(namespace),
            None => components.storage,
        };

        let pipeline = IndexingPipeline::new(
            storage.clone(),
            Scanner::new(config.scanner.clone()),
            Chunker::new(config.chunking.clone())?,
            components.extractor.clone(),
            components.embedder.clone(),
            schema.clone(),
            config.pipeline(),
        );

        let mut engine = QueryEngine::new(
            storage.clone(),
            components.embedder,
            components.extractor,
            schema,
            config.query.clone(),
        );
        if let Some(reranker) = components.reranker {
            engine = engine.with_reranker(reranker);
        }

        info!(
            namespace = config.namespace.as_deref().unwrap_or("-"),
            consistency = ?config.extraction.consistency,
            "GraphRAG ready"
        );

        Ok(Self {
            config,
            storage,
            pipeline,
            engine,
        })
    }

    pub fn with_hook(self, hook: Arc<dyn ExtractionHook>) -> Self {
        Self {
            pipeline: self.pipeline.with_hook(hook),
            ..self
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        self.pipeline.schema()
    }

    /// Storage as seen by this instance, namespace applied.
    pub fn storage(&self) -> &StorageSet {
        &self.storage
    }

    /// Scan `paths` (files or directories) and index what changed.
    pub async fn index(&self, paths: &[PathBuf], options: &IndexOptions) -> Result<IndexSummary> {
        self.pipeline.process(paths, options).await
    }

    pub async fn index_documents(
        &self,
        documents: Vec<Document>,
        options: &IndexOptions,
    ) -> Result<IndexSummary> {
        self.pipeline.index_documents(documents, options).await
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchResult>> {
        let limit = options.limit.unwrap_or(self.config.query.default_limit);
        self.engine.search(query, options.mode, limit, &options.cancel).await
    }

    pub async fn trace_data_flow(&self, entity: &str, direction: TraceDirection) -> Result<Vec<Entity>> {
        self.engine.trace_data_flow(entity, direction).await
    }

    pub async fn find_path(&self, from: &str, to: &str, max_depth: Option<usize>) -> Result<Vec<Entity>> {
        self.engine.find_path(from, to, max_depth).await
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        self.storage.stats().await
    }
}
