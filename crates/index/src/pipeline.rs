//! Incremental indexing: scan → chunk → extract → embed → persist.
//!
//! Documents run in batches of `max_parallel_insert`, chunks of one document
//! in sub-batches of `llm_max_async`. A batch finishes before the next one
//! starts. A document's content hash is written only after all of its chunks
//! succeed, so a failed document is picked up again on the next run.
//!
//! In [`ExtractionConsistency::Eventual`] mode concurrent chunks read the
//! known-entity list without coordination and may each see a stale snapshot.
//! Graph writes are per-id upserts, so the graph converges regardless.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use extract::{prompt::MAX_KNOWN_ENTITIES, ChunkGraph, ExtractionResult, LlmExtractor, Schema};
use futures::future::{join_all, try_join_all};
use ingest::{chunk_id_prefix, content_digest, Chunk, Chunker, Document, Scanner};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::embeddings::Embedder;
use crate::metrics::{IndexMetrics, IndexSummary, TimedOperation};
use crate::storage::{
    EntityFilter, KvStorageExt, Metadata, StorageSet, VectorRecord, CHUNK_PREFIX, DOC_HASH_PREFIX,
    DOC_PREFIX, EXTRACTION_PREFIX, META_CHUNK_INDEX, META_CONTENT, META_DOCUMENT_ID, META_SOURCE,
};

/// Hex characters of the content digest used in extraction cache keys
pub const CACHE_KEY_LEN: usize = 16;

pub fn extraction_cache_key(text: &str) -> String {
    let digest = content_digest(text);
    format!("{}{}", EXTRACTION_PREFIX, &digest[..CACHE_KEY_LEN])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionConsistency {
    #[default]
    Eventual,
    /// One chunk at a time holds the known-entity snapshot, the extraction
    /// call and the graph writes.
    Serialized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_parallel_insert: usize,
    pub llm_max_async: usize,
    pub extraction_cache: bool,
    pub consistency: ExtractionConsistency,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel_insert: 4,
            llm_max_async: 4,
            extraction_cache: true,
            consistency: ExtractionConsistency::Eventual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexProgress {
    Scan { total: usize },
    DocumentStart { document_id: String, source: Option<String> },
    DocumentSkip { document_id: String },
    DocumentDone { document_id: String, chunks: usize },
    ChunkDone { document_id: String, chunk_id: String, index: usize, total: usize },
    Done { summary: IndexSummary },
}

pub type ProgressFn = Arc<dyn Fn(&IndexProgress) + Send + Sync>;

#[derive(Clone, Default)]
pub struct IndexOptions {
    /// Reprocess documents whose content hash is unchanged
    pub force: bool,
    pub on_progress: Option<ProgressFn>,
    pub cancel: CancelToken,
}

impl IndexOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, on_progress: impl Fn(&IndexProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: IndexProgress) {
        if let Some(on_progress) = &self.on_progress {
            on_progress(&event);
        }
    }
}

/// Runs after extraction and before any graph write. May drop or rewrite
/// entities and relations; removing an entity means removing its relations
/// too, nothing downstream re-checks.
#[async_trait]
pub trait ExtractionHook: Send + Sync {
    async fn apply(&self, chunk: &Chunk, graph: ChunkGraph) -> Result<ChunkGraph>;
}

pub struct IndexingPipeline {
    storage: StorageSet,
    scanner: Scanner,
    chunker: Chunker,
    extractor: Arc<dyn LlmExtractor>,
    embedder: Arc<dyn Embedder>,
    schema: Arc<Schema>,
    config: PipelineConfig,
    hook: Option<Arc<dyn ExtractionHook>>,
    corpus_lock: Mutex<()>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl IndexingPipeline {
    pub fn new(
        storage: StorageSet,
        scanner: Scanner,
        chunker: Chunker,
        extractor: Arc<dyn LlmExtractor>,
        embedder: Arc<dyn Embedder>,
        schema: Arc<Schema>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            scanner,
            chunker,
            extractor,
            embedder,
            schema,
            config,
            hook: None,
            corpus_lock: Mutex::new(()),
            in_flight: DashMap::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ExtractionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn storage(&self) -> &StorageSet {
        &self.storage
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Scan `paths` and index every document found.
    pub async fn process(&self, paths: &[PathBuf], options: &IndexOptions) -> Result<IndexSummary> {
        options.cancel.check()?;
        let documents = self.scanner.scan(paths).await.context("Failed to scan input paths")?;
        self.index_documents(documents, options).await
    }

    pub async fn index_documents(
        &self,
        documents: Vec<Document>,
        options: &IndexOptions,
    ) -> Result<IndexSummary> {
        let metrics = IndexMetrics::new();
        metrics.record_scan(documents.len());
        options.emit(IndexProgress::Scan { total: documents.len() });
        info!(documents = documents.len(), force = options.force, "Indexing started");

        for batch in documents.chunks(self.config.max_parallel_insert.max(1)) {
            options.cancel.check()?;
            join_all(batch.iter().map(|doc| self.index_document(doc, options, &metrics)))
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?;
        }

        let summary = metrics.snapshot();
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            chunks = summary.chunks,
            extraction_calls = summary.extraction_calls,
            cache_hits = summary.cache_hits,
            "Indexing finished"
        );
        options.emit(IndexProgress::Done { summary: summary.clone() });
        Ok(summary)
    }

    async fn index_document(
        &self,
        document: &Document,
        options: &IndexOptions,
        metrics: &IndexMetrics,
    ) -> Result<()> {
        let kv = &self.storage.kv;
        let hash = document.content_hash();
        let hash_key = format!("{}{}", DOC_HASH_PREFIX, document.id);

        if !options.force {
            let stored: Option<String> = kv.get_json(&hash_key).await?;
            if stored.as_deref() == Some(hash.as_str()) {
                debug!(document_id = %document.id, "Content unchanged, skipping");
                metrics.record_document(true);
                options.emit(IndexProgress::DocumentSkip {
                    document_id: document.id.clone(),
                });
                return Ok(());
            }
        }

        options.emit(IndexProgress::DocumentStart {
            document_id: document.id.clone(),
            source: document.source().map(str::to_string),
        });

        kv.set_json(&format!("{}{}", DOC_PREFIX, document.id), document)
            .await
            .context("Failed to store document")?;

        let chunks = self.chunker
            .chunk_document(document)
            .context(format!("Failed to chunk document {}", document.id))?;
        self.remove_stale_chunks(&document.id, chunks.len()).await?;

        for batch in chunks.chunks(self.config.llm_max_async.max(1)) {
            options.cancel.check()?;
            join_all(batch.iter().map(|chunk| {
                self.index_chunk(document, chunk, chunks.len(), options, metrics)
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        }

        kv.set_json(&hash_key, &hash)
            .await
            .context("Failed to store document hash")?;

        metrics.record_document(false);
        debug!(document_id = %document.id, chunks = chunks.len(), "Document indexed");
        options.emit(IndexProgress::DocumentDone {
            document_id: document.id.clone(),
            chunks: chunks.len(),
        });
        Ok(())
    }

    /// Drop chunks left over from a longer previous version of the document.
    async fn remove_stale_chunks(&self, doc_id: &str, chunk_count: usize) -> Result<()> {
        let prefix = format!("{}{}", CHUNK_PREFIX, chunk_id_prefix(doc_id));
        let stale: Vec<String> = self.storage.kv
            .list(Some(&prefix))
            .await?
            .into_iter()
            .filter(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|index| index.parse::<usize>().ok())
                    .is_some_and(|index| index >= chunk_count)
            })
            .collect();

        if stale.is_empty() {
            return Ok(());
        }

        let chunk_ids: Vec<String> = stale
            .iter()
            .filter_map(|key| key.strip_prefix(CHUNK_PREFIX).map(str::to_string))
            .collect();
        for key in &stale {
            self.storage.kv.delete(key).await?;
        }
        self.storage.vector
            .delete(&chunk_ids)
            .await
            .context("Failed to delete stale chunk vectors")?;

        debug!(document_id = doc_id, removed = chunk_ids.len(), "Removed stale chunks");
        Ok(())
    }

    async fn index_chunk(
        &self,
        document: &Document,
        chunk: &Chunk,
        total: usize,
        options: &IndexOptions,
        metrics: &IndexMetrics,
    ) -> Result<()> {
        options.cancel.check()?;

        self.storage.kv
            .set_json(&format!("{}{}", CHUNK_PREFIX, chunk.id), chunk)
            .await
            .context("Failed to store chunk")?;

        let _serial = match self.config.consistency {
            ExtractionConsistency::Serialized => Some(self.corpus_lock.lock().await),
            ExtractionConsistency::Eventual => None,
        };

        let extraction = self.cached_extraction(&chunk.content, metrics).await?;
        let mut graph = extraction.to_chunk_graph(&self.schema, &chunk.id);
        if let Some(hook) = &self.hook {
            graph = hook
                .apply(chunk, graph)
                .await
                .context("Extraction hook failed")?;
        }

        let vector = self.embedder
            .embed(&chunk.content)
            .await
            .context("Failed to embed chunk")?;
        let record = VectorRecord {
            id: chunk.id.clone(),
            vector,
            metadata: chunk_metadata(document, chunk, &self.schema),
        };

        let ChunkGraph { entities, relations } = graph;
        let entity_count = entities.len();
        let relation_count = relations.len();
        let graph_store = &self.storage.graph;

        tokio::try_join!(
            async {
                self.storage.vector
                    .upsert(vec![record])
                    .await
                    .context("Failed to store chunk vector")
            },
            async {
                try_join_all(entities.into_iter().map(|e| graph_store.add_entity(e)))
                    .await
                    .context("Failed to store entities")
            },
            async {
                try_join_all(relations.into_iter().map(|r| graph_store.add_relation(r)))
                    .await
                    .context("Failed to store relations")
            },
        )?;

        metrics.record_chunk(entity_count, relation_count);
        options.emit(IndexProgress::ChunkDone {
            document_id: chunk.doc_id.clone(),
            chunk_id: chunk.id.clone(),
            index: chunk.index,
            total,
        });
        Ok(())
    }

    /// Content-addressed: identical text anywhere in the corpus shares one
    /// extraction. Concurrent chunks with the same text wait on one call.
    async fn cached_extraction(&self, content: &str, metrics: &IndexMetrics) -> Result<ExtractionResult> {
        if !self.config.extraction_cache {
            return self.extract(content, metrics).await;
        }

        let key = extraction_cache_key(content);
        let gate = self.in_flight.entry(key.clone()).or_default().clone();
        let guard = gate.lock().await;

        let result = match self.storage.kv.get_json::<ExtractionResult>(&key).await? {
            Some(cached) => {
                metrics.record_cache_hit();
                debug!(cache_key = %key, "Extraction cache hit");
                Ok(cached)
            }
            None => match self.extract(content, metrics).await {
                Ok(extracted) => self.storage.kv
                    .set_json(&key, &extracted)
                    .await
                    .context("Failed to store extraction cache entry")
                    .map(|_| extracted),
                Err(e) => Err(e),
            },
        };

        drop(guard);
        // Only the map and this task hold the gate: nobody is waiting on it
        self.in_flight.remove_if(&key, |_, g| Arc::strong_count(g) <= 2);
        result
    }

    async fn extract(&self, content: &str, metrics: &IndexMetrics) -> Result<ExtractionResult> {
        let known = self.known_entities().await?;
        let timer = TimedOperation::start();

        let result = self.extractor
            .extract_entities(content, &known, &self.schema)
            .await
            .context("Failed to extract entities")?;

        metrics.record_extract(timer.elapsed());
        Ok(result)
    }

    async fn known_entities(&self) -> Result<Vec<String>> {
        let filter = EntityFilter {
            limit: Some(MAX_KNOWN_ENTITIES),
            ..EntityFilter::default()
        };
        let entities = self.storage.graph.get_entities(Some(&filter)).await?;
        Ok(entities.into_iter().map(|e| e.name).collect())
    }
}

/// Declared document fields are copied onto every chunk, normalized. The
/// reserved keys win over a field of the same name.
fn chunk_metadata(document: &Document, chunk: &Chunk, schema: &Schema) -> Metadata {
    let mut metadata: Metadata = Schema::normalize_fields(schema.document_fields(), &document.metadata)
        .into_iter()
        .map(|(name, value)| (name, Value::String(value.as_str().to_string())))
        .collect();
    metadata.insert(META_DOCUMENT_ID.to_string(), Value::String(chunk.doc_id.clone()));
    metadata.insert(META_CHUNK_INDEX.to_string(), Value::from(chunk.index));
    metadata.insert(META_CONTENT.to_string(), Value::String(chunk.content.clone()));
    if let Some(source) = document.source() {
        metadata.insert(META_SOURCE.to_string(), Value::String(source.to_string()));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::FieldSpec;

    #[test]
    fn test_cache_key_depends_only_on_text() {
        let a = extraction_cache_key("ServiceA uses DatabaseB");
        assert_eq!(a, extraction_cache_key("ServiceA uses DatabaseB"));
        assert_ne!(a, extraction_cache_key("ServiceA uses DatabaseC"));
        assert!(a.starts_with(EXTRACTION_PREFIX));
        assert_eq!(a.len(), EXTRACTION_PREFIX.len() + CACHE_KEY_LEN);
    }

    #[test]
    fn test_chunk_metadata_carries_content_and_source() {
        let document = Document::new("notes/a.md", "hello world".to_string());
        let chunk = Chunk::new(&document.id, 0, "hello world".to_string(), (0, 2));

        let metadata = chunk_metadata(&document, &chunk, &Schema::default());
        assert_eq!(metadata[META_DOCUMENT_ID], Value::String(document.id.clone()));
        assert_eq!(metadata[META_CONTENT], Value::String("hello world".to_string()));
        assert_eq!(metadata[META_SOURCE], Value::String("notes/a.md".to_string()));
    }

    #[test]
    fn test_chunk_metadata_carries_document_fields() {
        let schema = Schema::default()
            .with_document_fields(vec![FieldSpec::enumeration("team", &["Payments", "Search"], "Owning team")])
            .unwrap();
        let mut document = Document::new("notes/a.md", "hello world".to_string());
        document.metadata.insert("team".to_string(), Value::String("payments".to_string()));
        document.metadata.insert("owner".to_string(), Value::String("ops".to_string()));
        let chunk = Chunk::new(&document.id, 0, "hello world".to_string(), (0, 2));

        let metadata = chunk_metadata(&document, &chunk, &schema);
        assert_eq!(metadata["team"], Value::String("Payments".to_string()));
        assert!(!metadata.contains_key("owner"));
        assert_eq!(metadata[META_SOURCE], Value::String("notes/a.md".to_string()));

        document.metadata.insert("team".to_string(), Value::String("billing".to_string()));
        assert!(!chunk_metadata(&document, &chunk, &schema).contains_key("team"));
    }

    #[test]
    fn test_progress_serializes_with_event_tag() {
        let event = IndexProgress::DocumentSkip { document_id: "d".to_string() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "document_skip");
    }
}
