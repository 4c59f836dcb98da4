use anyhow::Result;
use async_trait::async_trait;
use extract::{Entity, ExtractedEntity, ExtractedRelation, ExtractionResult, LlmExtractor, Relation, Schema};
use index::{
    CancelToken, GraphStorage, HashEmbedder, IndexOptions, IndexingPipeline, PipelineConfig,
    PipelineError, StorageSet,
};
use ingest::{Chunker, ChunkerConfig, Document, Scanner, ScannerConfig};
use query::{QueryConfig, QueryEngine, QueryError, RerankResult, Reranker, SearchMode, TraceDirection};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Capitalized words are entities; consecutive ones are linked with `USES`.
#[derive(Default)]
struct CapitalizedExtractor {
    fail: AtomicBool,
}

#[async_trait]
impl LlmExtractor for CapitalizedExtractor {
    async fn extract_entities(
        &self,
        content: &str,
        _known_entities: &[String],
        _schema: &Schema,
    ) -> Result<ExtractionResult> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let names: Vec<String> = content
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().next().is_some_and(|c| c.is_uppercase()))
            .map(str::to_string)
            .collect();

        Ok(ExtractionResult {
            entities: names
                .iter()
                .map(|name| ExtractedEntity {
                    name: name.clone(),
                    entity_type: "Service".to_string(),
                    description: String::new(),
                    fields: Default::default(),
                })
                .collect(),
            relations: names
                .windows(2)
                .map(|pair| ExtractedRelation {
                    source: pair[0].clone(),
                    target: pair[1].clone(),
                    relation_type: "USES".to_string(),
                    description: String::new(),
                    keywords: vec!["storage".to_string()],
                    fields: Default::default(),
                })
                .collect(),
        })
    }
}

/// Reverses the candidate order and counts calls
#[derive(Default)]
struct ReverseReranker {
    calls: AtomicUsize,
}

#[async_trait]
impl Reranker for ReverseReranker {
    async fn rerank(&self, _query: &str, documents: &[String], limit: Option<usize>) -> Result<Vec<RerankResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut ranked: Vec<RerankResult> = (0..documents.len())
            .rev()
            .enumerate()
            .map(|(rank, index)| RerankResult { index, score: 1.0 - rank as f32 * 0.1 })
            .collect();
        if let Some(limit) = limit {
            ranked.truncate(limit);
        }
        Ok(ranked)
    }
}

struct Corpus {
    storage: StorageSet,
    extractor: Arc<CapitalizedExtractor>,
}

async fn corpus(texts: &[&str]) -> Corpus {
    let storage = StorageSet::in_memory();
    let extractor = Arc::new(CapitalizedExtractor::default());
    let pipeline = IndexingPipeline::new(
        storage.clone(),
        Scanner::new(ScannerConfig::default()),
        Chunker::new(ChunkerConfig::default()).unwrap(),
        extractor.clone(),
        Arc::new(HashEmbedder::new(1024)),
        Arc::new(Schema::default()),
        PipelineConfig::default(),
    );

    let documents = texts
        .iter()
        .enumerate()
        .map(|(i, text)| Document::new(&format!("doc{}.md", i), text.to_string()))
        .collect();
    pipeline.index_documents(documents, &IndexOptions::default()).await.unwrap();

    Corpus { storage, extractor }
}

fn engine(corpus: &Corpus) -> QueryEngine {
    QueryEngine::new(
        corpus.storage.clone(),
        Arc::new(HashEmbedder::new(1024)),
        corpus.extractor.clone(),
        Arc::new(Schema::default()),
        QueryConfig::default(),
    )
}

const TEXTS: [&str; 4] = [
    "ServiceA uses DatabaseB for orders",
    "the weather is sunny and warm today",
    "DatabaseB stores every order row",
    "lunch menu has soup and bread",
];

#[tokio::test]
async fn test_naive_search_finds_mentioning_chunk() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);

    let results = engine
        .search("ServiceA", SearchMode::Naive, 2, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].content.contains("ServiceA"));
    assert!(results[0].document_id.is_some());
}

#[tokio::test]
async fn test_local_never_returns_fewer_than_naive() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);
    let cancel = CancelToken::new();

    for query in ["ServiceA", "what does DatabaseB hold", "weather", "Unknown thing"] {
        for limit in [1, 3, 10] {
            let naive = engine.search(query, SearchMode::Naive, limit, &cancel).await.unwrap();
            let local = engine.search(query, SearchMode::Local, limit, &cancel).await.unwrap();
            assert!(local.len() >= naive.len(), "query {:?} limit {}", query, limit);
        }
    }
}

#[tokio::test]
async fn test_local_promotes_neighbor_mentions() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);

    let results = engine
        .search("ServiceA stores", SearchMode::Local, 4, &CancelToken::new())
        .await
        .unwrap();

    let top: Vec<&str> = results.iter().take(2).map(|r| r.content.as_str()).collect();
    assert!(top.iter().all(|c| c.contains("ServiceA") || c.contains("DatabaseB")));
}

#[tokio::test]
async fn test_query_extraction_failure_degrades_gracefully() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);
    corpus.extractor.fail.store(true, Ordering::SeqCst);
    let cancel = CancelToken::new();

    let naive = engine.search("ServiceA", SearchMode::Naive, 3, &cancel).await.unwrap();
    let local = engine.search("ServiceA", SearchMode::Local, 3, &cancel).await.unwrap();
    let global = engine.search("ServiceA", SearchMode::Global, 3, &cancel).await.unwrap();

    assert_eq!(local.len(), naive.len());
    assert_eq!(global.len(), 3);
}

#[tokio::test]
async fn test_hybrid_results_are_unique_and_bounded() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);

    let results = engine
        .search("ServiceA orders", SearchMode::Hybrid, 3, &CancelToken::new())
        .await
        .unwrap();

    assert!(!results.is_empty() && results.len() <= 3);
    let ids: HashSet<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), results.len());
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn test_reranker_reorders_and_skips_empty() {
    let corpus = corpus(&TEXTS).await;
    let reranker = Arc::new(ReverseReranker::default());
    let plain = engine(&corpus);
    let reranked = engine(&corpus).with_reranker(reranker.clone());
    let cancel = CancelToken::new();

    let before = plain.search("ServiceA", SearchMode::Naive, 3, &cancel).await.unwrap();
    let after = reranked.search("ServiceA", SearchMode::Naive, 3, &cancel).await.unwrap();
    assert_eq!(after[0].id, before[2].id);
    assert_eq!(after[2].id, before[0].id);
    assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);

    let empty = corpus_engine_without_documents(reranker.clone()).await;
    let results = empty.search("ServiceA", SearchMode::Naive, 3, &cancel).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(reranker.calls.load(Ordering::SeqCst), 1);
}

async fn corpus_engine_without_documents(reranker: Arc<ReverseReranker>) -> QueryEngine {
    engine(&corpus(&[]).await).with_reranker(reranker)
}

#[tokio::test]
async fn test_cancelled_search() {
    let corpus = corpus(&TEXTS).await;
    let engine = engine(&corpus);
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = engine.search("ServiceA", SearchMode::Naive, 3, &cancel).await.unwrap_err();
    assert_eq!(err.downcast_ref::<PipelineError>(), Some(&PipelineError::Cancelled));
}

async fn chain() -> Corpus {
    let corpus = corpus(&[]).await;
    let graph = &corpus.storage.graph;
    for name in ["Gateway", "Orders", "Ledger", "Audit"] {
        graph.add_entity(Entity::new(name, "Service", "")).await.unwrap();
    }
    graph.add_relation(Relation::new("Gateway", "CALLS", "Orders", "")).await.unwrap();
    graph.add_relation(Relation::new("Orders", "WRITES_TO", "Ledger", "")).await.unwrap();
    graph.add_relation(Relation::new("Audit", "READS_FROM", "Ledger", "")).await.unwrap();
    corpus
}

fn ids(entities: &[Entity]) -> Vec<&str> {
    entities.iter().map(|e| e.id.as_str()).collect()
}

#[tokio::test]
async fn test_trace_data_flow_both_directions() {
    let corpus = chain().await;
    let engine = engine(&corpus);

    let down = engine.trace_data_flow("gateway", TraceDirection::Downstream).await.unwrap();
    assert_eq!(ids(&down), vec!["Gateway", "Orders", "Ledger"]);

    let up = engine.trace_data_flow("Ledger", TraceDirection::Upstream).await.unwrap();
    assert_eq!(ids(&up), vec!["Ledger", "Audit", "Orders", "Gateway"]);

    assert!(engine.trace_data_flow("Nowhere", TraceDirection::Downstream).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_find_path() {
    let corpus = chain().await;
    let engine = engine(&corpus);

    let path = engine.find_path("Gateway", "Ledger", None).await.unwrap();
    assert_eq!(ids(&path), vec!["Gateway", "Orders", "Ledger"]);

    assert!(engine.find_path("Gateway", "Audit", None).await.unwrap().is_empty());

    let err = engine.find_path("Gateway", "Nowhere", None).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<QueryError>(),
        Some(&QueryError::EntityNotFound("Nowhere".to_string()))
    );
}
