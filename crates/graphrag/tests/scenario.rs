use anyhow::Result;
use async_trait::async_trait;
use extract::{ExtractedEntity, ExtractedRelation, ExtractionResult, LlmExtractor, Schema};
use graphrag::config::SchemaConfig;
use graphrag::{Components, GraphRag, PipelineError, RagConfig, SearchOptions};
use index::{CancelToken, HashEmbedder, IndexOptions, StorageSet};
use ingest::Document;
use query::{SearchMode, TraceDirection};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Knows two systems and one relation between them.
#[derive(Default)]
struct SystemsExtractor {
    calls: AtomicUsize,
}

fn entity(name: &str, entity_type: &str) -> ExtractedEntity {
    ExtractedEntity {
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        description: String::new(),
        fields: Default::default(),
    }
}

#[async_trait]
impl LlmExtractor for SystemsExtractor {
    async fn extract_entities(
        &self,
        content: &str,
        _known_entities: &[String],
        _schema: &Schema,
    ) -> Result<ExtractionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = ExtractionResult::default();

        if content.contains("ServiceA") {
            result.entities.push(entity("ServiceA", "SERVICE"));
        }
        if content.contains("DatabaseB") {
            result.entities.push(entity("DatabaseB", "DATABASE"));
        }
        if content.contains("ServiceA uses DatabaseB") {
            result.relations.push(ExtractedRelation {
                source: "ServiceA".to_string(),
                target: "DatabaseB".to_string(),
                relation_type: "USES".to_string(),
                description: "reads and writes orders".to_string(),
                keywords: vec!["persistence".to_string()],
                fields: Default::default(),
            });
        }
        Ok(result)
    }
}

fn config() -> RagConfig {
    RagConfig {
        schema: SchemaConfig {
            entity_types: vec!["SERVICE".to_string(), "DATABASE".to_string()],
            relation_types: vec!["USES".to_string()],
            ..SchemaConfig::default()
        },
        ..RagConfig::default()
    }
}

fn rag_on(storage: StorageSet, config: RagConfig) -> (GraphRag, Arc<SystemsExtractor>) {
    let extractor = Arc::new(SystemsExtractor::default());
    let components = Components {
        storage,
        extractor: extractor.clone(),
        embedder: Arc::new(HashEmbedder::new(256)),
        reranker: None,
    };
    (GraphRag::with_components(config, components).unwrap(), extractor)
}

fn rag() -> (GraphRag, Arc<SystemsExtractor>) {
    rag_on(StorageSet::in_memory(), config())
}

fn service_doc() -> Document {
    Document::new("architecture.md", "ServiceA uses DatabaseB to keep orders.".to_string())
}

#[tokio::test]
async fn test_service_uses_database() {
    let (rag, _) = rag();
    let summary = rag.index_documents(vec![service_doc()], &IndexOptions::default()).await.unwrap();
    assert_eq!(summary.processed, 1);

    let stats = rag.stats().await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.entities, 2);
    assert_eq!(stats.relations, 1);
    assert_eq!(stats.chunks, stats.vectors);

    let results = rag
        .search("ServiceA", &SearchOptions::new(SearchMode::Naive))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().any(|r| r.content.contains("ServiceA")));
}

#[tokio::test]
async fn test_every_mode_answers() {
    let (rag, _) = rag();
    rag.index_documents(vec![service_doc()], &IndexOptions::default()).await.unwrap();

    for mode in ["naive", "local", "global", "hybrid"] {
        let options = SearchOptions::new(mode.parse().unwrap()).with_limit(3);
        let results = rag.search("what stores orders for ServiceA", &options).await.unwrap();
        assert!(!results.is_empty(), "{} returned nothing", mode);
        assert!(results.len() <= 3);
    }
}

#[tokio::test]
async fn test_graph_operations() {
    let (rag, _) = rag();
    rag.index_documents(vec![service_doc()], &IndexOptions::default()).await.unwrap();

    let path = rag.find_path("ServiceA", "DatabaseB", None).await.unwrap();
    let names: Vec<&str> = path.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["ServiceA", "DatabaseB"]);

    assert!(rag.find_path("DatabaseB", "ServiceA", None).await.unwrap().is_empty());

    let downstream = rag.trace_data_flow("servicea", TraceDirection::Downstream).await.unwrap();
    assert_eq!(downstream.len(), 2);
    assert_eq!(downstream[1].entity_type, "DATABASE");

    let upstream = rag.trace_data_flow("ServiceA", TraceDirection::Upstream).await.unwrap();
    assert_eq!(upstream.len(), 1);
}

#[tokio::test]
async fn test_namespaces_share_storage_without_mixing() {
    let shared = StorageSet::in_memory();
    let (team_a, _) = rag_on(shared.clone(), RagConfig { namespace: Some("a".into()), ..config() });
    let (team_b, _) = rag_on(shared.clone(), RagConfig { namespace: Some("b".into()), ..config() });

    team_a.index_documents(vec![service_doc()], &IndexOptions::default()).await.unwrap();
    team_b
        .index_documents(
            vec![Document::new("db.md", "DatabaseB is replicated twice.".to_string())],
            &IndexOptions::default(),
        )
        .await
        .unwrap();

    let a = team_a.stats().await.unwrap();
    let b = team_b.stats().await.unwrap();
    assert_eq!((a.documents, a.entities, a.relations), (1, 2, 1));
    assert_eq!((b.documents, b.entities, b.relations), (1, 1, 0));

    let entities = team_a.storage().graph.get_entities(None).await.unwrap();
    assert!(entities.iter().all(|e| !e.id.starts_with("a:")));

    let raw = shared.graph.get_entity("a:ServiceA").await.unwrap();
    assert!(raw.is_some());
    assert!(shared.graph.get_entity("b:ServiceA").await.unwrap().is_none());

    let results = team_b
        .search("ServiceA", &SearchOptions::new(SearchMode::Naive))
        .await
        .unwrap();
    assert!(results.iter().all(|r| !r.content.contains("ServiceA")));
}

#[tokio::test]
async fn test_index_directory_then_skip_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("services.md"), "ServiceA uses DatabaseB.").unwrap();
    std::fs::write(dir.path().join("notes.txt"), "DatabaseB backups run nightly.").unwrap();
    std::fs::write(dir.path().join("image.png"), [0u8, 1, 2]).unwrap();

    let (rag, extractor) = rag();
    let paths = vec![PathBuf::from(dir.path())];

    let first = rag.index(&paths, &IndexOptions::default()).await.unwrap();
    assert_eq!(first.documents, 2);
    assert_eq!(first.processed, 2);
    let calls = extractor.calls.load(Ordering::SeqCst);

    let second = rag.index(&paths, &IndexOptions::default()).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), calls);

    let forced = rag.index(&paths, &IndexOptions::forced()).await.unwrap();
    assert_eq!(forced.processed, 2);
}

#[tokio::test]
async fn test_cancelled_operations() {
    let (rag, _) = rag();
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = rag
        .index_documents(vec![service_doc()], &IndexOptions::default().with_cancel(cancel.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<PipelineError>(), Some(&PipelineError::Cancelled));
    assert_eq!(rag.stats().await.unwrap().documents, 0);

    let err = rag
        .search("ServiceA", &SearchOptions::default().with_cancel(cancel))
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<PipelineError>(), Some(&PipelineError::Cancelled));
}

#[tokio::test]
async fn test_invalid_config_rejected_at_construction() {
    let mut config = config();
    config.chunking.overlap = config.chunking.chunk_size;

    let components = Components::in_memory(
        Arc::new(SystemsExtractor::default()),
        Arc::new(HashEmbedder::default()),
    );
    assert!(GraphRag::with_components(config, components).is_err());
}
