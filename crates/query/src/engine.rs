use anyhow::{Context, Result};
use extract::{Entity, LlmExtractor, Schema};
use index::{
    storage::{CHUNK_PREFIX, META_CONTENT, META_DOCUMENT_ID},
    CancelToken, Direction, Embedder, KvStorageExt, StorageSet, VectorMatch,
};
use ingest::Chunk;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::rerank::Reranker;
use crate::resolve::{require_entity, resolve_entity};
use crate::types::{QueryConfig, SearchMode, SearchResult, TraceDirection};

/// Chunk id stamped on graph records extracted from a query
const QUERY_CHUNK_ID: &str = "query";

/// Entities named in a query, shared by local and global retrieval.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryContext {
    /// Names as extracted, resolved or not
    pub names: Vec<String>,
    /// Graph entities the names resolved to
    pub seeds: Vec<Entity>,
}

pub struct QueryEngine {
    pub(crate) storage: StorageSet,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn LlmExtractor>,
    pub(crate) schema: Arc<Schema>,
    reranker: Option<Arc<dyn Reranker>>,
    pub(crate) config: QueryConfig,
}

impl QueryEngine {
    pub fn new(
        storage: StorageSet,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn LlmExtractor>,
        schema: Arc<Schema>,
        config: QueryConfig,
    ) -> Self {
        Self {
            storage,
            embedder,
            extractor,
            schema,
            reranker: None,
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        cancel.check()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let results = match mode {
            SearchMode::Naive => self.vector_search(query, limit).await?,
            SearchMode::Local => {
                let context = self.query_context(query).await?;
                self.local_search(query, &context, limit).await?
            }
            SearchMode::Global => {
                let context = self.query_context(query).await?;
                self.global_search(query, &context, limit).await?
            }
            SearchMode::Hybrid => self.hybrid_search(query, limit).await?,
        };

        cancel.check()?;
        let results = self.rerank(query, results, limit, cancel).await?;
        debug!(mode = %mode, results = results.len(), "Search finished");
        Ok(results)
    }

    async fn hybrid_search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let context = self.query_context(query).await?;
        let (local_limit, global_limit) =
            split_limit(limit, self.config.graph_weight, self.config.vector_weight);

        let (local, global) = tokio::try_join!(
            self.local_search(query, &context, local_limit),
            self.global_search(query, &context, global_limit),
        )?;

        Ok(merge_results(vec![local, global], limit))
    }

    async fn rerank(
        &self,
        query: &str,
        results: Vec<SearchResult>,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<SearchResult>> {
        let Some(reranker) = &self.reranker else {
            return Ok(results);
        };
        if results.is_empty() {
            return Ok(results);
        }

        cancel.check()?;
        let documents: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
        let ranked = reranker
            .rerank(query, &documents, Some(limit))
            .await
            .context("Reranking failed")?;

        let mut reranked: Vec<SearchResult> = ranked
            .into_iter()
            .filter_map(|r| {
                let mut result = results.get(r.index)?.clone();
                result.score = r.score;
                Some(result)
            })
            .collect();
        reranked.truncate(limit);
        Ok(reranked)
    }

    /// Best-effort: a failed extraction leaves the context empty.
    pub(crate) async fn query_context(&self, query: &str) -> Result<QueryContext> {
        let names = match self.extractor.extract_entities(query, &[], &self.schema).await {
            Ok(result) => result
                .to_chunk_graph(&self.schema, QUERY_CHUNK_ID)
                .entities
                .into_iter()
                .map(|e| e.name)
                .collect(),
            Err(e) => {
                debug!(error = %format!("{:#}", e), "Query entity extraction failed, continuing without entities");
                Vec::new()
            }
        };

        let mut seeds: Vec<Entity> = Vec::new();
        for name in &names {
            if let Some(entity) = resolve_entity(self.storage.graph.as_ref(), name).await? {
                if !seeds.iter().any(|s| s.id == entity.id) {
                    seeds.push(entity);
                }
            }
        }

        Ok(QueryContext { names, seeds })
    }

    pub(crate) async fn vector_search(&self, text: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let vector = self.embedder
            .embed(text)
            .await
            .context("Failed to embed query")?;
        let matches = self.storage.vector
            .search(&vector, limit, None)
            .await
            .context("Vector search failed")?;

        let mut results = Vec::with_capacity(matches.len());
        for m in matches {
            results.push(self.to_result(m).await?);
        }
        Ok(results)
    }

    /// Content and document id come from the vector metadata, or from the
    /// stored chunk when the backend did not keep them.
    async fn to_result(&self, m: VectorMatch) -> Result<SearchResult> {
        let content = m.metadata.get(META_CONTENT).and_then(|v| v.as_str()).map(str::to_string);
        let document_id = m.metadata.get(META_DOCUMENT_ID).and_then(|v| v.as_str()).map(str::to_string);

        let (content, document_id) = match content {
            Some(content) => (content, document_id),
            None => {
                let chunk: Option<Chunk> = self.storage.kv
                    .get_json(&format!("{}{}", CHUNK_PREFIX, m.id))
                    .await?;
                match chunk {
                    Some(chunk) => (chunk.content, document_id.or(Some(chunk.doc_id))),
                    None => (String::new(), document_id),
                }
            }
        };

        Ok(SearchResult {
            id: m.id,
            score: m.score,
            content,
            document_id,
            metadata: m.metadata,
        })
    }

    /// Entities reachable from `entity` along relations in `direction`,
    /// start entity first, nearest first, up to the configured depth.
    /// An unknown start entity gives an empty list.
    pub async fn trace_data_flow(&self, entity: &str, direction: TraceDirection) -> Result<Vec<Entity>> {
        let graph = self.storage.graph.as_ref();
        let Some(start) = resolve_entity(graph, entity).await? else {
            return Ok(Vec::new());
        };

        let edge_direction = match direction {
            TraceDirection::Downstream => Direction::Outgoing,
            TraceDirection::Upstream => Direction::Incoming,
        };

        let mut visited = HashSet::from([start.id.clone()]);
        let mut queue = VecDeque::from([(start.id.clone(), 0usize)]);
        let mut reached = vec![start];

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= self.config.trace_depth {
                continue;
            }
            for relation in graph.get_relations(&current, edge_direction).await? {
                let next = match direction {
                    TraceDirection::Downstream => relation.target_id,
                    TraceDirection::Upstream => relation.source_id,
                };
                if !visited.insert(next.clone()) {
                    continue;
                }
                if let Some(entity) = graph.get_entity(&next).await? {
                    reached.push(entity);
                }
                queue.push_back((next, hops + 1));
            }
        }

        Ok(reached)
    }

    /// Shortest chain of outgoing relations between two entities, as found
    /// by the graph store. Empty when none exists.
    pub async fn find_path(&self, from: &str, to: &str, max_depth: Option<usize>) -> Result<Vec<Entity>> {
        let graph = self.storage.graph.as_ref();
        let from = require_entity(graph, from).await?;
        let to = require_entity(graph, to).await?;

        graph.find_path(&from.id, &to.id, max_depth).await
    }
}

/// `(local_limit, global_limit)` for hybrid search: the graph share goes to
/// local retrieval, the rest to global, each at least one.
pub fn split_limit(limit: usize, graph_weight: f32, vector_weight: f32) -> (usize, usize) {
    let (g, v) = (graph_weight.max(0.0), vector_weight.max(0.0));
    let share = if g + v > 0.0 { g / (g + v) } else { 0.5 };

    let local = ((limit as f32 * share).round() as usize).max(1);
    let global = limit.saturating_sub(local).max(1);
    (local, global)
}

/// Concatenate `lists` in order, keep the first occurrence of each id,
/// sort by score descending and keep the top `limit`. The sort is stable,
/// so ties keep merge order.
pub fn merge_results(lists: Vec<Vec<SearchResult>>, limit: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let mut merged: Vec<SearchResult> = lists
        .into_iter()
        .flatten()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();

    merged.sort_by(|a, b| b.score.total_cmp(&a.score));
    merged.truncate(limit);
    merged
}
