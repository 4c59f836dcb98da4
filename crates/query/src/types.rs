use index::Metadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown search mode `{0}` (expected naive, local, global or hybrid)")]
    UnknownMode(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Vector similarity only
    Naive,
    /// Vector search reranked by mentions of query entities and their neighbors
    Local,
    /// Vector search on the query enriched with relation keywords
    Global,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Naive => "naive",
            SearchMode::Local => "local",
            SearchMode::Global => "global",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl FromStr for SearchMode {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "naive" => Ok(SearchMode::Naive),
            "local" => Ok(SearchMode::Local),
            "global" => Ok(SearchMode::Global),
            "hybrid" => Ok(SearchMode::Hybrid),
            _ => Err(QueryError::UnknownMode(s.to_string())),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way [`trace_data_flow`](crate::QueryEngine::trace_data_flow) walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    /// Follow outgoing relations
    Downstream,
    /// Follow incoming relations
    Upstream,
}

impl FromStr for TraceDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "downstream" => Ok(TraceDirection::Downstream),
            "upstream" => Ok(TraceDirection::Upstream),
            other => anyhow::bail!("unknown trace direction `{}`", other),
        }
    }
}

/// One retrieved chunk. `score` is higher-is-better within a single search
/// call; scores from different calls are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub document_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub graph_weight: f32,
    pub vector_weight: f32,
    /// Hop bound for `trace_data_flow`
    pub trace_depth: usize,
    pub local_boost: f32,
    pub local_penalty: f32,
    pub global_keyword_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            graph_weight: 0.5,
            vector_weight: 0.5,
            trace_depth: 10,
            local_boost: 1.5,
            local_penalty: 0.5,
            global_keyword_limit: 12,
        }
    }
}
