pub mod engine;
pub mod global_search;
pub mod local_search;
pub mod rerank;
pub mod resolve;
pub mod types;

pub use engine::{merge_results, split_limit, QueryEngine};
pub use global_search::{collect_keywords, enrich_query};
pub use local_search::apply_mention_boost;
pub use rerank::{LlmReranker, RerankResult, Reranker};
pub use resolve::{require_entity, resolve_entity};
pub use types::{QueryConfig, QueryError, SearchMode, SearchResult, TraceDirection};
