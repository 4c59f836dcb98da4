pub mod extractor;
pub mod llm;
pub mod normalizer;
pub mod prompt;
pub mod retry;
pub mod schema;
pub mod types;

pub use extractor::{parse_extraction, LlmExtractor, OllamaExtractor};
pub use llm::OllamaClient;
pub use normalizer::EntityNormalizer;
pub use retry::{is_transient, RemoteError, RetryConfig, RetryPolicy};
pub use schema::{FieldKind, FieldSpec, FieldValue, Fields, Schema, SchemaError, FALLBACK_TYPE};
pub use types::{
    relation_id, ChunkGraph, Entity, ExtractedEntity, ExtractedRelation, ExtractionResult, Relation,
};
