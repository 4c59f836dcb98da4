use anyhow::{Context, Result};
use extract::{FieldSpec, RetryConfig, Schema};
use index::{ExtractionConsistency, PipelineConfig};
use ingest::{ChunkerConfig, ScannerConfig};
use query::QueryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NAMESPACE: &str = "GRAPHRAG_NAMESPACE";
pub const ENV_OLLAMA_URL: &str = "GRAPHRAG_OLLAMA_URL";
pub const ENV_QDRANT_URL: &str = "GRAPHRAG_QDRANT_URL";
pub const ENV_NEO4J_URI: &str = "GRAPHRAG_NEO4J_URI";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkerConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub extraction: ExtractionConfig,
    pub query: QueryConfig,
    pub schema: SchemaConfig,
    /// Tenant key prefixed onto every stored id
    pub namespace: Option<String>,
    pub scanner: ScannerConfig,
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Documents indexed at once
    pub max_parallel_insert: usize,
    /// Chunks per document sent to the model at once
    pub llm_max_async: usize,
    pub request_timeout_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_insert: 4,
            llm_max_async: 4,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub extraction_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            extraction_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub consistency: ExtractionConsistency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,
    pub document_fields: Vec<FieldSpec>,
    pub entity_fields: Vec<FieldSpec>,
    pub relation_fields: Vec<FieldSpec>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        let schema = Schema::default();
        Self {
            entity_types: schema.entity_types().to_vec(),
            relation_types: schema.relation_types().to_vec(),
            document_fields: Vec::new(),
            entity_fields: Vec::new(),
            relation_fields: Vec::new(),
        }
    }
}

impl SchemaConfig {
    pub fn build(&self) -> Result<Schema> {
        let schema = Schema::define(self.entity_types.clone(), self.relation_types.clone())?
            .with_document_fields(self.document_fields.clone())?
            .with_entity_fields(self.entity_fields.clone())?
            .with_relation_fields(self.relation_fields.clone())?;
        Ok(schema)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub ollama: OllamaConfig,
    /// Vectors stay in memory when unset
    pub qdrant: Option<QdrantConfig>,
    /// The graph stays in memory when unset
    pub neo4j: Option<Neo4jConfig>,
    /// JSON file for documents, chunks and the extraction cache; in memory when unset
    pub kv_path: Option<PathBuf>,
    /// Score retrieved chunks with the chat model before returning them
    pub rerank: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub dimensions: usize,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            chat_model: "llama3".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            dimensions: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            collection: "graphrag_chunks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "neo4j".to_string(),
        }
    }
}

impl RagConfig {
    /// High parallelism, short timeouts, cached extraction.
    pub fn fast() -> Self {
        Self {
            concurrency: ConcurrencyConfig {
                max_parallel_insert: 8,
                llm_max_async: 8,
                request_timeout_secs: 30,
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 500,
                max_backoff_ms: 5000,
            },
            ..Self::default()
        }
    }

    /// Fresh extraction for every chunk, one chunk at a time.
    pub fn accurate() -> Self {
        Self {
            concurrency: ConcurrencyConfig {
                max_parallel_insert: 2,
                llm_max_async: 2,
                request_timeout_secs: 120,
            },
            retry: RetryConfig {
                max_retries: 5,
                initial_backoff_ms: 2000,
                max_backoff_ms: 20000,
            },
            cache: CacheConfig {
                extraction_enabled: false,
            },
            extraction: ExtractionConfig {
                consistency: ExtractionConsistency::Serialized,
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overrides from `lookup`, keyed by the `GRAPHRAG_*` variable names.
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(namespace) = get(ENV_NAMESPACE) {
            self.namespace = Some(namespace);
        }
        if let Some(url) = get(ENV_OLLAMA_URL) {
            self.backends.ollama.base_url = url;
        }
        if let Some(url) = get(ENV_QDRANT_URL) {
            self.backends.qdrant.get_or_insert_with(QdrantConfig::default).url = url;
        }
        if let Some(uri) = get(ENV_NEO4J_URI) {
            self.backends.neo4j.get_or_insert_with(Neo4jConfig::default).uri = uri;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking.validate()?;
        if self.concurrency.max_parallel_insert == 0 || self.concurrency.llm_max_async == 0 {
            anyhow::bail!("concurrency limits must be greater than zero");
        }
        if let Some(namespace) = &self.namespace {
            if namespace.is_empty() || namespace.contains(':') {
                anyhow::bail!("namespace must be non-empty and must not contain ':'");
            }
        }
        self.schema.build().context("Invalid schema")?;
        Ok(())
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            max_parallel_insert: self.concurrency.max_parallel_insert,
            llm_max_async: self.concurrency.llm_max_async,
            extraction_cache: self.cache.extraction_enabled,
            consistency: self.extraction.consistency,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.concurrency.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RagConfig::from_toml_str(
            r#"
            namespace = "team-a"

            [chunking]
            chunk_size = 256

            [query]
            graph_weight = 0.7

            [extraction]
            consistency = "serialized"

            [backends.qdrant]
            collection = "docs"
            "#,
        )
        .unwrap();

        assert_eq!(config.namespace.as_deref(), Some("team-a"));
        assert_eq!(config.chunking.chunk_size, 256);
        assert_eq!(config.chunking.overlap, 64);
        assert_eq!(config.query.graph_weight, 0.7);
        assert_eq!(config.query.default_limit, 10);
        assert_eq!(config.extraction.consistency, ExtractionConsistency::Serialized);

        let qdrant = config.backends.qdrant.unwrap();
        assert_eq!(qdrant.collection, "docs");
        assert_eq!(qdrant.url, "http://localhost:6333");
        assert!(config.backends.neo4j.is_none());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(RagConfig::from_toml_str("[chunking]\nchunk_size = 10\noverlap = 10").is_err());
        assert!(RagConfig::from_toml_str("[concurrency]\nllm_max_async = 0").is_err());
        assert!(RagConfig::from_toml_str("namespace = \"a:b\"").is_err());
        assert!(RagConfig::from_toml_str("[schema]\nentity_types = []").is_err());
        assert!(RagConfig::from_toml_str("[extraction]\nconsistency = \"strict\"").is_err());
    }

    #[test]
    fn test_schema_fields_from_toml() {
        let config = RagConfig::from_toml_str(
            r#"
            [schema]
            entity_types = ["Service", "Queue"]
            relation_types = ["PUBLISHES_TO"]

            [[schema.entity_fields]]
            name = "language"
            kind = "text"

            [[schema.entity_fields]]
            name = "tier"
            kind = "enum"
            values = ["frontend", "backend"]
            "#,
        )
        .unwrap();

        let schema = config.schema.build().unwrap();
        assert!(schema.is_valid_relation_type("PUBLISHES_TO"));
        assert_eq!(schema.entity_fields().len(), 2);
        assert_eq!(schema.normalize_entity_type("Person"), "Other");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_NAMESPACE, "tenant"),
            (ENV_QDRANT_URL, "http://qdrant:6333"),
            (ENV_OLLAMA_URL, " "),
        ]);
        let mut config = RagConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.namespace.as_deref(), Some("tenant"));
        assert_eq!(config.backends.qdrant.unwrap().url, "http://qdrant:6333");
        assert_eq!(config.backends.ollama.base_url, "http://localhost:11434");
        assert!(config.backends.neo4j.is_none());
    }

    #[test]
    fn test_presets() {
        let fast = RagConfig::fast();
        assert!(fast.pipeline().extraction_cache);
        assert_eq!(fast.pipeline().max_parallel_insert, 8);

        let accurate = RagConfig::accurate();
        assert!(!accurate.pipeline().extraction_cache);
        assert_eq!(accurate.pipeline().consistency, ExtractionConsistency::Serialized);
        assert_eq!(accurate.request_timeout(), Duration::from_secs(120));
    }
}
