use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// A scanned source file, normalized to text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    pub fn new(source: &str, content: String) -> Self {
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), Value::String(source.to_string()));

        Self {
            id: generate_doc_id(source),
            content,
            metadata,
        }
    }

    /// Source path recorded at scan time
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }

    /// Digest of the text only; metadata changes do not trigger re-indexing.
    pub fn content_hash(&self) -> String {
        content_digest(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub content: String,
    pub index: usize,
    pub start_token: usize,
    pub end_token: usize,
}

impl Chunk {
    pub fn new(
        doc_id: &str,
        index: usize,
        content: String,
        tokens: (usize, usize),
    ) -> Self {
        Self {
            id: generate_chunk_id(doc_id, index),
            doc_id: doc_id.to_string(),
            content,
            index,
            start_token: tokens.0,
            end_token: tokens.1,
        }
    }

    pub fn token_count(&self) -> usize {
        self.end_token - self.start_token
    }
}

/// Generate a stable document ID from file path
pub fn generate_doc_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
}

/// Chunk ids share the document id as prefix so a document's chunks can be
/// listed with a single prefix scan.
pub fn generate_chunk_id(doc_id: &str, index: usize) -> String {
    format!("{}-{}", doc_id, index)
}

/// Key prefix matching every chunk id of `doc_id`.
pub fn chunk_id_prefix(doc_id: &str) -> String {
    format!("{}-", doc_id)
}

/// Full hex SHA-256 of `text`.
pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
