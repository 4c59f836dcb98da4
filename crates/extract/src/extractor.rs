use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;

use crate::llm::OllamaClient;
use crate::prompt;
use crate::schema::Schema;
use crate::types::ExtractionResult;

/// Turns text into entities and relations.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    /// `known_entities` are names already in the graph, offered so the model
    /// can reuse them instead of inventing variants.
    async fn extract_entities(
        &self,
        content: &str,
        known_entities: &[String],
        schema: &Schema,
    ) -> Result<ExtractionResult>;
}

pub struct OllamaExtractor {
    llm_client: OllamaClient,
}

impl OllamaExtractor {
    pub fn new(llm_client: OllamaClient) -> Self {
        Self { llm_client }
    }

    pub fn default() -> Self {
        Self::new(OllamaClient::default())
    }
}

#[async_trait]
impl LlmExtractor for OllamaExtractor {
    async fn extract_entities(
        &self,
        content: &str,
        known_entities: &[String],
        schema: &Schema,
    ) -> Result<ExtractionResult> {
        let prompt = prompt::build_extraction_prompt(content, known_entities, schema);

        let json_str = self.llm_client
            .generate_json(&prompt)
            .await
            .context("Failed to extract entities")?;

        parse_extraction(&json_str)
    }
}

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("static regex"));

/// Parse model output, tolerating markdown fences and prose around the
/// JSON object. Malformed JSON is an error, never an empty result.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult> {
    let body = FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);

    let start = body.find('{');
    let end = body.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &body[s..=e],
        _ => body.trim(),
    };

    serde_json::from_str(json).context("Failed to parse extraction result")
}
