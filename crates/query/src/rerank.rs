use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::OllamaClient;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Characters of each candidate shown to the model
const MAX_DOCUMENT_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    /// Position in the `documents` slice passed to `rerank`
    pub index: usize,
    pub score: f32,
}

/// Second-pass scorer. Returns candidates best first.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<RerankResult>>;
}

/// Asks an Ollama model to grade each candidate from 0 to 1.
pub struct LlmReranker {
    llm: OllamaClient,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(default)]
    scores: Vec<RerankResult>,
}

impl LlmReranker {
    pub fn new(llm: OllamaClient) -> Self {
        Self { llm }
    }

    pub fn default() -> Self {
        Self::new(OllamaClient::default())
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = build_rerank_prompt(query, documents);
        let raw = self.llm
            .generate_json(&prompt)
            .await
            .context("Failed to rerank results")?;

        parse_rerank(&raw, documents.len(), limit)
    }
}

pub fn build_rerank_prompt(query: &str, documents: &[String]) -> String {
    let mut listing = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let excerpt: String = doc.chars().take(MAX_DOCUMENT_CHARS).collect();
        listing.push_str(&format!("[{}] {}\n\n", i, excerpt));
    }

    format!(
        r#"You are ranking search results by how well they answer a question.

QUESTION: {}

CANDIDATES:
{}
INSTRUCTIONS:
- Give every candidate a relevance score between 0 and 1
- Refer to candidates by their number in brackets
- Respond with JSON only, in this shape:
{{"scores": [{{"index": 0, "score": 0.9}}]}}
"#,
        query, listing
    )
}

/// Parse the model's grades. Out-of-range and repeated indexes are ignored;
/// candidates the model skipped follow the graded ones with score 0 in
/// their original order.
pub fn parse_rerank(raw: &str, count: usize, limit: Option<usize>) -> Result<Vec<RerankResult>> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => raw.trim(),
    };
    let response: RerankResponse =
        serde_json::from_str(json).context("Failed to parse rerank response")?;

    let mut seen = HashSet::new();
    let mut ranked: Vec<RerankResult> = response
        .scores
        .into_iter()
        .filter(|r| r.index < count && r.score.is_finite() && seen.insert(r.index))
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.index.cmp(&b.index)));

    ranked.extend(
        (0..count)
            .filter(|i| !seen.contains(i))
            .map(|index| RerankResult { index, score: 0.0 }),
    );

    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    Ok(ranked)
}
