use anyhow::Result;
use std::collections::HashSet;

use crate::engine::{QueryContext, QueryEngine};
use crate::types::SearchResult;

impl QueryEngine {
    /// Vector search over twice the limit, then rescore by whether each
    /// chunk mentions a query entity or one of its direct neighbors.
    pub(crate) async fn local_search(
        &self,
        query: &str,
        context: &QueryContext,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut mentions = context.names.clone();
        for seed in &context.seeds {
            for entity in self.storage.graph.traverse(&seed.id, 1, None).await? {
                mentions.push(entity.name);
            }
        }
        let mentions = dedupe_case_insensitive(mentions);

        let mut results = self.vector_search(query, limit.saturating_mul(2)).await?;
        apply_mention_boost(
            &mut results,
            &mentions,
            self.config.local_boost,
            self.config.local_penalty,
        );
        results.truncate(limit);
        Ok(results)
    }
}

/// Multiply the score of every result whose content contains one of
/// `mentions` (case-insensitive) by `boost` and every other result by
/// `penalty`, then sort best first. Nothing is removed. With no mentions
/// the scores are left alone.
pub fn apply_mention_boost(
    results: &mut [SearchResult],
    mentions: &[String],
    boost: f32,
    penalty: f32,
) {
    let needles: Vec<String> = mentions
        .iter()
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty())
        .collect();
    if needles.is_empty() {
        return;
    }

    for result in results.iter_mut() {
        let content = result.content.to_lowercase();
        if needles.iter().any(|n| content.contains(n.as_str())) {
            result.score *= boost;
        } else {
            result.score *= penalty;
        }
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn dedupe_case_insensitive(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(n.to_lowercase()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f32, content: &str) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            score,
            content: content.to_string(),
            document_id: None,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_mentions_are_boosted_not_filtered() {
        let mut results = vec![
            result("a", 0.9, "weather report"),
            result("b", 0.5, "ServiceA writes to the ledger"),
            result("c", 0.4, "nothing relevant"),
        ];

        apply_mention_boost(&mut results, &["servicea".to_string()], 1.5, 0.5);

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!((results[0].score - 0.75).abs() < 1e-6);
        assert!((results[1].score - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_no_mentions_keeps_scores() {
        let mut results = vec![result("a", 0.9, "x"), result("b", 0.3, "y")];
        apply_mention_boost(&mut results, &[" ".to_string()], 1.5, 0.5);
        assert_eq!(results[0].score, 0.9);
        assert_eq!(results[1].score, 0.3);
    }

    #[test]
    fn test_dedupe_keeps_first_spelling() {
        let names = vec!["ServiceA".to_string(), "servicea".to_string(), "DB".to_string()];
        assert_eq!(dedupe_case_insensitive(names), vec!["ServiceA", "DB"]);
    }
}
