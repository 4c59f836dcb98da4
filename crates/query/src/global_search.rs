use anyhow::Result;
use extract::{Relation, Schema};
use index::{Direction, EntityFilter};
use std::collections::HashSet;

use crate::engine::{QueryContext, QueryEngine};
use crate::types::SearchResult;

impl QueryEngine {
    /// Embed the query together with keywords from the relations around
    /// the query's entities, then run one vector search.
    pub(crate) async fn global_search(
        &self,
        query: &str,
        context: &QueryContext,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let relations = self.keyword_relations(context).await?;
        let keywords = collect_keywords(&relations, &self.schema, self.config.global_keyword_limit);
        let enriched = enrich_query(query, &keywords);

        self.vector_search(&enriched, limit).await
    }

    /// Relations touching the query's entities, or when none were found
    /// the outgoing relations of the first entities in the graph.
    async fn keyword_relations(&self, context: &QueryContext) -> Result<Vec<Relation>> {
        let graph = &self.storage.graph;
        let mut relations = Vec::new();

        if context.seeds.is_empty() {
            let filter = EntityFilter {
                limit: Some(self.config.global_keyword_limit),
                ..EntityFilter::default()
            };
            for entity in graph.get_entities(Some(&filter)).await? {
                relations.extend(graph.get_relations(&entity.id, Direction::Outgoing).await?);
            }
        } else {
            for seed in &context.seeds {
                relations.extend(graph.get_relations(&seed.id, Direction::Both).await?);
            }
        }
        Ok(relations)
    }
}

/// Keywords from relations whose type belongs to the schema vocabulary:
/// the type itself in plain words, then the relation's own keywords.
/// Deduplicated case-insensitively, at most `limit`.
pub fn collect_keywords(relations: &[Relation], schema: &Schema, limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for relation in relations {
        if !schema.is_valid_relation_type(&relation.relation_type) {
            continue;
        }
        let type_words = relation.relation_type.replace('_', " ").to_lowercase();
        for candidate in std::iter::once(type_words).chain(relation.keywords.iter().cloned()) {
            let candidate = candidate.trim().to_string();
            if candidate.is_empty() || !seen.insert(candidate.to_lowercase()) {
                continue;
            }
            if keywords.len() >= limit {
                return keywords;
            }
            keywords.push(candidate);
        }
    }
    keywords
}

pub fn enrich_query(query: &str, keywords: &[String]) -> String {
    if keywords.is_empty() {
        query.to_string()
    } else {
        format!("{} {}", query.trim(), keywords.join(" "))
    }
}
