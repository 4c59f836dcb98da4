use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::normalizer::EntityNormalizer;
use crate::schema::{Fields, Schema};

/// Knowledge-graph node. `id` is always the entity name, so the same name
/// extracted from different chunks lands on one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

impl Entity {
    pub fn new(name: &str, entity_type: &str, description: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            description: description.to_string(),
            source_chunk_ids: Vec::new(),
            fields: Fields::new(),
        }
    }

    pub fn with_source_chunk(mut self, chunk_id: &str) -> Self {
        push_unique(&mut self.source_chunk_ids, chunk_id);
        self
    }

    /// Upsert semantics: `incoming` wins on every field except
    /// `source_chunk_ids`, which accumulate.
    pub fn merge(&mut self, incoming: Entity) {
        let mut chunk_ids = std::mem::take(&mut self.source_chunk_ids);
        for id in &incoming.source_chunk_ids {
            push_unique(&mut chunk_ids, id);
        }
        *self = incoming;
        self.source_chunk_ids = chunk_ids;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub source_chunk_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

impl Relation {
    pub fn new(source_id: &str, relation_type: &str, target_id: &str, description: &str) -> Self {
        Self {
            id: relation_id(source_id, relation_type, target_id),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relation_type: relation_type.to_string(),
            description: description.to_string(),
            keywords: Vec::new(),
            source_chunk_ids: Vec::new(),
            fields: Fields::new(),
        }
    }

    pub fn with_source_chunk(mut self, chunk_id: &str) -> Self {
        push_unique(&mut self.source_chunk_ids, chunk_id);
        self
    }

    /// Same upsert rule as [`Entity::merge`]: a repeated triple overwrites,
    /// only the chunk provenance accumulates.
    pub fn merge(&mut self, incoming: Relation) {
        let mut chunk_ids = std::mem::take(&mut self.source_chunk_ids);
        for id in &incoming.source_chunk_ids {
            push_unique(&mut chunk_ids, id);
        }
        *self = incoming;
        self.source_chunk_ids = chunk_ids;
    }
}

/// Relation ids are derived from the triple so duplicates overwrite.
pub fn relation_id(source_id: &str, relation_type: &str, target_id: &str) -> String {
    format!("{}-[{}]->{}", source_id, relation_type, target_id)
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

/// Raw entity as the model returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    #[serde(rename = "type", alias = "relation", default)]
    pub relation_type: String,
    #[serde(default, alias = "evidence")]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Model output for one piece of text. Cached by content digest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// Entities and relations ready to be written for one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

impl ExtractionResult {
    /// Clean names, normalize types and fields against `schema`, and stamp
    /// every record with `chunk_id`. Entities repeated within the result are
    /// merged; relations with an empty endpoint are dropped.
    pub fn to_chunk_graph(&self, schema: &Schema, chunk_id: &str) -> ChunkGraph {
        let normalizer = EntityNormalizer::new();
        let mut graph = ChunkGraph::default();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for extracted in &self.entities {
            let name = normalizer.normalize(&extracted.name);
            if name.is_empty() {
                continue;
            }

            let mut entity = Entity::new(
                &name,
                &schema.normalize_entity_type(extracted.entity_type.trim()),
                extracted.description.trim(),
            )
            .with_source_chunk(chunk_id);
            entity.fields = Schema::normalize_fields(schema.entity_fields(), &extracted.fields);

            match positions.get(&name) {
                Some(&pos) => graph.entities[pos].merge(entity),
                None => {
                    positions.insert(name, graph.entities.len());
                    graph.entities.push(entity);
                }
            }
        }

        let mut relation_positions: HashMap<String, usize> = HashMap::new();
        for extracted in &self.relations {
            let source = normalizer.normalize(&extracted.source);
            let target = normalizer.normalize(&extracted.target);
            if source.is_empty() || target.is_empty() {
                continue;
            }

            let relation_type = schema.normalize_relation_type(extracted.relation_type.trim());
            let mut relation = Relation::new(&source, &relation_type, &target, extracted.description.trim())
                .with_source_chunk(chunk_id);
            relation.keywords = extracted
                .keywords
                .iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            relation.fields = Schema::normalize_fields(schema.relation_fields(), &extracted.fields);

            match relation_positions.get(&relation.id) {
                Some(&pos) => graph.relations[pos].merge(relation),
                None => {
                    relation_positions.insert(relation.id.clone(), graph.relations.len());
                    graph.relations.push(relation);
                }
            }
        }

        graph
    }
}
