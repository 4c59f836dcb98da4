//! In-process backends built on `DashMap`. Used for tests, embedding the
//! library without services, and as the reference behavior for the
//! storage contracts.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use extract::{Entity, Relation, FALLBACK_TYPE};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::storage::{
    matches_filter, Direction, EntityFilter, GraphStats, GraphStorage, KvStorage, MetadataFilter,
    VectorMatch, VectorRecord, VectorStorage, DEFAULT_PATH_DEPTH,
};

#[derive(Default)]
pub struct MemoryKvStorage {
    entries: Arc<DashMap<String, Value>>,
}

impl MemoryKvStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStorage for MemoryKvStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.entries
            .iter()
            .map(|r| r.key().clone())
            .filter(|k| prefix.map_or(true, |p| k.starts_with(p)))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVectorStorage {
    records: Arc<DashMap<String, VectorRecord>>,
}

impl MemoryVectorStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStorage for MemoryVectorStorage {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            self.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let mut matches = Vec::new();

        for entry in self.records.iter() {
            let record = entry.value();
            if !matches_filter(&record.metadata, filter) {
                continue;
            }
            if record.vector.len() != vector.len() {
                anyhow::bail!(
                    "Vector dimension mismatch for `{}`: stored {}, query {}",
                    record.id,
                    record.vector.len(),
                    vector.len()
                );
            }
            matches.push(VectorMatch {
                id: record.id.clone(),
                score: cosine_similarity(vector, &record.vector),
                metadata: record.metadata.clone(),
            });
        }

        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.records.remove(id);
        }
        Ok(())
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize> {
        Ok(self.records
            .iter()
            .filter(|r| matches_filter(&r.value().metadata, filter))
            .count())
    }
}

/// Graph held as two maps; relation lookups scan all relations.
#[derive(Default)]
pub struct MemoryGraphStorage {
    entities: Arc<DashMap<String, Entity>>,
    relations: Arc<DashMap<String, Relation>>,
}

impl MemoryGraphStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn relations_of(&self, entity_id: &str, direction: Direction) -> Vec<Relation> {
        let mut found: Vec<Relation> = self.relations
            .iter()
            .filter(|r| {
                let rel = r.value();
                match direction {
                    Direction::Outgoing => rel.source_id == entity_id,
                    Direction::Incoming => rel.target_id == entity_id,
                    Direction::Both => rel.source_id == entity_id || rel.target_id == entity_id,
                }
            })
            .map(|r| r.value().clone())
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    fn entity_or_placeholder(&self, id: &str) -> Entity {
        self.entities
            .get(id)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| Entity::new(id, FALLBACK_TYPE, ""))
    }
}

#[async_trait]
impl GraphStorage for MemoryGraphStorage {
    async fn add_entity(&self, entity: Entity) -> Result<()> {
        self.entities
            .entry(entity.id.clone())
            .and_modify(|existing| existing.merge(entity.clone()))
            .or_insert(entity);
        Ok(())
    }

    async fn add_relation(&self, relation: Relation) -> Result<()> {
        self.relations
            .entry(relation.id.clone())
            .and_modify(|existing| existing.merge(relation.clone()))
            .or_insert(relation);
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        Ok(self.entities.get(id).map(|e| e.value().clone()))
    }

    async fn get_entities(&self, filter: Option<&EntityFilter>) -> Result<Vec<Entity>> {
        let mut entities: Vec<Entity> = self.entities
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| filter.map_or(true, |f| f.matches(e)))
            .collect();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = filter.and_then(|f| f.limit) {
            entities.truncate(limit);
        }
        Ok(entities)
    }

    async fn get_relations(&self, entity_id: &str, direction: Direction) -> Result<Vec<Relation>> {
        Ok(self.relations_of(entity_id, direction))
    }

    async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relation_types: Option<&[String]>,
    ) -> Result<Vec<Entity>> {
        let Some(start) = self.entities.get(start_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };

        let mut visited = HashSet::from([start_id.to_string()]);
        let mut queue = VecDeque::from([(start_id.to_string(), 0usize)]);
        let mut reached = vec![start];

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            for relation in self.relations_of(&current, Direction::Both) {
                if let Some(types) = relation_types {
                    if !types.contains(&relation.relation_type) {
                        continue;
                    }
                }
                let neighbor = if relation.source_id == current {
                    relation.target_id
                } else {
                    relation.source_id
                };
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                if let Some(entity) = self.entities.get(&neighbor) {
                    reached.push(entity.value().clone());
                }
                queue.push_back((neighbor, hops + 1));
            }
        }

        Ok(reached)
    }

    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: Option<usize>,
    ) -> Result<Vec<Entity>> {
        if !self.entities.contains_key(from_id) || !self.entities.contains_key(to_id) {
            return Ok(Vec::new());
        }
        if from_id == to_id {
            return Ok(vec![self.entity_or_placeholder(from_id)]);
        }

        let max_depth = max_depth.unwrap_or(DEFAULT_PATH_DEPTH);
        let mut parents: HashMap<String, String> = HashMap::new();
        let mut visited = HashSet::from([from_id.to_string()]);
        let mut queue = VecDeque::from([(from_id.to_string(), 0usize)]);

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= max_depth {
                continue;
            }
            for relation in self.relations_of(&current, Direction::Outgoing) {
                let next = relation.target_id;
                if !visited.insert(next.clone()) {
                    continue;
                }
                parents.insert(next.clone(), current.clone());
                if next == to_id {
                    let mut ids = vec![next];
                    while let Some(parent) = parents.get(ids.last().map(String::as_str).unwrap_or_default()) {
                        ids.push(parent.clone());
                    }
                    ids.reverse();
                    return Ok(ids.iter().map(|id| self.entity_or_placeholder(id)).collect());
                }
                queue.push_back((next, hops + 1));
            }
        }

        Ok(Vec::new())
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        self.entities.remove(id);
        self.relations.retain(|_, r| r.source_id != id && r.target_id != id);
        Ok(())
    }

    async fn delete_relation(&self, id: &str) -> Result<()> {
        self.relations.remove(id);
        Ok(())
    }

    async fn scoped_stats(&self, id_prefix: &str) -> Result<GraphStats> {
        Ok(GraphStats {
            entity_count: self.entities.iter().filter(|e| e.key().starts_with(id_prefix)).count(),
            relation_count: self.relations.iter().filter(|r| r.key().starts_with(id_prefix)).count(),
        })
    }
}
