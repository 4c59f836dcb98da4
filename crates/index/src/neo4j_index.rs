use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::{Entity, Fields, Relation, RetryPolicy, FALLBACK_TYPE};
use neo4rs::{Graph, Query, Row};
use tracing::info;

use crate::storage::{Direction, EntityFilter, GraphStats, GraphStorage, DEFAULT_PATH_DEPTH};

const ENTITY_COLUMNS: &str = "n.id AS id, n.name AS name, n.type AS type, \
     n.description AS description, n.source_chunk_ids AS source_chunk_ids, n.fields AS fields";

const RELATION_COLUMNS: &str = "r.id AS id, startNode(r).id AS source_id, \
     endNode(r).id AS target_id, r.type AS type, r.description AS description, \
     r.keywords AS keywords, r.source_chunk_ids AS source_chunk_ids, r.fields AS fields";

/// Appends `$chunk_ids` to an existing list property without duplicates.
fn union_chunk_ids(property: &str) -> String {
    format!(
        "reduce(acc = coalesce({p}, []), c IN $chunk_ids | \
         CASE WHEN c IN acc THEN acc ELSE acc + c END)",
        p = property
    )
}

/// Pattern matching the relations of `(a)` in `direction`.
fn relation_pattern(direction: Direction) -> &'static str {
    match direction {
        Direction::Outgoing => "(a:Entity {id: $id})-[r:RELATION]->(b:Entity)",
        Direction::Incoming => "(a:Entity {id: $id})<-[r:RELATION]-(b:Entity)",
        Direction::Both => "(a:Entity {id: $id})-[r:RELATION]-(b:Entity)",
    }
}

fn fields_to_json(fields: &Fields) -> Result<String> {
    serde_json::to_string(fields).context("Failed to serialize fields")
}

fn fields_from_json(raw: Option<String>) -> Fields {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn entity_from_row(row: &Row) -> Result<Entity> {
    let id: String = row.get("id")?;
    Ok(Entity {
        name: row.get("name").unwrap_or_else(|_| id.clone()),
        entity_type: row.get("type").unwrap_or_else(|_| FALLBACK_TYPE.to_string()),
        description: row.get("description").unwrap_or_default(),
        source_chunk_ids: row.get("source_chunk_ids").unwrap_or_default(),
        fields: fields_from_json(row.get("fields").ok()),
        id,
    })
}

fn relation_from_row(row: &Row) -> Result<Relation> {
    Ok(Relation {
        id: row.get("id")?,
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        relation_type: row.get("type").unwrap_or_default(),
        description: row.get("description").unwrap_or_default(),
        keywords: row.get("keywords").unwrap_or_default(),
        source_chunk_ids: row.get("source_chunk_ids").unwrap_or_default(),
        fields: fields_from_json(row.get("fields").ok()),
    })
}

/// Graph storage in Neo4j. Entities are `:Entity` nodes keyed by `id`;
/// relations are `:RELATION` edges carrying their own `id` and `type`.
pub struct Neo4jGraphStorage {
    graph: Graph,
    retry: RetryPolicy,
}

impl Neo4jGraphStorage {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            retry: RetryPolicy::default(),
        }
    }

    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let graph = Graph::new(uri, user, password)
            .await
            .context("Failed to connect to Neo4j")?;
        Ok(Self::new(graph))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create the uniqueness constraint and relation index
    pub async fn init_schema(&self) -> Result<()> {
        info!("Creating Neo4j constraints and indexes");

        self.run(
            "neo4j.init_schema",
            Query::new(
                "CREATE CONSTRAINT entity_id_unique IF NOT EXISTS \
                 FOR (e:Entity) REQUIRE e.id IS UNIQUE"
                    .to_string(),
            ),
        )
        .await
        .context("Failed to create constraint on Entity.id")?;

        self.run(
            "neo4j.init_schema",
            Query::new(
                "CREATE INDEX relation_id_index IF NOT EXISTS \
                 FOR ()-[r:RELATION]-() ON (r.id)"
                    .to_string(),
            ),
        )
        .await
        .context("Failed to create index on RELATION.id")?;

        info!("Neo4j schema ready");
        Ok(())
    }

    async fn run(&self, operation: &str, query: Query) -> Result<()> {
        self.retry
            .retry(operation, || async {
                self.graph.run(query.clone()).await?;
                Ok::<_, anyhow::Error>(())
            })
            .await
    }

    async fn fetch(&self, operation: &str, query: Query) -> Result<Vec<Row>> {
        self.retry
            .retry(operation, || async {
                let mut result = self.graph.execute(query.clone()).await?;
                let mut rows = Vec::new();
                while let Some(row) = result.next().await? {
                    rows.push(row);
                }
                Ok::<_, anyhow::Error>(rows)
            })
            .await
    }

    async fn count(&self, operation: &str, cypher: &str, id_prefix: &str) -> Result<usize> {
        let query = Query::new(cypher.to_string()).param("prefix", id_prefix);
        let rows = self.fetch(operation, query).await?;
        let count = match rows.first() {
            Some(row) => row.get::<i64>("count").unwrap_or(0) as usize,
            None => 0,
        };
        Ok(count)
    }
}

#[async_trait]
impl GraphStorage for Neo4jGraphStorage {
    async fn add_entity(&self, entity: Entity) -> Result<()> {
        let cypher = format!(
            "MERGE (e:Entity {{id: $id}}) \
             SET e.name = $name, \
                 e.type = $type, \
                 e.description = $description, \
                 e.fields = $fields, \
                 e.source_chunk_ids = {}",
            union_chunk_ids("e.source_chunk_ids")
        );
        let query = Query::new(cypher)
            .param("id", entity.id.clone())
            .param("name", entity.name.clone())
            .param("type", entity.entity_type.clone())
            .param("description", entity.description.clone())
            .param("fields", fields_to_json(&entity.fields)?)
            .param("chunk_ids", entity.source_chunk_ids.clone());

        self.run("neo4j.add_entity", query)
            .await
            .context("Failed to index entity")
    }

    /// Missing endpoints are created as placeholders, later filled in by
    /// [`add_entity`](GraphStorage::add_entity).
    async fn add_relation(&self, relation: Relation) -> Result<()> {
        let cypher = format!(
            "MERGE (s:Entity {{id: $source_id}}) \
             ON CREATE SET s.name = $source_id, s.type = $fallback, s.description = '' \
             MERGE (t:Entity {{id: $target_id}}) \
             ON CREATE SET t.name = $target_id, t.type = $fallback, t.description = '' \
             MERGE (s)-[r:RELATION {{id: $id}}]->(t) \
             SET r.type = $type, \
                 r.description = $description, \
                 r.keywords = $keywords, \
                 r.fields = $fields, \
                 r.source_chunk_ids = {}",
            union_chunk_ids("r.source_chunk_ids")
        );
        let query = Query::new(cypher)
            .param("id", relation.id.clone())
            .param("source_id", relation.source_id.clone())
            .param("target_id", relation.target_id.clone())
            .param("fallback", FALLBACK_TYPE)
            .param("type", relation.relation_type.clone())
            .param("description", relation.description.clone())
            .param("keywords", relation.keywords.clone())
            .param("fields", fields_to_json(&relation.fields)?)
            .param("chunk_ids", relation.source_chunk_ids.clone());

        self.run("neo4j.add_relation", query)
            .await
            .context("Failed to index relation")
    }

    async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let query = Query::new(format!(
            "MATCH (n:Entity {{id: $id}}) RETURN {}",
            ENTITY_COLUMNS
        ))
        .param("id", id.to_string());

        let rows = self.fetch("neo4j.get_entity", query).await?;
        rows.first().map(entity_from_row).transpose()
    }

    async fn get_entities(&self, filter: Option<&EntityFilter>) -> Result<Vec<Entity>> {
        let mut conditions = Vec::new();
        if filter.and_then(|f| f.entity_type.as_ref()).is_some() {
            conditions.push("n.type = $entity_type");
        }
        if filter.and_then(|f| f.name_contains.as_ref()).is_some() {
            conditions.push("toLower(n.name) CONTAINS toLower($name_contains)");
        }

        let mut cypher = String::from("MATCH (n:Entity)");
        if !conditions.is_empty() {
            cypher.push_str(" WHERE ");
            cypher.push_str(&conditions.join(" AND "));
        }
        cypher.push_str(&format!(" RETURN {} ORDER BY n.id", ENTITY_COLUMNS));
        if let Some(limit) = filter.and_then(|f| f.limit) {
            cypher.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query = Query::new(cypher);
        if let Some(filter) = filter {
            if let Some(t) = &filter.entity_type {
                query = query.param("entity_type", t.clone());
            }
            if let Some(name) = &filter.name_contains {
                query = query.param("name_contains", name.clone());
            }
        }

        let rows = self.fetch("neo4j.get_entities", query).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn get_relations(&self, entity_id: &str, direction: Direction) -> Result<Vec<Relation>> {
        let query = Query::new(format!(
            "MATCH {} RETURN DISTINCT {} ORDER BY id",
            relation_pattern(direction),
            RELATION_COLUMNS
        ))
        .param("id", entity_id.to_string());

        let rows = self.fetch("neo4j.get_relations", query).await?;
        rows.iter().map(relation_from_row).collect()
    }

    async fn traverse(
        &self,
        start_id: &str,
        depth: usize,
        relation_types: Option<&[String]>,
    ) -> Result<Vec<Entity>> {
        let type_filter = if relation_types.is_some() {
            "WHERE all(rel IN relationships(p) WHERE rel.type IN $types) "
        } else {
            ""
        };
        let cypher = format!(
            "MATCH p = (start:Entity {{id: $id}})-[:RELATION*0..{depth}]-(n:Entity) \
             {type_filter}\
             WITH n, min(length(p)) AS hops \
             RETURN {columns} ORDER BY hops, n.id",
            depth = depth,
            type_filter = type_filter,
            columns = ENTITY_COLUMNS
        );

        let mut query = Query::new(cypher).param("id", start_id.to_string());
        if let Some(types) = relation_types {
            query = query.param("types", types.to_vec());
        }

        let rows = self.fetch("neo4j.traverse", query).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn find_path(
        &self,
        from_id: &str,
        to_id: &str,
        max_depth: Option<usize>,
    ) -> Result<Vec<Entity>> {
        if from_id == to_id {
            return Ok(self.get_entity(from_id).await?.into_iter().collect());
        }

        let cypher = format!(
            "MATCH (a:Entity {{id: $from}}), (b:Entity {{id: $to}}) \
             MATCH p = shortestPath((a)-[:RELATION*..{}]->(b)) \
             UNWIND range(0, length(p)) AS i \
             WITH nodes(p)[i] AS n, i \
             RETURN {} ORDER BY i",
            max_depth.unwrap_or(DEFAULT_PATH_DEPTH),
            ENTITY_COLUMNS
        );
        let query = Query::new(cypher)
            .param("from", from_id.to_string())
            .param("to", to_id.to_string());

        let rows = self.fetch("neo4j.find_path", query).await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn delete_entity(&self, id: &str) -> Result<()> {
        let query = Query::new("MATCH (n:Entity {id: $id}) DETACH DELETE n".to_string())
            .param("id", id.to_string());
        self.run("neo4j.delete_entity", query).await
    }

    async fn delete_relation(&self, id: &str) -> Result<()> {
        let query = Query::new("MATCH ()-[r:RELATION {id: $id}]->() DELETE r".to_string())
            .param("id", id.to_string());
        self.run("neo4j.delete_relation", query).await
    }

    async fn scoped_stats(&self, id_prefix: &str) -> Result<GraphStats> {
        let entity_count = self
            .count(
                "neo4j.stats",
                "MATCH (e:Entity) WHERE e.id STARTS WITH $prefix RETURN count(e) AS count",
                id_prefix,
            )
            .await?;
        let relation_count = self
            .count(
                "neo4j.stats",
                "MATCH ()-[r:RELATION]->() WHERE r.id STARTS WITH $prefix RETURN count(r) AS count",
                id_prefix,
            )
            .await?;

        Ok(GraphStats {
            entity_count,
            relation_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_union_expression() {
        let expr = union_chunk_ids("e.source_chunk_ids");
        assert!(expr.starts_with("reduce(acc = coalesce(e.source_chunk_ids, [])"));
        assert!(expr.contains("CASE WHEN c IN acc THEN acc ELSE acc + c END"));
    }

    #[test]
    fn test_relation_patterns_by_direction() {
        assert!(relation_pattern(Direction::Outgoing).contains("]->(b"));
        assert!(relation_pattern(Direction::Incoming).contains("<-[r"));
        let both = relation_pattern(Direction::Both);
        assert!(!both.contains("->") && !both.contains("<-"));
    }

    #[test]
    fn test_fields_survive_json_encoding() {
        let mut fields = Fields::new();
        fields.insert("layer".to_string(), extract::FieldValue::Tag("backend".to_string()));

        let encoded = fields_to_json(&fields).unwrap();
        assert_eq!(fields_from_json(Some(encoded)), fields);
        assert!(fields_from_json(Some("not json".to_string())).is_empty());
        assert!(fields_from_json(None).is_empty());
    }
}
