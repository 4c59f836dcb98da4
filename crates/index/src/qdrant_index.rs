use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::{RemoteError, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::storage::{Metadata, MetadataFilter, VectorMatch, VectorRecord, VectorStorage};

/// Payload key holding the caller's record id; Qdrant point ids must be
/// integers or UUIDs.
pub const RECORD_ID_KEY: &str = "record_id";

/// Vector storage over the Qdrant REST API.
pub struct QdrantVectorStorage {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Serialize)]
struct UpsertPoints {
    points: Vec<Point>,
}

#[derive(Serialize)]
struct Point {
    id: String,
    vector: Vec<f32>,
    payload: Map<String, Value>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: CollectionResult,
}

#[derive(Deserialize)]
struct CollectionResult {
    collections: Vec<Collection>,
}

#[derive(Deserialize)]
struct Collection {
    name: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

/// Stable point id for a record id.
pub fn point_id(record_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes()).to_string()
}

/// Translate an equality filter into Qdrant's `must` clause form.
pub fn to_qdrant_filter(filter: &MetadataFilter) -> Value {
    let must: Vec<Value> = filter
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

/// Split a stored payload back into record id and caller metadata.
fn split_payload(mut payload: Map<String, Value>) -> Option<(String, Metadata)> {
    let id = match payload.remove(RECORD_ID_KEY)? {
        Value::String(id) => id,
        _ => return None,
    };
    Some((id, payload))
}

impl QdrantVectorStorage {
    pub fn new(base_url: String, collection_name: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            collection_name,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// Create the collection with cosine distance unless it already exists
    pub async fn init_collection(&self, dimension: usize) -> Result<()> {
        let url = format!("{}/collections", self.base_url);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;

        let info: CollectionInfo = response.json().await?;
        let exists = info.result.collections.iter()
            .any(|c| c.name == self.collection_name);

        if exists {
            info!(collection = %self.collection_name, "Collection already exists");
            return Ok(());
        }

        info!(collection = %self.collection_name, dimension, "Creating collection");

        let url = format!("{}/collections/{}", self.base_url, self.collection_name);
        let create_req = CreateCollection {
            vectors: VectorParams {
                size: dimension,
                distance: "Cosine".to_string(),
            },
        };

        let response = self.client
            .put(&url)
            .json(&create_req)
            .send()
            .await?;
        check_status(response)
            .await
            .context("Failed to create collection")?;

        info!(collection = %self.collection_name, "Collection created");
        Ok(())
    }

    fn points_url(&self, action: &str) -> String {
        format!(
            "{}/collections/{}/points{}",
            self.base_url, self.collection_name, action
        )
    }

    async fn upsert_once(&self, points: &UpsertPoints) -> Result<()> {
        let response = self.client
            .put(self.points_url("?wait=true"))
            .json(points)
            .send()
            .await
            .context("Failed to send upsert request")?;
        check_status(response).await?;
        Ok(())
    }

    async fn search_once(&self, body: &Value) -> Result<Vec<VectorMatch>> {
        let response = self.client
            .post(self.points_url("/search"))
            .json(body)
            .send()
            .await
            .context("Failed to send search request")?;
        let response = check_status(response).await?;

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        Ok(parsed
            .result
            .into_iter()
            .filter_map(|point| {
                let (id, metadata) = split_payload(point.payload?)?;
                Some(VectorMatch { id, score: point.score, metadata })
            })
            .collect())
    }

    async fn delete_once(&self, body: &Value) -> Result<()> {
        let response = self.client
            .post(self.points_url("/delete?wait=true"))
            .json(body)
            .send()
            .await
            .context("Failed to send delete request")?;
        check_status(response).await?;
        Ok(())
    }

    async fn count_once(&self, body: &Value) -> Result<usize> {
        let response = self.client
            .post(self.points_url("/count"))
            .json(body)
            .send()
            .await
            .context("Failed to send count request")?;
        let response = check_status(response).await?;

        let parsed: CountResponse = response
            .json()
            .await
            .context("Failed to parse count response")?;
        Ok(parsed.result.count)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::status("qdrant", status.as_u16(), body).into())
}

#[async_trait]
impl VectorStorage for QdrantVectorStorage {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let points = UpsertPoints {
            points: records
                .into_iter()
                .map(|record| {
                    let mut payload = record.metadata;
                    payload.insert(RECORD_ID_KEY.to_string(), Value::String(record.id.clone()));
                    Point {
                        id: point_id(&record.id),
                        vector: record.vector,
                        payload,
                    }
                })
                .collect(),
        };

        self.retry
            .retry("qdrant.upsert", || self.upsert_once(&points))
            .await
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = to_qdrant_filter(filter);
        }

        self.retry
            .retry("qdrant.search", || self.search_once(&body))
            .await
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let points: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        let body = json!({ "points": points });

        self.retry
            .retry("qdrant.delete", || self.delete_once(&body))
            .await
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize> {
        let mut body = json!({ "exact": true });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["filter"] = to_qdrant_filter(filter);
        }

        self.retry
            .retry("qdrant.count", || self.count_once(&body))
            .await
    }
}
