//! Vector store abstraction and implementations.
//!
//! The [`VectorStore`] trait is the narrow interface the pipeline and the
//! retriever use: check for a collection, create it, upsert points by id,
//! and run a similarity search. Two implementations:
//!
//! - [`QdrantStore`]: a Qdrant server over gRPC.
//! - [`InMemoryVectorStore`]: brute-force cosine search over process memory,
//!   for tests and offline dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::value::Kind;
use qdrant_client::qdrant::vectors_config::Config as QdrantVectorsConfig;
use qdrant_client::qdrant::{
    point_id::PointIdOptions, CreateCollectionBuilder, Distance as QdrantDistance, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tokio::sync::RwLock;

use crate::config::QdrantConfig;
use crate::error::VectorStoreError;
use crate::models::{CollectionParams, Distance, Point, ScoredPoint};

/// Storage backend for embedding vectors.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError>;

    /// Create a collection.
    ///
    /// Creating a collection that already exists with the same parameters is
    /// a no-op; with different parameters it is [`VectorStoreError::Conflict`].
    async fn create_collection(
        &self,
        name: &str,
        params: CollectionParams,
    ) -> Result<(), VectorStoreError>;

    /// Insert or replace points by id.
    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<(), VectorStoreError>;

    /// Return up to `limit` points most similar to `vector`, best first.
    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError>;
}

// ============ Qdrant ============

/// [`VectorStore`] backed by a Qdrant server.
pub struct QdrantStore {
    client: Qdrant,
    upsert_batch_size: usize,
}

impl std::fmt::Debug for QdrantStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantStore")
            .field("upsert_batch_size", &self.upsert_batch_size)
            .finish_non_exhaustive()
    }
}

impl QdrantStore {
    /// Build a client for the configured URL. No request is made until the
    /// first operation.
    pub fn new(config: &QdrantConfig) -> Result<Self, VectorStoreError> {
        tracing::info!("Connecting to Qdrant at {}", config.url);

        let mut builder =
            Qdrant::from_url(&config.url).timeout(Duration::from_secs(config.timeout_secs));
        if let Some(key) = &config.api_key {
            builder = builder.api_key(key.clone());
        }
        let client = builder
            .build()
            .map_err(|e| VectorStoreError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            upsert_batch_size: config.upsert_batch_size.max(1),
        })
    }

    /// Vector size and raw distance of an existing collection, if they can be read.
    async fn existing_vectors(&self, name: &str) -> Result<Option<(u64, i32)>, VectorStoreError> {
        let info = self
            .client
            .collection_info(name)
            .await
            .map_err(|e| VectorStoreError::Collection(e.to_string()))?;

        let params = info
            .result
            .and_then(|i| i.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config);

        Ok(match params {
            Some(QdrantVectorsConfig::Params(p)) => Some((p.size, p.distance)),
            _ => None,
        })
    }
}

/// Compare an existing collection's vector size and distance against the
/// requested parameters. A distance this crate does not model never matches.
fn check_existing(
    name: &str,
    size: u64,
    raw_distance: i32,
    requested: CollectionParams,
) -> Result<(), VectorStoreError> {
    let distance = from_qdrant_distance(raw_distance);
    if size as usize == requested.dimension && distance == Some(requested.distance) {
        return Ok(());
    }
    let distance_name = match distance {
        Some(d) => d.to_string(),
        None => QdrantDistance::try_from(raw_distance)
            .map(|d| d.as_str_name().to_lowercase())
            .unwrap_or_else(|_| format!("distance #{}", raw_distance)),
    };
    Err(VectorStoreError::Conflict {
        name: name.to_string(),
        existing: format!("dimension {} / {}", size, distance_name),
        requested: requested.to_string(),
    })
}

fn to_qdrant_distance(distance: Distance) -> QdrantDistance {
    match distance {
        Distance::Cosine => QdrantDistance::Cosine,
        Distance::Dot => QdrantDistance::Dot,
        Distance::Euclid => QdrantDistance::Euclid,
    }
}

fn from_qdrant_distance(raw: i32) -> Option<Distance> {
    match QdrantDistance::try_from(raw) {
        Ok(QdrantDistance::Cosine) => Some(Distance::Cosine),
        Ok(QdrantDistance::Dot) => Some(Distance::Dot),
        Ok(QdrantDistance::Euclid) => Some(Distance::Euclid),
        _ => None,
    }
}

fn to_point_struct(point: Point) -> Result<PointStruct, VectorStoreError> {
    let payload: HashMap<String, qdrant_client::qdrant::Value> =
        serde_json::from_value(serde_json::Value::Object(point.payload.into_iter().collect()))
            .map_err(|e| VectorStoreError::Upsert(format!("invalid payload: {}", e)))?;
    Ok(PointStruct::new(point.id, point.vector, payload))
}

fn from_qdrant_point(point: qdrant_client::qdrant::ScoredPoint) -> ScoredPoint {
    let payload = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| {
            let json = match v.kind? {
                Kind::StringValue(s) => serde_json::Value::String(s),
                Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
                Kind::DoubleValue(d) => {
                    serde_json::Number::from_f64(d).map(serde_json::Value::Number)?
                }
                Kind::BoolValue(b) => serde_json::Value::Bool(b),
                _ => return None,
            };
            Some((k, json))
        })
        .collect();

    let id = match point.id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };

    ScoredPoint {
        id,
        score: point.score,
        payload,
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError> {
        self.client
            .collection_exists(name)
            .await
            .map_err(|e| VectorStoreError::Connection(e.to_string()))
    }

    async fn create_collection(
        &self,
        name: &str,
        params: CollectionParams,
    ) -> Result<(), VectorStoreError> {
        if self.collection_exists(name).await? {
            return match self.existing_vectors(name).await? {
                Some((size, distance)) => check_existing(name, size, distance, params),
                None => Ok(()),
            };
        }

        tracing::info!("Creating collection '{}' with {}", name, params);
        self.client
            .create_collection(CreateCollectionBuilder::new(name).vectors_config(
                VectorParamsBuilder::new(params.dimension as u64, to_qdrant_distance(params.distance)),
            ))
            .await
            .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<(), VectorStoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let structs = points
            .into_iter()
            .map(to_point_struct)
            .collect::<Result<Vec<_>, _>>()?;

        for batch in structs.chunks(self.upsert_batch_size) {
            self.client
                .upsert_points(UpsertPointsBuilder::new(name, batch.to_vec()).wait(true))
                .await
                .map_err(|e| VectorStoreError::Upsert(e.to_string()))?;
            tracing::debug!("Upserted {} points into '{}'", batch.len(), name);
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let response = self
            .client
            .search_points(SearchPointsBuilder::new(name, vector, limit as u64).with_payload(true))
            .await
            .map_err(|e| VectorStoreError::Search(e.to_string()))?;
        Ok(response.result.into_iter().map(from_qdrant_point).collect())
    }
}

// ============ In-memory ============

struct MemoryCollection {
    params: CollectionParams,
    /// Insertion-ordered; replacing a point keeps its slot.
    points: Vec<Point>,
}

/// In-memory [`VectorStore`] for tests and dry runs.
///
/// Search is brute-force cosine similarity over all stored points,
/// regardless of the collection's configured distance.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
    create_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `create_collection` has been called.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// How many times `upsert` has been called.
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of a collection's points, in insertion order.
    pub async fn points(&self, name: &str) -> Vec<Point> {
        self.collections
            .read()
            .await
            .get(name)
            .map(|c| c.points.clone())
            .unwrap_or_default()
    }

    pub async fn collection_params(&self, name: &str) -> Option<CollectionParams> {
        self.collections.read().await.get(name).map(|c| c.params)
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn create_collection(
        &self,
        name: &str,
        params: CollectionParams,
    ) -> Result<(), VectorStoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().await;
        if let Some(existing) = collections.get(name) {
            if existing.params != params {
                return Err(VectorStoreError::Conflict {
                    name: name.to_string(),
                    existing: existing.params.to_string(),
                    requested: params.to_string(),
                });
            }
            return Ok(());
        }
        collections.insert(
            name.to_string(),
            MemoryCollection {
                params,
                points: Vec::new(),
            },
        );
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<(), VectorStoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| VectorStoreError::Collection(format!("collection '{}' not found", name)))?;

        for point in points {
            if point.vector.len() != collection.params.dimension {
                return Err(VectorStoreError::Upsert(format!(
                    "point {} has dimension {}, collection '{}' expects {}",
                    point.id,
                    point.vector.len(),
                    name,
                    collection.params.dimension
                )));
            }
            match collection.points.iter_mut().find(|p| p.id == point.id) {
                Some(slot) => *slot = point,
                None => collection.points.push(point),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, VectorStoreError> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(name)
            .ok_or_else(|| VectorStoreError::Search(format!("collection '{}' not found", name)))?;

        let mut scored: Vec<ScoredPoint> = collection
            .points
            .iter()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_sim(&vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        Ok(scored)
    }
}
