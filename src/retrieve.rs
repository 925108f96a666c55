//! Similarity retrieval over an ingested collection.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::{embed_query, EmbeddingClient, RetryPolicy};
use crate::models::ScoredChunk;
use crate::vector_store::VectorStore;

/// Finds the chunks most relevant to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `k` chunks, best match first.
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>>;
}

/// [`Retriever`] that embeds the query and searches one collection.
pub struct VectorRetriever {
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    collection: String,
    retry: RetryPolicy,
}

impl VectorRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let vector = embed_query(self.embedder.as_ref(), &self.retry, query).await?;
        let hits = self.store.search(&self.collection, vector, k).await?;

        let chunks: Vec<ScoredChunk> = hits.iter().filter_map(ScoredChunk::from_point).collect();
        if chunks.len() < hits.len() {
            tracing::warn!(
                "{} search hits in '{}' had no text payload",
                hits.len() - chunks.len(),
                self.collection
            );
        }
        tracing::debug!("Retrieved {} chunks from '{}'", chunks.len(), self.collection);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::error::EmbedError;
    use crate::models::{CollectionParams, Distance, Point};
    use crate::vector_store::InMemoryVectorStore;

    /// Maps "alpha" to x, anything else to y.
    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingClient for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.contains("alpha") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
    }

    fn point(id: &str, vector: Vec<f32>, text: Option<&str>) -> Point {
        let mut payload = HashMap::new();
        if let Some(text) = text {
            payload.insert("text".to_string(), serde_json::json!(text));
        }
        payload.insert("source_path".to_string(), serde_json::json!(format!("{id}.py")));
        Point {
            id: id.to_string(),
            vector,
            payload,
        }
    }

    async fn seeded_store() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        store
            .create_collection(
                "repo",
                CollectionParams {
                    dimension: 2,
                    distance: Distance::Cosine,
                },
            )
            .await
            .unwrap();
        store
            .upsert(
                "repo",
                vec![
                    point("a", vec![1.0, 0.0], Some("alpha code")),
                    point("b", vec![0.0, 1.0], Some("beta code")),
                    point("c", vec![0.9, 0.1], None),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_retrieve_ranks_and_decodes_payload() {
        let store = seeded_store().await;
        let retriever = VectorRetriever::new(Arc::new(AxisEmbedder), store, "repo");

        let hits = retriever.retrieve("where is alpha?", 2).await.unwrap();
        assert_eq!(hits.len(), 1, "point without text is dropped");
        assert_eq!(hits[0].text, "alpha code");
        assert_eq!(hits[0].source_path, "a.py");
    }

    #[tokio::test]
    async fn test_retrieve_respects_k() {
        let store = seeded_store().await;
        let retriever = VectorRetriever::new(Arc::new(AxisEmbedder), store, "repo");
        let hits = retriever.retrieve("beta", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "beta code");
    }

    #[tokio::test]
    async fn test_retrieve_from_missing_collection_fails() {
        let store = Arc::new(InMemoryVectorStore::new());
        let retriever = VectorRetriever::new(Arc::new(AxisEmbedder), store, "missing");
        assert!(retriever.retrieve("alpha", 3).await.is_err());
    }
}
