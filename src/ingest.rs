//! Ingestion pipeline orchestration.
//!
//! Drives one run end to end: fetch → filter/load → chunk → ensure
//! collection → embed → upsert. Each stage feeds the next; any fatal failure
//! aborts the run with an [`IngestError`] naming the stage.
//!
//! Points get stable ids derived from `source_path` and chunk index, so
//! re-running against an unchanged repository replaces points instead of
//! duplicating them. The store is not atomic across upsert batches: a
//! failure while upserting can leave earlier batches written.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::Chunker;
use crate::config::Config;
use crate::embedding::{embed_all, EmbeddingClient, OpenAiEmbedder, RetryPolicy};
use crate::error::{EmbedError, IngestError, Stage};
use crate::fetch::{GitFetcher, RepoFetcher};
use crate::filter::FileFilter;
use crate::loader::load_documents;
use crate::models::{Chunk, CollectionParams, Distance, Point};
use crate::vector_store::{QdrantStore, VectorStore};

/// Namespace for point ids. Changing it orphans every stored point.
const POINT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f0c_5b8e_2d1a_4c47_9e3b_8a51_f2d4_7c10);

/// What to ingest and where to put it.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub repo_url: String,
    /// Allowed extensions with the leading dot; empty means all.
    pub extensions: Vec<String>,
    pub collection_name: String,
    pub destination: PathBuf,
}

/// Counters from a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_seen: usize,
    pub files_skipped: usize,
    pub documents: usize,
    pub chunks: usize,
    pub points_upserted: usize,
    pub collection_created: bool,
}

/// The ingestion orchestrator and the collaborators it drives.
pub struct Pipeline {
    fetcher: Arc<dyn RepoFetcher>,
    embedder: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    chunker: Chunker,
    retry: RetryPolicy,
    batch_size: usize,
    concurrency: usize,
    load_concurrency: usize,
    distance: Distance,
}

impl Pipeline {
    /// Build a pipeline with default batching and retry settings.
    pub fn new(
        fetcher: Arc<dyn RepoFetcher>,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        chunker: Chunker,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            store,
            chunker,
            retry: RetryPolicy::default(),
            batch_size: 16,
            concurrency: 2,
            load_concurrency: 8,
            distance: Distance::Cosine,
        }
    }

    /// Build a pipeline whose settings come from `config`.
    pub fn from_config(
        config: &Config,
        fetcher: Arc<dyn RepoFetcher>,
        embedder: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;
        Ok(Self::new(fetcher, embedder, store, chunker)
            .with_retry_policy(RetryPolicy::from_config(&config.embedding))
            .with_batching(config.embedding.batch_size, config.embedding.concurrency)
            .with_load_concurrency(config.ingest.load_concurrency))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_load_concurrency(mut self, load_concurrency: usize) -> Self {
        self.load_concurrency = load_concurrency.max(1);
        self
    }

    /// Run every stage for `request`.
    ///
    /// Returns `Ok` only if every chunk was embedded and upserted.
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();

        // Fetch
        check_cancelled(cancel, Stage::Fetch)?;
        tracing::info!(
            "Fetching {} into {}",
            request.repo_url,
            request.destination.display()
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Cancelled { stage: Stage::Fetch }),
            result = self.fetcher.fetch(&request.repo_url, &request.destination) => {
                result.map_err(|source| IngestError::Fetch { source })?;
            }
        }

        // Filter + load
        check_cancelled(cancel, Stage::Load)?;
        let filter = FileFilter::new(&request.destination, &request.extensions)
            .map_err(|source| IngestError::Load { source })?;
        let loaded = load_documents(&filter, self.load_concurrency)
            .await
            .map_err(|source| IngestError::Load { source })?;
        report.files_seen = loaded.files_seen;
        report.files_skipped = loaded.files_skipped;
        report.documents = loaded.documents.len();
        tracing::info!(
            "Loaded {} documents from {} files ({} skipped)",
            report.documents,
            report.files_seen,
            report.files_skipped
        );

        // Chunk
        check_cancelled(cancel, Stage::Chunk)?;
        let chunks = self.chunker.chunk_all(&loaded.documents);
        drop(loaded);
        report.chunks = chunks.len();
        tracing::info!(
            "Split into {} chunks (size {}, overlap {})",
            chunks.len(),
            self.chunker.chunk_size(),
            self.chunker.chunk_overlap()
        );

        // Ensure collection
        check_cancelled(cancel, Stage::EnsureCollection)?;
        report.collection_created = self.ensure_collection(&request.collection_name).await?;

        if chunks.is_empty() {
            tracing::info!("Nothing to embed");
            return Ok(report);
        }

        // Embed
        check_cancelled(cancel, Stage::Embed)?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_all(
            self.embedder.as_ref(),
            &self.retry,
            &texts,
            self.batch_size,
            self.concurrency,
            cancel,
        )
        .await
        .map_err(|e| match e {
            EmbedError::Cancelled => IngestError::Cancelled { stage: Stage::Embed },
            source => IngestError::Embed { source },
        })?;
        tracing::info!(
            "Embedded {} chunks with {}",
            vectors.len(),
            self.embedder.model_name()
        );

        // Upsert
        check_cancelled(cancel, Stage::Upsert)?;
        let points: Vec<Point> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| build_point(chunk, vector))
            .collect();
        let count = points.len();
        self.store
            .upsert(&request.collection_name, points)
            .await
            .map_err(|source| IngestError::Store {
                stage: Stage::Upsert,
                source,
            })?;
        report.points_upserted = count;
        tracing::info!(
            "Upserted {} points into '{}'",
            count,
            request.collection_name
        );

        Ok(report)
    }

    /// Create the collection if it is missing. Returns whether it was created.
    async fn ensure_collection(&self, name: &str) -> Result<bool, IngestError> {
        let store_err = |source| IngestError::Store {
            stage: Stage::EnsureCollection,
            source,
        };

        if self.store.collection_exists(name).await.map_err(store_err)? {
            tracing::info!("Collection '{}' already exists", name);
            return Ok(false);
        }

        let params = CollectionParams {
            dimension: self.embedder.dims(),
            distance: self.distance,
        };
        self.store
            .create_collection(name, params)
            .await
            .map_err(store_err)?;
        tracing::info!("Created collection '{}' ({})", name, params);
        Ok(true)
    }
}

fn check_cancelled(cancel: &CancellationToken, stage: Stage) -> Result<(), IngestError> {
    if cancel.is_cancelled() {
        tracing::warn!("Ingestion cancelled before {}", stage);
        return Err(IngestError::Cancelled { stage });
    }
    Ok(())
}

/// Stable point id for a chunk: UUIDv5 of `source_path#index`.
pub fn point_id(source_path: &str, index: usize) -> String {
    let key = format!("{}#{}", source_path, index);
    Uuid::new_v5(&POINT_ID_NAMESPACE, key.as_bytes()).to_string()
}

/// Hex SHA-256 of chunk text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_point(chunk: Chunk, vector: Vec<f32>) -> Point {
    let mut payload = HashMap::new();
    payload.insert(
        "content_hash".to_string(),
        serde_json::Value::String(content_hash(&chunk.text)),
    );
    payload.insert("chunk_index".to_string(), serde_json::json!(chunk.index));
    payload.insert(
        "source_path".to_string(),
        serde_json::Value::String(chunk.source_path.clone()),
    );
    let id = point_id(&chunk.source_path, chunk.index);
    payload.insert("text".to_string(), serde_json::Value::String(chunk.text));

    Point {
        id,
        vector,
        payload,
    }
}

/// Run the `process` command: ingest one repository into Qdrant.
///
/// Ctrl-C cancels the run at the next stage or batch boundary.
pub async fn run_process(config: &Config, request: IngestRequest) -> Result<()> {
    let fetcher = Arc::new(GitFetcher::new(Duration::from_secs(
        config.ingest.fetch_timeout_secs,
    )));
    let embedder = Arc::new(OpenAiEmbedder::new(&config.embedding)?);
    let store = Arc::new(QdrantStore::new(&config.qdrant)?);
    let pipeline = Pipeline::from_config(config, fetcher, embedder, store)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling ingestion");
            on_signal.cancel();
        }
    });

    let report = pipeline.ingest(&request, &cancel).await?;

    println!("process {}", request.repo_url);
    println!("  collection: {}", request.collection_name);
    println!(
        "  files: {} seen, {} skipped",
        report.files_seen, report.files_skipped
    );
    println!("  documents: {}", report.documents);
    println!("  chunks: {}", report.chunks);
    println!("  points upserted: {}", report.points_upserted);
    if report.collection_created {
        println!("  collection created");
    }
    println!("ok");

    Ok(())
}
