//! Error taxonomy for the ingestion pipeline and its adapters.
//!
//! Component seams return typed errors so the orchestrator can tell a
//! transient embedding failure from a fatal one and report which stage of a
//! run failed. Application glue (CLI, config loading) uses `anyhow`.

use std::fmt;

use thiserror::Error;

/// A stage of the ingestion pipeline, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Load,
    Chunk,
    EnsureCollection,
    Embed,
    Upsert,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Load => "load",
            Stage::Chunk => "chunk",
            Stage::EnsureCollection => "ensure_collection",
            Stage::Embed => "embed",
            Stage::Upsert => "upsert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from an embedding backend or the retry/batching layer around it.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Rate limiting, server errors, network failures. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// Client errors and malformed responses. Retrying will not help.
    #[error("embedding request rejected: {0}")]
    Permanent(String),

    #[error("embedding failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<EmbedError> },

    #[error("embedding backend returned {actual} vectors for {expected} inputs")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("embedding cancelled")]
    Cancelled,
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Transient(_))
    }
}

/// Errors from a vector store backend.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("collection error: {0}")]
    Collection(String),

    /// An existing collection has parameters that differ from the requested ones.
    #[error("collection '{name}' already exists with {existing}, requested {requested}")]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("upsert error: {0}")]
    Upsert(String),

    #[error("search error: {0}")]
    Search(String),
}

/// Terminal failure of an ingestion run.
///
/// Every variant names the stage that failed so the caller can report it.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("[{}] repository fetch failed: {source:#}", Stage::Fetch)]
    Fetch {
        #[source]
        source: anyhow::Error,
    },

    #[error("[{}] document loading failed: {source:#}", Stage::Load)]
    Load {
        #[source]
        source: anyhow::Error,
    },

    #[error("[{stage}] vector store failure: {source}")]
    Store {
        stage: Stage,
        #[source]
        source: VectorStoreError,
    },

    #[error("[{}] {source}", Stage::Embed)]
    Embed {
        #[source]
        source: EmbedError,
    },

    #[error("[{stage}] ingestion cancelled")]
    Cancelled { stage: Stage },
}

impl IngestError {
    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::Fetch { .. } => Stage::Fetch,
            IngestError::Load { .. } => Stage::Load,
            IngestError::Store { stage, .. } => *stage,
            IngestError::Embed { .. } => Stage::Embed,
            IngestError::Cancelled { stage } => *stage,
        }
    }
}

/// Failure to answer a chat request.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("messages list is empty")]
    NoMessages,

    #[error("no user message found in the request")]
    NoUserMessage,

    #[error("retrieval failed: {0:#}")]
    Retrieval(#[source] anyhow::Error),

    #[error("language model request failed: {0:#}")]
    Model(#[source] anyhow::Error),
}

impl ChatError {
    /// Whether the request itself was at fault, as opposed to a backend.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, ChatError::NoMessages | ChatError::NoUserMessage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_reported_in_message() {
        let err = IngestError::Store {
            stage: Stage::Upsert,
            source: VectorStoreError::Upsert("boom".to_string()),
        };
        assert_eq!(err.stage(), Stage::Upsert);
        assert!(err.to_string().starts_with("[upsert]"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_chunk_stage_only_reported_on_cancel() {
        let err = IngestError::Cancelled {
            stage: Stage::Chunk,
        };
        assert_eq!(err.stage(), Stage::Chunk);
        assert_eq!(err.to_string(), "[chunk] ingestion cancelled");
    }

    #[test]
    fn test_exhausted_wraps_last_cause() {
        let err = EmbedError::Exhausted {
            attempts: 3,
            last: Box::new(EmbedError::Transient("429".to_string())),
        };
        assert!(!err.is_transient());
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("429"));
    }

    #[test]
    fn test_fetch_error_includes_cause_chain() {
        let err = IngestError::Fetch {
            source: anyhow::anyhow!("exit status 128").context("git clone failed"),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[fetch]"));
        assert!(msg.contains("git clone failed"));
        assert!(msg.contains("exit status 128"));
    }

    #[test]
    fn test_chat_error_classification() {
        assert!(ChatError::NoMessages.is_bad_request());
        assert!(ChatError::NoUserMessage.is_bad_request());
        assert!(!ChatError::Model(anyhow::anyhow!("timeout")).is_bad_request());
    }
}
