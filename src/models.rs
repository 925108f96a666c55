//! Core data models used throughout repo-chat.
//!
//! These types represent the documents, chunks, and stored points that flow
//! through the ingestion and retrieval pipeline.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// A readable text file loaded from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path relative to the ingestion root, `/`-separated.
    pub source_path: String,
    pub content: String,
}

/// A bounded slice of a document's text; the unit of embedding and storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source_path: String,
    /// Position of the chunk inside its document, starting at 0.
    pub index: usize,
    pub text: String,
}

/// Distance metric of a vector collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
            Distance::Euclid => "euclid",
        };
        f.write_str(name)
    }
}

/// Parameters a collection is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionParams {
    pub dimension: usize,
    pub distance: Distance,
}

impl fmt::Display for CollectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dimension {} / {}", self.dimension, self.distance)
    }
}

/// A stored vector with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

/// A point returned from similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

/// A retrieved chunk handed to the language model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub text: String,
    pub source_path: String,
    pub score: f32,
}

impl ScoredChunk {
    /// Decode a search hit's payload. Returns `None` if `text` is missing.
    pub fn from_point(point: &ScoredPoint) -> Option<Self> {
        let text = point.payload.get("text")?.as_str()?.to_string();
        let source_path = point
            .payload
            .get("source_path")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Some(Self {
            text,
            source_path,
            score: point.score,
        })
    }
}
