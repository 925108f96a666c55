//! # repo-chat
//!
//! Chat with a source-code repository.
//!
//! repo-chat clones a repository, selects its text files, splits them into
//! fixed-size chunks, embeds every chunk through an OpenAI-compatible API and
//! upserts the vectors into a Qdrant collection. A chat layer then retrieves
//! the chunks closest to a question and hands them to a language model, from
//! the terminal or through an OpenAI-compatible HTTP endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐   ┌────────┐
//! │  Fetch  │──▶│ Filter │──▶│ Loader │──▶│ Chunker │──▶│ Embedder │──▶│ Qdrant │
//! │  (git)  │   │        │   │        │   │         │   │ (retry)  │   │        │
//! └─────────┘   └────────┘   └────────┘   └─────────┘   └──────────┘   └───┬────┘
//!                                                                          │
//!                                              ┌───────────────────────────┤
//!                                              ▼                           ▼
//!                                        ┌──────────┐               ┌────────────┐
//!                                        │   chat   │               │   serve    │
//!                                        │ (stdin)  │               │ (HTTP/SSE) │
//!                                        └──────────┘               └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! repo-chat process --repo-url https://github.com/org/project.git \
//!     --include-file-extensions .rs .md
//! repo-chat chat --collection-name project
//! repo-chat serve --collection-name project
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Error types and pipeline stages |
//! | [`models`] | Core data types |
//! | [`fetch`] | Repository fetching via `git` |
//! | [`filter`] | Deterministic file selection |
//! | [`loader`] | Reading files into documents |
//! | [`chunk`] | Fixed-size character chunking |
//! | [`embedding`] | Embedding client, retry, and batching |
//! | [`vector_store`] | Qdrant and in-memory vector stores |
//! | [`ingest`] | The ingestion pipeline |
//! | [`retrieve`] | Similarity retrieval |
//! | [`chat`] | Retrieval-augmented chat |
//! | [`server`] | OpenAI-compatible HTTP server |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod ingest;
pub mod loader;
pub mod models;
pub mod retrieve;
pub mod server;
pub mod vector_store;
