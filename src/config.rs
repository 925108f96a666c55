//! TOML configuration with environment overrides.
//!
//! Every field has a default, so the config file is optional. Secrets and
//! endpoints are overlaid from the environment once, in `main`, via
//! [`Config::apply_env`]; adapters receive the resulting value through their
//! constructors and never read the environment themselves.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub qdrant: QdrantConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            qdrant: QdrantConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            server: ServerConfig::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Never read from the file; set from `OPENAI_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dims: default_dims(),
            api_base: default_api_base(),
            api_key: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-ada-002".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_concurrency() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: 0,
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    /// Never read from the file; set from `QDRANT_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_qdrant_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_upsert_batch_size")]
    pub upsert_batch_size: usize,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            api_key: None,
            timeout_secs: default_qdrant_timeout_secs(),
            upsert_batch_size: default_upsert_batch_size(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".to_string()
}
fn default_qdrant_timeout_secs() -> u64 {
    60
}
fn default_upsert_batch_size() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra instruction placed before the question, e.g. an answer language.
    #[serde(default)]
    pub instruction: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            api_base: default_api_base(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout_secs(),
            instruction: None,
        }
    }
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_load_concurrency")]
    pub load_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            load_concurrency: default_load_concurrency(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    600
}
fn default_load_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub collection: Option<String>,
    /// Delay between streamed answer fragments.
    #[serde(default = "default_stream_delay_ms")]
    pub stream_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            collection: None,
            stream_delay_ms: default_stream_delay_ms(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_stream_delay_ms() -> u64 {
    100
}

const DEFAULT_LOG_LEVEL: &str = "info";

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Map a level name onto the `tracing` level it means.
///
/// Accepts the Python-style names (`notset`, `warning`, `critical`) as well.
/// Returns `None` for anything else, which `EnvFilter` would otherwise read
/// as a target name.
pub fn normalize_log_level(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" | "notset" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" | "fatal" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

impl EmbeddingConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Config {
    /// Overlay settings from environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OPENAI_API_KEY` | `embedding.api_key`, `llm.api_key` |
    /// | `OPENAI_API_BASE` | `embedding.api_base`, `llm.api_base` |
    /// | `QDRANT_URL` | `qdrant.url` |
    /// | `QDRANT_API_KEY` | `qdrant.api_key` |
    /// | `QDRANT_COLLECTION_NAME` | `server.collection` |
    /// | `INDEX_BATCH_SIZE` | `embedding.batch_size` (16 if unparsable) |
    /// | `LOG_LEVEL` | `log_level` |
    ///
    /// Takes a lookup function so callers (and tests) decide where values
    /// come from.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("OPENAI_API_KEY") {
            self.embedding.api_key = Some(key.clone());
            self.llm.api_key = Some(key);
        }
        if let Some(base) = get("OPENAI_API_BASE") {
            let base = base.trim_end_matches('/').to_string();
            self.embedding.api_base = base.clone();
            self.llm.api_base = base;
        }
        if let Some(url) = get("QDRANT_URL") {
            self.qdrant.url = url;
        }
        if let Some(key) = get("QDRANT_API_KEY") {
            self.qdrant.api_key = Some(key);
        }
        if let Some(name) = get("QDRANT_COLLECTION_NAME") {
            self.server.collection = Some(name);
        }
        if let Some(raw) = get("INDEX_BATCH_SIZE") {
            self.embedding.batch_size = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => default_batch_size(),
            };
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log_level = normalize_log_level(&level)
                .unwrap_or(DEFAULT_LOG_LEVEL)
                .to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.concurrency == 0 {
            bail!("embedding.concurrency must be > 0");
        }
        if self.embedding.max_attempts == 0 {
            bail!("embedding.max_attempts must be >= 1");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be >= 1");
        }
        if self.qdrant.upsert_batch_size == 0 {
            bail!("qdrant.upsert_batch_size must be > 0");
        }
        if self.ingest.load_concurrency == 0 {
            bail!("ingest.load_concurrency must be > 0");
        }
        if normalize_log_level(&self.log_level) != Some(self.log_level.as_str()) {
            bail!(
                "log_level must be one of trace, debug, info, warn, error, off (got {:?})",
                self.log_level
            );
        }
        Ok(())
    }
}

/// Load configuration from an optional TOML file.
///
/// With `None`, defaults are used. Environment overrides are not applied
/// here; see [`Config::apply_env`].
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config: Config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    if let Some(level) = normalize_log_level(&config.log_level) {
        config.log_level = level.to_string();
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.embedding.dims, 1536);
        assert_eq!(cfg.embedding.batch_size, 16);
        assert_eq!(cfg.embedding.max_attempts, 3);
        assert_eq!(cfg.chunking.chunk_size, 1000);
        assert_eq!(cfg.chunking.chunk_overlap, 0);
        assert_eq!(cfg.retrieval.top_k, 10);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo-chat.toml");
        std::fs::write(
            &path,
            "[chunking]\nchunk_size = 500\nchunk_overlap = 50\n\n[qdrant]\nurl = \"http://qdrant:6334\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.chunking.chunk_size, 500);
        assert_eq!(cfg.chunking.chunk_overlap, 50);
        assert_eq!(cfg.qdrant.url, "http://qdrant:6334");
        assert_eq!(cfg.embedding.model, "text-embedding-ada-002");
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo-chat.toml");
        std::fs::write(&path, "[chunking]\nchunk_size = 10\nchunk_overlap = 10\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/repo-chat.toml"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_API_BASE", "http://localhost:9999/v1/"),
            ("QDRANT_URL", "http://qdrant:6334"),
            ("QDRANT_API_KEY", "qk"),
            ("QDRANT_COLLECTION_NAME", "repo1"),
            ("INDEX_BATCH_SIZE", "32"),
            ("LOG_LEVEL", "DEBUG"),
        ]));

        assert_eq!(cfg.embedding.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.embedding.api_base, "http://localhost:9999/v1");
        assert_eq!(cfg.qdrant.url, "http://qdrant:6334");
        assert_eq!(cfg.qdrant.api_key.as_deref(), Some("qk"));
        assert_eq!(cfg.server.collection.as_deref(), Some("repo1"));
        assert_eq!(cfg.embedding.batch_size, 32);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn test_invalid_batch_size_falls_back() {
        let mut cfg = Config::default();
        cfg.embedding.batch_size = 99;
        cfg.apply_env(env(&[("INDEX_BATCH_SIZE", "lots")]));
        assert_eq!(cfg.embedding.batch_size, 16);
    }

    #[test]
    fn test_python_log_level_names_map_to_tracing_levels() {
        for (raw, expected) in [
            ("warning", "warn"),
            ("WARNING", "warn"),
            ("critical", "error"),
            ("notset", "trace"),
            ("error", "error"),
        ] {
            let mut cfg = Config::default();
            cfg.apply_env(env(&[("LOG_LEVEL", raw)]));
            assert_eq!(cfg.log_level, expected, "LOG_LEVEL={raw}");
            cfg.validate().unwrap();

            let filter = tracing_subscriber::EnvFilter::new(&cfg.log_level);
            let level: tracing::level_filters::LevelFilter = expected.parse().unwrap();
            assert_eq!(filter.max_level_hint(), Some(level));
        }
    }

    #[test]
    fn test_unknown_log_level_falls_back_to_info() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("LOG_LEVEL", "verbose")]));
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_log_level_in_file_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo-chat.toml");
        std::fs::write(&path, "log_level = \"warning\"\n").unwrap();
        assert_eq!(load_config(Some(&path)).unwrap().log_level, "warn");

        std::fs::write(&path, "log_level = \"loud\"\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("QDRANT_URL", "  ")]));
        assert_eq!(cfg.qdrant.url, "http://localhost:6334");
    }
}
