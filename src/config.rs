//! TOML configuration for the retrieval subsystem.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! A minimal working file:
//!
//! ```toml
//! [db]
//! path = "./data/rag.sqlite"
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextBudget,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where and how per-collection HNSW caches are built.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Cache directory. Defaults to `indexes/` next to the database file.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_connections: default_max_connections(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

fn default_max_connections() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Recreate placeholder collections when a lookup misses instead of failing.
    #[serde(default)]
    pub auto_repair: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            auto_repair: false,
        }
    }
}

fn default_top_k() -> usize {
    4
}

/// Character budgets for [`crate::context::assemble`].
///
/// | Key | Default | Meaning |
/// |-----|---------|---------|
/// | `total_budget` | 6000 | hard ceiling on the assembled string |
/// | `topic_min` | 1500 | floor for the topic section |
/// | `rag_min` | 2500 | floor for the retrieval section |
/// | `rag_floor_min` | 1000 | the retrieval floor never shrinks below this |
/// | `topic_share` | 0.7 | share of slack given to topics |
/// | `hit_min` / `hit_max` | 200 / 2000 | per-hit clamp |
/// | `reclaim_cap` | 1500 | max unused topic space handed to retrieval |
/// | `dedup_threshold` | 0.8 | Jaccard threshold for topic name collapse |
/// | `topic_len_cap` | 2000 | length cap in the topic weight |
/// | `topic_name_divisor` | 50.0 | name-length divisor in the topic weight |
#[derive(Debug, Deserialize, Clone)]
pub struct ContextBudget {
    #[serde(default = "default_total_budget")]
    pub total_budget: usize,
    #[serde(default = "default_topic_min")]
    pub topic_min: usize,
    #[serde(default = "default_rag_min")]
    pub rag_min: usize,
    #[serde(default = "default_rag_floor_min")]
    pub rag_floor_min: usize,
    #[serde(default = "default_topic_share")]
    pub topic_share: f64,
    #[serde(default = "default_hit_min")]
    pub hit_min: usize,
    #[serde(default = "default_hit_max")]
    pub hit_max: usize,
    #[serde(default = "default_reclaim_cap")]
    pub reclaim_cap: usize,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    #[serde(default = "default_topic_len_cap")]
    pub topic_len_cap: usize,
    #[serde(default = "default_topic_name_divisor")]
    pub topic_name_divisor: f64,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            total_budget: default_total_budget(),
            topic_min: default_topic_min(),
            rag_min: default_rag_min(),
            rag_floor_min: default_rag_floor_min(),
            topic_share: default_topic_share(),
            hit_min: default_hit_min(),
            hit_max: default_hit_max(),
            reclaim_cap: default_reclaim_cap(),
            dedup_threshold: default_dedup_threshold(),
            topic_len_cap: default_topic_len_cap(),
            topic_name_divisor: default_topic_name_divisor(),
        }
    }
}

fn default_total_budget() -> usize {
    6000
}
fn default_topic_min() -> usize {
    1500
}
fn default_rag_min() -> usize {
    2500
}
fn default_rag_floor_min() -> usize {
    1000
}
fn default_topic_share() -> f64 {
    0.7
}
fn default_hit_min() -> usize {
    200
}
fn default_hit_max() -> usize {
    2000
}
fn default_reclaim_cap() -> usize {
    1500
}
fn default_dedup_threshold() -> f64 {
    0.8
}
fn default_topic_len_cap() -> usize {
    2000
}
fn default_topic_name_divisor() -> f64 {
    50.0
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TopicsConfig {
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Resolved index cache directory.
    pub fn index_dir(&self) -> PathBuf {
        match &self.index.dir {
            Some(dir) => dir.clone(),
            None => self
                .db
                .path
                .parent()
                .map(|p| p.join("indexes"))
                .unwrap_or_else(|| PathBuf::from("indexes")),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate context budget
    let ctx = &config.context;
    if ctx.total_budget == 0 {
        anyhow::bail!("context.total_budget must be > 0");
    }
    if ctx.rag_floor_min > ctx.rag_min {
        anyhow::bail!("context.rag_floor_min must be <= context.rag_min");
    }
    if ctx.hit_min > ctx.hit_max {
        anyhow::bail!("context.hit_min must be <= context.hit_max");
    }
    if !(0.0..=1.0).contains(&ctx.topic_share) {
        anyhow::bail!("context.topic_share must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&ctx.dedup_threshold) {
        anyhow::bail!("context.dedup_threshold must be in [0.0, 1.0]");
    }
    if ctx.topic_len_cap == 0 || ctx.topic_name_divisor <= 0.0 {
        anyhow::bail!("context.topic_len_cap and context.topic_name_divisor must be > 0");
    }

    // Validate embedding
    let emb = &config.embedding;
    match emb.provider.as_str() {
        "disabled" | "local" => {}
        "hash" => {
            if emb.dims.unwrap_or(0) == 0 {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'hash'");
            }
        }
        "openai" | "ollama" => {
            if emb.dims.unwrap_or(0) == 0 {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    emb.provider
                );
            }
            if emb.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    emb.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, local, openai, or ollama.",
            other
        ),
    }

    if config.index.max_connections == 0 || config.index.ef_search == 0 {
        anyhow::bail!("index.max_connections and index.ef_search must be > 0");
    }

    Ok(config)
}
