//! TOML configuration.
//!
//! `load_config` parses the file and rejects invalid values up front so
//! later stages can trust every field.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use filesync_core::chunk::ChunkerConfig;
use filesync_core::search::IndexTier;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap_size")]
    pub overlap_size: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap_size: default_overlap_size(),
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

impl ChunkingConfig {
    pub fn to_chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            overlap_size: self.overlap_size,
            min_chunk_size: self.min_chunk_size,
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_overlap_size() -> usize {
    50
}
fn default_min_chunk_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            chunk_threshold: default_chunk_threshold(),
        }
    }
}

impl IndexConfig {
    pub fn tier(&self) -> Result<IndexTier> {
        Ok(self.tier.parse::<IndexTier>()?)
    }
}

fn default_tier() -> String {
    "advanced".to_string()
}
fn default_chunk_threshold() -> usize {
    filesync_core::search::CHUNK_THRESHOLD
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_size")]
    pub default_size: usize,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_weight")]
    pub keyword_weight: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_size: default_search_size(),
            semantic_weight: default_weight(),
            keyword_weight: default_weight(),
        }
    }
}

fn default_search_size() -> usize {
    10
}
fn default_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (Ollama base URL, or an OpenAI-compatible API).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    filesync_core::embedding::DEFAULT_BATCH_SIZE
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    filesync_core::embedding::DEFAULT_CACHE_CAPACITY
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_stale_run_timeout")]
    pub stale_run_timeout_secs: u64,
    #[serde(default = "default_failed_run_retention")]
    pub failed_run_retention_secs: u64,
    #[serde(default = "default_max_scopes_per_tick")]
    pub max_scopes_per_tick: usize,
    #[serde(default = "default_index_workers")]
    pub index_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            prune_interval_secs: default_prune_interval(),
            refresh_interval_secs: default_refresh_interval(),
            stale_run_timeout_secs: default_stale_run_timeout(),
            failed_run_retention_secs: default_failed_run_retention(),
            max_scopes_per_tick: default_max_scopes_per_tick(),
            index_workers: default_index_workers(),
        }
    }
}

fn default_check_interval() -> u64 {
    120
}
fn default_prune_interval() -> u64 {
    300
}
fn default_refresh_interval() -> u64 {
    300
}
fn default_stale_run_timeout() -> u64 {
    2 * 60 * 60
}
fn default_failed_run_retention() -> u64 {
    24 * 60 * 60
}
fn default_max_scopes_per_tick() -> usize {
    5
}
fn default_index_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    #[serde(default = "default_documents_dir")]
    pub documents_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            documents_dir: default_documents_dir(),
        }
    }
}

fn default_storage_enabled() -> bool {
    true
}
fn default_documents_dir() -> PathBuf {
    PathBuf::from("./documents")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7331".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    #[serde(rename = "box")]
    pub box_: Option<BoxConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BoxConnectorConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_box_api_base")]
    pub api_base: String,
    #[serde(default = "default_box_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_box_token_url")]
    pub token_url: String,
}

fn default_box_api_base() -> String {
    "https://api.box.com/2.0".to_string()
}
fn default_box_authorize_url() -> String {
    "https://account.box.com/api/oauth2/authorize".to_string()
}
fn default_box_token_url() -> String {
    "https://api.box.com/oauth2/token".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap_size >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap_size must be < chunking.chunk_size");
    }

    // Index and search
    config.index.tier()?;
    if config.search.default_size == 0 {
        anyhow::bail!("search.default_size must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.search.semantic_weight) {
        anyhow::bail!("search.semantic_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.search.keyword_weight) {
        anyhow::bail!("search.keyword_weight must be in [0.0, 1.0]");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    // Scheduler
    let s = &config.scheduler;
    for (name, value) in [
        ("check_interval_secs", s.check_interval_secs),
        ("prune_interval_secs", s.prune_interval_secs),
        ("refresh_interval_secs", s.refresh_interval_secs),
        ("stale_run_timeout_secs", s.stale_run_timeout_secs),
        ("failed_run_retention_secs", s.failed_run_retention_secs),
    ] {
        if value == 0 {
            anyhow::bail!("scheduler.{} must be > 0", name);
        }
    }
    if s.index_workers == 0 {
        anyhow::bail!("scheduler.index_workers must be >= 1");
    }
    if s.max_scopes_per_tick == 0 {
        anyhow::bail!("scheduler.max_scopes_per_tick must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/filesync.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.index.tier().unwrap(), IndexTier::Advanced);
        assert_eq!(config.scheduler.stale_run_timeout_secs, 7200);
        assert_eq!(config.server.bind, "127.0.0.1:7331");
        assert!(!config.embedding.is_enabled());
        assert!(config.connectors.box_.is_none());
    }

    #[test]
    fn test_box_section_defaults_endpoints() {
        let config = parse(
            "[db]\npath = \"x.sqlite\"\n[connectors.box]\nclient_id = \"id\"\nclient_secret = \"s\"\n",
        )
        .unwrap();
        let b = config.connectors.box_.unwrap();
        assert_eq!(b.api_base, "https://api.box.com/2.0");
        assert_eq!(b.token_url, "https://api.box.com/oauth2/token");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let base = "[db]\npath = \"x.sqlite\"\n";
        assert!(parse(&format!("{}[chunking]\nchunk_size = 10\noverlap_size = 10\n", base)).is_err());
        assert!(parse(&format!("{}[index]\ntier = \"premium\"\n", base)).is_err());
        assert!(parse(&format!("{}[search]\nkeyword_weight = 1.5\n", base)).is_err());
        assert!(parse(&format!("{}[embedding]\nprovider = \"openai\"\n", base)).is_err());
        assert!(parse(&format!("{}[embedding]\nprovider = \"local\"\n", base)).is_err());
        assert!(parse(&format!("{}[scheduler]\nindex_workers = 0\n", base)).is_err());
    }
}
