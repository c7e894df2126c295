use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}

/// Upload ceilings and processing-lock policy.
#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_max_csv_rows")]
    pub max_csv_rows: usize,
    #[serde(default = "default_max_pdf_pages")]
    pub max_pdf_pages: usize,
    #[serde(default = "default_max_processing_attempts")]
    pub max_processing_attempts: i64,
    /// A lock older than this is considered abandoned by a dead worker.
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: i64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            max_csv_rows: default_max_csv_rows(),
            max_pdf_pages: default_max_pdf_pages(),
            max_processing_attempts: default_max_processing_attempts(),
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_max_csv_rows() -> usize {
    2000
}
fn default_max_pdf_pages() -> usize {
    30
}
fn default_max_processing_attempts() -> i64 {
    15
}
fn default_lock_stale_secs() -> i64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_normalizer_model")]
    pub model: String,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_normalizer_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_normalizer_retries")]
    pub max_retries: u32,
    #[serde(default = "default_normalizer_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_memory_cache_entries")]
    pub memory_cache_entries: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            model: default_normalizer_model(),
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_normalizer_timeout_secs(),
            max_retries: default_normalizer_retries(),
            concurrency: default_normalizer_concurrency(),
            memory_cache_entries: default_memory_cache_entries(),
        }
    }
}

fn default_normalizer_model() -> String {
    "mistralai/mistral-7b-instruct".to_string()
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_normalizer_timeout_secs() -> u64 {
    15
}
fn default_normalizer_retries() -> u32 {
    1
}
fn default_normalizer_concurrency() -> usize {
    3
}
fn default_memory_cache_entries() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            max_chunks: default_max_chunks(),
        }
    }
}

fn default_min_tokens() -> usize {
    300
}
fn default_max_tokens() -> usize {
    500
}
fn default_max_chunks() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of the provider. Defaults depend on the provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
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
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_embedding_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_embedding_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    10
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Chat-completion provider shared by the normalizer and the answer path.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Model used to answer chat questions.
    #[serde(default = "default_chat_model")]
    pub model: String,
    /// HTTP client timeout for both models. Must exceed
    /// `normalizer.timeout_secs`, which cancels normalization calls first.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: default_llm_url(),
            api_key_env: default_api_key_env(),
            model: default_chat_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_chat_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            match_count: default_match_count(),
            max_chunk_chars: default_max_chunk_chars(),
            max_context_chars: default_max_context_chars(),
            temperature: 0.0,
        }
    }
}

fn default_match_threshold() -> f64 {
    0.3
}
fn default_match_count() -> usize {
    15
}
fn default_max_chunk_chars() -> usize {
    800
}
fn default_max_context_chars() -> usize {
    4000
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
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Configuration with every section at its default, rooted at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            storage: StorageConfig::default(),
            ingestion: IngestionConfig::default(),
            normalizer: NormalizerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.min_tokens > config.chunking.max_tokens {
        anyhow::bail!(
            "chunking.min_tokens ({}) must not exceed chunking.max_tokens ({})",
            config.chunking.min_tokens,
            config.chunking.max_tokens
        );
    }
    if config.chunking.max_chunks == 0 {
        anyhow::bail!("chunking.max_chunks must be > 0");
    }

    // Ingestion
    if config.ingestion.max_csv_rows == 0 {
        anyhow::bail!("ingestion.max_csv_rows must be > 0");
    }
    if config.ingestion.max_processing_attempts < 1 {
        anyhow::bail!("ingestion.max_processing_attempts must be >= 1");
    }

    // Normalizer
    if config.normalizer.concurrency == 0 {
        anyhow::bail!("normalizer.concurrency must be > 0");
    }
    if config.normalizer.memory_cache_entries == 0 {
        anyhow::bail!("normalizer.memory_cache_entries must be > 0");
    }

    // Retrieval
    if !(0.0..=1.0).contains(&config.retrieval.match_threshold) {
        anyhow::bail!("retrieval.match_threshold must be in [0.0, 1.0]");
    }
    if config.retrieval.match_count == 0 {
        anyhow::bail!("retrieval.match_count must be >= 1");
    }

    // Embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.llm.timeout_secs <= config.normalizer.timeout_secs {
        anyhow::bail!(
            "llm.timeout_secs ({}) must exceed normalizer.timeout_secs ({})",
            config.llm.timeout_secs,
            config.normalizer.timeout_secs
        );
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
