use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Database file name under `data_dir`
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub rerank: RerankConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// URL pattern for `ingest`; `{}` is replaced by the title
    #[serde(default = "default_source_url")]
    pub source_url: String,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Per-row transform timeout. Unset means no limit.
    #[serde(default)]
    pub row_timeout_secs: Option<u64>,

    /// Worker count for concurrent stage invocation; 1 keeps rows sequential
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible service; unset selects the offline hashing embedder
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// In-memory LRU entries
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    768
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: default_embedding_model(),
            dimensions: default_dimensions(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankConfig {
    /// Cohere-compatible service; unset keeps the merged order
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_rerank_model")]
    pub model: String,
}

fn default_rerank_model() -> String {
    "rerank-v3.5".to_string()
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: default_rerank_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Target span size in tokens
    #[serde(default = "default_chunk_size")]
    pub size: usize,

    /// Overlap between spans in tokens
    #[serde(default)]
    pub overlap: usize,
}

fn default_chunk_size() -> usize {
    1024
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: 0,
        }
    }
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_database() -> String {
    "vecflow.db".to_string()
}

fn default_source_url() -> String {
    "https://paulgraham.com/{}.html".to_string()
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: default_database(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            chunking: ChunkingConfig::default(),
            source_url: default_source_url(),
            fetch_timeout_secs: default_fetch_timeout(),
            row_timeout_secs: None,
            concurrency: default_concurrency(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn database_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.database)
    }

    pub fn source_url(&self, title: &str) -> String {
        self.source_url.replace("{}", title)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn row_timeout(&self) -> Option<Duration> {
        self.row_timeout_secs.map(Duration::from_secs)
    }
}
