use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard safety ceiling: files larger than this are **always** skipped during
/// discovery, regardless of config. This protects low-RAM machines from
/// trying to tree-sitter-parse a 10 MB minified bundle.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000; // 1 MB

/// Controls file discovery (what to walk, what to skip).
///
/// Note: `.gitignore` is always respected by the walker; these are additional
/// hard skips and the include whitelist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Glob include patterns applied before the ignore resolver.
    /// Empty means "every supported source file".
    pub include_patterns: Vec<String>,

    /// Directory *names* to skip anywhere in the tree (e.g. "generated").
    /// These are compared against path components, not full paths.
    pub exclude_dir_names: Vec<String>,

    /// Files larger than this are silently skipped (not an error).
    pub max_file_size_bytes: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            include_patterns: vec![],
            exclude_dir_names: vec![],
            // 512 KB default — enough for any real source file, blocks log/generated bloat.
            max_file_size_bytes: 512 * 1024,
        }
    }
}

/// Batch sizing and checkpoint cadence for the indexing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Starting batch size; adapted at runtime by the batch sizer.
    pub initial_batch_size: usize,
    /// Upper clamp for the adaptive batch size.
    pub max_batch_size: usize,
    /// Resident-memory threshold that halves the batch size when crossed.
    pub memory_threshold_mb: u64,
    /// Rewrite the resume checkpoint after this many processed files.
    pub checkpoint_interval: usize,
    /// Batches at or above this size are parsed through the worker pool;
    /// smaller batches are parsed inline on the orchestrator thread.
    pub min_parallel_batch: usize,
    /// Minimum seconds between global hash-orphan sweeps per collection.
    pub orphan_sweep_interval_secs: u64,
    /// Persist checkpoints so interrupted runs can resume.
    pub enable_resume: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 25,
            max_batch_size: 100,
            memory_threshold_mb: 2_000,
            checkpoint_interval: 100,
            min_parallel_batch: 8,
            orphan_sweep_interval_secs: 600,
            enable_resume: true,
        }
    }
}

/// Embedding engine + cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// HuggingFace model repo ID used by the local Model2Vec embedder.
    pub model: String,
    /// In-memory embedding-cache capacity (entries, FIFO eviction).
    pub cache_max_entries: usize,
    /// On-disk embedding-cache ceiling; the oldest-accessed 25% of entries
    /// are dropped in one pass when exceeded.
    pub cache_max_size_mb: u64,
    /// Base URL for the OpenAI-compatible remote embedder (when used).
    pub openai_base_url: String,
    /// Remote embedding model name (when used).
    pub openai_model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "minishlab/potion-retrieval-32M".to_string(),
            cache_max_entries: 10_000,
            cache_max_size_mb: 500,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// Worker-pool settings for parallel parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum worker threads; 0 means auto (CPU count − 1).
    pub max_workers: usize,
    /// Per-file parse budget; files exceeding it are recorded as failed.
    pub per_file_timeout_secs: u64,
    /// Resident-memory limit; crossing it halves the worker count.
    pub memory_limit_mb: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            per_file_timeout_secs: 30,
            memory_limit_mb: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Directory (relative to the project root) holding all indexer state:
    /// file-state caches, embedding cache, checkpoints.
    pub cache_dir: PathBuf,
    pub discovery: DiscoveryConfig,
    pub pipeline: PipelineConfig,
    pub embedding: EmbeddingConfig,
    pub parallel: ParallelConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".index_cache"),
            discovery: DiscoveryConfig::default(),
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Absolute path of the indexer state dir for `project_root`.
    pub fn cache_root(&self, project_root: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            project_root.join(&self.cache_dir)
        }
    }

    /// Effective discovery size ceiling, never above the hard safety limit.
    pub fn effective_max_file_bytes(&self) -> u64 {
        self.discovery.max_file_size_bytes.min(ABSOLUTE_MAX_FILE_BYTES)
    }
}

pub fn load_config(project_root: &Path) -> IndexerConfig {
    let primary = project_root.join(".cortexgraph.json");

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return IndexerConfig::default() };

    serde_json::from_str::<IndexerConfig>(&text).unwrap_or_else(|_| IndexerConfig::default())
}
