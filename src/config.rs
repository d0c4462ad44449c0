use serde::{Deserialize, Serialize};
use std::path::Path;

/// Strict matching: only very close perceptual hashes are linked.
pub const STRICT_SIMILARITY_THRESHOLD: u32 = 6;

/// Loose matching: catches recompressed / resized variants at the cost of
/// occasional false positives.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 10;

/// All external tunables of the engine. Everything else is internal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Side length of the perceptual hash grid. 16 gives 256-bit fingerprints.
    pub hash_size: u32,
    /// Maximum Hamming distance (on either hash kind) for two photos to be
    /// considered similar. Smaller means fewer, higher-confidence matches.
    pub similarity_threshold: u32,
    /// Width of the thumbnail fetch worker pool.
    pub workers: usize,
    /// Page size for source listing calls.
    pub page_size: usize,
    /// Per-request timeout for thumbnail fetches, in seconds.
    pub fetch_timeout_secs: u64,
    /// Retry budget for transient fetch failures before the item is skipped.
    pub fetch_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Glob patterns matched against filenames; matching items are ignored.
    pub exclude_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_size: 16,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            workers: num_cpus::get().min(8),
            page_size: 100,
            fetch_timeout_secs: 30,
            fetch_retries: 3,
            retry_backoff_ms: 500,
            exclude_patterns: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing keys fall back to defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hash_size == 0 {
            return Err(ConfigError::Invalid("hash_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be positive".into()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be positive".into()));
        }
        let bits = self.hash_size * self.hash_size;
        if self.similarity_threshold >= bits {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} must be below the fingerprint width {}",
                self.similarity_threshold, bits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
