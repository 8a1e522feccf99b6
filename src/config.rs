//! YAML configuration plus data-directory resolution.
//!
//! config.yaml lives in the data directory. Every field has a default, so
//! an empty or missing file yields a working setup; the file only needs to
//! mention what it overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::MissingCaptionPolicy;

pub const CONFIG_FILE: &str = "config.yaml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "IMGSEARCH_HOME";

/// Environment variable holding the generation API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Embedding model name; text and vision towers are resolved as a pair.
    #[serde(default = "default_model")]
    pub model: String,
    /// Dimension the model emits.
    #[serde(default = "default_native_dim")]
    pub native_dim: usize,
    /// Dimension vectors are projected down to for storage.
    #[serde(default = "default_reduce_dim")]
    pub reduce_dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Images are downscaled so the long edge fits this before upload.
    #[serde(default = "default_max_edge_px")]
    pub max_edge_px: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_calls_per_batch")]
    pub max_calls_per_batch: u32,
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,
    #[serde(default = "default_batch_cooldown_ms")]
    pub batch_cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_expand_factor")]
    pub expand_factor: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_missing_caption")]
    pub missing_caption: MissingCaptionPolicy,
}

fn default_model() -> String {
    "clip-ViT-B-32".to_string()
}

fn default_native_dim() -> usize {
    512
}

fn default_reduce_dim() -> usize {
    384
}

fn default_index_name() -> String {
    "imgsearch".to_string()
}

fn default_generation_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_max_edge_px() -> u32 {
    256
}

fn default_jpeg_quality() -> u8 {
    50
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_calls_per_batch() -> u32 {
    60
}

fn default_inter_call_delay_ms() -> u64 {
    1000
}

fn default_batch_cooldown_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_top_k() -> usize {
    10
}

fn default_expand_factor() -> usize {
    3
}

fn default_alpha() -> f32 {
    0.4
}

fn default_missing_caption() -> MissingCaptionPolicy {
    MissingCaptionPolicy::Stage1Only
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            native_dim: default_native_dim(),
            reduce_dim: default_reduce_dim(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: default_index_name(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: default_generation_model(),
            api_base: default_api_base(),
            max_edge_px: default_max_edge_px(),
            jpeg_quality: default_jpeg_quality(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls_per_batch: default_max_calls_per_batch(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
            batch_cooldown_ms: default_batch_cooldown_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            expand_factor: default_expand_factor(),
            alpha: default_alpha(),
            missing_caption: default_missing_caption(),
        }
    }
}

impl Config {
    /// Read config.yaml from the data directory, falling back to defaults
    /// when the file is absent.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let config: Config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.embedding.native_dim > 0 && self.embedding.native_dim <= u16::MAX as usize,
            "embedding.native_dim must be in 1..=65535"
        );
        anyhow::ensure!(
            self.embedding.reduce_dim > 0 && self.embedding.reduce_dim <= self.embedding.native_dim,
            "embedding.reduce_dim must be in 1..=native_dim"
        );
        anyhow::ensure!(
            self.generation.jpeg_quality >= 1 && self.generation.jpeg_quality <= 100,
            "generation.jpeg_quality must be in 1..=100"
        );
        anyhow::ensure!(
            self.generation.max_edge_px > 0,
            "generation.max_edge_px must be positive"
        );
        anyhow::ensure!(
            self.rate_limit.max_calls_per_batch > 0,
            "rate_limit.max_calls_per_batch must be positive"
        );
        anyhow::ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be positive");
        anyhow::ensure!(self.search.top_k > 0, "search.top_k must be positive");
        anyhow::ensure!(
            self.search.expand_factor > 0,
            "search.expand_factor must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.search.alpha),
            "search.alpha must be in [0, 1]"
        );
        Ok(())
    }
}

/// Data directory resolution: explicit flag, then $IMGSEARCH_HOME, then
/// ~/.imgsearch, then ./.imgsearch as a last resort.
pub fn resolve_data_dir(flag: Option<&Path>) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(Some(home)) = homedir::my_home() {
        return home.join(".imgsearch");
    }
    PathBuf::from(".imgsearch")
}

pub fn projection_path(data_dir: &Path, native: usize, reduced: usize) -> PathBuf {
    data_dir.join(format!("projection_{native}x{reduced}.bin"))
}

pub fn vectors_path(data_dir: &Path) -> PathBuf {
    data_dir.join("vectors.bin")
}

pub fn captions_path(data_dir: &Path) -> PathBuf {
    data_dir.join("captions.json")
}

pub fn caption_cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("caption-cache")
}

pub fn query_cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("query-cache")
}

/// API key for the generation service, if configured.
pub fn api_key() -> Option<String> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
}
