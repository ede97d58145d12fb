//! Application configuration for PatternLink.
//!
//! User config lives at `~/.patternlink/patternlink.toml`.
//! CLI flags override config file values, which override defaults.
//! Library crates never read this file or the environment themselves; the
//! CLI loads it and injects the runtime structs below.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PatternLinkError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "patternlink.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".patternlink";

/// Default OpenAI-compatible endpoint for the oracle and remote embedder.
pub const DEFAULT_API_BASE_URL: &str = "https://openrouter.ai/api/v1";

// ---------------------------------------------------------------------------
// Config structs (matching patternlink.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Resolver thresholds and switches.
    #[serde(default)]
    pub linking: LinkingConfig,

    /// Heading grammar switches.
    #[serde(default)]
    pub segmenter: SegmenterConfig,

    /// Embedding model and projection.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// External oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Knowledge store location and recovery policy.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Output locations.
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[linking]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingConfig {
    /// Skip the declared-reference / positional stage entirely.
    #[serde(default)]
    pub disable_index_mapping: bool,

    /// Minimum cosine similarity for a semantic match.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,

    /// Minimum title ratio for a fuzzy match.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f32,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            disable_index_mapping: false,
            semantic_threshold: default_semantic_threshold(),
            fuzzy_threshold: default_fuzzy_threshold(),
        }
    }
}

fn default_semantic_threshold() -> f32 {
    0.35
}
fn default_fuzzy_threshold() -> f32 {
    0.55
}

/// `[segmenter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Allow `1) Title` / `1. Title` headings in documents without explicit variations.
    #[serde(default = "default_true")]
    pub generic_numbering: bool,

    /// Longest block still considered a generic numbered heading.
    #[serde(default = "default_max_heading_chars")]
    pub max_heading_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            generic_numbering: true,
            max_heading_chars: default_max_heading_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_heading_chars() -> usize {
    140
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// `hashing-<dim>` (offline) or `remote:<model>` (OpenAI-compatible endpoint).
    #[serde(default = "default_embedding_model")]
    pub model_id: String,

    /// Characters of `title + body` fed to the model.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Optional trained projection (JSON) applied before scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_path: Option<String>,

    /// Base URL for `remote:` models.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout for `remote:` models.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: default_embedding_model(),
            max_chars: default_max_chars(),
            projection_path: None,
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_model() -> String {
    "hashing-384".into()
}
fn default_max_chars() -> usize {
    2_000
}
fn default_base_url() -> String {
    DEFAULT_API_BASE_URL.into()
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[oracle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Whether the oracle stage runs at all.
    #[serde(default)]
    pub enabled: bool,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Chat model asked to pick a pattern.
    #[serde(default = "default_oracle_model")]
    pub model: String,

    /// OpenAI-compatible base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Hard timeout per call; a timeout counts as "no answer".
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Minimum ms between two oracle calls.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Maximum oracle calls per run.
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key_env: default_api_key_env(),
            model: default_oracle_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            min_interval_ms: default_min_interval_ms(),
            max_calls: default_max_calls(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_oracle_model() -> String {
    "google/gemini-flash-1.5".into()
}
fn default_min_interval_ms() -> u64 {
    1_000
}
fn default_max_calls() -> u32 {
    200
}

/// What to do when the knowledge file exists but cannot be read or parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptStorePolicy {
    /// Log and continue with an empty store.
    #[default]
    StartEmpty,
    /// Abort the run.
    Fail,
}

/// `[knowledge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Path to the knowledge file (`~` is expanded).
    #[serde(default = "default_knowledge_path")]
    pub path: String,

    /// Recovery policy for an unreadable knowledge file.
    #[serde(default)]
    pub on_corrupt: CorruptStorePolicy,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: default_knowledge_path(),
            on_corrupt: CorruptStorePolicy::default(),
        }
    }
}

fn default_knowledge_path() -> String {
    "~/.patternlink/knowledge.json".into()
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for batch output and run summaries.
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "patternlink-out".into()
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime resolver configuration, merged from the config file and CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkerConfig {
    /// Skip the index stage.
    pub disable_index_mapping: bool,
    /// Semantic acceptance threshold.
    pub semantic_threshold: f32,
    /// Fuzzy acceptance threshold.
    pub fuzzy_threshold: f32,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for LinkerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            disable_index_mapping: config.linking.disable_index_mapping,
            semantic_threshold: config.linking.semantic_threshold,
            fuzzy_threshold: config.linking.fuzzy_threshold,
        }
    }
}

/// Oracle credentials, resolved by the config collaborator and injected.
#[derive(Clone)]
pub struct OracleCredentials {
    pub api_key: String,
}

impl std::fmt::Debug for OracleCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.patternlink/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PatternLinkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.patternlink/patternlink.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PatternLinkError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PatternLinkError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PatternLinkError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PatternLinkError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PatternLinkError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check ranges and URLs that serde cannot express.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    for (name, value) in [
        ("linking.semantic_threshold", config.linking.semantic_threshold),
        ("linking.fuzzy_threshold", config.linking.fuzzy_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(PatternLinkError::config(format!(
                "{name} must be within [0, 1], got {value}"
            )));
        }
    }

    if config.embedding.model_id.trim().is_empty() {
        return Err(PatternLinkError::config("embedding.model_id must not be empty"));
    }
    if config.embedding.max_chars == 0 {
        return Err(PatternLinkError::config("embedding.max_chars must be positive"));
    }

    for (name, value) in [
        ("embedding.base_url", &config.embedding.base_url),
        ("oracle.base_url", &config.oracle.base_url),
    ] {
        Url::parse(value)
            .map_err(|e| PatternLinkError::config(format!("{name} '{value}' is invalid: {e}")))?;
    }

    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Read the API key from the env var named in `[oracle]`.
/// Returns `None` when the var is unset or empty.
pub fn resolve_api_key(config: &OracleConfig) -> Option<OracleCredentials> {
    match std::env::var(&config.api_key_env) {
        Ok(val) if !val.trim().is_empty() => Some(OracleCredentials {
            api_key: val.trim().to_string(),
        }),
        _ => None,
    }
}
