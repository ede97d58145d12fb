//! Shared types, error model, and configuration for PatternLink.
//!
//! This crate is the foundation depended on by all other PatternLink crates.
//! It provides:
//! - [`PatternLinkError`]: the unified error type
//! - Domain types ([`Document`], [`Pattern`], [`Variation`], [`ResolutionMethod`])
//! - Configuration ([`AppConfig`], [`LinkerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CorruptStorePolicy, DEFAULT_API_BASE_URL, EmbeddingConfig, KnowledgeConfig,
    LinkerConfig, LinkingConfig, OracleConfig, OracleCredentials, OutputConfig, SegmenterConfig,
    config_dir, config_file_path, expand_path, init_config, load_config, load_config_from,
    resolve_api_key, validate_config,
};
pub use error::{PatternLinkError, Result};
pub use types::{
    Attribution, Document, DocumentInput, FALLBACK_PATTERN, Pattern, Resolution,
    ResolutionMethod, TextBlock, Variation,
};
