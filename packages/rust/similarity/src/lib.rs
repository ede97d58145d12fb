//! Embedding similarity and fuzzy title matching for PatternLink.
//!
//! - [`Embedder`] models: the offline [`HashingEmbedder`] and the
//!   [`RemoteEmbedder`] for OpenAI-compatible endpoints
//! - [`SimilarityScorer`] producing per-document [`SimilarityMatrix`] values
//! - [`Projection`] and [`train_projection`] for a learned linear map
//! - [`fuzzy`] title ratios

mod embedder;
pub mod fuzzy;
mod projection;
mod scorer;
mod train;

pub use embedder::{
    DEFAULT_HASHING_DIM, Embedder, HashingEmbedder, RemoteEmbedder, embedder_from_config,
};
pub use projection::Projection;
pub use scorer::{SimilarityMatrix, SimilarityScorer, cosine, entity_text};
pub use train::{TrainOptions, TrainReport, train_projection};
