//! Trained linear projection applied to embeddings before scoring.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use patternlink_shared::{PatternLinkError, Result};

/// Square `dim × dim` matrix, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub dim: usize,
    /// Model id the projection was trained against.
    pub base_model: String,
    pub weights: Vec<f32>,
}

impl Projection {
    /// Identity projection.
    pub fn identity(dim: usize, base_model: impl Into<String>) -> Self {
        let mut weights = vec![0.0; dim * dim];
        for i in 0..dim {
            weights[i * dim + i] = 1.0;
        }
        Self {
            dim,
            base_model: base_model.into(),
            weights,
        }
    }

    /// Load from JSON and check it matches the embedder it will be applied to.
    pub fn load(path: &Path, model_id: &str, dimension: Option<usize>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| PatternLinkError::io(path, e))?;
        let projection: Projection = serde_json::from_str(&content).map_err(|e| {
            PatternLinkError::Embedding(format!("invalid projection {}: {e}", path.display()))
        })?;
        projection.validate()?;

        if projection.base_model != model_id {
            return Err(PatternLinkError::Embedding(format!(
                "projection was trained for '{}', current model is '{model_id}'",
                projection.base_model
            )));
        }
        if let Some(dim) = dimension.filter(|d| *d != projection.dim) {
            return Err(PatternLinkError::Embedding(format!(
                "projection dimension {} does not match model dimension {dim}",
                projection.dim
            )));
        }

        info!(path = %path.display(), dim = projection.dim, "loaded projection");
        Ok(projection)
    }

    /// Write as JSON via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PatternLinkError::io(parent, e))?;
        }
        let json = serde_json::to_string(self)
            .map_err(|e| PatternLinkError::Embedding(format!("serialize projection: {e}")))?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, json).map_err(|e| PatternLinkError::io(&temp, e))?;
        std::fs::rename(&temp, path).map_err(|e| PatternLinkError::io(path, e))?;
        debug!(path = %path.display(), "saved projection");
        Ok(())
    }

    /// Weight count must be `dim²`.
    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.weights.len() != self.dim * self.dim {
            return Err(PatternLinkError::Embedding(format!(
                "projection has {} weights, expected {}",
                self.weights.len(),
                self.dim * self.dim
            )));
        }
        if self.weights.iter().any(|w| !w.is_finite()) {
            return Err(PatternLinkError::Embedding(
                "projection contains non-finite weights".into(),
            ));
        }
        Ok(())
    }

    /// `W · v`.
    pub fn apply(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() != self.dim {
            return Err(PatternLinkError::Embedding(format!(
                "vector dimension {} does not match projection dimension {}",
                vector.len(),
                self.dim
            )));
        }
        Ok(matvec(&self.weights, self.dim, vector))
    }
}

/// Row-major `dim × dim` matrix times vector.
pub(crate) fn matvec(weights: &[f32], dim: usize, vector: &[f32]) -> Vec<f32> {
    weights
        .chunks_exact(dim)
        .map(|row| row.iter().zip(vector).map(|(w, x)| w * x).sum())
        .collect()
}
