//! Pattern/variation similarity scoring.

use std::path::Path;

use tracing::{debug, instrument};

use patternlink_shared::{EmbeddingConfig, Pattern, Result, Variation, expand_path};

use crate::embedder::{Embedder, embedder_from_config};
use crate::projection::Projection;

/// Scores for one document, `[variation][pattern]`, each in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatrix {
    pattern_numbers: Vec<u32>,
    scores: Vec<Vec<f32>>,
}

impl SimilarityMatrix {
    pub fn new(pattern_numbers: Vec<u32>, scores: Vec<Vec<f32>>) -> Self {
        Self {
            pattern_numbers,
            scores,
        }
    }

    /// Pattern numbers in column order (document order).
    pub fn pattern_numbers(&self) -> &[u32] {
        &self.pattern_numbers
    }

    /// Scores of the variation at `row`.
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        self.scores.get(row).map(Vec::as_slice)
    }

    /// Best pattern for the variation at `row`; ties go to the earliest pattern.
    pub fn best_for(&self, row: usize) -> Option<(u32, f32)> {
        let scores = self.row(row)?;
        let mut best: Option<(u32, f32)> = None;
        for (&number, &score) in self.pattern_numbers.iter().zip(scores) {
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((number, score));
            }
        }
        best
    }
}

/// Embeds patterns and variations and compares them by cosine similarity.
pub struct SimilarityScorer {
    embedder: Box<dyn Embedder>,
    projection: Option<Projection>,
    max_chars: usize,
}

impl SimilarityScorer {
    pub fn new(embedder: Box<dyn Embedder>, max_chars: usize) -> Self {
        Self {
            embedder,
            projection: None,
            max_chars,
        }
    }

    /// Apply a trained projection before scoring.
    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Build the configured embedder and load the projection, if any.
    pub fn from_config(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self> {
        let embedder = embedder_from_config(config, api_key)?;
        let mut scorer = Self::new(embedder, config.max_chars);
        if let Some(path) = &config.projection_path {
            let path = expand_path(path);
            scorer = scorer.load_projection(&path)?;
        }
        Ok(scorer)
    }

    fn load_projection(self, path: &Path) -> Result<Self> {
        let projection = Projection::load(path, self.embedder.model_id(), self.embedder.dimension())?;
        Ok(self.with_projection(projection))
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Score every variation against every pattern.
    #[instrument(skip_all, fields(model = self.embedder.model_id(), patterns = patterns.len(), variations = variations.len()))]
    pub fn score(&self, patterns: &[Pattern], variations: &[Variation]) -> Result<SimilarityMatrix> {
        let pattern_numbers: Vec<u32> = patterns.iter().map(|p| p.number).collect();
        if patterns.is_empty() || variations.is_empty() {
            return Ok(SimilarityMatrix::new(pattern_numbers, vec![Vec::new(); variations.len()]));
        }

        let mut texts: Vec<String> = patterns
            .iter()
            .map(|p| entity_text(&p.title, &p.body, self.max_chars))
            .collect();
        texts.extend(
            variations
                .iter()
                .map(|v| entity_text(&v.title, &v.body, self.max_chars)),
        );

        let mut vectors = self.embedder.embed_batch(&texts)?;
        if let Some(projection) = &self.projection {
            vectors = vectors
                .iter()
                .map(|v| projection.apply(v))
                .collect::<Result<_>>()?;
        }

        let (pattern_vectors, variation_vectors) = vectors.split_at(patterns.len());
        let scores: Vec<Vec<f32>> = variation_vectors
            .iter()
            .map(|v| pattern_vectors.iter().map(|p| cosine(v, p)).collect())
            .collect();
        debug!("computed similarity matrix");
        Ok(SimilarityMatrix::new(pattern_numbers, scores))
    }
}

/// `title + body`, truncated to `max_chars` characters.
pub fn entity_text(title: &str, body: &str, max_chars: usize) -> String {
    let text = if body.is_empty() {
        title.to_string()
    } else {
        format!("{title}\n{body}")
    };
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

/// Cosine similarity clamped to `[0, 1]`; zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na * nb)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashingEmbedder;

    fn scorer() -> SimilarityScorer {
        SimilarityScorer::new(Box::new(HashingEmbedder::new(256).unwrap()), 2000)
    }

    #[test]
    fn identical_text_scores_highest() {
        let patterns = vec![
            Pattern::new(1, "The Door", "A wooden door opens onto the garden."),
            Pattern::new(2, "The Window", "Glass looks out over the harbour at night."),
        ];
        let variations = vec![Variation::new(
            1,
            "The Window",
            "Glass looks out over the harbour at night.",
        )];
        let matrix = scorer().score(&patterns, &variations).unwrap();
        let (best, score) = matrix.best_for(0).unwrap();
        assert_eq!(best, 2);
        assert!((score - 1.0).abs() < 1e-4);
        assert!(matrix.row(0).unwrap().iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn scoring_is_deterministic() {
        let patterns = vec![Pattern::new(1, "A", "alpha"), Pattern::new(2, "B", "beta")];
        let variations = vec![Variation::new(1, "AB", "alpha beta")];
        let s = scorer();
        assert_eq!(
            s.score(&patterns, &variations).unwrap(),
            s.score(&patterns, &variations).unwrap()
        );
    }

    #[test]
    fn ties_go_to_earliest_pattern() {
        let matrix = SimilarityMatrix::new(vec![3, 1, 2], vec![vec![0.5, 0.5, 0.2]]);
        assert_eq!(matrix.best_for(0), Some((3, 0.5)));
        assert_eq!(matrix.best_for(1), None);
    }

    #[test]
    fn empty_patterns_yield_empty_rows() {
        let variations = vec![Variation::new(1, "x", "y")];
        let matrix = scorer().score(&[], &variations).unwrap();
        assert_eq!(matrix.best_for(0), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(entity_text("héllo", "", 2), "hé");
        assert_eq!(entity_text("T", "body", 100), "T\nbody");
    }

    #[test]
    fn cosine_clamps_negative() {
        assert_eq!(cosine(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn projection_dimension_mismatch_is_error() {
        let s = scorer().with_projection(Projection::identity(4, "hashing-256"));
        let result = s.score(&[Pattern::new(1, "a", "b")], &[Variation::new(1, "a", "b")]);
        assert!(result.is_err());
    }
}
