//! Projection training from pseudo-labelled documents.
//!
//! Each variation is labelled with its best baseline pattern inside its own
//! document. The projection `W` starts at identity and is fitted by
//! full-batch gradient descent on the softmax cross-entropy over the
//! per-document logits `(W v) · (W p)`. Iteration order is fixed, so a
//! given corpus always produces the same weights.

use tracing::{debug, info, instrument};

use patternlink_shared::{Document, PatternLinkError, Result};

use crate::embedder::Embedder;
use crate::projection::{Projection, matvec};
use crate::scorer::{cosine, entity_text};

/// Gradient-descent settings.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: usize,
    pub learning_rate: f32,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 30,
            learning_rate: 0.5,
        }
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub documents: usize,
    pub samples: usize,
    pub epochs: usize,
    pub initial_loss: f32,
    pub final_loss: f32,
}

struct TrainingDocument {
    patterns: Vec<Vec<f32>>,
    /// Variation vector and the index of its pseudo-label pattern.
    samples: Vec<(Vec<f32>, usize)>,
}

/// Fit a projection over `documents` for `embedder`.
///
/// Documents with fewer than two patterns or no variations carry no signal
/// and are skipped.
#[instrument(skip_all, fields(model = embedder.model_id(), documents = documents.len()))]
pub fn train_projection(
    embedder: &dyn Embedder,
    documents: &[Document],
    max_chars: usize,
    options: &TrainOptions,
) -> Result<(Projection, TrainReport)> {
    let mut training = Vec::new();
    for doc in documents {
        if doc.patterns.len() < 2 || doc.variations.is_empty() {
            debug!(id = %doc.id, "skipping document without training signal");
            continue;
        }
        let pattern_texts: Vec<String> = doc
            .patterns
            .iter()
            .map(|p| entity_text(&p.title, &p.body, max_chars))
            .collect();
        let variation_texts: Vec<String> = doc
            .variations
            .iter()
            .map(|v| entity_text(&v.title, &v.body, max_chars))
            .collect();
        let patterns = embedder.embed_batch(&pattern_texts)?;
        let variations = embedder.embed_batch(&variation_texts)?;
        let samples = variations
            .into_iter()
            .map(|v| {
                let label = pseudo_label(&v, &patterns);
                (v, label)
            })
            .collect();
        training.push(TrainingDocument { patterns, samples });
    }

    let sample_count: usize = training.iter().map(|d| d.samples.len()).sum();
    let dim = training
        .first()
        .and_then(|d| d.patterns.first())
        .map(Vec::len)
        .unwrap_or(0);
    if sample_count == 0 || dim == 0 {
        return Err(PatternLinkError::validation(
            "no documents with at least two patterns and one variation to train on",
        ));
    }
    if training
        .iter()
        .flat_map(|d| d.patterns.iter().chain(d.samples.iter().map(|(v, _)| v)))
        .any(|v| v.len() != dim)
    {
        return Err(PatternLinkError::Embedding(
            "training vectors have inconsistent dimensions".into(),
        ));
    }

    let mut projection = Projection::identity(dim, embedder.model_id());
    let n = sample_count as f32;
    let mut initial_loss = None;

    for epoch in 0..options.epochs {
        let (loss, gradient) = evaluate(&projection.weights, dim, &training);
        let loss = loss / n;
        initial_loss.get_or_insert(loss);
        for (w, g) in projection.weights.iter_mut().zip(&gradient) {
            *w -= options.learning_rate * g / n;
        }
        debug!(epoch, loss, "training epoch");
    }

    let (final_loss, _) = evaluate(&projection.weights, dim, &training);
    let final_loss = final_loss / n;
    let report = TrainReport {
        documents: training.len(),
        samples: sample_count,
        epochs: options.epochs,
        initial_loss: initial_loss.unwrap_or(final_loss),
        final_loss,
    };
    info!(
        documents = report.documents,
        samples = report.samples,
        initial_loss = report.initial_loss,
        final_loss = report.final_loss,
        "trained projection"
    );
    projection.validate()?;
    Ok((projection, report))
}

/// Index of the best baseline pattern; ties go to the earliest.
fn pseudo_label(variation: &[f32], patterns: &[Vec<f32>]) -> usize {
    let mut best = (0, f32::MIN);
    for (i, p) in patterns.iter().enumerate() {
        let score = cosine(variation, p);
        if score > best.1 {
            best = (i, score);
        }
    }
    best.0
}

/// Summed loss and gradient with respect to the row-major weights.
///
/// With `a = W v`, `b_j = W p_j`, `s_j = a · b_j` and `g_j = softmax(s)_j - [j = y]`,
/// `dL/dW = Σ_j g_j (b_j vᵀ + a p_jᵀ)`.
fn evaluate(weights: &[f32], dim: usize, training: &[TrainingDocument]) -> (f32, Vec<f32>) {
    let mut loss = 0.0f32;
    let mut gradient = vec![0.0f32; dim * dim];

    for doc in training {
        let projected: Vec<Vec<f32>> = doc
            .patterns
            .iter()
            .map(|p| matvec(weights, dim, p))
            .collect();
        for (v, label) in &doc.samples {
            let a = matvec(weights, dim, v);
            let logits: Vec<f32> = projected.iter().map(|b| dot(&a, b)).collect();
            let probs = softmax(&logits);
            loss -= probs[*label].max(1e-12).ln();

            for (j, (b, p)) in projected.iter().zip(&doc.patterns).enumerate() {
                let g = probs[j] - if j == *label { 1.0 } else { 0.0 };
                if g == 0.0 {
                    continue;
                }
                for (r, row) in gradient.chunks_exact_mut(dim).enumerate() {
                    let gb = g * b[r];
                    let ga = g * a[r];
                    for ((cell, vc), pc) in row.iter_mut().zip(v).zip(p) {
                        *cell += gb * vc + ga * pc;
                    }
                }
            }
        }
    }
    (loss, gradient)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
