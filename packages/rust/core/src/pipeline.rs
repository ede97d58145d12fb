//! Batch pipeline: text blocks → segment → resolve → output records.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use patternlink_segmenter::{SegmentOptions, segment};
use patternlink_shared::{
    Attribution, Document, DocumentInput, PatternLinkError, Resolution, ResolutionMethod, Result,
};

use crate::input::LoadedInputs;
use crate::resolver::Resolver;

// ---------------------------------------------------------------------------
// Output records
// ---------------------------------------------------------------------------

/// Output record for one pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub number: u32,
    pub title: String,
    pub overview: String,
    pub choice: String,
    pub sources: String,
    pub attributions: Vec<Attribution>,
}

/// Output record for one variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationRecord {
    pub number: u32,
    pub title: String,
    pub content: String,
    pub declared_pattern: Option<u32>,
    pub resolved_pattern: u32,
    pub resolution_method: ResolutionMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Output record for one processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub lens: String,
    pub content_hash: String,
    pub summary: String,
    pub patterns: Vec<PatternRecord>,
    pub variations: Vec<VariationRecord>,
}

impl DocumentRecord {
    /// Variation count per resolution method.
    pub fn method_counts(&self) -> BTreeMap<ResolutionMethod, usize> {
        let mut counts = BTreeMap::new();
        for v in &self.variations {
            *counts.entry(v.resolution_method).or_default() += 1;
        }
        counts
    }
}

impl From<&Document> for DocumentRecord {
    fn from(doc: &Document) -> Self {
        let fallback = Resolution {
            pattern: doc.default_pattern(),
            method: ResolutionMethod::Default,
            score: None,
        };
        Self {
            id: doc.id.clone(),
            lens: doc.lens.clone(),
            content_hash: doc.content_hash.clone(),
            summary: doc.summary.clone(),
            patterns: doc
                .patterns
                .iter()
                .map(|p| PatternRecord {
                    number: p.number,
                    title: p.title.clone(),
                    overview: p.overview.clone(),
                    choice: p.choice.clone(),
                    sources: p.sources.clone(),
                    attributions: p.attributions.clone(),
                })
                .collect(),
            variations: doc
                .variations
                .iter()
                .map(|v| {
                    let resolution = v.resolution.unwrap_or(fallback);
                    VariationRecord {
                        number: v.number,
                        title: v.title.clone(),
                        content: v.body.clone(),
                        declared_pattern: v.declared_pattern_ref,
                        resolved_pattern: resolution.pattern,
                        resolution_method: resolution.method,
                        score: resolution.score,
                    }
                })
                .collect(),
        }
    }
}

/// A document that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentFailure {
    pub id: String,
    pub error: String,
}

/// Totals for a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub documents_total: usize,
    pub documents_ok: usize,
    pub documents_failed: usize,
    pub patterns: usize,
    pub variations: usize,
    pub by_method: BTreeMap<ResolutionMethod, usize>,
    pub elapsed_ms: u64,
}

/// Everything a batch run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutput {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub tool_version: String,
    pub documents: Vec<DocumentRecord>,
    pub failures: Vec<DocumentFailure>,
    pub summary: RunSummary,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting batch status.
pub trait ProgressReporter: Send + Sync {
    /// Called once before the first document.
    fn batch_started(&self, total: usize);
    /// Called before each document.
    fn document_started(&self, id: &str, current: usize, total: usize);
    /// Called after each document, successful or not.
    fn document_finished(&self, id: &str, ok: bool);
    /// Called when the batch completes.
    fn done(&self, output: &BatchOutput);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn batch_started(&self, _total: usize) {}
    fn document_started(&self, _id: &str, _current: usize, _total: usize) {}
    fn document_finished(&self, _id: &str, _ok: bool) {}
    fn done(&self, _output: &BatchOutput) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Segments and resolves documents one at a time.
pub struct Pipeline {
    options: SegmentOptions,
    resolver: Resolver,
}

impl Pipeline {
    pub fn new(options: SegmentOptions, resolver: Resolver) -> Self {
        Self { options, resolver }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Segment and resolve one document.
    ///
    /// Documents without any pattern are rejected.
    #[instrument(skip_all, fields(id = %input.id, lens = %input.lens))]
    pub fn process(&mut self, input: &DocumentInput) -> Result<DocumentRecord> {
        let mut document = segment(input, &self.options);
        if document.patterns.is_empty() {
            return Err(PatternLinkError::validation(format!(
                "document '{}' has no patterns",
                input.id
            )));
        }
        self.resolver.resolve(&mut document);
        Ok(DocumentRecord::from(&document))
    }

    /// Process every input; per-document failures are captured, never fatal.
    #[instrument(skip_all)]
    pub fn run_batch(
        &mut self,
        inputs: impl Into<LoadedInputs>,
        progress: &dyn ProgressReporter,
    ) -> BatchOutput {
        let LoadedInputs {
            documents: inputs,
            failures: mut load_failures,
        } = inputs.into();
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::now_v7().to_string();
        let total = inputs.len() + load_failures.len();

        info!(%run_id, documents = total, "starting batch");
        progress.batch_started(total);

        for failure in &load_failures {
            warn!(id = %failure.id, error = %failure.error, "input could not be loaded");
        }

        let mut documents = Vec::with_capacity(inputs.len());
        let mut failures = Vec::new();
        failures.append(&mut load_failures);

        for (i, input) in inputs.iter().enumerate() {
            progress.document_started(&input.id, i + 1, inputs.len());
            match self.process(input) {
                Ok(record) => {
                    progress.document_finished(&input.id, true);
                    documents.push(record);
                }
                Err(e) => {
                    warn!(id = %input.id, error = %e, "document failed, continuing");
                    progress.document_finished(&input.id, false);
                    failures.push(DocumentFailure {
                        id: input.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let summary = summarize(&documents, failures.len(), start);
        info!(
            ok = summary.documents_ok,
            failed = summary.documents_failed,
            variations = summary.variations,
            elapsed_ms = summary.elapsed_ms,
            "batch complete"
        );

        let output = BatchOutput {
            run_id,
            started_at,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            documents,
            failures,
            summary,
        };
        progress.done(&output);
        output
    }

    /// Flush the knowledge store.
    pub fn finish(&mut self) -> Result<()> {
        self.resolver.finish()
    }
}

fn summarize(documents: &[DocumentRecord], failed: usize, start: Instant) -> RunSummary {
    let mut by_method = BTreeMap::new();
    for doc in documents {
        for (method, count) in doc.method_counts() {
            *by_method.entry(method).or_default() += count;
        }
    }
    RunSummary {
        documents_total: documents.len() + failed,
        documents_ok: documents.len(),
        documents_failed: failed,
        patterns: documents.iter().map(|d| d.patterns.len()).sum(),
        variations: documents.iter().map(|d| d.variations.len()).sum(),
        by_method,
        elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patternlink_knowledge::KnowledgeStore;
    use patternlink_shared::LinkerConfig;
    use patternlink_similarity::{HashingEmbedder, SimilarityScorer};

    fn pipeline() -> Pipeline {
        let scorer = SimilarityScorer::new(Box::new(HashingEmbedder::new(64).unwrap()), 2000);
        let resolver = Resolver::new(
            LinkerConfig::default(),
            KnowledgeStore::in_memory(),
            scorer,
            None,
        );
        Pipeline::new(SegmentOptions::default(), resolver)
    }

    fn doc(id: &str, lines: &[&str]) -> DocumentInput {
        DocumentInput::from_lines(id, "LensX", lines.iter().copied())
    }

    #[test]
    fn process_builds_record() {
        let mut p = pipeline();
        let record = p
            .process(&doc(
                "a",
                &[
                    "Summary line",
                    "Pattern 1: One",
                    "Pattern 2: Two",
                    "Pattern 3: Three",
                    "Variation 2 \u{2013} Pattern 2: Title",
                    "Body text",
                ],
            ))
            .unwrap();
        assert_eq!(record.summary, "Summary line");
        assert_eq!(record.patterns.len(), 3);
        let v = &record.variations[0];
        assert_eq!(v.declared_pattern, Some(2));
        assert_eq!(v.resolved_pattern, 2);
        assert_eq!(v.resolution_method, ResolutionMethod::Index);
        assert_eq!(v.content, "Body text");
    }

    #[test]
    fn document_without_patterns_is_rejected() {
        let mut p = pipeline();
        let err = p.process(&doc("empty", &["just text"])).unwrap_err();
        assert!(matches!(err, PatternLinkError::Validation { .. }));
    }

    #[test]
    fn batch_continues_past_failures() {
        let mut p = pipeline();
        let inputs = vec![
            doc("good-1", &["Pattern 1: A", "Variation 1: A"]),
            doc("bad", &["no headings here"]),
            doc("good-2", &["Pattern 1: B", "Variation: B"]),
        ];
        let output = p.run_batch(inputs, &SilentProgress);
        assert_eq!(output.documents.len(), 2);
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].id, "bad");
        assert_eq!(output.summary.documents_total, 3);
        assert_eq!(output.summary.documents_failed, 1);
        assert_eq!(output.summary.variations, 2);
        assert_eq!(output.summary.by_method.values().sum::<usize>(), 2);
        assert!(Uuid::parse_str(&output.run_id).is_ok());
    }

    #[test]
    fn load_failures_are_reported() {
        let mut p = pipeline();
        let inputs = LoadedInputs {
            documents: vec![doc("ok", &["Pattern 1: A"])],
            failures: vec![DocumentFailure {
                id: "missing.json".into(),
                error: "not found".into(),
            }],
        };
        let output = p.run_batch(inputs, &SilentProgress);
        assert_eq!(output.summary.documents_total, 2);
        assert_eq!(output.summary.documents_ok, 1);
        assert_eq!(output.failures[0].id, "missing.json");
    }

    #[test]
    fn record_serializes_spec_shape() {
        let mut p = pipeline();
        let record = p
            .process(&doc("a", &["Pattern 1: One", "Variation 1: One"]))
            .unwrap();
        let json = serde_json::to_value(&record).unwrap();
        let v = &json["variations"][0];
        assert_eq!(v["resolved_pattern"], 1);
        assert_eq!(v["resolution_method"], "index");
        assert!(v["declared_pattern"].is_null());
        assert!(json["patterns"][0]["attributions"].is_array());
    }
}
