//! Linkage resolution: assigns every variation to exactly one pattern.
//!
//! Resolution runs an ordered chain of [`ResolutionStage`] strategies per
//! variation; the first stage that produces a valid pattern wins:
//!
//! 1. index: declared reference, or document-level alignment
//! 2. semantic: embedding similarity above threshold
//! 3. fuzzy: title ratio above threshold
//! 4. knowledge base: prior decision for `(lens, variation)`
//! 5. oracle: external answer, learned into the knowledge base
//! 6. default: first pattern in document order

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use patternlink_knowledge::KnowledgeStore;
use patternlink_oracle::{Oracle, OracleRequest};
use patternlink_shared::{
    Document, LinkerConfig, Resolution, ResolutionMethod, Result, Variation,
};
use patternlink_similarity::{SimilarityMatrix, SimilarityScorer, fuzzy};

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A stage's proposal for one variation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageMatch {
    pub pattern: u32,
    pub score: Option<f32>,
}

impl StageMatch {
    fn exact(pattern: u32) -> Self {
        Self {
            pattern,
            score: None,
        }
    }

    fn scored(pattern: u32, score: f32) -> Self {
        Self {
            pattern,
            score: Some(score),
        }
    }
}

/// What a stage may look at while resolving one variation.
pub struct StageContext<'a> {
    pub document: &'a Document,
    pub config: &'a LinkerConfig,
    pub knowledge: &'a mut KnowledgeStore,
}

/// One strategy in the resolution chain.
pub trait ResolutionStage: Send {
    /// Method recorded when this stage wins.
    fn method(&self) -> ResolutionMethod;

    /// Reset per-document state.
    fn begin_document(&mut self, _document: &Document) {}

    /// Propose a pattern for the variation at `position`, or pass.
    fn try_resolve(
        &mut self,
        variation: &Variation,
        position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch>;
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Declared references, then document-level 1..N alignment.
#[derive(Debug, Default)]
pub struct IndexStage {
    aligned: bool,
}

impl IndexStage {
    /// Equal counts and both sides numbered exactly `1..=N`.
    fn is_aligned(document: &Document) -> bool {
        let n = document.patterns.len();
        if n == 0 || document.variations.len() != n {
            return false;
        }
        let expected: Vec<u32> = (1..=n as u32).collect();
        let mut patterns: Vec<u32> = document.patterns.iter().map(|p| p.number).collect();
        let mut variations: Vec<u32> = document.variations.iter().map(|v| v.number).collect();
        patterns.sort_unstable();
        variations.sort_unstable();
        patterns == expected && variations == expected
    }
}

impl ResolutionStage for IndexStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Index
    }

    fn begin_document(&mut self, document: &Document) {
        self.aligned = Self::is_aligned(document);
        if self.aligned {
            debug!(id = %document.id, "variations align 1:1 with patterns");
        }
    }

    fn try_resolve(
        &mut self,
        variation: &Variation,
        _position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        if ctx.config.disable_index_mapping {
            return None;
        }
        match variation.declared_pattern_ref {
            Some(declared) if ctx.document.has_pattern(declared) => Some(StageMatch::exact(declared)),
            Some(declared) => {
                debug!(
                    variation = variation.number,
                    declared, "declared pattern reference out of range"
                );
                None
            }
            None if self.aligned => Some(StageMatch::exact(variation.number)),
            None => None,
        }
    }
}

/// Best embedding match above the semantic threshold.
pub struct SemanticStage {
    scorer: SimilarityScorer,
    /// Computed on first use per document; `Some(None)` after a scorer error.
    matrix: Option<Option<SimilarityMatrix>>,
}

impl SemanticStage {
    pub fn new(scorer: SimilarityScorer) -> Self {
        Self {
            scorer,
            matrix: None,
        }
    }
}

impl ResolutionStage for SemanticStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Semantic
    }

    fn begin_document(&mut self, _document: &Document) {
        self.matrix = None;
    }

    fn try_resolve(
        &mut self,
        _variation: &Variation,
        position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        let document = ctx.document;
        let scorer = &self.scorer;
        let matrix = self.matrix.get_or_insert_with(|| {
            match scorer.score(&document.patterns, &document.variations) {
                Ok(matrix) => Some(matrix),
                Err(e) => {
                    warn!(id = %document.id, error = %e, "similarity scoring failed, skipping semantic stage");
                    None
                }
            }
        });
        let (pattern, score) = matrix.as_ref()?.best_for(position)?;
        (score >= ctx.config.semantic_threshold).then(|| StageMatch::scored(pattern, score))
    }
}

/// Best title ratio above the fuzzy threshold.
#[derive(Debug, Default)]
pub struct FuzzyStage;

impl ResolutionStage for FuzzyStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Fuzzy
    }

    fn try_resolve(
        &mut self,
        variation: &Variation,
        _position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        let candidates = ctx
            .document
            .patterns
            .iter()
            .map(|p| (p.number, p.title.as_str()));
        let (pattern, ratio) = fuzzy::best_match(&variation.title, candidates)?;
        (ratio >= ctx.config.fuzzy_threshold).then(|| StageMatch::scored(pattern, ratio))
    }
}

/// Prior decision from the knowledge store.
#[derive(Debug, Default)]
pub struct KnowledgeBaseStage;

impl ResolutionStage for KnowledgeBaseStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::KnowledgeBase
    }

    fn try_resolve(
        &mut self,
        variation: &Variation,
        _position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        let lens = &ctx.document.lens;
        let pattern = ctx.knowledge.lookup(lens, variation.number)?;
        if !ctx.document.has_pattern(pattern) {
            debug!(
                lens = %lens,
                variation = variation.number,
                pattern, "stored pattern not present in this document"
            );
            return None;
        }
        Some(StageMatch::exact(pattern))
    }
}

/// External oracle; answers are learned into the knowledge store.
pub struct OracleStage {
    oracle: Box<dyn Oracle>,
}

impl OracleStage {
    pub fn new(oracle: Box<dyn Oracle>) -> Self {
        Self { oracle }
    }
}

impl ResolutionStage for OracleStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Oracle
    }

    fn try_resolve(
        &mut self,
        variation: &Variation,
        _position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        let request = OracleRequest {
            lens: &ctx.document.lens,
            variation,
            candidates: &ctx.document.patterns,
        };
        let pattern = self.oracle.resolve(&request)?;
        if !ctx.document.has_pattern(pattern) {
            return None;
        }

        if ctx
            .knowledge
            .record(&ctx.document.lens, variation.number, pattern)
        {
            if let Err(e) = ctx.knowledge.flush() {
                warn!(error = %e, "failed to persist oracle decision");
            }
        }
        Some(StageMatch::exact(pattern))
    }
}

/// Terminal fallback: first pattern in document order, or 1.
#[derive(Debug, Default)]
pub struct DefaultStage;

impl ResolutionStage for DefaultStage {
    fn method(&self) -> ResolutionMethod {
        ResolutionMethod::Default
    }

    fn try_resolve(
        &mut self,
        variation: &Variation,
        _position: usize,
        ctx: &mut StageContext<'_>,
    ) -> Option<StageMatch> {
        let pattern = ctx.document.default_pattern();
        warn!(
            id = %ctx.document.id,
            variation = variation.number,
            title = %variation.title,
            pattern,
            "no stage resolved variation, using default pattern"
        );
        Some(StageMatch::exact(pattern))
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One recorded decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub document_id: String,
    pub lens: String,
    pub variation: u32,
    pub pattern: u32,
    pub method: ResolutionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// Every decision made by a resolver, with per-method counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditLog {
    entries: Vec<AuditEntry>,
    counts: BTreeMap<ResolutionMethod, usize>,
}

impl AuditLog {
    fn push(&mut self, entry: AuditEntry) {
        *self.counts.entry(entry.method).or_default() += 1;
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn counts(&self) -> &BTreeMap<ResolutionMethod, usize> {
        &self.counts
    }

    /// Decisions made by `method`.
    pub fn count(&self, method: ResolutionMethod) -> usize {
        self.counts.get(&method).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Runs the stage chain over documents and owns the knowledge store.
pub struct Resolver {
    config: LinkerConfig,
    knowledge: KnowledgeStore,
    stages: Vec<Box<dyn ResolutionStage>>,
    audit: AuditLog,
}

impl Resolver {
    /// Standard chain; the oracle stage is present only when an oracle is given.
    pub fn new(
        config: LinkerConfig,
        knowledge: KnowledgeStore,
        scorer: SimilarityScorer,
        oracle: Option<Box<dyn Oracle>>,
    ) -> Self {
        let mut stages: Vec<Box<dyn ResolutionStage>> = vec![
            Box::new(IndexStage::default()),
            Box::new(SemanticStage::new(scorer)),
            Box::new(FuzzyStage),
            Box::new(KnowledgeBaseStage),
        ];
        if let Some(oracle) = oracle {
            info!(oracle = oracle.name(), "oracle stage enabled");
            stages.push(Box::new(OracleStage::new(oracle)));
        }
        stages.push(Box::new(DefaultStage));
        Self::with_stages(config, knowledge, stages)
    }

    /// Custom chain. A default is still applied if every stage passes.
    pub fn with_stages(
        config: LinkerConfig,
        knowledge: KnowledgeStore,
        stages: Vec<Box<dyn ResolutionStage>>,
    ) -> Self {
        Self {
            config,
            knowledge,
            stages,
            audit: AuditLog::default(),
        }
    }

    /// Resolve every unresolved variation of `document`.
    #[instrument(skip_all, fields(id = %document.id, lens = %document.lens))]
    pub fn resolve(&mut self, document: &mut Document) {
        for stage in &mut self.stages {
            stage.begin_document(document);
        }

        let doc: &Document = document;
        let mut decisions: Vec<Option<Resolution>> = Vec::with_capacity(doc.variations.len());
        for (position, variation) in doc.variations.iter().enumerate() {
            if variation.resolution.is_some() {
                decisions.push(None);
                continue;
            }
            let mut ctx = StageContext {
                document: doc,
                config: &self.config,
                knowledge: &mut self.knowledge,
            };
            let mut decision = None;
            for stage in self.stages.iter_mut() {
                let Some(found) = stage.try_resolve(variation, position, &mut ctx) else {
                    continue;
                };
                if !is_valid_target(doc, found.pattern) {
                    warn!(
                        stage = %stage.method(),
                        variation = variation.number,
                        pattern = found.pattern,
                        "stage proposed a pattern outside the document, ignoring"
                    );
                    continue;
                }
                decision = Some(Resolution {
                    pattern: found.pattern,
                    method: stage.method(),
                    score: found.score,
                });
                break;
            }
            let resolution = decision.unwrap_or(Resolution {
                pattern: doc.default_pattern(),
                method: ResolutionMethod::Default,
                score: None,
            });
            debug!(
                variation = variation.number,
                pattern = resolution.pattern,
                method = %resolution.method,
                "resolved variation"
            );
            self.audit.push(AuditEntry {
                document_id: doc.id.clone(),
                lens: doc.lens.clone(),
                variation: variation.number,
                pattern: resolution.pattern,
                method: resolution.method,
                score: resolution.score,
            });
            decisions.push(Some(resolution));
        }

        for (variation, decision) in document.variations.iter_mut().zip(decisions) {
            if let Some(resolution) = decision {
                variation.resolution = Some(resolution);
            }
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    /// Flush the knowledge store.
    pub fn finish(&mut self) -> Result<()> {
        self.knowledge.flush()?;
        Ok(())
    }
}

fn is_valid_target(document: &Document, pattern: u32) -> bool {
    if document.patterns.is_empty() {
        pattern == document.default_pattern()
    } else {
        document.has_pattern(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patternlink_shared::{Pattern, PatternLinkError};
    use patternlink_similarity::{Embedder, HashingEmbedder};

    /// Embeds everything to the zero vector, so every similarity is 0.
    struct ZeroEmbedder;

    impl Embedder for ZeroEmbedder {
        fn model_id(&self) -> &str {
            "zero"
        }
        fn dimension(&self) -> Option<usize> {
            Some(4)
        }
        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![0.0; 4]; texts.len()])
        }
    }

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn model_id(&self) -> &str {
            "failing"
        }
        fn dimension(&self) -> Option<usize> {
            None
        }
        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(PatternLinkError::Embedding("offline".into()))
        }
    }

    /// Answers from a fixed script and counts calls.
    struct ScriptedOracle {
        answers: Vec<Option<u32>>,
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Oracle for ScriptedOracle {
        fn name(&self) -> &str {
            "scripted"
        }
        fn resolve(&mut self, _request: &OracleRequest<'_>) -> Option<u32> {
            let i = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.answers.get(i).copied().flatten()
        }
    }

    fn zero_scorer() -> SimilarityScorer {
        SimilarityScorer::new(Box::new(ZeroEmbedder), 2000)
    }

    fn config(disable_index_mapping: bool) -> LinkerConfig {
        LinkerConfig {
            disable_index_mapping,
            ..LinkerConfig::default()
        }
    }

    fn resolver(disable_index: bool, knowledge: KnowledgeStore) -> Resolver {
        Resolver::new(config(disable_index), knowledge, zero_scorer(), None)
    }

    fn three_patterns(variations: Vec<Variation>) -> Document {
        Document {
            id: "doc-1".into(),
            lens: "LensX".into(),
            content_hash: String::new(),
            summary: String::new(),
            patterns: vec![
                Pattern::new(1, "Alpha", "first body"),
                Pattern::new(2, "Beta", "second body"),
                Pattern::new(3, "Gamma", "third body"),
            ],
            variations,
        }
    }

    fn resolution(doc: &Document, i: usize) -> (u32, ResolutionMethod) {
        let r = doc.variations[i].resolution.unwrap();
        (r.pattern, r.method)
    }

    #[test]
    fn declared_reference_resolves_by_index() {
        let mut doc = three_patterns(vec![Variation::new(2, "Title", "").with_declared_ref(2)]);
        let mut r = resolver(false, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::Index));
    }

    #[test]
    fn nothing_matches_falls_to_default() {
        let mut doc = three_patterns(vec![Variation::new(2, "Title", "").with_declared_ref(2)]);
        let mut r = resolver(true, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (1, ResolutionMethod::Default));
        assert_eq!(r.audit().count(ResolutionMethod::Default), 1);
    }

    #[test]
    fn knowledge_base_hit() {
        let mut kb = KnowledgeStore::in_memory();
        kb.record("LensX", 4, 2);
        let mut doc = three_patterns(vec![Variation::new(4, "Title", "")]);
        let mut r = resolver(true, kb);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::KnowledgeBase));
    }

    #[test]
    fn knowledge_hit_outside_document_is_ignored() {
        let mut kb = KnowledgeStore::in_memory();
        kb.record("LensX", 4, 9);
        let mut doc = three_patterns(vec![Variation::new(4, "Title", "")]);
        let mut r = resolver(true, kb);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (1, ResolutionMethod::Default));
    }

    #[test]
    fn invalid_declared_reference_skips_index() {
        let mut kb = KnowledgeStore::in_memory();
        kb.record("LensX", 5, 3);
        let mut doc = three_patterns(vec![Variation::new(5, "Title", "").with_declared_ref(7)]);
        let mut r = resolver(false, kb);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (3, ResolutionMethod::KnowledgeBase));
    }

    #[test]
    fn aligned_document_maps_by_number() {
        let mut doc = three_patterns(vec![
            Variation::new(1, "x", ""),
            Variation::new(2, "y", ""),
            Variation::new(3, "z", "").with_declared_ref(1),
        ]);
        let mut r = resolver(false, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (1, ResolutionMethod::Index));
        assert_eq!(resolution(&doc, 1), (2, ResolutionMethod::Index));
        // Declared reference wins over alignment.
        assert_eq!(resolution(&doc, 2), (1, ResolutionMethod::Index));
    }

    #[test]
    fn fuzzy_title_match() {
        let mut doc = three_patterns(vec![Variation::new(8, "Gamma!", "")]);
        let mut r = resolver(true, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        let v = doc.variations[0].resolution.unwrap();
        assert_eq!((v.pattern, v.method), (3, ResolutionMethod::Fuzzy));
        assert_eq!(v.score, Some(1.0));
    }

    #[test]
    fn semantic_beats_knowledge_base() {
        let mut kb = KnowledgeStore::in_memory();
        kb.record("LensX", 9, 1);
        let mut doc = three_patterns(vec![Variation::new(9, "Unrelated", "third body")]);
        doc.patterns[2].title = "Unrelated".into();
        let scorer = SimilarityScorer::new(Box::new(HashingEmbedder::new(128).unwrap()), 2000);
        let mut r = Resolver::new(config(true), kb, scorer, None);
        r.resolve(&mut doc);
        let v = doc.variations[0].resolution.unwrap();
        assert_eq!((v.pattern, v.method), (3, ResolutionMethod::Semantic));
        assert!(v.score.unwrap() >= 0.99);
    }

    #[test]
    fn scorer_failure_skips_semantic_stage() {
        let mut doc = three_patterns(vec![Variation::new(1, "Beta", "")]);
        let scorer = SimilarityScorer::new(Box::new(FailingEmbedder), 2000);
        let mut r = Resolver::new(config(true), KnowledgeStore::in_memory(), scorer, None);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::Fuzzy));
    }

    #[test]
    fn oracle_answer_is_learned() {
        let dir = std::env::temp_dir().join(format!("patternlink-resolver-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("kb.json");
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let kb = KnowledgeStore::load(&path, Default::default()).unwrap();
        let oracle = ScriptedOracle {
            answers: vec![Some(2)],
            calls: calls.clone(),
        };
        let mut r = Resolver::new(config(true), kb, zero_scorer(), Some(Box::new(oracle)));
        let mut doc = three_patterns(vec![Variation::new(6, "Title", "")]);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::Oracle));
        assert!(!r.knowledge().is_dirty());

        // Second run: the decision comes from the knowledge base.
        let kb = KnowledgeStore::load(&path, Default::default()).unwrap();
        let oracle = ScriptedOracle {
            answers: vec![Some(3)],
            calls: calls.clone(),
        };
        let mut r = Resolver::new(config(true), kb, zero_scorer(), Some(Box::new(oracle)));
        let mut doc = three_patterns(vec![Variation::new(6, "Title", "")]);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::KnowledgeBase));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn oracle_miss_falls_to_default() {
        let oracle = ScriptedOracle {
            answers: vec![None],
            calls: Default::default(),
        };
        let mut r = Resolver::new(
            config(true),
            KnowledgeStore::in_memory(),
            zero_scorer(),
            Some(Box::new(oracle)),
        );
        let mut doc = three_patterns(vec![Variation::new(6, "Title", "")]);
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (1, ResolutionMethod::Default));
        assert!(r.knowledge().is_empty());
    }

    #[test]
    fn every_variation_resolved_to_valid_pattern() {
        let variations = (1..=6)
            .map(|n| {
                let v = Variation::new(n, format!("Variation {n}"), "text");
                if n % 2 == 0 { v.with_declared_ref(n) } else { v }
            })
            .collect();
        let mut doc = three_patterns(variations);
        let mut r = resolver(false, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        assert!(doc.is_fully_resolved());
        assert!(
            doc.variations
                .iter()
                .all(|v| doc.has_pattern(v.resolved_pattern().unwrap()))
        );
        assert_eq!(r.audit().len(), 6);
    }

    #[test]
    fn document_without_patterns_defaults_to_one() {
        let mut doc = three_patterns(vec![Variation::new(1, "Lonely", "")]);
        doc.patterns.clear();
        let mut r = resolver(false, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        assert_eq!(resolution(&doc, 0), (1, ResolutionMethod::Default));
    }

    #[test]
    fn resolution_is_deterministic() {
        let make = || {
            three_patterns(vec![
                Variation::new(1, "Alpah", "first"),
                Variation::new(2, "Nothing alike", "zzz"),
                Variation::new(3, "Beta", "").with_declared_ref(3),
            ])
        };
        let mut a = make();
        let mut b = make();
        resolver(false, KnowledgeStore::in_memory()).resolve(&mut a);
        resolver(false, KnowledgeStore::in_memory()).resolve(&mut b);
        assert_eq!(a.variations, b.variations);
    }

    #[test]
    fn resolution_is_set_once() {
        let mut doc = three_patterns(vec![Variation::new(2, "Beta", "")]);
        let mut r = resolver(true, KnowledgeStore::in_memory());
        r.resolve(&mut doc);
        r.resolve(&mut doc);
        assert_eq!(r.audit().len(), 1);
        assert_eq!(resolution(&doc, 0), (2, ResolutionMethod::Fuzzy));
    }
}
