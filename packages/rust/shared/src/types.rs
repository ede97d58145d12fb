//! Core domain types for PatternLink documents.

use serde::{Deserialize, Serialize};

/// Pattern number used when a document has no patterns to fall back on.
pub const FALLBACK_PATTERN: u32 = 1;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One raw text block (paragraph) produced by file-format extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Paragraph text.
    pub text: String,
    /// Optional style hint from the source container (e.g. `Heading 2`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl TextBlock {
    /// Plain block without a style hint.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: None,
        }
    }

    /// Block carrying a style hint.
    pub fn styled(text: impl Into<String>, style: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: Some(style.into()),
        }
    }
}

/// A document as handed to the segmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInput {
    /// Source path or caller-supplied identifier.
    pub id: String,
    /// Lens identity used as part of the knowledge store key.
    pub lens: String,
    /// Ordered text blocks.
    pub blocks: Vec<TextBlock>,
}

impl DocumentInput {
    /// Build an input from plain lines, one block per line.
    pub fn from_lines<I, S>(id: impl Into<String>, lens: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            lens: lens.into(),
            blocks: lines.into_iter().map(TextBlock::plain).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Segmented document
// ---------------------------------------------------------------------------

/// A supporting source parsed out of a pattern's `sources` span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Source name (e.g. `HOME_SPINE`), or `SOURCE_<n>` when none was given.
    pub name: String,
    /// Quoted or paraphrased source content.
    pub content: String,
}

/// A primary titled section of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// 1-based number, unique within the document.
    pub number: u32,
    pub title: String,
    /// Full body text with sub-field labels stripped.
    pub body: String,
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub choice: String,
    #[serde(default)]
    pub sources: String,
    #[serde(default)]
    pub attributions: Vec<Attribution>,
}

impl Pattern {
    /// Pattern with a title and body and no decomposed sub-fields.
    pub fn new(number: u32, title: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            number,
            title: title.into(),
            overview: body.clone(),
            body,
            choice: String::new(),
            sources: String::new(),
            attributions: Vec::new(),
        }
    }
}

/// How a variation was linked to its pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Index,
    Semantic,
    Fuzzy,
    KnowledgeBase,
    Oracle,
    Default,
}

impl ResolutionMethod {
    /// All methods in precedence order.
    pub const ALL: [ResolutionMethod; 6] = [
        Self::Index,
        Self::Semantic,
        Self::Fuzzy,
        Self::KnowledgeBase,
        Self::Oracle,
        Self::Default,
    ];

    /// Stable name used in output records and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Index => "index",
            Self::Semantic => "semantic",
            Self::Fuzzy => "fuzzy",
            Self::KnowledgeBase => "knowledge_base",
            Self::Oracle => "oracle",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of linking one variation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Resolved pattern number.
    pub pattern: u32,
    /// Stage that produced the decision.
    pub method: ResolutionMethod,
    /// Similarity score for the semantic and fuzzy stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// A secondary titled section presenting an alternate formulation of a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Unique within the document; not necessarily contiguous.
    pub number: u32,
    pub title: String,
    pub body: String,
    /// Pattern number written in the heading itself, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_pattern_ref: Option<u32>,
    /// Set exactly once by the resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl Variation {
    pub fn new(number: u32, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            body: body.into(),
            declared_pattern_ref: None,
            resolution: None,
        }
    }

    /// Attach a declared pattern reference.
    pub fn with_declared_ref(mut self, pattern: u32) -> Self {
        self.declared_pattern_ref = Some(pattern);
        self
    }

    /// Resolved pattern number, once linked.
    pub fn resolved_pattern(&self) -> Option<u32> {
        self.resolution.map(|r| r.pattern)
    }

    /// Resolution method, once linked.
    pub fn resolution_method(&self) -> Option<ResolutionMethod> {
        self.resolution.map(|r| r.method)
    }
}

/// A segmented document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub lens: String,
    /// SHA-256 of the input block texts.
    pub content_hash: String,
    pub summary: String,
    pub patterns: Vec<Pattern>,
    pub variations: Vec<Variation>,
}

impl Document {
    /// Look up a pattern by number.
    pub fn pattern(&self, number: u32) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.number == number)
    }

    /// Whether `number` names a pattern of this document.
    pub fn has_pattern(&self, number: u32) -> bool {
        self.pattern(number).is_some()
    }

    /// The terminal fallback: first pattern in document order, or 1.
    pub fn default_pattern(&self) -> u32 {
        self.patterns
            .first()
            .map(|p| p.number)
            .unwrap_or(FALLBACK_PATTERN)
    }

    /// True once every variation carries a resolution.
    pub fn is_fully_resolved(&self) -> bool {
        self.variations.iter().all(|v| v.resolution.is_some())
    }
}
