//! Section segmentation for loosely structured documents.
//!
//! Turns an ordered list of text blocks into a [`Document`]: a summary, the
//! numbered patterns with their decomposed sub-fields, and the variations.
//! Segmentation never fails; ambiguous input is logged and repaired.

mod fields;
pub mod grammar;
mod text;

use std::collections::{BTreeSet, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use patternlink_shared::{AppConfig, Document, DocumentInput, Pattern, TextBlock, Variation};

pub use fields::parse_attributions;
pub use grammar::{BlockKind, BlockView, GrammarSet, Heading, HeadingGrammar};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Segmenter tuning knobs.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Allow the generic `<n>) <title>` grammar (still gated per document).
    pub generic_numbering: bool,
    /// Length limit for generic numbered headings.
    pub max_heading_chars: usize,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            generic_numbering: true,
            max_heading_chars: 140,
        }
    }
}

impl From<&AppConfig> for SegmentOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            generic_numbering: config.segmenter.generic_numbering,
            max_heading_chars: config.segmenter.max_heading_chars,
        }
    }
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// One normalised line; only the first line of a block may be a heading.
struct Line<'a> {
    text: String,
    style: Option<&'a str>,
    continuation: bool,
}

impl Line<'_> {
    fn view(&self) -> BlockView<'_> {
        BlockView {
            text: &self.text,
            style: self.style,
        }
    }
}

struct Section {
    heading: Heading,
    paragraphs: Vec<String>,
}

enum Open {
    Summary,
    Pattern,
    Variation,
}

/// Segment a document into summary, patterns and variations.
#[instrument(skip_all, fields(id = %input.id, lens = %input.lens))]
pub fn segment(input: &DocumentInput, options: &SegmentOptions) -> Document {
    let grammars = GrammarSet::standard(options.max_heading_chars);

    let lines: Vec<Line<'_>> = input
        .blocks
        .iter()
        .flat_map(|b| {
            let style = b.style.as_deref();
            text::block_lines(&b.text)
                .into_iter()
                .enumerate()
                .map(move |(i, text)| Line {
                    text,
                    style,
                    continuation: i > 0,
                })
        })
        .collect();

    let explicit_variations = grammars
        .has_explicit_variation(lines.iter().filter(|l| !l.continuation).map(Line::view));
    let allow_generic = options.generic_numbering && !explicit_variations;
    debug!(
        lines = lines.len(),
        explicit_variations, allow_generic, "classifying blocks"
    );

    let mut summary = Vec::new();
    let mut pattern_sections: Vec<Section> = Vec::new();
    let mut variation_sections: Vec<Section> = Vec::new();
    let mut open = Open::Summary;

    for line in &lines {
        let kind = if line.continuation {
            BlockKind::Plain
        } else {
            grammars.classify(&line.view(), allow_generic)
        };
        match kind {
            BlockKind::Pattern(heading) => {
                pattern_sections.push(Section {
                    heading,
                    paragraphs: Vec::new(),
                });
                open = Open::Pattern;
            }
            BlockKind::Variation(heading) => {
                variation_sections.push(Section {
                    heading,
                    paragraphs: Vec::new(),
                });
                open = Open::Variation;
            }
            BlockKind::Plain => {
                let target = match open {
                    Open::Summary => &mut summary,
                    Open::Pattern => match pattern_sections.last_mut() {
                        Some(s) => &mut s.paragraphs,
                        None => &mut summary,
                    },
                    Open::Variation => match variation_sections.last_mut() {
                        Some(s) => &mut s.paragraphs,
                        None => &mut summary,
                    },
                };
                target.push(line.text.clone());
            }
        }
    }

    let patterns = build_patterns(pattern_sections);
    let variations = build_variations(variation_sections);

    info!(
        patterns = patterns.len(),
        variations = variations.len(),
        "segmented document"
    );

    Document {
        id: input.id.clone(),
        lens: input.lens.clone(),
        content_hash: content_hash(&input.blocks),
        summary: summary.join("\n"),
        patterns,
        variations,
    }
}

/// SHA-256 over the raw block texts, newline-terminated.
pub fn content_hash(blocks: &[TextBlock]) -> String {
    let mut hasher = Sha256::new();
    for block in blocks {
        hasher.update(block.text.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn build_patterns(sections: Vec<Section>) -> Vec<Pattern> {
    let mut patterns: Vec<Pattern> = Vec::new();
    for section in sections {
        let number = match section.heading.number {
            Some(n) => n,
            None => next_free(
                patterns.last().map_or(0, |p| p.number),
                |n| patterns.iter().any(|p| p.number == n),
            ),
        };
        let fields = fields::decompose(&section.paragraphs);
        for (name, value) in [
            ("overview", &fields.overview),
            ("choice", &fields.choice),
            ("sources", &fields.sources),
        ] {
            if value.is_empty() {
                debug!(pattern = number, field = name, "pattern sub-field missing");
            }
        }
        let attributions = parse_attributions(&fields.sources);
        let pattern = Pattern {
            number,
            title: section.heading.title,
            body: fields.body,
            overview: fields.overview,
            choice: fields.choice,
            sources: fields.sources,
            attributions,
        };
        match patterns.iter().position(|p| p.number == number) {
            Some(pos) => {
                warn!(
                    pattern = number,
                    earlier = %patterns[pos].title,
                    later = %pattern.title,
                    "duplicate pattern number, keeping the later content in the earlier slot"
                );
                patterns[pos] = pattern;
            }
            None => patterns.push(pattern),
        }
    }
    patterns
}

fn build_variations(sections: Vec<Section>) -> Vec<Variation> {
    let explicit: BTreeSet<u32> = sections.iter().filter_map(|s| s.heading.number).collect();
    let mut assigned: HashSet<u32> = HashSet::new();
    let mut previous = 0;
    let mut variations = Vec::with_capacity(sections.len());

    for section in sections {
        let taken = |n: u32| explicit.contains(&n) || assigned.contains(&n);
        let number = match section.heading.number {
            Some(n) if !assigned.contains(&n) => n,
            Some(n) => {
                let renumbered = next_free(n, taken);
                warn!(
                    variation = n,
                    renumbered,
                    title = %section.heading.title,
                    "duplicate variation number, renumbering"
                );
                renumbered
            }
            None => {
                let number = next_free(previous, taken);
                debug!(variation = number, title = %section.heading.title, "numbered unnumbered variation");
                number
            }
        };
        assigned.insert(number);
        previous = number;

        let body: Vec<&str> = section
            .paragraphs
            .iter()
            .map(|p| fields::strip_label(p))
            .filter(|p| !p.is_empty())
            .collect();
        let mut variation = Variation::new(number, section.heading.title, body.join("\n"));
        variation.declared_pattern_ref = section.heading.declared_pattern;
        variations.push(variation);
    }
    variations
}

/// Smallest integer above `from` for which `taken` is false.
fn next_free(from: u32, taken: impl Fn(u32) -> bool) -> u32 {
    let mut candidate = from.saturating_add(1);
    while taken(candidate) {
        candidate = candidate.saturating_add(1);
    }
    candidate
}
