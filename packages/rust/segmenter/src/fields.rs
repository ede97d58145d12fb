//! Labeled sub-field decomposition and attribution parsing for pattern bodies.

use std::sync::LazyLock;

use patternlink_shared::Attribution;
use regex::Regex;

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(overview|explanation|inner war\s*/\s*choice|choice|sources?)\s*:\s*(.*)$")
        .expect("label regex")
});

static ATTRIBUTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z_][A-Z_\s]*?)\s*[-:\x{2013}\x{2014}\x{2212}]\s*(.+)$")
        .expect("attribution regex")
});

const NAME_LEN: std::ops::RangeInclusive<usize> = 2..=50;

/// A labeled sub-field of a pattern body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    Overview,
    Choice,
    Sources,
}

impl Field {
    /// Field for an unlabeled paragraph at `index` before any label.
    fn positional(index: usize) -> Self {
        match index {
            0 => Self::Overview,
            1 => Self::Choice,
            _ => Self::Sources,
        }
    }
}

/// Split a paragraph into its label and the remaining content.
pub(crate) fn parse_label(paragraph: &str) -> Option<(Field, &str)> {
    let caps = LABEL_RE.captures(paragraph)?;
    let label = caps.get(1)?.as_str().to_ascii_lowercase();
    let field = if label == "overview" || label == "explanation" {
        Field::Overview
    } else if label.starts_with("source") {
        Field::Sources
    } else {
        Field::Choice
    };
    Some((field, caps.get(2)?.as_str().trim()))
}

/// Strip a leading sub-field label, keeping the content.
pub(crate) fn strip_label(paragraph: &str) -> &str {
    parse_label(paragraph).map_or(paragraph, |(_, rest)| rest)
}

/// Decomposed pattern body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Fields {
    pub body: String,
    pub overview: String,
    pub choice: String,
    pub sources: String,
}

/// Route body paragraphs to their sub-fields.
///
/// Labeled paragraphs go to their field; unlabeled paragraphs before any
/// label go to overview, choice, then sources by position; unlabeled
/// paragraphs after a label continue that field.
pub(crate) fn decompose(paragraphs: &[String]) -> Fields {
    let mut body = Vec::new();
    let mut overview = Vec::new();
    let mut choice = Vec::new();
    let mut sources = Vec::new();
    let mut current: Option<Field> = None;
    let mut positional = 0usize;

    for paragraph in paragraphs {
        let (field, content) = match parse_label(paragraph) {
            Some((field, rest)) => {
                current = Some(field);
                (field, rest)
            }
            None => {
                let field = current.unwrap_or_else(|| {
                    let f = Field::positional(positional);
                    positional += 1;
                    f
                });
                (field, paragraph.as_str())
            }
        };
        if content.is_empty() {
            continue;
        }
        body.push(content);
        match field {
            Field::Overview => overview.push(content),
            Field::Choice => choice.push(content),
            Field::Sources => sources.push(content),
        }
    }

    Fields {
        body: body.join("\n"),
        overview: overview.join("\n"),
        choice: choice.join("\n"),
        sources: sources.join("\n"),
    }
}

// ---------------------------------------------------------------------------
// Attributions
// ---------------------------------------------------------------------------

/// Parse a `sources` span into named attributions.
///
/// Pieces are split on `;`, newlines, ` and ` and ` AND ` outside brackets.
/// `NAME – content` pieces keep their name; others become `SOURCE_<n>`.
pub fn parse_attributions(sources: &str) -> Vec<Attribution> {
    split_sources(sources)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| named_attribution(piece).unwrap_or_else(|| Attribution {
            name: format!("SOURCE_{}", i + 1),
            content: piece.to_string(),
        }))
        .collect()
}

fn named_attribution(piece: &str) -> Option<Attribution> {
    let caps = ATTRIBUTION_RE.captures(piece)?;
    let name = caps.get(1)?.as_str().trim();
    let content = caps.get(2)?.as_str().trim();
    if !NAME_LEN.contains(&name.chars().count()) || !name.chars().any(|c| c.is_ascii_uppercase())
    {
        return None;
    }
    Some(Attribution {
        name: name.to_string(),
        content: content.to_string(),
    })
}

fn split_sources(text: &str) -> Vec<&str> {
    const WORD_SEPARATORS: [&str; 2] = [" and ", " AND "];

    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let Some(c) = rest.chars().next() else {
            break;
        };
        if depth == 0 {
            if c == ';' || c == '\n' {
                pieces.push(&text[start..i]);
                i += 1;
                start = i;
                continue;
            }
            if let Some(sep) = WORD_SEPARATORS.iter().find(|s| rest.starts_with(*s)) {
                pieces.push(&text[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
        }
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += c.len_utf8();
    }
    pieces.push(&text[start..]);
    pieces
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paras(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn labels_route_to_fields() {
        let f = decompose(&paras(&[
            "Overview: The room is quiet.",
            "Inner war / choice: Stay or go.",
            "Sources: HOME_SPINE \u{2013} the house",
        ]));
        assert_eq!(f.overview, "The room is quiet.");
        assert_eq!(f.choice, "Stay or go.");
        assert_eq!(f.sources, "HOME_SPINE \u{2013} the house");
        assert!(!f.body.contains("Overview:"));
    }

    #[test]
    fn unlabeled_paragraphs_route_by_position() {
        let f = decompose(&paras(&["first", "second", "third", "fourth"]));
        assert_eq!(f.overview, "first");
        assert_eq!(f.choice, "second");
        assert_eq!(f.sources, "third\nfourth");
        assert_eq!(f.body, "first\nsecond\nthird\nfourth");
    }

    #[test]
    fn unlabeled_after_label_continues_field() {
        let f = decompose(&paras(&["Choice:", "keep going", "and more"]));
        assert_eq!(f.choice, "keep going\nand more");
        assert!(f.overview.is_empty());
        assert!(f.sources.is_empty());
    }

    #[test]
    fn explanation_is_overview() {
        let (field, rest) = parse_label("EXPLANATION:  why").unwrap();
        assert_eq!(field, Field::Overview);
        assert_eq!(rest, "why");
        assert_eq!(strip_label("Source: x"), "x");
        assert_eq!(strip_label("No label here"), "No label here");
    }

    #[test]
    fn attributions_named_and_fallback() {
        let a = parse_attributions("HOME_SPINE \u{2013} the house stands; a loose note");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].name, "HOME_SPINE");
        assert_eq!(a[0].content, "the house stands");
        assert_eq!(a[1].name, "SOURCE_2");
        assert_eq!(a[1].content, "a loose note");
    }

    #[test]
    fn attributions_split_on_and_outside_brackets() {
        let a = parse_attributions("RIVER - water (salt and fresh) and STONE: weight");
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].content, "water (salt and fresh)");
        assert_eq!(a[1].name, "STONE");
        assert_eq!(a[1].content, "weight");
    }

    #[test]
    fn single_letter_name_falls_back() {
        let a = parse_attributions("A - too short");
        assert_eq!(a[0].name, "SOURCE_1");
        assert_eq!(a[0].content, "A - too short");
    }

    #[test]
    fn empty_sources_yield_nothing() {
        assert!(parse_attributions("  ").is_empty());
    }
}
