//! Block-level text helpers shared by the grammars and the field parser.

use std::sync::LazyLock;

use regex::Regex;

/// Collapse every whitespace run (including non-breaking spaces) to one space.
pub(crate) fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalised non-empty lines of a block, separators removed.
///
/// Soft line breaks inside a block end a heading: only the first line can
/// carry a title.
pub(crate) fn block_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(normalize_text)
        .filter(|line| !line.is_empty() && !is_separator(line))
        .collect()
}

/// Horizontal rules such as `---`, `___` or `***` carry no content.
pub(crate) fn is_separator(text: &str) -> bool {
    static SEPARATOR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[_\-=*~]{3,}$").expect("separator regex"));
    SEPARATOR_RE.is_match(text)
}

/// Style hints such as `Heading 2` or `Title`.
pub(crate) fn style_is_heading(style: Option<&str>) -> bool {
    style.is_some_and(|s| {
        let s = s.to_ascii_lowercase();
        s.contains("heading") || s == "title" || s == "subtitle"
    })
}

/// Style hints for numbered/bulleted list paragraphs.
pub(crate) fn style_is_list(style: Option<&str>) -> bool {
    style.is_some_and(|s| s.to_ascii_lowercase().contains("list"))
}

/// Short, title-like text that does not introduce a list or a label.
///
/// A heading style hint doubles the length budget; a list style hint vetoes.
pub(crate) fn looks_like_heading(text: &str, style: Option<&str>, max_chars: usize) -> bool {
    if style_is_list(style) {
        return false;
    }
    let limit = if style_is_heading(style) {
        max_chars.saturating_mul(2)
    } else {
        max_chars
    };
    text.chars().count() <= limit
        && text.chars().any(char::is_alphabetic)
        && !text.ends_with(':')
}
