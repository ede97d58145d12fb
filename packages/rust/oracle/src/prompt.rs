//! Prompt construction and lenient answer parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::OracleRequest;

/// Per-entity text budget inside the prompt.
const EXCERPT_CHARS: usize = 400;

pub(crate) const SYSTEM_PROMPT: &str = "You link document variations to the pattern they \
vary. Answer with a JSON object of the form {\"pattern\": <number>} and nothing else.";

static INTEGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("integer regex"));

/// User message listing the candidates and the variation.
pub(crate) fn build_prompt(request: &OracleRequest<'_>) -> String {
    let mut lines = vec![
        format!("Lens: {}", one_line(request.lens, EXCERPT_CHARS)),
        String::new(),
        "Candidate patterns:".to_string(),
    ];
    for pattern in request.candidates {
        let detail = if pattern.overview.is_empty() {
            &pattern.body
        } else {
            &pattern.overview
        };
        lines.push(format!(
            "- Pattern {}: {} | {}",
            pattern.number,
            one_line(&pattern.title, EXCERPT_CHARS),
            one_line(detail, EXCERPT_CHARS)
        ));
    }
    lines.push(String::new());
    lines.push(format!(
        "Variation {}: {}",
        request.variation.number,
        one_line(&request.variation.title, EXCERPT_CHARS)
    ));
    if !request.variation.body.is_empty() {
        lines.push(one_line(&request.variation.body, EXCERPT_CHARS));
    }
    lines.push(String::new());
    lines.push("Which pattern number does this variation belong to?".to_string());
    lines.join("\n")
}

/// First JSON object carrying a `pattern` key, else the first integer.
pub(crate) fn parse_answer(text: &str) -> Option<u32> {
    if let Some(n) = json_pattern(text) {
        return Some(n);
    }
    INTEGER_RE
        .find(text)
        .and_then(|m| m.as_str().parse::<u32>().ok())
}

fn json_pattern(text: &str) -> Option<u32> {
    for (start, _) in text.match_indices('{') {
        let Some(len) = text[start..].find('}') else {
            break;
        };
        let candidate = &text[start..=start + len];
        let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) else {
            continue;
        };
        let number = match value.get("pattern") {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        if let Some(n) = number.and_then(|n| u32::try_from(n).ok()) {
            return Some(n);
        }
    }
    None
}

fn one_line(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patternlink_shared::{Pattern, Variation};

    #[test]
    fn prompt_lists_candidates_and_variation() {
        let patterns = vec![
            Pattern::new(1, "The Door", "Opens\nonto the garden"),
            Pattern::new(2, "The Window", "Looks out"),
        ];
        let variation = Variation::new(7, "Glass", "A pane of glass");
        let request = OracleRequest {
            lens: "LensX",
            variation: &variation,
            candidates: &patterns,
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains("Lens: LensX"));
        assert!(prompt.contains("- Pattern 1: The Door | Opens onto the garden"));
        assert!(prompt.contains("- Pattern 2: The Window"));
        assert!(prompt.contains("Variation 7: Glass"));
    }

    #[test]
    fn parses_json_answers() {
        assert_eq!(parse_answer(r#"{"pattern": 3}"#), Some(3));
        assert_eq!(parse_answer("Sure! {\"pattern\": \"2\"} hope it helps"), Some(2));
        assert_eq!(parse_answer(r#"{"note": 5} then {"pattern": 4}"#), Some(4));
    }

    #[test]
    fn falls_back_to_first_integer() {
        assert_eq!(parse_answer("Pattern 5 fits best"), Some(5));
        assert_eq!(parse_answer("no idea"), None);
    }

    #[test]
    fn truncates_long_text() {
        let long = "x".repeat(500);
        assert_eq!(one_line(&long, 10).chars().count(), 11);
    }
}
