//! Title similarity by normalised edit distance.

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_key(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1 - distance / max_len` over normalised titles, in `[0, 1]`.
///
/// A title that normalises to nothing carries no evidence and scores 0.
pub fn fuzzy_ratio(a: &str, b: &str) -> f32 {
    let a = normalize_key(a);
    let b = normalize_key(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    strsim::normalized_levenshtein(&a, &b) as f32
}

/// Best-scoring candidate title; ties go to the earliest candidate.
pub fn best_match<'a, I>(title: &str, candidates: I) -> Option<(u32, f32)>
where
    I: IntoIterator<Item = (u32, &'a str)>,
{
    let mut best: Option<(u32, f32)> = None;
    for (number, candidate) in candidates {
        let ratio = fuzzy_ratio(title, candidate);
        if best.is_none_or(|(_, s)| ratio > s) {
            best = Some((number, ratio));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization() {
        assert_eq!(normalize_key("  The  Door, Ajar! "), "the door ajar");
    }

    #[test]
    fn ratio_is_one_minus_relative_distance() {
        // kitten -> sitting is 3 edits over 7 chars
        let r = fuzzy_ratio("kitten", "sitting");
        assert!((r - (1.0 - 3.0 / 7.0)).abs() < 1e-6);
    }

    #[test]
    fn ratio_bounds() {
        assert_eq!(fuzzy_ratio("The Door", "the door!"), 1.0);
        assert_eq!(fuzzy_ratio("abc", "xyz"), 0.0);
        assert_eq!(fuzzy_ratio("", "anything"), 0.0);
        let r = fuzzy_ratio("The Quiet Door", "The Quiet Doors");
        assert!(r > 0.9 && r < 1.0);
    }

    #[test]
    fn best_match_prefers_earliest_on_tie() {
        let best = best_match("door", [(2, "Door"), (1, "door")]);
        assert_eq!(best, Some((2, 1.0)));
        assert_eq!(best_match("x", std::iter::empty()), None);
    }
}
