//! Heading grammars and the ordered grammar set.
//!
//! Each grammar recognises one heading form and tags the block as a pattern
//! heading or a variation heading. Grammars are tried in priority order; the
//! generic numbered grammar is last and only consulted when the document has
//! no explicit variation headings.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

use crate::text::looks_like_heading;

/// En dash, em dash, minus sign, or ASCII hyphen.
const DASH: &str = r"[-\x{2013}\x{2014}\x{2212}]";

static PATTERN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^pattern\s*(\d+)\s*:(.*)$").expect("pattern regex"));

static TASK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^task\s*(\d+)\s*:(.*)$").expect("task regex"));

static PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^part(?:\s*(\d+)|\s+([ivxlc]+))\s*:(.*)$").expect("part regex")
});

static DECLARED_VARIATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^(?:variation|var|option)\.?\s*(\d+)?\s*(?:{DASH}|:)\s*pattern\s*(\d+)\s*:(.*)$"
    ))
    .expect("declared variation regex")
});

static VARIATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^(variation|var|option)\b\.?\s*(\d+)?\s*(?::|{DASH}|\))(.*)$"
    ))
    .expect("variation regex")
});

static DASH_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^{DASH}\s*(.+)$")).expect("dash title regex"));

/// Words that open a section heading rather than a variation title.
const SECTION_KEYWORDS: [&str; 5] = ["pattern ", "part ", "section ", "task ", "chapter "];

static NUMBERED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(\d{{1,3}})\s*(?:[).]|{DASH})\s+(.*\S)$")).expect("numbered regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A recognised heading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    /// Number written in the heading (`0` already normalised to `10`).
    pub number: Option<u32>,
    pub title: String,
    /// Pattern number written inside a variation heading.
    pub declared_pattern: Option<u32>,
}

/// Classification of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Pattern(Heading),
    Variation(Heading),
    Plain,
}

/// One normalised block as seen by the grammars.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    pub text: &'a str,
    pub style: Option<&'a str>,
}

/// A single heading form.
pub trait HeadingGrammar: Send + Sync {
    /// Grammar name for tracing.
    fn name(&self) -> &str;

    /// Classify the block, or `None` when this grammar does not apply.
    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind>;

    /// Whether a match counts as an explicit variation keyword heading.
    fn is_explicit_variation(&self) -> bool {
        false
    }

    /// Whether this is the generic numbered fallback.
    fn is_generic(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Pattern grammars
// ---------------------------------------------------------------------------

/// `Pattern <n>: <title>`, `Task <n>: <title>`.
pub struct KeywordPatternGrammar {
    name: &'static str,
    re: &'static LazyLock<Regex>,
}

impl KeywordPatternGrammar {
    pub fn pattern() -> Self {
        Self {
            name: "pattern",
            re: &PATTERN_RE,
        }
    }

    pub fn task() -> Self {
        Self {
            name: "task",
            re: &TASK_RE,
        }
    }
}

impl HeadingGrammar for KeywordPatternGrammar {
    fn name(&self) -> &str {
        self.name
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        let caps = self.re.captures(block.text)?;
        let number = parse_number(&caps[1])?;
        Some(BlockKind::Pattern(Heading {
            number: Some(number),
            title: caps[2].trim().to_string(),
            declared_pattern: None,
        }))
    }
}

/// `Part <n>: <title>` with an Arabic or Roman numeral.
pub struct PartGrammar;

impl HeadingGrammar for PartGrammar {
    fn name(&self) -> &str {
        "part"
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        let caps = PART_RE.captures(block.text)?;
        let number = match (caps.get(1), caps.get(2)) {
            (Some(digits), _) => parse_number(digits.as_str())?,
            (None, Some(roman)) => parse_roman(roman.as_str()).filter(|n| *n <= 20)?,
            (None, None) => return None,
        };
        Some(BlockKind::Pattern(Heading {
            number: Some(number),
            title: caps[3].trim().to_string(),
            declared_pattern: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Variation grammars
// ---------------------------------------------------------------------------

/// `Variation <n> – Pattern <m>: <title>`.
pub struct DeclaredVariationGrammar;

impl HeadingGrammar for DeclaredVariationGrammar {
    fn name(&self) -> &str {
        "variation-declared"
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        let caps = DECLARED_VARIATION_RE.captures(block.text)?;
        Some(BlockKind::Variation(Heading {
            number: caps.get(1).and_then(|m| parse_number(m.as_str())),
            title: caps[3].trim().to_string(),
            declared_pattern: parse_number(&caps[2]),
        }))
    }

    fn is_explicit_variation(&self) -> bool {
        true
    }
}

/// `Variation [<n>]: <title>`, `Var. 3 – <title>`, `Option 2) <title>`.
///
/// `Var` and `Option` need a number. An unnumbered `Variation` must also
/// look like a heading, so labelled prose stays in the body.
pub struct KeywordVariationGrammar {
    max_heading_chars: usize,
}

impl KeywordVariationGrammar {
    pub fn new(max_heading_chars: usize) -> Self {
        Self { max_heading_chars }
    }
}

impl HeadingGrammar for KeywordVariationGrammar {
    fn name(&self) -> &str {
        "variation"
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        let caps = VARIATION_RE.captures(block.text)?;
        let number = caps.get(2).and_then(|m| parse_number(m.as_str()));
        if number.is_none() {
            let keyword = caps[1].to_ascii_lowercase();
            if keyword != "variation"
                || !looks_like_heading(block.text, block.style, self.max_heading_chars)
            {
                return None;
            }
        }
        Some(BlockKind::Variation(Heading {
            number,
            title: caps[3].trim().to_string(),
            declared_pattern: None,
        }))
    }

    fn is_explicit_variation(&self) -> bool {
        true
    }
}

/// `— THE TITLE IN CAPITALS`: an unnumbered variation.
pub struct DashTitleGrammar;

impl DashTitleGrammar {
    const TITLE_CHARS: std::ops::Range<usize> = 4..200;

    fn is_title(candidate: &str) -> bool {
        let len = candidate.chars().count();
        if !Self::TITLE_CHARS.contains(&len) {
            return false;
        }
        let has_letters = candidate.chars().any(char::is_alphabetic);
        if !has_letters || candidate.chars().any(char::is_lowercase) {
            return false;
        }
        let lower = candidate.to_lowercase();
        !SECTION_KEYWORDS.iter().any(|k| lower.starts_with(k))
    }
}

impl HeadingGrammar for DashTitleGrammar {
    fn name(&self) -> &str {
        "dash-title"
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        let caps = DASH_TITLE_RE.captures(block.text)?;
        let title = caps[1].trim();
        if !Self::is_title(title) {
            return None;
        }
        Some(BlockKind::Variation(Heading {
            number: None,
            title: title.to_string(),
            declared_pattern: None,
        }))
    }
}

/// `<n>) <title>`, `<n>. <title>`, `<n> – <title>` on a heading-like block.
pub struct NumberedGrammar {
    max_heading_chars: usize,
}

impl NumberedGrammar {
    pub fn new(max_heading_chars: usize) -> Self {
        Self { max_heading_chars }
    }
}

impl HeadingGrammar for NumberedGrammar {
    fn name(&self) -> &str {
        "numbered"
    }

    fn classify(&self, block: &BlockView<'_>) -> Option<BlockKind> {
        if !looks_like_heading(block.text, block.style, self.max_heading_chars) {
            return None;
        }
        let caps = NUMBERED_RE.captures(block.text)?;
        Some(BlockKind::Variation(Heading {
            number: parse_number(&caps[1]),
            title: caps[2].trim().to_string(),
            declared_pattern: None,
        }))
    }

    fn is_generic(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Grammar set
// ---------------------------------------------------------------------------

/// Holds grammars in priority order.
pub struct GrammarSet {
    grammars: Vec<Box<dyn HeadingGrammar>>,
}

impl GrammarSet {
    /// Built-in grammars: pattern forms, declared variations, keyword
    /// variations, dash titles, then the generic numbered form.
    pub fn standard(max_heading_chars: usize) -> Self {
        Self {
            grammars: vec![
                Box::new(KeywordPatternGrammar::pattern()),
                Box::new(KeywordPatternGrammar::task()),
                Box::new(PartGrammar),
                Box::new(DeclaredVariationGrammar),
                Box::new(KeywordVariationGrammar::new(max_heading_chars)),
                Box::new(DashTitleGrammar),
                Box::new(NumberedGrammar::new(max_heading_chars)),
            ],
        }
    }

    /// Classify a block. The first matching grammar wins.
    pub fn classify(&self, block: &BlockView<'_>, allow_generic: bool) -> BlockKind {
        for grammar in &self.grammars {
            if grammar.is_generic() && !allow_generic {
                continue;
            }
            if let Some(kind) = grammar.classify(block) {
                trace!(grammar = grammar.name(), text = block.text, "heading matched");
                return kind;
            }
        }
        BlockKind::Plain
    }

    /// Document-level pre-scan for explicit variation keyword headings.
    pub fn has_explicit_variation<'a, I>(&self, blocks: I) -> bool
    where
        I: IntoIterator<Item = BlockView<'a>>,
    {
        let explicit: Vec<&dyn HeadingGrammar> = self
            .grammars
            .iter()
            .filter(|g| g.is_explicit_variation())
            .map(|g| g.as_ref())
            .collect();
        blocks
            .into_iter()
            .any(|block| explicit.iter().any(|g| g.classify(&block).is_some()))
    }
}

// ---------------------------------------------------------------------------
// Numbers
// ---------------------------------------------------------------------------

/// Heading numbers are 1-based; a written `0` means `10`.
fn normalize_number(n: u32) -> u32 {
    if n == 0 { 10 } else { n }
}

fn parse_number(digits: &str) -> Option<u32> {
    digits.parse::<u32>().ok().map(normalize_number)
}

/// Strict canonical Roman numeral (`IV`, not `IIII`).
fn parse_roman(text: &str) -> Option<u32> {
    let upper = text.to_ascii_uppercase();
    let mut total: i64 = 0;
    let mut max_seen: i64 = 0;
    for c in upper.chars().rev() {
        let value = match c {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            'C' => 100,
            _ => return None,
        };
        if value < max_seen {
            total -= value;
        } else {
            total += value;
            max_seen = value;
        }
    }
    let total = u32::try_from(total).ok().filter(|n| *n > 0)?;
    (to_roman(total) == upper).then_some(total)
}

fn to_roman(mut n: u32) -> String {
    const TABLE: [(u32, &str); 9] = [
        (100, "C"),
        (90, "XC"),
        (50, "L"),
        (40, "XL"),
        (10, "X"),
        (9, "IX"),
        (5, "V"),
        (4, "IV"),
        (1, "I"),
    ];
    let mut out = String::new();
    for (value, symbol) in TABLE {
        while n >= value {
            out.push_str(symbol);
            n -= value;
        }
    }
    out
}
