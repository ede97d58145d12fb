//! Input loading.
//!
//! Accepts `.json` documents (`{"id"?, "lens"?, "blocks": [...]}` or a bare
//! block array) and plain `.txt`/`.md` files with one block per non-empty
//! line. Directories are scanned one level deep in sorted order.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use patternlink_shared::{DocumentInput, PatternLinkError, Result, TextBlock};

use crate::pipeline::DocumentFailure;

const SUPPORTED_EXTENSIONS: [&str; 3] = ["json", "txt", "md"];

/// Documents ready for the pipeline plus inputs that failed to load.
#[derive(Debug, Default)]
pub struct LoadedInputs {
    pub documents: Vec<DocumentInput>,
    pub failures: Vec<DocumentFailure>,
}

impl From<Vec<DocumentInput>> for LoadedInputs {
    fn from(documents: Vec<DocumentInput>) -> Self {
        Self {
            documents,
            failures: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON shapes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonBlock {
    Text(String),
    Styled {
        text: String,
        #[serde(default)]
        style: Option<String>,
    },
}

impl From<JsonBlock> for TextBlock {
    fn from(block: JsonBlock) -> Self {
        match block {
            JsonBlock::Text(text) => TextBlock { text, style: None },
            JsonBlock::Styled { text, style } => TextBlock { text, style },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonDocument {
    Full {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        lens: Option<String>,
        blocks: Vec<JsonBlock>,
    },
    Bare(Vec<JsonBlock>),
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load every supported file named by `paths` (files or directories).
#[instrument(skip_all, fields(paths = paths.len()))]
pub fn load_inputs(paths: &[PathBuf]) -> LoadedInputs {
    let mut loaded = LoadedInputs::default();

    for path in paths {
        let files = if path.is_dir() {
            match scan_dir(path) {
                Ok(files) => files,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot scan directory");
                    loaded.failures.push(failure(path, &e));
                    continue;
                }
            }
        } else {
            vec![path.clone()]
        };

        for file in files {
            match load_file(&file) {
                Ok(doc) => {
                    debug!(id = %doc.id, blocks = doc.blocks.len(), "loaded input");
                    loaded.documents.push(doc);
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "cannot load input");
                    loaded.failures.push(failure(&file, &e));
                }
            }
        }
    }

    info!(
        documents = loaded.documents.len(),
        failures = loaded.failures.len(),
        "inputs loaded"
    );
    loaded
}

/// Load a single input file.
pub fn load_file(path: &Path) -> Result<DocumentInput> {
    let content = std::fs::read_to_string(path).map_err(|e| PatternLinkError::io(path, e))?;
    let default_id = path.display().to_string();
    let default_lens = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| default_id.clone());

    match extension(path).as_deref() {
        Some("json") => {
            let parsed: JsonDocument = serde_json::from_str(&content).map_err(|e| {
                PatternLinkError::parse(format!("{}: invalid input JSON: {e}", path.display()))
            })?;
            let (id, lens, blocks) = match parsed {
                JsonDocument::Full { id, lens, blocks } => (id, lens, blocks),
                JsonDocument::Bare(blocks) => (None, None, blocks),
            };
            Ok(DocumentInput {
                id: id.unwrap_or(default_id),
                lens: lens.unwrap_or(default_lens),
                blocks: blocks.into_iter().map(TextBlock::from).collect(),
            })
        }
        Some("txt" | "md") => Ok(DocumentInput::from_lines(
            default_id,
            default_lens,
            content.lines().filter(|l| !l.trim().is_empty()),
        )),
        _ => Err(PatternLinkError::validation(format!(
            "unsupported input type: {}",
            path.display()
        ))),
    }
}

fn scan_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PatternLinkError::io(dir, e))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            !p.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("~$"))
        })
        .filter(|p| {
            extension(p).is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn failure(path: &Path, error: &PatternLinkError) -> DocumentFailure {
    DocumentFailure {
        id: path.display().to_string(),
        error: error.to_string(),
    }
}
