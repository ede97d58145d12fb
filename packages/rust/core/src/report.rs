//! Run reports: pretty JSON output plus a Markdown summary.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use patternlink_shared::{PatternLinkError, ResolutionMethod, Result};

use crate::pipeline::BatchOutput;

/// Files written by [`write_reports`].
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Write `<run_id>.json` and `<run_id>.md` into `dir`.
#[instrument(skip_all, fields(run_id = %output.run_id, dir = %dir.display()))]
pub fn write_reports(output: &BatchOutput, dir: &Path) -> Result<ReportPaths> {
    std::fs::create_dir_all(dir).map_err(|e| PatternLinkError::io(dir, e))?;

    let json = serde_json::to_string_pretty(output).map_err(|e| {
        PatternLinkError::validation(format!("JSON serialization failed: {e}"))
    })?;
    let paths = ReportPaths {
        json: dir.join(format!("{}.json", output.run_id)),
        markdown: dir.join(format!("{}.md", output.run_id)),
    };
    write_atomic(&paths.json, &json)?;
    write_atomic(&paths.markdown, &render_markdown(output))?;

    info!(
        json = %paths.json.display(),
        markdown = %paths.markdown.display(),
        "reports written"
    );
    Ok(paths)
}

/// Markdown run summary with per-document counts by resolution method.
pub fn render_markdown(output: &BatchOutput) -> String {
    let summary = &output.summary;
    let mut md = String::new();

    let _ = writeln!(md, "# PatternLink run {}", output.run_id);
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "- Started: {}",
        output.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(md, "- Version: {}", output.tool_version);
    let _ = writeln!(
        md,
        "- Documents: {} ok, {} failed",
        summary.documents_ok, summary.documents_failed
    );
    let _ = writeln!(
        md,
        "- Patterns: {}, variations: {}",
        summary.patterns, summary.variations
    );
    let _ = writeln!(md, "- Elapsed: {} ms", summary.elapsed_ms);
    let _ = writeln!(md);

    let _ = writeln!(md, "## Resolution methods");
    let _ = writeln!(md);
    let _ = writeln!(md, "| Method | Variations |");
    let _ = writeln!(md, "|---|---:|");
    for method in ResolutionMethod::ALL {
        let count = summary.by_method.get(&method).copied().unwrap_or(0);
        let _ = writeln!(md, "| {method} | {count} |");
    }
    let _ = writeln!(md);

    if !output.documents.is_empty() {
        let _ = writeln!(md, "## Documents");
        let _ = writeln!(md);
        let header: Vec<&str> = ResolutionMethod::ALL.iter().map(|m| m.as_str()).collect();
        let _ = writeln!(
            md,
            "| Document | Lens | Patterns | Variations | {} |",
            header.join(" | ")
        );
        let _ = writeln!(
            md,
            "|---|---|---:|---:|{}",
            "---:|".repeat(ResolutionMethod::ALL.len())
        );
        for doc in &output.documents {
            let counts = doc.method_counts();
            let cells: Vec<String> = ResolutionMethod::ALL
                .iter()
                .map(|m| counts.get(m).copied().unwrap_or(0).to_string())
                .collect();
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {} |",
                escape_cell(&doc.id),
                escape_cell(&doc.lens),
                doc.patterns.len(),
                doc.variations.len(),
                cells.join(" | ")
            );
        }
        let _ = writeln!(md);
    }

    if !output.failures.is_empty() {
        let _ = writeln!(md, "## Failures");
        let _ = writeln!(md);
        for failure in &output.failures {
            let _ = writeln!(md, "- `{}`: {}", failure.id, failure.error);
        }
    }

    md
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

/// Write to a temp file, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp, content).map_err(|e| PatternLinkError::io(&temp, e))?;
    std::fs::rename(&temp, path).map_err(|e| PatternLinkError::io(path, e))?;
    debug!(path = %path.display(), bytes = content.len(), "wrote report file");
    Ok(())
}
