//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use patternlink_core::{
    BatchOutput, Pipeline, ProgressReporter, Resolver, load_inputs, write_reports,
};
use patternlink_knowledge::KnowledgeStore;
use patternlink_oracle::{ChatOracle, Oracle};
use patternlink_segmenter::{SegmentOptions, segment};
use patternlink_shared::{
    AppConfig, LinkerConfig, ResolutionMethod, expand_path, init_config, load_config,
    load_config_from, resolve_api_key, validate_config,
};
use patternlink_similarity::{
    SimilarityScorer, TrainOptions, embedder_from_config, train_projection,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PatternLink: link document variations to the patterns they vary.
#[derive(Parser)]
#[command(
    name = "patternlink",
    version,
    about = "Segment documents into patterns and variations and link each variation to its pattern.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.patternlink/patternlink.toml).
    #[arg(long, global = true, env = "PATTERNLINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Segment and link a batch of documents.
    Run {
        /// Input files or directories (.json, .txt, .md).
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output directory for run reports.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Knowledge file to read and learn into.
        #[arg(long)]
        kb: Option<PathBuf>,

        /// Skip declared references and number alignment.
        #[arg(long)]
        disable_index: bool,

        /// Semantic acceptance threshold in [0, 1].
        #[arg(long)]
        semantic_threshold: Option<f32>,

        /// Fuzzy acceptance threshold in [0, 1].
        #[arg(long)]
        fuzzy_threshold: Option<f32>,

        /// Embedding model (`hashing-<dim>` or `remote:<model>`).
        #[arg(long)]
        model: Option<String>,

        /// Enable the oracle stage.
        #[arg(long, conflicts_with = "no_oracle")]
        oracle: bool,

        /// Disable the oracle stage.
        #[arg(long)]
        no_oracle: bool,
    },

    /// Fit an embedding projection on a corpus.
    Train {
        /// Input files or directories (.json, .txt, .md).
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Where to write the projection JSON.
        #[arg(short, long)]
        out: PathBuf,

        /// Gradient-descent epochs.
        #[arg(long, default_value_t = TrainOptions::default().epochs)]
        epochs: usize,

        /// Gradient-descent learning rate.
        #[arg(long, default_value_t = TrainOptions::default().learning_rate)]
        learning_rate: f32,
    },

    /// Inspect or edit the knowledge store.
    Kb {
        /// Knowledge subcommand.
        #[command(subcommand)]
        action: KbAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Knowledge store subcommands.
#[derive(Subcommand)]
pub(crate) enum KbAction {
    /// Print stored mappings.
    Show {
        /// Only this lens.
        #[arg(long)]
        lens: Option<String>,
    },
    /// Store a mapping.
    Set {
        lens: String,
        variation: u32,
        pattern: u32,
    },
    /// Remove a mapping.
    Forget { lens: String, variation: u32 },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "patternlink=info",
        1 => "patternlink=debug",
        _ => "patternlink=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config;
    match cli.command {
        Command::Run {
            paths,
            out,
            kb,
            disable_index,
            semantic_threshold,
            fuzzy_threshold,
            model,
            oracle,
            no_oracle,
        } => {
            let mut config = read_config(config_path.as_deref())?;
            apply_overrides(
                &mut config,
                RunOverrides {
                    disable_index,
                    semantic_threshold,
                    fuzzy_threshold,
                    model,
                    oracle: oracle_flag(oracle, no_oracle),
                },
            )?;
            cmd_run(config, paths, out, kb).await
        }
        Command::Train {
            paths,
            out,
            epochs,
            learning_rate,
        } => {
            let config = read_config(config_path.as_deref())?;
            let options = TrainOptions {
                epochs,
                learning_rate,
            };
            cmd_train(config, paths, out, options).await
        }
        Command::Kb { action } => {
            let config = read_config(config_path.as_deref())?;
            match action {
                KbAction::Show { lens } => cmd_kb_show(&config, lens.as_deref()),
                KbAction::Set {
                    lens,
                    variation,
                    pattern,
                } => cmd_kb_set(&config, &lens, variation, pattern),
                KbAction::Forget { lens, variation } => cmd_kb_forget(&config, &lens, variation),
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    }
}

fn read_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

/// Flag values that override the config file for one run.
struct RunOverrides {
    disable_index: bool,
    semantic_threshold: Option<f32>,
    fuzzy_threshold: Option<f32>,
    model: Option<String>,
    oracle: Option<bool>,
}

fn oracle_flag(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn apply_overrides(config: &mut AppConfig, overrides: RunOverrides) -> Result<()> {
    if overrides.disable_index {
        config.linking.disable_index_mapping = true;
    }
    if let Some(t) = overrides.semantic_threshold {
        config.linking.semantic_threshold = t;
    }
    if let Some(t) = overrides.fuzzy_threshold {
        config.linking.fuzzy_threshold = t;
    }
    if let Some(model) = overrides.model {
        config.embedding.model_id = model;
    }
    if let Some(enabled) = overrides.oracle {
        config.oracle.enabled = enabled;
    }
    validate_config(config)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: AppConfig,
    paths: Vec<PathBuf>,
    out: Option<PathBuf>,
    kb: Option<PathBuf>,
) -> Result<()> {
    let out_dir = out.unwrap_or_else(|| expand_path(&config.output.dir));
    let kb_path = kb.unwrap_or_else(|| expand_path(&config.knowledge.path));

    info!(
        inputs = paths.len(),
        out = %out_dir.display(),
        kb = %kb_path.display(),
        oracle = config.oracle.enabled,
        "starting run"
    );

    // Blocking HTTP clients must be built and dropped off the async runtime.
    let output = tokio::task::spawn_blocking(move || -> Result<(BatchOutput, PathBuf, PathBuf)> {
        let credentials = resolve_api_key(&config.oracle);
        let api_key = credentials.as_ref().map(|c| c.api_key.clone());

        let scorer = SimilarityScorer::from_config(&config.embedding, api_key)?;
        let knowledge = KnowledgeStore::load(&kb_path, config.knowledge.on_corrupt)?;
        let oracle = ChatOracle::from_config(&config.oracle, credentials)
            .map(|o| Box::new(o) as Box<dyn Oracle>);

        let resolver = Resolver::new(LinkerConfig::from(&config), knowledge, scorer, oracle);
        let mut pipeline = Pipeline::new(SegmentOptions::from(&config), resolver);

        let inputs = load_inputs(&paths);
        let reporter = CliProgress::new();
        let output = pipeline.run_batch(inputs, &reporter);
        pipeline.finish()?;

        let reports = write_reports(&output, &out_dir)?;
        Ok((output, reports.json, reports.markdown))
    })
    .await??;

    let (output, json_path, md_path) = output;
    print_run_summary(&output, &json_path, &md_path);

    if output.summary.documents_total > 0 && output.summary.documents_ok == 0 {
        return Err(eyre!("no document could be processed"));
    }
    Ok(())
}

fn print_run_summary(output: &BatchOutput, json_path: &Path, md_path: &Path) {
    let summary = &output.summary;
    println!();
    println!("  Run {}", output.run_id);
    println!(
        "  Documents:  {} ok, {} failed",
        summary.documents_ok, summary.documents_failed
    );
    println!("  Patterns:   {}", summary.patterns);
    println!("  Variations: {}", summary.variations);
    for method in ResolutionMethod::ALL {
        let count = summary.by_method.get(&method).copied().unwrap_or(0);
        if count > 0 {
            println!("    {:<15} {count}", method.as_str());
        }
    }
    for failure in &output.failures {
        println!("  Failed: {} ({})", failure.id, failure.error);
    }
    println!("  Report:     {}", json_path.display());
    println!("  Summary:    {}", md_path.display());
    println!("  Time:       {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn batch_started(&self, total: usize) {
        self.spinner.set_message(format!("Linking {total} documents"));
    }

    fn document_started(&self, id: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Linking [{current}/{total}] {id}"));
    }

    fn document_finished(&self, id: &str, ok: bool) {
        if !ok {
            self.spinner.println(format!("  skipped {id}"));
        }
    }

    fn done(&self, _output: &BatchOutput) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// train
// ---------------------------------------------------------------------------

async fn cmd_train(
    config: AppConfig,
    paths: Vec<PathBuf>,
    out: PathBuf,
    options: TrainOptions,
) -> Result<()> {
    info!(inputs = paths.len(), out = %out.display(), "training projection");

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let api_key = resolve_api_key(&config.oracle).map(|c| c.api_key);
        let embedder = embedder_from_config(&config.embedding, api_key)?;
        let segment_options = SegmentOptions::from(&config);

        let loaded = load_inputs(&paths);
        for failure in &loaded.failures {
            println!("  Skipped: {} ({})", failure.id, failure.error);
        }
        let documents: Vec<_> = loaded
            .documents
            .iter()
            .map(|input| segment(input, &segment_options))
            .filter(|doc| !doc.patterns.is_empty())
            .collect();
        if documents.is_empty() {
            return Err(eyre!("no input document has any pattern to train on"));
        }

        let (projection, report) = train_projection(
            embedder.as_ref(),
            &documents,
            config.embedding.max_chars,
            &options,
        )?;
        projection.save(&out)?;
        Ok((report, out))
    })
    .await??;

    let (report, out) = report;
    println!();
    println!("  Projection written to {}", out.display());
    println!("  Documents: {}", report.documents);
    println!("  Samples:   {}", report.samples);
    println!("  Epochs:    {}", report.epochs);
    println!(
        "  Loss:      {:.4} -> {:.4}",
        report.initial_loss, report.final_loss
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// kb
// ---------------------------------------------------------------------------

fn open_store(config: &AppConfig) -> Result<KnowledgeStore> {
    let path = expand_path(&config.knowledge.path);
    Ok(KnowledgeStore::load(&path, config.knowledge.on_corrupt)?)
}

fn cmd_kb_show(config: &AppConfig, lens: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    if store.is_empty() {
        println!("Knowledge store is empty.");
        return Ok(());
    }
    for name in store.lenses() {
        if lens.is_some_and(|l| l != name) {
            continue;
        }
        println!("{name}");
        if let Some(mapping) = store.mapping(name) {
            for (variation, pattern) in mapping {
                println!("  variation {variation:>3} -> pattern {pattern}");
            }
        }
    }
    Ok(())
}

fn cmd_kb_set(config: &AppConfig, lens: &str, variation: u32, pattern: u32) -> Result<()> {
    if variation == 0 || pattern == 0 {
        return Err(eyre!("variation and pattern numbers start at 1"));
    }
    let mut store = open_store(config)?;
    store.record(lens, variation, pattern);
    store.flush()?;
    println!("{lens}: variation {variation} -> pattern {pattern}");
    Ok(())
}

fn cmd_kb_forget(config: &AppConfig, lens: &str, variation: u32) -> Result<()> {
    let mut store = open_store(config)?;
    if !store.forget(lens, variation) {
        return Err(eyre!("no mapping for {lens} variation {variation}"));
    }
    store.flush()?;
    println!("{lens}: forgot variation {variation}");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = read_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "patternlink",
            "-v",
            "run",
            "docs/",
            "--disable-index",
            "--semantic-threshold",
            "0.5",
            "--no-oracle",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Run {
                paths,
                disable_index,
                semantic_threshold,
                oracle,
                no_oracle,
                ..
            } => {
                assert_eq!(paths, vec![PathBuf::from("docs/")]);
                assert!(disable_index);
                assert_eq!(semantic_threshold, Some(0.5));
                assert_eq!(oracle_flag(oracle, no_oracle), Some(false));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn oracle_flags_conflict() {
        let result =
            Cli::try_parse_from(["patternlink", "run", "a.json", "--oracle", "--no-oracle"]);
        assert!(result.is_err());
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            RunOverrides {
                disable_index: true,
                semantic_threshold: Some(0.8),
                fuzzy_threshold: None,
                model: Some("hashing-128".into()),
                oracle: Some(true),
            },
        )
        .unwrap();
        assert!(config.linking.disable_index_mapping);
        assert_eq!(config.linking.semantic_threshold, 0.8);
        assert_eq!(config.embedding.model_id, "hashing-128");
        assert!(config.oracle.enabled);
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = AppConfig::default();
        let result = apply_overrides(
            &mut config,
            RunOverrides {
                disable_index: false,
                semantic_threshold: Some(1.5),
                fuzzy_threshold: None,
                model: None,
                oracle: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn kb_set_parses_positionals() {
        let cli = Cli::try_parse_from(["patternlink", "kb", "set", "LensX", "4", "2"]).unwrap();
        match cli.command {
            Command::Kb {
                action:
                    KbAction::Set {
                        lens,
                        variation,
                        pattern,
                    },
            } => {
                assert_eq!(lens, "LensX");
                assert_eq!((variation, pattern), (4, 2));
            }
            _ => panic!("expected kb set"),
        }
    }
}
