//! # doc-harness CLI
//!
//! The `doc-harness` binary regenerates a repository's documentation tree
//! incrementally: only files whose content changed are summarized again,
//! and only sections whose inputs changed are rebuilt.
//!
//! ## Usage
//!
//! ```bash
//! doc-harness --config ./doc-harness.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `doc-harness generate` | Scan, summarize changed files, rebuild stale sections |
//! | `doc-harness status` | Show what changed since the last run, without calling the service |
//!
//! ## Examples
//!
//! ```bash
//! # Regenerate docs for the current directory
//! OPENAI_API_KEY=... doc-harness generate
//!
//! # Force the architecture section and all domain pages
//! doc-harness generate --regen architecture,domains
//!
//! # Rebuild everything and write a README (overwriting an existing one)
//! doc-harness generate --regen all --readme --force
//!
//! # What would the next run touch?
//! doc-harness status --source ../service
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use doc_harness::config::{self, Config};
use doc_harness::llm::OpenAiGenerator;
use doc_harness::models::DiffPartition;
use doc_harness::pipeline::{self, GenerateOptions, OutputPaths, Pipeline, RunReport};
use doc_harness::policy::ForceSet;
use doc_harness::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use doc_harness::{scanner, tokenizer};

/// Environment variable holding the default `--regen` list.
const REGEN_ENV: &str = "DOC_HARNESS_REGEN";
/// Environment variable holding the log filter.
const LOG_ENV: &str = "DOC_HARNESS_LOG";

/// doc-harness: incremental documentation generator.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without it, `./doc-harness.toml` is used when present, otherwise
/// built-in defaults.
#[derive(Parser)]
#[command(
    name = "doc-harness",
    about = "doc-harness: incremental, cache-aware documentation generator",
    version,
    long_about = "doc-harness scans a repository, summarizes changed files through an \
    OpenAI-compatible chat service, and rebuilds only the documentation sections whose \
    inputs changed. Responses are cached so unchanged runs make no remote calls."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Generate or update the documentation tree.
    ///
    /// Scans the source tree, diffs it against the ledger from the previous
    /// run, summarizes added and modified files, and rebuilds stale
    /// sections. Per-file failures are reported at the end and do not
    /// abort the run.
    Generate {
        /// Repository to document.
        #[arg(long, default_value = ".")]
        source: PathBuf,

        /// Root for the docs and cache directories (defaults to --source).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Sections to rebuild regardless of changes: `all`, a section key
        /// or title, `domains`, `domain:<tag>`, `modules`, `configs`.
        /// Comma-separated; falls back to $DOC_HARNESS_REGEN.
        #[arg(long, value_delimiter = ',')]
        regen: Vec<String>,

        /// Concurrent summarization tasks.
        #[arg(long)]
        threads: Option<usize>,

        /// Neither read nor write the response cache.
        #[arg(long)]
        no_cache: bool,

        /// Also write README.md at the output root.
        #[arg(long)]
        readme: bool,

        /// Overwrite an existing README.md.
        #[arg(long)]
        force: bool,

        /// Output language for generated text.
        #[arg(long)]
        language: Option<String>,

        /// Progress on stderr: off, human or json (default: human on a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show added, modified and deleted files since the last run.
    Status {
        /// Repository to inspect.
        #[arg(long, default_value = ".")]
        source: PathBuf,

        /// Root the cache directory lives under (defaults to --source).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("doc_harness=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn regen_targets(flag: Vec<String>) -> Vec<String> {
    if !flag.is_empty() {
        return flag;
    }
    std::env::var(REGEN_ENV)
        .map(|v| v.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

fn project_name(source: &Path) -> String {
    source
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "project".to_string())
}

#[allow(clippy::too_many_arguments)]
async fn run_generate(
    mut cfg: Config,
    source: PathBuf,
    output: Option<PathBuf>,
    regen: Vec<String>,
    threads: Option<usize>,
    no_cache: bool,
    readme: bool,
    force: bool,
    language: Option<String>,
    progress: Option<ProgressMode>,
) -> anyhow::Result<()> {
    if let Some(threads) = threads {
        cfg.generation.threads = threads;
    }
    if no_cache {
        cfg.output.use_cache = false;
    }
    if let Some(language) = language {
        cfg.generation.language = language;
    }
    cfg.validate()?;

    let output_root = output.unwrap_or_else(|| source.clone());
    let paths = OutputPaths::resolve(&cfg.output, &output_root);
    let generator = Arc::new(OpenAiGenerator::from_config(&cfg.llm)?);
    let tokenizer = tokenizer::for_model(&cfg.llm.tokenizer, &cfg.llm.model)?;
    let reporter: Arc<dyn ProgressReporter> =
        Arc::from(progress.unwrap_or_else(ProgressMode::default_for_tty).reporter());

    reporter.report(ProgressEvent::Scanning {
        root: source.display().to_string(),
    });
    let files = scanner::scan_repository(&source, &cfg.scan, &paths.scan_excludes(&source))?;
    tracing::info!(files = files.len(), root = %source.display(), "scanned repository");

    let options = GenerateOptions {
        force: ForceSet::parse(&regen_targets(regen)),
        readme,
        force_readme: force,
        project_name: project_name(&source),
    };
    let pipeline = Pipeline::new(cfg, &output_root, generator, tokenizer).with_progress(reporter);
    let report = pipeline.run(files, &options).await?;
    print_report(&report, &pipeline.paths().docs_dir);
    Ok(())
}

fn print_report(report: &RunReport, docs_dir: &Path) {
    println!(
        "Files: {} added, {} modified, {} deleted, {} unchanged",
        report.added, report.modified, report.deleted, report.unchanged
    );
    if let Some(reason) = &report.full_rebuild {
        println!("Full rebuild: {}", reason);
    }
    println!("Summaries generated: {}", report.summarized);
    if report.regenerated.is_empty() {
        println!("Regenerated sections: none");
    } else {
        println!("Regenerated sections: {}", report.regenerated.join(", "));
    }
    println!(
        "Pages written: {}, removed: {}, summaries reclaimed: {}",
        report.pages_written,
        report.pages_removed.len(),
        report.summaries_removed
    );
    if report.readme_written {
        println!("README.md written");
    }
    println!("Remote calls: {}", report.remote_calls);
    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for error in &report.errors {
            println!("  {} [{}]: {}", error.path, error.stage, error.cause);
        }
    }
    println!("Docs: {}", docs_dir.display());
}

fn print_status(diff: &DiffPartition) {
    let list = |label: &str, paths: Vec<&String>| {
        println!("{} ({}):", label, paths.len());
        for path in paths {
            println!("  {}", path);
        }
    };
    list("Added", diff.added.keys().collect());
    list("Modified", diff.modified.keys().collect());
    list("Deleted", diff.deleted.keys().collect());
    println!("Unchanged: {}", diff.unchanged.len());
    if !diff.changed_domains.is_empty() {
        let domains: Vec<&str> = diff.changed_domains.iter().map(String::as_str).collect();
        println!("Changed domains: {}", domains.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Generate {
            source,
            output,
            regen,
            threads,
            no_cache,
            readme,
            force,
            language,
            progress,
        } => {
            run_generate(
                cfg, source, output, regen, threads, no_cache, readme, force, language, progress,
            )
            .await?;
        }
        Commands::Status { source, output } => {
            let output_root = output.unwrap_or_else(|| source.clone());
            let paths = OutputPaths::resolve(&cfg.output, &output_root);
            let files =
                scanner::scan_repository(&source, &cfg.scan, &paths.scan_excludes(&source))?;
            print_status(&pipeline::status(&paths.cache_dir, &files));
        }
    }

    Ok(())
}
