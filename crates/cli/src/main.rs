//! semmerge command-line tool.
//!
//! Provides subcommands for inspecting what the analyzer sees in an edit,
//! running a merge over a manifest of task outputs, browsing per-file
//! timelines, and generating / validating configuration files.

mod merge;
mod signals;
mod style;
mod timeline;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing_subscriber::EnvFilter;

use semmerge_core::config::MergeConfig;
use semmerge_core::SemanticAnalyzer;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// semmerge command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "semmerge",
    version,
    about = "Reconcile parallel task edits with a semantic merge"
)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when it is absent.
    #[arg(short, long, global = true, default_value = "./semmerge.toml")]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the semantic changes between two versions of a file.
    Analyze {
        /// Original version.
        before: PathBuf,
        /// Edited version.
        after: PathBuf,
        /// Language extension; defaults to the extension of `after`.
        #[arg(long)]
        ext: Option<String>,
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Merge every file listed in a run manifest.
    Merge {
        /// JSON manifest with a baseline and per-task content for each file.
        #[arg(short, long)]
        manifest: PathBuf,
        /// Directory to write fully merged files into.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print JSON outcomes instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Inspect stored timelines.
    Timeline {
        #[command(subcommand)]
        action: timeline::TimelineAction,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./semmerge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        command => {
            let config = load_config(&cli.config)?;
            init_tracing(cli.log_level.as_deref(), &config);

            match command {
                Commands::Analyze {
                    before,
                    after,
                    ext,
                    json,
                } => cmd_analyze(&before, &after, ext.as_deref(), json),
                Commands::Merge {
                    manifest,
                    output,
                    json,
                } => merge::run_merge(&config, &manifest, output.as_deref(), json).await,
                Commands::Timeline { action } => timeline::run_timeline(&config, action).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

fn init_tracing(override_level: Option<&str>, config: &MergeConfig) {
    let log_level = override_level.unwrap_or(&config.engine.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Load, resolve, and validate the config; a missing file means defaults.
fn load_config(path: &Path) -> Result<MergeConfig> {
    let mut config = if path.exists() {
        MergeConfig::load_from_file(path).context("failed to load configuration file")?
    } else {
        MergeConfig::default()
    };
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# semmerge configuration

[engine]
max_parallel_files = 4
log_level = "info"
skip_patterns = ["**/*.lock"]
quarantine_corrupt_timelines = false

[storage]
root = ".semmerge"

[resolver]
enabled = true
timeout_secs = 120
max_retries = 2
retry_backoff_ms = 500
max_snippet_chars = 4000
max_context_chars = 24000
batch_regions = true

[llm]
api_url = "https://api.openai.com/v1/chat/completions"
model = "gpt-4o-mini"
api_key_env = "SEMMERGE_LLM_API_KEY"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Set SEMMERGE_LLM_API_KEY to enable the AI resolver");
    println!(
        "  2. Validate with: semmerge validate --config {}",
        output.display()
    );
    println!(
        "  3. Merge a run: semmerge merge --manifest run.json --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        MergeConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    // Resolve env vars (non-fatal warnings)
    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All values are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Parallel files : {}", config.engine.max_parallel_files);
    println!("  Skip patterns  : {}", config.engine.skip_patterns.join(", "));
    println!("  Storage root   : {}", config.storage.root.display());
    println!(
        "  AI resolver    : {}",
        if config.resolver.enabled { "enabled" } else { "disabled" }
    );
    println!("  LLM endpoint   : {}", config.llm.api_url);
    println!("  LLM model      : {}", config.llm.model);
    println!(
        "  LLM API key    : {}",
        if config.llm.api_key.is_some() {
            "set"
        } else {
            "NOT SET"
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_analyze(before: &Path, after: &Path, ext: Option<&str>, json: bool) -> Result<()> {
    let before_text = std::fs::read_to_string(before)
        .with_context(|| format!("failed to read {}", before.display()))?;
    let after_text = std::fs::read_to_string(after)
        .with_context(|| format!("failed to read {}", after.display()))?;
    let ext = match ext {
        Some(ext) => ext.to_string(),
        None => after
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string)
            .context("cannot infer the language; pass --ext")?,
    };
    let file_path = after.display().to_string();

    let changes = SemanticAnalyzer::analyze(&file_path, &before_text, &after_text, &ext)
        .context("analysis failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }
    if changes.is_empty() {
        println!("No semantic changes.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Change", "Location", "Target", "Lines"]);
    for change in &changes {
        table.add_row(vec![
            Cell::new(change.change_type),
            Cell::new(&change.location),
            Cell::new(&change.target),
            Cell::new(format!("{}-{}", change.line_start, change.line_end)),
        ]);
    }
    println!("{}", table);
    println!("{}", style::dim(&format!("{} change(s)", changes.len())));
    Ok(())
}
