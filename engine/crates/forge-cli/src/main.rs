use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use odrl_forge::progress::HttpProgressSource;
use odrl_forge::sync::RemoteMirror;
use odrl_forge::{
    keychain, store, AppConfig, Error, HistoryEntry, HistoryStore, HttpBackend, ModelDescriptor,
    ModelRegistry, Orchestrator, PipelineRun, ProgressChannel, ProviderType, RunStatus, Settings,
    Stage, StageStatus, SyncMode, SyncWarning,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Turn natural-language usage policies into ODRL through the
/// parse → reason → generate → validate pipeline.
#[derive(Parser, Debug)]
#[command(name = "odrl-forge", author, version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured sync mode (local-only, both, backend-only).
    #[arg(long, global = true)]
    sync_mode: Option<SyncMode>,

    /// Debug logging (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on a policy text
    Run(RunArgs),
    /// Continue a run from history, skipping the stages it already completed
    Resume {
        /// History entry id
        id: i64,
        #[command(flatten)]
        options: PipelineArgs,
    },
    /// Inspect and manage run history
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    /// Inspect and manage models
    Models {
        #[command(subcommand)]
        command: ModelsCommand,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Policy text. Read from stdin when neither this nor --file is given.
    text: Option<String>,

    /// Read the policy text from a file.
    #[arg(long, conflicts_with = "text")]
    file: Option<PathBuf>,

    #[command(flatten)]
    options: PipelineArgs,
}

#[derive(Args, Debug, Default)]
struct PipelineArgs {
    /// Model id used for every stage.
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature, 0.0 to 2.0.
    #[arg(long)]
    temperature: Option<f64>,

    /// Per-stage model, e.g. `reasoner=groq-llama-70b`. Repeatable.
    #[arg(long = "stage-model", value_parser = parse_stage_model)]
    stage_models: Vec<(Stage, String)>,

    /// Print the final run as JSON.
    #[arg(long)]
    json: bool,

    /// Skip the live progress stream.
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    /// List entries, most recent first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Case-insensitive search over input text and timestamp
    Search { query: String },
    /// Print one entry as JSON
    Show { id: i64 },
    /// Export every entry as JSON
    Export {
        /// Output file; stdout when omitted.
        #[arg(long, short)]
        out: Option<PathBuf>,
    },
    /// Merge entries from an export file
    Import { path: PathBuf },
    /// Delete one entry
    Remove { id: i64 },
    /// Delete every entry
    Clear {
        /// Required; clearing cannot be undone.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    /// List built-in and custom models
    List,
    /// Add or update a custom model
    Add(AddModelArgs),
    /// Remove a custom model
    Remove { id: String },
}

#[derive(Args, Debug)]
struct AddModelArgs {
    /// Existing id to update; a new id is generated when omitted.
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    label: String,

    #[arg(long)]
    provider: ProviderType,

    /// Model name as the provider knows it.
    #[arg(long)]
    model_identifier: String,

    #[arg(long)]
    base_url: Option<String>,

    /// Stored in the OS keychain, never in the database.
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long, default_value_t = 4096)]
    context_length: u32,

    #[arg(long)]
    temperature: Option<f64>,
}

fn parse_stage_model(value: &str) -> Result<(Stage, String), String> {
    let (stage, model) = value
        .split_once('=')
        .ok_or_else(|| format!("expected STAGE=MODEL, got '{value}'"))?;
    let stage: Stage = stage.parse()?;
    let model = model.trim();
    if model.is_empty() {
        return Err("model id must not be empty".to_string());
    }
    Ok((stage, model.to_string()))
}

/// Everything a command needs, opened from config.
struct Engine {
    config: AppConfig,
    backend: Arc<HttpBackend>,
    mirror: Option<Arc<RemoteMirror>>,
    registry: ModelRegistry,
    history: Arc<HistoryStore>,
    settings: Settings,
}

impl Engine {
    fn open(config_path: Option<&Path>, sync_mode: Option<SyncMode>) -> Result<Self> {
        let config = match config_path {
            Some(path) => AppConfig::load_from_path(path),
            None => AppConfig::load_default(),
        }
        .context("failed to load config")?;
        keychain::ensure_available();

        let mut settings = config.settings();
        if let Some(mode) = sync_mode {
            settings.sync_mode = mode;
        }
        let mode = settings.sync_mode;

        let backend = Arc::new(config.backend.http_backend());
        let mirror = mode
            .writes_remote()
            .then(|| Arc::new(RemoteMirror::new(backend.clone())));

        let data_dir = config.data_dir();
        let pool = store::open_pool(&data_dir)
            .with_context(|| format!("failed to open local store in {}", data_dir.display()))?;
        let registry = ModelRegistry::open(pool.clone(), backend.clone(), mirror.clone(), mode)
            .context("failed to load custom models")?;
        let history = HistoryStore::open(pool, mirror.clone(), mode, config.history.max_entries)
            .context("failed to load history")?;
        debug!(mode = mode.as_str(), backend = backend.base_url(), "engine opened");

        Ok(Self {
            config,
            backend,
            mirror,
            registry,
            history: Arc::new(history),
            settings,
        })
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.backend.clone(), Some(self.history.clone()))
    }

    /// Retry writes the remote mirror missed during this invocation.
    fn flush_mirror(&self) {
        let Some(mirror) = &self.mirror else { return };
        let pending = mirror.pending_count();
        if pending == 0 {
            return;
        }
        match mirror.flush_pending() {
            Ok(flushed) => debug!(flushed, "remote mirror caught up"),
            Err(err) => eprintln!(
                "{} {} write(s) not mirrored to the backend: {err}",
                "warning:".yellow().bold(),
                mirror.pending_count()
            ),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut engine = Engine::open(cli.config.as_deref(), cli.sync_mode)?;
    let outcome = match cli.command {
        Command::Run(args) => {
            let input = read_input(&args)?;
            cmd_run(&mut engine, &input, &args.options)
        }
        Command::Resume { id, options } => cmd_resume(&mut engine, id, &options),
        Command::History { command } => cmd_history(&engine, command),
        Command::Models { command } => cmd_models(&engine, command),
    };
    engine.flush_mirror();
    outcome
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn read_input(args: &RunArgs) -> Result<String> {
    if let Some(text) = &args.text {
        return Ok(text.clone());
    }
    if let Some(path) = &args.file {
        return fs::read_to_string(path)
            .with_context(|| format!("failed to read policy text from {}", path.display()));
    }
    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .context("failed to read policy text from stdin")?;
    Ok(text)
}

// ============================================================================
// run / resume
// ============================================================================

fn cmd_run(engine: &mut Engine, input: &str, options: &PipelineArgs) -> Result<()> {
    let orchestrator = engine.orchestrator();
    orchestrator.prepare(input)?;
    execute(engine, &orchestrator, options)
}

fn cmd_resume(engine: &mut Engine, id: i64, options: &PipelineArgs) -> Result<()> {
    let entry = engine
        .history
        .get(id)
        .ok_or_else(|| anyhow!("no history entry with id {id}"))?;
    let orchestrator = engine.orchestrator();
    orchestrator.resume_from(&entry)?;

    let run = orchestrator.snapshot();
    if run.status == RunStatus::Completed {
        println!("Entry {id} already completed every stage.");
        return print_run(&run, options.json);
    }
    if let Some(stage) = run.next_stage() {
        println!("Resuming entry {id} at {}", stage.as_str().bold());
    }
    execute(engine, &orchestrator, options)
}

fn apply_options(settings: &mut Settings, options: &PipelineArgs) -> Result<()> {
    if let Some(model) = &options.model {
        settings.default_model = Some(model.clone());
    }
    if let Some(temperature) = options.temperature {
        settings.set_temperature(temperature)?;
    }
    if !options.stage_models.is_empty() {
        settings.set_advanced_mode(true);
        for (stage, model) in &options.stage_models {
            settings.set_stage_model(*stage, model.clone())?;
        }
    }
    Ok(())
}

fn execute(engine: &mut Engine, orchestrator: &Orchestrator, options: &PipelineArgs) -> Result<()> {
    apply_options(&mut engine.settings, options)?;
    if let Err(err) = engine.registry.list_available() {
        warn!(error = %err, "built-in model catalog unavailable");
    }
    for field in engine.settings.reconcile(&engine.registry) {
        eprintln!(
            "{} {field} no longer resolves; using the fallback model",
            "note:".yellow().bold()
        );
    }

    let policy = engine.config.progress.policy();
    let channel = ProgressChannel::new(
        Arc::new(HttpProgressSource::for_policy(engine.backend.base_url(), &policy)),
        policy,
    );
    if !options.no_progress {
        orchestrator.watch_progress(&channel)?;
    }

    let done = AtomicBool::new(false);
    let engine = &*engine;
    let outcome = thread::scope(|scope| {
        if !options.json {
            scope.spawn(|| report_progress(orchestrator, &done));
        }
        let outcome = orchestrator.run_remaining(&engine.settings, &engine.registry);
        done.store(true, Ordering::SeqCst);
        outcome
    });
    orchestrator.stop_watching();

    let run = orchestrator.snapshot();
    print_run(&run, options.json)?;
    if orchestrator.progress_degraded() {
        eprintln!("{} live progress was unavailable for this run", "note:".yellow().bold());
    }
    outcome.map(|_| ()).context("pipeline did not complete")
}

/// Prints a line whenever the processing stage or its progress changes.
fn report_progress(orchestrator: &Orchestrator, done: &AtomicBool) {
    let mut last = String::new();
    while !done.load(Ordering::SeqCst) {
        let run = orchestrator.snapshot();
        if let Some(stage) = run.processing_stage() {
            let record = run.stage(stage);
            let line = match &record.progress {
                Some(progress) => format!("{stage}: {:>3.0}% {}", progress.percent, progress.label),
                None => format!(
                    "{stage}: running on {}",
                    record.model.as_deref().unwrap_or("default model")
                ),
            };
            if line != last {
                eprintln!("  {} {}", "…".dimmed(), line);
                last = line;
            }
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn print_run(run: &PipelineRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    for stage in Stage::ALL {
        let record = run.stage(stage);
        let mark = match record.status {
            StageStatus::Completed => "✔".green(),
            StageStatus::Error => "✘".red(),
            StageStatus::Cancelled => "■".yellow(),
            StageStatus::Processing => "…".normal(),
            StageStatus::Idle => "·".dimmed(),
        };
        let elapsed = record
            .elapsed_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_default();
        println!(
            "{mark} {:<10} {:>10}  {}",
            stage.as_str(),
            elapsed,
            record.model.as_deref().unwrap_or("").dimmed()
        );
        if let Some(error) = &record.error {
            println!("    {}", error.red());
        }
    }

    if let Some(policy) = &run.stage(Stage::Generator).result {
        println!("\n{}", "ODRL policy".bold());
        println!("{}", serde_json::to_string_pretty(policy)?);
    }
    if let Some(report) = &run.stage(Stage::Validator).result {
        println!("\n{}", "Validation".bold());
        println!("{}", serde_json::to_string_pretty(report)?);
    }

    let status = match run.status {
        RunStatus::Completed => run.status.as_str().green(),
        RunStatus::Failed => run.status.as_str().red(),
        RunStatus::Cancelled => run.status.as_str().yellow(),
        _ => run.status.as_str().normal(),
    };
    println!("\nrun {} {}", run.run_id.dimmed(), status.bold());
    Ok(())
}

fn print_warnings(warnings: &[SyncWarning]) {
    for warning in warnings {
        eprintln!(
            "{} {} not mirrored: {}",
            "warning:".yellow().bold(),
            warning.operation,
            warning.message
        );
    }
}

// ============================================================================
// history
// ============================================================================

fn cmd_history(engine: &Engine, command: HistoryCommand) -> Result<()> {
    let history = &engine.history;
    match command {
        HistoryCommand::List { limit } => {
            let entries = history.list();
            let shown = limit.unwrap_or(entries.len());
            print_entries(&entries[..shown.min(entries.len())]);
        }
        HistoryCommand::Search { query } => print_entries(&history.search(&query)),
        HistoryCommand::Show { id } => {
            let entry = history
                .get(id)
                .ok_or_else(|| anyhow!("no history entry with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        HistoryCommand::Export { out } => {
            let bytes = history.export_all()?;
            match out {
                Some(path) => {
                    fs::write(&path, &bytes)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported {} entries to {}", history.len(), path.display());
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    writeln!(stdout)?;
                }
            }
        }
        HistoryCommand::Import { path } => {
            let bytes =
                fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let imported = history
                .import(&bytes)
                .with_context(|| format!("failed to import {}", path.display()))?;
            print_warnings(&imported.warnings);
            println!("Imported {} entries", imported.value);
        }
        HistoryCommand::Remove { id } => {
            let removed = history.remove(id)?;
            print_warnings(&removed.warnings);
            println!("Removed entry {id}");
        }
        HistoryCommand::Clear { yes } => {
            if !yes {
                bail!("refusing to clear history without --yes");
            }
            let cleared = history.clear_all()?;
            print_warnings(&cleared.warnings);
            println!("Cleared {} entries", cleared.value);
        }
    }
    Ok(())
}

fn print_entries(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No history entries.");
        return;
    }
    for entry in entries {
        let status = match entry.status {
            RunStatus::Completed => entry.status.as_str().green(),
            RunStatus::Failed => entry.status.as_str().red(),
            _ => entry.status.as_str().yellow(),
        };
        println!(
            "{}  {}  {:<9}  {:<20}  {}",
            entry.id.to_string().dimmed(),
            entry.display_timestamp(),
            status,
            entry.model.as_deref().unwrap_or("-"),
            preview(&entry.input_text, 60)
        );
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{cut}…")
}

// ============================================================================
// models
// ============================================================================

fn cmd_models(engine: &Engine, command: ModelsCommand) -> Result<()> {
    let registry = &engine.registry;
    match command {
        ModelsCommand::List => {
            let custom = match registry.list_available() {
                Ok(available) => {
                    for provider in &available.catalog {
                        let header = if provider.available {
                            provider.name.bold()
                        } else {
                            format!("{} (unavailable)", provider.name).dimmed()
                        };
                        println!("{header}");
                        for model in &provider.models {
                            print_model(model);
                        }
                    }
                    available.custom
                }
                Err(Error::BackendUnavailable { message, custom }) => {
                    eprintln!(
                        "{} built-in models unavailable: {message}",
                        "warning:".yellow().bold()
                    );
                    custom
                }
                Err(err) => return Err(err.into()),
            };
            println!("{}", "Custom".bold());
            if custom.is_empty() {
                println!("  (none)");
            }
            for model in &custom {
                print_model(model);
            }
        }
        ModelsCommand::Add(args) => {
            let descriptor = ModelDescriptor {
                id: args.id.unwrap_or_default(),
                label: args.label,
                provider_type: args.provider,
                base_url: args.base_url,
                model_identifier: args.model_identifier,
                api_key: args.api_key,
                has_api_key: false,
                context_length: args.context_length,
                default_temperature: args.temperature,
            };
            let saved = registry.upsert(descriptor)?;
            print_warnings(&saved.warnings);
            println!("Saved model {}", saved.value.id.bold());
        }
        ModelsCommand::Remove { id } => {
            let removed = registry.remove(&id)?;
            print_warnings(&removed.warnings);
            println!("Removed model {id}");
        }
    }
    Ok(())
}

fn print_model(model: &ModelDescriptor) {
    let key = if model.has_api_key { "  [key]" } else { "" };
    println!(
        "  {:<28} {:<32} {}:{}{}{}",
        model.id,
        model.label,
        model.provider_type,
        model.model_identifier,
        model
            .base_url
            .as_deref()
            .map(|url| format!(" @ {url}"))
            .unwrap_or_default()
            .dimmed(),
        key
    );
}
