//! # Reclaw CLI (`reclaw`)
//!
//! Turns chat exports into Markdown memory.
//!
//! ## Usage
//!
//! ```bash
//! reclaw --config ./reclaw.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `reclaw plan` | Show the per-day batches an extraction would run |
//! | `reclaw extract` | Summarize batches via subagents and merge the results |
//! | `reclaw import-sessions` | Copy conversations into the agent's session history |
//! | `reclaw unpack` | Safely unpack export archives |
//!
//! ## Examples
//!
//! ```bash
//! # Preview batches
//! reclaw plan --input exports/
//!
//! # Extract into an OpenClaw workspace, four jobs at a time
//! reclaw extract --input exports/ --target ~/.openclaw/workspace --parallel 4
//!
//! # Extract into a Zettelclaw vault with a separate memory workspace
//! reclaw extract --input exports/ --target ~/vault --mode zettelclaw \
//!     --workspace ~/.openclaw/workspace
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use reclaw::archive::discover_archives;
use reclaw::config::{expand_tilde, load_config_or_default, Config};
use reclaw::input::{group_by_provider, load_inputs, provider_imports};
use reclaw::models::{ExtractionMode, Provider};
use reclaw::pipeline::{run_extraction, ExtractionOptions};
use reclaw::planner::plan;
use reclaw::process::{ProcessRunner, SystemProcessRunner};
use reclaw::progress::ProgressMode;
use reclaw::scheduler::JobScheduler;
use reclaw::sessions::SessionImporter;

/// Reclaw: migrate ChatGPT, Claude, and Grok exports into Markdown memory.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Without it, `./reclaw.toml` is used when present.
#[derive(Parser)]
#[command(
    name = "reclaw",
    about = "Migrate AI chat exports into durable Markdown memory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the per-day batches for the given inputs.
    Plan {
        /// Conversation JSON files or directories of them.
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Restrict to these providers (repeatable). Defaults to all.
        #[arg(long = "provider")]
        providers: Vec<Provider>,
    },

    /// Run subagent extraction and merge the results.
    ///
    /// Completed batches are recorded in the state file; rerunning with the
    /// same inputs and options resumes where the last run stopped.
    Extract {
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Directory receiving dated notes or journal entries.
        #[arg(long)]
        target: PathBuf,

        /// Directory holding MEMORY.md and USER.md. Defaults to the target.
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Output layout: `openclaw` or `zettelclaw`.
        #[arg(long)]
        mode: Option<ExtractionMode>,

        /// Model passed to the scheduler for every job.
        #[arg(long)]
        model: Option<String>,

        #[arg(long = "provider")]
        providers: Vec<Provider>,

        /// Maximum concurrent subagent jobs.
        #[arg(long)]
        parallel: Option<usize>,

        /// State file path.
        #[arg(long)]
        state: Option<PathBuf>,

        /// Progress output: `auto`, `human`, `json`, or `off`.
        #[arg(long, default_value = "auto")]
        progress: String,

        /// Plan and report pending batches without scheduling anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Import conversations into the workspace agent's session history.
    ImportSessions {
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Workspace whose agent receives the sessions.
        #[arg(long)]
        workspace: PathBuf,

        #[arg(long = "provider")]
        providers: Vec<Provider>,
    },

    /// Unpack export archives, rejecting any with unsafe entry paths.
    Unpack {
        /// Zip archives to unpack.
        #[arg(required = true)]
        archives: Vec<PathBuf>,

        /// Directory receiving one subdirectory per archive.
        #[arg(long)]
        out: PathBuf,
    },
}

fn selected_providers(providers: Vec<Provider>) -> Vec<Provider> {
    if providers.is_empty() {
        Provider::ALL.to_vec()
    } else {
        let mut providers = providers;
        providers.sort();
        providers.dedup();
        providers
    }
}

fn system_runner(config: &Config) -> Arc<dyn ProcessRunner> {
    let env = config
        .scheduler
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Arc::new(SystemProcessRunner::with_env(env))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = load_config_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { inputs, providers } => {
            let selected = selected_providers(providers);
            let files = load_inputs(&inputs)?;
            let batch_plan = plan(&group_by_provider(&files), &selected);

            println!("plan");
            println!("  input files: {}", files.len());
            println!("  conversations: {}", batch_plan.conversation_count);
            println!("  batches: {}", batch_plan.batches.len());
            for batch in &batch_plan.batches {
                let providers = batch
                    .providers
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "  {}  {}  {} conversations  [{}]",
                    batch.date,
                    batch.id,
                    batch.conversation_count(),
                    providers
                );
            }
            println!("ok");
        }
        Commands::Extract {
            inputs,
            target,
            workspace,
            mode,
            model,
            providers,
            parallel,
            state,
            progress,
            dry_run,
        } => {
            let progress = ProgressMode::parse(&progress)?;
            let selected = selected_providers(providers);
            let target = expand_tilde(&target);

            let mut options = ExtractionOptions::from_config(&config.run, &config.scheduler, target);
            if let Some(workspace) = workspace {
                options.memory_workspace_path = expand_tilde(&workspace);
            }
            if let Some(mode) = mode {
                options.mode = mode;
            }
            if model.is_some() {
                options.model = model;
            }
            if let Some(parallel) = parallel {
                if parallel == 0 {
                    bail!("--parallel must be >= 1");
                }
                options.max_parallel_jobs = parallel;
            }
            if let Some(state) = state {
                options.state_path = expand_tilde(&state);
            }
            options.dry_run = dry_run;

            let files = load_inputs(&inputs)?;
            let conversations = group_by_provider(&files);
            let scheduler = Arc::new(
                JobScheduler::new(system_runner(&config), config.scheduler.command.clone())
                    .with_poll_interval(config.scheduler.poll_interval()),
            );

            let result = run_extraction(
                &conversations,
                &selected,
                &options,
                scheduler,
                progress.reporter(),
            )
            .await?;

            if result.dry_run {
                println!("extract {} (dry-run)", options.mode);
            } else {
                println!("extract {}", options.mode);
            }
            println!("  run key: {}", result.run_key);
            println!("  state: {}", result.state_path.display());
            println!("  conversations: {}", result.conversation_count);
            println!("  batches: {}", result.total_batches);
            println!("  skipped: {}", result.skipped_batches);
            if result.dry_run {
                println!(
                    "  pending: {}",
                    result.total_batches - result.skipped_batches
                );
                println!("ok");
                return Ok(());
            }
            println!("  processed: {}", result.processed_batches);
            println!("  failed: {}", result.failed_batches);
            for error in &result.failed_batch_errors {
                println!("    {}", error);
            }
            println!("  files written: {}", result.output_files.len());
            for path in &result.output_files {
                println!("    {}", path.display());
            }
            println!("  memory: {}", result.memory_file_path.display());
            println!("  user: {}", result.user_file_path.display());
            for path in &result.backup_paths {
                println!("  backup: {}", path.display());
            }
            if result.failed_batches > 0 {
                bail!(
                    "{} of {} batches failed; rerun to retry them",
                    result.failed_batches,
                    result.total_batches
                );
            }
            println!("ok");
        }
        Commands::ImportSessions {
            inputs,
            workspace,
            providers,
        } => {
            let selected = selected_providers(providers);
            let workspace = expand_tilde(&workspace);
            let files = load_inputs(&inputs)?;
            let imports = provider_imports(&files, &selected);

            let importer = SessionImporter::new(
                system_runner(&config),
                config.scheduler.command.clone(),
                config.sessions.resolved_state_dir()?,
            );
            let result = importer.import(&workspace, &imports).await?;

            println!("import-sessions");
            println!("  agent: {}", result.agent_id);
            println!("  store: {}", result.session_store_path.display());
            println!("  attempted: {}", result.attempted);
            println!("  imported: {}", result.imported);
            println!("  updated: {}", result.updated);
            println!("  skipped: {}", result.skipped);
            println!("  failed: {}", result.failed);
            for error in &result.errors {
                println!("    {}", error);
            }
            if result.failed > 0 {
                bail!("{} conversations failed to import", result.failed);
            }
            println!("ok");
        }
        Commands::Unpack { archives, out } => {
            let runner = system_runner(&config);
            let discovery = discover_archives(runner.as_ref(), &archives, &expand_tilde(&out)).await?;

            println!("unpack");
            for extracted in &discovery.extracted {
                println!(
                    "  {} -> {}",
                    extracted.archive.display(),
                    extracted.directory.display()
                );
            }
            for warning in &discovery.warnings {
                println!("  warning: {}", warning);
            }
            if discovery.extracted.is_empty() {
                bail!("No archives were unpacked");
            }
            println!("ok");
        }
    }

    Ok(())
}
