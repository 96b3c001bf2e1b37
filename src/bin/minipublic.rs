#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use minipublic_harness::config::HarnessConfig;
use minipublic_harness::gateway::registry::ProviderRegistry;
use minipublic_harness::gateway::{CsvRequestLog, GatewayConfig};
use minipublic_harness::models::ModelCatalog;
use minipublic_harness::orchestrator::{CompletionOrchestrator, RunConfig, RunContext};
use minipublic_harness::progress::ProgressTracker;
use minipublic_harness::store::{OutputLayout, OutputStore, RunLock};
use minipublic_harness::survey::{is_runnable, JsonSurveyDirectory, SurveySource};

#[derive(Parser)]
#[command(
    name = "minipublic",
    version,
    about = "Collect LLM judgments for deliberative mini-public surveys"
)]
struct Cli {
    /// Root of the output tables and logs
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Model catalog CSV (provider,model,api)
    #[arg(long, global = true)]
    models: Option<PathBuf>,
    /// Directory of survey JSON files
    #[arg(long, global = true)]
    surveys: Option<PathBuf>,
    /// Target completions per provider/model/survey
    #[arg(long, global = true)]
    min_iterations: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run completions for one catalog model
    Generate {
        /// Model name as listed in the catalog
        model: String,
        /// Completions to attempt per survey
        iterations: u32,
        /// Only run this survey
        #[arg(long)]
        survey: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        /// Skip the one-line rationale turn
        #[arg(long)]
        no_reasoning: bool,
        /// Seed for the presentation order shuffles
        #[arg(long)]
        seed: Option<u64>,
        /// Pause after each completion
        #[arg(long)]
        cooldown_ms: Option<u64>,
        /// File whose contents are sent as the system message
        #[arg(long)]
        system_prompt_file: Option<PathBuf>,
    },
    /// Rebuild the progress ledger from the output tables
    Reconstruct,
    /// Show progress from the ledger
    Status {
        /// Include entries that are already done
        #[arg(long)]
        all: bool,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runnable_surveys(source: &dyn SurveySource) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    Ok(source
        .names()?
        .into_iter()
        .filter(|name| is_runnable(name))
        .collect())
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = HarnessConfig::from_env()?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(path) = cli.models {
        config.models_path = path;
    }
    if let Some(dir) = cli.surveys {
        config.surveys_dir = dir;
    }
    if let Some(n) = cli.min_iterations {
        config.min_iterations = n;
    }

    let layout = OutputLayout::new(&config.output_dir);
    let source = JsonSurveyDirectory::new(&config.surveys_dir);

    match cli.command {
        Commands::Generate {
            model,
            iterations,
            survey,
            temperature,
            no_reasoning,
            seed,
            cooldown_ms,
            system_prompt_file,
        } => {
            if let Some(seed) = seed {
                config.seed = seed;
            }
            if let Some(ms) = cooldown_ms {
                config.cooldown = Duration::from_millis(ms);
            }
            let system_prompt = match system_prompt_file {
                Some(path) => Some(std::fs::read_to_string(path)?),
                None => None,
            };

            let catalog = ModelCatalog::load(&config.models_path)?;
            let entry = catalog.find(&model)?.clone();
            let spec = entry.spec()?;

            let _lock = RunLock::acquire(&layout)?;
            let surveys = runnable_surveys(&source)?;
            // Tables are the source of truth; an existing ledger may lag them.
            let tracker =
                ProgressTracker::reconstruct(&layout, catalog.entries(), &surveys, config.min_iterations)?;

            let usage_sink = Arc::new(CsvRequestLog::new(layout.request_log_path()));
            let gateway_config = GatewayConfig {
                max_retries: config.max_retries,
                request_timeout: config.http_timeout,
                ..GatewayConfig::default()
            };
            let registry = ProviderRegistry::from_env(usage_sink, gateway_config)?;
            let gateway = registry.resolve(&entry.api)?;

            let run_config = RunConfig {
                temperature,
                reasoning_turn: !no_reasoning,
                cooldown: config.cooldown,
                system_prompt,
                ..RunConfig::default()
            };
            let orchestrator = CompletionOrchestrator::new(
                gateway,
                OutputStore::new(layout.clone()),
                entry,
                spec,
                run_config,
            );
            let mut ctx = RunContext::new(tracker, config.seed);

            let summary = orchestrator
                .run_batch(&mut ctx, &source, survey.as_deref(), iterations)
                .await?;
            println!("{summary}");
            summary.append_to(&layout.exec_log_path())?;
        }
        Commands::Reconstruct => {
            let catalog = ModelCatalog::load(&config.models_path)?;
            let surveys = runnable_surveys(&source)?;
            let tracker =
                ProgressTracker::reconstruct(&layout, catalog.entries(), &surveys, config.min_iterations)?;
            let report = tracker.report();
            info!(path = %tracker.path().display(), "ledger written");
            println!(
                "{} entries, {} done, {} pending, {} completions recorded",
                report.entries,
                report.done,
                report.entries - report.done,
                report.completions
            );
            println!("Models with data: {}", list_or_none(&report.models_with_data));
            println!("Models done: {}", list_or_none(&report.models_done));
            println!("APIs without data: {}", list_or_none(&report.apis_without_data));
        }
        Commands::Status { all } => {
            let path = layout.progress_path();
            if !path.exists() {
                return Err(format!(
                    "no progress ledger at {}; run `minipublic reconstruct` first",
                    path.display()
                )
                .into());
            }
            let tracker = ProgressTracker::load(path, config.min_iterations)?;
            let rows: Vec<_> = if all {
                tracker.entries().collect()
            } else {
                tracker.pending().collect()
            };
            for e in &rows {
                println!(
                    "{}/{}/{}: {}/{} ({} left){}",
                    e.provider,
                    e.model,
                    e.survey,
                    e.completions,
                    e.min_iterations,
                    e.completions_left.max(0),
                    if e.done { " done" } else { "" }
                );
            }
            println!("{} of {} entries pending", tracker.pending().count(), tracker.entries().count());
        }
    }

    Ok(())
}
