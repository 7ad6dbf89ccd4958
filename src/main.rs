//! # Enrichment Harness CLI (`enrich`)
//!
//! ## Usage
//!
//! ```bash
//! enrich --config ./config/enrich.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `enrich init` | Create the SQLite database and run schema migrations |
//! | `enrich serve` | Start the HTTP API |
//! | `enrich run <module\|all>` | Run one enrichment module, or all of them in order |
//! | `enrich health` | Database and inference backend status |
//! | `enrich backends` | List configured backends and the active one |
//! | `enrich ingest <file.jsonl>` | Load documents into the retrieval store |
//! | `enrich ask "<question>"` | Answer a question from stored context |
//!
//! Without `--config`, settings come from defaults plus environment
//! variables (`ENRICH_AI_MODE`, `DEDICATED_AI_URL`, `LOCAL_AI_URL`, ...).

use anyhow::Result;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use enrichment_harness::backend::BackendRegistry;
use enrichment_harness::chat::ChatService;
use enrichment_harness::config::{self, Config};
use enrichment_harness::context::{self, ContextStore, SqliteContextStore};
use enrichment_harness::db;
use enrichment_harness::dispatch::{InferenceDispatcher, TextGenerator};
use enrichment_harness::migrate;
use enrichment_harness::modules::{ModuleKind, MAX_COUNT};
use enrichment_harness::orchestrator::{EnrichmentOrchestrator, RunOptions, RunSettings};
use enrichment_harness::server;

/// Enrichment Harness CLI: AI-assisted record enrichment for a relational
/// store.
#[derive(Parser)]
#[command(
    name = "enrich",
    about = "Enrichment Harness: AI-assisted data enrichment with retrieval grounding",
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
    /// Initialize the database schema.
    ///
    /// Creates the entity tables and the retrieval store. Safe to repeat.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Run an enrichment module, or `all` for every module in order.
    Run {
        /// Module name (`companies`, `deals`, `clinical_trials`, ...) or `all`.
        target: String,

        /// Number of records to request (1-50).
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_COUNT as u64))]
        count: Option<u64>,

        /// Countries to cover (market indicators only). Repeatable.
        #[arg(long = "country")]
        countries: Vec<String>,
    },

    /// Show database and inference backend health.
    Health,

    /// List configured inference backends.
    Backends,

    /// Load documents from a JSON Lines file into the retrieval store.
    Ingest {
        /// File with one `{"id"?, "text", "metadata"?}` object per line.
        path: PathBuf,
    },

    /// Ask a question answered from retrieved context.
    Ask {
        query: String,

        /// Number of context documents to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("enrichment_harness=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Run {
            target,
            count,
            countries,
        } => {
            run_enrichment(&cfg, &target, count.map(|c| c as usize), countries).await?;
        }
        Commands::Health => {
            run_health(&cfg).await?;
        }
        Commands::Backends => {
            list_backends(&cfg)?;
        }
        Commands::Ingest { path } => {
            let docs = context::read_jsonl(&path)?;
            let pool = open_store(&cfg).await?;
            let store =
                SqliteContextStore::new(pool, Duration::from_millis(cfg.retrieval.timeout_ms));
            let summary = store.upsert(&docs).await?;
            println!(
                "Upserted {} of {} documents.",
                summary.accepted_count,
                docs.len()
            );
        }
        Commands::Ask { query, top_k } => {
            run_ask(&cfg, &query, top_k).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> Result<SqlitePool> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    Ok(pool)
}

fn generator(cfg: &Config) -> Result<Arc<dyn TextGenerator>> {
    let registry = BackendRegistry::from_config(&cfg.backends)?;
    Ok(Arc::new(InferenceDispatcher::new(&registry)?))
}

fn context_store(cfg: &Config, pool: &SqlitePool) -> Option<Arc<dyn ContextStore>> {
    if !cfg.retrieval.enabled {
        return None;
    }
    Some(Arc::new(SqliteContextStore::new(
        pool.clone(),
        Duration::from_millis(cfg.retrieval.timeout_ms),
    )))
}

async fn run_enrichment(
    cfg: &Config,
    target: &str,
    count: Option<usize>,
    countries: Vec<String>,
) -> Result<()> {
    let pool = open_store(cfg).await?;
    let orchestrator = EnrichmentOrchestrator::new(
        pool.clone(),
        generator(cfg)?,
        context_store(cfg, &pool),
        RunSettings::from_config(cfg),
    );

    if target == "all" {
        let counts: HashMap<ModuleKind, usize> = match count {
            Some(n) => ModuleKind::ALL.iter().map(|k| (*k, n)).collect(),
            None => HashMap::new(),
        };
        let report = orchestrator.run_all(&counts).await;

        println!("{:<20} {:<8} {:<8} DETAIL", "MODULE", "STATUS", "WRITTEN");
        for outcome in &report.results {
            match &outcome.outcome {
                Ok(batch) => println!(
                    "{:<20} {:<8} {:<8} {} failed",
                    outcome.module.name(),
                    "ok",
                    batch.count(),
                    batch.failures.len()
                ),
                Err(failure) => println!(
                    "{:<20} {:<8} {:<8} {}",
                    outcome.module.name(),
                    if failure.is_warning() { "warning" } else { "failed" },
                    0,
                    failure
                ),
            }
        }
        println!();
        println!("Total updates: {}", report.total_updates());
        return Ok(());
    }

    let kind: ModuleKind = target.parse()?;
    let options = RunOptions { count, countries };
    match orchestrator.run_module(kind, &options).await {
        Ok(batch) => {
            println!("{}", serde_json::to_string_pretty(&batch)?);
            Ok(())
        }
        Err(failure) => {
            if failure.is_warning() {
                eprintln!("Warning: {}", failure);
            } else {
                eprintln!("Error: {}", failure);
            }
            std::process::exit(1);
        }
    }
}

async fn run_health(cfg: &Config) -> Result<()> {
    let database = match db::connect(cfg).await {
        Ok(pool) => match db::ping(&pool).await {
            Ok(()) => "connected".to_string(),
            Err(e) => format!("error: {}", e),
        },
        Err(e) => format!("error: {}", e),
    };
    let generator = generator(cfg)?;
    let info = generator.info();
    let available = generator.health().await;

    println!("database:     {}", database);
    println!("ai_mode:      {}", info.mode);
    println!("ai_endpoint:  {}", info.endpoint);
    if let Some(model) = info.model {
        println!("ai_model:     {}", model);
    }
    println!("ai_available: {}", available);
    Ok(())
}

fn list_backends(cfg: &Config) -> Result<()> {
    let registry = BackendRegistry::from_config(&cfg.backends)?;
    let active = registry.active().name.clone();

    println!("{:<16} {:<8} ENDPOINT", "BACKEND", "ACTIVE");
    for backend in registry.backends() {
        let marker = if backend.name == active { "*" } else { "" };
        println!("{:<16} {:<8} {}", backend.mode.as_str(), marker, backend.endpoint);
    }
    Ok(())
}

async fn run_ask(cfg: &Config, query: &str, top_k: Option<usize>) -> Result<()> {
    let pool = open_store(cfg).await?;
    let chat = ChatService::new(cfg, generator(cfg)?, context_store(cfg, &pool));

    match chat.answer(query, top_k).await {
        Ok(answer) => {
            println!("{}", answer.answer);
            if !answer.sources.is_empty() {
                println!();
                println!("--- Sources ({}) ---", answer.sources.len());
                for doc in &answer.sources {
                    println!("[{:.3}] {}", doc.score, doc.id);
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
