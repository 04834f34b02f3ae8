//! `automation-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`        — start the engine and its HTTP surface.
//! - `migrate`      — run pending database migrations.
//! - `validate`     — check automation definitions without starting anything.
//! - `cron-preview` — list the next fire times of a cron expression.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::schedule::CronSchedule;
use engine::{
    ActionDispatcher, AutomationSource, Engine, EngineConfig, EngineParts, FileSource,
    IdempotencyStore, InMemoryIdempotencyStore, InMemoryRunLedger, PgIdempotencyStore,
    PgRunLedger, PgSource, RunLedger, TriggerRegistry, VerifierSet,
};
use nodes::memory::{InMemoryConnectionStore, InMemoryRecordStore};
use nodes::RecordStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "automation-engine",
    about = "Trigger-driven automation engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the engine and serve automation paths and the admin API.
    Serve {
        #[arg(long, env = "AUTOMATION_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        /// Postgres URL; without it every store is in memory.
        #[arg(long, env = "DATABASE_URL")]
        database_url: Option<String>,
        #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
        max_connections: u32,
        /// Automation definitions: a JSON file or a directory of them.
        /// Defaults to the `automations` table when a database is configured.
        #[arg(long, env = "AUTOMATION_DEFINITIONS")]
        automations: Option<PathBuf>,
        /// JSON file mapping connection ids to credentials.
        #[arg(long, env = "AUTOMATION_CONNECTIONS")]
        connections: Option<PathBuf>,
        /// JSON file with engine tunables; missing keys keep their defaults.
        #[arg(long, env = "AUTOMATION_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate automation definitions.
    Validate {
        /// A JSON file or a directory of them.
        path: PathBuf,
    },
    /// Print the next fire times of a 5-field cron expression.
    CronPreview {
        expression: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            database_url,
            max_connections,
            automations,
            connections,
            config,
        } => {
            serve(ServeOptions {
                bind,
                database_url,
                max_connections,
                automations,
                connections,
                config,
            })
            .await
        }
        Command::Migrate { database_url } => {
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Validate { path } => validate(&path).await,
        Command::CronPreview {
            expression,
            timezone,
            count,
        } => {
            let schedule = CronSchedule::parse(&expression, &timezone).map_err(anyhow::Error::msg)?;
            for at in schedule.upcoming(chrono::Utc::now(), count) {
                println!(
                    "{}  ({})",
                    at.to_rfc3339(),
                    at.with_timezone(&schedule.timezone()).to_rfc3339()
                );
            }
            Ok(())
        }
    }
}

struct ServeOptions {
    bind: SocketAddr,
    database_url: Option<String>,
    max_connections: u32,
    automations: Option<PathBuf>,
    connections: Option<PathBuf>,
    config: Option<PathBuf>,
}

async fn serve(options: ServeOptions) -> Result<()> {
    let config = match &options.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&content)
                .with_context(|| format!("invalid engine config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    let connections = match &options.connections {
        Some(path) => InMemoryConnectionStore::from_file(path)?,
        None => InMemoryConnectionStore::new(),
    };

    let (source, ledger, idempotency, records): (
        Arc<dyn AutomationSource>,
        Arc<dyn RunLedger>,
        Arc<dyn IdempotencyStore>,
        Arc<dyn RecordStore>,
    ) = match &options.database_url {
        Some(url) => {
            let pool = db::pool::create_pool(url, options.max_connections)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            let source: Arc<dyn AutomationSource> = match &options.automations {
                Some(path) => Arc::new(FileSource::new(path)),
                None => Arc::new(PgSource::new(pool.clone())),
            };
            (
                source,
                Arc::new(PgRunLedger::new(pool.clone())),
                Arc::new(PgIdempotencyStore::new(pool.clone())),
                Arc::new(db::PgRecordStore::new(pool)),
            )
        }
        None => {
            let Some(path) = &options.automations else {
                bail!("either --automations or --database-url is required");
            };
            warn!("no database configured, runs and idempotency keys are kept in memory");
            (
                Arc::new(FileSource::new(path)),
                Arc::new(InMemoryRunLedger::new()),
                Arc::new(InMemoryIdempotencyStore::new()),
                Arc::new(InMemoryRecordStore::new()),
            )
        }
    };

    let dispatcher = ActionDispatcher::builder()
        .with_builtins(reqwest::Client::new(), records.clone())
        .connections(Arc::new(connections))
        .build();

    let engine = Engine::start(EngineParts {
        config,
        source,
        dispatcher,
        ledger,
        idempotency,
        records: Some(records),
        verifiers: VerifierSet::default(),
    })
    .await?;

    info!(bind = %options.bind, "starting http server");
    api::serve(
        options.bind,
        api::AppState {
            engine: engine.clone(),
        },
        shutdown_signal(),
    )
    .await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn validate(path: &Path) -> Result<()> {
    let automations = FileSource::new(path).load().await?;
    let registry = TriggerRegistry::build(automations, &VerifierSet::default())?;

    let mut automations = registry.automations();
    automations.sort_by(|a, b| a.id.cmp(&b.id));
    for automation in &automations {
        println!(
            "{:<32} {:<24} {} action(s)",
            automation.id,
            automation.trigger.kind(),
            automation.actions.len()
        );
    }
    println!("{} automation(s) valid", registry.len());
    Ok(())
}
