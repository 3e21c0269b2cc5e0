//! # Rim Weighting CLI
//!
//! Validates weighting requests, runs them against the configured weight
//! store and writes import templates.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration::{Migrator, MigratorTrait};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use rim_weighting::{
    config::ConfigLoader,
    db,
    repositories::ResponseWeightRepository,
    telemetry,
    weighting::{
        WeightImport, WeightingRunOrchestrator, WeightingRunRequest, Workbook,
        orchestrator::{ImportSource, preflight},
    },
};

#[derive(Debug, Parser)]
#[command(name = "rim-weighting", version, about = "Rim weighting of survey respondents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending weight store migrations
    Migrate,
    /// Check a run request's strategy without weighting
    Validate {
        #[arg(long)]
        request: PathBuf,
    },
    /// Weight a request and persist the result
    Run {
        #[arg(long)]
        request: PathBuf,
        /// CSV file of imported weights (ResponseId, Weight)
        #[arg(long)]
        import: Option<PathBuf>,
        /// Fail the run when the import cannot be read
        #[arg(long, requires = "import")]
        require_import: bool,
        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Write an empty import template
    Template {
        #[arg(long)]
        output: PathBuf,
    },
}

fn read_request(path: &Path) -> Result<WeightingRunRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading request {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing request {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, profile = %config.profile, "Loaded configuration");
    }

    match cli.command {
        Command::Migrate => {
            let db = db::init_pool(&config).await?;
            Migrator::up(&db, None).await.context("applying migrations")?;
            tracing::info!("Migrations applied");
        }
        Command::Validate { request } => {
            let request = read_request(&request)?;
            let checked = preflight(&request.strategy, &config.weighting)?;
            let summary = json!({
                "valid": true,
                "groups": checked.groups.iter().map(|g| &g.name).collect::<Vec<_>>(),
                "warnings": checked.warnings,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Run {
            request,
            import,
            require_import,
            timeout_secs,
        } => {
            let request = read_request(&request)?;
            let import = match import.map(|path| Workbook::from_csv_path(&path)) {
                Some(Ok(workbook)) => Some(WeightImport {
                    source: ImportSource::Workbook(workbook),
                    required: require_import,
                }),
                Some(Err(err)) if require_import => return Err(err.into()),
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "Import file unreadable, weighting without it");
                    None
                }
                None => None,
            };

            let db = db::init_pool_and_migrate(&config).await?;
            let store = Arc::new(ResponseWeightRepository::new(Arc::new(db)));
            let orchestrator = WeightingRunOrchestrator::new(store, config.clone());

            let cancel = CancellationToken::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let deadline = async {
                        match timeout_secs {
                            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted, cancelling run"),
                        _ = deadline => tracing::warn!("Timeout reached, cancelling run"),
                        _ = cancel.cancelled() => return,
                    }
                    cancel.cancel();
                })
            };

            let result = orchestrator.run(request, import, cancel.clone()).await;
            cancel.cancel();
            let _ = watcher.await;

            let report = result?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Template { output } => {
            let file = std::fs::File::create(&output)
                .with_context(|| format!("creating {}", output.display()))?;
            Workbook::template()
                .write_csv(file)
                .with_context(|| format!("writing {}", output.display()))?;
        }
    }

    Ok(())
}
