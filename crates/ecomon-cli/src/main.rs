use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ecomon_adapters::{FeatureSource, FileFeatureSource};
use ecomon_core::DatasetKind;
use ecomon_sync::{
    build_scheduler, MemoryEndpoint, PersistenceEndpoint, PgEndpoint, SyncConfig, SyncPipeline,
    SyncRunSummary,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ecomon")]
#[command(about = "Mirror Black Sea monitoring datasets from the GIS API into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled dataset once (default).
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Run the sync on ECOMON_SYNC_CRON until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Exit non-zero when any dataset was aborted.
    #[arg(long)]
    strict: bool,
    /// Reconcile into an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    /// Sync a single dataset.
    #[arg(long, value_name = "KIND")]
    only: Option<DatasetKind>,
    /// Read `<dir>/<kind>.geojson` instead of calling the API.
    #[arg(long, value_name = "DIR")]
    source_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            if let Some(kind) = args.only {
                config.datasets.restrict_to(kind);
            }
            let pipeline = build_pipeline(&config, &args)?;
            let summary = pipeline.run_once().await;
            print_summary(&summary);
            if args.strict && !summary.all_succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            PgEndpoint::connect_lazy(&config.database)?
                .migrate()
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(ecomon_sync::pipeline_from_config(&config)?);
            let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            info!("interrupt received; stopping scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// `RUST_LOG` when it parses, `info` otherwise.
fn log_filter(rust_log: Option<String>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn build_pipeline(config: &SyncConfig, args: &SyncArgs) -> Result<SyncPipeline> {
    let source: Arc<dyn FeatureSource> = match &args.source_dir {
        Some(dir) => Arc::new(FileFeatureSource::new(dir.clone())),
        None => Arc::new(SyncPipeline::http_source(config)?),
    };
    let endpoint: Arc<dyn PersistenceEndpoint> = if args.dry_run {
        Arc::new(MemoryEndpoint::new())
    } else {
        Arc::new(PgEndpoint::connect_lazy(&config.database)?)
    };
    Ok(SyncPipeline::new(config, source, endpoint))
}

fn print_summary(summary: &SyncRunSummary) {
    for report in &summary.datasets {
        println!("{}", report.summary_line());
    }
    println!(
        "sync complete: run_id={} processed={} failed={}",
        summary.run_id,
        summary.total_processed(),
        summary.failed_count()
    );
}
