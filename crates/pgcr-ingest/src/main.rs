//! PGCR Ingest - bulk loader for PGCR dumps

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pgcr_common::logging::{init_logging, LogConfig, LogLevel};
use pgcr_ingest::{
    discover, ConfigOverrides, ConsoleObserver, DecodePolicy, FileRegistry, IngestConfig,
    IngestError, LogObserver, MemorySink, PgSink, Pipeline, PipelineSettings, ProgressObserver,
    RunSummary, TransactionSink,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pgcr-ingest")]
#[command(author, version, about = "Load compressed PGCR dumps into PostgreSQL")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = pgcr_ingest::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Root directory to scan for input files
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Number of record workers
    #[arg(short, long)]
    workers: Option<i64>,

    /// Records per committed transaction
    #[arg(short, long)]
    batch_size: Option<i64>,

    /// Log and skip records that fail to decode instead of aborting
    #[arg(long)]
    skip_malformed: bool,

    /// Decode everything but write nowhere
    #[arg(long)]
    dry_run: bool,

    /// Apply database migrations before ingesting
    #[arg(long)]
    migrate: bool,

    /// Draw progress bars instead of logging progress
    #[arg(short, long)]
    progress: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            directory: self.directory.clone(),
            workers: self.workers,
            batch_size: self.batch_size,
            decode_policy: self.skip_malformed.then_some(DecodePolicy::Skip),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to set up SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Signal received, shutting down"),
        _ = terminate => info!(signal = "SIGTERM", "Signal received, shutting down"),
    }
}

async fn execute<S: TransactionSink>(
    sink: S,
    settings: PipelineSettings,
    registry: Arc<FileRegistry>,
    observer: Arc<dyn ProgressObserver>,
    shutdown: &CancellationToken,
) -> pgcr_ingest::Result<RunSummary> {
    Pipeline::new(sink, settings)
        .run(registry, observer, shutdown)
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("pgcr-ingest")
        .filter_directives("sqlx=warn")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::load(&cli.config, &cli.overrides())
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if cli.dry_run {
        config.validate_pipeline()?;
    } else {
        config.validate()?;
    }
    let settings = config.pipeline_settings()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let registry = {
        let directory = config.directory.clone();
        let extension = config.extension.clone();
        tokio::task::spawn_blocking(move || discover(&directory, &extension)).await??
    };
    if registry.is_empty() {
        warn!(
            directory = %config.directory.display(),
            extension = %config.extension,
            "No input files found"
        );
    }
    let registry = Arc::new(registry);

    let console = cli
        .progress
        .then(|| Arc::new(ConsoleObserver::new(registry.len(), config.expected_lines_per_file)));
    let observer: Arc<dyn ProgressObserver> = match &console {
        Some(console) => Arc::clone(console) as Arc<dyn ProgressObserver>,
        None => Arc::new(LogObserver::default()),
    };

    let result = if cli.dry_run {
        if cli.migrate {
            warn!("--migrate has no effect together with --dry-run");
        }
        info!("Dry run, nothing will be written");
        execute(MemorySink::discarding(), settings, registry, observer, &shutdown).await
    } else {
        let sink = PgSink::connect(&config.datasource)
            .await
            .context("Failed to connect to PostgreSQL")?;
        if cli.migrate {
            sink.migrate().await.context("Failed to run migrations")?;
        }
        execute(sink, settings, registry, observer, &shutdown).await
    };

    if let Some(console) = console {
        console.finish();
    }

    match result {
        Ok(summary) => {
            info!(
                files = summary.files,
                lines = summary.lines_read,
                persisted = summary.records_persisted,
                skipped = summary.records_skipped,
                commits = summary.commits,
                elapsed_secs = summary.elapsed.as_secs_f64(),
                "Run summary"
            );
            Ok(())
        }
        Err(IngestError::Cancelled) => {
            anyhow::bail!("Ingestion cancelled, the open batch was rolled back")
        }
        Err(e) => Err(e.into()),
    }
}
