//! Sheetsync daemon.
//!
//! Delivers unsent rows of a MySQL table into a Google Sheets range and flags
//! them as sent once the sheet confirmed them.
//!
//! # Usage
//!
//! ```bash
//! # One pass, settings from .env / SHEETSYNC_* variables
//! sheetsync --spreadsheet https://docs.google.com/spreadsheets/d/<id>/edit --sheet Vagas
//!
//! # Every five minutes with Prometheus metrics on :9091
//! sheetsync --interval-secs 300 --metrics-port 9091
//! ```
//!
//! # Exit Codes (single pass)
//!
//! | code | meaning                                           |
//! |------|---------------------------------------------------|
//! | 0    | written, recovered, nothing new or nothing to do  |
//! | 1    | any other error                                   |
//! | 2    | the database or the sheet could not be reached    |
//! | 3    | partial write: some rows left unsent              |
//! | 4    | the sheet confirmed none of the appended rows     |

use anyhow::{Context, Result};
use clap::Parser;
use sheetsync::engine::is_transient;
use sheetsync::{SinkConfig, SourceConfig, SyncConfig, SyncEngine, SyncOutcome, Trailer};
use sheetsync_core::metrics::{init_metrics, start_metrics_server};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Sheetsync: deliver unsent table rows to a spreadsheet exactly once.
#[derive(Parser, Debug)]
#[command(name = "sheetsync")]
#[command(about = "Deliver unsent database rows into a Google Sheets range")]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "SHEETSYNC_DOTENV", default_value = ".env")]
    dotenv: PathBuf,

    /// MySQL host
    #[arg(long, env = "SHEETSYNC_DB_HOST", default_value = "localhost")]
    db_host: String,

    /// MySQL port
    #[arg(long, env = "SHEETSYNC_DB_PORT", default_value = "3306")]
    db_port: u16,

    /// MySQL user
    #[arg(long, env = "SHEETSYNC_DB_USER", default_value = "")]
    db_user: String,

    /// MySQL password
    #[arg(long, env = "SHEETSYNC_DB_PASSWORD", default_value = "", hide_env_values = true)]
    db_password: String,

    /// MySQL database name
    #[arg(long, env = "SHEETSYNC_DB_NAME")]
    db_name: Option<String>,

    /// Table holding the rows to deliver
    #[arg(long, env = "SHEETSYNC_TABLE", default_value = "vagas")]
    table: String,

    /// Identifier column
    #[arg(long, env = "SHEETSYNC_ID_COLUMN", default_value = "id")]
    id_column: String,

    /// Descriptive columns, in sheet order (comma-separated)
    #[arg(
        long,
        env = "SHEETSYNC_COLUMNS",
        value_delimiter = ',',
        default_value = "nome,idade,cidade"
    )]
    columns: Vec<String>,

    /// Sent flag column
    #[arg(long, env = "SHEETSYNC_SENT_COLUMN", default_value = "escrito")]
    sent_column: String,

    /// Spreadsheet URL or id
    #[arg(long, env = "SHEETSYNC_SPREADSHEET")]
    spreadsheet: Option<String>,

    /// Sheet (tab) name
    #[arg(long, env = "SHEETSYNC_SHEET")]
    sheet: Option<String>,

    /// Column span inside the sheet
    #[arg(long, env = "SHEETSYNC_RANGE", default_value = "A:Z")]
    range: String,

    /// Credentials file (access token or authorized-user JSON)
    #[arg(long, env = "SHEETSYNC_CREDENTIALS", default_value = "credentials.json")]
    credentials: PathBuf,

    /// Sheets API base URL
    #[arg(long, env = "SHEETSYNC_SHEETS_API", default_value = sheetsync::config::DEFAULT_SHEETS_API)]
    sheets_api: String,

    /// Delivery journal directory
    #[arg(long, env = "SHEETSYNC_JOURNAL", default_value = "./data/journal")]
    journal_path: PathBuf,

    /// Trailer cell: "timestamp" or any fixed text
    #[arg(long, env = "SHEETSYNC_TRAILER", default_value = "timestamp")]
    trailer: Trailer,

    /// Seconds between passes (0 runs a single pass)
    #[arg(long, env = "SHEETSYNC_INTERVAL_SECS", default_value = "0")]
    interval_secs: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "SHEETSYNC_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

impl Args {
    fn to_config(&self) -> Result<SyncConfig> {
        let database = self
            .db_name
            .clone()
            .context("database name is required (--db-name or SHEETSYNC_DB_NAME)")?;
        let spreadsheet = self
            .spreadsheet
            .as_deref()
            .context("spreadsheet is required (--spreadsheet or SHEETSYNC_SPREADSHEET)")?;
        let sheet = self
            .sheet
            .as_deref()
            .context("sheet name is required (--sheet or SHEETSYNC_SHEET)")?;

        let source = SourceConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            database,
            table: self.table.clone(),
            id_column: self.id_column.clone(),
            columns: self.columns.clone(),
            sent_column: self.sent_column.clone(),
            ..Default::default()
        };

        let mut sink = SinkConfig::new(spreadsheet, sheet)?;
        sink.columns_range = self.range.clone();
        sink.credentials_path = self.credentials.clone();
        sink.api_base = self.sheets_api.clone();

        let config = SyncConfig {
            source,
            sink,
            journal_path: self.journal_path.clone(),
            trailer: self.trailer.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Process exit code for a finished single pass.
fn exit_code(outcome: &SyncOutcome) -> u8 {
    match outcome {
        SyncOutcome::NothingToDo
        | SyncOutcome::NothingNew { .. }
        | SyncOutcome::Recovered { .. }
        | SyncOutcome::Written { .. } => 0,
        SyncOutcome::PartialWrite { .. } => 3,
        SyncOutcome::NothingWritten { .. } => 4,
    }
}

/// Process exit code for a failed run.
fn error_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<sheetsync::Error>() {
        Some(e) if e.is_connection() => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse once to find the .env file, then again so its values apply.
    let mut args = Args::parse();
    let dotenv_loaded = args.dotenv.exists();
    if dotenv_loaded {
        if let Err(e) = dotenvy::from_path(&args.dotenv) {
            eprintln!("Failed to load {}: {e}", args.dotenv.display());
            return ExitCode::from(1);
        }
        args = Args::parse();
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sheetsync=debug")),
        )
        .init();

    if dotenv_loaded {
        tracing::info!("Loaded environment from {}", args.dotenv.display());
    }

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(error_code(&e))
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    tracing::info!("Sheetsync starting...");

    let config = args.to_config().context("Invalid configuration")?;
    tracing::info!("Configuration:");
    tracing::info!(
        "  Source: {}:{}/{} table {}",
        config.source.host,
        config.source.port,
        config.source.database,
        config.source.table
    );
    tracing::info!(
        "  Sheet: {} range {}",
        config.sink.spreadsheet_id,
        config.sink.range()
    );
    tracing::info!("  Journal: {}", config.journal_path.display());

    if args.metrics_port > 0 {
        match init_metrics() {
            Some(handle) => start_metrics_server(args.metrics_port, handle)
                .await
                .context("Failed to start metrics server")?,
            None => tracing::warn!("Metrics recorder already installed"),
        }
    }

    let engine = SyncEngine::connect(&config).await?;

    let code = if args.interval_secs == 0 {
        let outcome = engine.run_pass().await?;
        println!("{outcome}");
        exit_code(&outcome)
    } else {
        run_periodic(&engine, Duration::from_secs(args.interval_secs)).await?
    };

    engine.journal().flush()?;
    engine.source().close().await;
    Ok(code)
}

/// Run passes back to back, `interval` apart, until Ctrl+C.
///
/// Transient failures are logged and retried on the next pass; anything else
/// stops the loop.
async fn run_periodic(
    engine: &SyncEngine<sheetsync::MySqlSource, sheetsync::SheetsSink, sheetsync::RocksJournal>,
    interval: Duration,
) -> Result<u8> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping after the current pass...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    tracing::info!("Running a pass every {}s", interval.as_secs());
    let mut passes = 0u64;

    while running.load(Ordering::SeqCst) {
        passes += 1;
        match engine.run_pass().await {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {
                tracing::warn!("Pass {} failed, retrying next interval: {}", passes, e);
            }
            Err(e) => return Err(e.into()),
        }

        let deadline = tokio::time::Instant::now() + interval;
        while running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    tracing::info!("Stopped after {} passes", passes);
    Ok(0)
}
