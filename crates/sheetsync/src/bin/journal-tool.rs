//! Inspection and repair utility for the sheetsync delivery journal.
//!
//! # Usage
//!
//! ```bash
//! # Just check if it can be opened
//! journal-tool --path ./data/journal --check
//!
//! # Counts by status
//! journal-tool --path ./data/journal --stats
//!
//! # Ids appended by an interrupted pass and not yet flagged sent
//! journal-tool --path ./data/journal --list-pending
//!
//! # Drop ids, e.g. after deleting their rows from the sheet by hand
//! journal-tool --path ./data/journal --forget 17 --forget s:job-42
//!
//! # Attempt in-place repair
//! journal-tool --path ./data/journal --repair
//! ```
//!
//! Ids are given as integers, or prefixed with `s:` to force a text id.

use anyhow::{Context, Result};
use clap::Parser;
use sheetsync::{DeliveryJournal, RocksJournal, RowId};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "journal-tool")]
#[command(about = "Inspect or repair a sheetsync delivery journal")]
struct Args {
    /// Path to the journal directory
    #[arg(long)]
    path: PathBuf,

    /// Attempt in-place repair using RocksDB's repair function
    #[arg(long)]
    repair: bool,

    /// Just check if the journal can be opened
    #[arg(long)]
    check: bool,

    /// Show entry counts by status
    #[arg(long)]
    stats: bool,

    /// List ids still pending
    #[arg(long)]
    list_pending: bool,

    /// Remove an id from the journal (repeatable)
    #[arg(long, value_parser = parse_id)]
    forget: Vec<RowId>,
}

fn parse_id(raw: &str) -> Result<RowId, String> {
    match raw.strip_prefix("s:") {
        Some(text) if !text.is_empty() => Ok(RowId::Text(text.to_string())),
        Some(_) => Err("empty text id".to_string()),
        None => raw.parse::<RowId>().map_err(|e| e.to_string()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    if args.repair {
        println!("Attempting to repair journal at: {}", args.path.display());
        RocksJournal::repair(&args.path).context("RocksDB repair failed")?;
        println!("✓ Repair completed successfully");
        println!("  Try opening the journal with --check to verify");
    }

    let wants_open = args.check || args.stats || args.list_pending || !args.forget.is_empty();
    if !wants_open {
        if !args.repair {
            println!("No action specified. Use --check, --stats, --list-pending, --forget or --repair");
            println!("Run with --help for usage information");
        }
        return Ok(());
    }

    let journal = RocksJournal::open_existing(&args.path)
        .with_context(|| format!("Failed to open journal at {}", args.path.display()))?;
    println!("✓ Journal opened successfully");

    if args.stats {
        let stats = journal.stats()?;
        println!("  Pending:   {}", stats.pending);
        println!("  Delivered: {}", stats.delivered);
        if stats.invalid > 0 {
            println!("  Invalid:   {}", stats.invalid);
        }
    }

    if args.list_pending {
        let pending = journal.pending()?;
        println!("  {} pending ids", pending.len());
        for id in pending {
            println!("    {id}");
        }
    }

    if !args.forget.is_empty() {
        journal.forget(&args.forget)?;
        journal.flush()?;
        println!("✓ Forgot {} ids", args.forget.len());
    }

    Ok(())
}
