//! JSON Lines loaders for the store attribute feed and the price feed.
//!
//! Malformed lines are skipped with a warning and counted; they never abort the
//! batch. Scheduler-owned columns are never written from here.

use crate::core::error::ShelfwiseError;
use crate::core::output::{self, OutputFormat};
use crate::core::time;
use crate::plugins::registry::{IngestSummary, PriceObservation, Registry, StoreRecord};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Parse one record per non-empty line. Returns the parsed records and the number
/// of lines that failed to parse.
pub fn read_jsonl<T, R>(reader: R, source: &str) -> Result<(Vec<T>, usize), ShelfwiseError>
where
    T: DeserializeOwned,
    R: BufRead,
{
    let mut records = Vec::new();
    let mut bad = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<T>(trimmed) {
            Ok(rec) => records.push(rec),
            Err(e) => {
                tracing::warn!(source, line = lineno + 1, error = %e, "malformed record skipped");
                bad += 1;
            }
        }
    }
    Ok((records, bad))
}

fn open(path: &Path) -> Result<BufReader<File>, ShelfwiseError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ShelfwiseError::IoError(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })
}

pub fn ingest_stores(registry: &Registry, path: &Path) -> Result<IngestSummary, ShelfwiseError> {
    let (records, bad) = read_jsonl::<StoreRecord, _>(open(path)?, &path.display().to_string())?;
    let mut summary = registry.upsert_stores(&records)?;
    summary.skipped += bad;
    tracing::info!(
        file = %path.display(),
        accepted = summary.accepted,
        skipped = summary.skipped,
        "store records ingested"
    );
    Ok(summary)
}

pub fn ingest_prices(registry: &Registry, path: &Path) -> Result<IngestSummary, ShelfwiseError> {
    let (records, bad) =
        read_jsonl::<PriceObservation, _>(open(path)?, &path.display().to_string())?;
    let mut summary = registry.record_prices(&records)?;
    summary.skipped += bad;
    tracing::info!(
        file = %path.display(),
        accepted = summary.accepted,
        skipped = summary.skipped,
        "price observations ingested"
    );
    Ok(summary)
}

#[derive(Parser, Debug)]
#[clap(name = "ingest", about = "Load feed files into the registry.")]
pub struct IngestCli {
    #[clap(subcommand)]
    pub command: IngestCommand,
}

#[derive(Subcommand, Debug)]
pub enum IngestCommand {
    /// Upsert store attribute records (one JSON object per line).
    Stores {
        #[clap(long)]
        file: PathBuf,
    },
    /// Record price observations (one JSON object per line).
    Prices {
        #[clap(long)]
        file: PathBuf,
    },
}

pub fn run_ingest_cli(root: &Path, cli: IngestCli) -> Result<(), ShelfwiseError> {
    let registry = Registry::open(root)?;
    let (cmd, summary) = match cli.command {
        IngestCommand::Stores { file } => ("ingest.stores", ingest_stores(&registry, &file)?),
        IngestCommand::Prices { file } => ("ingest.prices", ingest_prices(&registry, &file)?),
    };
    println!(
        "{}",
        time::command_envelope(cmd, "ok", serde_json::to_value(&summary)?)
    );
    Ok(())
}

#[derive(Parser, Debug)]
#[clap(name = "stores", about = "Inspect store records.")]
pub struct StoresCli {
    #[clap(subcommand)]
    pub command: StoresCommand,
}

#[derive(Subcommand, Debug)]
pub enum StoresCommand {
    /// List a chain's stores with their scrape bookkeeping.
    List {
        #[clap(long)]
        chain: String,
    },
}

pub fn run_stores_cli(
    root: &Path,
    format: OutputFormat,
    cli: StoresCli,
) -> Result<(), ShelfwiseError> {
    let registry = Registry::open(root)?;
    match cli.command {
        StoresCommand::List { chain } => {
            let stores = registry.list_stores(&chain)?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    time::command_envelope(
                        "stores.list",
                        "ok",
                        serde_json::json!({ "chain": chain, "stores": stores })
                    )
                ),
                OutputFormat::Text => {
                    let now = time::now_epoch();
                    if stores.is_empty() {
                        println!("No stores for chain '{}'.", chain);
                    }
                    for s in stores {
                        let id = if s.active {
                            s.id.to_string().normal()
                        } else {
                            s.id.to_string().dimmed()
                        };
                        println!(
                            "{:>8} {:<12} {:<10}{}",
                            id,
                            if s.division.is_empty() { "-" } else { s.division.as_str() },
                            output::age(s.last_scraped, now),
                            if s.needs_rescraping {
                                " flagged".yellow().to_string()
                            } else {
                                String::new()
                            }
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "ingest",
        "version": "0.1.0",
        "description": "JSON Lines loaders for store attributes and price observations",
        "commands": [
            { "name": "stores", "parameters": ["file"] },
            { "name": "prices", "parameters": ["file"] }
        ],
        "storage": ["registry.db"]
    })
}
