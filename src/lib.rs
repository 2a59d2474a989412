//! Shelfwise: store-equivalence clustering and adaptive scrape scheduling.
//!
//! Retail chains price many of their physical stores identically. Shelfwise groups
//! such stores, scrapes one representative per group on a regular cadence, spends a
//! small share of capacity exploring other groups and ungrouped stores, and watches
//! representatives for price divergence so a stale grouping corrects itself.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All registry mutations route through `DbBroker` for:
//! - Serialization (per-database writer lock, busy retry with backoff)
//! - One IMMEDIATE transaction per operation
//! - Audit logging (`registry.events.jsonl`)
//!
//! ## Subsystems
//!
//! - `registry`: groups, memberships, representatives, candidates
//! - `geo`: DBSCAN over great-circle distance
//! - `correlation`: bit-identical price agreement, union-find components
//! - `scheduler`: time-boxed leases handed out by priority
//! - `divergence`: representative validation and promotion
//! - `ingest`: JSON Lines feed loaders
//!
//! # Examples
//!
//! ```bash
//! shelfwise init
//! shelfwise ingest stores --file stores.jsonl
//! shelfwise rebuild geo --chain acme
//! shelfwise schedule next --chain acme
//! shelfwise schedule complete --store 42 --token 01J...
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: persistence, configuration, logging, errors, the store record
//! - [`plugins`]: clustering, registry, scheduling and monitoring

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{Cli, Command, RebuildCommand};
use crate::core::config::Config;
use crate::core::error::ShelfwiseError;
use crate::core::output::OutputFormat;
use crate::core::{db, logging, schemas, time};
use crate::plugins::{correlation, geo, ingest, registry, scheduler};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the data root when `--root` is absent.
pub const HOME_ENV: &str = "SHELFWISE_HOME";
const DEFAULT_ROOT: &str = ".shelfwise";

/// `--root`, else `$SHELFWISE_HOME`, else `./.shelfwise`.
pub fn resolve_root(flag: Option<PathBuf>) -> Result<PathBuf, ShelfwiseError> {
    if let Some(root) = flag {
        return Ok(root);
    }
    match std::env::var(HOME_ENV) {
        Ok(v) if !v.trim().is_empty() => Ok(PathBuf::from(v)),
        Ok(_) | Err(std::env::VarError::NotPresent) => {
            Ok(std::env::current_dir()?.join(DEFAULT_ROOT))
        }
        Err(e) => Err(e.into()),
    }
}

/// Create the data root, the registry and a commented default config.
pub fn init_root(root: &Path) -> Result<bool, ShelfwiseError> {
    db::initialize_registry_db(root)?;
    let config_path = root.join(schemas::CONFIG_FILE_NAME);
    if config_path.exists() {
        return Ok(false);
    }
    let body = toml::to_string_pretty(&Config::default())
        .map_err(|e| ShelfwiseError::ConfigError(e.to_string()))?;
    fs::write(
        &config_path,
        format!("# shelfwise configuration; every key is optional.\n\n{}", body),
    )?;
    Ok(true)
}

pub fn run() -> Result<(), ShelfwiseError> {
    logging::init();
    let cli = Cli::parse();
    let root = resolve_root(cli.root)?;
    let format = cli.format;

    if let Command::Init = cli.command {
        let created_config = init_root(&root)?;
        tracing::info!(root = %root.display(), "data root initialized");
        println!(
            "{}",
            time::command_envelope(
                "init",
                "ok",
                serde_json::json!({
                    "root": root.display().to_string(),
                    "config_created": created_config,
                })
            )
        );
        return Ok(());
    }

    let config = Config::load(&root)?;
    match cli.command {
        Command::Init => Ok(()),
        Command::Ingest(c) => ingest::run_ingest_cli(&root, c),
        Command::Schedule(c) => scheduler::run_schedule_cli(&root, &config, format, c),
        Command::Groups(c) => registry::run_groups_cli(&root, format, c),
        Command::Stores(c) => ingest::run_stores_cli(&root, format, c),
        Command::Rebuild(r) => run_rebuild(&root, &config, format, r.command),
        Command::Correlate(c) => {
            let registry = registry::Registry::open(&root)?;
            let report = correlation::plan_chain(&registry, &c.chain, &config.correlation)?;
            print_report("correlate", format, serde_json::to_value(&report)?);
            Ok(())
        }
        Command::Schema => {
            let all = serde_json::json!({
                "broker": crate::core::broker::schema(),
                "groups": registry::schema(),
                "ingest": ingest::schema(),
                "schedule": scheduler::schema(),
            });
            println!("{}", serde_json::to_string_pretty(&all)?);
            Ok(())
        }
    }
}

fn run_rebuild(
    root: &Path,
    config: &Config,
    format: OutputFormat,
    command: RebuildCommand,
) -> Result<(), ShelfwiseError> {
    let registry = registry::Registry::open(root)?;
    let (cmd, value) = match command {
        RebuildCommand::Geo { chain } => {
            let (plan, summary) = geo::rebuild_chain(&registry, &chain, &config.geo)?;
            (
                "rebuild.geo",
                serde_json::json!({ "plan": plan, "summary": summary }),
            )
        }
        RebuildCommand::Correlation { chain } => {
            let (report, summary) =
                correlation::rebuild_chain(&registry, &chain, &config.correlation)?;
            (
                "rebuild.correlation",
                serde_json::json!({ "report": report, "summary": summary }),
            )
        }
    };
    print_report(cmd, format, value);
    Ok(())
}

fn print_report(cmd: &str, format: OutputFormat, value: serde_json::Value) {
    match format {
        OutputFormat::Json => println!("{}", time::command_envelope(cmd, "ok", value)),
        OutputFormat::Text => match serde_json::to_string_pretty(&value) {
            Ok(body) => println!("{}\n{}", cmd, body),
            Err(_) => println!("{} {}", cmd, value),
        },
    }
}
