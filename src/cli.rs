//! CLI struct definitions for the `shelfwise` binary.
//!
//! All clap-derived top-level types live here. Each subsystem owns its own
//! `*Cli` and `run_*_cli`; dispatch lives in `lib.rs`.

use crate::core::output::OutputFormat;
use crate::plugins::{ingest, registry, scheduler};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "shelfwise",
    version = env!("CARGO_PKG_VERSION"),
    about = "Store-equivalence clustering and adaptive scrape scheduling for retail price collection."
)]
pub(crate) struct Cli {
    /// Data root holding registry.db, the audit log and shelfwise.toml.
    /// Defaults to $SHELFWISE_HOME, then ./.shelfwise.
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct RebuildCli {
    #[clap(subcommand)]
    pub command: RebuildCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum RebuildCommand {
    /// Replace a chain's groups with a DBSCAN clustering of store coordinates.
    Geo {
        #[clap(long)]
        chain: String,
    },
    /// Replace a chain's groups with price-identity components.
    Correlation {
        #[clap(long)]
        chain: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct CorrelateCli {
    /// Chain to analyse; nothing is written.
    #[clap(long)]
    pub chain: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the data root, registry database and a default config file
    #[clap(name = "init")]
    Init,

    /// Load store and price feeds
    #[clap(name = "ingest")]
    Ingest(ingest::IngestCli),

    /// Lease stores for scraping and report outcomes
    #[clap(name = "schedule", visible_alias = "s")]
    Schedule(scheduler::ScheduleCli),

    /// Inspect and administer equivalence groups
    #[clap(name = "groups", visible_alias = "g")]
    Groups(registry::GroupsCli),

    /// Inspect store records
    #[clap(name = "stores")]
    Stores(ingest::StoresCli),

    /// Regroup a chain
    #[clap(name = "rebuild")]
    Rebuild(RebuildCli),

    /// Dry-run the correlation pass for a chain
    #[clap(name = "correlate")]
    Correlate(CorrelateCli),

    /// Print the command schemas as JSON
    #[clap(name = "schema")]
    Schema,
}
