//! Command line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Rucket gateway: cluster bootstrap and primary coordination.
#[derive(Parser)]
#[command(name = "rucket-gateway")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a gateway node.
    Start(StartArgs),
    /// Bootstrap an in-process cluster and print the agreed cluster map.
    Simulate(SimulateArgs),
    /// Print the metadata documents persisted in a data directory.
    ShowMeta(ShowMetaArgs),
    /// Print version information.
    Version,
}

/// Arguments for the start command.
#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides config).
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// ID of the node that must become primary.
    #[arg(long, env = "RUCKET_PRIMARY_ID")]
    pub primary_id: Option<String>,

    /// Start as the primary of a fresh cluster.
    #[arg(long)]
    pub is_primary: bool,

    /// Number of targets to wait for before closing the registration window.
    #[arg(long)]
    pub ntargets: Option<usize>,

    /// Do not wait for registrations.
    #[arg(long)]
    pub skip_startup: bool,
}

/// Arguments for the simulate command.
#[derive(Args)]
pub struct SimulateArgs {
    /// Number of proxies, the first of which is the primary.
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u16).range(1..))]
    pub proxies: u16,

    /// Number of targets.
    #[arg(long, default_value = "3")]
    pub targets: u16,

    /// Startup deadline in milliseconds.
    #[arg(long, default_value = "2000")]
    pub startup_ms: u64,
}

/// Arguments for the show-meta command.
#[derive(Args)]
pub struct ShowMetaArgs {
    /// Directory holding the persisted metadata documents.
    #[arg(short, long)]
    pub data_dir: PathBuf,
}
