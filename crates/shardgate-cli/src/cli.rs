use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shardgate_types::{Epoch, PgId};

#[derive(Parser)]
#[command(
    name = "shardgate",
    about = "Recovery gate for replicated object storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Drive concurrent client requests against an in-memory placement group
    Simulate(SimulateArgs),
    /// Show or check recovery configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Placement group id, as `pool.seed` with the seed in hex
    #[arg(long, default_value = "1.0")]
    pub pgid: PgId,
    #[arg(long, default_value_t = 5)]
    pub epoch: u32,
    /// Objects in the group
    #[arg(long, default_value_t = 32)]
    pub objects: usize,
    /// Fraction of objects that start out needing recovery
    #[arg(long, default_value_t = 0.5)]
    pub unhealthy_ratio: f64,
    /// Concurrent client requests per object
    #[arg(long, default_value_t = 4)]
    pub clients: usize,
    #[arg(long, default_value_t = 5)]
    pub min_latency_ms: u64,
    #[arg(long, default_value_t = 50)]
    pub max_latency_ms: u64,
    /// Unhealthy objects whose recovery always fails
    #[arg(long, default_value_t = 0)]
    pub unrecoverable: usize,
    /// Advance the epoch once, this long after clients start
    #[arg(long)]
    pub bump_epoch_after_ms: Option<u64>,
    /// Tear the group down this long after clients start
    #[arg(long)]
    pub tear_down_after_ms: Option<u64>,
    /// Clients retry after an epoch change, up to this many attempts
    #[arg(long, default_value_t = 1)]
    pub attempts: usize,
    /// Recovery configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl SimulateArgs {
    pub fn start_epoch(&self) -> Epoch {
        Epoch(self.epoch)
    }
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the default configuration
    Show,
    /// Parse and validate a configuration file
    Check { path: PathBuf },
}
