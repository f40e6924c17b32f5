use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mintwright_deploy::{MANIFEST_FILENAME, Selection};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(name = "mintwright")]
#[command(
    author,
    version,
    about = "Deploy, upgrade and wire together interdependent contracts"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "MINTWRIGHT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the manifest, or to a directory containing `Mintwright.toml`.
    #[arg(short, long, global = true, alias = "conf", env = "MINTWRIGHT_CONFIG", default_value = MANIFEST_FILENAME)]
    pub config: PathBuf,

    /// Override the network named in the manifest.
    ///
    /// Selects the role assignments and the directory deployment records are kept in.
    #[arg(short, long, global = true)]
    pub network: Option<String>,

    /// Override the RPC endpoint named in the manifest.
    #[arg(long, global = true, alias = "rpc")]
    pub rpc_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy the selected units and their dependencies.
    Deploy(SelectionArgs),
    /// Print the execution order without touching the network.
    Plan(SelectionArgs),
    /// List the deployment records of the network.
    Status,
    /// Remove the stored record of a unit, so the next run deploys it again.
    Forget {
        /// The unit whose record is removed.
        unit: String,
    },
}

/// Units to run. Selecting nothing selects every unit.
#[derive(Debug, Clone, Default, Args)]
pub struct SelectionArgs {
    /// Select units carrying one of these tags.
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Select units by name.
    #[arg(short, long, value_delimiter = ',')]
    pub units: Vec<String>,
}

impl From<SelectionArgs> for Selection {
    fn from(args: SelectionArgs) -> Self {
        Selection {
            units: args.units,
            tags: args.tags,
        }
    }
}
