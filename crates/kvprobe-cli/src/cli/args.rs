use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kvprobe_core::BackendKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "kvprobe",
    version,
    about = "Probe the practical limits of a transactional key-value store: total capacity, largest record, record count"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show current usage, quota and persistence
    Estimate,
    /// Request persistent storage if it is not granted yet
    Persist,
    /// Add fixed-size chunks until the store refuses or the target is met
    Capacity(CapacityArgs),
    /// Find the largest single record (exponential growth, then binary search)
    Size(SizeArgs),
    /// Find how many small records fit (batches, then one at a time)
    Count(CountArgs),
    /// Delete the probe database
    Clear,
    /// Print the effective configuration as YAML
    Config,
}

#[derive(clap::Args, Clone, Debug)]
pub struct GlobalArgs {
    /// Config file. Defaults to ./kvprobe.yaml when present.
    #[arg(long, global = true, env = "KVPROBE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    pub backend: Option<BackendArg>,

    /// Directory for SQLite database files
    #[arg(long, global = true)]
    pub dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub quota_bytes: Option<u64>,

    #[arg(long, global = true)]
    pub max_record_bytes: Option<u64>,

    /// Records per store (memory backend only)
    #[arg(long, global = true)]
    pub max_records: Option<u64>,

    /// Answer yes at every confirmation checkpoint
    #[arg(short = 'y', long, global = true)]
    pub yes: bool,

    /// Print the result as JSON on stdout; progress lines go to stderr
    #[arg(long, global = true)]
    pub json: bool,

    /// Only print the final result
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    Sqlite,
    Memory,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Sqlite => BackendKind::Sqlite,
            BackendArg::Memory => BackendKind::Memory,
        }
    }
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct CapacityArgs {
    /// Chunk size, in units
    #[arg(long)]
    pub chunk: Option<u64>,

    /// Stop once this many units are stored
    #[arg(long)]
    pub target: Option<u64>,

    #[arg(long)]
    pub unit_bytes: Option<u64>,

    /// Confirm every N trials (0 disables)
    #[arg(long)]
    pub frequency: Option<u64>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct SizeArgs {
    /// Stop once a record of this many units is stored
    #[arg(long)]
    pub target: Option<u64>,

    /// Binary search stops when the bounds are this close, in units
    #[arg(long)]
    pub precision: Option<u64>,

    #[arg(long)]
    pub unit_bytes: Option<u64>,

    /// Confirm every N trials (0 disables)
    #[arg(long)]
    pub frequency: Option<u64>,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct CountArgs {
    #[arg(long)]
    pub target: Option<u64>,

    /// Single mode gives up past target times this
    #[arg(long)]
    pub safety_multiple: Option<u64>,

    /// Stop in single mode as soon as the target is reached
    #[arg(long)]
    pub stop_at_target: bool,

    /// Confirm every N trials (0 disables)
    #[arg(long)]
    pub frequency: Option<u64>,
}
