use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "innsync")]
#[command(about = "Inspect and steer channel manager synchronization")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the sync database (defaults to INNSYNC_DATABASE_PATH)
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the latest runs of every sync type for a property
    Status {
        /// Local property id
        property_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent sync runs
    Runs {
        /// Only runs of this property
        #[arg(long, value_name = "ID")]
        property: Option<String>,
        /// Number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending or running sync run
    Cancel {
        /// Run id
        run_id: String,
        /// Recorded as the run's error
        #[arg(long)]
        reason: Option<String>,
    },
    /// Read the per-item sync log, newest first
    Logs {
        /// Only entries of this property
        #[arg(long, value_name = "ID")]
        property: Option<String>,
        /// Only entries written by this run
        #[arg(long, value_name = "RUN_ID")]
        run: Option<String>,
        /// reservation, room_type or guest
        #[arg(long, value_name = "TYPE")]
        entity_type: Option<String>,
        /// Only entries for this external id
        #[arg(long, value_name = "ID")]
        external_id: Option<String>,
        /// Only failed entries
        #[arg(long)]
        failures: bool,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Work the manual conflict queue
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Manage local/external identity mappings
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },
    /// Inspect and replay outbound jobs that exhausted their retries
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
    /// Run one sync for a property in the foreground
    Pull {
        /// Local property id
        property_id: String,
        /// reservations, guests, availability or rates
        #[arg(default_value = "reservations")]
        sync_type: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List open conflicts
    List {
        /// Only conflicts of this property
        #[arg(long, value_name = "ID")]
        property: Option<String>,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one conflict with both snapshots and its history
    Show {
        /// Conflict id
        id: String,
    },
    /// Resolve an open conflict
    Resolve {
        /// Conflict id
        id: String,
        /// accept_local, accept_remote or merge
        #[arg(long)]
        action: String,
        /// Operator name recorded on the conflict
        #[arg(long = "by", value_name = "NAME")]
        resolved_by: String,
        /// Field groups taken from the channel when merging
        /// (status, dates, occupancy, amount, notes)
        #[arg(long = "take", value_name = "FIELD", value_delimiter = ',')]
        take_remote: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum MappingCommands {
    /// List active mappings
    List {
        /// Only mappings of this property
        #[arg(long, value_name = "ID")]
        property: Option<String>,
        /// reservation, room_type or guest
        #[arg(long, value_name = "TYPE")]
        entity_type: Option<String>,
        /// Include retired mappings
        #[arg(long)]
        all: bool,
        /// Number of mappings to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Link a local entity to an external one
    Create {
        /// Local property id
        property_id: String,
        /// reservation, room_type or guest
        entity_type: String,
        /// Local entity id
        local_id: String,
        /// Channel-side entity id
        external_id: String,
        /// Channel-side property id (defaults to INNSYNC_PROPERTIES)
        #[arg(long, value_name = "ID")]
        external_property: Option<String>,
        /// bidirectional, inbound or outbound
        #[arg(long, default_value = "bidirectional")]
        direction: String,
    },
    /// Retire a mapping so either side can be mapped again
    Retire {
        /// Mapping id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead-lettered jobs
    List {
        /// Include jobs that were already replayed
        #[arg(long)]
        all: bool,
        /// Number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver a dead-lettered job again, in the foreground
    Replay {
        /// Dead letter id
        id: String,
    },
}
