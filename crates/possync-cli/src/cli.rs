use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use possync_core::{OperationKind, OperationStatus, ReviewChoice};

#[derive(Parser)]
#[command(name = "possync")]
#[command(about = "Inspect and synchronize an offline-first point-of-sale store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub settings: GlobalArgs,
}

#[derive(Args, Debug, Default, Clone)]
pub struct GlobalArgs {
    /// Path to the local store database
    #[arg(long, global = true, env = "POSSYNC_DB_PATH", value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Tenant (restaurant account) to operate on
    #[arg(long, global = true, env = "POSSYNC_TENANT")]
    pub tenant: Option<String>,

    /// Device id used for the sync cursor and as the write actor
    #[arg(long, global = true, env = "POSSYNC_DEVICE")]
    pub device: Option<String>,

    /// Base URL of the sync server
    #[arg(long, global = true, env = "POSSYNC_SERVER_URL", value_name = "URL")]
    pub server_url: Option<String>,

    /// Bearer token for the sync server
    #[arg(long, global = true, env = "POSSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Sync configuration file (JSON)
    #[arg(long, global = true, env = "POSSYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply a local change and queue it for the server
    Enqueue {
        /// Kind of change
        #[arg(value_enum)]
        kind: KindArg,
        /// Entity type, e.g. order
        entity_type: String,
        /// Entity id
        entity_id: String,
        /// Changed fields as name=value; values are JSON, bare text is a string
        fields: Vec<String>,
        /// Reuse this operation id; repeating a command with the same id queues it once
        #[arg(long)]
        operation_id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the local copy of a record
    Show {
        entity_type: String,
        entity_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records with unconfirmed local changes
    Dirty {
        /// Number of records to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued operations
    Ops {
        /// Only operations in this state
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        /// Only failures that need attention
        #[arg(long, conflicts_with = "status")]
        failures: bool,
        /// Number of operations to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop a failed operation from the log
    Discard {
        /// Operation id
        id: String,
    },
    /// Run one sync cycle against the server
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the background and print progress until interrupted
    Watch {
        /// Stop after this many completed cycles
        #[arg(long, value_name = "N")]
        cycles: Option<usize>,
    },
    /// List manual reviews
    Reviews {
        /// Include resolved reviews
        #[arg(long)]
        all: bool,
        /// Number of reviews to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle an open manual review
    Resolve {
        /// Review id
        id: i64,
        /// Which value to keep
        #[arg(long, value_enum)]
        keep: KeepArg,
    },
    /// Purge old tombstones and superseded operations
    Gc {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Queue operations for dirty records missing from the operation log
    Rebuild,
    /// Move a corrupted store file aside
    Quarantine,
    /// Manage CLI profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output file path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    /// Show the resolved profile
    Show,
    /// Store settings in a profile
    Set {
        #[arg(long)]
        db_path: Option<PathBuf>,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long)]
        device: Option<String>,
        #[arg(long, value_name = "URL")]
        server_url: Option<String>,
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Make a profile the active one
    Use { name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Create,
    Update,
    #[value(name = "status")]
    StatusTransition,
    Delete,
}

impl From<KindArg> for OperationKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Create => Self::Create,
            KindArg::Update => Self::Update,
            KindArg::StatusTransition => Self::StatusTransition,
            KindArg::Delete => Self::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
    Conflicted,
}

impl From<StatusArg> for OperationStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => Self::Pending,
            StatusArg::InFlight => Self::InFlight,
            StatusArg::Acknowledged => Self::Acknowledged,
            StatusArg::Failed => Self::Failed,
            StatusArg::Conflicted => Self::Conflicted,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KeepArg {
    Local,
    Remote,
}

impl From<KeepArg> for ReviewChoice {
    fn from(value: KeepArg) -> Self {
        match value {
            KeepArg::Local => Self::KeepLocal,
            KeepArg::Remote => Self::KeepRemote,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
