use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::relation::RelationKind;

#[derive(Parser)]
#[command(name = "steward")]
#[command(version)]
#[command(about = "Reconciliation engine for WSGI application services", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deliver an input-change event and run a reconciliation pass
    #[command(subcommand)]
    Event(EventCommand),

    /// Run a reconciliation pass against current inputs
    Reconcile,

    /// Show the engine's phase, flags, and applied state
    Status,

    /// Clear the lifecycle flags and return to the initial phase
    Reset,

    /// Stop the managed service
    Stop,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum EventCommand {
    /// Static configuration changed
    ConfigChanged,

    /// Application source has been staged in the application root
    SourceAvailable,

    /// A database relation unit joined
    RelationJoined {
        /// Relation kind
        #[arg(value_enum)]
        kind: RelationKindArg,

        /// Unit identifier, e.g. postgres/0
        #[arg(long)]
        unit: String,

        /// Connection fields as KEY=VALUE, repeatable
        #[arg(long = "data", value_name = "KEY=VALUE")]
        data: Vec<String>,
    },

    /// A database relation unit's fields changed
    RelationChanged {
        /// Relation kind
        #[arg(value_enum)]
        kind: RelationKindArg,

        /// Unit identifier, e.g. postgres/0
        #[arg(long)]
        unit: String,

        /// Connection fields as KEY=VALUE, repeatable
        #[arg(long = "data", value_name = "KEY=VALUE")]
        data: Vec<String>,

        /// Connection fields as a JSON object (merged after --data)
        #[arg(long)]
        json: Option<String>,
    },

    /// A database relation unit departed
    RelationDeparted {
        /// Relation kind
        #[arg(value_enum)]
        kind: RelationKindArg,

        /// Unit identifier, e.g. postgres/0
        #[arg(long)]
        unit: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum RelationKindArg {
    Postgres,
    Mongo,
}

impl From<RelationKindArg> for RelationKind {
    fn from(arg: RelationKindArg) -> Self {
        match arg {
            RelationKindArg::Postgres => Self::Postgres,
            RelationKindArg::Mongo => Self::Mongo,
        }
    }
}
