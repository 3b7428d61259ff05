//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Monitor command arguments.
#[derive(Debug, Args)]
pub struct MonitorCommand {
    /// JSON Lines sensor recording to replay
    #[arg(short, long, value_name = "FILE")]
    pub replay: PathBuf,

    /// Replay at recorded speed instead of as fast as possible
    #[arg(long)]
    pub realtime: bool,

    /// Override the countdown before a crash alert is sent, in seconds
    #[arg(long, value_name = "SECS")]
    pub countdown: Option<u64>,

    /// Output the run summary as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// SOS command arguments.
#[derive(Debug, Args)]
pub struct SosCommand {
    /// Output the delivery result as JSON
    #[arg(short, long)]
    pub json: bool,

    /// Follow-up to an earlier SOS instead of a new one
    #[command(subcommand)]
    pub action: Option<SosAction>,
}

/// Follow-ups to an SOS already sent.
#[derive(Debug, Subcommand)]
pub enum SosAction {
    /// Send a fresh location fix for an earlier alert
    Update {
        /// Alert to follow up (defaults to the most recent SOS)
        #[arg(short, long)]
        alert: Option<String>,

        /// Output the result as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Retry command arguments.
#[derive(Debug, Args)]
pub struct RetryCommand {
    /// Output the retry report as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Local queue commands.
#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List queued alerts and location updates
    List {
        /// Only show one queue
        #[arg(short, long, value_enum)]
        only: Option<QueueArg>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Remove every entry from a queue
    Clear {
        /// Queue to clear
        #[arg(value_enum)]
        queue: QueueArg,

        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

/// Which local queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueueArg {
    /// Alerts waiting for retry
    Pending,
    /// Delivered alerts
    Sent,
    /// Location updates waiting for retry
    Updates,
}

/// History command arguments.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// Maximum number of alerts
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Profile commands.
#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Show the stored user identity
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Update the stored user identity
    Set {
        /// Account identifier
        #[arg(long)]
        user_id: Option<String>,

        /// Display name
        #[arg(long)]
        name: Option<String>,

        /// Contact email
        #[arg(long)]
        email: Option<String>,

        /// Contact phone
        #[arg(long)]
        phone: Option<String>,
    },
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
