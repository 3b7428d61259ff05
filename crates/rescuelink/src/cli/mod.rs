//! Command-line interface for rescuelink.
//!
//! This module provides the CLI structure for the `rescuelink` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, HistoryCommand, MonitorCommand, ProfileCommand, QueueArg, QueueCommand,
    RetryCommand, SosAction, SosCommand, StatusCommand,
};

use crate::logging::Verbosity;

/// rescuelink - Crash detection and SOS alerts
///
/// Detects crashes from accelerometer data, sends emergency alerts to a
/// remote store, and keeps every alert on the device until it is delivered.
#[derive(Debug, Parser)]
#[command(name = "rescuelink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run crash detection over a recorded sensor stream
    Monitor(MonitorCommand),

    /// Send a manual SOS alert now
    Sos(SosCommand),

    /// Re-send alerts that failed to deliver
    Retry(RetryCommand),

    /// Inspect or clear the local alert queues
    #[command(subcommand)]
    Queue(QueueCommand),

    /// Show recent alerts from the remote store and this device
    History(HistoryCommand),

    /// View or update the user identity sent with alerts
    #[command(subcommand)]
    Profile(ProfileCommand),

    /// Show storage, delivery and detection status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.verbose, self.quiet)
    }
}
