use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive an in-memory connection through a session and link lifecycle.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Simulate(args) => simulate::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Flags given on the command line override values from `--scenario`.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// JSON scenario file.
    #[arg(long, value_name = "FILE")]
    pub scenario: Option<PathBuf>,
    /// Outbound sessions to open.
    #[arg(long)]
    pub sessions: Option<usize>,
    /// Senders per outbound session.
    #[arg(long)]
    pub senders: Option<usize>,
    /// Receivers per outbound session.
    #[arg(long)]
    pub receivers: Option<usize>,
    /// Sessions offered by the simulated peer.
    #[arg(long)]
    pub peer_sessions: Option<usize>,
    /// Links the peer attaches to each accepted session.
    #[arg(long)]
    pub peer_links: Option<usize>,
    /// Reject every Nth peer-offered session (0 accepts all).
    #[arg(long)]
    pub reject_every: Option<usize>,
    /// Incoming buffer size for every session, in bytes.
    #[arg(long)]
    pub session_capacity: Option<usize>,
    /// Credit window for every receiver.
    #[arg(long)]
    pub receiver_capacity: Option<u32>,
    /// How long to wait for each peer offer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
