//! Command-line entry points.
//!
//! The pipeline is a long-running daemon rather than a request/response
//! tool, so there is only one real subcommand (`run`, also the default).
//! `check-config` exists for deploy scripts that want to validate an
//! environment before handing it to a supervisor.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "topicstream", version, about = "Trending-topic ingestion pipeline")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the ingestion pipeline until a shutdown signal is received.
    Run,

    /// Load and validate configuration, then exit — 0 on success, prints
    /// every violation and exits non-zero otherwise.
    CheckConfig,
}
