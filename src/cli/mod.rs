//! CLI argument parsing for the agentbridge REPL binary.

pub mod output;

use clap::{Parser, Subcommand};

/// agentbridge - a tool-orchestration core with a REPL front end.
#[derive(Parser, Debug)]
#[command(
    name = "agentbridge",
    author,
    version,
    about = "Agentic tool-orchestration core: spawns tool servers, runs a bounded planning loop, persists conversation history",
    after_help = "EXAMPLES:\n    \
                  agentbridge                  # start the REPL\n    \
                  agentbridge --no-color       # start without colored output\n    \
                  agentbridge clear <user-key> # clear a user's stored history"
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Subcommand to execute; omit to start the REPL
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Clear stored conversation history for a user
    Clear {
        /// Opaque key identifying the user whose history should be cleared
        user_key: String,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
