//! Container network topology CLI tool
//!
//! Builds topologies described in JSON on the local Docker host, runs
//! commands inside their nodes, and tears them down again.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_exec, cmd_up, cmd_validate};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Platform config file (JSON); falls back to $TOPOLOGY_DOCKER_CONFIG
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a topology, hold it, then tear it down
    Up {
        /// Topology description (JSON)
        topology: PathBuf,

        /// Seconds to keep the topology up; waits for Ctrl-C if omitted
        #[arg(long)]
        hold: Option<u64>,
    },

    /// Check a topology description without touching the system
    Validate {
        /// Topology description (JSON)
        topology: PathBuf,

        /// Print the normalized description as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build a topology, run one command in a node, then tear it down
    Exec {
        /// Topology description (JSON)
        topology: PathBuf,

        /// Node to run the command on
        node: String,

        /// Command line to send
        command: String,

        /// Shell to use (bash or vtysh)
        #[arg(long, default_value = "bash")]
        shell: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Up { topology, hold } => {
            cmd_up(&topology, hold, config).await?;
        }
        Commands::Validate { topology, json } => {
            cmd_validate(&topology, json, config)?;
        }
        Commands::Exec {
            topology,
            node,
            command,
            shell,
        } => {
            cmd_exec(&topology, &node, &command, &shell, config).await?;
        }
    }

    Ok(())
}
