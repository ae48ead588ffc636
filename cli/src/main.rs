// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # teamgrid node CLI
//!
//! The `teamgrid` binary runs one node of a multi-node team-run mesh.
//!
//! ## Commands
//!
//! - `teamgrid daemon` - Serve the node API, discovery and routing in the foreground
//! - `teamgrid config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::info;

use teamgrid::commands::{self, ConfigCommand};
use teamgrid::daemon;
use teamgrid::logging::{init_logging, LogSettings};
use teamgrid_core::domain::node_config::NodeConfigManifest;

/// teamgrid - distributed team-run orchestration
#[derive(Parser)]
#[command(name = "teamgrid")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "TEAMGRID_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "TEAMGRID_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, global = true, env = "TEAMGRID_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run this node in the foreground
    #[command(name = "daemon")]
    Daemon {
        /// HTTP API port (overrides spec.network.port)
        #[arg(long, env = "TEAMGRID_PORT")]
        port: Option<u16>,

        /// HTTP bind address (overrides spec.network.bind_address)
        #[arg(long, env = "TEAMGRID_BIND_ADDRESS")]
        bind: Option<String>,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Daemon { port, bind }) => {
            let mut config = NodeConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            if let Some(port) = port {
                config.spec.network.port = port;
            }
            if let Some(bind) = bind {
                config.spec.network.bind_address = bind;
            }

            let settings = LogSettings::resolve(
                cli.log_level.as_deref(),
                cli.log_format.as_deref(),
                Some(&config),
            )?;
            init_logging(&settings)?;

            info!("Starting teamgrid node {}", config.spec.node.id);
            daemon::start_daemon(config).await
        }
        Some(Commands::Config { command }) => {
            let settings =
                LogSettings::resolve(cli.log_level.as_deref(), cli.log_format.as_deref(), None)?;
            init_logging(&settings)?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
