// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use teamgrid_core::domain::node_config::NodeConfigManifest;
use teamgrid_core::domain::team::TeamDefinition;

pub const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
pub const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./teamgrid-config.yaml)
        #[arg(short, long, default_value = "./teamgrid-config.yaml")]
        output: PathBuf,

        /// Include a sample team, static peer and comments
        #[arg(long)]
        examples: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate {
            output,
            examples,
            force,
        } => generate(output, examples, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. TEAMGRID_CONFIG_PATH: {}",
            std::env::var("TEAMGRID_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./teamgrid-config.yaml");
        println!("  4. ~/.teamgrid/config.yaml");
        println!("  5. /etc/teamgrid/config.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{}", yaml);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node Identity:".bold());
    println!("  ID: {}", spec.node.id);
    if let Some(name) = &spec.node.name {
        println!("  Name: {}", name);
    }
    println!("  Base URL: {}", spec.node.base_url);
    if let Some(advertised) = &spec.node.advertised_base_url {
        println!("  Advertised URL: {}", advertised);
    }
    println!(
        "  Listen: {}:{}",
        spec.network.bind_address, spec.network.port
    );
    println!();

    println!("{}", "Discovery:".bold());
    println!(
        "  Thresholds: degraded {}ms, unreachable {}ms, ttl {}ms",
        spec.discovery.degraded_after_ms,
        spec.discovery.unreachable_after_ms,
        spec.discovery.ttl_ms
    );
    match &spec.discovery.upstream_url {
        Some(upstream) => println!("  Upstream: {}", upstream),
        None => println!("  Upstream: {}", "(mesh)".dimmed()),
    }
    for peer in &spec.discovery.static_peers {
        println!("  Static peer {} -> {}", peer.node_id.bold(), peer.base_url);
    }
    println!();

    println!("{}", "Transport:".bold());
    println!("  Trust mode: {:?}", spec.transport.trust_mode);
    if let Some(key_id) = &spec.transport.key_id {
        println!("  Key ID: {}", key_id);
    }
    if !spec.transport.allowed_node_ids.is_empty() {
        println!("  Allowed nodes: {}", spec.transport.allowed_node_ids.join(", "));
    }
    println!(
        "  Runtime endpoint: {}",
        spec.runtime.endpoint.as_deref().unwrap_or("(logging only)")
    );
    println!();

    println!("{}", "Teams:".bold());
    if spec.teams.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for team in &spec.teams {
        println!("  {}", describe_team(team));
    }

    Ok(())
}

fn describe_team(team: &TeamDefinition) -> String {
    let members = team.flatten_members().len();
    match &team.coordinator_member_name {
        Some(coordinator) => format!(
            "{} ({} members, coordinator {})",
            team.id.as_str(),
            members,
            coordinator
        ),
        None => format!("{} ({} members)", team.id.as_str(), members),
    }
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config =
        NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, with_examples: bool, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    let sample = if with_examples {
        EXAMPLES_TEMPLATE
    } else {
        MINIMAL_TEMPLATE
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
