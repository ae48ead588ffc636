// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tracing subscriber setup
//!
//! Precedence for both level and format: command-line flag, then
//! `spec.observability.logging` in the node config, then the defaults
//! (`info`, text). `RUST_LOG` still wins over the level when set.

use anyhow::{Context, Result};
use teamgrid_core::domain::node_config::NodeConfigManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" | "pretty" | "compact" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("Unknown log format '{}'. Expected text or json", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(
        level_flag: Option<&str>,
        format_flag: Option<&str>,
        config: Option<&NodeConfigManifest>,
    ) -> Result<Self> {
        let from_config = config
            .and_then(|c| c.spec.observability.as_ref())
            .and_then(|o| o.logging.as_ref());

        let level = level_flag
            .map(str::to_string)
            .or_else(|| from_config.map(|l| l.level.clone()))
            .unwrap_or_else(|| "info".to_string());
        let format = match format_flag.or(from_config.map(|l| l.format.as_str())) {
            Some(value) => LogFormat::parse(value)?,
            None => LogFormat::Text,
        };

        Ok(Self { level, format })
    }
}

/// Initialize the global tracing subscriber.
pub fn init_logging(settings: &LogSettings) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&settings.level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let result = match settings.format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
