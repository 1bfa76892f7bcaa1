//! Tracing subscriber setup.
//!
//! Logs go to stderr or an append-mode file, never stdout: stdout carries
//! the stdio transport. `RUST_LOG` overrides the level picked by the flags.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::cli::Cli;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Level,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let level = if cli.debug {
            Level::DEBUG
        } else if cli.verbose {
            Level::INFO
        } else {
            Level::WARN
        };
        Self {
            level,
            json: cli.log_json,
            file: cli.logfile.clone(),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
    }
}

/// Install the global subscriber.
pub fn init(config: &LogConfig) -> Result<()> {
    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_writer(writer)
        .with_ansi(config.file.is_none() && !config.json);

    let installed = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("Failed to set tracing subscriber")?;

    tracing::debug!(level = %config.level, json = config.json, "logger initialized");
    Ok(())
}
