//! Command-line interface

pub mod commands;
pub mod demo;
pub mod output;

use crate::core::{ExecutionMode, RuntimeConfig};
use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{BrokerCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Step/catch pipelines over single-flight connection ladders
#[derive(Debug, Parser, Clone)]
#[command(name = "stepline")]
#[command(version = "0.1.0")]
#[command(about = "Run step/catch pipelines over shared connection ladders", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to runtime configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Suppress step traces regardless of configuration
    #[arg(long, global = true)]
    pub production: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the greeting pipeline against a document store
    Run(RunCommand),

    /// Publish concurrently through one broker ladder
    Broker(BrokerCommand),

    /// Validate a runtime configuration
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }

    /// Configuration file (or defaults), then environment, then flags
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        let config = match &self.config {
            Some(path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        let mut config = config.with_env()?;
        if self.production {
            config.mode = ExecutionMode::Production;
        }
        Ok(config)
    }
}
