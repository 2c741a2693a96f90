//! Command-line configuration for the gateway binary
//!
//! Parses arguments with clap. Every flag can also be set through the environment.
use anyhow::anyhow;
use arbiter::client::PoolSettings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The configuration table (providers, virtual models, pool and blacklist).
    #[arg(short = 'f', long, env = "GATEWAY_CONFIG")]
    pub config: PathBuf,

    /// Maximum number of idle HTTP connections to keep alive per upstream host.
    #[arg(long, env = "GATEWAY_POOL_MAX_IDLE_PER_HOST", default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, env = "GATEWAY_POOL_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Assemble the configuration and report every skipped target.
    Check,

    /// Route a single prompt through a virtual model and print the response.
    Route {
        /// The virtual model to address.
        #[arg(short = 'm', long)]
        model: String,

        /// Optional system prompt.
        #[arg(short = 's', long)]
        system: Option<String>,

        /// Priority hint (`low`, `medium`, `high`).
        #[arg(long)]
        priority: Option<String>,

        prompt: String,
    },

    /// Print health and metrics for every virtual model as JSON.
    Status {
        /// Probe every provider before reporting.
        #[arg(long, default_value_t = false)]
        probe: bool,
    },

    /// Move a `provider.model` id to the blacklist and save the table.
    Blacklist {
        id: String,

        #[arg(short = 'r', long, default_value = "disabled by operator")]
        reason: String,
    },

    /// Move a model back into the pool and save the table.
    Restore { provider: String, model: String },

    /// Keep running: follow configuration file changes and probe providers periodically.
    Watch {
        #[arg(long, default_value_t = 30)]
        health_interval_secs: u64,
    },
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        if let Command::Watch {
            health_interval_secs: 0,
        } = self.command
        {
            return Err(anyhow!("--health-interval-secs must be greater than zero"));
        }
        Ok(self)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
            max_idle_per_host: self.pool_max_idle_per_host,
        }
    }
}
