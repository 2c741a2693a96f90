mod config;

use anyhow::anyhow;
use arbiter::{
    ChatMessage, ChatRequest, ConfigTable, Gateway, ModuleSelector, WatchedFile,
    client::{HttpClient, create_hyper_client},
    providers,
};
use clap::Parser as _;
use config::{Command, Config};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // stdout carries command output, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    debug!("Starting gateway with config: {:?}", config);

    let table = ConfigTable::from_config_file(&config.config)
        .await
        .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;

    let client: Arc<dyn HttpClient> = Arc::new(create_hyper_client(config.pool_settings()));
    let mut selector = ModuleSelector::with_builtin_compatibility();
    providers::register_builtin(&mut selector, client);

    let gateway = Gateway::new(table, selector);

    match config.command {
        Command::Check => {
            let warnings = gateway.warnings();
            for warning in &warnings {
                warn!("{}", warning);
            }
            for status in gateway.health_status() {
                println!(
                    "{}: {}/{} targets healthy",
                    status.virtual_model, status.healthy_targets, status.total_targets
                );
            }
            if !warnings.is_empty() {
                return Err(anyhow!("{} targets were skipped", warnings.len()));
            }
        }
        Command::Route {
            model,
            system,
            priority,
            prompt,
        } => {
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(ChatMessage::new("system", system));
            }
            messages.push(ChatMessage::new("user", prompt));

            let request = ChatRequest {
                model: model.clone(),
                messages,
                priority,
                ..Default::default()
            };
            let routed = gateway.route_request(&model, request).await?;
            info!(
                pipeline = %routed.pipeline_id,
                attempts = routed.attempts,
                "Request served"
            );
            println!("{}", serde_json::to_string_pretty(&routed.response)?);
        }
        Command::Status { probe } => {
            if probe {
                gateway.manager().check_health().await;
            }
            let report = json!({
                "health": gateway.health_status(),
                "metrics": gateway.metrics(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Blacklist { id, reason } => {
            let table = gateway.add_to_blacklist(&id, &reason)?;
            save(&config.config, &table).await?;
            println!("{id} blacklisted");
        }
        Command::Restore { provider, model } => {
            let table = gateway.add_to_pool(&provider, &model)?;
            save(&config.config, &table).await?;
            println!("{provider}.{model} restored to the pool");
        }
        Command::Watch {
            health_interval_secs,
        } => {
            let updates = gateway
                .receive_updates(WatchedFile(config.config.clone()))
                .await?;
            let probes = gateway
                .manager()
                .spawn_health_checks(Duration::from_secs(health_interval_secs));
            info!("Watching {} for changes", config.config.display());

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            updates.abort();
            probes.abort();
        }
    }

    Ok(())
}

async fn save(path: &Path, table: &ConfigTable) -> anyhow::Result<()> {
    let contents = serde_json::to_string_pretty(table)?;
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| anyhow!("Failed to write config file {}: {}", path.display(), e))
}
