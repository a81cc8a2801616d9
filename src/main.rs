use std::path::PathBuf;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use assern::config::default_config_path;
use assern::{init_tracing, Aggregator, GatewayConfig};

/// When set, overrides `logging.file` from the config.
const LOG_FILE_ENV_VAR: &str = "ASSERN_LOG_FILE";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => match default_config_path() {
            Some(path) => path,
            None => bail!("no config path given and no config directory available"),
        },
    };

    let mut config = GatewayConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(file) = std::env::var_os(LOG_FILE_ENV_VAR) {
        config.logging.file = Some(PathBuf::from(file));
    }
    init_tracing(&config.logging).context("failed to initialize logging")?;
    tracing::info!(config = %config_path.display(), "configuration loaded");

    let aggregator = Aggregator::from_config(&config);
    let cancel = CancellationToken::new();

    let report = aggregator.start(&cancel, config.effective_backends()).await?;
    for failure in &report.failures {
        tracing::warn!(server = %failure.server, error = %failure.error, "server unavailable");
    }

    for tool in aggregator.list_tools() {
        tracing::info!(tool = %tool.key, server = %tool.server, "tool available");
    }
    tracing::info!(
        servers = ?report.started,
        tools = aggregator.list_tools().len(),
        resources = aggregator.list_resources().len(),
        prompts = aggregator.list_prompts().len(),
        "unified surface ready, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    cancel.cancel();

    tracing::info!("shutting down");
    aggregator.stop().await?;
    Ok(())
}
