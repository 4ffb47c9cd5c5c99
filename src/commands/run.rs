//! Daemon Run Command
//!
//! Boots the full daemon: state store, broker adapter, market data
//! boundary, grid recovery, and the cooperative monitor/sweeper/sync
//! loops, then runs until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use equity_sentinel::broker::{CallbackHub, SimulatedBroker};
use equity_sentinel::config::Config;
use equity_sentinel::daemon::Daemon;
use equity_sentinel::market::ReplayTickProvider;

pub fn run(config_path: Option<String>) -> Result<()> {
    dotenv::dotenv().ok();

    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => Config::from_env().context("Failed to build default config")?,
    };

    if !config.core.simulation_mode {
        // The broker transport is deployment-specific and wired in by the
        // embedding integration; this binary only ships the simulator.
        anyhow::bail!(
            "no live broker transport is configured; set simulation_mode=true or embed a broker adapter"
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    info!("═══ equity-sentinel daemon ═══");
    info!(
        "db={} simulation={} auto_trading={}",
        config.storage.db_path, config.core.simulation_mode, config.core.enable_auto_trading
    );
    if !config.core.enable_auto_trading {
        warn!("auto trading is DISABLED: signals will be computed and logged but never submitted");
    }

    let hub = CallbackHub::new();
    let broker = Arc::new(SimulatedBroker::new(hub.clone(), true));
    let market = Arc::new(ReplayTickProvider::new());

    let daemon = Daemon::build(config, broker, market, &hub).context("daemon startup failed")?;
    daemon.run_until_shutdown().await?;
    Ok(())
}
