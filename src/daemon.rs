//! Daemon wiring
//!
//! Builds the component graph and drives the cooperative loops: the
//! position monitor at its trading/non-trading cadence, the pending-order
//! sweeper, the broker position sync, and a liveness heartbeat. Shutdown
//! stops components in order with a bounded wait each; a component that
//! refuses to stop is logged and abandoned.

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, CallbackHub};
use crate::config::Config;
use crate::errors::{Result, SentinelError};
use crate::executor::OrderExecutor;
use crate::grid::manager::GridTradingManager;
use crate::market::MarketDataProvider;
use crate::monitor::PositionMonitor;
use crate::store::{Snapshot, StateStore};

/// Per-component shutdown allowance.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

pub struct Daemon {
    config: Arc<Config>,
    store: StateStore,
    executor: Arc<OrderExecutor>,
    grid: Arc<GridTradingManager>,
    monitor: Arc<PositionMonitor>,
    hub: CallbackHub,
}

impl Daemon {
    /// Build the object graph, register the fill callback, and run grid
    /// session recovery. A store that cannot open is fatal: the daemon
    /// refuses to start.
    pub fn build(
        config: Config,
        broker: Arc<dyn BrokerAdapter>,
        market: Arc<dyn MarketDataProvider>,
        hub: &CallbackHub,
    ) -> Result<Daemon> {
        let config = Arc::new(config);
        let store = StateStore::open(&config.storage.db_path)
            .map_err(|e| SentinelError::Fatal(format!("state store unavailable: {e}")))?;

        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            Arc::clone(&broker),
            Arc::clone(&market),
            Arc::clone(&config),
        ));
        let grid = Arc::new(GridTradingManager::new(
            store.clone(),
            Arc::clone(&executor),
            Arc::clone(&config),
        ));
        executor.attach_grid_manager(Arc::clone(&grid));

        {
            let executor = Arc::clone(&executor);
            hub.register(move |fill| executor.handle_fill(fill));
        }

        let monitor = Arc::new(PositionMonitor::new(
            store.clone(),
            market,
            broker,
            Arc::clone(&grid),
            Arc::clone(&executor),
            Arc::clone(&config),
        ));

        let (recovered, stopped) = grid.recover();
        info!(
            "daemon built: {} grid sessions recovered, {} stopped, data_version={}",
            recovered,
            stopped,
            store.data_version()
        );

        Ok(Daemon {
            config,
            store,
            executor,
            grid,
            monitor,
            hub: hub.clone(),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub fn grid(&self) -> &Arc<GridTradingManager> {
        &self.grid
    }

    pub fn monitor(&self) -> &Arc<PositionMonitor> {
        &self.monitor
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        self.store.snapshot()
    }

    /// Run until Ctrl-C.
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let ctrl_c = tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("signal handler failed: {e}");
            }
            info!("shutdown signal received");
            let _ = stop_tx.send(true);
        });
        let result = self.run_with_shutdown(stop_rx).await;
        ctrl_c.abort();
        result
    }

    /// Run the cooperative loops until the stop flag flips.
    pub async fn run_with_shutdown(&self, stop: watch::Receiver<bool>) -> Result<()> {
        info!(
            "daemon starting: simulation={}, auto_trading={}, monitor every {}s (trading hours)",
            self.config.core.simulation_mode,
            self.executor.trading_enabled(),
            self.config.timing.monitor_loop_interval_secs
        );

        let monitor_task = self.spawn_monitor_loop(stop.clone());
        let sweeper_task = self.spawn_sweeper_loop(stop.clone());
        let sync_task = self.spawn_sync_loop(stop.clone());
        let heartbeat_task = self.spawn_heartbeat_loop(stop.clone());

        // Wait for the stop flag, then take components down in order:
        // monitor first (no new signals), then the sweeper and the sync,
        // then the broker callback path, and finally the store flush.
        let mut stop_wait = stop;
        while !*stop_wait.borrow() {
            if stop_wait.changed().await.is_err() {
                break;
            }
        }

        for (name, task) in [
            ("monitor", monitor_task),
            ("sweeper", sweeper_task),
            ("position-sync", sync_task),
            ("heartbeat", heartbeat_task),
        ] {
            match timeout(SHUTDOWN_WAIT, task).await {
                Ok(Ok(())) => debug!("{name} stopped"),
                Ok(Err(e)) => warn!("{name} ended with error: {e}"),
                Err(_) => warn!("{name} did not stop within {SHUTDOWN_WAIT:?}, abandoned"),
            }
        }

        // Seal the callback path so a straggling fill cannot race the
        // final flush; its share delta is recovered by the next sync.
        self.hub.close();
        if let Err(e) = self.store.flush() {
            warn!("final store flush failed: {e}");
        }

        info!(
            "daemon stopped, final data_version={}",
            self.store.data_version()
        );
        Ok(())
    }

    fn spawn_monitor_loop(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(&self.monitor);
        let config = Arc::clone(&self.config);
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                monitor.run_once().await;

                let pause = if config.is_trading_time(Local::now()) {
                    Duration::from_secs(config.timing.monitor_loop_interval_secs)
                } else {
                    Duration::from_secs(config.timing.monitor_non_trade_sleep_secs)
                };
                tokio::select! {
                    _ = sleep(pause) => {}
                    _ = stop.changed() => {}
                }
            }
        })
    }

    fn spawn_sweeper_loop(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let interval = Duration::from_secs(self.config.orders.pending_sweep_interval_secs);
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                let executor_inner = Arc::clone(&executor);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || executor_inner.sweep_pending()).await
                {
                    warn!("sweeper worker failed: {e}");
                }
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stop.changed() => {}
                }
            }
        })
    }

    fn spawn_sync_loop(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(&self.monitor);
        let simulation = self.config.core.simulation_mode;
        let interval = Duration::from_secs(self.config.timing.position_sync_interval_secs);
        tokio::spawn(async move {
            // Simulation holds no broker truth to reconcile against.
            if simulation {
                return;
            }
            loop {
                if *stop.borrow() {
                    break;
                }
                let monitor_inner = Arc::clone(&monitor);
                match tokio::task::spawn_blocking(move || monitor_inner.sync_positions()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("position sync failed: {e}"),
                    Err(e) => warn!("position sync worker failed: {e}"),
                }
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stop.changed() => {}
                }
            }
        })
    }

    fn spawn_heartbeat_loop(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = self.store.clone();
        let executor = Arc::clone(&self.executor);
        let grid = Arc::clone(&self.grid);
        let interval = Duration::from_secs(self.config.timing.thread_check_interval_secs);
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                debug!(
                    "heartbeat: data_version={}, pending_sells={}, grid_sessions={}",
                    store.data_version(),
                    executor.pending_count(),
                    grid.active_session_count()
                );
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = stop.changed() => {}
                }
            }
        })
    }
}
