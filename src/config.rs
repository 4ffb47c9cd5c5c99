//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for the broker account and database path. Every option
//! carries a serde default so a partial config file is valid.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreToggles,
    pub thresholds: Thresholds,
    pub sizing: Sizing,
    pub timing: Timing,
    pub orders: OrderPolicy,
    pub grid: GridDefaults,
    pub circuit_breaker: CircuitBreakerSettings,
    pub storage: Storage,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// All defaults plus environment overrides; used when no file is given.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(account) = std::env::var("SENTINEL_ACCOUNT_ID") {
            self.storage.account_id = account;
        }
        if let Ok(db_path) = std::env::var("SENTINEL_DB_PATH") {
            self.storage.db_path = db_path;
        }
    }

    /// Reject configurations that would produce nonsense signals.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if t.stop_loss_ratio >= 0.0 {
            anyhow::bail!("stop_loss_ratio must be negative, got {}", t.stop_loss_ratio);
        }
        if t.first_tp_ratio <= 0.0 || t.first_tp_pullback_ratio <= 0.0 {
            anyhow::bail!("first-stage take-profit ratios must be positive");
        }
        if !(0.0..=1.0).contains(&t.first_tp_sell_ratio) {
            anyhow::bail!("first_tp_sell_ratio must be in (0, 1]");
        }
        let mut prev = f64::NEG_INFINITY;
        for tier in &t.dynamic_tp_tiers {
            if tier.threshold <= prev {
                anyhow::bail!("dynamic_tp_tiers thresholds must be strictly ascending");
            }
            if !(0.0..=1.0).contains(&tier.coefficient) {
                anyhow::bail!("tier coefficient {} out of (0, 1]", tier.coefficient);
            }
            prev = tier.threshold;
        }
        if t.buy_grid_levels.is_empty() || (t.buy_grid_levels[0] - 1.0).abs() > 1e-9 {
            anyhow::bail!("buy_grid_levels must start at 1.0");
        }
        let g = &self.grid;
        if !(0.0..=0.2).contains(&g.grid_price_interval) || g.grid_price_interval == 0.0 {
            anyhow::bail!("grid_price_interval must be in (0, 0.2]");
        }
        if !(0.0..=0.05).contains(&g.grid_callback_ratio) || g.grid_callback_ratio == 0.0 {
            anyhow::bail!("grid_callback_ratio must be in (0, 0.05]");
        }
        if !(0.0..=1.0).contains(&g.grid_position_ratio) || g.grid_position_ratio == 0.0 {
            anyhow::bail!("grid_position_ratio must be in (0, 1]");
        }
        if g.grid_stop_loss >= 0.0 {
            anyhow::bail!("grid_stop_loss must be negative, got {}", g.grid_stop_loss);
        }
        Ok(())
    }

    /// True while the exchange is in a continuous trading session.
    ///
    /// A-share hours: 09:30-11:30 and 13:00-15:00, Monday to Friday.
    pub fn is_trading_time(&self, now: DateTime<Local>) -> bool {
        let weekday = now.weekday().number_from_monday();
        if weekday > 5 {
            return false;
        }
        let t = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second()).unwrap();
        let morning = (NaiveTime::from_hms_opt(9, 30, 0).unwrap(), NaiveTime::from_hms_opt(11, 30, 0).unwrap());
        let afternoon = (NaiveTime::from_hms_opt(13, 0, 0).unwrap(), NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        (t >= morning.0 && t <= morning.1) || (t >= afternoon.0 && t <= afternoon.1)
    }
}

/// Master feature switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreToggles {
    /// Broker calls are synthetic and fill synchronously.
    pub simulation_mode: bool,
    /// Master switch for order submission.
    pub enable_auto_trading: bool,
    pub enable_dynamic_stop_profit: bool,
    pub enable_stop_loss_buy: bool,
    pub enable_grid_trading: bool,
    /// Grid sessions may only start on positions whose first-stage
    /// take-profit has committed.
    pub require_profit_triggered: bool,
    pub allow_take_profit_full_with_pending: bool,
}

impl Default for CoreToggles {
    fn default() -> Self {
        CoreToggles {
            simulation_mode: true,
            enable_auto_trading: false,
            enable_dynamic_stop_profit: true,
            enable_stop_loss_buy: true,
            enable_grid_trading: true,
            require_profit_triggered: true,
            allow_take_profit_full_with_pending: false,
        }
    }
}

/// One row of the tiered trailing-stop table
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierRule {
    /// Peak profit ratio at which this tier engages.
    pub threshold: f64,
    /// Stop price = highest_price x coefficient.
    pub coefficient: f64,
}

/// Stop-profit / stop-loss thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub stop_loss_ratio: f64,
    pub first_tp_ratio: f64,
    pub first_tp_pullback_ratio: f64,
    pub first_tp_sell_ratio: f64,
    pub dynamic_tp_tiers: Vec<TierRule>,
    /// Compensation-buy grid: ratios of cost price, starting at 1.0.
    pub buy_grid_levels: Vec<f64>,
    /// Minimum realised loss for a stop-loss signal to pass validation.
    pub min_stop_loss_validation_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            stop_loss_ratio: -0.075,
            first_tp_ratio: 0.06,
            first_tp_pullback_ratio: 0.005,
            first_tp_sell_ratio: 0.60,
            dynamic_tp_tiers: vec![
                TierRule { threshold: 0.05, coefficient: 0.96 },
                TierRule { threshold: 0.10, coefficient: 0.93 },
                TierRule { threshold: 0.15, coefficient: 0.90 },
                TierRule { threshold: 0.20, coefficient: 0.87 },
                TierRule { threshold: 0.30, coefficient: 0.85 },
                TierRule { threshold: 0.40, coefficient: 0.83 },
                TierRule { threshold: 0.50, coefficient: 0.80 },
            ],
            buy_grid_levels: vec![1.0, 0.93, 0.88],
            min_stop_loss_validation_ratio: 0.03,
        }
    }
}

/// Position sizing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sizing {
    /// Currency amount for one compensation buy.
    pub position_unit: f64,
    /// Cap on the value held in any single symbol.
    pub max_single_position_value: f64,
    pub max_total_position_ratio: f64,
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing {
            position_unit: 35_000.0,
            max_single_position_value: 70_000.0,
            max_total_position_ratio: 0.95,
        }
    }
}

/// Scheduler cadences and call bounds, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub monitor_loop_interval_secs: u64,
    /// Hard bound on any single per-symbol external call inside the monitor.
    pub monitor_call_timeout_secs: u64,
    pub monitor_non_trade_sleep_secs: u64,
    pub position_sync_interval_secs: u64,
    pub thread_check_interval_secs: u64,
    /// TTL of the cached historical daily high per symbol.
    pub daily_high_cache_ttl_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            monitor_loop_interval_secs: 3,
            monitor_call_timeout_secs: 8,
            monitor_non_trade_sleep_secs: 60,
            position_sync_interval_secs: 15,
            thread_check_interval_secs: 60,
            daily_high_cache_ttl_secs: 300,
        }
    }
}

impl Timing {
    pub fn monitor_call_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_call_timeout_secs)
    }
}

/// Price selection mode when (re)submitting an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceMode {
    /// Use the last traded price.
    Market,
    /// Reuse the signal's planned price.
    Limit,
    /// Use the best available bid a few levels deep (bid-3 for sells).
    Best,
}

/// Pending-order lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderPolicy {
    pub pending_order_timeout_minutes: u64,
    pub pending_order_auto_cancel: bool,
    pub pending_order_auto_reorder: bool,
    pub pending_order_reorder_price_mode: PriceMode,
    /// Submit orders through the synchronous broker API instead of the
    /// seq-no callback mode.
    pub use_sync_order_api: bool,
    /// Sweeper cadence.
    pub pending_sweep_interval_secs: u64,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        OrderPolicy {
            pending_order_timeout_minutes: 5,
            pending_order_auto_cancel: true,
            pending_order_auto_reorder: true,
            pending_order_reorder_price_mode: PriceMode::Best,
            use_sync_order_api: false,
            pending_sweep_interval_secs: 30,
        }
    }
}

impl OrderPolicy {
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_order_timeout_minutes * 60)
    }
}

/// Defaults applied to new grid sessions when the request omits a field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridDefaults {
    pub grid_price_interval: f64,
    pub grid_position_ratio: f64,
    pub grid_callback_ratio: f64,
    pub grid_max_deviation: f64,
    pub grid_target_profit: f64,
    pub grid_stop_loss: f64,
    pub grid_duration_days: i64,
    pub grid_level_cooldown_seconds: u64,
    pub grid_lock_acquire_timeout_seconds: u64,
    pub grid_position_query_timeout_seconds: u64,
}

impl Default for GridDefaults {
    fn default() -> Self {
        GridDefaults {
            grid_price_interval: 0.05,
            grid_position_ratio: 0.25,
            grid_callback_ratio: 0.005,
            grid_max_deviation: 0.15,
            grid_target_profit: 0.10,
            grid_stop_loss: -0.10,
            grid_duration_days: 7,
            grid_level_cooldown_seconds: 60,
            grid_lock_acquire_timeout_seconds: 2,
            grid_position_query_timeout_seconds: 5,
        }
    }
}

/// Market-data circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enable_market_data_circuit_breaker: bool,
    /// Failures within the window that trip the circuit.
    pub market_data_failure_threshold: u32,
    pub market_data_failure_window_seconds: u64,
    pub market_data_circuit_break_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        CircuitBreakerSettings {
            enable_market_data_circuit_breaker: true,
            market_data_failure_threshold: 3,
            market_data_failure_window_seconds: 60,
            market_data_circuit_break_seconds: 300,
        }
    }
}

/// Storage and account identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    pub db_path: String,
    pub account_id: String,
}

impl Default for Storage {
    fn default() -> Self {
        Storage {
            db_path: "sentinel.db".to_string(),
            account_id: String::new(),
        }
    }
}
