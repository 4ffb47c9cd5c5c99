//! Position monitor and signal engine
//!
//! Driven once per symbol per scheduler loop. Each tick flows through the
//! market-data circuit breaker, updates the stored highest price, then walks
//! a strict priority ladder: stop-loss, the two-stage dynamic take-profit
//! machine, compensation buys. At most one candidate survives; a small
//! deterministic validation gate rejects obviously wrong data before the
//! signal is published and handed to the order lifecycle manager. Grid
//! signals are asked for on the same tick and published independently under
//! their own strategy tag.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::broker::BrokerAdapter;
use crate::circuit_breaker::MarketDataCircuitBreaker;
use crate::config::Config;
use crate::errors::{Result, SentinelError};
use crate::executor::OrderExecutor;
use crate::grid::manager::GridTradingManager;
use crate::market::{DailyHighCache, MarketDataProvider};
use crate::store::StateStore;
use crate::types::{
    round_down_to_lot, Position, SignalKind, StockCode, Tick, TradeSignal, LOT_SIZE,
    STRATEGY_STOP_PROFIT,
};

/// Relative divergence from the recomputed stop price beyond which the
/// stored value counts as corrupt and is repaired.
const STOP_LOSS_SANITY_BAND: f64 = 0.2;
/// Lookback window for the historical daily high bootstrap.
const DAILY_HIGH_LOOKBACK_DAYS: u32 = 60;

pub struct PositionMonitor {
    store: StateStore,
    market: Arc<dyn MarketDataProvider>,
    broker: Arc<dyn BrokerAdapter>,
    grid: Arc<GridTradingManager>,
    executor: Arc<OrderExecutor>,
    config: Arc<Config>,
    circuit: Mutex<MarketDataCircuitBreaker>,
    daily_high_cache: DailyHighCache,
    /// Per-symbol slot holding the most recent unacted signal.
    latest_signals: Mutex<HashMap<StockCode, TradeSignal>>,
    /// Compensation tiers already used, one shot per tier per lifetime.
    filled_add_tiers: Mutex<HashMap<StockCode, HashSet<usize>>>,
}

impl PositionMonitor {
    pub fn new(
        store: StateStore,
        market: Arc<dyn MarketDataProvider>,
        broker: Arc<dyn BrokerAdapter>,
        grid: Arc<GridTradingManager>,
        executor: Arc<OrderExecutor>,
        config: Arc<Config>,
    ) -> Self {
        let circuit = MarketDataCircuitBreaker::new(&config.circuit_breaker);
        let cache_ttl = Duration::from_secs(config.timing.daily_high_cache_ttl_secs);
        PositionMonitor {
            store,
            market,
            broker,
            grid,
            executor,
            config,
            circuit: Mutex::new(circuit),
            daily_high_cache: DailyHighCache::new(cache_ttl),
            latest_signals: Mutex::new(HashMap::new()),
            filled_add_tiers: Mutex::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------
    // Scheduler entry
    // ------------------------------------------------------------------

    /// One monitor pass over every held symbol. Tick fetches are
    /// hard-bounded; a symbol whose fetch times out is dropped for this
    /// loop, not retried.
    pub async fn run_once(&self) {
        let positions = match self.store.list_positions() {
            Ok(positions) => positions,
            Err(e) => {
                warn!("monitor pass skipped, position listing failed: {e}");
                return;
            }
        };

        for position in positions {
            if position.is_closed() {
                continue;
            }
            if !self.circuit.lock().expect("circuit poisoned").can_attempt() {
                debug!("market data circuit open, suppressing all signals this pass");
                return;
            }
            let code = position.stock_code.clone();
            match self.fetch_tick_bounded(&code).await {
                Ok(tick) => {
                    self.process_tick(&tick);
                }
                Err(e) => {
                    warn!("tick fetch failed for {code}: {e}");
                    self.circuit
                        .lock()
                        .expect("circuit poisoned")
                        .record_failure();
                }
            }
        }
    }

    async fn fetch_tick_bounded(&self, stock_code: &StockCode) -> Result<Tick> {
        let market = Arc::clone(&self.market);
        let code = stock_code.clone();
        let task = tokio::task::spawn_blocking(move || market.latest_tick(&code));
        match tokio::time::timeout(self.config.timing.monitor_call_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SentinelError::MarketData(format!(
                "tick worker failed: {join_err}"
            ))),
            Err(_) => Err(SentinelError::MarketData(format!(
                "tick fetch for {stock_code} exceeded {}s",
                self.config.timing.monitor_call_timeout_secs
            ))),
        }
    }

    /// Remaining circuit cooldown for the dashboard banner; 0 when closed.
    pub fn circuit_cooldown_secs(&self) -> u64 {
        self.circuit.lock().expect("circuit poisoned").remaining_secs()
    }

    // ------------------------------------------------------------------
    // Per-tick processing
    // ------------------------------------------------------------------

    /// Process one tick for one symbol: maintain the highest price, compute
    /// and act on the profit/loss candidate, then ask the grid manager for
    /// its own signal. Returns the published profit signal, if any.
    pub fn process_tick(&self, tick: &Tick) -> Option<TradeSignal> {
        let stock_code = &tick.stock_code;
        let mut position = match self.store.get_position(stock_code) {
            Ok(Some(pos)) if pos.volume > 0 => pos,
            Ok(_) => return None,
            Err(e) => {
                warn!("position read failed for {stock_code}: {e}");
                return None;
            }
        };

        position.current_price = tick.last;
        if let Err(e) = self.update_highest_price(&mut position, tick) {
            warn!("highest price update failed for {stock_code}: {e}");
        }

        let candidate = self.check_trading_signals(&mut position, tick.last);
        let published = match candidate {
            Some(signal) if self.validate_signal(&signal, &position) => {
                self.publish_and_execute(signal)
            }
            Some(signal) => {
                debug!(
                    "{} signal for {} rejected by validation",
                    signal.kind, stock_code
                );
                None
            }
            None => None,
        };

        if self.config.core.enable_grid_trading {
            if let Some(grid_signal) = self.grid.check_signals(stock_code, tick.last) {
                self.publish(grid_signal.clone());
                match self.grid.execute_trade(&grid_signal) {
                    Ok(true) => {}
                    Ok(false) => debug!("grid trade for {stock_code} skipped by sizing"),
                    Err(e) => warn!("grid trade for {stock_code} failed: {e}"),
                }
            }
        }

        published
    }

    /// Blend the live tick high with the cached historical daily high and
    /// persist the stored peak when it grows. The tick high is never cached.
    fn update_highest_price(&self, position: &mut Position, tick: &Tick) -> Result<()> {
        let mut candidate = tick.high.max(tick.last);
        if let Some(historical) = self.daily_high_cache.historical_high(
            self.market.as_ref(),
            &position.stock_code,
            DAILY_HIGH_LOOKBACK_DAYS,
        ) {
            candidate = candidate.max(historical);
        }
        if candidate > position.highest_price {
            debug!(
                "{} highest price {:.3} -> {:.3}",
                position.stock_code, position.highest_price, candidate
            );
            position.highest_price = candidate;
        }
        // One write covers the peak and the refreshed current price.
        self.store.upsert_position(position)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signal ladder
    // ------------------------------------------------------------------

    /// Walk the priority ladder and return the single winning candidate.
    fn check_trading_signals(
        &self,
        position: &mut Position,
        current_price: f64,
    ) -> Option<TradeSignal> {
        if position.cost_price <= 0.0 {
            // Unusable cost basis; repair comes from the next broker sync.
            warn!(
                "{} has cost price {:.3}, skipping signal evaluation",
                position.stock_code, position.cost_price
            );
            return None;
        }

        if let Some(signal) = self.check_stop_loss(position, current_price) {
            return Some(signal);
        }
        if self.config.core.enable_dynamic_stop_profit && position.volume > 0 {
            if let Some(signal) = self.check_dynamic_profit(position, current_price) {
                return Some(signal);
            }
        }
        if self.config.core.enable_stop_loss_buy {
            if let Some(signal) = self.check_add_position(position, current_price) {
                return Some(signal);
            }
        }
        None
    }

    /// Stop-loss, highest priority, always evaluated. The cached stop price
    /// is self-repaired when absent or outside the sanity band.
    fn check_stop_loss(&self, position: &mut Position, current_price: f64) -> Option<TradeSignal> {
        let cost = position.cost_price;
        let stop_ratio = self.config.thresholds.stop_loss_ratio;
        let expected_stop = cost * (1.0 + stop_ratio);

        let stored = position.stop_loss_price;
        let out_of_band = stored <= 0.0
            || stored >= cost
            || ((stored - expected_stop) / expected_stop).abs() > STOP_LOSS_SANITY_BAND;
        if out_of_band {
            info!(
                "{} stop price {:.3} out of sanity band, repaired to {:.3}",
                position.stock_code, stored, expected_stop
            );
            position.stop_loss_price = expected_stop;
            if let Err(e) = self.store.upsert_position(position) {
                warn!("stop price repair persist failed: {e}");
            }
        }

        let loss_ratio = (current_price - cost) / cost;
        if loss_ratio <= stop_ratio {
            let mut signal = TradeSignal::new(
                position.stock_code.clone(),
                STRATEGY_STOP_PROFIT,
                SignalKind::StopLoss,
                current_price,
            );
            signal.cost_price = Some(cost);
            signal.reason = Some(format!(
                "loss {:.2}% breached stop at {:.2}%",
                loss_ratio * 100.0,
                stop_ratio * 100.0
            ));
            return Some(signal);
        }
        None
    }

    /// Two-stage dynamic take-profit.
    ///
    /// Stage one: mark the breakout when profit first crosses the
    /// threshold, then sell a configured fraction on the pullback from the
    /// post-breakout peak. Stage two (armed only after stage one commits):
    /// a tiered trailing stop off the all-time peak sells the rest.
    fn check_dynamic_profit(
        &self,
        position: &mut Position,
        current_price: f64,
    ) -> Option<TradeSignal> {
        let t = &self.config.thresholds;
        let cost = position.cost_price;
        let profit_ratio = (current_price - cost) / cost;

        if !position.profit_triggered {
            if !position.profit_breakout_triggered {
                if profit_ratio >= t.first_tp_ratio {
                    position.profit_breakout_triggered = true;
                    position.breakout_highest_price =
                        position.breakout_highest_price.max(current_price);
                    info!(
                        "{} breakout marked at {:.3} (profit {:.2}%)",
                        position.stock_code,
                        current_price,
                        profit_ratio * 100.0
                    );
                    if let Err(e) = self.store.upsert_position(position) {
                        warn!("breakout mark persist failed: {e}");
                    }
                }
                return None;
            }

            let prior_peak = position.breakout_highest_price;
            if current_price > prior_peak {
                position.breakout_highest_price = current_price;
                if let Err(e) = self.store.upsert_position(position) {
                    warn!("breakout peak persist failed: {e}");
                }
            }
            let peak = position.breakout_highest_price;
            if peak <= 0.0 {
                return None;
            }
            let pullback = (peak - current_price) / peak;
            if pullback >= t.first_tp_pullback_ratio {
                let mut signal = TradeSignal::new(
                    position.stock_code.clone(),
                    STRATEGY_STOP_PROFIT,
                    SignalKind::TakeProfitHalf,
                    current_price,
                );
                signal.sell_ratio = Some(t.first_tp_sell_ratio);
                signal.peak_price = Some(peak);
                signal.cost_price = Some(cost);
                signal.reason = Some(format!(
                    "pullback {:.2}% from breakout peak {:.3}",
                    pullback * 100.0,
                    peak
                ));
                return Some(signal);
            }
            return None;
        }

        // Stage two.
        let highest = position.highest_price;
        if highest <= 0.0 {
            return None;
        }
        let peak_profit = (highest - cost) / cost;
        let tier = t
            .dynamic_tp_tiers
            .iter()
            .rev()
            .find(|tier| tier.threshold <= peak_profit)?;
        let dynamic_stop = highest * tier.coefficient;
        if dynamic_stop > highest {
            warn!(
                "{} tier coefficient {:.3} yields stop above peak, suppressed",
                position.stock_code, tier.coefficient
            );
            return None;
        }
        if current_price <= dynamic_stop {
            let mut signal = TradeSignal::new(
                position.stock_code.clone(),
                STRATEGY_STOP_PROFIT,
                SignalKind::TakeProfitFull,
                current_price,
            );
            signal.cost_price = Some(cost);
            signal.reason = Some(format!(
                "trailing stop {:.3} (peak {:.3} x {:.2}) hit",
                dynamic_stop, highest, tier.coefficient
            ));
            return Some(signal);
        }
        None
    }

    /// Compensation buy. Only allowed when the first buy tier sits above
    /// the stop-loss threshold, so averaging down always happens before the
    /// stop would fire; in the mirror configuration compensation stays off
    /// and the stop-loss wins.
    fn check_add_position(
        &self,
        position: &Position,
        current_price: f64,
    ) -> Option<TradeSignal> {
        let t = &self.config.thresholds;
        let levels = &t.buy_grid_levels;
        if levels.len() < 2 {
            return None;
        }
        let add_threshold = 1.0 - levels[1];
        let sl_threshold = t.stop_loss_ratio.abs();
        if add_threshold >= sl_threshold {
            return None;
        }

        let value = position.market_value();
        let max_value = self.config.sizing.max_single_position_value;
        if value >= max_value {
            return None;
        }

        // Portfolio-level cap: no compensation once total exposure is at
        // the configured fraction of the account.
        if let Ok(account) = self
            .broker
            .query_account(&self.config.storage.account_id)
        {
            if account.total_asset > 0.0 {
                let exposure: f64 = self
                    .store
                    .list_positions()
                    .map(|ps| ps.iter().map(Position::market_value).sum())
                    .unwrap_or(0.0);
                if exposure / account.total_asset >= self.config.sizing.max_total_position_ratio {
                    debug!(
                        "{} compensation blocked: exposure {:.0} at cap",
                        position.stock_code, exposure
                    );
                    return None;
                }
            }
        }

        let price_ratio = current_price / position.cost_price;
        let filled = self.filled_add_tiers.lock().expect("tier map poisoned");
        let tier = (1..levels.len())
            .find(|k| {
                price_ratio <= levels[*k]
                    && !filled
                        .get(&position.stock_code)
                        .map(|set| set.contains(k))
                        .unwrap_or(false)
            })?;
        drop(filled);

        let amount = self.config.sizing.position_unit.min(max_value - value);
        let volume = round_down_to_lot((amount / current_price) as i64);
        if volume < LOT_SIZE {
            return None;
        }

        let mut signal = TradeSignal::new(
            position.stock_code.clone(),
            STRATEGY_STOP_PROFIT,
            SignalKind::AddPosition,
            current_price,
        );
        signal.volume = volume;
        signal.cost_price = Some(position.cost_price);
        signal.grid_level = Some(levels[tier]);
        signal.reason = Some(format!(
            "price at {:.1}% of cost reached buy tier {}",
            price_ratio * 100.0,
            tier
        ));
        Some(signal)
    }

    // ------------------------------------------------------------------
    // Validation and publication
    // ------------------------------------------------------------------

    /// Guardrail gate: rejects obviously wrong data without second-guessing
    /// the strategy.
    fn validate_signal(&self, signal: &TradeSignal, position: &Position) -> bool {
        if signal.price <= 0.0 {
            warn!("signal for {} carries price {}, rejected", signal.stock_code, signal.price);
            return false;
        }

        // A stored cost of 0 is overridden by the cost captured at signal time.
        let cost = if position.cost_price > 0.0 {
            position.cost_price
        } else {
            match signal.cost_price {
                Some(c) if c > 0.0 => c,
                _ => {
                    warn!("no usable cost basis for {}, rejected", signal.stock_code);
                    return false;
                }
            }
        };

        match signal.kind {
            SignalKind::StopLoss => {
                // Guard against a spurious tick triggering a stop on a
                // position that is barely down.
                let loss = (cost - signal.price) / cost;
                if loss < self.config.thresholds.min_stop_loss_validation_ratio {
                    warn!(
                        "stop-loss for {} shows only {:.2}% loss, rejected as spurious",
                        signal.stock_code,
                        loss * 100.0
                    );
                    return false;
                }
                true
            }
            SignalKind::TakeProfitHalf | SignalKind::TakeProfitFull => {
                if self.executor.has_pending(&signal.stock_code)
                    && !self.config.core.allow_take_profit_full_with_pending
                {
                    warn!(
                        "{} for {} blocked by an in-flight sell",
                        signal.kind, signal.stock_code
                    );
                    return false;
                }
                true
            }
            _ => true,
        }
    }

    fn publish_and_execute(&self, signal: TradeSignal) -> Option<TradeSignal> {
        self.publish(signal.clone());
        match self.executor.execute_signal(&signal) {
            Ok(true) => {
                if signal.kind == SignalKind::AddPosition {
                    self.mark_add_tier_used(&signal);
                }
                Some(signal)
            }
            Ok(false) => {
                debug!("{} for {} skipped by executor", signal.kind, signal.stock_code);
                Some(signal)
            }
            Err(e) => {
                warn!(
                    "{} execution for {} failed, will retry next tick: {e}",
                    signal.kind, signal.stock_code
                );
                Some(signal)
            }
        }
    }

    /// Write the signal into the per-symbol slot, replacing any older
    /// unacted signal of equal or lower priority.
    fn publish(&self, signal: TradeSignal) {
        let mut slots = self.latest_signals.lock().expect("signal slots poisoned");
        match slots.get(&signal.stock_code) {
            Some(existing) if existing.kind.priority() > signal.kind.priority() => {
                debug!(
                    "keeping higher-priority {} over {} for {}",
                    existing.kind, signal.kind, signal.stock_code
                );
            }
            _ => {
                slots.insert(signal.stock_code.clone(), signal);
            }
        }
    }

    pub fn latest_signal(&self, stock_code: &StockCode) -> Option<TradeSignal> {
        self.latest_signals
            .lock()
            .expect("signal slots poisoned")
            .get(stock_code)
            .cloned()
    }

    fn mark_add_tier_used(&self, signal: &TradeSignal) {
        let levels = &self.config.thresholds.buy_grid_levels;
        let tier = signal
            .grid_level
            .and_then(|level| levels.iter().position(|l| (*l - level).abs() < 1e-9));
        if let Some(tier) = tier {
            self.filled_add_tiers
                .lock()
                .expect("tier map poisoned")
                .entry(signal.stock_code.clone())
                .or_default()
                .insert(tier);
        }
    }

    // ------------------------------------------------------------------
    // Broker reconciliation
    // ------------------------------------------------------------------

    /// Reconcile stored positions against broker holdings: the broker is
    /// the source of truth for volume, availability and cost; strategy
    /// flags and price peaks are preserved across the merge.
    pub fn sync_positions(&self) -> Result<()> {
        let holdings = self
            .broker
            .query_positions(&self.config.storage.account_id)?;
        let mut seen: HashSet<StockCode> = HashSet::new();

        for holding in holdings {
            seen.insert(holding.stock_code.clone());
            match self.store.get_position(&holding.stock_code)? {
                Some(mut pos) => {
                    let changed = pos.volume != holding.volume
                        || pos.available != holding.available
                        || (pos.cost_price - holding.cost_price).abs() > 1e-9;
                    if changed {
                        debug!(
                            "sync {}: volume {} -> {}, available {} -> {}",
                            holding.stock_code,
                            pos.volume,
                            holding.volume,
                            pos.available,
                            holding.available
                        );
                        pos.volume = holding.volume;
                        pos.available = holding.available;
                        pos.cost_price = holding.cost_price;
                        if pos.volume == 0 {
                            self.store.delete_position(&pos.stock_code)?;
                        } else {
                            self.store.upsert_position(&pos)?;
                        }
                    }
                }
                None if holding.volume > 0 => {
                    info!(
                        "new holding observed at broker: {} x{}",
                        holding.stock_code, holding.volume
                    );
                    self.store.upsert_position(&Position::from_holding(
                        holding.stock_code.clone(),
                        holding.volume,
                        holding.available,
                        holding.cost_price,
                        holding.cost_price,
                    ))?;
                }
                None => {}
            }
        }

        for pos in self.store.list_positions()? {
            if !seen.contains(&pos.stock_code) {
                info!(
                    "{} no longer reported by broker, removing position",
                    pos.stock_code
                );
                self.store.delete_position(&pos.stock_code)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHolding, CallbackHub, SimulatedBroker};
    use crate::market::ReplayTickProvider;
    use chrono::Utc;

    struct Harness {
        monitor: PositionMonitor,
        store: StateStore,
        broker: Arc<SimulatedBroker>,
    }

    fn temp_store() -> StateStore {
        let path = std::env::temp_dir().join(format!(
            "sentinel-monitor-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        StateStore::open(path).unwrap()
    }

    fn harness_with(mut mutate: impl FnMut(&mut Config)) -> Harness {
        let store = temp_store();
        let mut config = Config::default();
        config.core.simulation_mode = true;
        config.core.enable_auto_trading = true;
        mutate(&mut config);
        let config = Arc::new(config);

        let market = Arc::new(ReplayTickProvider::new());
        let broker = Arc::new(SimulatedBroker::new(CallbackHub::new(), false));
        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            broker.clone(),
            market.clone(),
            config.clone(),
        ));
        let grid = Arc::new(GridTradingManager::new(
            store.clone(),
            executor.clone(),
            config.clone(),
        ));
        executor.attach_grid_manager(grid.clone());
        let monitor = PositionMonitor::new(
            store.clone(),
            market,
            broker.clone(),
            grid,
            executor,
            config,
        );
        Harness {
            monitor,
            store,
            broker,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn seed(store: &StateStore, code: &StockCode, volume: i64, cost: f64) -> Position {
        let mut pos = Position::from_holding(code.clone(), volume, volume, cost, cost);
        pos.highest_price = cost;
        pos.stop_loss_price = cost * (1.0 - 0.075);
        store.upsert_position(&pos).unwrap();
        pos
    }

    fn tick(code: &StockCode, last: f64) -> Tick {
        Tick {
            stock_code: code.clone(),
            last,
            high: last,
            low: last,
            bids: vec![],
            asks: vec![],
            ts: Utc::now(),
        }
    }

    #[test]
    fn test_first_stage_breakout_then_pullback_half_sell() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        // 3% up: no breakout yet.
        assert!(h.monitor.process_tick(&tick(&code, 10.30)).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert!(!pos.profit_breakout_triggered);

        // 6% up: breakout marked, no signal.
        assert!(h.monitor.process_tick(&tick(&code, 10.60)).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert!(pos.profit_breakout_triggered);
        assert_eq!(pos.breakout_highest_price, 10.60);
        assert!(!pos.profit_triggered);

        // Peak extends.
        assert!(h.monitor.process_tick(&tick(&code, 10.80)).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert_eq!(pos.breakout_highest_price, 10.80);

        // 0.56% pullback >= 0.5%: half sell fires and fills in simulation.
        let signal = h.monitor.process_tick(&tick(&code, 10.74)).unwrap();
        assert_eq!(signal.kind, SignalKind::TakeProfitHalf);

        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert_eq!(pos.volume, 400);
        assert!(pos.profit_triggered);
    }

    #[test]
    fn test_stage_two_tier_exit() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        let mut pos = seed(&h.store, &code, 400, 10.0);
        pos.profit_triggered = true;
        pos.profit_breakout_triggered = true;
        pos.highest_price = 12.0;
        h.store.upsert_position(&pos).unwrap();

        // Peak profit 20% matches tier (0.20, 0.87): stop = 10.44.
        assert!(h.monitor.process_tick(&tick(&code, 10.90)).is_none());
        assert_eq!(h.store.get_position(&code).unwrap().unwrap().volume, 400);

        let signal = h.monitor.process_tick(&tick(&code, 10.40)).unwrap();
        assert_eq!(signal.kind, SignalKind::TakeProfitFull);
        // Full exit deletes the position.
        assert!(h.store.get_position(&code).unwrap().is_none());
    }

    #[test]
    fn test_stage_two_no_tier_matched() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        let mut pos = seed(&h.store, &code, 400, 10.0);
        pos.profit_triggered = true;
        pos.highest_price = 10.2; // peak profit 2%, below the lowest tier
        h.store.upsert_position(&pos).unwrap();

        assert!(h.monitor.process_tick(&tick(&code, 10.19)).is_none());
        assert!(h.store.get_position(&code).unwrap().is_some());
    }

    #[test]
    fn test_stop_loss_triggers_and_repairs_cached_price() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        let mut pos = seed(&h.store, &code, 1000, 10.0);
        pos.stop_loss_price = 0.0; // corrupt cache
        h.store.upsert_position(&pos).unwrap();

        let signal = h.monitor.process_tick(&tick(&code, 9.20)).unwrap();
        assert_eq!(signal.kind, SignalKind::StopLoss);
        // Position sold out entirely in simulation.
        assert!(h.store.get_position(&code).unwrap().is_none());
    }

    #[test]
    fn test_stop_loss_repair_without_trigger() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        let mut pos = seed(&h.store, &code, 1000, 10.0);
        pos.stop_loss_price = 0.0;
        h.store.upsert_position(&pos).unwrap();

        assert!(h.monitor.process_tick(&tick(&code, 9.80)).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert!((pos.stop_loss_price - 9.25).abs() < 1e-9);
    }

    #[test]
    fn test_stop_loss_validation_rejects_small_loss() {
        let h = harness_with(|config| {
            // Trigger threshold shallower than the validation floor.
            config.thresholds.stop_loss_ratio = -0.02;
        });
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        // 2.5% loss trips the configured stop but fails the 3% guardrail.
        assert!(h.monitor.process_tick(&tick(&code, 9.75)).is_none());
        assert!(h.store.get_position(&code).unwrap().is_some());
    }

    #[test]
    fn test_zero_cost_position_is_skipped() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        let mut pos = seed(&h.store, &code, 1000, 10.0);
        pos.cost_price = 0.0;
        h.store.upsert_position(&pos).unwrap();

        assert!(h.monitor.process_tick(&tick(&code, 9.0)).is_none());
    }

    #[test]
    fn test_add_position_once_per_tier() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        // 7.2% dip reaches tier 1 (0.93) and stays above the 7.5% stop.
        let signal = h.monitor.process_tick(&tick(&code, 9.28)).unwrap();
        assert_eq!(signal.kind, SignalKind::AddPosition);
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert!(pos.volume > 1000);

        // Reset the cost basis so the same tier condition holds again:
        // the tier map still blocks a second compensation buy.
        let mut pos = pos;
        let volume_after_first = pos.volume;
        pos.cost_price = 10.0;
        h.store.upsert_position(&pos).unwrap();
        assert!(h.monitor.process_tick(&tick(&code, 9.28)).is_none());
        assert_eq!(
            h.store.get_position(&code).unwrap().unwrap().volume,
            volume_after_first
        );
    }

    #[test]
    fn test_add_position_disabled_when_policy_mirrored() {
        let h = harness_with(|config| {
            // First tier dip (7%) no longer sits above the stop threshold.
            config.thresholds.stop_loss_ratio = -0.06;
        });
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        // 6.5% dip: stop-loss fires first; compensation never considered.
        let signal = h.monitor.process_tick(&tick(&code, 9.35)).unwrap();
        assert_eq!(signal.kind, SignalKind::StopLoss);
    }

    #[test]
    fn test_highest_price_tracks_tick_and_archive() {
        let h = harness();
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        let mut t = tick(&code, 10.2);
        t.high = 10.9;
        assert!(h.monitor.process_tick(&t).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert_eq!(pos.highest_price, 10.9);

        // A lower tick never shrinks the stored peak.
        assert!(h.monitor.process_tick(&tick(&code, 10.0)).is_none());
        let pos = h.store.get_position(&code).unwrap().unwrap();
        assert_eq!(pos.highest_price, 10.9);
    }

    #[test]
    fn test_signal_slot_keeps_higher_priority() {
        let h = harness();
        let code = StockCode::new("000001.SZ");

        let mut stop = TradeSignal::new(
            code.clone(),
            STRATEGY_STOP_PROFIT,
            SignalKind::StopLoss,
            9.2,
        );
        stop.cost_price = Some(10.0);
        h.monitor.publish(stop);

        let grid_buy = TradeSignal::new(code.clone(), "grid", SignalKind::GridBuy, 9.4);
        h.monitor.publish(grid_buy);

        // The unacted stop-loss outranks the grid signal.
        assert_eq!(
            h.monitor.latest_signal(&code).unwrap().kind,
            SignalKind::StopLoss
        );
    }

    #[test]
    fn test_sync_creates_updates_and_deletes() {
        let h = harness();
        let code_a = StockCode::new("000001.SZ");
        let code_b = StockCode::new("000002.SZ");
        let mut pos = seed(&h.store, &code_a, 1000, 10.0);
        pos.profit_triggered = true;
        h.store.upsert_position(&pos).unwrap();

        // Broker reports a changed A and a brand-new B.
        h.broker.set_holding(BrokerHolding {
            stock_code: code_a.clone(),
            volume: 400,
            available: 400,
            cost_price: 10.0,
        });
        h.broker.set_holding(BrokerHolding {
            stock_code: code_b.clone(),
            volume: 500,
            available: 500,
            cost_price: 20.0,
        });
        h.monitor.sync_positions().unwrap();

        let a = h.store.get_position(&code_a).unwrap().unwrap();
        assert_eq!(a.volume, 400);
        // Strategy flags survive the reconciliation.
        assert!(a.profit_triggered);
        let b = h.store.get_position(&code_b).unwrap().unwrap();
        assert_eq!(b.volume, 500);

        // Broker stops reporting A: the position is removed.
        h.broker.remove_holding(&code_a);
        h.monitor.sync_positions().unwrap();
        assert!(h.store.get_position(&code_a).unwrap().is_none());
        assert!(h.store.get_position(&code_b).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_once_records_failures_and_trips_circuit() {
        let h = harness_with(|config| {
            config.circuit_breaker.market_data_failure_threshold = 2;
        });
        let code = StockCode::new("000001.SZ");
        seed(&h.store, &code, 1000, 10.0);

        // No ticks scripted: every pass records one failure.
        h.monitor.run_once().await;
        h.monitor.run_once().await;
        assert!(h.monitor.circuit_cooldown_secs() > 0);

        // While open, passes are suppressed without touching the provider.
        h.monitor.run_once().await;
    }
}
