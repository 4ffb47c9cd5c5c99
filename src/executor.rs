//! Order lifecycle manager
//!
//! Submits sells, tracks exactly one in-flight sell per symbol, commits
//! position mutations only on confirmed fills, and covers the two failure
//! paths: a lost broker callback (sweeper queries status and drops filled
//! entries) and a broker that takes too long (cancel and re-submit).
//!
//! Lock discipline: the pending-sells map has its own mutex and is never
//! held across a store or broker call, so no lock ordering with the store
//! can invert.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerAdapter;
use crate::config::{Config, PriceMode};
use crate::errors::{Result, SentinelError};
use crate::grid::manager::GridTradingManager;
use crate::market::MarketDataProvider;
use crate::store::StateStore;
use crate::types::{
    round_down_to_lot, BrokerFill, OrderRef, SignalKind, Side, StockCode, Tick, TradeRecord,
    TradeSignal, LOT_SIZE, STRATEGY_GRID,
};

/// One tracked in-flight sell; at most one per symbol.
#[derive(Debug, Clone)]
pub struct PendingSellOrder {
    pub order_id: String,
    pub kind: SignalKind,
    pub signal: TradeSignal,
    pub volume: i64,
    pub price: f64,
    pub submit_time: DateTime<Utc>,
}

/// How a submission settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Simulation short-circuit: the order filled synchronously.
    Immediate { trade_id: String },
    /// Live submission: the order is tracked until the fill callback
    /// (or the sweeper) resolves it.
    Tracked { order_id: String },
}

impl SubmitOutcome {
    pub fn trade_id(&self) -> &str {
        match self {
            SubmitOutcome::Immediate { trade_id } => trade_id,
            SubmitOutcome::Tracked { order_id } => order_id,
        }
    }
}

pub struct OrderExecutor {
    store: StateStore,
    broker: Arc<dyn BrokerAdapter>,
    market: Arc<dyn MarketDataProvider>,
    config: Arc<Config>,
    pending: Mutex<HashMap<StockCode, PendingSellOrder>>,
    /// Late-bound to break the construction cycle with the grid manager.
    grid: Mutex<Option<Arc<GridTradingManager>>>,
    /// Runtime master switch; a fatal error flips it off in memory.
    trading_enabled: AtomicBool,
}

impl OrderExecutor {
    pub fn new(
        store: StateStore,
        broker: Arc<dyn BrokerAdapter>,
        market: Arc<dyn MarketDataProvider>,
        config: Arc<Config>,
    ) -> Self {
        let trading_enabled = config.core.enable_auto_trading;
        OrderExecutor {
            store,
            broker,
            market,
            config,
            pending: Mutex::new(HashMap::new()),
            grid: Mutex::new(None),
            trading_enabled: AtomicBool::new(trading_enabled),
        }
    }

    pub fn attach_grid_manager(&self, manager: Arc<GridTradingManager>) {
        *self.grid.lock().expect("grid handle poisoned") = Some(manager);
    }

    pub fn trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::SeqCst)
    }

    /// Stop submitting for the rest of the process lifetime (fatal downgrade).
    pub fn disable_trading(&self, why: &str) {
        if self.trading_enabled.swap(false, Ordering::SeqCst) {
            error!("auto trading disabled at runtime: {why}");
        }
    }

    pub fn has_pending(&self, stock_code: &StockCode) -> bool {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .contains_key(stock_code)
    }

    pub fn pending_for(&self, stock_code: &StockCode) -> Option<PendingSellOrder> {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .get(stock_code)
            .cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    // ------------------------------------------------------------------
    // Submit paths
    // ------------------------------------------------------------------

    /// Execute a validated monitor signal. Returns false when the signal
    /// was skipped (disabled trading, unsizable volume, pending conflict).
    pub fn execute_signal(&self, signal: &TradeSignal) -> Result<bool> {
        if !self.trading_enabled() {
            warn!(
                "auto trading disabled, ignoring {} signal for {}",
                signal.kind, signal.stock_code
            );
            return Ok(false);
        }

        match signal.kind.side() {
            Side::Sell => {
                let volume = self.size_sell(signal)?;
                if volume < LOT_SIZE {
                    warn!(
                        "{} for {} sized to {} shares (< {}), skipping",
                        signal.kind, signal.stock_code, volume, LOT_SIZE
                    );
                    return Ok(false);
                }
                self.submit_sell(signal, volume).map(|_| true)
            }
            Side::Buy => {
                let volume = signal.volume;
                if volume < LOT_SIZE {
                    warn!(
                        "{} for {} sized to {} shares (< {}), skipping",
                        signal.kind, signal.stock_code, volume, LOT_SIZE
                    );
                    return Ok(false);
                }
                self.submit_buy(signal, volume).map(|_| true)
            }
        }
    }

    /// Grid sell entry point, called by the grid manager with a sized volume.
    pub fn submit_grid_sell(&self, signal: &TradeSignal, volume: i64) -> Result<SubmitOutcome> {
        if !self.trading_enabled() {
            return Err(SentinelError::Broker("auto trading disabled".into()));
        }
        self.submit_sell(signal, volume)
    }

    /// Grid buy entry point; buys are not tracked in the pending map.
    pub fn submit_grid_buy(&self, signal: &TradeSignal, volume: i64) -> Result<SubmitOutcome> {
        if !self.trading_enabled() {
            return Err(SentinelError::Broker("auto trading disabled".into()));
        }
        self.submit_buy(signal, volume)
    }

    /// Sell sizing ladder: floor(volume x ratio) to a lot; a zero result on
    /// a sellable position rounds up to one lot; cap at the whole holding;
    /// full-exit kinds take everything sellable.
    fn size_sell(&self, signal: &TradeSignal) -> Result<i64> {
        let Some(pos) = self.store.get_position(&signal.stock_code)? else {
            warn!("no position for {} at sell time", signal.stock_code);
            return Ok(0);
        };
        if signal.volume > 0 {
            return Ok(round_down_to_lot(signal.volume.min(pos.available)));
        }
        let sellable = round_down_to_lot(pos.available.min(pos.volume));
        match signal.kind {
            SignalKind::StopLoss | SignalKind::TakeProfitFull => Ok(sellable),
            _ => {
                let ratio = signal.sell_ratio.unwrap_or(1.0);
                Ok(compute_sell_volume(pos.volume, ratio).min(sellable))
            }
        }
    }

    fn submit_sell(&self, signal: &TradeSignal, volume: i64) -> Result<SubmitOutcome> {
        let stock_code = &signal.stock_code;

        if self.has_pending(stock_code) {
            return Err(SentinelError::Broker(format!(
                "a sell is already in flight for {stock_code}"
            )));
        }

        let tick = self.market.latest_tick(stock_code).ok();
        let price = self.order_price(signal.price, tick.as_ref());
        if price <= 0.0 {
            return Err(SentinelError::Broker(format!(
                "no usable sell price for {stock_code}"
            )));
        }

        if self.config.core.simulation_mode {
            return self.simulate_sell(signal, volume, price);
        }

        let order_ref = self.broker.order_stock(
            &self.config.storage.account_id,
            stock_code,
            Side::Sell,
            price,
            volume,
            &signal.strategy,
        )?;
        let order_id = self.resolve_order_ref(order_ref);

        self.lock_shares(stock_code, volume)?;

        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(
                stock_code.clone(),
                PendingSellOrder {
                    order_id: order_id.clone(),
                    kind: signal.kind,
                    signal: signal.clone(),
                    volume,
                    price,
                    submit_time: Utc::now(),
                },
            );
        }

        self.audit(signal, Side::Sell, price, volume, &order_id);
        info!(
            "sell submitted: {} x{} @ {:.3} [{}] order={}",
            stock_code, volume, price, signal.kind, order_id
        );
        Ok(SubmitOutcome::Tracked { order_id })
    }

    fn submit_buy(&self, signal: &TradeSignal, volume: i64) -> Result<SubmitOutcome> {
        let stock_code = &signal.stock_code;
        let price = signal.price;
        if price <= 0.0 {
            return Err(SentinelError::Broker(format!(
                "no usable buy price for {stock_code}"
            )));
        }

        if self.config.core.simulation_mode {
            let trade_id = sim_order_id(Side::Buy);
            let fill = BrokerFill {
                order_id: trade_id.clone(),
                stock_code: stock_code.clone(),
                side: Side::Buy,
                traded_volume: volume,
                traded_price: price,
                traded_amount: volume as f64 * price,
                account_id: self.config.storage.account_id.clone(),
            };
            self.store.apply_buy_fill(&fill)?;
            self.audit(signal, Side::Buy, price, volume, &trade_id);
            info!(
                "[sim] buy filled: {} x{} @ {:.3} [{}] {}",
                stock_code, volume, price, signal.kind, trade_id
            );
            return Ok(SubmitOutcome::Immediate { trade_id });
        }

        let order_ref = self.broker.order_stock(
            &self.config.storage.account_id,
            stock_code,
            Side::Buy,
            price,
            volume,
            &signal.strategy,
        )?;
        let order_id = self.resolve_order_ref(order_ref);
        self.audit(signal, Side::Buy, price, volume, &order_id);
        info!(
            "buy submitted: {} x{} @ {:.3} [{}] order={}",
            stock_code, volume, price, signal.kind, order_id
        );
        Ok(SubmitOutcome::Tracked { order_id })
    }

    /// Both broker call modes are supported: the synchronous API returns
    /// the order id directly; the async API returns a sequence number that
    /// is tracked under a provisional id until `resolve_seq_no` renames it.
    fn resolve_order_ref(&self, order_ref: OrderRef) -> String {
        match order_ref {
            OrderRef::OrderId(id) => id,
            OrderRef::SeqNo(seq) => {
                if self.config.orders.use_sync_order_api {
                    warn!(
                        "broker answered seq-no {seq} although the synchronous order API was requested"
                    );
                }
                format!("SEQ_{seq}")
            }
        }
    }

    fn simulate_sell(&self, signal: &TradeSignal, volume: i64, price: f64) -> Result<SubmitOutcome> {
        let trade_id = sim_order_id(Side::Sell);
        let fill = BrokerFill {
            order_id: trade_id.clone(),
            stock_code: signal.stock_code.clone(),
            side: Side::Sell,
            traded_volume: volume,
            traded_price: price,
            traded_amount: volume as f64 * price,
            account_id: self.config.storage.account_id.clone(),
        };
        let flip = signal.kind == SignalKind::TakeProfitHalf;
        self.store.commit_sell_fill(&fill, flip)?;
        self.audit(signal, Side::Sell, price, volume, &trade_id);
        info!(
            "[sim] sell filled: {} x{} @ {:.3} [{}] {}",
            signal.stock_code, volume, price, signal.kind, trade_id
        );
        Ok(SubmitOutcome::Immediate { trade_id })
    }

    /// Compute the order price per the configured mode, falling back
    /// through bid3 -> bid1 -> last when depth is missing.
    fn order_price(&self, signal_price: f64, tick: Option<&Tick>) -> f64 {
        let last = tick.map(|t| t.last).filter(|p| *p > 0.0);
        match self.config.orders.pending_order_reorder_price_mode {
            PriceMode::Limit => signal_price,
            PriceMode::Market => last.unwrap_or(signal_price),
            PriceMode::Best => tick
                .and_then(|t| t.bid(3).or_else(|| t.bid(1)))
                .or(last)
                .unwrap_or(signal_price),
        }
    }

    /// Mark shares as locked while a sell is in flight.
    fn lock_shares(&self, stock_code: &StockCode, volume: i64) -> Result<()> {
        if let Some(mut pos) = self.store.get_position(stock_code)? {
            pos.available = (pos.available - volume).max(0);
            self.store.upsert_position(&pos)?;
        }
        Ok(())
    }

    fn unlock_shares(&self, stock_code: &StockCode, volume: i64) -> Result<()> {
        if let Some(mut pos) = self.store.get_position(stock_code)? {
            pos.available = (pos.available + volume).min(pos.volume);
            self.store.upsert_position(&pos)?;
        }
        Ok(())
    }

    fn audit(&self, signal: &TradeSignal, side: Side, price: f64, volume: i64, trade_id: &str) {
        let record = TradeRecord {
            stock_code: signal.stock_code.clone(),
            trade_type: side,
            price,
            volume,
            amount: price * volume as f64,
            trade_id: trade_id.to_string(),
            strategy: signal.strategy.clone(),
            trade_time: Utc::now(),
        };
        if let Err(e) = self.store.record_user_trade(&record) {
            warn!("trade audit append failed for {}: {e}", signal.stock_code);
        }
    }

    // ------------------------------------------------------------------
    // Fill fast path
    // ------------------------------------------------------------------

    /// Broker callback entry. Buy fills flow straight into the position;
    /// sell fills must match the tracked order id or they are not ours.
    pub fn handle_fill(&self, fill: &BrokerFill) {
        if let Err(e) = self.handle_fill_inner(fill) {
            error!("fill commit failed for order {}: {e}", fill.order_id);
        }
    }

    fn handle_fill_inner(&self, fill: &BrokerFill) -> Result<()> {
        if fill.side == Side::Buy {
            self.store.apply_buy_fill(fill)?;
            debug!(
                "buy fill applied: {} x{} @ {:.3}",
                fill.stock_code, fill.traded_volume, fill.traded_price
            );
            return Ok(());
        }

        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            let is_ours = pending
                .get(&fill.stock_code)
                .map(|e| e.order_id == fill.order_id)
                .unwrap_or(false);
            if is_ours {
                pending.remove(&fill.stock_code)
            } else {
                None
            }
        };
        let Some(entry) = entry else {
            debug!(
                "fill for untracked order {} ({}), ignoring",
                fill.order_id, fill.stock_code
            );
            return Ok(());
        };

        // Stage-one completion is the single irreversible per-position flip;
        // it must reach disk before the fill is considered handled.
        let flip = entry.kind == SignalKind::TakeProfitHalf;
        self.store.commit_sell_fill(fill, flip)?;
        if flip {
            info!(
                "first-stage take-profit committed for {}, stage two armed",
                fill.stock_code
            );
        }

        if entry.signal.strategy == STRATEGY_GRID {
            let grid = self.grid.lock().expect("grid handle poisoned").clone();
            match grid {
                Some(manager) => manager.complete_grid_sell(&entry.signal, fill),
                None => warn!(
                    "grid fill for {} arrived with no grid manager attached",
                    fill.stock_code
                ),
            }
        }
        Ok(())
    }

    /// Async order-submission mode: rename a provisional seq-no entry once
    /// the broker reports the real order id.
    pub fn resolve_seq_no(&self, seq: i64, order_id: &str) {
        let provisional = format!("SEQ_{seq}");
        let mut pending = self.pending.lock().expect("pending map poisoned");
        for entry in pending.values_mut() {
            if entry.order_id == provisional {
                debug!("resolved {provisional} -> {order_id}");
                entry.order_id = order_id.to_string();
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // Timeout slow path
    // ------------------------------------------------------------------

    /// Inspect tracked sells older than the deadline: drop the entry when
    /// the broker says the order filled (the callback was lost), otherwise
    /// cancel and optionally re-submit at a fresh quote.
    pub fn sweep_pending(&self) {
        if self.config.core.simulation_mode || !self.config.orders.pending_order_auto_cancel {
            return;
        }
        let deadline = self.config.orders.pending_timeout();
        let now = Utc::now();

        let expired: Vec<PendingSellOrder> = {
            let pending = self.pending.lock().expect("pending map poisoned");
            pending
                .values()
                .filter(|entry| {
                    (now - entry.submit_time).to_std().unwrap_or_default() >= deadline
                })
                .cloned()
                .collect()
        };

        for entry in expired {
            if let Err(e) = self.sweep_entry(&entry) {
                warn!(
                    "sweep of order {} ({}) failed: {e}",
                    entry.order_id, entry.signal.stock_code
                );
            }
        }
    }

    fn sweep_entry(&self, entry: &PendingSellOrder) -> Result<()> {
        let stock_code = &entry.signal.stock_code;
        let raw = self.broker.query_order_status(&entry.order_id)?;
        let status = crate::types::OrderStatus::from_raw(raw);

        if status == crate::types::OrderStatus::Filled {
            // The callback was lost; the next position reconciliation picks
            // up the share delta. Do not re-submit.
            info!(
                "order {} for {} already filled at broker, dropping tracker entry",
                entry.order_id, stock_code
            );
            self.remove_pending(stock_code, &entry.order_id);
            return Ok(());
        }

        info!(
            "order {} for {} pending for too long (status {:?}), cancelling",
            entry.order_id, stock_code, status
        );
        if !self.broker.cancel_order(&entry.order_id)? {
            warn!("cancel of order {} reported failure", entry.order_id);
            return Ok(());
        }
        self.remove_pending(stock_code, &entry.order_id);

        if !self.config.orders.pending_order_auto_reorder {
            self.unlock_shares(stock_code, entry.volume)?;
            return Ok(());
        }
        if entry.volume <= 0 {
            warn!("cancelled order {} carried no volume, abandoning", entry.order_id);
            return Ok(());
        }

        // Re-submit the same volume at a fresh quote.
        let tick = self.market.latest_tick(stock_code).ok();
        let price = self.order_price(entry.signal.price, tick.as_ref());
        let order_ref = self.broker.order_stock(
            &self.config.storage.account_id,
            stock_code,
            Side::Sell,
            price,
            entry.volume,
            &entry.signal.strategy,
        )?;
        let order_id = self.resolve_order_ref(order_ref);
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(
                stock_code.clone(),
                PendingSellOrder {
                    order_id: order_id.clone(),
                    kind: entry.kind,
                    signal: entry.signal.clone(),
                    volume: entry.volume,
                    price,
                    submit_time: Utc::now(),
                },
            );
        }
        self.audit(&entry.signal, Side::Sell, price, entry.volume, &order_id);
        info!(
            "reordered {} x{} @ {:.3} as {} after cancelling {}",
            stock_code, entry.volume, price, order_id, entry.order_id
        );
        Ok(())
    }

    fn remove_pending(&self, stock_code: &StockCode, order_id: &str) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        if pending
            .get(stock_code)
            .map(|e| e.order_id == order_id)
            .unwrap_or(false)
        {
            pending.remove(stock_code);
        }
    }

    /// Test/diagnostic hook: age a tracked entry so the sweeper sees it.
    #[doc(hidden)]
    pub fn backdate_pending(&self, stock_code: &StockCode, by: chrono::Duration) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        if let Some(entry) = pending.get_mut(stock_code) {
            entry.submit_time -= by;
        }
    }
}

/// floor(volume x ratio) to a lot; zero on a holding of at least one lot
/// rounds up to exactly one lot; a holding below one lot is unsellable.
pub fn compute_sell_volume(total_volume: i64, ratio: f64) -> i64 {
    if total_volume < LOT_SIZE {
        return 0;
    }
    let mut volume = round_down_to_lot((total_volume as f64 * ratio) as i64);
    if volume == 0 {
        volume = LOT_SIZE;
    }
    volume.min(round_down_to_lot(total_volume))
}

fn sim_order_id(side: Side) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("SIM_{}_{nanos}", side.as_str())
}
