//! Grid trading manager
//!
//! Owns the grid-session lifecycle: start/stop with precondition checks,
//! conservative recovery at startup, per-tick signal detection through the
//! price tracker, trade execution with sizing rules, level cooldowns, and
//! the grid rebuild around every fill.
//!
//! `start_session` runs in three phases (preconditions outside the lock, a
//! bounded-time critical section, post-work outside the lock) so that the
//! position monitor, which also holds locks while calling in here, cannot
//! deadlock against it.

use chrono::{Duration as ChronoDuration, Utc};
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{Result, SentinelError};
use crate::executor::{OrderExecutor, SubmitOutcome};
use crate::grid::session::{GridSession, StopReason};
use crate::grid::tracker::PriceTracker;
use crate::store::{GridSessionUpdate, StateStore};
use crate::types::{
    round_down_to_lot, BrokerFill, GridTrade, Side, SignalKind, StockCode, TradeSignal, LOT_SIZE,
    STRATEGY_GRID,
};

/// Fraction of `max_investment` spent per grid buy.
const BUY_TRANCHE_RATIO: f64 = 0.20;
/// Minimum currency amount for a grid buy.
const MIN_BUY_AMOUNT: f64 = 100.0;

/// User request to start a session; unset fields fall back to the named
/// template (when given) and then to the config defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct GridSessionRequest {
    /// Defaults to the position's highest observed price.
    pub center_price: Option<f64>,
    pub price_interval: Option<f64>,
    pub position_ratio: Option<f64>,
    pub callback_ratio: Option<f64>,
    /// 0 means unset; a template's `max_investment_ratio` then sizes the
    /// cap from the position's market value.
    pub max_investment: f64,
    pub max_deviation: Option<f64>,
    pub target_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub duration_days: Option<i64>,
    /// Stored grid-parameter preset to start from.
    pub template: Option<String>,
}

/// Final statistics returned when a session stops.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StopStats {
    pub stock_code: StockCode,
    pub trade_count: i64,
    pub profit_ratio: f64,
    pub stop_reason: StopReason,
}

/// Live per-session view for the CLI and the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStats {
    pub session_id: i64,
    pub stock_code: StockCode,
    pub status: String,
    pub center_price: f64,
    pub current_center_price: f64,
    pub lower_level: f64,
    pub upper_level: f64,
    pub trade_count: i64,
    pub buy_count: i64,
    pub sell_count: i64,
    pub profit_ratio: f64,
    pub grid_profit: f64,
    pub deviation_ratio: f64,
    pub current_investment: f64,
    pub max_investment: f64,
}

#[derive(Debug)]
enum TradePlan {
    Buy { volume: i64, amount: f64 },
    Sell { volume: i64, cost_price: f64 },
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<StockCode, GridSession>,
    trackers: HashMap<i64, PriceTracker>,
    cooldowns: HashMap<(i64, OrderedFloat<f64>), Instant>,
}

pub struct GridTradingManager {
    store: StateStore,
    executor: Arc<OrderExecutor>,
    config: Arc<Config>,
    state: Mutex<ManagerState>,
}

impl GridTradingManager {
    pub fn new(store: StateStore, executor: Arc<OrderExecutor>, config: Arc<Config>) -> Self {
        GridTradingManager {
            store,
            executor,
            config,
            state: Mutex::new(ManagerState::default()),
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Materialise active sessions from the DB at startup. Expired rows are
    /// stopped; the rest get a conservatively reset tracker seeded at the
    /// stored center. Never calls the broker: a session whose holding is
    /// gone is caught by the next tick's `position_cleared` exit instead.
    pub fn recover(&self) -> (usize, usize) {
        let rows = match self.store.list_active_grid_sessions() {
            Ok(rows) => rows,
            Err(e) => {
                warn!("could not enumerate active grid sessions: {e}");
                return (0, 0);
            }
        };
        info!("grid recovery: {} active session rows found", rows.len());

        let mut recovered = 0;
        let mut stopped = 0;
        let now = Utc::now();
        let mut state = self.state.lock();

        for session in rows {
            let session_id = session.id;
            let stock_code = session.stock_code.clone();

            if now > session.end_time {
                if let Err(e) = self.store.stop_grid_session(session_id, StopReason::Expired) {
                    warn!("could not expire session {session_id}: {e}");
                    continue;
                }
                state.sessions.remove(&stock_code);
                state.trackers.remove(&session_id);
                info!("session {session_id} ({stock_code}) expired during downtime, stopped");
                stopped += 1;
                continue;
            }

            let seed_price = if session.current_center_price > 0.0 {
                session.current_center_price
            } else {
                session.center_price
            };
            if seed_price <= 0.0 {
                warn!("session {session_id} ({stock_code}) has no usable center, stopping");
                let _ = self.store.stop_grid_session(session_id, StopReason::InitError);
                stopped += 1;
                continue;
            }

            state
                .trackers
                .insert(session_id, PriceTracker::seeded(session_id, seed_price));
            state.cooldowns.retain(|(sid, _), _| *sid != session_id);
            let levels = session.levels();
            info!(
                "session {session_id} ({stock_code}) restored: center {:.3}, levels [{:.3} / {:.3}], {} trades so far",
                seed_price, levels.lower, levels.upper, session.trade_count
            );
            state.sessions.insert(stock_code, session);
            recovered += 1;
        }

        info!("grid recovery complete: {recovered} restored, {stopped} stopped");
        (recovered, stopped)
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub fn start_session(
        &self,
        stock_code: &StockCode,
        request: &GridSessionRequest,
    ) -> Result<GridSession> {
        // Phase 1, outside the lock: bounded position fetch + preconditions.
        let timeout_secs = self.config.grid.grid_position_query_timeout_seconds;
        let position = self.fetch_position_bounded(stock_code, timeout_secs)?;

        let Some(position) = position.filter(|p| p.volume > 0) else {
            return Err(SentinelError::NoPosition(stock_code.to_string()));
        };
        if self.config.core.require_profit_triggered && !position.profit_triggered {
            return Err(SentinelError::ProfitNotTriggered(stock_code.to_string()));
        }

        let center_price = match request.center_price {
            Some(p) if p > 0.0 => p,
            _ if position.highest_price > 0.0 => position.highest_price,
            _ => return Err(SentinelError::InvalidCenterPrice(stock_code.to_string())),
        };
        let current_price = if position.current_price > 0.0 {
            position.current_price
        } else {
            center_price
        };

        // Parameter precedence: explicit request field, then the named
        // template, then the config defaults.
        let template = match &request.template {
            Some(name) => Some(
                self.store
                    .get_grid_template(name)?
                    .ok_or_else(|| SentinelError::TemplateNotFound(name.clone()))?,
            ),
            None => None,
        };
        let t = template.as_ref();
        let defaults = &self.config.grid;
        let max_investment = if request.max_investment > 0.0 {
            request.max_investment
        } else if let Some(t) = t {
            position.market_value() * t.max_investment_ratio
        } else {
            request.max_investment
        };

        let start_time = Utc::now();
        let end_time = start_time
            + ChronoDuration::days(
                request
                    .duration_days
                    .or(t.map(|t| t.duration_days))
                    .unwrap_or(defaults.grid_duration_days),
            );
        let mut session = GridSession::new(
            stock_code.clone(),
            center_price,
            request
                .price_interval
                .or(t.map(|t| t.price_interval))
                .unwrap_or(defaults.grid_price_interval),
            request
                .position_ratio
                .or(t.map(|t| t.position_ratio))
                .unwrap_or(defaults.grid_position_ratio),
            request
                .callback_ratio
                .or(t.map(|t| t.callback_ratio))
                .unwrap_or(defaults.grid_callback_ratio),
            max_investment,
            request
                .max_deviation
                .or(t.map(|t| t.max_deviation))
                .unwrap_or(defaults.grid_max_deviation),
            request
                .target_profit
                .or(t.map(|t| t.target_profit))
                .unwrap_or(defaults.grid_target_profit),
            request
                .stop_loss
                .or(t.map(|t| t.stop_loss))
                .unwrap_or(defaults.grid_stop_loss),
            start_time,
            end_time,
        );
        if let Some(t) = t {
            info!(
                "grid session for {stock_code} starting from template '{}' (max investment {:.2})",
                t.name, max_investment
            );
        }

        // Phase 2: bounded-time critical section.
        let lock_timeout = self.config.grid.grid_lock_acquire_timeout_seconds;
        let session = {
            let mut state = self
                .state
                .try_lock_for(Duration::from_secs(lock_timeout))
                .ok_or(SentinelError::LockTimeout(lock_timeout))?;

            if state.sessions.contains_key(stock_code) {
                return Err(SentinelError::DuplicateSession(stock_code.to_string()));
            }

            let id = self.store.create_grid_session(&session)?;
            session.id = id;
            state
                .trackers
                .insert(id, PriceTracker::seeded(id, current_price));
            state.sessions.insert(stock_code.clone(), session.clone());
            session
        };

        // Phase 3, outside the lock: observable side-effects only.
        let levels = session.levels();
        info!(
            "grid session {} started for {}: center {:.3}, levels [{:.3} / {:.3}], interval {:.1}%, max investment {:.2}, until {}",
            session.id,
            stock_code,
            session.center_price,
            levels.lower,
            levels.upper,
            session.price_interval * 100.0,
            session.max_investment,
            session.end_time.format("%Y-%m-%d %H:%M:%S"),
        );
        Ok(session)
    }

    fn fetch_position_bounded(
        &self,
        stock_code: &StockCode,
        timeout_secs: u64,
    ) -> Result<Option<crate::types::Position>> {
        let (tx, rx) = mpsc::channel();
        let store = self.store.clone();
        let code = stock_code.clone();
        std::thread::spawn(move || {
            let _ = tx.send(store.get_position(&code));
        });
        match rx.recv_timeout(Duration::from_secs(timeout_secs)) {
            Ok(result) => result,
            Err(_) => Err(SentinelError::PositionQueryTimeout(
                stock_code.to_string(),
                timeout_secs,
            )),
        }
    }

    pub fn stop_session(&self, session_id: i64, reason: StopReason) -> Result<StopStats> {
        let mut state = self.state.lock();
        self.stop_session_locked(&mut state, session_id, reason)
    }

    fn stop_session_locked(
        &self,
        state: &mut ManagerState,
        session_id: i64,
        reason: StopReason,
    ) -> Result<StopStats> {
        let stock_code = state
            .sessions
            .iter()
            .find(|(_, s)| s.id == session_id)
            .map(|(code, _)| code.clone());

        let Some(stock_code) = stock_code else {
            // Not in memory: idempotent against an already-stopped row.
            return match self.store.get_grid_session(session_id)? {
                Some(row) if !row.is_active() => Ok(StopStats {
                    stock_code: row.stock_code.clone(),
                    trade_count: row.trade_count,
                    profit_ratio: row.profit_ratio(),
                    stop_reason: row.stop_reason.unwrap_or(reason),
                }),
                Some(row) => {
                    self.store.stop_grid_session(session_id, reason)?;
                    Ok(StopStats {
                        stock_code: row.stock_code.clone(),
                        trade_count: row.trade_count,
                        profit_ratio: row.profit_ratio(),
                        stop_reason: reason,
                    })
                }
                None => Err(SentinelError::SessionNotFound(session_id)),
            };
        };

        let session = state.sessions.get(&stock_code).expect("session just found");
        info!(
            "stopping grid session {} ({}): {} trades (buy {}/sell {}), profit {:.2}%, investment {:.2}/{:.2}, reason={}",
            session_id,
            stock_code,
            session.trade_count,
            session.buy_count,
            session.sell_count,
            session.profit_ratio() * 100.0,
            session.current_investment,
            session.max_investment,
            reason,
        );

        // Flush in-memory counters before flipping the status.
        self.store.update_grid_session(
            session_id,
            &GridSessionUpdate {
                trade_count: Some(session.trade_count),
                buy_count: Some(session.buy_count),
                sell_count: Some(session.sell_count),
                total_buy_amount: Some(session.total_buy_amount),
                total_sell_amount: Some(session.total_sell_amount),
                current_investment: Some(session.current_investment),
                current_center_price: Some(session.current_center_price),
            },
        )?;
        self.store.stop_grid_session(session_id, reason)?;

        let stats = StopStats {
            stock_code: stock_code.clone(),
            trade_count: session.trade_count,
            profit_ratio: session.profit_ratio(),
            stop_reason: reason,
        };

        state.sessions.remove(&stock_code);
        state.trackers.remove(&session_id);
        state.cooldowns.retain(|(sid, _), _| *sid != session_id);

        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Per-tick signal query
    // ------------------------------------------------------------------

    /// Check exit conditions, feed the tracker, and report at most one
    /// BUY/SELL signal for this tick. A triggered exit condition stops the
    /// session and yields no signal.
    pub fn check_signals(&self, stock_code: &StockCode, current_price: f64) -> Option<TradeSignal> {
        let mut state = self.state.lock();

        let session = state.sessions.get(stock_code)?;
        if !session.is_active() {
            return None;
        }
        let session_id = session.id;

        if let Some(reason) = self.exit_condition(session) {
            info!("grid session {session_id} ({stock_code}) exit: {reason}");
            if let Err(e) = self.stop_session_locked(&mut state, session_id, reason) {
                warn!("failed to stop session {session_id}: {e}");
            }
            return None;
        }

        let session = state.sessions.get(stock_code)?.clone();
        let levels = session.levels();
        let cooldown_secs = self.config.grid.grid_level_cooldown_seconds;

        let waiting = {
            let tracker = state.trackers.get_mut(&session_id)?;
            tracker.update_price(current_price);
            tracker.waiting_callback
        };

        // Level crossings are strict: a price equal to the level does not
        // arm, which stabilises behaviour at the exact threshold.
        if !waiting {
            if current_price > levels.upper {
                if Self::level_cooled(&state.cooldowns, session_id, levels.upper, cooldown_secs) {
                    debug!("sell level {:.3} in cooldown for session {session_id}", levels.upper);
                } else {
                    let tracker = state.trackers.get_mut(&session_id)?;
                    tracker.arm_rising(levels.upper, current_price);
                    info!(
                        "{stock_code} crossed sell level {:.3} at {:.3}, waiting {:.2}% pullback",
                        levels.upper,
                        current_price,
                        session.callback_ratio * 100.0
                    );
                }
            } else if current_price < levels.lower {
                if Self::level_cooled(&state.cooldowns, session_id, levels.lower, cooldown_secs) {
                    debug!("buy level {:.3} in cooldown for session {session_id}", levels.lower);
                } else {
                    let tracker = state.trackers.get_mut(&session_id)?;
                    tracker.arm_falling(levels.lower, current_price);
                    info!(
                        "{stock_code} crossed buy level {:.3} at {:.3}, waiting {:.2}% bounce",
                        levels.lower,
                        current_price,
                        session.callback_ratio * 100.0
                    );
                }
            }
        }

        let tracker = state.trackers.get(&session_id)?;
        let side = tracker.check_callback(session.callback_ratio)?;

        let mut signal = TradeSignal::new(
            stock_code.clone(),
            STRATEGY_GRID,
            match side {
                Side::Sell => SignalKind::GridSell,
                Side::Buy => SignalKind::GridBuy,
            },
            current_price,
        );
        signal.session_id = Some(session_id);
        signal.grid_level = tracker.crossed_level;
        signal.callback_ratio = Some(tracker.observed_callback_ratio());
        match side {
            Side::Sell => signal.peak_price = Some(tracker.peak_price),
            Side::Buy => signal.valley_price = Some(tracker.valley_price),
        }
        info!(
            "grid {} signal for {stock_code}: level {:.3}, trigger {:.3}, callback {:.2}%",
            signal.kind,
            signal.grid_level.unwrap_or(0.0),
            current_price,
            signal.callback_ratio.unwrap_or(0.0) * 100.0
        );
        Some(signal)
    }

    /// Exit priority: deviation, target profit, stop loss, expiry, cleared
    /// position. Profit exits require at least one buy and one sell so a
    /// one-sided session cannot exit on paper figures.
    fn exit_condition(&self, session: &GridSession) -> Option<StopReason> {
        if session.deviation_ratio() > session.max_deviation {
            return Some(StopReason::Deviation);
        }
        if session.buy_count > 0 && session.sell_count > 0 {
            let ratio = session.profit_ratio();
            if ratio >= session.target_profit {
                return Some(StopReason::TargetProfit);
            }
            if ratio <= session.stop_loss {
                return Some(StopReason::StopLoss);
            }
        }
        if Utc::now() > session.end_time {
            return Some(StopReason::Expired);
        }
        match self.store.get_position(&session.stock_code) {
            Ok(Some(pos)) if pos.volume > 0 => None,
            Ok(_) => Some(StopReason::PositionCleared),
            Err(e) => {
                warn!("position check failed for {}: {e}", session.stock_code);
                None
            }
        }
    }

    fn level_cooled(
        cooldowns: &HashMap<(i64, OrderedFloat<f64>), Instant>,
        session_id: i64,
        level: f64,
        cooldown_secs: u64,
    ) -> bool {
        cooldowns
            .get(&(session_id, OrderedFloat(level)))
            .map(|at| at.elapsed() < Duration::from_secs(cooldown_secs))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Trade execution
    // ------------------------------------------------------------------

    /// Execute a grid signal: size the trade under the lock, submit outside
    /// it, then book the result. Sell bookkeeping waits for the broker fill
    /// when the order is tracked; in simulation accept and fill coincide.
    /// Returns false when the trade was skipped by a sizing rule.
    pub fn execute_trade(&self, signal: &TradeSignal) -> Result<bool> {
        let mut signal = signal.clone();

        // Phase 1: plan under the lock.
        let plan = {
            let state = self.state.lock();
            let Some(session) = state.sessions.get(&signal.stock_code) else {
                warn!("no active session for {} at execute time", signal.stock_code);
                return Ok(false);
            };
            match signal.kind {
                SignalKind::GridBuy => self.plan_buy(session, &signal),
                SignalKind::GridSell => self.plan_sell(session, &mut signal)?,
                _ => {
                    warn!("{} is not a grid signal kind", signal.kind);
                    return Ok(false);
                }
            }
        };
        let Some(plan) = plan else {
            return Ok(false);
        };

        // Phase 2: submit without holding the lock.
        let outcome = match &plan {
            TradePlan::Buy { volume, .. } => self.executor.submit_grid_buy(&signal, *volume),
            TradePlan::Sell { volume, .. } => self.executor.submit_grid_sell(&signal, *volume),
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "grid {} submission failed for {}: {e}",
                    signal.kind, signal.stock_code
                );
                return Ok(false);
            }
        };

        // Phase 3: cooldown plus bookkeeping where it is already due.
        if let Some(level) = signal.grid_level {
            let session_id = signal.session_id.unwrap_or_default();
            self.state
                .lock()
                .cooldowns
                .insert((session_id, OrderedFloat(level)), Instant::now());
        }

        match (plan, outcome) {
            (TradePlan::Buy { volume, amount }, outcome) => {
                // Buys commit at broker accept.
                self.book_buy(&signal, volume, amount, outcome.trade_id());
            }
            (TradePlan::Sell { volume, cost_price }, SubmitOutcome::Immediate { trade_id }) => {
                self.book_sell(&signal, volume, signal.price, cost_price, &trade_id);
            }
            (TradePlan::Sell { .. }, SubmitOutcome::Tracked { order_id }) => {
                // Bookkeeping completes in `complete_grid_sell` once the
                // broker confirms the fill.
                debug!(
                    "grid sell {} for {} tracked, bookkeeping deferred to fill",
                    order_id, signal.stock_code
                );
            }
        }
        Ok(true)
    }

    fn plan_buy(&self, session: &GridSession, signal: &TradeSignal) -> Option<TradePlan> {
        if session.max_investment <= 0.0 {
            warn!(
                "session {} has max_investment {:.2}, buy rejected",
                session.id, session.max_investment
            );
            return None;
        }
        if session.current_investment >= session.max_investment {
            warn!(
                "session {} at investment cap {:.2}, skipping buy",
                session.id, session.max_investment
            );
            return None;
        }
        let remaining = session.max_investment - session.current_investment;
        let buy_amount = remaining.min(session.max_investment * BUY_TRANCHE_RATIO);
        if buy_amount < MIN_BUY_AMOUNT {
            warn!(
                "session {} buy amount {:.2} below minimum, skipping",
                session.id, buy_amount
            );
            return None;
        }
        let volume = round_down_to_lot((buy_amount / signal.price) as i64);
        if volume < LOT_SIZE {
            warn!(
                "session {} buy sized to {} shares at {:.3}, skipping",
                session.id, volume, signal.price
            );
            return None;
        }
        let amount = volume as f64 * signal.price;
        Some(TradePlan::Buy { volume, amount })
    }

    fn plan_sell(
        &self,
        session: &GridSession,
        signal: &mut TradeSignal,
    ) -> Result<Option<TradePlan>> {
        let Some(position) = self.store.get_position(&signal.stock_code)? else {
            warn!("{} holds no position, grid sell rejected", signal.stock_code);
            return Ok(None);
        };
        if position.volume == 0 {
            warn!("{} volume is 0, grid sell rejected", signal.stock_code);
            return Ok(None);
        }

        let mut volume = round_down_to_lot((position.volume as f64 * session.position_ratio) as i64);
        if volume == 0 {
            volume = LOT_SIZE;
        }
        if volume > position.volume {
            volume = round_down_to_lot(position.volume);
        }
        if volume < LOT_SIZE {
            warn!(
                "{} sellable volume below one lot ({}), grid sell rejected",
                signal.stock_code, position.volume
            );
            return Ok(None);
        }

        // Carried in the signal so the deferred fill path can release the
        // session's invested base at the original cost.
        signal.cost_price = Some(position.cost_price);
        signal.volume = volume;
        Ok(Some(TradePlan::Sell {
            volume,
            cost_price: position.cost_price,
        }))
    }

    /// Fill-callback entry from the order lifecycle manager: complete the
    /// bookkeeping for a tracked grid sell.
    pub fn complete_grid_sell(&self, signal: &TradeSignal, fill: &BrokerFill) {
        let cost_price = signal.cost_price.unwrap_or(fill.traded_price);
        self.book_sell(
            signal,
            fill.traded_volume,
            fill.traded_price,
            cost_price,
            &fill.order_id,
        );
    }

    fn book_buy(&self, signal: &TradeSignal, volume: i64, amount: f64, trade_id: &str) {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&signal.stock_code) else {
            warn!("buy fill for {} but session is gone", signal.stock_code);
            return;
        };
        session.trade_count += 1;
        session.buy_count += 1;
        session.total_buy_amount += amount;
        session.current_investment += amount;

        let center_before = session.current_center_price;
        let session_snapshot = session.clone();
        drop(state);

        self.record_and_rebuild(
            &session_snapshot,
            signal,
            Side::Buy,
            volume,
            amount,
            signal.price,
            center_before,
            trade_id,
        );
        info!(
            "grid buy booked: {} x{} @ {:.3}, investment {:.2}/{:.2}",
            signal.stock_code,
            volume,
            signal.price,
            session_snapshot.current_investment,
            session_snapshot.max_investment
        );
    }

    fn book_sell(
        &self,
        signal: &TradeSignal,
        volume: i64,
        price: f64,
        cost_price: f64,
        trade_id: &str,
    ) {
        let amount = volume as f64 * price;
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(&signal.stock_code) else {
            warn!("sell fill for {} but session is gone", signal.stock_code);
            return;
        };
        session.trade_count += 1;
        session.sell_count += 1;
        session.total_sell_amount += amount;
        // Selling releases invested base at cost, floored at zero.
        let recovered = (volume as f64 * cost_price).min(session.current_investment);
        session.current_investment -= recovered;

        let center_before = session.current_center_price;
        let session_snapshot = session.clone();
        drop(state);

        self.record_and_rebuild(
            &session_snapshot,
            signal,
            Side::Sell,
            volume,
            amount,
            price,
            center_before,
            trade_id,
        );
        info!(
            "grid sell booked: {} x{} @ {:.3}, session profit {:.2}%",
            signal.stock_code,
            volume,
            price,
            session_snapshot.profit_ratio() * 100.0
        );
    }

    /// Persist the trade row and counters, then rebuild the grid around the
    /// fill price: the session trades symmetrically around the last fill.
    #[allow(clippy::too_many_arguments)]
    fn record_and_rebuild(
        &self,
        session: &GridSession,
        signal: &TradeSignal,
        side: Side,
        volume: i64,
        amount: f64,
        fill_price: f64,
        center_before: f64,
        trade_id: &str,
    ) {
        let trade = GridTrade {
            id: None,
            session_id: session.id,
            stock_code: signal.stock_code.clone(),
            trade_type: side,
            grid_level: signal.grid_level.unwrap_or(center_before),
            trigger_price: fill_price,
            volume,
            amount,
            peak_price: signal.peak_price,
            valley_price: signal.valley_price,
            callback_ratio: signal.callback_ratio,
            trade_id: trade_id.to_string(),
            trade_time: Utc::now(),
            grid_center_before: center_before,
            grid_center_after: fill_price,
        };
        if let Err(e) = self.store.record_grid_trade(&trade) {
            warn!("grid trade log append failed: {e}");
        }

        if let Err(e) = self.store.update_grid_session(
            session.id,
            &GridSessionUpdate {
                trade_count: Some(session.trade_count),
                buy_count: Some(session.buy_count),
                sell_count: Some(session.sell_count),
                total_buy_amount: Some(session.total_buy_amount),
                total_sell_amount: Some(session.total_sell_amount),
                current_investment: Some(session.current_investment),
                current_center_price: Some(fill_price),
            },
        ) {
            warn!("grid session update failed: {e}");
        }

        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(&signal.stock_code) {
            session.current_center_price = fill_price;
            let levels = session.levels();
            info!(
                "grid rebuilt for {}: center {:.3} -> {:.3}, levels [{:.3} / {:.3}]",
                signal.stock_code, center_before, fill_price, levels.lower, levels.upper
            );
        }
        if let Some(tracker) = state.trackers.get_mut(&session.id) {
            tracker.reset(fill_price);
        }
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn has_session(&self, stock_code: &StockCode) -> bool {
        self.state.lock().sessions.contains_key(stock_code)
    }

    pub fn active_session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn session_stats(&self, session_id: i64) -> Option<SessionStats> {
        let state = self.state.lock();
        let session = state.sessions.values().find(|s| s.id == session_id)?;
        let levels = session.levels();
        Some(SessionStats {
            session_id: session.id,
            stock_code: session.stock_code.clone(),
            status: session.status.clone(),
            center_price: session.center_price,
            current_center_price: session.current_center_price,
            lower_level: levels.lower,
            upper_level: levels.upper,
            trade_count: session.trade_count,
            buy_count: session.buy_count,
            sell_count: session.sell_count,
            profit_ratio: session.profit_ratio(),
            grid_profit: session.grid_profit(),
            deviation_ratio: session.deviation_ratio(),
            current_investment: session.current_investment,
            max_investment: session.max_investment,
        })
    }

    pub fn trade_history(&self, session_id: i64, limit: i64, offset: i64) -> Result<Vec<GridTrade>> {
        self.store.get_grid_trades(session_id, limit, offset)
    }

    /// Active session id for a symbol, if any.
    pub fn session_id_for(&self, stock_code: &StockCode) -> Option<i64> {
        self.state.lock().sessions.get(stock_code).map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{CallbackHub, SimulatedBroker};
    use crate::market::ReplayTickProvider;
    use crate::types::{Position, Tick};

    fn temp_store() -> StateStore {
        let path = std::env::temp_dir().join(format!(
            "sentinel-grid-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        StateStore::open(path).unwrap()
    }

    fn build(store: StateStore) -> (Arc<GridTradingManager>, Arc<ReplayTickProvider>) {
        let mut config = Config::default();
        config.core.simulation_mode = true;
        config.core.enable_auto_trading = true;
        let config = Arc::new(config);
        let market = Arc::new(ReplayTickProvider::new());
        let broker = Arc::new(SimulatedBroker::new(CallbackHub::new(), false));
        let executor = Arc::new(OrderExecutor::new(
            store.clone(),
            broker,
            market.clone(),
            config.clone(),
        ));
        let manager = Arc::new(GridTradingManager::new(store, executor.clone(), config));
        executor.attach_grid_manager(manager.clone());
        (manager, market)
    }

    fn seed_position(store: &StateStore, code: &StockCode, volume: i64, profit_triggered: bool) {
        let mut pos = Position::from_holding(code.clone(), volume, volume, 10.0, 10.0);
        pos.highest_price = 10.0;
        pos.profit_triggered = profit_triggered;
        pos.profit_breakout_triggered = profit_triggered;
        store.upsert_position(&pos).unwrap();
    }

    fn request(max_investment: f64) -> GridSessionRequest {
        GridSessionRequest {
            max_investment,
            ..Default::default()
        }
    }

    fn push_tick(market: &ReplayTickProvider, code: &StockCode, last: f64) {
        market.push_tick(Tick {
            stock_code: code.clone(),
            last,
            high: last,
            low: last,
            bids: vec![],
            asks: vec![],
            ts: Utc::now(),
        });
    }

    #[test]
    fn test_start_requires_position() {
        let store = temp_store();
        let (manager, _) = build(store);
        let code = StockCode::new("000001.SZ");
        let err = manager.start_session(&code, &request(10_000.0)).unwrap_err();
        assert_eq!(err.reason_code(), "no_position");
    }

    #[test]
    fn test_start_requires_profit_triggered() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, false);
        let (manager, _) = build(store);
        let err = manager.start_session(&code, &request(10_000.0)).unwrap_err();
        assert_eq!(err.reason_code(), "profit_not_triggered");
    }

    #[test]
    fn test_start_requires_center_price() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        let mut pos = Position::from_holding(code.clone(), 1000, 1000, 10.0, 0.0);
        pos.highest_price = 0.0;
        pos.profit_triggered = true;
        store.upsert_position(&pos).unwrap();
        let (manager, _) = build(store);
        let err = manager.start_session(&code, &request(10_000.0)).unwrap_err();
        assert_eq!(err.reason_code(), "invalid_center_price");
    }

    #[test]
    fn test_start_rejects_duplicate() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        manager.start_session(&code, &request(10_000.0)).unwrap();
        let err = manager.start_session(&code, &request(10_000.0)).unwrap_err();
        assert_eq!(err.reason_code(), "duplicate_session");
    }

    #[test]
    fn test_center_defaults_to_highest_price() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        let mut pos = Position::from_holding(code.clone(), 1000, 1000, 10.0, 10.2);
        pos.highest_price = 11.4;
        pos.profit_triggered = true;
        store.upsert_position(&pos).unwrap();
        let (manager, _) = build(store);
        let session = manager.start_session(&code, &request(10_000.0)).unwrap();
        assert_eq!(session.center_price, 11.4);
    }

    #[test]
    fn test_start_from_template() {
        use crate::grid::session::GridTemplate;

        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        let mut pos = Position::from_holding(code.clone(), 1000, 1000, 10.0, 10.0);
        pos.highest_price = 10.0;
        pos.profit_triggered = true;
        pos.profit_breakout_triggered = true;
        store.upsert_position(&pos).unwrap();

        let mut template = GridTemplate::new("aggressive");
        template.price_interval = 0.03;
        template.callback_ratio = 0.003;
        template.duration_days = 3;
        template.max_investment_ratio = 0.5;
        store.save_grid_template(&template).unwrap();

        let (manager, _) = build(store);
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    template: Some("aggressive".into()),
                    // Explicit fields still win over the template.
                    position_ratio: Some(0.40),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(session.price_interval, 0.03);
        assert_eq!(session.callback_ratio, 0.003);
        assert_eq!(session.position_ratio, 0.40);
        // Unset cap: half the position's market value (1000 x 10.0 x 0.5).
        assert!((session.max_investment - 5_000.0).abs() < 1e-9);
        let days = (session.end_time - session.start_time).num_days();
        assert_eq!(days, 3);
    }

    #[test]
    fn test_start_with_unknown_template() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let err = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    template: Some("no-such-preset".into()),
                    ..request(10_000.0)
                },
            )
            .unwrap_err();
        assert_eq!(err.reason_code(), "template_not_found");
    }

    #[test]
    fn test_no_arming_at_exact_level() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();
        let upper = session.levels().upper;
        assert!((upper - 10.5).abs() < 1e-9);

        // Exactly at the level: no transition (strict comparison).
        assert!(manager.check_signals(&code, upper).is_none());
        {
            let state = manager.state.lock();
            assert!(!state.trackers.get(&session.id).unwrap().waiting_callback);
        }
        // Strictly above: arms, but no signal yet.
        assert!(manager.check_signals(&code, 10.51).is_none());
        // A pullback beyond the callback ratio fires.
        let signal = manager.check_signals(&code, 10.45).unwrap();
        assert_eq!(signal.kind, SignalKind::GridSell);
    }

    #[test]
    fn test_oscillation_sell_then_buy() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store.clone());
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();

        // Climb through the upper level and pull back.
        for price in [10.0, 10.2, 10.4] {
            assert!(manager.check_signals(&code, price).is_none());
        }
        assert!(manager.check_signals(&code, 10.60).is_none()); // crossed, armed
        assert!(manager.check_signals(&code, 10.70).is_none()); // peak extends
        let sell = manager.check_signals(&code, 10.545).unwrap();
        assert_eq!(sell.kind, SignalKind::GridSell);
        assert_eq!(sell.peak_price, Some(10.70));
        assert!(manager.execute_trade(&sell).unwrap());

        // 25% of 1000 shares, one lot granularity.
        let pos = store.get_position(&code).unwrap().unwrap();
        assert_eq!(pos.volume, 800);

        let stats = manager.session_stats(session.id).unwrap();
        assert_eq!(stats.sell_count, 1);
        assert!((stats.current_center_price - 10.545).abs() < 1e-9);
        assert!((stats.upper_level - 10.545 * 1.05).abs() < 1e-9);

        // Descend through the new lower level and bounce.
        let lower = 10.545 * 0.95;
        assert!(manager.check_signals(&code, 10.30).is_none());
        assert!(manager.check_signals(&code, lower - 0.6).is_none()); // crossed
        assert!(manager.check_signals(&code, 9.35).is_none()); // valley extends
        let buy = manager.check_signals(&code, 9.397).unwrap();
        assert_eq!(buy.kind, SignalKind::GridBuy);
        assert_eq!(buy.valley_price, Some(9.35));
        assert!(manager.execute_trade(&buy).unwrap());

        let stats = manager.session_stats(session.id).unwrap();
        assert_eq!(stats.buy_count, 1);
        assert_eq!(stats.trade_count, 2);
        // Buy tranche: min(10000, 10000 x 0.2) = 2000 -> 200 shares at 9.397.
        let trades = manager.trade_history(session.id, 10, 0).unwrap();
        let buy_trade = trades.iter().find(|t| t.trade_type == Side::Buy).unwrap();
        assert_eq!(buy_trade.volume, 200);
    }

    #[test]
    fn test_level_cooldown_blocks_rearm() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();
        let upper = session.levels().upper;

        // Put the sell level in cooldown, then cross it: no arming.
        {
            let mut state = manager.state.lock();
            state
                .cooldowns
                .insert((session.id, OrderedFloat(upper)), Instant::now());
        }
        assert!(manager.check_signals(&code, upper + 0.1).is_none());
        {
            let state = manager.state.lock();
            assert!(!state.trackers.get(&session.id).unwrap().waiting_callback);
        }

        // Once the cooldown entry is gone, the same crossing arms.
        {
            let mut state = manager.state.lock();
            state.cooldowns.clear();
        }
        assert!(manager.check_signals(&code, upper + 0.1).is_none());
        {
            let state = manager.state.lock();
            assert!(state.trackers.get(&session.id).unwrap().waiting_callback);
        }
    }

    #[test]
    fn test_exit_deviation() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store.clone());
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();

        // Drift the center past the 15% deviation cap.
        {
            let mut state = manager.state.lock();
            state
                .sessions
                .get_mut(&code)
                .unwrap()
                .current_center_price = 11.6;
        }
        assert!(manager.check_signals(&code, 11.6).is_none());
        assert!(!manager.has_session(&code));
        let row = store.get_grid_session(session.id).unwrap().unwrap();
        assert_eq!(row.stop_reason, Some(StopReason::Deviation));
    }

    #[test]
    fn test_exit_target_profit_requires_both_counts() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store.clone());
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();

        // One-sided stats above target: no exit.
        {
            let mut state = manager.state.lock();
            let s = state.sessions.get_mut(&code).unwrap();
            s.sell_count = 2;
            s.trade_count = 2;
            s.total_sell_amount = 3_600.0;
        }
        assert!(manager.has_session(&code));
        manager.check_signals(&code, 10.0);
        assert!(manager.has_session(&code));

        // Paired stats at 11% vs 10% target: exit.
        {
            let mut state = manager.state.lock();
            let s = state.sessions.get_mut(&code).unwrap();
            s.buy_count = 1;
            s.total_buy_amount = 2_500.0;
        }
        manager.check_signals(&code, 10.0);
        assert!(!manager.has_session(&code));
        let row = store.get_grid_session(session.id).unwrap().unwrap();
        assert_eq!(row.stop_reason, Some(StopReason::TargetProfit));
        // Counters were flushed before the stop.
        assert_eq!(row.total_sell_amount, 3_600.0);
    }

    #[test]
    fn test_exit_position_cleared() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store.clone());
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();

        store.delete_position(&code).unwrap();
        assert!(manager.check_signals(&code, 10.0).is_none());
        assert!(!manager.has_session(&code));
        let row = store.get_grid_session(session.id).unwrap().unwrap();
        assert_eq!(row.stop_reason, Some(StopReason::PositionCleared));
    }

    #[test]
    fn test_stop_idempotent_returns_original_reason() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let session = manager.start_session(&code, &request(10_000.0)).unwrap();

        let first = manager
            .stop_session(session.id, StopReason::UserRequested)
            .unwrap();
        assert_eq!(first.stop_reason, StopReason::UserRequested);

        let second = manager.stop_session(session.id, StopReason::Expired).unwrap();
        assert_eq!(second.stop_reason, StopReason::UserRequested);
    }

    #[test]
    fn test_recover_restores_and_expires() {
        let store = temp_store();
        let code_a = StockCode::new("000001.SZ");
        let code_b = StockCode::new("000002.SZ");
        seed_position(&store, &code_a, 1000, true);
        seed_position(&store, &code_b, 1000, true);

        // A: future end time. B: already past.
        let mut a = GridSession::new(
            code_a.clone(), 10.0, 0.05, 0.25, 0.005, 10_000.0, 0.15, 0.10, -0.10,
            Utc::now(), Utc::now() + ChronoDuration::days(5),
        );
        a.current_center_price = 10.3;
        let a_id = store.create_grid_session(&a).unwrap();
        let b = GridSession::new(
            code_b.clone(), 20.0, 0.05, 0.25, 0.005, 10_000.0, 0.15, 0.10, -0.10,
            Utc::now() - ChronoDuration::days(10), Utc::now() - ChronoDuration::days(3),
        );
        let b_id = store.create_grid_session(&b).unwrap();

        let (manager, _) = build(store.clone());
        let (recovered, stopped) = manager.recover();
        assert_eq!(recovered, 1);
        assert_eq!(stopped, 1);

        assert!(manager.has_session(&code_a));
        assert!(!manager.has_session(&code_b));
        let b_row = store.get_grid_session(b_id).unwrap().unwrap();
        assert_eq!(b_row.stop_reason, Some(StopReason::Expired));

        // Tracker reset at the stored drifting center.
        let state = manager.state.lock();
        let tracker = state.trackers.get(&a_id).unwrap();
        assert_eq!(tracker.last_price, 10.3);
        assert!(!tracker.waiting_callback);
    }

    #[test]
    fn test_buy_rejected_below_minimum_amount() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();
        // 50 currency units of headroom left: below the 100 minimum.
        {
            let mut state = manager.state.lock();
            state.sessions.get_mut(&code).unwrap().current_investment = 9_950.0;
        }
        let mut signal = TradeSignal::new(code.clone(), STRATEGY_GRID, SignalKind::GridBuy, 9.4);
        signal.session_id = Some(session.id);
        signal.grid_level = Some(9.5);
        assert!(!manager.execute_trade(&signal).unwrap());
        // Counters untouched by the rejected buy.
        assert_eq!(manager.session_stats(session.id).unwrap().buy_count, 0);
    }

    #[test]
    fn test_buy_rejected_when_investment_capped() {
        let store = temp_store();
        let code = StockCode::new("000001.SZ");
        seed_position(&store, &code, 1000, true);
        let (manager, _) = build(store);
        let session = manager
            .start_session(
                &code,
                &GridSessionRequest {
                    center_price: Some(10.0),
                    ..request(10_000.0)
                },
            )
            .unwrap();
        {
            let mut state = manager.state.lock();
            state.sessions.get_mut(&code).unwrap().current_investment = 10_000.0;
        }
        let mut signal = TradeSignal::new(code.clone(), STRATEGY_GRID, SignalKind::GridBuy, 9.4);
        signal.session_id = Some(session.id);
        signal.grid_level = Some(9.5);
        assert!(!manager.execute_trade(&signal).unwrap());
    }
}
