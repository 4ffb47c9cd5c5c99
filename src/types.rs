//! Core data types used across the trading daemon

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strategy tag carried on stop-profit / stop-loss signals and their orders.
pub const STRATEGY_STOP_PROFIT: &str = "stop_profit";
/// Strategy tag carried on grid signals and their orders.
pub const STRATEGY_GRID: &str = "grid";

/// Round lot size: all order volumes are multiples of this.
pub const LOT_SIZE: i64 = 100;

/// Market-qualified stock code using Arc<str> for cheap cloning
///
/// Codes are cloned on every signal, order and position snapshot.
/// Using Arc<str> instead of String reduces heap allocations from O(n) to O(1) per clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockCode(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl StockCode {
    pub fn new(s: impl AsRef<str>) -> Self {
        StockCode(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Stable string form used in the DB and in broker order tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One level of quote depth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuoteLevel {
    pub price: f64,
    pub volume: i64,
}

/// Latest market tick with depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub stock_code: StockCode,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    /// Bid side, best first (bid1 at index 0).
    pub bids: Vec<QuoteLevel>,
    /// Ask side, best first.
    pub asks: Vec<QuoteLevel>,
    pub ts: DateTime<Utc>,
}

impl Tick {
    /// Bid price N levels deep (1-based), if present and positive.
    pub fn bid(&self, depth: usize) -> Option<f64> {
        debug_assert!(depth >= 1);
        self.bids
            .get(depth - 1)
            .map(|l| l.price)
            .filter(|p| *p > 0.0)
    }
}

/// Daily OHLC bar, used for highest-price bootstrapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    pub date: chrono::NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Durable record of one held symbol and its cost basis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub stock_code: StockCode,
    #[serde(default)]
    pub stock_name: String,
    /// Total shares held.
    pub volume: i64,
    /// Shares free to sell; the rest are locked by pending sells.
    pub available: i64,
    pub cost_price: f64,
    pub current_price: f64,
    pub open_date: DateTime<Utc>,
    /// Highest price ever observed since the position opened.
    pub highest_price: f64,
    /// True iff the first-stage take-profit (half sell) has committed.
    pub profit_triggered: bool,
    /// True iff price once breached the first-stage threshold.
    pub profit_breakout_triggered: bool,
    /// Highest price seen after the breakout was marked.
    pub breakout_highest_price: f64,
    /// Cached stop-loss level; recomputed when outside the sanity band.
    pub stop_loss_price: f64,
}

impl Position {
    /// Fresh position as first observed from a broker holding.
    pub fn from_holding(
        stock_code: StockCode,
        volume: i64,
        available: i64,
        cost_price: f64,
        current_price: f64,
    ) -> Self {
        Position {
            stock_code,
            stock_name: String::new(),
            volume,
            available,
            cost_price,
            current_price,
            open_date: Utc::now(),
            highest_price: current_price.max(cost_price),
            profit_triggered: false,
            profit_breakout_triggered: false,
            breakout_highest_price: 0.0,
            stop_loss_price: 0.0,
        }
    }

    /// A position with zero volume is logically closed.
    pub fn is_closed(&self) -> bool {
        self.volume <= 0
    }

    pub fn market_value(&self) -> f64 {
        self.volume as f64 * self.current_price
    }

    /// (current - cost) / cost; 0.0 when cost is unusable.
    pub fn profit_ratio(&self) -> f64 {
        if self.cost_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.cost_price) / self.cost_price
    }
}

/// Kind of actionable signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    StopLoss,
    TakeProfitHalf,
    TakeProfitFull,
    AddPosition,
    GridBuy,
    GridSell,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::StopLoss => "stop_loss",
            SignalKind::TakeProfitHalf => "take_profit_half",
            SignalKind::TakeProfitFull => "take_profit_full",
            SignalKind::AddPosition => "add_position",
            SignalKind::GridBuy => "BUY",
            SignalKind::GridSell => "SELL",
        }
    }

    pub fn side(&self) -> Side {
        match self {
            SignalKind::AddPosition | SignalKind::GridBuy => Side::Buy,
            _ => Side::Sell,
        }
    }

    /// Priority for the per-symbol latest-signal slot; higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            SignalKind::StopLoss => 4,
            SignalKind::TakeProfitFull => 3,
            SignalKind::TakeProfitHalf => 2,
            SignalKind::GridBuy | SignalKind::GridSell => 1,
            SignalKind::AddPosition => 0,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actionable signal emitted by the monitor or the grid manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub stock_code: StockCode,
    /// `stop_profit` or `grid`.
    pub strategy: String,
    pub kind: SignalKind,
    /// Planned execution price (the trigger price).
    pub price: f64,
    /// Planned share count; 0 when sizing is deferred to execution.
    pub volume: i64,
    /// Fraction of the holding to sell (first-stage take-profit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valley_price: Option<f64>,
    /// Observed pullback / bounce ratio at emit time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_ratio: Option<f64>,
    /// Cost basis captured at signal time; overrides a bad stored cost of 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TradeSignal {
    pub fn new(stock_code: StockCode, strategy: &str, kind: SignalKind, price: f64) -> Self {
        TradeSignal {
            stock_code,
            strategy: strategy.to_string(),
            kind,
            price,
            volume: 0,
            sell_ratio: None,
            session_id: None,
            grid_level: None,
            peak_price: None,
            valley_price: None,
            callback_ratio: None,
            cost_price: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// Reference returned by a broker order submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    /// Synchronous call mode: the order id is known immediately.
    OrderId(String),
    /// Asynchronous call mode: a sequence number resolved to an order id later.
    SeqNo(i64),
}

/// Normalised broker order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// Translate the broker-native status numeric into the normalised enum.
    ///
    /// The raw codes are opaque to the rest of the daemon; this table is
    /// the only place that knows them (56 = fully traded, etc.).
    pub fn from_raw(code: i32) -> OrderStatus {
        match code {
            48..=51 => OrderStatus::Submitted,
            52 | 55 => OrderStatus::Partial,
            56 => OrderStatus::Filled,
            53 | 54 => OrderStatus::Cancelled,
            57 => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// Fill notification delivered by the broker callback
#[derive(Debug, Clone)]
pub struct BrokerFill {
    pub order_id: String,
    pub stock_code: StockCode,
    pub side: Side,
    pub traded_volume: i64,
    pub traded_price: f64,
    pub traded_amount: f64,
    pub account_id: String,
}

/// One row of the append-only grid trade log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTrade {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: i64,
    pub stock_code: StockCode,
    pub trade_type: Side,
    /// Price of the crossed grid level.
    pub grid_level: f64,
    /// Execution price.
    pub trigger_price: f64,
    pub volume: i64,
    pub amount: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valley_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_ratio: Option<f64>,
    pub trade_id: String,
    pub trade_time: DateTime<Utc>,
    pub grid_center_before: f64,
    pub grid_center_after: f64,
}

/// One row of the user-trade audit log
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub stock_code: StockCode,
    pub trade_type: Side,
    pub price: f64,
    pub volume: i64,
    pub amount: f64,
    pub trade_id: String,
    pub strategy: String,
    pub trade_time: DateTime<Utc>,
}

/// Round a share count down to a whole number of lots.
pub fn round_down_to_lot(volume: i64) -> i64 {
    (volume / LOT_SIZE) * LOT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_code_roundtrip() {
        let code = StockCode::new("600519.SH");
        assert_eq!(code.as_str(), "600519.SH");
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, "\"600519.SH\"");
        let back: StockCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn test_order_status_translation() {
        assert_eq!(OrderStatus::from_raw(56), OrderStatus::Filled);
        assert_eq!(OrderStatus::from_raw(50), OrderStatus::Submitted);
        assert_eq!(OrderStatus::from_raw(55), OrderStatus::Partial);
        assert_eq!(OrderStatus::from_raw(54), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::from_raw(57), OrderStatus::Rejected);
        assert_eq!(OrderStatus::from_raw(-1), OrderStatus::Unknown);
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
    }

    #[test]
    fn test_signal_kind_names_and_sides() {
        assert_eq!(SignalKind::StopLoss.as_str(), "stop_loss");
        assert_eq!(SignalKind::TakeProfitHalf.as_str(), "take_profit_half");
        assert_eq!(SignalKind::GridBuy.as_str(), "BUY");
        assert_eq!(SignalKind::GridSell.side(), Side::Sell);
        assert_eq!(SignalKind::AddPosition.side(), Side::Buy);
        assert!(SignalKind::StopLoss.priority() > SignalKind::TakeProfitFull.priority());
    }

    #[test]
    fn test_position_helpers() {
        let mut pos = Position::from_holding(StockCode::new("000001.SZ"), 1000, 1000, 10.0, 10.5);
        assert!(!pos.is_closed());
        assert!((pos.profit_ratio() - 0.05).abs() < 1e-12);
        assert_eq!(pos.market_value(), 10_500.0);
        pos.volume = 0;
        assert!(pos.is_closed());
    }

    #[test]
    fn test_lot_rounding() {
        assert_eq!(round_down_to_lot(0), 0);
        assert_eq!(round_down_to_lot(99), 0);
        assert_eq!(round_down_to_lot(100), 100);
        assert_eq!(round_down_to_lot(250), 200);
    }

    #[test]
    fn test_tick_bid_depth() {
        let tick = Tick {
            stock_code: StockCode::new("000001.SZ"),
            last: 10.40,
            high: 10.60,
            low: 10.10,
            bids: vec![
                QuoteLevel { price: 10.39, volume: 500 },
                QuoteLevel { price: 10.38, volume: 300 },
                QuoteLevel { price: 10.37, volume: 200 },
            ],
            asks: vec![QuoteLevel { price: 10.41, volume: 400 }],
            ts: Utc::now(),
        };
        assert_eq!(tick.bid(1), Some(10.39));
        assert_eq!(tick.bid(3), Some(10.37));
        assert_eq!(tick.bid(4), None);
    }
}
