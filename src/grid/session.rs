//! Grid trading session model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::StockCode;

/// Why a session stopped; the string forms are the persisted DB values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Deviation,
    TargetProfit,
    StopLoss,
    Expired,
    PositionCleared,
    UserRequested,
    InitError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Deviation => "deviation",
            StopReason::TargetProfit => "target_profit",
            StopReason::StopLoss => "stop_loss",
            StopReason::Expired => "expired",
            StopReason::PositionCleared => "position_cleared",
            StopReason::UserRequested => "user_requested",
            StopReason::InitError => "init_error",
        }
    }

    pub fn from_str(s: &str) -> Option<StopReason> {
        match s {
            "deviation" => Some(StopReason::Deviation),
            "target_profit" => Some(StopReason::TargetProfit),
            "stop_loss" => Some(StopReason::StopLoss),
            "expired" => Some(StopReason::Expired),
            "position_cleared" => Some(StopReason::PositionCleared),
            "user_requested" => Some(StopReason::UserRequested),
            "init_error" => Some(StopReason::InitError),
            _ => None,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Grid price levels around the drifting center
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridLevels {
    pub lower: f64,
    pub center: f64,
    pub upper: f64,
}

/// Named, reusable grid-parameter preset
///
/// Templates let a session start from a stored risk profile (aggressive,
/// balanced, conservative, ...) instead of respecifying every parameter.
/// At most one template is flagged as the default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridTemplate {
    pub name: String,
    pub price_interval: f64,
    pub position_ratio: f64,
    pub callback_ratio: f64,
    pub max_deviation: f64,
    pub target_profit: f64,
    pub stop_loss: f64,
    pub duration_days: i64,
    /// Fraction of the position's market value used as `max_investment`
    /// when the session request does not name an explicit cap.
    pub max_investment_ratio: f64,
    pub description: String,
    pub is_default: bool,
}

impl GridTemplate {
    /// A balanced baseline; callers override the fields they care about.
    pub fn new(name: impl Into<String>) -> Self {
        GridTemplate {
            name: name.into(),
            price_interval: 0.05,
            position_ratio: 0.25,
            callback_ratio: 0.005,
            max_deviation: 0.15,
            target_profit: 0.10,
            stop_loss: -0.10,
            duration_days: 7,
            max_investment_ratio: 0.5,
            description: String::new(),
            is_default: false,
        }
    }
}

/// One active grid-trading engagement on one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSession {
    pub id: i64,
    pub stock_code: StockCode,
    /// `active` or `stopped`; set once to `stopped`, never back.
    pub status: String,
    /// Original center at session start; frozen for the deviation check.
    pub center_price: f64,
    /// Moves to the fill price after every grid trade.
    pub current_center_price: f64,
    pub price_interval: f64,
    pub position_ratio: f64,
    pub callback_ratio: f64,
    pub max_investment: f64,
    pub current_investment: f64,
    pub max_deviation: f64,
    pub target_profit: f64,
    pub stop_loss: f64,
    pub trade_count: i64,
    pub buy_count: i64,
    pub sell_count: i64,
    pub total_buy_amount: f64,
    pub total_sell_amount: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
}

impl GridSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stock_code: StockCode,
        center_price: f64,
        price_interval: f64,
        position_ratio: f64,
        callback_ratio: f64,
        max_investment: f64,
        max_deviation: f64,
        target_profit: f64,
        stop_loss: f64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        GridSession {
            id: 0,
            stock_code,
            status: "active".to_string(),
            center_price,
            current_center_price: center_price,
            price_interval,
            position_ratio,
            callback_ratio,
            max_investment,
            current_investment: 0.0,
            max_deviation,
            target_profit,
            stop_loss,
            trade_count: 0,
            buy_count: 0,
            sell_count: 0,
            total_buy_amount: 0.0,
            total_sell_amount: 0.0,
            start_time,
            end_time,
            stop_time: None,
            stop_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    /// Session profit ratio: (total sells - total buys) / max_investment.
    ///
    /// Only the session's own cash flow counts, which isolates the figure
    /// from market drift of the underlying holding. Returns 0.0 with no
    /// trades yet (neutral) or with an unusable max_investment.
    pub fn profit_ratio(&self) -> f64 {
        if self.max_investment <= 0.0 {
            return 0.0;
        }
        if self.total_buy_amount == 0.0 && self.total_sell_amount == 0.0 {
            return 0.0;
        }
        (self.total_sell_amount - self.total_buy_amount) / self.max_investment
    }

    /// Cumulative grid profit in currency units.
    pub fn grid_profit(&self) -> f64 {
        self.total_sell_amount - self.total_buy_amount
    }

    /// |current_center - center| / center; 0.0 when either center is unset.
    pub fn deviation_ratio(&self) -> f64 {
        if self.center_price == 0.0 || self.current_center_price == 0.0 {
            return 0.0;
        }
        (self.current_center_price - self.center_price).abs() / self.center_price
    }

    /// Grid levels around the drifting center.
    pub fn levels(&self) -> GridLevels {
        let center = if self.current_center_price > 0.0 {
            self.current_center_price
        } else {
            self.center_price
        };
        GridLevels {
            lower: center * (1.0 - self.price_interval),
            center,
            upper: center * (1.0 + self.price_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn session() -> GridSession {
        GridSession::new(
            StockCode::new("000001.SZ"),
            10.0,
            0.05,
            0.25,
            0.005,
            10_000.0,
            0.15,
            0.10,
            -0.10,
            Utc::now(),
            Utc::now() + Duration::days(7),
        )
    }

    #[test]
    fn test_levels_follow_drifting_center() {
        let mut s = session();
        let levels = s.levels();
        assert_relative_eq!(levels.lower, 9.5);
        assert_relative_eq!(levels.upper, 10.5);

        s.current_center_price = 10.545;
        let levels = s.levels();
        assert_relative_eq!(levels.lower, 10.01775);
        assert_relative_eq!(levels.upper, 11.07225);
    }

    #[test]
    fn test_levels_fall_back_to_original_center() {
        let mut s = session();
        s.current_center_price = 0.0;
        assert_relative_eq!(s.levels().center, 10.0);
    }

    #[test]
    fn test_profit_ratio_neutral_without_trades() {
        let s = session();
        assert_eq!(s.profit_ratio(), 0.0);
    }

    #[test]
    fn test_profit_ratio_uses_max_investment() {
        let mut s = session();
        s.total_buy_amount = 2_500.0;
        s.total_sell_amount = 3_600.0;
        assert_relative_eq!(s.profit_ratio(), 0.11);
        assert_relative_eq!(s.grid_profit(), 1_100.0);
    }

    #[test]
    fn test_profit_ratio_zero_max_investment() {
        let mut s = session();
        s.max_investment = 0.0;
        s.total_sell_amount = 1_000.0;
        assert_eq!(s.profit_ratio(), 0.0);
    }

    #[test]
    fn test_deviation_ratio() {
        let mut s = session();
        assert_eq!(s.deviation_ratio(), 0.0);
        s.current_center_price = 11.6;
        assert_relative_eq!(s.deviation_ratio(), 0.16);
        s.current_center_price = 8.4;
        assert_relative_eq!(s.deviation_ratio(), 0.16);
    }

    #[test]
    fn test_stop_reason_strings() {
        assert_eq!(StopReason::TargetProfit.as_str(), "target_profit");
        assert_eq!(StopReason::from_str("expired"), Some(StopReason::Expired));
        assert_eq!(StopReason::from_str("bogus"), None);
    }

    #[test]
    fn test_template_baseline() {
        let t = GridTemplate::new("balanced");
        assert_eq!(t.name, "balanced");
        assert_relative_eq!(t.price_interval, 0.05);
        assert_relative_eq!(t.max_investment_ratio, 0.5);
        assert_eq!(t.duration_days, 7);
        assert!(!t.is_default);
    }
}
