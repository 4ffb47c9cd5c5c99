//! Price-tracker state machine
//!
//! Per grid session: once the manager arms the tracker after a level
//! crossing, it sweeps the peak (or valley) and reports when the pullback
//! (or bounce) reaches the session's callback ratio.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::Side;

/// Tolerance compensating binary-float rounding in ratio comparisons.
///
/// 0.01% of slack: enough to absorb `0.002999999999999936 < 0.003`
/// artifacts without loosening the threshold in any meaningful way.
pub const FLOAT_TOLERANCE: f64 = 1e-4;

/// Sweep direction while waiting for a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Rising,
    Falling,
}

/// In-memory price tracker for one grid session
///
/// State is advisory between fills: losing it across a restart costs at
/// most one re-arm at the next level crossing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTracker {
    pub session_id: i64,
    pub last_price: f64,
    pub peak_price: f64,
    pub valley_price: f64,
    pub direction: Option<Direction>,
    pub crossed_level: Option<f64>,
    pub waiting_callback: bool,
}

impl PriceTracker {
    /// Seed a tracker at a known price, idle.
    pub fn seeded(session_id: i64, price: f64) -> Self {
        PriceTracker {
            session_id,
            last_price: price,
            peak_price: price,
            valley_price: price,
            direction: None,
            crossed_level: None,
            waiting_callback: false,
        }
    }

    /// Feed one price sample, extending the peak/valley sweep when armed.
    pub fn update_price(&mut self, new_price: f64) {
        self.last_price = new_price;
        if !self.waiting_callback {
            return;
        }
        match self.direction {
            Some(Direction::Rising) if new_price > self.peak_price => {
                debug!(
                    session_id = self.session_id,
                    "peak {:.3} -> {:.3}", self.peak_price, new_price
                );
                self.peak_price = new_price;
            }
            Some(Direction::Falling) if new_price < self.valley_price => {
                debug!(
                    session_id = self.session_id,
                    "valley {:.3} -> {:.3}", self.valley_price, new_price
                );
                self.valley_price = new_price;
            }
            _ => {}
        }
    }

    /// Arm the tracker after an upward level crossing.
    pub fn arm_rising(&mut self, level: f64, price: f64) {
        self.crossed_level = Some(level);
        self.peak_price = price;
        self.direction = Some(Direction::Rising);
        self.waiting_callback = true;
    }

    /// Arm the tracker after a downward level crossing.
    pub fn arm_falling(&mut self, level: f64, price: f64) {
        self.crossed_level = Some(level);
        self.valley_price = price;
        self.direction = Some(Direction::Falling);
        self.waiting_callback = true;
    }

    /// When armed and the pullback from peak (bounce from valley) has
    /// reached the callback ratio, report the trade side.
    ///
    /// The comparison is `ratio >= callback_ratio - FLOAT_TOLERANCE`: a
    /// pullback exactly at the threshold fires.
    pub fn check_callback(&self, callback_ratio: f64) -> Option<Side> {
        if !self.waiting_callback {
            return None;
        }
        match self.direction {
            Some(Direction::Rising) => {
                if self.peak_price == 0.0 {
                    warn!(session_id = self.session_id, "peak price is 0, ignoring");
                    return None;
                }
                let ratio = (self.peak_price - self.last_price) / self.peak_price;
                if ratio >= callback_ratio - FLOAT_TOLERANCE {
                    return Some(Side::Sell);
                }
                None
            }
            Some(Direction::Falling) => {
                if self.valley_price == 0.0 {
                    warn!(session_id = self.session_id, "valley price is 0, ignoring");
                    return None;
                }
                let ratio = (self.last_price - self.valley_price) / self.valley_price;
                if ratio >= callback_ratio - FLOAT_TOLERANCE {
                    return Some(Side::Buy);
                }
                None
            }
            None => None,
        }
    }

    /// Observed pullback/bounce ratio at the current price, for signal
    /// payloads. Zero when the reference price is unusable.
    pub fn observed_callback_ratio(&self) -> f64 {
        match self.direction {
            Some(Direction::Rising) if self.peak_price > 0.0 => {
                (self.peak_price - self.last_price) / self.peak_price
            }
            Some(Direction::Falling) if self.valley_price > 0.0 => {
                (self.last_price - self.valley_price) / self.valley_price
            }
            _ => 0.0,
        }
    }

    /// Full reset around a price: idle, sweep history discarded.
    pub fn reset(&mut self, price: f64) {
        self.last_price = price;
        self.peak_price = price;
        self.valley_price = price;
        self.direction = None;
        self.crossed_level = None;
        self.waiting_callback = false;
    }
}
