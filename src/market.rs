//! Market data boundary
//!
//! The daemon consumes an opaque latest-tick provider; feed selection and
//! failover live outside this crate. Historical daily highs are cached per
//! symbol with a TTL so the archive source is not hammered on every tick;
//! the live tick high is never cached.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::{Result, SentinelError};
use crate::types::{Bar, StockCode, Tick};

/// Latest-tick / daily-bar capability
pub trait MarketDataProvider: Send + Sync {
    fn latest_tick(&self, stock_code: &StockCode) -> Result<Tick>;

    /// Most recent daily OHLC bars, newest last.
    fn daily_bars(&self, stock_code: &StockCode, days: u32) -> Result<Vec<Bar>>;
}

/// Per-symbol cache of the historical daily high
pub struct DailyHighCache {
    ttl: Duration,
    entries: Mutex<HashMap<StockCode, (f64, Instant)>>,
}

impl DailyHighCache {
    pub fn new(ttl: Duration) -> Self {
        DailyHighCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached historical high, re-fetched from the archive source once the
    /// TTL lapses. A fetch failure is logged and yields `None`; the caller
    /// falls back to the live tick alone.
    pub fn historical_high(
        &self,
        provider: &dyn MarketDataProvider,
        stock_code: &StockCode,
        lookback_days: u32,
    ) -> Option<f64> {
        {
            let entries = self.entries.lock().expect("daily high cache poisoned");
            if let Some((high, at)) = entries.get(stock_code) {
                if at.elapsed() < self.ttl {
                    return Some(*high);
                }
            }
        }
        match provider.daily_bars(stock_code, lookback_days) {
            Ok(bars) => {
                let high = bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                if !bars.is_empty() && high > 0.0 {
                    self.entries
                        .lock()
                        .expect("daily high cache poisoned")
                        .insert(stock_code.clone(), (high, Instant::now()));
                    Some(high)
                } else {
                    None
                }
            }
            Err(e) => {
                warn!("daily bar fetch failed for {stock_code}: {e}");
                None
            }
        }
    }

    pub fn invalidate(&self, stock_code: &StockCode) {
        self.entries
            .lock()
            .expect("daily high cache poisoned")
            .remove(stock_code);
    }
}

/// Deterministic tick source replaying scripted prices
///
/// Feeds unit and integration tests; each call pops the next scripted tick
/// for the symbol and the last one repeats once the script is exhausted.
pub struct ReplayTickProvider {
    ticks: Mutex<HashMap<StockCode, VecDeque<Tick>>>,
    bars: Mutex<HashMap<StockCode, Vec<Bar>>>,
}

impl Default for ReplayTickProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayTickProvider {
    pub fn new() -> Self {
        ReplayTickProvider {
            ticks: Mutex::new(HashMap::new()),
            bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn push_tick(&self, tick: Tick) {
        self.ticks
            .lock()
            .unwrap()
            .entry(tick.stock_code.clone())
            .or_default()
            .push_back(tick);
    }

    pub fn set_daily_bars(&self, stock_code: StockCode, bars: Vec<Bar>) {
        self.bars.lock().unwrap().insert(stock_code, bars);
    }
}

impl MarketDataProvider for ReplayTickProvider {
    fn latest_tick(&self, stock_code: &StockCode) -> Result<Tick> {
        let mut ticks = self.ticks.lock().unwrap();
        let queue = ticks
            .get_mut(stock_code)
            .ok_or_else(|| SentinelError::MarketData(format!("no tick for {stock_code}")))?;
        match queue.len() {
            0 => Err(SentinelError::MarketData(format!("no tick for {stock_code}"))),
            1 => Ok(queue.front().expect("non-empty").clone()),
            _ => Ok(queue.pop_front().expect("non-empty")),
        }
    }

    fn daily_bars(&self, stock_code: &StockCode, _days: u32) -> Result<Vec<Bar>> {
        Ok(self
            .bars
            .lock()
            .unwrap()
            .get(stock_code)
            .cloned()
            .unwrap_or_default())
    }
}
