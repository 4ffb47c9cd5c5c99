//! Market-data circuit breaker
//!
//! Repeated market-data failures within a rolling window trip the circuit;
//! while open, all signal generation is suppressed until the cooldown
//! expires. One ERROR line on trip and one on reset.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::error;

use crate::config::CircuitBreakerSettings;

#[derive(Debug)]
pub struct MarketDataCircuitBreaker {
    enabled: bool,
    failure_threshold: u32,
    failure_window: Duration,
    break_duration: Duration,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
}

impl MarketDataCircuitBreaker {
    pub fn new(settings: &CircuitBreakerSettings) -> Self {
        MarketDataCircuitBreaker {
            enabled: settings.enable_market_data_circuit_breaker,
            failure_threshold: settings.market_data_failure_threshold,
            failure_window: Duration::from_secs(settings.market_data_failure_window_seconds),
            break_duration: Duration::from_secs(settings.market_data_circuit_break_seconds),
            failures: VecDeque::new(),
            open_until: None,
        }
    }

    /// True when signal generation may proceed. Flips back to closed (with
    /// one ERROR line) once the cooldown has elapsed.
    pub fn can_attempt(&mut self) -> bool {
        if !self.enabled {
            return true;
        }
        if let Some(until) = self.open_until {
            if Instant::now() < until {
                return false;
            }
            error!("market data circuit reset, signal generation resumes");
            self.open_until = None;
            self.failures.clear();
        }
        true
    }

    pub fn is_open(&self) -> bool {
        matches!(self.open_until, Some(until) if Instant::now() < until)
    }

    /// Seconds of cooldown left, 0 when closed.
    pub fn remaining_secs(&self) -> u64 {
        match self.open_until {
            Some(until) => until.saturating_duration_since(Instant::now()).as_secs(),
            None => 0,
        }
    }

    /// Count one market-data failure; trips the circuit when the window
    /// accumulates the configured threshold.
    pub fn record_failure(&mut self) {
        if !self.enabled || self.is_open() {
            return;
        }
        let now = Instant::now();
        self.failures.push_back(now);
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > self.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.failures.len() as u32 >= self.failure_threshold {
            error!(
                "market data circuit tripped after {} failures in {}s, suppressing signals for {}s",
                self.failures.len(),
                self.failure_window.as_secs(),
                self.break_duration.as_secs()
            );
            self.open_until = Some(now + self.break_duration);
            self.failures.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32, window_secs: u64, break_secs: u64) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            enable_market_data_circuit_breaker: true,
            market_data_failure_threshold: threshold,
            market_data_failure_window_seconds: window_secs,
            market_data_circuit_break_seconds: break_secs,
        }
    }

    #[test]
    fn test_starts_closed() {
        let mut cb = MarketDataCircuitBreaker::new(&settings(3, 60, 300));
        assert!(cb.can_attempt());
        assert!(!cb.is_open());
        assert_eq!(cb.remaining_secs(), 0);
    }

    #[test]
    fn test_trips_at_threshold() {
        let mut cb = MarketDataCircuitBreaker::new(&settings(3, 60, 300));
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_attempt());
        cb.record_failure();
        assert!(cb.is_open());
        assert!(!cb.can_attempt());
        assert!(cb.remaining_secs() > 0);
    }

    #[test]
    fn test_resets_after_cooldown() {
        let mut cb = MarketDataCircuitBreaker::new(&settings(1, 60, 0));
        cb.record_failure();
        // Zero-length break: the next attempt resets the circuit.
        std::thread::sleep(Duration::from_millis(5));
        assert!(cb.can_attempt());
        assert!(!cb.is_open());
    }

    #[test]
    fn test_disabled_never_trips() {
        let mut s = settings(1, 60, 300);
        s.enable_market_data_circuit_breaker = false;
        let mut cb = MarketDataCircuitBreaker::new(&s);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.can_attempt());
    }

    #[test]
    fn test_failures_outside_window_expire() {
        let mut cb = MarketDataCircuitBreaker::new(&settings(2, 0, 300));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(10));
        // The first failure has aged out of the zero-length window.
        cb.record_failure();
        assert!(!cb.is_open());
    }
}
