//! Equity Sentinel
//!
//! An unattended equity-position daemon. It watches broker-reported
//! holdings in real time and enforces, per position, a dynamic
//! stop-profit / stop-loss state machine plus an optional grid-trading
//! engagement that scalps symmetric moves around a drifting center price.
//! Orders are submitted asynchronously; fills arrive through a broker
//! callback; the broker remains the source of truth, so persistent state
//! is reconciled against it at startup, on every event and on a periodic
//! sync.

pub mod broker;
pub mod circuit_breaker;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod executor;
pub mod grid;
pub mod market;
pub mod monitor;
pub mod store;
pub mod types;

pub use config::Config;
pub use errors::SentinelError;
pub use types::*;
