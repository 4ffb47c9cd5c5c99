//! Grid trading: session model, price tracker, and the manager that
//! drives them.

pub mod manager;
pub mod session;
pub mod tracker;

pub use manager::{GridSessionRequest, GridTradingManager, SessionStats, StopStats};
pub use session::{GridLevels, GridSession, GridTemplate, StopReason};
pub use tracker::{Direction, PriceTracker, FLOAT_TOLERANCE};
