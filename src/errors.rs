//! Error taxonomy for the daemon
//!
//! Each variant maps to one recovery policy: precondition failures are
//! rejected synchronously and never retried; transient external failures
//! drop the current tick; persistence failures roll back and surface a
//! typed error; fatal failures refuse startup or flip auto-trading off.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    // ------------------------------------------------------------------
    // Precondition failures: reject synchronously, surface to the caller
    // ------------------------------------------------------------------
    #[error("{0}: no position held, cannot start grid trading")]
    NoPosition(String),

    #[error("{0}: first-stage take-profit has not triggered, cannot start grid trading")]
    ProfitNotTriggered(String),

    #[error("{0}: an active grid session already exists")]
    DuplicateSession(String),

    #[error("{0}: no valid center price could be determined")]
    InvalidCenterPrice(String),

    #[error("grid manager lock not acquired within {0} seconds")]
    LockTimeout(u64),

    #[error("position query for {0} timed out after {1} seconds")]
    PositionQueryTimeout(String, u64),

    #[error("grid session {0} not found")]
    SessionNotFound(i64),

    #[error("grid template '{0}' not found")]
    TemplateNotFound(String),

    // ------------------------------------------------------------------
    // Transient external failures: log WARN, drop this tick
    // ------------------------------------------------------------------
    #[error("broker call failed: {0}")]
    Broker(String),

    #[error("market data call failed: {0}")]
    MarketData(String),

    #[error("market data circuit open, {remaining_secs}s of cooldown remaining")]
    CircuitOpen { remaining_secs: u64 },

    // ------------------------------------------------------------------
    // Persistence failures: rolled back, retried on the next tick
    // ------------------------------------------------------------------
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // ------------------------------------------------------------------
    // Fatal: refuse to start / stop auto-trading
    // ------------------------------------------------------------------
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SentinelError {
    /// Stable machine-readable code for the structured API response.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SentinelError::NoPosition(_) => "no_position",
            SentinelError::ProfitNotTriggered(_) => "profit_not_triggered",
            SentinelError::DuplicateSession(_) => "duplicate_session",
            SentinelError::InvalidCenterPrice(_) => "invalid_center_price",
            SentinelError::LockTimeout(_) => "lock_timeout",
            SentinelError::PositionQueryTimeout(_, _) => "position_query_timeout",
            SentinelError::SessionNotFound(_) => "session_not_found",
            SentinelError::TemplateNotFound(_) => "template_not_found",
            SentinelError::Broker(_) => "broker_error",
            SentinelError::MarketData(_) => "market_data_error",
            SentinelError::CircuitOpen { .. } => "circuit_open",
            SentinelError::Database(_) => "database_error",
            SentinelError::Serde(_) => "serialization_error",
            SentinelError::Fatal(_) => "fatal",
        }
    }

    /// Precondition failures are user errors, not system faults.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            SentinelError::NoPosition(_)
                | SentinelError::ProfitNotTriggered(_)
                | SentinelError::DuplicateSession(_)
                | SentinelError::InvalidCenterPrice(_)
                | SentinelError::LockTimeout(_)
                | SentinelError::PositionQueryTimeout(_, _)
                | SentinelError::SessionNotFound(_)
                | SentinelError::TemplateNotFound(_)
        )
    }

    /// Transient failures may succeed on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SentinelError::Broker(_)
                | SentinelError::MarketData(_)
                | SentinelError::CircuitOpen { .. }
                | SentinelError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(
            SentinelError::NoPosition("000001.SZ".into()).reason_code(),
            "no_position"
        );
        assert_eq!(
            SentinelError::DuplicateSession("000001.SZ".into()).reason_code(),
            "duplicate_session"
        );
        assert_eq!(
            SentinelError::CircuitOpen { remaining_secs: 42 }.reason_code(),
            "circuit_open"
        );
    }

    #[test]
    fn test_error_classes() {
        assert!(SentinelError::ProfitNotTriggered("x".into()).is_precondition());
        assert!(!SentinelError::ProfitNotTriggered("x".into()).is_transient());
        assert!(SentinelError::Broker("timeout".into()).is_transient());
        assert!(!SentinelError::Fatal("db gone".into()).is_transient());
    }
}
