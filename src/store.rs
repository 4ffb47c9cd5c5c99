//! Durable state store
//!
//! SQLite-backed persistence for positions, grid sessions, the append-only
//! grid trade log and the user-trade audit trail. A single connection behind
//! a process-wide mutex serialises all writers; a 30 second busy timeout
//! retries operations backed off by a concurrent write. Every mutation bumps
//! a monotonic data version observed by the dashboard layer.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::{Result, SentinelError};
use crate::grid::session::{GridSession, GridTemplate, StopReason};
use crate::types::{BrokerFill, GridTrade, Position, Side, StockCode, TradeRecord};

/// Partial update of a grid session row; only `Some` fields are written.
#[derive(Debug, Default, Clone)]
pub struct GridSessionUpdate {
    pub current_center_price: Option<f64>,
    pub current_investment: Option<f64>,
    pub trade_count: Option<i64>,
    pub buy_count: Option<i64>,
    pub sell_count: Option<i64>,
    pub total_buy_amount: Option<f64>,
    pub total_sell_amount: Option<f64>,
}

/// Read-only dashboard snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub data_version: i64,
    pub positions: Vec<Position>,
    pub active_sessions: Vec<GridSession>,
}

pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    data_version: Arc<AtomicI64>,
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        StateStore {
            conn: Arc::clone(&self.conn),
            data_version: Arc::clone(&self.data_version),
        }
    }
}

impl StateStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SentinelError::Fatal(format!("cannot create state dir: {e}")))?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(30))?;

        let store = StateStore {
            conn: Arc::new(Mutex::new(conn)),
            data_version: Arc::new(AtomicI64::new(0)),
        };
        store.create_tables()?;
        store.migrate()?;

        let initial = {
            let conn = store.lock_conn();
            conn.query_row(
                "SELECT value FROM meta WHERE key = 'data_version'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .unwrap_or(0)
        };
        store.data_version.store(initial, Ordering::SeqCst);

        info!("state store ready: {} (data_version={})", db_path.display(), initial);
        Ok(store)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-write; propagating the panic is
        // the only safe option for a store that must never commit partial state.
        self.conn.lock().expect("state store mutex poisoned")
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock_conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                stock_code TEXT PRIMARY KEY,
                stock_name TEXT DEFAULT '',
                volume INTEGER NOT NULL,
                available INTEGER NOT NULL,
                cost_price REAL NOT NULL,
                current_price REAL DEFAULT 0,
                market_value REAL DEFAULT 0,
                profit_ratio REAL DEFAULT 0,
                last_update TEXT,
                open_date TEXT,
                highest_price REAL DEFAULT 0,
                profit_triggered INTEGER DEFAULT 0,
                stop_loss_price REAL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grid_trading_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stock_code TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                center_price REAL NOT NULL,
                current_center_price REAL,
                price_interval REAL NOT NULL DEFAULT 0.05,
                position_ratio REAL NOT NULL DEFAULT 0.25,
                callback_ratio REAL NOT NULL DEFAULT 0.005,
                max_investment REAL NOT NULL,
                current_investment REAL DEFAULT 0,
                max_deviation REAL DEFAULT 0.15,
                target_profit REAL DEFAULT 0.10,
                stop_loss REAL DEFAULT -0.10,
                trade_count INTEGER DEFAULT 0,
                buy_count INTEGER DEFAULT 0,
                sell_count INTEGER DEFAULT 0,
                total_buy_amount REAL DEFAULT 0,
                total_sell_amount REAL DEFAULT 0,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                stop_time TEXT,
                stop_reason TEXT,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(stock_code, status) ON CONFLICT REPLACE
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grid_trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                stock_code TEXT NOT NULL,
                trade_type TEXT NOT NULL,
                grid_level REAL NOT NULL,
                trigger_price REAL NOT NULL,
                volume INTEGER NOT NULL,
                amount REAL NOT NULL,
                peak_price REAL,
                valley_price REAL,
                callback_ratio REAL,
                trade_id TEXT,
                trade_time TEXT NOT NULL,
                grid_center_before REAL,
                grid_center_after REAL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stock_code TEXT NOT NULL,
                trade_type TEXT NOT NULL,
                price REAL NOT NULL,
                volume INTEGER NOT NULL,
                amount REAL NOT NULL,
                trade_id TEXT,
                strategy TEXT,
                trade_time TEXT DEFAULT CURRENT_TIMESTAMP,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS grid_config_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                template_name TEXT NOT NULL UNIQUE,
                price_interval REAL NOT NULL DEFAULT 0.05,
                position_ratio REAL NOT NULL DEFAULT 0.25,
                callback_ratio REAL NOT NULL DEFAULT 0.005,
                max_deviation REAL DEFAULT 0.15,
                target_profit REAL DEFAULT 0.10,
                stop_loss REAL DEFAULT -0.10,
                duration_days INTEGER DEFAULT 7,
                max_investment_ratio REAL DEFAULT 0.5,
                description TEXT,
                is_default INTEGER DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('data_version', 0)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_grid_sessions_stock ON grid_trading_sessions(stock_code)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_grid_sessions_status ON grid_trading_sessions(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_grid_trades_session ON grid_trades(session_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trade_records_stock ON trade_records(stock_code)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_grid_templates_name ON grid_config_templates(template_name)",
            [],
        )?;

        debug!("base schema created/verified");
        Ok(())
    }

    /// Additive migrations: old DB files gain new columns with defaults.
    fn migrate(&self) -> Result<()> {
        self.ensure_column("positions", "profit_breakout_triggered", "INTEGER DEFAULT 0")?;
        self.ensure_column("positions", "breakout_highest_price", "REAL DEFAULT 0")?;
        Ok(())
    }

    fn ensure_column(&self, table: &str, column: &str, typedef: &str) -> Result<()> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<_, _>>()?;
        if !existing.iter().any(|c| c == column) {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {column} {typedef}"),
                [],
            )?;
            info!("schema migration: added {table}.{column}");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data version
    // ------------------------------------------------------------------

    pub fn data_version(&self) -> i64 {
        self.data_version.load(Ordering::SeqCst)
    }

    fn bump_version(&self, conn: &Connection) -> Result<i64> {
        let next = self.data_version.fetch_add(1, Ordering::SeqCst) + 1;
        conn.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'data_version'",
            params![next],
        )?;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    pub fn upsert_position(&self, pos: &Position) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO positions
             (stock_code, stock_name, volume, available, cost_price, current_price,
              market_value, profit_ratio, last_update, open_date, highest_price,
              profit_triggered, stop_loss_price, profit_breakout_triggered,
              breakout_highest_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                pos.stock_code.as_str(),
                pos.stock_name,
                pos.volume,
                pos.available,
                pos.cost_price,
                pos.current_price,
                pos.market_value(),
                pos.profit_ratio(),
                Utc::now().to_rfc3339(),
                pos.open_date.to_rfc3339(),
                pos.highest_price,
                pos.profit_triggered as i64,
                pos.stop_loss_price,
                pos.profit_breakout_triggered as i64,
                pos.breakout_highest_price,
            ],
        )?;
        self.bump_version(&conn)?;
        debug!(
            "position saved: {} vol={} avail={} cost={:.3}",
            pos.stock_code, pos.volume, pos.available, pos.cost_price
        );
        Ok(())
    }

    pub fn delete_position(&self, stock_code: &StockCode) -> Result<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "DELETE FROM positions WHERE stock_code = ?1",
            params![stock_code.as_str()],
        )?;
        if changed > 0 {
            self.bump_version(&conn)?;
            info!("position deleted: {}", stock_code);
        }
        Ok(())
    }

    pub fn get_position(&self, stock_code: &StockCode) -> Result<Option<Position>> {
        let conn = self.lock_conn();
        let pos = conn
            .query_row(
                "SELECT * FROM positions WHERE stock_code = ?1",
                params![stock_code.as_str()],
                position_from_row,
            )
            .optional()?;
        Ok(pos)
    }

    pub fn list_positions(&self) -> Result<Vec<Position>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM positions ORDER BY stock_code")?;
        let positions = stmt
            .query_map([], position_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(positions)
    }

    // ------------------------------------------------------------------
    // Grid sessions
    // ------------------------------------------------------------------

    /// Insert a new session row; the `(stock_code, status)` uniqueness
    /// constraint replaces any stale active row for the same symbol.
    pub fn create_grid_session(&self, session: &GridSession) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO grid_trading_sessions
             (stock_code, status, center_price, current_center_price, price_interval,
              position_ratio, callback_ratio, max_investment, current_investment,
              max_deviation, target_profit, stop_loss, start_time, end_time)
             VALUES (?1, 'active', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                session.stock_code.as_str(),
                session.center_price,
                session.current_center_price,
                session.price_interval,
                session.position_ratio,
                session.callback_ratio,
                session.max_investment,
                session.current_investment,
                session.max_deviation,
                session.target_profit,
                session.stop_loss,
                session.start_time.to_rfc3339(),
                session.end_time.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.bump_version(&conn)?;
        Ok(id)
    }

    pub fn update_grid_session(&self, id: i64, updates: &GridSessionUpdate) -> Result<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        macro_rules! push_field {
            ($field:ident) => {
                if let Some(v) = updates.$field {
                    sets.push(format!("{} = ?{}", stringify!($field), sets.len() + 1));
                    values.push(Box::new(v));
                }
            };
        }
        push_field!(current_center_price);
        push_field!(current_investment);
        push_field!(trade_count);
        push_field!(buy_count);
        push_field!(sell_count);
        push_field!(total_buy_amount);
        push_field!(total_sell_amount);

        if sets.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE grid_trading_sessions SET {}, updated_at = CURRENT_TIMESTAMP WHERE id = ?{}",
            sets.join(", "),
            sets.len() + 1
        );
        values.push(Box::new(id));

        let conn = self.lock_conn();
        conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))?;
        self.bump_version(&conn)?;
        Ok(())
    }

    /// Mark a session stopped; a no-op on already-stopped rows.
    /// Returns true when a row transitioned.
    pub fn stop_grid_session(&self, id: i64, reason: StopReason) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE grid_trading_sessions
             SET status = 'stopped', stop_time = ?1, stop_reason = ?2,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?3 AND status = 'active'",
            params![Utc::now().to_rfc3339(), reason.as_str(), id],
        )?;
        if changed > 0 {
            self.bump_version(&conn)?;
        }
        Ok(changed > 0)
    }

    pub fn get_grid_session(&self, id: i64) -> Result<Option<GridSession>> {
        let conn = self.lock_conn();
        let session = conn
            .query_row(
                "SELECT * FROM grid_trading_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn get_active_session_for(&self, stock_code: &StockCode) -> Result<Option<GridSession>> {
        let conn = self.lock_conn();
        let session = conn
            .query_row(
                "SELECT * FROM grid_trading_sessions
                 WHERE stock_code = ?1 AND status = 'active' LIMIT 1",
                params![stock_code.as_str()],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_active_grid_sessions(&self) -> Result<Vec<GridSession>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM grid_trading_sessions WHERE status = 'active' ORDER BY start_time DESC",
        )?;
        let sessions = stmt
            .query_map([], session_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Grid trade log (append-only)
    // ------------------------------------------------------------------

    pub fn record_grid_trade(&self, trade: &GridTrade) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO grid_trades
             (session_id, stock_code, trade_type, grid_level, trigger_price, volume,
              amount, peak_price, valley_price, callback_ratio, trade_id, trade_time,
              grid_center_before, grid_center_after)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                trade.session_id,
                trade.stock_code.as_str(),
                trade.trade_type.as_str(),
                trade.grid_level,
                trade.trigger_price,
                trade.volume,
                trade.amount,
                trade.peak_price,
                trade.valley_price,
                trade.callback_ratio.map(|r| (r * 10_000.0).round() / 10_000.0),
                trade.trade_id,
                trade.trade_time.to_rfc3339(),
                trade.grid_center_before,
                trade.grid_center_after,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.bump_version(&conn)?;
        Ok(id)
    }

    pub fn get_grid_trades(&self, session_id: i64, limit: i64, offset: i64) -> Result<Vec<GridTrade>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM grid_trades WHERE session_id = ?1
             ORDER BY trade_time DESC LIMIT ?2 OFFSET ?3",
        )?;
        let trades = stmt
            .query_map(params![session_id, limit, offset], grid_trade_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    pub fn get_grid_trade_count(&self, session_id: i64) -> Result<i64> {
        let conn = self.lock_conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM grid_trades WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Grid config templates
    // ------------------------------------------------------------------

    /// Insert or update a named template. Flagging one as default clears
    /// the flag on every other template first.
    pub fn save_grid_template(&self, template: &GridTemplate) -> Result<i64> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        if template.is_default {
            tx.execute("UPDATE grid_config_templates SET is_default = 0", [])?;
        }
        tx.execute(
            "INSERT INTO grid_config_templates
             (template_name, price_interval, position_ratio, callback_ratio,
              max_deviation, target_profit, stop_loss, duration_days,
              max_investment_ratio, description, is_default)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(template_name) DO UPDATE SET
                price_interval = excluded.price_interval,
                position_ratio = excluded.position_ratio,
                callback_ratio = excluded.callback_ratio,
                max_deviation = excluded.max_deviation,
                target_profit = excluded.target_profit,
                stop_loss = excluded.stop_loss,
                duration_days = excluded.duration_days,
                max_investment_ratio = excluded.max_investment_ratio,
                description = excluded.description,
                is_default = excluded.is_default,
                updated_at = CURRENT_TIMESTAMP",
            params![
                template.name,
                template.price_interval,
                template.position_ratio,
                template.callback_ratio,
                template.max_deviation,
                template.target_profit,
                template.stop_loss,
                template.duration_days,
                template.max_investment_ratio,
                template.description,
                template.is_default as i64,
            ],
        )?;
        tx.commit()?;
        let id = conn.last_insert_rowid();
        self.bump_version(&conn)?;
        debug!("grid template saved: {}", template.name);
        Ok(id)
    }

    pub fn get_grid_template(&self, name: &str) -> Result<Option<GridTemplate>> {
        let conn = self.lock_conn();
        let template = conn
            .query_row(
                "SELECT * FROM grid_config_templates WHERE template_name = ?1",
                params![name],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    pub fn get_default_grid_template(&self) -> Result<Option<GridTemplate>> {
        let conn = self.lock_conn();
        let template = conn
            .query_row(
                "SELECT * FROM grid_config_templates WHERE is_default = 1 LIMIT 1",
                [],
                template_from_row,
            )
            .optional()?;
        Ok(template)
    }

    pub fn list_grid_templates(&self) -> Result<Vec<GridTemplate>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM grid_config_templates ORDER BY is_default DESC, created_at DESC",
        )?;
        let templates = stmt
            .query_map([], template_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    /// Returns true when a template row was removed.
    pub fn delete_grid_template(&self, name: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "DELETE FROM grid_config_templates WHERE template_name = ?1",
            params![name],
        )?;
        if changed > 0 {
            self.bump_version(&conn)?;
            info!("grid template deleted: {name}");
        }
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // User trade audit
    // ------------------------------------------------------------------

    pub fn record_user_trade(&self, record: &TradeRecord) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO trade_records
             (stock_code, trade_type, price, volume, amount, trade_id, strategy, trade_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.stock_code.as_str(),
                record.trade_type.as_str(),
                record.price,
                record.volume,
                record.amount,
                record.trade_id,
                record.strategy,
                record.trade_time.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.bump_version(&conn)?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Fill commits
    // ------------------------------------------------------------------

    /// Commit a confirmed sell fill in one transaction: the position delta,
    /// the optional first-stage take-profit flip, and the closed-position
    /// cleanup. The flip must reach disk before the fill is acknowledged;
    /// losing it would leave stage two disarmed forever.
    pub fn commit_sell_fill(&self, fill: &BrokerFill, flip_profit_triggered: bool) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        {
            let pos = tx
                .query_row(
                    "SELECT * FROM positions WHERE stock_code = ?1",
                    params![fill.stock_code.as_str()],
                    position_from_row,
                )
                .optional()?;

            let Some(pos) = pos else {
                warn!(
                    "sell fill for unknown position {} (order {}), ignoring delta",
                    fill.stock_code, fill.order_id
                );
                return Ok(());
            };

            let new_volume = (pos.volume - fill.traded_volume).max(0);
            if new_volume == 0 {
                tx.execute(
                    "DELETE FROM positions WHERE stock_code = ?1",
                    params![fill.stock_code.as_str()],
                )?;
                info!("position {} fully exited by order {}", fill.stock_code, fill.order_id);
            } else {
                let new_available = pos.available.min(new_volume);
                tx.execute(
                    "UPDATE positions
                     SET volume = ?1, available = ?2, current_price = ?3,
                         market_value = ?4, last_update = ?5,
                         profit_triggered = CASE WHEN ?6 THEN 1 ELSE profit_triggered END
                     WHERE stock_code = ?7",
                    params![
                        new_volume,
                        new_available,
                        fill.traded_price,
                        new_volume as f64 * fill.traded_price,
                        Utc::now().to_rfc3339(),
                        flip_profit_triggered,
                        fill.stock_code.as_str(),
                    ],
                )?;
            }
        }
        tx.commit()?;
        self.bump_version(&conn)?;
        Ok(())
    }

    /// Apply a confirmed buy fill: volume grows and the cost basis becomes
    /// the fill-weighted average. Creates the position on first holding.
    pub fn apply_buy_fill(&self, fill: &BrokerFill) -> Result<()> {
        let mut conn = self.lock_conn();
        let tx = conn.transaction()?;
        {
            let pos = tx
                .query_row(
                    "SELECT * FROM positions WHERE stock_code = ?1",
                    params![fill.stock_code.as_str()],
                    position_from_row,
                )
                .optional()?;

            match pos {
                Some(pos) => {
                    let new_volume = pos.volume + fill.traded_volume;
                    let new_cost = (pos.cost_price * pos.volume as f64 + fill.traded_amount)
                        / new_volume as f64;
                    tx.execute(
                        "UPDATE positions
                         SET volume = ?1, available = available + ?2, cost_price = ?3,
                             current_price = ?4, market_value = ?5, last_update = ?6
                         WHERE stock_code = ?7",
                        params![
                            new_volume,
                            fill.traded_volume,
                            new_cost,
                            fill.traded_price,
                            new_volume as f64 * fill.traded_price,
                            Utc::now().to_rfc3339(),
                            fill.stock_code.as_str(),
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO positions
                         (stock_code, volume, available, cost_price, current_price,
                          market_value, open_date, highest_price, last_update)
                         VALUES (?1, ?2, ?2, ?3, ?3, ?4, ?5, ?3, ?5)",
                        params![
                            fill.stock_code.as_str(),
                            fill.traded_volume,
                            fill.traded_price,
                            fill.traded_amount,
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;
        self.bump_version(&conn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dashboard snapshot
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            data_version: self.data_version(),
            positions: self.list_positions()?,
            active_sessions: self.list_active_grid_sessions()?,
        })
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Final flush: checkpoint the WAL back into the main database file so
    /// the on-disk state is complete before the connection drops with the
    /// process. The checkpoint pragma reports a status row, which we ignore.
    pub fn flush(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))?;
        info!("state store flushed (wal checkpoint)");
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn parse_ts(raw: Option<String>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        stock_code: StockCode::new(row.get::<_, String>("stock_code")?),
        stock_name: row
            .get::<_, Option<String>>("stock_name")?
            .unwrap_or_default(),
        volume: row.get("volume")?,
        available: row.get("available")?,
        cost_price: row.get("cost_price")?,
        current_price: row.get::<_, Option<f64>>("current_price")?.unwrap_or(0.0),
        open_date: parse_ts(row.get::<_, Option<String>>("open_date")?),
        highest_price: row.get::<_, Option<f64>>("highest_price")?.unwrap_or(0.0),
        profit_triggered: row.get::<_, Option<i64>>("profit_triggered")?.unwrap_or(0) != 0,
        profit_breakout_triggered: row
            .get::<_, Option<i64>>("profit_breakout_triggered")?
            .unwrap_or(0)
            != 0,
        breakout_highest_price: row
            .get::<_, Option<f64>>("breakout_highest_price")?
            .unwrap_or(0.0),
        stop_loss_price: row.get::<_, Option<f64>>("stop_loss_price")?.unwrap_or(0.0),
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<GridSession> {
    Ok(GridSession {
        id: row.get("id")?,
        stock_code: StockCode::new(row.get::<_, String>("stock_code")?),
        status: row.get("status")?,
        center_price: row.get("center_price")?,
        current_center_price: row
            .get::<_, Option<f64>>("current_center_price")?
            .unwrap_or(0.0),
        price_interval: row.get("price_interval")?,
        position_ratio: row.get("position_ratio")?,
        callback_ratio: row.get("callback_ratio")?,
        max_investment: row.get("max_investment")?,
        current_investment: row
            .get::<_, Option<f64>>("current_investment")?
            .unwrap_or(0.0),
        max_deviation: row.get("max_deviation")?,
        target_profit: row.get("target_profit")?,
        stop_loss: row.get("stop_loss")?,
        trade_count: row.get::<_, Option<i64>>("trade_count")?.unwrap_or(0),
        buy_count: row.get::<_, Option<i64>>("buy_count")?.unwrap_or(0),
        sell_count: row.get::<_, Option<i64>>("sell_count")?.unwrap_or(0),
        total_buy_amount: row.get::<_, Option<f64>>("total_buy_amount")?.unwrap_or(0.0),
        total_sell_amount: row
            .get::<_, Option<f64>>("total_sell_amount")?
            .unwrap_or(0.0),
        start_time: parse_ts(row.get::<_, Option<String>>("start_time")?),
        end_time: parse_ts(row.get::<_, Option<String>>("end_time")?),
        stop_time: row
            .get::<_, Option<String>>("stop_time")?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        stop_reason: row
            .get::<_, Option<String>>("stop_reason")?
            .and_then(|s| StopReason::from_str(&s)),
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<GridTemplate> {
    Ok(GridTemplate {
        name: row.get("template_name")?,
        price_interval: row.get("price_interval")?,
        position_ratio: row.get("position_ratio")?,
        callback_ratio: row.get("callback_ratio")?,
        max_deviation: row.get::<_, Option<f64>>("max_deviation")?.unwrap_or(0.15),
        target_profit: row.get::<_, Option<f64>>("target_profit")?.unwrap_or(0.10),
        stop_loss: row.get::<_, Option<f64>>("stop_loss")?.unwrap_or(-0.10),
        duration_days: row.get::<_, Option<i64>>("duration_days")?.unwrap_or(7),
        max_investment_ratio: row
            .get::<_, Option<f64>>("max_investment_ratio")?
            .unwrap_or(0.5),
        description: row
            .get::<_, Option<String>>("description")?
            .unwrap_or_default(),
        is_default: row.get::<_, Option<i64>>("is_default")?.unwrap_or(0) != 0,
    })
}

fn grid_trade_from_row(row: &Row<'_>) -> rusqlite::Result<GridTrade> {
    Ok(GridTrade {
        id: Some(row.get("id")?),
        session_id: row.get("session_id")?,
        stock_code: StockCode::new(row.get::<_, String>("stock_code")?),
        trade_type: Side::from_str_loose(&row.get::<_, String>("trade_type")?)
            .unwrap_or(Side::Buy),
        grid_level: row.get("grid_level")?,
        trigger_price: row.get("trigger_price")?,
        volume: row.get("volume")?,
        amount: row.get("amount")?,
        peak_price: row.get("peak_price")?,
        valley_price: row.get("valley_price")?,
        callback_ratio: row.get("callback_ratio")?,
        trade_id: row.get::<_, Option<String>>("trade_id")?.unwrap_or_default(),
        trade_time: parse_ts(row.get::<_, Option<String>>("trade_time")?),
        grid_center_before: row
            .get::<_, Option<f64>>("grid_center_before")?
            .unwrap_or(0.0),
        grid_center_after: row
            .get::<_, Option<f64>>("grid_center_after")?
            .unwrap_or(0.0),
    })
}
