//! Grid Session Commands
//!
//! Start, stop and list grid sessions against the daemon's state store,
//! and manage the stored grid-parameter templates sessions can start from.
//! Preconditions (position held, first-stage take-profit committed, valid
//! center price, known template) are enforced by the grid manager, so this
//! surface returns the same structured reasons the web API would.

use anyhow::{Context, Result};
use std::sync::Arc;

use equity_sentinel::broker::{CallbackHub, SimulatedBroker};
use equity_sentinel::config::Config;
use equity_sentinel::executor::OrderExecutor;
use equity_sentinel::grid::manager::{GridSessionRequest, GridTradingManager};
use equity_sentinel::grid::session::{GridTemplate, StopReason};
use equity_sentinel::market::ReplayTickProvider;
use equity_sentinel::store::StateStore;
use equity_sentinel::types::StockCode;

fn load_config(config_path: Option<&str>) -> Result<Config> {
    dotenv::dotenv().ok();
    match config_path {
        Some(path) => {
            Config::from_file(path).with_context(|| format!("Failed to load config from {path}"))
        }
        None => Config::from_env().context("Failed to build default config"),
    }
}

fn build_manager(config: Config) -> Result<(Arc<GridTradingManager>, StateStore)> {
    let config = Arc::new(config);
    let store = StateStore::open(&config.storage.db_path)?;
    let hub = CallbackHub::new();
    let broker = Arc::new(SimulatedBroker::new(hub, false));
    let market = Arc::new(ReplayTickProvider::new());
    let executor = Arc::new(OrderExecutor::new(
        store.clone(),
        broker,
        market,
        Arc::clone(&config),
    ));
    let manager = Arc::new(GridTradingManager::new(
        store.clone(),
        Arc::clone(&executor),
        config,
    ));
    executor.attach_grid_manager(Arc::clone(&manager));
    manager.recover();
    Ok((manager, store))
}

#[allow(clippy::too_many_arguments)]
pub fn start(
    config_path: Option<String>,
    stock_code: String,
    max_investment: Option<f64>,
    template: Option<String>,
    center_price: Option<f64>,
    price_interval: Option<f64>,
    position_ratio: Option<f64>,
    callback_ratio: Option<f64>,
    duration_days: Option<i64>,
) -> Result<()> {
    if max_investment.is_none() && template.is_none() {
        anyhow::bail!("provide --max-investment, or --template so the cap can be derived");
    }
    let config = load_config(config_path.as_deref())?;
    let (manager, _store) = build_manager(config)?;

    let request = GridSessionRequest {
        center_price,
        price_interval,
        position_ratio,
        callback_ratio,
        max_investment: max_investment.unwrap_or(0.0),
        duration_days,
        template,
        ..Default::default()
    };
    let code = StockCode::new(&stock_code);
    match manager.start_session(&code, &request) {
        Ok(session) => {
            let levels = session.levels();
            println!("Grid session {} started for {}", session.id, stock_code);
            println!(
                "  center {:.3}  levels [{:.3} / {:.3}]  interval {:.1}%",
                session.center_price,
                levels.lower,
                levels.upper,
                session.price_interval * 100.0
            );
            println!(
                "  max investment {:.2}  runs until {}",
                session.max_investment,
                session.end_time.format("%Y-%m-%d %H:%M:%S")
            );
            Ok(())
        }
        Err(e) => {
            anyhow::bail!("start refused [{}]: {}", e.reason_code(), e)
        }
    }
}

pub fn stop(config_path: Option<String>, session_id: i64) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let (manager, _store) = build_manager(config)?;

    let stats = manager
        .stop_session(session_id, StopReason::UserRequested)
        .map_err(|e| anyhow::anyhow!("stop refused [{}]: {}", e.reason_code(), e))?;
    println!(
        "Session {} ({}) stopped: {} trades, profit {:.2}%, reason={}",
        session_id,
        stats.stock_code,
        stats.trade_count,
        stats.profit_ratio * 100.0,
        stats.stop_reason
    );
    Ok(())
}

pub fn list(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let store = StateStore::open(&config.storage.db_path)?;

    let sessions = store.list_active_grid_sessions()?;
    if sessions.is_empty() {
        println!("No active grid sessions.");
        return Ok(());
    }
    println!(
        "{:<6} {:<12} {:>10} {:>10} {:>7} {:>9} {:>12}",
        "id", "stock", "center", "current", "trades", "profit%", "ends"
    );
    for s in sessions {
        println!(
            "{:<6} {:<12} {:>10.3} {:>10.3} {:>7} {:>9.2} {:>12}",
            s.id,
            s.stock_code.to_string(),
            s.center_price,
            s.current_center_price,
            s.trade_count,
            s.profit_ratio() * 100.0,
            s.end_time.format("%m-%d %H:%M")
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn template_save(
    config_path: Option<String>,
    name: String,
    price_interval: Option<f64>,
    position_ratio: Option<f64>,
    callback_ratio: Option<f64>,
    max_deviation: Option<f64>,
    target_profit: Option<f64>,
    stop_loss: Option<f64>,
    duration_days: Option<i64>,
    max_investment_ratio: Option<f64>,
    description: Option<String>,
    default: bool,
) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let store = StateStore::open(&config.storage.db_path)?;

    // Editing an existing template only touches the flags given; a new
    // name starts from the balanced baseline.
    let mut template = store
        .get_grid_template(&name)?
        .unwrap_or_else(|| GridTemplate::new(&name));
    if let Some(v) = price_interval {
        template.price_interval = v;
    }
    if let Some(v) = position_ratio {
        template.position_ratio = v;
    }
    if let Some(v) = callback_ratio {
        template.callback_ratio = v;
    }
    if let Some(v) = max_deviation {
        template.max_deviation = v;
    }
    if let Some(v) = target_profit {
        template.target_profit = v;
    }
    if let Some(v) = stop_loss {
        template.stop_loss = v;
    }
    if let Some(v) = duration_days {
        template.duration_days = v;
    }
    if let Some(v) = max_investment_ratio {
        template.max_investment_ratio = v;
    }
    if let Some(v) = description {
        template.description = v;
    }
    template.is_default = default || template.is_default;

    store.save_grid_template(&template)?;
    println!(
        "Template '{}' saved: interval {:.1}%, position {:.0}%, callback {:.2}%, \
         target {:.1}%, stop {:.1}%, {} days{}",
        template.name,
        template.price_interval * 100.0,
        template.position_ratio * 100.0,
        template.callback_ratio * 100.0,
        template.target_profit * 100.0,
        template.stop_loss * 100.0,
        template.duration_days,
        if template.is_default { " (default)" } else { "" }
    );
    Ok(())
}

pub fn template_list(config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let store = StateStore::open(&config.storage.db_path)?;

    let templates = store.list_grid_templates()?;
    if templates.is_empty() {
        println!("No grid templates stored.");
        return Ok(());
    }
    println!(
        "{:<16} {:>9} {:>9} {:>9} {:>8} {:>8} {:>5} {:>7}",
        "name", "interval%", "position%", "callback%", "target%", "stop%", "days", "default"
    );
    for t in templates {
        println!(
            "{:<16} {:>9.1} {:>9.0} {:>9.2} {:>8.1} {:>8.1} {:>5} {:>7}",
            t.name,
            t.price_interval * 100.0,
            t.position_ratio * 100.0,
            t.callback_ratio * 100.0,
            t.target_profit * 100.0,
            t.stop_loss * 100.0,
            t.duration_days,
            if t.is_default { "yes" } else { "" }
        );
        if !t.description.is_empty() {
            println!("{:<16} {}", "", t.description);
        }
    }
    Ok(())
}

pub fn template_delete(config_path: Option<String>, name: String) -> Result<()> {
    let config = load_config(config_path.as_deref())?;
    let store = StateStore::open(&config.storage.db_path)?;

    if store.delete_grid_template(&name)? {
        println!("Template '{name}' deleted.");
    } else {
        println!("No template named '{name}'.");
    }
    Ok(())
}
