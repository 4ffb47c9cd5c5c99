//! Position Listing Command

use anyhow::{Context, Result};

use equity_sentinel::config::Config;
use equity_sentinel::store::StateStore;

pub fn run(config_path: Option<String>) -> Result<()> {
    dotenv::dotenv().ok();
    let config = match &config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => Config::from_env().context("Failed to build default config")?,
    };

    let store = StateStore::open(&config.storage.db_path)?;
    let snapshot = store.snapshot()?;

    println!("data_version: {}", snapshot.data_version);
    if snapshot.positions.is_empty() {
        println!("No positions held.");
    } else {
        println!(
            "{:<12} {:>8} {:>8} {:>9} {:>9} {:>9} {:>8} {:>5}",
            "stock", "volume", "avail", "cost", "current", "highest", "profit%", "tp"
        );
        for p in &snapshot.positions {
            println!(
                "{:<12} {:>8} {:>8} {:>9.3} {:>9.3} {:>9.3} {:>8.2} {:>5}",
                p.stock_code.to_string(),
                p.volume,
                p.available,
                p.cost_price,
                p.current_price,
                p.highest_price,
                p.profit_ratio() * 100.0,
                if p.profit_triggered { "yes" } else { "no" }
            );
        }
    }

    if !snapshot.active_sessions.is_empty() {
        println!();
        println!("{} active grid session(s):", snapshot.active_sessions.len());
        for s in &snapshot.active_sessions {
            println!(
                "  #{} {} center {:.3} -> {:.3}, {} trades, profit {:.2}%",
                s.id,
                s.stock_code,
                s.center_price,
                s.current_center_price,
                s.trade_count,
                s.profit_ratio() * 100.0
            );
        }
    }
    Ok(())
}
