//! Equity sentinel - main entry point
//!
//! This binary provides three subcommands:
//! - run: start the unattended monitoring daemon
//! - grid: start/stop/list grid trading sessions
//! - positions: show held positions and active sessions

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "equity-sentinel")]
#[command(about = "Unattended equity daemon with dynamic stop-profit/stop-loss and grid trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitoring daemon until interrupted
    Run {
        /// Path to configuration file (defaults + env when omitted)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Manage grid trading sessions
    Grid {
        #[command(subcommand)]
        action: GridAction,
    },

    /// Show held positions and active grid sessions
    Positions {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum GridAction {
    /// Start a grid session on a held symbol
    Start {
        /// Market-qualified stock code, e.g. 000001.SZ
        stock_code: String,

        /// Cap on cumulative buying within the session
        /// (derived from the template's ratio when omitted)
        #[arg(long)]
        max_investment: Option<f64>,

        /// Stored grid-parameter preset to start from
        #[arg(long)]
        template: Option<String>,

        /// Center price (defaults to the position's highest price)
        #[arg(long)]
        center_price: Option<f64>,

        /// Grid spacing as a ratio, e.g. 0.05
        #[arg(long)]
        price_interval: Option<f64>,

        /// Fraction of the holding sold per grid sell
        #[arg(long)]
        position_ratio: Option<f64>,

        /// Required pullback from peak / bounce from valley
        #[arg(long)]
        callback_ratio: Option<f64>,

        /// Session lifetime in days
        #[arg(long)]
        duration_days: Option<i64>,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Stop a session by id
    Stop {
        session_id: i64,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// List active sessions
    List {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Manage stored grid-parameter templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateAction {
    /// Create or update a named template
    Save {
        name: String,

        #[arg(long)]
        price_interval: Option<f64>,

        #[arg(long)]
        position_ratio: Option<f64>,

        #[arg(long)]
        callback_ratio: Option<f64>,

        #[arg(long)]
        max_deviation: Option<f64>,

        #[arg(long)]
        target_profit: Option<f64>,

        #[arg(long)]
        stop_loss: Option<f64>,

        #[arg(long)]
        duration_days: Option<i64>,

        /// Fraction of the position's value used as the investment cap
        #[arg(long)]
        max_investment_ratio: Option<f64>,

        #[arg(long)]
        description: Option<String>,

        /// Make this the default template
        #[arg(long)]
        default: bool,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// List stored templates
    List {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Delete a template by name
    Delete {
        name: String,

        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{level},rusqlite=warn,tokio=warn");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Grid { .. } => "grid",
        Commands::Positions { .. } => "positions",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run { config } => commands::run::run(config),

        Commands::Grid { action } => match action {
            GridAction::Start {
                stock_code,
                max_investment,
                template,
                center_price,
                price_interval,
                position_ratio,
                callback_ratio,
                duration_days,
                config,
            } => commands::grid::start(
                config,
                stock_code,
                max_investment,
                template,
                center_price,
                price_interval,
                position_ratio,
                callback_ratio,
                duration_days,
            ),
            GridAction::Stop { session_id, config } => commands::grid::stop(config, session_id),
            GridAction::List { config } => commands::grid::list(config),
            GridAction::Template { action } => match action {
                TemplateAction::Save {
                    name,
                    price_interval,
                    position_ratio,
                    callback_ratio,
                    max_deviation,
                    target_profit,
                    stop_loss,
                    duration_days,
                    max_investment_ratio,
                    description,
                    default,
                    config,
                } => commands::grid::template_save(
                    config,
                    name,
                    price_interval,
                    position_ratio,
                    callback_ratio,
                    max_deviation,
                    target_profit,
                    stop_loss,
                    duration_days,
                    max_investment_ratio,
                    description,
                    default,
                ),
                TemplateAction::List { config } => commands::grid::template_list(config),
                TemplateAction::Delete { name, config } => {
                    commands::grid::template_delete(config, name)
                }
            },
        },

        Commands::Positions { config } => commands::positions::run(config),
    }
}
