use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use trader::{
    commands::{auth, backtest, buy, encrypt_secret, sell, status},
    context::AppContext,
    models::StrategyKind,
};

#[derive(Parser)]
#[command(name = "trader")]
#[command(about = "Risk-sized swing and scalping entries and exits for NSE equities")]
struct Cli {
    /// JSON settings file; environment variables override its values
    #[arg(long, global = true, value_name = "PATH")]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one entry pass over the scan list
    Buy {
        #[arg(long, value_enum, default_value = "swing")]
        kind: StrategyKind,
    },
    /// Run one exit pass over open positions
    Sell {
        #[arg(long, value_enum, default_value = "swing")]
        kind: StrategyKind,
    },
    /// Send the portfolio status report
    Status,
    /// Refresh the broker session
    Auth,
    /// Replay the entry and exit rules over historical bars of one symbol
    Backtest {
        #[arg(long)]
        symbol: String,
        #[arg(long, value_enum, default_value = "swing")]
        kind: StrategyKind,
        /// First evaluated day (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last evaluated day (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
        /// Starting capital; defaults to ACCOUNT_CAPITAL
        #[arg(long)]
        capital: Option<f64>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Encrypt a settings value with TRADER_SECRETS_KEY
    EncryptSecret { value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { settings, command } = Cli::parse();

    if let Commands::EncryptSecret { value } = &command {
        return encrypt_secret::run(value);
    }

    let app_context = AppContext::initialize(settings.as_deref()).await?;
    info!("Starting trader. Not financial advice. Use at your own risk.");

    match command {
        Commands::Buy { kind } => buy::run(&app_context, kind).await?,
        Commands::Sell { kind } => sell::run(&app_context, kind).await?,
        Commands::Status => status::run(&app_context).await?,
        Commands::Auth => auth::run(&app_context).await?,
        Commands::Backtest {
            symbol,
            kind,
            from,
            to,
            capital,
            json,
        } => {
            backtest::run(
                &app_context,
                backtest::BacktestArgs {
                    symbol,
                    kind,
                    from,
                    to,
                    capital,
                    json,
                },
            )
            .await?;
        }
        Commands::EncryptSecret { .. } => {}
    }

    Ok(())
}
