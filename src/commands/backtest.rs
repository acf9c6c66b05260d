use crate::backtester::{BacktestConfig, BacktestReplayer, BacktestReport};
use crate::context::AppContext;
use crate::indicators::required_bars;
use crate::models::StrategyKind;
use crate::strategy::BarInterval;
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use log::info;

pub struct BacktestArgs {
    pub symbol: String,
    pub kind: StrategyKind,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub capital: Option<f64>,
    pub json: bool,
}

pub async fn run(app: &AppContext, args: BacktestArgs) -> Result<()> {
    if args.from > args.to {
        return Err(anyhow!(
            "Backtest start {} is after its end {}",
            args.from,
            args.to
        ));
    }
    let settings = app.settings();
    let profile = settings.profile(args.kind);
    let calendar = &settings.calendar;
    let capital = args.capital.unwrap_or(settings.account_capital);

    // Indicators need a warm-up window before the first evaluated day.
    let session_minutes = (settings.session_close - settings.session_open).num_minutes();
    let warm_up_days =
        warm_up_trading_days(profile.bar_interval, required_bars(profile), session_minutes);
    let warm_up_start = calendar.trading_days_back(args.from, warm_up_days);
    let (from, _) = calendar.day_bounds(warm_up_start);
    let (_, to) = calendar.day_bounds(args.to);

    info!(
        "Received backtest command for {} {} from {} to {} (bars from {}) with capital {:.2}",
        args.kind, args.symbol, args.from, args.to, warm_up_start, capital
    );

    let bars = app
        .market_data()
        .get_bars_between(&args.symbol, profile.bar_interval, from, to)
        .await
        .with_context(|| format!("Failed to load bars for {}", args.symbol))?;
    info!("Loaded {} {} bars for {}", bars.len(), profile.bar_interval.as_str(), args.symbol);

    let replayer = BacktestReplayer::new(profile, calendar);
    let mut config = BacktestConfig::new(capital);
    config.evaluate_from = Some(args.from);
    let report = replayer.run(&args.symbol, &args.symbol, bars, &config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, capital);
    }
    Ok(())
}

/// Trading days of history that hold at least `required` bars of `interval`.
fn warm_up_trading_days(interval: BarInterval, required: usize, session_minutes: i64) -> u32 {
    let bars_per_day = match interval {
        BarInterval::Daily => 1,
        BarInterval::FiveMinutes => {
            (session_minutes / interval.duration().num_minutes()).max(1) as usize
        }
    };
    (required.div_ceil(bars_per_day) + 1) as u32
}

fn print_report(report: &BacktestReport, initial_capital: f64) {
    let stats = &report.statistics;
    println!("{} {} backtest over {} steps", report.kind.label(), report.symbol, report.steps);
    println!(
        "Trades: {} ({} won, {} lost, win rate {:.1}%)",
        stats.total_trades,
        stats.winning_trades,
        stats.losing_trades,
        stats.win_rate * 100.0
    );
    println!(
        "Total P&L: {:.2}  Capital: {:.2} -> {:.2}",
        stats.total_pnl, initial_capital, report.ending_capital
    );
    println!(
        "Trade return: avg {:.2}%  std dev {:.2}%  best {:.2}%  worst {:.2}%",
        stats.avg_trade_return_percent,
        stats.trade_return_std_dev,
        stats.best_trade_percent,
        stats.worst_trade_percent
    );
    println!(
        "Max drawdown: {:.2} ({:.2}%)",
        stats.max_drawdown, stats.max_drawdown_percent
    );

    for trade in &report.trades {
        if let Some(exit) = &trade.exit {
            println!(
                "  {} -> {}  x{}  {:.2} -> {:.2}  {:+.2} ({:+.2}%)  {}",
                trade.bought_at.format("%Y-%m-%d %H:%M"),
                exit.sold_at.format("%Y-%m-%d %H:%M"),
                trade.quantity,
                trade.buy_price,
                exit.price,
                exit.realized_pnl,
                exit.realized_pnl_percent,
                exit.reason
            );
        }
    }
    if let Some(open) = &report.open_position {
        println!(
            "Still open: x{} bought {} @ {:.2} (not counted as a trade)",
            open.quantity,
            open.bought_at.format("%Y-%m-%d %H:%M"),
            open.buy_price
        );
    }
}
