use crate::bar_utils::{percent_change, sanitize_bars, visible_window};
use crate::calendar::TradingCalendar;
use crate::entry::{EntryContext, EntryDecision, EntryEvaluator};
use crate::exit::{ExitContext, ExitDecision, ExitEvaluator};
use crate::indicators::{required_bars, IndicatorSnapshot};
use crate::models::{Bar, Position, Quote, ScanCandidate, StrategyKind};
use crate::performance::{BacktestStatistics, PerformanceCalculator};
use crate::strategy::StrategyProfile;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Local dates on which the symbol counts as present in the scan list.
    pub scan_dates: BTreeSet<NaiveDate>,
    /// First local date that is traded; earlier bars only warm up the indicators.
    pub evaluate_from: Option<NaiveDate>,
}

impl BacktestConfig {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            scan_dates: BTreeSet::new(),
            evaluate_from: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestReport {
    pub symbol: String,
    pub kind: StrategyKind,
    pub trades: Vec<Position>,
    pub statistics: BacktestStatistics,
    pub ending_capital: f64,
    /// Still held when the window ended; not counted as a trade.
    pub open_position: Option<Position>,
    pub steps: usize,
}

impl BacktestReport {
    fn empty(symbol: &str, kind: StrategyKind, capital: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            kind,
            trades: Vec::new(),
            statistics: BacktestStatistics::empty(),
            ending_capital: capital,
            open_position: None,
            steps: 0,
        }
    }
}

/// Single-symbol simulated ledger: one open slot, a cash pool and the
/// history the entry gates need.
struct SimulatedBook {
    capital: f64,
    open: Option<Position>,
    trades: Vec<Position>,
    buys_by_day: HashMap<NaiveDate, HashSet<String>>,
}

impl SimulatedBook {
    fn new(capital: f64) -> Self {
        Self {
            capital,
            open: None,
            trades: Vec::new(),
            buys_by_day: HashMap::new(),
        }
    }

    fn buys_on(&self, day: NaiveDate) -> usize {
        self.buys_by_day.get(&day).map_or(0, HashSet::len)
    }

    fn recently_profitable(&self, since: DateTime<Utc>) -> bool {
        self.trades.iter().any(|trade| {
            trade.exit.as_ref().map_or(false, |exit| {
                exit.sold_at >= since && exit.realized_pnl > 0.0
            })
        })
    }

    fn equity(&self, mark: f64) -> f64 {
        self.capital
            + self
                .open
                .as_ref()
                .map_or(0.0, |position| position.quantity as f64 * mark)
    }
}

/// Replays the live entry and exit rules over historical bars of one symbol.
pub struct BacktestReplayer<'a> {
    profile: &'a StrategyProfile,
    calendar: &'a TradingCalendar,
}

impl<'a> BacktestReplayer<'a> {
    pub fn new(profile: &'a StrategyProfile, calendar: &'a TradingCalendar) -> Self {
        Self { profile, calendar }
    }

    pub fn run(
        &self,
        symbol: &str,
        name: &str,
        bars: Vec<Bar>,
        config: &BacktestConfig,
    ) -> Result<BacktestReport> {
        if !(config.initial_capital.is_finite() && config.initial_capital > 0.0) {
            return Err(anyhow!(
                "Initial capital must be positive, got {}",
                config.initial_capital
            ));
        }

        let profile = self.profile;
        let bars: Vec<Bar> = sanitize_bars(bars)
            .into_iter()
            .filter(|bar| {
                self.calendar
                    .is_trading_day(self.calendar.local_date(bar.timestamp))
            })
            .collect();

        let required = required_bars(profile);
        if bars.len() < required {
            warn!(
                "Backtest for {} ({}) has {} bars, {} required; no trades simulated",
                symbol,
                profile.kind,
                bars.len(),
                required
            );
            return Ok(BacktestReport::empty(symbol, profile.kind, config.initial_capital));
        }

        let entry = EntryEvaluator::new(profile, self.calendar);
        let exit = ExitEvaluator::new(profile, self.calendar);
        let lookback = profile.bar_lookback.max(required);

        let mut book = SimulatedBook::new(config.initial_capital);
        let mut equity_curve = vec![config.initial_capital];
        let mut steps = 0;

        for index in (required - 1)..bars.len() {
            let window = visible_window(&bars, index, lookback);
            let bar = &bars[index];
            let now = bar.timestamp;
            let today = self.calendar.local_date(now);
            if config.evaluate_from.map_or(false, |from| today < from) {
                continue;
            }
            let snapshot = IndicatorSnapshot::compute(window, profile);
            let quote = Quote::from_bar(symbol, bar);
            steps += 1;

            if let Some(position) = book.open.as_mut() {
                let context = ExitContext {
                    now,
                    in_scan_list: config.scan_dates.contains(&today),
                };
                match exit.evaluate(position, &quote, &snapshot, &context) {
                    ExitDecision::Extend { new_expiry } => {
                        position.extend_expiry(new_expiry, now);
                    }
                    ExitDecision::Hold {
                        trailing: Some(update),
                    } => {
                        position.raise_trailing_stop(update.level, update.peak_price, now);
                    }
                    ExitDecision::Hold { trailing: None } => {}
                    ExitDecision::Sell { reason, price } => {
                        if let Some(mut closed) = book.open.take() {
                            closed.close(now, price, reason);
                            book.capital += closed.quantity as f64 * price;
                            debug!(
                                "{} sold {} @ {:.2} on {}: {}",
                                profile.kind, symbol, price, today, reason
                            );
                            book.trades.push(closed);
                        }
                    }
                }
            }

            if book.open.is_none()
                && profile
                    .entry_blocked_reason(self.calendar.local_datetime(now))
                    .is_none()
            {
                self.try_enter(&entry, &mut book, symbol, name, &bars, index, &quote, &snapshot)?;
            }

            equity_curve.push(book.equity(bar.close));
        }

        let statistics = PerformanceCalculator::calculate(&book.trades, &equity_curve);
        info!(
            "Backtest {} ({}): {} trades, P&L {:.2}, win rate {:.2}%",
            symbol,
            profile.kind,
            statistics.total_trades,
            statistics.total_pnl,
            statistics.win_rate * 100.0
        );

        Ok(BacktestReport {
            symbol: symbol.to_string(),
            kind: profile.kind,
            trades: book.trades,
            statistics,
            ending_capital: book.capital,
            open_position: book.open,
            steps,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn try_enter(
        &self,
        entry: &EntryEvaluator<'_>,
        book: &mut SimulatedBook,
        symbol: &str,
        name: &str,
        bars: &[Bar],
        index: usize,
        quote: &Quote,
        snapshot: &IndicatorSnapshot,
    ) -> Result<()> {
        let bar = &bars[index];
        let now = bar.timestamp;
        let today = self.calendar.local_date(now);
        let previous_close = index
            .checked_sub(1)
            .map_or(bar.open, |previous| bars[previous].close);
        let candidate = ScanCandidate {
            symbol: symbol.to_string(),
            name: name.to_string(),
            scanned_at: now,
            last_close: bar.close,
            percent_change: percent_change(previous_close, bar.close),
            volume: bar.volume,
        };

        let window_start = self
            .calendar
            .trading_days_back(today, self.profile.cooldown_trading_days);
        let (cooldown_from, _) = self.calendar.day_bounds(window_start);
        let context = EntryContext {
            now,
            has_open_position: false,
            recently_profitable: book.recently_profitable(cooldown_from),
            daily_unique_buys: book.buys_on(today),
            open_positions: 0,
            capital: book.capital,
        };

        match entry.evaluate(&candidate, quote, snapshot, &context) {
            EntryDecision::Buy(plan) => {
                let notional = plan.notional();
                let position = Position::open(plan.into_draft(None, now))?;
                book.capital -= notional;
                book.buys_by_day
                    .entry(today)
                    .or_default()
                    .insert(symbol.to_string());
                debug!(
                    "{} bought {} x{} @ {:.2} on {}",
                    self.profile.kind, symbol, position.quantity, position.buy_price, today
                );
                book.open = Some(position);
            }
            EntryDecision::Skip { .. } => {}
        }
        Ok(())
    }
}
