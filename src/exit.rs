use crate::calendar::TradingCalendar;
use crate::indicators::IndicatorSnapshot;
use crate::models::{Position, Quote, SellReason};
use crate::strategy::StrategyProfile;
use crate::trading_rules::volatility_stop;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitContext {
    pub now: DateTime<Utc>,
    pub in_scan_list: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    pub level: f64,
    pub peak_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitDecision {
    /// Symbol is still being scanned: push the deadline out, do not sell.
    Extend { new_expiry: DateTime<Utc> },
    Sell { reason: SellReason, price: f64 },
    /// Keep the position; persist a newly armed or raised trailing stop if any.
    Hold { trailing: Option<TrailingUpdate> },
}

impl ExitDecision {
    pub fn sell_reason(&self) -> Option<SellReason> {
        match self {
            ExitDecision::Sell { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Applies the exit rules in fixed precedence; the first match wins.
pub struct ExitEvaluator<'a> {
    profile: &'a StrategyProfile,
    calendar: &'a TradingCalendar,
}

impl<'a> ExitEvaluator<'a> {
    pub fn new(profile: &'a StrategyProfile, calendar: &'a TradingCalendar) -> Self {
        Self { profile, calendar }
    }

    pub fn evaluate(
        &self,
        position: &Position,
        quote: &Quote,
        snapshot: &IndicatorSnapshot,
        context: &ExitContext,
    ) -> ExitDecision {
        let profile = self.profile;
        let now = context.now;

        // 1. scanner presence
        if context.in_scan_list && profile.extend_on_scan_presence {
            let base = position.expiry.max(now);
            return ExitDecision::Extend {
                new_expiry: self.calendar.add_trading_days(base, 1),
            };
        }

        let price = quote.last_price;
        if price <= 0.0 || !price.is_finite() {
            return ExitDecision::Hold { trailing: None };
        }
        let sell = |reason| ExitDecision::Sell { reason, price };
        let profit_percent = position.profit_percent(price);

        // 2. hard profit target
        if profit_percent >= profile.profit_target_percent {
            return sell(SellReason::ProfitTarget);
        }

        // 3. expiry
        if now >= position.expiry {
            return sell(SellReason::Expired);
        }

        // 4. trailing stop, armed once the best price cleared the threshold
        let peak_price = position.peak_price.max(price);
        let mut trailing = None;
        if position.profit_percent(peak_price) > profile.trailing_arm_percent
            || position.trailing_stop.is_some()
        {
            let lock_level = position.buy_price * profile.trailing_lock_ratio;
            let level = position
                .trailing_stop
                .map_or(lock_level, |current| current.max(lock_level));
            if price <= level {
                return sell(SellReason::TrailingStop);
            }
            let raised = position.trailing_stop.map_or(true, |current| level > current);
            if raised || peak_price > position.peak_price {
                trailing = Some(TrailingUpdate { level, peak_price });
            }
        }

        // 5. volatility stop
        let stop = volatility_stop(
            position.buy_price,
            snapshot.atr,
            profile.atr_multiplier,
            profile.fallback_stop_percent,
        );
        if price <= stop {
            return sell(SellReason::StopLoss);
        }

        // 6. confirmed down candle below the exit EMA
        let close = quote.current_close();
        if let Some(exit_ema) = snapshot.exit_ema {
            if close < exit_ema && close < quote.open {
                return sell(SellReason::EmaBreakdown);
            }
        }

        // 7. volume exhaustion on a later session while under water
        if let (Some(volume), Some(volume_sma)) = (snapshot.last_volume(), snapshot.volume_sma) {
            let later_day =
                self.calendar.local_date(now) > self.calendar.local_date(position.bought_at);
            if (volume as f64) < volume_sma && price < position.buy_price && later_day {
                return sell(SellReason::VolumeDrop);
            }
        }

        ExitDecision::Hold { trailing }
    }
}
