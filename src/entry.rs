use crate::calendar::TradingCalendar;
use crate::indicators::IndicatorSnapshot;
use crate::models::{EntryOhlc, OrderType, PositionDraft, Quote, ScanCandidate, StrategyKind};
use crate::strategy::StrategyProfile;
use crate::trading_rules::{
    determine_position_size, per_share_risk, protective_levels, PositionSizingOutcome,
    PositionSizingParams,
};
use chrono::{DateTime, Utc};

/// Ledger and account state the entry gates consult for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryContext {
    pub now: DateTime<Utc>,
    pub has_open_position: bool,
    pub recently_profitable: bool,
    pub daily_unique_buys: usize,
    pub open_positions: usize,
    pub capital: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub symbol: String,
    pub name: String,
    pub kind: StrategyKind,
    pub order_type: OrderType,
    pub fill_price: f64,
    pub quantity: i32,
    pub per_share_risk: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub expiry: DateTime<Utc>,
    pub entry_ohlc: EntryOhlc,
}

impl EntryPlan {
    pub fn notional(&self) -> f64 {
        self.fill_price * self.quantity as f64
    }

    pub fn into_draft(self, order_id: Option<String>, bought_at: DateTime<Utc>) -> PositionDraft {
        PositionDraft {
            symbol: self.symbol,
            name: self.name,
            kind: self.kind,
            order_id,
            bought_at,
            buy_price: self.fill_price,
            quantity: self.quantity,
            expiry: self.expiry,
            entry_ohlc: self.entry_ohlc,
            stop_loss: self.stop_loss,
            target: self.target,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Buy(EntryPlan),
    Skip {
        reason: &'static str,
        details: Option<String>,
    },
}

impl EntryDecision {
    fn skip(reason: &'static str) -> Self {
        EntryDecision::Skip {
            reason,
            details: None,
        }
    }

    fn skip_with(reason: &'static str, details: String) -> Self {
        EntryDecision::Skip {
            reason,
            details: Some(details),
        }
    }

    pub fn is_buy(&self) -> bool {
        matches!(self, EntryDecision::Buy(_))
    }
}

/// Runs the entry gates in order; the first failing gate skips the candidate.
pub struct EntryEvaluator<'a> {
    profile: &'a StrategyProfile,
    calendar: &'a TradingCalendar,
}

impl<'a> EntryEvaluator<'a> {
    pub fn new(profile: &'a StrategyProfile, calendar: &'a TradingCalendar) -> Self {
        Self { profile, calendar }
    }

    /// Open slots left for this kind: bounded by capital per minimum position
    /// and by the unused part of the daily cap.
    pub fn available_slots(&self, capital: f64, daily_unique_buys: usize) -> usize {
        let by_capital = if self.profile.min_position_notional > 0.0 {
            (capital.max(0.0) / self.profile.min_position_notional).floor() as usize
        } else {
            usize::MAX
        };
        let by_cap = self.profile.daily_buy_cap.saturating_sub(daily_unique_buys);
        by_capital.min(by_cap)
    }

    /// The gates that need only ledger and account state. A live pass runs
    /// these before spending market data calls on a candidate.
    pub fn check_limits(&self, context: &EntryContext) -> Option<EntryDecision> {
        let profile = self.profile;

        if context.has_open_position {
            return Some(EntryDecision::skip("already_open"));
        }

        if context.recently_profitable {
            return Some(EntryDecision::skip_with(
                "cool_down",
                format!(
                    "closed at a profit within {} trading days",
                    profile.cooldown_trading_days
                ),
            ));
        }

        if context.daily_unique_buys >= profile.daily_buy_cap {
            return Some(EntryDecision::skip_with(
                "daily_cap",
                format!("{} of {} buys today", context.daily_unique_buys, profile.daily_buy_cap),
            ));
        }

        if context.open_positions >= profile.max_open_positions {
            return Some(EntryDecision::skip_with(
                "portfolio_cap",
                format!(
                    "{} of {} positions open",
                    context.open_positions, profile.max_open_positions
                ),
            ));
        }

        if self.available_slots(context.capital, context.daily_unique_buys) == 0 {
            return Some(EntryDecision::skip_with(
                "insufficient_capital",
                format!(
                    "capital {:.2} below minimum position {:.2}",
                    context.capital, profile.min_position_notional
                ),
            ));
        }

        None
    }

    pub fn evaluate(
        &self,
        candidate: &ScanCandidate,
        quote: &Quote,
        snapshot: &IndicatorSnapshot,
        context: &EntryContext,
    ) -> EntryDecision {
        if let Some(decision) = self.check_limits(context) {
            return decision;
        }

        let profile = self.profile;
        let (order_type, price) = if quote.last_price > 0.0 && quote.last_price.is_finite() {
            (OrderType::Limit, quote.last_price)
        } else if candidate.last_close > 0.0 && candidate.last_close.is_finite() {
            (OrderType::Market, candidate.last_close)
        } else {
            return EntryDecision::skip("missing_price");
        };

        if let Some(decision) = self.check_trend_and_strength(price, snapshot) {
            return decision;
        }

        let Some(risk) = per_share_risk(
            price,
            snapshot.atr,
            profile.atr_multiplier,
            profile.fallback_stop_percent,
        ) else {
            return EntryDecision::skip("quantity_zero");
        };

        let allocation = match determine_position_size(PositionSizingParams {
            price,
            capital: context.capital,
            risk_fraction: profile.risk_fraction,
            per_share_risk: risk,
        }) {
            PositionSizingOutcome::Sized(allocation) => allocation,
            PositionSizingOutcome::TooSmall => {
                return EntryDecision::skip_with(
                    "quantity_zero",
                    format!("per-share risk {:.2} exceeds risk budget", risk),
                )
            }
            PositionSizingOutcome::InsufficientCash { required } => {
                return EntryDecision::skip_with(
                    "insufficient_capital",
                    format!("requires {:.2}", required),
                )
            }
        };

        let levels = protective_levels(price, risk, profile.reward_multiple);
        EntryDecision::Buy(EntryPlan {
            symbol: candidate.symbol.clone(),
            name: candidate.name.clone(),
            kind: profile.kind,
            order_type,
            fill_price: price,
            quantity: allocation.quantity,
            per_share_risk: risk,
            stop_loss: levels.stop_loss,
            target: levels.target,
            expiry: profile.expiry_for(context.now, self.calendar),
            entry_ohlc: EntryOhlc::from_quote(quote),
        })
    }

    fn check_trend_and_strength(
        &self,
        price: f64,
        snapshot: &IndicatorSnapshot,
    ) -> Option<EntryDecision> {
        let profile = self.profile;

        let Some(long_ema) = snapshot.long_ema else {
            return Some(EntryDecision::skip_with(
                "insufficient_data",
                format!("EMA{} unavailable", profile.long_ema_period),
            ));
        };
        if price <= long_ema {
            return Some(EntryDecision::skip_with(
                "not_uptrend",
                format!("price {:.2} <= EMA{} {:.2}", price, profile.long_ema_period, long_ema),
            ));
        }

        let Some(rsi) = snapshot.rsi else {
            return Some(EntryDecision::skip_with(
                "insufficient_data",
                "RSI unavailable".to_string(),
            ));
        };
        if rsi <= profile.rsi_entry_threshold {
            return Some(EntryDecision::skip_with(
                "weak_momentum",
                format!("RSI {:.2} <= {:.2}", rsi, profile.rsi_entry_threshold),
            ));
        }

        let (Some(volume), Some(volume_sma)) = (snapshot.last_volume(), snapshot.volume_sma) else {
            return Some(EntryDecision::skip_with(
                "insufficient_data",
                "volume average unavailable".to_string(),
            ));
        };
        if volume as f64 <= volume_sma {
            return Some(EntryDecision::skip_with(
                "low_volume",
                format!("volume {} <= average {:.0}", volume, volume_sma),
            ));
        }

        if profile.require_breakout {
            let (Some(bands), Some(close)) = (snapshot.bollinger, snapshot.last_close()) else {
                return Some(EntryDecision::skip_with(
                    "insufficient_data",
                    "Bollinger bands unavailable".to_string(),
                ));
            };
            if close <= bands.upper {
                return Some(EntryDecision::skip_with(
                    "no_breakout",
                    format!("close {:.2} <= upper band {:.2}", close, bands.upper),
                ));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::BollingerBands;
    use crate::models::Bar;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 6, 9, 55, 0).unwrap()
    }

    fn candidate() -> ScanCandidate {
        ScanCandidate {
            symbol: "TATAPOWER".to_string(),
            name: "Tata Power".to_string(),
            scanned_at: now(),
            last_close: 100.0,
            percent_change: 4.2,
            volume: 2_000_000,
        }
    }

    fn quote(price: f64) -> Quote {
        Quote {
            symbol: "TATAPOWER".to_string(),
            last_price: price,
            open: 97.0,
            high: price + 1.0,
            low: 96.0,
            close: price,
            volume: 2_000_000,
            timestamp: now(),
        }
    }

    fn bullish_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            long_ema: Some(90.0),
            exit_ema: Some(98.0),
            rsi: Some(65.0),
            atr: Some(5.0),
            volume_sma: Some(1_000_000.0),
            bollinger: Some(BollingerBands {
                upper: 99.0,
                middle: 95.0,
                lower: 91.0,
            }),
            last_bar: Some(Bar {
                timestamp: now(),
                open: 97.0,
                high: 101.0,
                low: 96.0,
                close: 100.0,
                volume: 2_000_000,
            }),
        }
    }

    fn context() -> EntryContext {
        EntryContext {
            now: now(),
            has_open_position: false,
            recently_profitable: false,
            daily_unique_buys: 0,
            open_positions: 0,
            capital: 100_000.0,
        }
    }

    fn skip_reason(decision: EntryDecision) -> &'static str {
        match decision {
            EntryDecision::Skip { reason, .. } => reason,
            EntryDecision::Buy(plan) => panic!("expected skip, got buy {:?}", plan),
        }
    }

    #[test]
    fn accepts_breakout_and_sizes_by_atr() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);

        let decision = evaluator.evaluate(&candidate(), &quote(100.0), &bullish_snapshot(), &context());
        let EntryDecision::Buy(plan) = decision else {
            panic!("expected buy");
        };
        assert_eq!(plan.quantity, 100);
        assert_eq!(plan.order_type, OrderType::Limit);
        assert!((plan.stop_loss - 90.0).abs() < 1e-9);
        assert!((plan.target - 130.0).abs() < 1e-9);
        assert!(plan.stop_loss < plan.fill_price && plan.fill_price < plan.target);
        assert_eq!(plan.expiry, calendar.add_trading_days(now(), 10));
    }

    #[test]
    fn scalping_uses_two_r_target_and_intraday_cutoff() {
        let profile = StrategyProfile::scalping();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);
        let mut ctx = context();
        ctx.now = Utc.with_ymd_and_hms(2025, 5, 6, 4, 0, 0).unwrap();

        let decision = evaluator.evaluate(&candidate(), &quote(100.0), &bullish_snapshot(), &ctx);
        let EntryDecision::Buy(plan) = decision else {
            panic!("expected buy");
        };
        assert!((plan.target - 120.0).abs() < 1e-9);
        // 14:30 IST
        assert_eq!(plan.expiry, Utc.with_ymd_and_hms(2025, 5, 6, 9, 0, 0).unwrap());
    }

    #[test]
    fn gates_fire_in_order() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);
        let snapshot = bullish_snapshot();

        let mut ctx = context();
        ctx.has_open_position = true;
        ctx.recently_profitable = true;
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &snapshot, &ctx)),
            "already_open"
        );

        ctx.has_open_position = false;
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &snapshot, &ctx)),
            "cool_down"
        );

        ctx.recently_profitable = false;
        ctx.daily_unique_buys = 5;
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &snapshot, &ctx)),
            "daily_cap"
        );

        ctx.daily_unique_buys = 0;
        ctx.capital = 15_000.0;
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &snapshot, &ctx)),
            "insufficient_capital"
        );
    }

    #[test]
    fn trend_filter_rejects_weak_setups() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);

        let mut below_trend = bullish_snapshot();
        below_trend.long_ema = Some(120.0);
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &below_trend, &context())),
            "not_uptrend"
        );

        let mut weak = bullish_snapshot();
        weak.rsi = Some(45.0);
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &weak, &context())),
            "weak_momentum"
        );

        let mut quiet = bullish_snapshot();
        quiet.volume_sma = Some(5_000_000.0);
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &quiet, &context())),
            "low_volume"
        );

        let mut inside_band = bullish_snapshot();
        inside_band.bollinger = Some(BollingerBands {
            upper: 105.0,
            middle: 95.0,
            lower: 85.0,
        });
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &inside_band, &context())),
            "no_breakout"
        );

        let mut missing = bullish_snapshot();
        missing.long_ema = None;
        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &missing, &context())),
            "insufficient_data"
        );
    }

    #[test]
    fn zero_quantity_is_a_skip() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);
        let mut volatile = bullish_snapshot();
        volatile.atr = Some(600.0);

        assert_eq!(
            skip_reason(evaluator.evaluate(&candidate(), &quote(100.0), &volatile, &context())),
            "quantity_zero"
        );
    }

    #[test]
    fn missing_last_price_falls_back_to_market_order() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);

        let decision = evaluator.evaluate(&candidate(), &quote(0.0), &bullish_snapshot(), &context());
        let EntryDecision::Buy(plan) = decision else {
            panic!("expected buy");
        };
        assert_eq!(plan.order_type, OrderType::Market);
        assert!((plan.fill_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn slots_respect_capital_and_daily_cap() {
        let profile = StrategyProfile::swing();
        let calendar = TradingCalendar::nse_2025();
        let evaluator = EntryEvaluator::new(&profile, &calendar);

        assert_eq!(evaluator.available_slots(100_000.0, 0), 5);
        assert_eq!(evaluator.available_slots(100_000.0, 3), 2);
        assert_eq!(evaluator.available_slots(45_000.0, 0), 2);
        assert_eq!(evaluator.available_slots(19_999.0, 0), 0);
    }
}
