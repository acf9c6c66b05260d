use crate::calendar::TradingCalendar;
use crate::config::{optional_setting_bool, optional_setting_f64, optional_setting_usize};
use crate::models::{ProductType, StrategyKind};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarInterval {
    Daily,
    FiveMinutes,
}

impl BarInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarInterval::Daily => "1d",
            BarInterval::FiveMinutes => "5m",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            BarInterval::Daily => Duration::days(1),
            BarInterval::FiveMinutes => Duration::minutes(5),
        }
    }
}

/// How long a position may be held before it expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldingRule {
    TradingDays(u32),
    IntradayCutoff(NaiveTime),
}

/// Days at the end of a month on which no new position is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthEndBlackout {
    Disabled,
    /// The last `n` calendar days of the month.
    LastDays(u32),
    /// Every day from this day-of-month onwards.
    FromDay(u32),
}

impl MonthEndBlackout {
    pub fn contains(&self, date: NaiveDate) -> bool {
        match *self {
            MonthEndBlackout::Disabled => false,
            MonthEndBlackout::LastDays(days) => {
                let last_day = last_day_of_month(date);
                date.day() + days > last_day
            }
            MonthEndBlackout::FromDay(day) => date.day() >= day,
        }
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

/// Every threshold that distinguishes one trading style from another. The
/// evaluators take a profile by reference and contain no kind-specific branches.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyProfile {
    pub kind: StrategyKind,
    pub bar_interval: BarInterval,
    pub bar_lookback: usize,
    pub long_ema_period: usize,
    pub exit_ema_period: usize,
    pub rsi_period: usize,
    pub rsi_entry_threshold: f64,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    pub fallback_stop_percent: f64,
    pub volume_sma_period: usize,
    pub bollinger_period: usize,
    pub bollinger_multiplier: f64,
    pub require_breakout: bool,
    pub risk_fraction: f64,
    pub reward_multiple: f64,
    pub min_position_notional: f64,
    pub daily_buy_cap: usize,
    pub max_open_positions: usize,
    pub cooldown_trading_days: u32,
    pub profit_target_percent: f64,
    pub trailing_arm_percent: f64,
    pub trailing_lock_ratio: f64,
    pub holding: HoldingRule,
    pub extend_on_scan_presence: bool,
    pub month_end_blackout: MonthEndBlackout,
    pub product_type: ProductType,
}

impl StrategyProfile {
    pub fn swing() -> Self {
        Self {
            kind: StrategyKind::Swing,
            bar_interval: BarInterval::Daily,
            bar_lookback: 120,
            long_ema_period: 50,
            exit_ema_period: 9,
            rsi_period: 14,
            rsi_entry_threshold: 50.0,
            atr_period: 14,
            atr_multiplier: 2.0,
            fallback_stop_percent: 2.5,
            volume_sma_period: 20,
            bollinger_period: 20,
            bollinger_multiplier: 2.0,
            require_breakout: true,
            risk_fraction: 0.01,
            reward_multiple: 3.0,
            min_position_notional: 20_000.0,
            daily_buy_cap: 5,
            max_open_positions: 5,
            cooldown_trading_days: 20,
            profit_target_percent: 10.0,
            trailing_arm_percent: 5.0,
            trailing_lock_ratio: 1.02,
            holding: HoldingRule::TradingDays(10),
            extend_on_scan_presence: true,
            month_end_blackout: MonthEndBlackout::LastDays(3),
            product_type: ProductType::Delivery,
        }
    }

    pub fn scalping() -> Self {
        Self {
            kind: StrategyKind::Scalping,
            bar_interval: BarInterval::FiveMinutes,
            exit_ema_period: 7,
            rsi_entry_threshold: 60.0,
            reward_multiple: 2.0,
            min_position_notional: 10_000.0,
            profit_target_percent: 1.0,
            holding: HoldingRule::IntradayCutoff(
                NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(NaiveTime::MIN),
            ),
            extend_on_scan_presence: false,
            month_end_blackout: MonthEndBlackout::FromDay(28),
            product_type: ProductType::Intraday,
            ..Self::swing()
        }
    }

    pub fn for_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Swing => Self::swing(),
            StrategyKind::Scalping => Self::scalping(),
        }
    }

    /// Defaults for `kind` with `SWING_*` / `SCALPING_*` overrides applied.
    pub fn from_settings(kind: StrategyKind, settings: &HashMap<String, String>) -> Result<Self> {
        let mut profile = Self::for_kind(kind);
        let prefix = kind.as_str().to_ascii_uppercase();
        let key = |name: &str| format!("{}_{}", prefix, name);

        profile.bar_lookback =
            optional_setting_usize(settings, &key("BAR_LOOKBACK"), profile.bar_lookback, 1)?;
        profile.long_ema_period =
            optional_setting_usize(settings, &key("LONG_EMA_PERIOD"), profile.long_ema_period, 1)?;
        profile.exit_ema_period =
            optional_setting_usize(settings, &key("EXIT_EMA_PERIOD"), profile.exit_ema_period, 1)?;
        profile.rsi_period =
            optional_setting_usize(settings, &key("RSI_PERIOD"), profile.rsi_period, 1)?;
        profile.rsi_entry_threshold = optional_setting_f64(
            settings,
            &key("RSI_ENTRY_THRESHOLD"),
            profile.rsi_entry_threshold,
            Some(0.0),
            Some(100.0),
        )?;
        profile.atr_period =
            optional_setting_usize(settings, &key("ATR_PERIOD"), profile.atr_period, 1)?;
        profile.atr_multiplier = optional_setting_f64(
            settings,
            &key("ATR_MULTIPLIER"),
            profile.atr_multiplier,
            Some(0.0),
            None,
        )?;
        profile.fallback_stop_percent = optional_setting_f64(
            settings,
            &key("FALLBACK_STOP_PERCENT"),
            profile.fallback_stop_percent,
            Some(0.0),
            Some(100.0),
        )?;
        profile.volume_sma_period = optional_setting_usize(
            settings,
            &key("VOLUME_SMA_PERIOD"),
            profile.volume_sma_period,
            1,
        )?;
        profile.bollinger_period = optional_setting_usize(
            settings,
            &key("BOLLINGER_PERIOD"),
            profile.bollinger_period,
            1,
        )?;
        profile.bollinger_multiplier = optional_setting_f64(
            settings,
            &key("BOLLINGER_MULTIPLIER"),
            profile.bollinger_multiplier,
            Some(0.0),
            None,
        )?;
        profile.require_breakout =
            optional_setting_bool(settings, &key("REQUIRE_BREAKOUT"), profile.require_breakout)?;
        let base_risk_fraction = optional_setting_f64(
            settings,
            "RISK_FRACTION",
            profile.risk_fraction,
            Some(0.0),
            Some(1.0),
        )?;
        profile.risk_fraction = optional_setting_f64(
            settings,
            &key("RISK_FRACTION"),
            base_risk_fraction,
            Some(0.0),
            Some(1.0),
        )?;
        profile.reward_multiple = optional_setting_f64(
            settings,
            &key("REWARD_MULTIPLE"),
            profile.reward_multiple,
            Some(0.0),
            None,
        )?;
        profile.min_position_notional = optional_setting_f64(
            settings,
            &key("MIN_POSITION_NOTIONAL"),
            profile.min_position_notional,
            Some(0.0),
            None,
        )?;
        profile.daily_buy_cap =
            optional_setting_usize(settings, &key("DAILY_BUY_CAP"), profile.daily_buy_cap, 0)?;
        profile.max_open_positions = optional_setting_usize(
            settings,
            &key("MAX_OPEN_POSITIONS"),
            profile.max_open_positions,
            0,
        )?;
        profile.cooldown_trading_days = optional_setting_usize(
            settings,
            &key("COOLDOWN_TRADING_DAYS"),
            profile.cooldown_trading_days as usize,
            0,
        )? as u32;
        profile.profit_target_percent = optional_setting_f64(
            settings,
            &key("PROFIT_TARGET_PERCENT"),
            profile.profit_target_percent,
            Some(0.0),
            None,
        )?;
        profile.trailing_arm_percent = optional_setting_f64(
            settings,
            &key("TRAILING_ARM_PERCENT"),
            profile.trailing_arm_percent,
            Some(0.0),
            None,
        )?;
        profile.trailing_lock_ratio = optional_setting_f64(
            settings,
            &key("TRAILING_LOCK_RATIO"),
            profile.trailing_lock_ratio,
            Some(0.0),
            None,
        )?;
        profile.extend_on_scan_presence = optional_setting_bool(
            settings,
            &key("EXTEND_ON_SCAN_PRESENCE"),
            profile.extend_on_scan_presence,
        )?;

        match profile.holding {
            HoldingRule::TradingDays(days) => {
                let days = optional_setting_usize(settings, &key("HOLDING_DAYS"), days as usize, 1)?;
                profile.holding = HoldingRule::TradingDays(days as u32);
            }
            HoldingRule::IntradayCutoff(cutoff) => {
                if let Some(raw) = settings
                    .get(&key("INTRADAY_CUTOFF"))
                    .map(|value| value.trim())
                    .filter(|value| !value.is_empty())
                {
                    let parsed = NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| {
                        anyhow!(
                            "Setting {} must be a time in HH:MM format (value: {})",
                            key("INTRADAY_CUTOFF"),
                            raw
                        )
                    })?;
                    profile.holding = HoldingRule::IntradayCutoff(parsed);
                } else {
                    profile.holding = HoldingRule::IntradayCutoff(cutoff);
                }
            }
        }

        if profile.trailing_lock_ratio > 1.0 + profile.trailing_arm_percent / 100.0 {
            return Err(anyhow!(
                "{} ({}) must not lock in more than the arm threshold ({}%)",
                key("TRAILING_LOCK_RATIO"),
                profile.trailing_lock_ratio,
                profile.trailing_arm_percent
            ));
        }

        Ok(profile)
    }

    /// Deadline for a position opened at `opened_at`.
    pub fn expiry_for(&self, opened_at: DateTime<Utc>, calendar: &TradingCalendar) -> DateTime<Utc> {
        match self.holding {
            HoldingRule::TradingDays(days) => calendar.add_trading_days(opened_at, days),
            HoldingRule::IntradayCutoff(cutoff) => {
                calendar.at_local_time(calendar.local_date(opened_at), cutoff)
            }
        }
    }

    pub fn in_month_end_blackout(&self, date: NaiveDate) -> bool {
        self.month_end_blackout.contains(date)
    }

    /// Why no new position may be opened at this local exchange time, if any.
    pub fn entry_blocked_reason(&self, local: NaiveDateTime) -> Option<&'static str> {
        if self.in_month_end_blackout(local.date()) {
            return Some("month_end");
        }
        if let HoldingRule::IntradayCutoff(cutoff) = self.holding {
            if local.time() >= cutoff {
                return Some("past_intraday_cutoff");
            }
        }
        None
    }
}
