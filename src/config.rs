use crate::calendar::TradingCalendar;
use crate::models::StrategyKind;
use crate::secrets::decrypt_setting_value;
use crate::strategy::StrategyProfile;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SETTINGS_FILE_ENV_VAR: &str = "TRADER_SETTINGS_FILE";
const DEFAULT_SESSION_OPEN: &str = "09:15";
const DEFAULT_SESSION_CLOSE: &str = "15:30";
const DEFAULT_MARKET_DATA_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub exchange: String,
    pub calendar: TradingCalendar,
    /// Exchange-local trading session; passes outside it place no orders.
    pub session_open: NaiveTime,
    pub session_close: NaiveTime,
    pub account_capital: f64,
    pub retry: RetrySettings,
    pub database_url: Option<String>,
    pub telegram: Option<TelegramSettings>,
    pub swing_scan_file: Option<PathBuf>,
    pub scalping_scan_file: Option<PathBuf>,
    pub market_data_base_url: String,
    pub market_data_symbol_suffix: String,
    pub paper_starting_funds: f64,
    pub swing: StrategyProfile,
    pub scalping: StrategyProfile,
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let exchange = optional_setting_str(settings, "EXCHANGE").unwrap_or("NSE").to_string();
        let utc_offset_minutes =
            optional_setting_i32(settings, "EXCHANGE_UTC_OFFSET_MINUTES", 330, -24 * 60)?;

        let mut holidays: Vec<NaiveDate> = Vec::new();
        if let Some(path) = optional_setting_str(settings, "TRADING_CALENDAR_FILE") {
            holidays.extend(TradingCalendar::load_holidays(path)?);
        }
        if optional_setting_str(settings, "TRADING_HOLIDAYS").is_some() {
            holidays.extend(require_setting_date_list(settings, "TRADING_HOLIDAYS")?);
        }
        let calendar = TradingCalendar::from_offset_minutes(utc_offset_minutes, holidays)?;
        let session_open = optional_setting_time(settings, "SESSION_OPEN", DEFAULT_SESSION_OPEN)?;
        let session_close = optional_setting_time(settings, "SESSION_CLOSE", DEFAULT_SESSION_CLOSE)?;
        if session_open >= session_close {
            return Err(anyhow!(
                "SESSION_OPEN {} must be before SESSION_CLOSE {}",
                session_open.format("%H:%M"),
                session_close.format("%H:%M")
            ));
        }

        let account_capital =
            optional_setting_f64(settings, "ACCOUNT_CAPITAL", 100_000.0, Some(0.0), None)?;
        let defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_attempts: optional_setting_usize(
                settings,
                "RETRY_MAX_ATTEMPTS",
                defaults.max_attempts as usize,
                1,
            )? as u32,
            base_delay: Duration::from_millis(optional_setting_usize(
                settings,
                "RETRY_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as usize,
                0,
            )? as u64),
            timeout: Duration::from_secs(optional_setting_usize(
                settings,
                "REQUEST_TIMEOUT_SECS",
                defaults.timeout.as_secs() as usize,
                1,
            )? as u64),
        };

        let telegram = match (
            optional_setting_str(settings, "TELEGRAM_BOT_TOKEN"),
            optional_setting_str(settings, "TELEGRAM_CHAT_ID"),
        ) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings {
                bot_token: bot_token.to_string(),
                chat_id: chat_id.to_string(),
            }),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"
                ))
            }
        };

        Ok(Self {
            exchange,
            calendar,
            session_open,
            session_close,
            account_capital,
            retry,
            database_url: optional_setting_str(settings, "DATABASE_URL").map(str::to_string),
            telegram,
            swing_scan_file: optional_setting_str(settings, "SWING_SCAN_FILE").map(PathBuf::from),
            scalping_scan_file: optional_setting_str(settings, "SCALPING_SCAN_FILE")
                .map(PathBuf::from),
            market_data_base_url: optional_setting_str(settings, "MARKET_DATA_BASE_URL")
                .unwrap_or(DEFAULT_MARKET_DATA_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            market_data_symbol_suffix: settings
                .get("MARKET_DATA_SYMBOL_SUFFIX")
                .map(|value| value.trim().to_string())
                .unwrap_or_else(|| ".NS".to_string()),
            paper_starting_funds: optional_setting_f64(
                settings,
                "PAPER_STARTING_FUNDS",
                100_000.0,
                Some(0.0),
                None,
            )?,
            swing: StrategyProfile::from_settings(StrategyKind::Swing, settings)?,
            scalping: StrategyProfile::from_settings(StrategyKind::Scalping, settings)?,
        })
    }

    pub fn profile(&self, kind: StrategyKind) -> &StrategyProfile {
        match kind {
            StrategyKind::Swing => &self.swing,
            StrategyKind::Scalping => &self.scalping,
        }
    }

    /// Why no orders may be placed at `now`, if the market is closed then.
    pub fn market_closed_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        let local = self.calendar.local_datetime(now);
        if !self.calendar.is_trading_day(local.date()) {
            return Some("market_closed");
        }
        if local.time() < self.session_open || local.time() > self.session_close {
            return Some("outside_session");
        }
        None
    }

    pub fn scan_file(&self, kind: StrategyKind) -> Option<&Path> {
        match kind {
            StrategyKind::Swing => self.swing_scan_file.as_deref(),
            StrategyKind::Scalping => self.scalping_scan_file.as_deref(),
        }
    }
}

/// Builds the flat settings map: JSON settings file first, then the process
/// environment on top. Encrypted values are decrypted last.
pub fn load_settings_map(settings_file: Option<&Path>) -> Result<HashMap<String, String>> {
    let mut settings = HashMap::new();

    let file = settings_file
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(SETTINGS_FILE_ENV_VAR).ok().map(PathBuf::from));
    if let Some(path) = file {
        settings.extend(read_settings_file(&path)?);
    }

    settings.extend(std::env::vars());

    for (key, value) in settings.iter_mut() {
        *value = decrypt_setting_value(value)
            .with_context(|| format!("Failed to decrypt setting {}", key))?;
    }

    Ok(settings)
}

fn read_settings_file(path: &Path) -> Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let parsed: HashMap<String, Value> = serde_json::from_str(&raw)
        .with_context(|| format!("Settings file {} must be a JSON object", path.display()))?;

    let mut settings = HashMap::with_capacity(parsed.len());
    for (key, value) in parsed {
        let text = match value {
            Value::Null => continue,
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => {
                return Err(anyhow!(
                    "Setting {} in {} must be a string, number or boolean (value: {})",
                    key,
                    path.display(),
                    other
                ))
            }
        };
        settings.insert(key, text);
    }
    Ok(settings)
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting_str(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

pub fn optional_setting_str<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn require_setting_date(settings: &HashMap<String, String>, key: &str) -> Result<NaiveDate> {
    let raw = require_setting(settings, key)?;
    parse_date(key, raw)
}

fn parse_date(key: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Setting {} must be a date in YYYY-MM-DD format (value: {})",
            key,
            raw
        )
    })
}

pub fn require_setting_date_list(
    settings: &HashMap<String, String>,
    key: &str,
) -> Result<Vec<NaiveDate>> {
    let raw = require_setting(settings, key)?;
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_date(key, entry))
        .collect()
}

pub fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

pub fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    if optional_setting_str(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_f64(settings, key, min, max)
}

pub fn require_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<usize> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

pub fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    if optional_setting_str(settings, key).is_none() {
        return Ok(default);
    }
    require_setting_usize(settings, key, min)
}

pub fn optional_setting_i32(
    settings: &HashMap<String, String>,
    key: &str,
    default: i32,
    min: i32,
) -> Result<i32> {
    let Some(raw) = optional_setting_str(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<i32>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

pub fn optional_setting_time(
    settings: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> Result<NaiveTime> {
    let raw = optional_setting_str(settings, key).unwrap_or(default);
    NaiveTime::parse_from_str(raw, "%H:%M").map_err(|_| {
        anyhow!(
            "Setting {} must be a time in HH:MM format (value: {})",
            key,
            raw
        )
    })
}

pub fn optional_setting_bool(
    settings: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool> {
    let Some(raw) = optional_setting_str(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!(
            "Setting {} must be true or false (value: {})",
            key,
            raw
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_to_empty_settings() {
        let engine = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(engine.exchange, "NSE");
        assert_eq!(engine.calendar.utc_offset().local_minus_utc(), 330 * 60);
        assert_eq!(engine.retry.max_attempts, 3);
        assert_eq!(engine.retry.timeout, Duration::from_secs(30));
        assert!(engine.telegram.is_none());
        assert!(engine.database_url.is_none());
        assert_eq!(engine.market_data_symbol_suffix, ".NS");
    }

    #[test]
    fn inline_holidays_reach_the_calendar() {
        let engine = EngineSettings::from_settings_map(&settings(&[(
            "TRADING_HOLIDAYS",
            "2026-01-26, 2026-03-03",
        )]))
        .unwrap();
        let holiday = NaiveDate::from_ymd_opt(2026, 1, 26).unwrap();
        assert!(!engine.calendar.is_trading_day(holiday));
    }

    #[test]
    fn session_window_gates_weekends_and_off_hours() {
        use chrono::TimeZone;

        let engine = EngineSettings::from_settings_map(&HashMap::new()).unwrap();
        assert_eq!(engine.session_open, NaiveTime::from_hms_opt(9, 15, 0).unwrap());
        // Tuesday 2025-05-06: 10:00, 08:00 and 16:00 IST.
        let open = Utc.with_ymd_and_hms(2025, 5, 6, 4, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 5, 6, 2, 30, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 5, 6, 10, 30, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2025, 5, 11, 4, 30, 0).unwrap();
        assert_eq!(engine.market_closed_reason(open), None);
        assert_eq!(engine.market_closed_reason(early), Some("outside_session"));
        assert_eq!(engine.market_closed_reason(late), Some("outside_session"));
        assert_eq!(engine.market_closed_reason(sunday), Some("market_closed"));

        let custom = EngineSettings::from_settings_map(&settings(&[
            ("SESSION_OPEN", "07:00"),
            ("SESSION_CLOSE", "16:30"),
        ]))
        .unwrap();
        assert_eq!(custom.market_closed_reason(early), None);
        assert!(EngineSettings::from_settings_map(&settings(&[("SESSION_OPEN", "16:00")])).is_err());
        assert!(EngineSettings::from_settings_map(&settings(&[("SESSION_CLOSE", "3pm")])).is_err());
    }

    #[test]
    fn telegram_requires_both_values() {
        let error =
            EngineSettings::from_settings_map(&settings(&[("TELEGRAM_BOT_TOKEN", "abc")]))
                .unwrap_err();
        assert!(error.to_string().contains("TELEGRAM_CHAT_ID"));
    }

    #[test]
    fn numeric_helpers_validate_bounds() {
        let map = settings(&[("RISK", "1.5"), ("COUNT", "2.5"), ("FLAG", "maybe")]);
        assert!(require_setting_f64(&map, "RISK", Some(0.0), Some(1.0)).is_err());
        assert!(require_setting_usize(&map, "COUNT", 0).is_err());
        assert!(optional_setting_bool(&map, "FLAG", true).is_err());
        assert_eq!(optional_setting_usize(&map, "MISSING", 7, 0).unwrap(), 7);
        assert!(require_setting_date(&map, "MISSING")
            .unwrap_err()
            .to_string()
            .contains("Missing required setting MISSING"));
    }

    #[test]
    fn settings_file_values_are_stringified() {
        let path = std::env::temp_dir().join(format!("settings-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{ "EXCHANGE": "BSE", "ACCOUNT_CAPITAL": 250000, "SWING_REQUIRE_BREAKOUT": false, "UNUSED": null }"#,
        )
        .unwrap();

        let parsed = read_settings_file(&path).unwrap();
        assert_eq!(parsed.get("EXCHANGE").map(String::as_str), Some("BSE"));
        assert_eq!(parsed.get("ACCOUNT_CAPITAL").map(String::as_str), Some("250000"));
        assert_eq!(
            parsed.get("SWING_REQUIRE_BREAKOUT").map(String::as_str),
            Some("false")
        );
        assert!(!parsed.contains_key("UNUSED"));

        let _ = std::fs::remove_file(path);
    }
}
