use anyhow::{anyhow, Context, Result};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
    Weekday,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Exchange trading days: weekdays that are not listed holidays, in the
/// exchange's local time.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingCalendar {
    utc_offset: FixedOffset,
    holidays: BTreeSet<NaiveDate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CalendarFile {
    Dates(Vec<NaiveDate>),
    Object { holidays: Vec<NaiveDate> },
}

impl TradingCalendar {
    pub fn new(utc_offset: FixedOffset, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            utc_offset,
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn from_offset_minutes(
        offset_minutes: i32,
        holidays: impl IntoIterator<Item = NaiveDate>,
    ) -> Result<Self> {
        let utc_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            anyhow!(
                "Exchange UTC offset must be within ±24h (value: {} minutes)",
                offset_minutes
            )
        })?;
        Ok(Self::new(utc_offset, holidays))
    }

    /// Reads holidays from a JSON file holding either a bare array of
    /// `YYYY-MM-DD` strings or an object with a `holidays` array.
    pub fn load_holidays<P: AsRef<Path>>(path: P) -> Result<Vec<NaiveDate>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read trading calendar {}", path.display()))?;
        let parsed: CalendarFile = serde_json::from_str(&raw)
            .with_context(|| format!("Trading calendar {} is not valid JSON", path.display()))?;
        Ok(match parsed {
            CalendarFile::Dates(dates) => dates,
            CalendarFile::Object { holidays } => holidays,
        })
    }

    /// NSE holidays for 2025, for demos and tests.
    pub fn nse_2025() -> Self {
        let holidays = [
            (2, 26),
            (3, 14),
            (3, 31),
            (4, 10),
            (4, 14),
            (4, 18),
            (5, 1),
            (8, 15),
            (8, 27),
            (10, 2),
            (10, 21),
            (10, 22),
            (11, 5),
            (12, 25),
        ]
        .into_iter()
        .filter_map(|(month, day)| NaiveDate::from_ymd_opt(2025, month, day));
        let ist = FixedOffset::east_opt(330 * 60).unwrap_or_else(|| Utc.fix());
        Self::new(ist, holidays)
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    pub fn holidays(&self) -> impl Iterator<Item = &NaiveDate> {
        self.holidays.iter()
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    pub fn local_datetime(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.utc_offset).naive_local()
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        self.local_datetime(instant).date()
    }

    /// UTC instant of a local wall-clock time on `date`.
    pub fn at_local_time(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        (local - Duration::seconds(self.utc_offset.local_minus_utc() as i64)).and_utc()
    }

    /// `[start, end)` of a local calendar day, in UTC.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.at_local_time(date, NaiveTime::MIN);
        (start, start + Duration::days(1))
    }

    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut candidate = date + Duration::days(1);
        while !self.is_trading_day(candidate) {
            candidate += Duration::days(1);
        }
        candidate
    }

    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut candidate = date - Duration::days(1);
        while !self.is_trading_day(candidate) {
            candidate -= Duration::days(1);
        }
        candidate
    }

    /// Moves `days` trading days forward, keeping the local time of day.
    pub fn add_trading_days(&self, instant: DateTime<Utc>, days: u32) -> DateTime<Utc> {
        let local = self.local_datetime(instant);
        let mut date = local.date();
        for _ in 0..days {
            date = self.next_trading_day(date);
        }
        self.at_local_time(date, local.time())
    }

    /// The date `days` trading days before `date`.
    pub fn trading_days_back(&self, date: NaiveDate, days: u32) -> NaiveDate {
        let mut current = date;
        for _ in 0..days {
            current = self.previous_trading_day(current);
        }
        current
    }

    /// Trading days in `(from, to]`.
    pub fn trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32 {
        let mut count = 0;
        let mut current = from;
        while current < to {
            current += Duration::days(1);
            if self.is_trading_day(current) {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekends_and_holidays_are_not_trading_days() {
        let calendar = TradingCalendar::nse_2025();
        assert!(!calendar.is_trading_day(date(2025, 3, 15)));
        assert!(!calendar.is_trading_day(date(2025, 3, 16)));
        assert!(!calendar.is_trading_day(date(2025, 3, 14)));
        assert!(calendar.is_trading_day(date(2025, 3, 13)));
    }

    #[test]
    fn add_trading_days_skips_weekends_and_holidays() {
        let calendar = TradingCalendar::nse_2025();
        // Thursday 2025-03-13 15:25 IST
        let start = Utc.with_ymd_and_hms(2025, 3, 13, 9, 55, 0).unwrap();
        let next = calendar.add_trading_days(start, 1);
        // Friday is a holiday, so the next session is Monday 17th at the same local time.
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 17, 9, 55, 0).unwrap());
    }

    #[test]
    fn local_date_uses_exchange_offset() {
        let calendar = TradingCalendar::nse_2025();
        let late_utc = Utc.with_ymd_and_hms(2025, 6, 2, 20, 0, 0).unwrap();
        assert_eq!(calendar.local_date(late_utc), date(2025, 6, 3));

        let (start, end) = calendar.day_bounds(date(2025, 6, 3));
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 2, 18, 30, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn trading_days_back_and_between_agree() {
        let calendar = TradingCalendar::nse_2025();
        let today = date(2025, 4, 21);
        let back = calendar.trading_days_back(today, 5);
        assert_eq!(calendar.trading_days_between(back, today), 5);
    }

    #[test]
    fn loads_holidays_from_json_object_or_array() {
        let dir = std::env::temp_dir();
        let object_path = dir.join(format!("calendar-object-{}.json", uuid::Uuid::new_v4()));
        let array_path = dir.join(format!("calendar-array-{}.json", uuid::Uuid::new_v4()));
        std::fs::File::create(&object_path)
            .unwrap()
            .write_all(br#"{ "holidays": ["2026-01-26"] }"#)
            .unwrap();
        std::fs::File::create(&array_path)
            .unwrap()
            .write_all(br#"["2026-01-26", "2026-03-03"]"#)
            .unwrap();

        let from_object = TradingCalendar::load_holidays(&object_path).unwrap();
        let from_array = TradingCalendar::load_holidays(&array_path).unwrap();
        assert_eq!(from_object, vec![date(2026, 1, 26)]);
        assert_eq!(from_array.len(), 2);

        let _ = std::fs::remove_file(object_path);
        let _ = std::fs::remove_file(array_path);
    }
}
