use crate::models::Bar;

/// Drops bars with a missing or non-positive close, orders the rest by
/// timestamp and keeps the last bar seen for a repeated timestamp.
pub fn sanitize_bars(mut bars: Vec<Bar>) -> Vec<Bar> {
    bars.retain(|bar| bar.close.is_finite() && bar.close > 0.0);
    bars.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut cleaned: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match cleaned.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => cleaned.push(bar),
        }
    }
    cleaned
}

/// The trailing `lookback` bars of `bars[..=index]`.
pub fn visible_window(bars: &[Bar], index: usize, lookback: usize) -> &[Bar] {
    if bars.is_empty() {
        return bars;
    }
    let end = index.min(bars.len() - 1) + 1;
    let start = end.saturating_sub(lookback.max(1));
    &bars[start..end]
}

pub fn percent_change(previous: f64, current: f64) -> f64 {
    if previous <= 0.0 || !previous.is_finite() {
        return 0.0;
    }
    (current - previous) / previous * 100.0
}

/// Trims whitespace and uppercases a ticker; empty input yields None.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(day: i64, close: f64) -> Bar {
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        Bar {
            timestamp: base + Duration::days(day),
            open: close,
            high: close,
            low: close,
            close,
            volume: 100,
        }
    }

    #[test]
    fn sanitize_filters_sorts_and_dedupes() {
        let bars = vec![bar(2, 12.0), bar(0, 10.0), bar(1, 0.0), bar(2, 12.5), bar(3, f64::NAN)];
        let cleaned = sanitize_bars(bars);
        assert_eq!(cleaned.len(), 2);
        assert!((cleaned[0].close - 10.0).abs() < 1e-9);
        assert!((cleaned[1].close - 12.5).abs() < 1e-9);
    }

    #[test]
    fn visible_window_never_looks_ahead() {
        let bars: Vec<Bar> = (0..10).map(|day| bar(day, 10.0 + day as f64)).collect();
        let window = visible_window(&bars, 4, 3);
        assert_eq!(window.len(), 3);
        assert_eq!(window.last().map(|b| b.close), Some(14.0));
        assert_eq!(visible_window(&bars, 1, 5).len(), 2);
    }

    #[test]
    fn normalize_symbol_trims_and_uppercases() {
        assert_eq!(normalize_symbol("  reliance "), Some("RELIANCE".to_string()));
        assert_eq!(normalize_symbol("   "), None);
    }
}
