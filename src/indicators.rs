use crate::models::Bar;
use crate::strategy::StrategyProfile;

// Every function returns None when the input is shorter than its window.

pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the simple average of the first `period` values.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema = prices[..period].iter().sum::<f64>() / period as f64;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
    }
    Some(ema)
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// RSI over the trailing `period` close-to-close deltas.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let mut gains = 0.0;
    let mut losses = 0.0;
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gains += change;
        } else {
            losses -= change;
        }
    }

    Some(rsi_from_avgs(
        gains / period as f64,
        losses / period as f64,
    ))
}

pub fn true_range(bar: &Bar, previous_close: f64) -> f64 {
    (bar.high - bar.low)
        .max((bar.high - previous_close).abs())
        .max((bar.low - previous_close).abs())
}

/// Mean of the last `period` true ranges. Needs `period + 1` bars.
pub fn calculate_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let window = &bars[bars.len() - period - 1..];
    let total: f64 = window
        .windows(2)
        .map(|pair| true_range(&pair[1], pair[0].close))
        .sum();
    Some(total / period as f64)
}

pub fn calculate_volume_sma(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let total: f64 = bars[bars.len() - period..]
        .iter()
        .map(|bar| bar.volume as f64)
        .sum();
    Some(total / period as f64)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA of close ± `multiplier` population standard deviations.
pub fn calculate_bollinger_bands(
    bars: &[Bar],
    period: usize,
    multiplier: f64,
) -> Option<BollingerBands> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let closes: Vec<f64> = bars[bars.len() - period..]
        .iter()
        .map(|bar| bar.close)
        .collect();
    let middle = calculate_sma(&closes, period)?;
    let variance = closes
        .iter()
        .map(|close| (close - middle).powi(2))
        .sum::<f64>()
        / period as f64;
    let std_dev = variance.sqrt();

    Some(BollingerBands {
        upper: middle + multiplier * std_dev,
        middle,
        lower: middle - multiplier * std_dev,
    })
}

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|bar| bar.close).collect()
}

pub fn ema(bars: &[Bar], period: usize) -> Option<f64> {
    calculate_ema(&closes(bars), period)
}

pub fn rsi(bars: &[Bar], period: usize) -> Option<f64> {
    calculate_rsi(&closes(bars), period)
}

/// All indicator values a strategy profile consults, computed over one bar
/// window. The last bar of the window is the most recent observation.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorSnapshot {
    pub long_ema: Option<f64>,
    pub exit_ema: Option<f64>,
    pub rsi: Option<f64>,
    pub atr: Option<f64>,
    pub volume_sma: Option<f64>,
    pub bollinger: Option<BollingerBands>,
    pub last_bar: Option<Bar>,
}

impl IndicatorSnapshot {
    pub fn compute(bars: &[Bar], profile: &StrategyProfile) -> Self {
        let closes = closes(bars);
        Self {
            long_ema: calculate_ema(&closes, profile.long_ema_period),
            exit_ema: calculate_ema(&closes, profile.exit_ema_period),
            rsi: calculate_rsi(&closes, profile.rsi_period),
            atr: calculate_atr(bars, profile.atr_period),
            volume_sma: calculate_volume_sma(bars, profile.volume_sma_period),
            bollinger: calculate_bollinger_bands(
                bars,
                profile.bollinger_period,
                profile.bollinger_multiplier,
            ),
            last_bar: bars.last().cloned(),
        }
    }

    pub fn last_volume(&self) -> Option<i64> {
        self.last_bar.as_ref().map(|bar| bar.volume)
    }

    pub fn last_close(&self) -> Option<f64> {
        self.last_bar.as_ref().map(|bar| bar.close)
    }
}

/// Smallest number of bars for which every indicator of the profile is defined.
pub fn required_bars(profile: &StrategyProfile) -> usize {
    [
        profile.long_ema_period,
        profile.exit_ema_period,
        profile.rsi_period + 1,
        profile.atr_period + 1,
        profile.volume_sma_period,
        profile.bollinger_period,
    ]
    .into_iter()
    .max()
    .unwrap_or(1)
    .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrategyKind;
    use chrono::{Duration, TimeZone, Utc};

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Bar {
                timestamp: start + Duration::days(i as i64),
                open: *close,
                high: close + 1.0,
                low: close - 1.0,
                close: *close,
                volume: 1_000 + i as i64 * 10,
            })
            .collect()
    }

    #[test]
    fn ema_seeds_with_simple_average() {
        let prices = [1.0, 2.0, 3.0, 4.0, 5.0];
        // seed = 2.0, k = 0.5 -> 3.0 -> 4.0
        let value = calculate_ema(&prices, 3).unwrap();
        assert!((value - 4.0).abs() < 1e-9);
        assert_eq!(calculate_ema(&prices, 6), None);
        assert_eq!(calculate_ema(&prices, 0), None);
    }

    #[test]
    fn ema_of_exact_window_is_sma() {
        let value = calculate_ema(&[2.0, 4.0, 6.0], 3).unwrap();
        assert!((value - 4.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_is_hundred_without_losses() {
        let prices: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(calculate_rsi(&prices, 14), Some(100.0));
    }

    #[test]
    fn rsi_balances_gains_and_losses() {
        let prices = [10.0, 11.0, 10.0, 11.0, 10.0];
        let value = calculate_rsi(&prices, 4).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
        assert_eq!(calculate_rsi(&prices, 5), None);
    }

    #[test]
    fn rsi_and_ema_are_deterministic() {
        let bars = bars_from_closes(&[
            10.0, 10.5, 10.2, 11.0, 11.4, 11.1, 12.0, 11.8, 12.5, 12.9, 12.4, 13.1, 13.3, 13.0,
            13.6, 14.0,
        ]);
        assert_eq!(rsi(&bars, 14), rsi(&bars, 14));
        assert_eq!(ema(&bars, 9), ema(&bars, 9));
    }

    #[test]
    fn atr_averages_last_true_ranges() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let bars = vec![
            Bar { timestamp: start, open: 10.0, high: 11.0, low: 9.0, close: 10.0, volume: 1 },
            Bar {
                timestamp: start + Duration::days(1),
                open: 10.0,
                high: 12.0,
                low: 10.0,
                close: 11.0,
                volume: 1,
            },
            Bar {
                timestamp: start + Duration::days(2),
                open: 11.0,
                high: 11.5,
                low: 8.0,
                close: 9.0,
                volume: 1,
            },
        ];
        // TR1 = max(2, 2, 0) = 2; TR2 = max(3.5, 0.5, 3) = 3.5
        let value = calculate_atr(&bars, 2).unwrap();
        assert!((value - 2.75).abs() < 1e-9);
        assert_eq!(calculate_atr(&bars, 3), None);
    }

    #[test]
    fn bollinger_uses_population_deviation() {
        let bars = bars_from_closes(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        let bands = calculate_bollinger_bands(&bars, 8, 2.0).unwrap();
        assert!((bands.middle - 5.0).abs() < 1e-9);
        assert!((bands.upper - 9.0).abs() < 1e-9);
        assert!((bands.lower - 1.0).abs() < 1e-9);
    }

    #[test]
    fn volume_sma_uses_trailing_window() {
        let bars = bars_from_closes(&[1.0, 1.0, 1.0, 1.0]);
        let value = calculate_volume_sma(&bars, 2).unwrap();
        assert!((value - 1_025.0).abs() < 1e-9);
        assert_eq!(calculate_volume_sma(&bars, 5), None);
    }

    #[test]
    fn snapshot_reports_missing_values_for_short_history() {
        let profile = StrategyProfile::for_kind(StrategyKind::Swing);
        let bars = bars_from_closes(&[10.0; 10]);
        let snapshot = IndicatorSnapshot::compute(&bars, &profile);

        assert_eq!(snapshot.long_ema, None);
        assert!(snapshot.exit_ema.is_some());
        assert_eq!(snapshot.rsi, None);
        assert_eq!(snapshot.last_close(), Some(10.0));
        assert_eq!(required_bars(&profile), 50);
    }
}
