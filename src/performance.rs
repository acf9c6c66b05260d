use crate::models::Position;
use serde::Serialize;
use statrs::statistics::Statistics;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestStatistics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub total_pnl: f64,
    /// Fraction of closed trades with positive P&L, 0..=1.
    pub win_rate: f64,
    pub avg_trade_return_percent: f64,
    pub trade_return_std_dev: f64,
    pub best_trade_percent: f64,
    pub worst_trade_percent: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
}

impl BacktestStatistics {
    pub fn empty() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            total_pnl: 0.0,
            win_rate: 0.0,
            avg_trade_return_percent: 0.0,
            trade_return_std_dev: 0.0,
            best_trade_percent: 0.0,
            worst_trade_percent: 0.0,
            max_drawdown: 0.0,
            max_drawdown_percent: 0.0,
        }
    }
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Statistics over closed round trips. `equity_curve` holds the
    /// marked-to-market account value after every replay step.
    pub fn calculate(trades: &[Position], equity_curve: &[f64]) -> BacktestStatistics {
        let closed: Vec<_> = trades.iter().filter_map(|trade| trade.exit.as_ref()).collect();
        if closed.is_empty() {
            let mut stats = BacktestStatistics::empty();
            Self::apply_drawdown(&mut stats, equity_curve);
            return stats;
        }

        let pnls: Vec<f64> = closed.iter().map(|exit| exit.realized_pnl).collect();
        let returns: Vec<f64> = closed.iter().map(|exit| exit.realized_pnl_percent).collect();
        let winning_trades = pnls.iter().filter(|pnl| **pnl > 0.0).count();
        let losing_trades = pnls.iter().filter(|pnl| **pnl < 0.0).count();
        let total_trades = closed.len();

        let trade_return_std_dev = if returns.len() > 1 {
            returns.clone().std_dev()
        } else {
            0.0
        };

        let mut stats = BacktestStatistics {
            total_trades,
            winning_trades,
            losing_trades,
            total_pnl: pnls.iter().sum(),
            win_rate: winning_trades as f64 / total_trades as f64,
            avg_trade_return_percent: returns.clone().mean(),
            trade_return_std_dev,
            best_trade_percent: returns.clone().max(),
            worst_trade_percent: returns.min(),
            max_drawdown: 0.0,
            max_drawdown_percent: 0.0,
        };
        Self::apply_drawdown(&mut stats, equity_curve);
        stats
    }

    fn apply_drawdown(stats: &mut BacktestStatistics, equity_curve: &[f64]) {
        let Some(first) = equity_curve.first() else {
            return;
        };

        let mut peak_value = *first;
        for value in equity_curve {
            if *value > peak_value {
                peak_value = *value;
                continue;
            }
            let drawdown = peak_value - value;
            let drawdown_percent = if peak_value > 0.0 {
                (drawdown / peak_value) * 100.0
            } else {
                0.0
            };
            stats.max_drawdown = stats.max_drawdown.max(drawdown);
            stats.max_drawdown_percent = stats.max_drawdown_percent.max(drawdown_percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryOhlc, PositionDraft, SellReason, StrategyKind};
    use chrono::{Duration, TimeZone, Utc};

    fn round_trip(buy: f64, sell: f64) -> Position {
        let bought_at = Utc.with_ymd_and_hms(2025, 2, 3, 9, 55, 0).unwrap();
        let mut position = Position::open(PositionDraft {
            symbol: "NTPC".to_string(),
            name: "NTPC".to_string(),
            kind: StrategyKind::Swing,
            order_id: None,
            bought_at,
            buy_price: buy,
            quantity: 10,
            expiry: bought_at + Duration::days(14),
            entry_ohlc: EntryOhlc {
                open: buy,
                high: buy,
                low: buy,
                close: buy,
            },
            stop_loss: buy * 0.9,
            target: buy * 1.3,
        })
        .unwrap();
        position.close(bought_at + Duration::days(3), sell, SellReason::Expired);
        position
    }

    #[test]
    fn empty_trade_list_is_all_zero() {
        let stats = PerformanceCalculator::calculate(&[], &[]);
        assert_eq!(stats, BacktestStatistics::empty());
    }

    #[test]
    fn aggregates_wins_and_losses() {
        let trades = vec![round_trip(100.0, 110.0), round_trip(100.0, 95.0), round_trip(50.0, 55.0)];
        let stats = PerformanceCalculator::calculate(&trades, &[100_000.0, 100_100.0, 100_050.0]);

        assert_eq!(stats.total_trades, 3);
        assert_eq!(stats.winning_trades, 2);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.total_pnl - 100.0).abs() < 1e-9);
        assert!((stats.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.best_trade_percent - 10.0).abs() < 1e-9);
        assert!((stats.worst_trade_percent + 5.0).abs() < 1e-9);
        assert!((stats.max_drawdown - 50.0).abs() < 1e-9);
    }

    #[test]
    fn open_positions_are_not_trades() {
        let mut open = round_trip(100.0, 110.0);
        open.exit = None;
        open.state = crate::models::PositionState::Open;
        let stats = PerformanceCalculator::calculate(&[open], &[]);
        assert_eq!(stats.total_trades, 0);
    }
}
