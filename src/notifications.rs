use crate::calendar::TradingCalendar;
use crate::models::{Position, StrategyKind};
use std::fmt::Write;

const CURRENCY: &str = "₹";

pub fn buy_alert(position: &Position, calendar: &TradingCalendar) -> String {
    let bought_at = calendar.local_datetime(position.bought_at);
    let reward_multiple = match position.kind {
        StrategyKind::Swing => 3,
        StrategyKind::Scalping => 2,
    };
    format!(
        "{} Trade Alert:\n\
         Name: {}\n\
         Symbol: {}\n\
         Buy Date: {}\n\
         Buy Price: {}{:.2}\n\
         Target: {}{:.2}\n\
         Stop Loss: {}{:.2}\n\
         Quantity: {}\n\
         Risk-Reward Ratio: {}:1",
        position.kind.label(),
        position.name,
        position.symbol,
        bought_at.format("%Y-%m-%d %H:%M"),
        CURRENCY,
        position.buy_price,
        CURRENCY,
        position.target,
        CURRENCY,
        position.stop_loss,
        position.quantity,
        reward_multiple
    )
}

/// Sell notification; `None` for a position without exit fields.
pub fn sell_alert(position: &Position, calendar: &TradingCalendar) -> Option<String> {
    let exit = position.exit.as_ref()?;
    Some(format!(
        "{} Stock Sold:\n\
         Name: {}\n\
         Symbol: {}\n\
         Buy Date: {}\n\
         Buy Price: {}{:.2}\n\
         Sell Price: {}{:.2}\n\
         Quantity: {}\n\
         Profit/Loss: {}{:.2} ({:.2}%)\n\
         Reason: {}",
        position.kind.label(),
        position.name,
        position.symbol,
        calendar
            .local_datetime(position.bought_at)
            .format("%Y-%m-%d %H:%M"),
        CURRENCY,
        position.buy_price,
        CURRENCY,
        exit.price,
        position.quantity,
        CURRENCY,
        exit.realized_pnl,
        exit.realized_pnl_percent,
        exit.reason
    ))
}

/// Portfolio report; `marks` pairs each open position with its latest price
/// when one could be fetched.
pub fn status_report(marks: &[(Position, Option<f64>)], calendar: &TradingCalendar) -> String {
    let mut report = String::from("Portfolio Status:\n");
    if marks.is_empty() {
        report.push_str("No open positions.");
        return report;
    }

    for (position, price) in marks {
        let _ = writeln!(
            report,
            "{} - {} ({}):\nBuy Price: {}{:.2}",
            position.kind.label(),
            position.name,
            position.symbol,
            CURRENCY,
            position.buy_price
        );
        match price {
            Some(price) => {
                let pnl = (price - position.buy_price) * position.quantity as f64;
                let _ = writeln!(
                    report,
                    "Current Price: {}{:.2}\nProfit/Loss: {}{:.2} ({:.2}%)",
                    CURRENCY,
                    price,
                    CURRENCY,
                    pnl,
                    position.profit_percent(*price)
                );
            }
            None => report.push_str("Current Price: unavailable\n"),
        }
        let _ = writeln!(
            report,
            "Quantity: {}\nExpiry: {}\n",
            position.quantity,
            calendar.local_date(position.expiry).format("%Y-%m-%d")
        );
    }
    report.trim_end().to_string()
}

pub fn pass_skipped(kind: StrategyKind, pass: &str, reason: &str) -> String {
    format!("{} {} skipped: {}", kind.label(), pass, reason)
}

pub fn pass_error(kind: Option<StrategyKind>, pass: &str, error: &str) -> String {
    match kind {
        Some(kind) => format!("{} {} Error: {}", kind.label(), pass, error),
        None => format!("{} Error: {}", pass, error),
    }
}
