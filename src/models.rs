use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// One OHLCV bar. Sequences handed to the indicator functions are ordered by
/// ascending timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Snapshot of a historical bar, as seen at the bar's close.
    pub fn from_bar(symbol: &str, bar: &Bar) -> Self {
        Self {
            symbol: symbol.to_string(),
            last_price: bar.close,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            timestamp: bar.timestamp,
        }
    }

    /// Close of the current session so far; falls back to the last trade.
    pub fn current_close(&self) -> f64 {
        if self.close > 0.0 && self.close.is_finite() {
            self.close
        } else {
            self.last_price
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCandidate {
    pub symbol: String,
    pub name: String,
    pub scanned_at: DateTime<Utc>,
    pub last_close: f64,
    pub percent_change: f64,
    #[serde(default)]
    pub volume: i64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Swing,
    Scalping,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::Swing, StrategyKind::Scalping];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Swing => "swing",
            StrategyKind::Scalping => "scalping",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::Swing => "Swing",
            StrategyKind::Scalping => "Scalping",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> AnyResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "swing" => Ok(StrategyKind::Swing),
            "scalping" | "scalp" => Ok(StrategyKind::Scalping),
            other => Err(anyhow!("Unknown strategy kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Closed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "open",
            PositionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SellReason {
    ProfitTarget,
    Expired,
    TrailingStop,
    StopLoss,
    EmaBreakdown,
    VolumeDrop,
}

impl SellReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellReason::ProfitTarget => "profit target",
            SellReason::Expired => "expired",
            SellReason::TrailingStop => "trailing stop",
            SellReason::StopLoss => "stop-loss",
            SellReason::EmaBreakdown => "EMA breakdown",
            SellReason::VolumeDrop => "volume drop",
        }
    }
}

impl fmt::Display for SellReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SellReason {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> AnyResult<Self> {
        match value {
            "profit target" => Ok(SellReason::ProfitTarget),
            "expired" => Ok(SellReason::Expired),
            "trailing stop" => Ok(SellReason::TrailingStop),
            "stop-loss" => Ok(SellReason::StopLoss),
            "EMA breakdown" => Ok(SellReason::EmaBreakdown),
            "volume drop" => Ok(SellReason::VolumeDrop),
            other => Err(anyhow!("Unknown sell reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    Delivery,
    Intraday,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Delivery => "DELIVERY",
            ProductType::Intraday => "INTRADAY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl EntryOhlc {
    pub fn from_quote(quote: &Quote) -> Self {
        Self {
            open: quote.open,
            high: quote.high,
            low: quote.low,
            close: quote.current_close(),
        }
    }
}

/// Sell side of a round trip. Only ever set as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitFill {
    pub sold_at: DateTime<Utc>,
    pub price: f64,
    pub realized_pnl: f64,
    pub realized_pnl_percent: f64,
    pub reason: SellReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionChange {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub changed_at: DateTime<Utc>,
}

/// Everything needed to open a position once the entry order is filled.
#[derive(Debug, Clone)]
pub struct PositionDraft {
    pub symbol: String,
    pub name: String,
    pub kind: StrategyKind,
    pub order_id: Option<String>,
    pub bought_at: DateTime<Utc>,
    pub buy_price: f64,
    pub quantity: i32,
    pub expiry: DateTime<Utc>,
    pub entry_ohlc: EntryOhlc,
    pub stop_loss: f64,
    pub target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub name: String,
    pub kind: StrategyKind,
    pub state: PositionState,
    pub order_id: Option<String>,
    pub bought_at: DateTime<Utc>,
    pub buy_price: f64,
    pub quantity: i32,
    pub expiry: DateTime<Utc>,
    pub entry_ohlc: EntryOhlc,
    pub stop_loss: f64,
    pub target: f64,
    pub peak_price: f64,
    pub trailing_stop: Option<f64>,
    pub exit: Option<ExitFill>,
    pub changes: Vec<PositionChange>,
}

impl Position {
    pub fn open(draft: PositionDraft) -> AnyResult<Self> {
        let PositionDraft {
            symbol,
            name,
            kind,
            order_id,
            bought_at,
            buy_price,
            quantity,
            expiry,
            entry_ohlc,
            stop_loss,
            target,
        } = draft;

        if quantity <= 0 {
            return Err(anyhow!(
                "Cannot open {} position for {} with quantity {}",
                kind,
                symbol,
                quantity
            ));
        }
        if buy_price <= 0.0 || !buy_price.is_finite() {
            return Err(anyhow!(
                "Cannot open {} position for {} at price {}",
                kind,
                symbol,
                buy_price
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            name,
            kind,
            state: PositionState::Open,
            order_id,
            bought_at,
            buy_price,
            quantity,
            expiry,
            entry_ohlc,
            stop_loss,
            target,
            peak_price: buy_price,
            trailing_stop: None,
            exit: None,
            changes: Vec::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    pub fn profit_percent(&self, price: f64) -> f64 {
        if self.buy_price <= 0.0 {
            return 0.0;
        }
        (price - self.buy_price) / self.buy_price * 100.0
    }

    pub fn cost_basis(&self) -> f64 {
        self.buy_price * self.quantity as f64
    }

    pub fn realized_pnl(&self) -> Option<f64> {
        self.exit.as_ref().map(|exit| exit.realized_pnl)
    }

    pub fn record_change<V>(
        &mut self,
        field: &str,
        old_value: &V,
        new_value: &V,
        changed_at: DateTime<Utc>,
    ) where
        V: Serialize,
    {
        if let (Ok(old_json), Ok(new_json)) = (
            serde_json::to_value(old_value),
            serde_json::to_value(new_value),
        ) {
            if old_json == new_json {
                return;
            }

            self.changes.push(PositionChange {
                field: field.to_string(),
                old_value: old_json,
                new_value: new_json,
                changed_at,
            });
        }
    }

    /// Open → Closed. Returns false when the position was already closed.
    pub fn close(&mut self, sold_at: DateTime<Utc>, price: f64, reason: SellReason) -> bool {
        if !self.is_open() {
            return false;
        }

        let realized_pnl = (price - self.buy_price) * self.quantity as f64;
        let exit = ExitFill {
            sold_at,
            price,
            realized_pnl,
            realized_pnl_percent: self.profit_percent(price),
            reason,
        };
        let old_state = self.state;
        let old_exit = self.exit.clone();
        self.record_change("state", &old_state, &PositionState::Closed, sold_at);
        self.record_change("exit", &old_exit, &Some(exit.clone()), sold_at);
        self.state = PositionState::Closed;
        self.exit = Some(exit);
        true
    }

    /// Moves the expiry forward. Never moves it back and never touches a closed record.
    pub fn extend_expiry(&mut self, new_expiry: DateTime<Utc>, changed_at: DateTime<Utc>) -> bool {
        if !self.is_open() || new_expiry <= self.expiry {
            return false;
        }
        let old = self.expiry;
        self.record_change("expiry", &old, &new_expiry, changed_at);
        self.expiry = new_expiry;
        true
    }

    /// Raises the trailing stop. A lower level than the current one is ignored.
    pub fn raise_trailing_stop(
        &mut self,
        level: f64,
        peak_price: f64,
        changed_at: DateTime<Utc>,
    ) -> bool {
        if !self.is_open() || !level.is_finite() {
            return false;
        }
        let mut changed = false;
        if peak_price > self.peak_price {
            let old = self.peak_price;
            self.record_change("peakPrice", &old, &peak_price, changed_at);
            self.peak_price = peak_price;
            changed = true;
        }
        if self.trailing_stop.map_or(true, |current| level > current) {
            let old = self.trailing_stop;
            self.record_change("trailingStop", &old, &Some(level), changed_at);
            self.trailing_stop = Some(level);
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn draft(quantity: i32) -> PositionDraft {
        let bought_at = Utc.with_ymd_and_hms(2025, 3, 3, 9, 55, 0).unwrap();
        PositionDraft {
            symbol: "INFY".to_string(),
            name: "Infosys".to_string(),
            kind: StrategyKind::Swing,
            order_id: Some("ord-1".to_string()),
            bought_at,
            buy_price: 100.0,
            quantity,
            expiry: bought_at + Duration::days(14),
            entry_ohlc: EntryOhlc {
                open: 98.0,
                high: 101.0,
                low: 97.5,
                close: 100.0,
            },
            stop_loss: 90.0,
            target: 130.0,
        }
    }

    #[test]
    fn open_rejects_non_positive_quantity() {
        assert!(Position::open(draft(0)).is_err());
        assert!(Position::open(draft(-3)).is_err());
    }

    #[test]
    fn close_sets_every_sell_field_once() {
        let mut position = Position::open(draft(10)).unwrap();
        let sold_at = position.bought_at + Duration::days(2);

        assert!(position.close(sold_at, 110.0, SellReason::ProfitTarget));
        let exit = position.exit.clone().expect("exit should be recorded");
        assert_eq!(position.state, PositionState::Closed);
        assert_eq!(exit.sold_at, sold_at);
        assert!((exit.price - 110.0).abs() < 1e-9);
        assert!((exit.realized_pnl - 100.0).abs() < 1e-9);
        assert!((exit.realized_pnl_percent - 10.0).abs() < 1e-9);

        assert!(!position.close(sold_at, 50.0, SellReason::StopLoss));
        assert_eq!(position.exit, Some(exit));
    }

    #[test]
    fn expiry_only_moves_forward_while_open() {
        let mut position = Position::open(draft(10)).unwrap();
        let now = position.bought_at;
        let original = position.expiry;

        assert!(!position.extend_expiry(original - Duration::days(1), now));
        assert!(position.extend_expiry(original + Duration::days(1), now));
        assert_eq!(position.changes.last().map(|c| c.field.as_str()), Some("expiry"));

        position.close(now, 101.0, SellReason::Expired);
        assert!(!position.extend_expiry(original + Duration::days(5), now));
    }

    #[test]
    fn trailing_stop_never_falls() {
        let mut position = Position::open(draft(10)).unwrap();
        let now = position.bought_at;

        assert!(position.raise_trailing_stop(102.0, 106.0, now));
        assert!(!position.raise_trailing_stop(101.0, 103.0, now));
        assert_eq!(position.trailing_stop, Some(102.0));
        assert!((position.peak_price - 106.0).abs() < 1e-9);
    }

    #[test]
    fn strategy_kind_parses_labels() {
        assert_eq!("Swing".parse::<StrategyKind>().unwrap(), StrategyKind::Swing);
        assert_eq!("scalp".parse::<StrategyKind>().unwrap(), StrategyKind::Scalping);
        assert!("options".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn sell_reason_round_trips_through_labels() {
        for reason in [
            SellReason::ProfitTarget,
            SellReason::Expired,
            SellReason::TrailingStop,
            SellReason::StopLoss,
            SellReason::EmaBreakdown,
            SellReason::VolumeDrop,
        ] {
            assert_eq!(reason.as_str().parse::<SellReason>().unwrap(), reason);
        }
    }
}
