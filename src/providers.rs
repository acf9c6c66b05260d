use crate::error::TradingError;
use crate::models::{Bar, OrderSide, OrderType, ProductType, Quote, ScanCandidate, StrategyKind};
use crate::strategy::BarInterval;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// The most recent `lookback` bars, oldest first, with invalid closes removed.
    async fn get_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        lookback: usize,
    ) -> Result<Vec<Bar>, TradingError>;

    /// Bars with timestamps in `[from, to]`, oldest first.
    async fn get_bars_between(
        &self,
        symbol: &str,
        interval: BarInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, TradingError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, TradingError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub exchange: String,
    pub instrument_token: String,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: i32,
    pub price: f64,
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Establishes or refreshes the broker session.
    async fn authenticate(&self) -> Result<(), TradingError>;

    async fn instrument_token(&self, symbol: &str) -> Result<String, TradingError>;

    async fn available_funds(&self) -> Result<f64, TradingError>;

    /// Returns the broker's order id once the order is accepted.
    async fn submit_order(&self, order: &OrderRequest) -> Result<String, TradingError>;
}

#[async_trait]
pub trait CandidateScanner: Send + Sync {
    async fn get_candidates(&self) -> Result<Vec<ScanCandidate>, TradingError>;

    async fn get_scalping_candidates(&self) -> Result<Vec<ScanCandidate>, TradingError>;

    async fn candidates_for(&self, kind: StrategyKind) -> Result<Vec<ScanCandidate>, TradingError> {
        match kind {
            StrategyKind::Swing => self.get_candidates().await,
            StrategyKind::Scalping => self.get_scalping_candidates().await,
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), TradingError>;
}

/// Fire-and-forget delivery: a failed notification is logged and dropped.
pub async fn notify(channel: &dyn NotificationChannel, text: &str) {
    if let Err(err) = channel.send(text).await {
        warn!("Notification delivery failed: {}", err);
    }
}
