use crate::config::RetrySettings;
use crate::error::TradingError;
use crate::models::{Bar, Quote};
use crate::providers::{MarketDataProvider, OrderGateway, OrderRequest};
use crate::strategy::BarInterval;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use std::future::Future;
use std::time::Duration;

macro_rules! retry_db_operation {
    ($context:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY_MS: u64 = 500;

        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= MAX_ATTEMPTS => break Err(err),
                Err(err) => {
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        MAX_ATTEMPTS,
                        context_value,
                        err,
                        RETRY_DELAY_MS
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAY_MS)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;

/// Exponential backoff with up to 25% jitter: `base * 2^(attempt-1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    let jitter_ms = (delay.as_millis() as u64) / 4;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Runs `operation` with a per-attempt timeout, retrying only transient
/// failures and timeouts.
pub async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    context: &str,
    operation: F,
) -> Result<T, TradingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TradingError>>,
{
    with_retry_when(settings, context, TradingError::is_retryable, operation).await
}

/// `with_retry` with the caller deciding which failures are worth another attempt.
pub async fn with_retry_when<T, F, Fut>(
    settings: &RetrySettings,
    context: &str,
    retryable: fn(&TradingError) -> bool,
    mut operation: F,
) -> Result<T, TradingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TradingError>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let outcome = match tokio::time::timeout(settings.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(TradingError::Timeout(settings.timeout)),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) || attempt >= max_attempts => return Err(err),
            Err(err) => {
                let delay = backoff_delay(settings.base_delay, attempt);
                warn!(
                    "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                    attempt,
                    max_attempts,
                    context,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Applies the same timeout and retry policy to every call of the wrapped
/// market data provider or order gateway.
pub struct Resilient<T> {
    inner: T,
    settings: RetrySettings,
}

impl<T> Resilient<T> {
    pub fn new(inner: T, settings: RetrySettings) -> Self {
        Self { inner, settings }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: MarketDataProvider> MarketDataProvider for Resilient<T> {
    async fn get_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        lookback: usize,
    ) -> Result<Vec<Bar>, TradingError> {
        let context = format!("bars for {}", symbol);
        with_retry(&self.settings, &context, || {
            self.inner.get_bars(symbol, interval, lookback)
        })
        .await
    }

    async fn get_bars_between(
        &self,
        symbol: &str,
        interval: BarInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, TradingError> {
        let context = format!("bar history for {}", symbol);
        with_retry(&self.settings, &context, || {
            self.inner.get_bars_between(symbol, interval, from, to)
        })
        .await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, TradingError> {
        let context = format!("quote for {}", symbol);
        with_retry(&self.settings, &context, || self.inner.get_quote(symbol)).await
    }
}

#[async_trait]
impl<T: OrderGateway> OrderGateway for Resilient<T> {
    /// Not retried: a rejected login aborts the pass.
    async fn authenticate(&self) -> Result<(), TradingError> {
        match tokio::time::timeout(self.settings.timeout, self.inner.authenticate()).await {
            Ok(result) => result,
            Err(_) => Err(TradingError::Timeout(self.settings.timeout)),
        }
    }

    async fn instrument_token(&self, symbol: &str) -> Result<String, TradingError> {
        let context = format!("instrument token for {}", symbol);
        with_retry(&self.settings, &context, || self.inner.instrument_token(symbol)).await
    }

    async fn available_funds(&self) -> Result<f64, TradingError> {
        with_retry(&self.settings, "available funds", || self.inner.available_funds()).await
    }

    /// A timed-out order may still have reached the broker, so only
    /// connection-level failures are retried.
    async fn submit_order(&self, order: &OrderRequest) -> Result<String, TradingError> {
        let context = format!("{} order for {}", order.side.as_str(), order.instrument_token);
        with_retry_when(
            &self.settings,
            &context,
            |err| matches!(err, TradingError::Transient(_)),
            || self.inner.submit_order(order),
        )
        .await
    }
}
