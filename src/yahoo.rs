use crate::bar_utils::sanitize_bars;
use crate::error::TradingError;
use crate::models::{Bar, Quote};
use crate::providers::MarketDataProvider;
use crate::strategy::BarInterval;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; trader/0.1)";

/// Market data from the public Yahoo Finance chart endpoint.
pub struct YahooMarketData {
    http: Client,
    base_url: String,
    symbol_suffix: String,
}

impl YahooMarketData {
    pub fn new(base_url: &str, symbol_suffix: &str, timeout: Duration) -> Result<Self, TradingError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| TradingError::DataUnavailable(format!("HTTP client: {}", err)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol_suffix: symbol_suffix.to_string(),
        })
    }

    fn chart_url(&self, symbol: &str) -> String {
        let ticker = symbol.trim().to_uppercase();
        if self.symbol_suffix.is_empty() || ticker.ends_with(&self.symbol_suffix) {
            format!("{}/{}", self.base_url, ticker)
        } else {
            format!("{}/{}{}", self.base_url, ticker, self.symbol_suffix)
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        symbol: &str,
        query: &[(&str, String)],
    ) -> Result<T, TradingError> {
        let url = self.chart_url(symbol);
        debug!("GET {} {:?}", url, query);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(TradingError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::from_status(status, body));
        }
        response.json::<T>().await.map_err(TradingError::from_reqwest)
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        query: &[(&str, String)],
    ) -> Result<ChartResult, TradingError> {
        let payload: ChartResponse = self.get(symbol, query).await?;
        payload.into_result(symbol)
    }
}

/// Yahoo `range` wide enough to contain `lookback` bars.
fn range_for(interval: BarInterval, lookback: usize) -> &'static str {
    match interval {
        BarInterval::FiveMinutes if lookback <= 300 => "5d",
        BarInterval::FiveMinutes => "1mo",
        BarInterval::Daily if lookback <= 120 => "6mo",
        BarInterval::Daily if lookback <= 240 => "1y",
        BarInterval::Daily => "5y",
    }
}

#[async_trait]
impl MarketDataProvider for YahooMarketData {
    async fn get_bars(
        &self,
        symbol: &str,
        interval: BarInterval,
        lookback: usize,
    ) -> Result<Vec<Bar>, TradingError> {
        let query = [
            ("interval", interval.as_str().to_string()),
            ("range", range_for(interval, lookback).to_string()),
        ];
        let bars = self.fetch_chart(symbol, &query).await?.bars();
        if bars.is_empty() {
            return Err(TradingError::DataUnavailable(format!("no bars for {}", symbol)));
        }
        let skip = bars.len().saturating_sub(lookback);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn get_bars_between(
        &self,
        symbol: &str,
        interval: BarInterval,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, TradingError> {
        let query = [
            ("interval", interval.as_str().to_string()),
            ("period1", from.timestamp().to_string()),
            ("period2", to.timestamp().to_string()),
        ];
        let bars = self.fetch_chart(symbol, &query).await?.bars();
        Ok(bars
            .into_iter()
            .filter(|bar| bar.timestamp >= from && bar.timestamp <= to)
            .collect())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, TradingError> {
        let query = [
            ("interval", BarInterval::Daily.as_str().to_string()),
            ("range", "5d".to_string()),
        ];
        self.fetch_chart(symbol, &query).await?.quote(symbol)
    }
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    regular_market_price: Option<f64>,
    #[serde(default)]
    regular_market_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

impl ChartResponse {
    fn into_result(self, symbol: &str) -> Result<ChartResult, TradingError> {
        if let Some(error) = self.chart.error {
            return Err(TradingError::DataUnavailable(format!(
                "{}: {} {}",
                symbol,
                error.code.unwrap_or_default(),
                error.description.unwrap_or_default()
            )));
        }
        self.chart
            .result
            .and_then(|results| results.into_iter().next())
            .ok_or_else(|| TradingError::DataUnavailable(format!("empty chart for {}", symbol)))
    }
}

impl ChartResult {
    /// Rows with a missing close are dropped; other missing fields fall back
    /// to the close.
    fn bars(&self) -> Vec<Bar> {
        let Some(series) = self.indicators.quote.first() else {
            return Vec::new();
        };
        let at = |values: &Vec<Option<f64>>, index: usize| values.get(index).copied().flatten();

        let mut bars = Vec::with_capacity(self.timestamp.len());
        for (index, seconds) in self.timestamp.iter().enumerate() {
            let Some(close) = at(&series.close, index) else {
                continue;
            };
            let Some(timestamp) = Utc.timestamp_opt(*seconds, 0).single() else {
                continue;
            };
            bars.push(Bar {
                timestamp,
                open: at(&series.open, index).unwrap_or(close),
                high: at(&series.high, index).unwrap_or(close),
                low: at(&series.low, index).unwrap_or(close),
                close,
                volume: series.volume.get(index).copied().flatten().unwrap_or(0),
            });
        }
        sanitize_bars(bars)
    }

    fn quote(&self, symbol: &str) -> Result<Quote, TradingError> {
        let last = self
            .bars()
            .pop()
            .ok_or_else(|| TradingError::DataUnavailable(format!("no quote for {}", symbol)))?;
        let mut quote = Quote::from_bar(symbol, &last);
        if let Some(price) = self.meta.regular_market_price.filter(|price| *price > 0.0) {
            quote.last_price = price;
        }
        if let Some(time) = self
            .meta
            .regular_market_time
            .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
        {
            quote.timestamp = time;
        }
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART: &str = r#"{
        "chart": {
            "result": [{
                "meta": {"symbol": "INFY.NS", "regularMarketPrice": 1512.5, "regularMarketTime": 1746524700},
                "timestamp": [1746417600, 1746504000, 1746590400],
                "indicators": {"quote": [{
                    "open":   [1490.0, 1501.0, null],
                    "high":   [1505.0, 1515.0, 1520.0],
                    "low":    [1485.0, 1498.0, 1500.0],
                    "close":  [1500.0, null, 1510.0],
                    "volume": [120000, 150000, null]
                }]}
            }],
            "error": null
        }
    }"#;

    #[test]
    fn parses_chart_and_skips_rows_without_close() {
        let response: ChartResponse = serde_json::from_str(CHART).unwrap();
        let result = response.into_result("INFY").unwrap();
        let bars = result.bars();

        assert_eq!(bars.len(), 2);
        assert!((bars[0].close - 1500.0).abs() < 1e-9);
        assert!((bars[1].open - 1510.0).abs() < 1e-9);
        assert_eq!(bars[1].volume, 0);
        assert!(bars[0].timestamp < bars[1].timestamp);
    }

    #[test]
    fn quote_prefers_regular_market_price() {
        let response: ChartResponse = serde_json::from_str(CHART).unwrap();
        let quote = response.into_result("INFY").unwrap().quote("INFY").unwrap();

        assert_eq!(quote.symbol, "INFY");
        assert!((quote.last_price - 1512.5).abs() < 1e-9);
        assert!((quote.close - 1510.0).abs() < 1e-9);
        assert_eq!(quote.timestamp.timestamp(), 1746524700);
    }

    #[test]
    fn chart_error_is_data_unavailable() {
        let body = r#"{"chart": {"result": null, "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}}}"#;
        let response: ChartResponse = serde_json::from_str(body).unwrap();
        match response.into_result("XYZ") {
            Err(TradingError::DataUnavailable(message)) => assert!(message.contains("delisted")),
            other => panic!("expected data unavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn appends_exchange_suffix_once() {
        let client = YahooMarketData::new("https://example.test/chart/", ".NS", Duration::from_secs(5)).unwrap();
        assert_eq!(client.chart_url("reliance"), "https://example.test/chart/RELIANCE.NS");
        assert_eq!(client.chart_url("RELIANCE.NS"), "https://example.test/chart/RELIANCE.NS");
    }
}
