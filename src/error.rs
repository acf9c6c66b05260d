use crate::models::StrategyKind;
use std::time::Duration;
use thiserror::Error;

/// Failures of an external collaborator (market data, broker, store, chat).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradingError {
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Order rejected: {0}")]
    OrderRejected(String),
    #[error("Persistence failure: {0}")]
    Persistence(String),
    #[error("Transient network failure: {0}")]
    Transient(String),
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
}

impl TradingError {
    /// Only network-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradingError::Transient(_) | TradingError::Timeout(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, TradingError::Authentication(_))
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return TradingError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            return TradingError::from_status(status, err.to_string());
        }
        if err.is_decode() {
            return TradingError::DataUnavailable(err.to_string());
        }
        TradingError::Transient(err.to_string())
    }

    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => TradingError::Authentication(format!("{}: {}", status, body)),
            408 | 429 => TradingError::Transient(format!("{}: {}", status, body)),
            code if code >= 500 => TradingError::Transient(format!("{}: {}", status, body)),
            _ => TradingError::DataUnavailable(format!("{}: {}", status, body)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("an open {kind} position for {symbol} already exists")]
    AlreadyOpen { symbol: String, kind: StrategyKind },
    #[error("position store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for TradingError {
    fn from(err: StoreError) -> Self {
        TradingError::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("{kind} position for {symbol} is already open")]
    AlreadyOpen { symbol: String, kind: StrategyKind },
    #[error("no open {kind} position for {symbol}")]
    NotOpen { symbol: String, kind: StrategyKind },
    #[error("{kind} position for {symbol} is being updated by another pass")]
    Busy { symbol: String, kind: StrategyKind },
    #[error("daily {kind} buy cap of {cap} reached")]
    DailyCapReached { kind: StrategyKind, cap: usize },
    #[error("{kind} portfolio cap of {cap} open positions reached")]
    PortfolioCapReached { kind: StrategyKind, cap: usize },
    #[error("invalid position: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] TradingError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyOpen { symbol, kind } => LedgerError::AlreadyOpen { symbol, kind },
            StoreError::Unavailable(message) => {
                LedgerError::Store(TradingError::Persistence(message))
            }
        }
    }
}

impl LedgerError {
    /// Lock contention: skip now and let the next scheduled pass try again.
    pub fn is_busy(&self) -> bool {
        matches!(self, LedgerError::Busy { .. })
    }
}
