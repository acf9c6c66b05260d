use crate::error::StoreError;
use crate::models::{Position, StrategyKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Durable backing for the position ledger. Every write is conditional on the
/// record's current state so concurrent writers cannot both succeed.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts an open position; fails with `AlreadyOpen` if one exists for the
    /// same symbol and kind.
    async fn insert_open(&self, position: &Position) -> Result<(), StoreError>;

    /// Persists the sell fields of `closed` if the stored record is still
    /// open. Returns false when someone else closed it first.
    async fn close_if_open(&self, closed: &Position) -> Result<bool, StoreError>;

    /// Persists expiry, trailing stop and change log of a still-open record.
    async fn update_if_open(&self, position: &Position) -> Result<bool, StoreError>;

    async fn find_open(
        &self,
        symbol: &str,
        kind: StrategyKind,
    ) -> Result<Option<Position>, StoreError>;

    async fn list_open(&self, kind: Option<StrategyKind>) -> Result<Vec<Position>, StoreError>;

    async fn count_open(&self, kind: StrategyKind) -> Result<usize, StoreError>;

    /// Positions of `kind` bought in `[from, to)`, open or closed.
    async fn bought_between(
        &self,
        kind: StrategyKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;

    /// Closed positions of `symbol` (any kind) sold in `[from, to)`.
    async fn closed_between(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryPositionStore {
    positions: Mutex<Vec<Position>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positions(positions: Vec<Position>) -> Self {
        Self {
            positions: Mutex::new(positions),
        }
    }

    pub fn snapshot(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Position>>, StoreError> {
        self.positions
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    fn open_index(positions: &[Position], id: Uuid) -> Option<usize> {
        positions
            .iter()
            .position(|position| position.id == id && position.is_open())
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn insert_open(&self, position: &Position) -> Result<(), StoreError> {
        let mut positions = self.lock()?;
        let duplicate = positions.iter().any(|existing| {
            existing.is_open() && existing.symbol == position.symbol && existing.kind == position.kind
        });
        if duplicate {
            return Err(StoreError::AlreadyOpen {
                symbol: position.symbol.clone(),
                kind: position.kind,
            });
        }
        positions.push(position.clone());
        Ok(())
    }

    async fn close_if_open(&self, closed: &Position) -> Result<bool, StoreError> {
        let mut positions = self.lock()?;
        match Self::open_index(&positions, closed.id) {
            Some(index) => {
                positions[index] = closed.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_if_open(&self, position: &Position) -> Result<bool, StoreError> {
        if !position.is_open() {
            return Ok(false);
        }
        let mut positions = self.lock()?;
        match Self::open_index(&positions, position.id) {
            Some(index) => {
                positions[index] = position.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_open(
        &self,
        symbol: &str,
        kind: StrategyKind,
    ) -> Result<Option<Position>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .find(|position| position.is_open() && position.symbol == symbol && position.kind == kind)
            .cloned())
    }

    async fn list_open(&self, kind: Option<StrategyKind>) -> Result<Vec<Position>, StoreError> {
        let mut open: Vec<Position> = self
            .lock()?
            .iter()
            .filter(|position| position.is_open() && kind.map_or(true, |k| position.kind == k))
            .cloned()
            .collect();
        open.sort_by(|a, b| a.bought_at.cmp(&b.bought_at));
        Ok(open)
    }

    async fn count_open(&self, kind: StrategyKind) -> Result<usize, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|position| position.is_open() && position.kind == kind)
            .count())
    }

    async fn bought_between(
        &self,
        kind: StrategyKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|position| {
                position.kind == kind && position.bought_at >= from && position.bought_at < to
            })
            .cloned()
            .collect())
    }

    async fn closed_between(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|position| {
                position.symbol == symbol
                    && position
                        .exit
                        .as_ref()
                        .map_or(false, |exit| exit.sold_at >= from && exit.sold_at < to)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryOhlc, PositionDraft, SellReason};
    use chrono::{Duration, TimeZone};

    fn open_position(symbol: &str, kind: StrategyKind) -> Position {
        let bought_at = Utc.with_ymd_and_hms(2025, 5, 5, 9, 55, 0).unwrap();
        Position::open(PositionDraft {
            symbol: symbol.to_string(),
            name: symbol.to_string(),
            kind,
            order_id: None,
            bought_at,
            buy_price: 50.0,
            quantity: 20,
            expiry: bought_at + Duration::days(10),
            entry_ohlc: EntryOhlc {
                open: 49.0,
                high: 51.0,
                low: 48.0,
                close: 50.0,
            },
            stop_loss: 45.0,
            target: 65.0,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_second_open_record_for_same_key() {
        let store = InMemoryPositionStore::new();
        store.insert_open(&open_position("SBIN", StrategyKind::Swing)).await.unwrap();
        store.insert_open(&open_position("SBIN", StrategyKind::Scalping)).await.unwrap();

        let duplicate = store.insert_open(&open_position("SBIN", StrategyKind::Swing)).await;
        assert!(matches!(duplicate, Err(StoreError::AlreadyOpen { .. })));
        assert_eq!(store.count_open(StrategyKind::Swing).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn close_if_open_only_succeeds_once() {
        let store = InMemoryPositionStore::new();
        let position = open_position("ITC", StrategyKind::Swing);
        store.insert_open(&position).await.unwrap();

        let mut closed = position.clone();
        closed.close(position.bought_at + Duration::days(1), 55.0, SellReason::ProfitTarget);
        assert!(store.close_if_open(&closed).await.unwrap());
        assert!(!store.close_if_open(&closed).await.unwrap());
        assert!(!store.update_if_open(&position).await.unwrap());

        let sold = store
            .closed_between(
                "ITC",
                position.bought_at,
                position.bought_at + Duration::days(2),
            )
            .await
            .unwrap();
        assert_eq!(sold.len(), 1);
        assert!(store.find_open("ITC", StrategyKind::Swing).await.unwrap().is_none());
    }
}
