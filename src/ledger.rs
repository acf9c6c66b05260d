use crate::calendar::TradingCalendar;
use crate::error::LedgerError;
use crate::models::{Position, PositionDraft, SellReason, StrategyKind};
use crate::store::PositionStore;
use crate::strategy::StrategyProfile;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    pub daily_buy_cap: usize,
    pub max_open_positions: usize,
}

impl From<&StrategyProfile> for LedgerLimits {
    fn from(profile: &StrategyProfile) -> Self {
        Self {
            daily_buy_cap: profile.daily_buy_cap,
            max_open_positions: profile.max_open_positions,
        }
    }
}

type PositionKey = (String, StrategyKind);

/// Exclusive hold on one `(symbol, kind)` key. A pass takes it before placing
/// an order so the order and its ledger write cannot interleave with another
/// pass on the same key.
pub struct KeyReservation {
    symbol: String,
    kind: StrategyKind,
    _guard: OwnedMutexGuard<()>,
}

impl KeyReservation {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }
}

/// Key reservation plus the kind lock, taken after the entry caps passed.
/// Held from before the buy order until the position is recorded, so no
/// other entry of the same kind can consume the slot in between.
pub struct EntryReservation {
    key: KeyReservation,
    _kind_guard: OwnedMutexGuard<()>,
}

impl EntryReservation {
    pub fn symbol(&self) -> &str {
        self.key.symbol()
    }

    pub fn kind(&self) -> StrategyKind {
        self.key.kind()
    }
}

/// Owns the lifecycle of positions. Writes for one `(symbol, kind)` are
/// serialised through a per-key lock; contention is reported as `Busy`.
#[derive(Clone)]
pub struct PositionLedger {
    store: Arc<dyn PositionStore>,
    calendar: TradingCalendar,
    limits: HashMap<StrategyKind, LedgerLimits>,
    key_locks: Arc<DashMap<PositionKey, Arc<Mutex<()>>>>,
    kind_locks: Arc<DashMap<StrategyKind, Arc<Mutex<()>>>>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn PositionStore>, calendar: TradingCalendar) -> Self {
        Self {
            store,
            calendar,
            limits: HashMap::new(),
            key_locks: Arc::new(DashMap::new()),
            kind_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn with_limits(mut self, kind: StrategyKind, limits: LedgerLimits) -> Self {
        self.limits.insert(kind, limits);
        self
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    fn try_lock_key(&self, symbol: &str, kind: StrategyKind) -> Result<OwnedMutexGuard<()>, LedgerError> {
        let lock = self
            .key_locks
            .entry((symbol.to_string(), kind))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned().map_err(|_| LedgerError::Busy {
            symbol: symbol.to_string(),
            kind,
        })
    }

    async fn lock_kind(&self, kind: StrategyKind) -> OwnedMutexGuard<()> {
        let lock = self
            .kind_locks
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Takes the key lock without waiting; `Busy` when another pass holds it.
    pub fn reserve(&self, symbol: &str, kind: StrategyKind) -> Result<KeyReservation, LedgerError> {
        Ok(KeyReservation {
            symbol: symbol.to_string(),
            kind,
            _guard: self.try_lock_key(symbol, kind)?,
        })
    }

    pub async fn has_open_position(&self, symbol: &str, kind: StrategyKind) -> Result<bool, LedgerError> {
        Ok(self.store.find_open(symbol, kind).await?.is_some())
    }

    pub async fn open_positions(&self, kind: StrategyKind) -> Result<Vec<Position>, LedgerError> {
        Ok(self.store.list_open(Some(kind)).await?)
    }

    pub async fn count_open_positions(&self, kind: StrategyKind) -> Result<usize, LedgerError> {
        Ok(self.store.count_open(kind).await?)
    }

    async fn symbols_bought_on_day(
        &self,
        kind: StrategyKind,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>, LedgerError> {
        let (start, end) = self.calendar.day_bounds(self.calendar.local_date(now));
        Ok(self
            .store
            .bought_between(kind, start, end)
            .await?
            .into_iter()
            .map(|position| position.symbol)
            .collect())
    }

    /// Distinct symbols of `kind` bought on the local trading day containing `now`.
    pub async fn count_unique_buys_today(
        &self,
        kind: StrategyKind,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        Ok(self.symbols_bought_on_day(kind, now).await?.len())
    }

    /// True when `symbol` was sold at a profit within the last
    /// `trading_days_window` trading days.
    pub async fn was_recently_profitable(
        &self,
        symbol: &str,
        trading_days_window: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let today = self.calendar.local_date(now);
        let window_start = self.calendar.trading_days_back(today, trading_days_window);
        let (from, _) = self.calendar.day_bounds(window_start);
        let closed = self
            .store
            .closed_between(symbol, from, now + Duration::seconds(1))
            .await?;
        Ok(closed
            .iter()
            .any(|position| position.realized_pnl().map_or(false, |pnl| pnl > 0.0)))
    }

    /// Reserves an entry slot for `symbol`: key lock without waiting, then the
    /// kind lock, then the open-record and cap checks against the day of `now`.
    pub async fn reserve_entry(
        &self,
        symbol: &str,
        kind: StrategyKind,
        now: DateTime<Utc>,
    ) -> Result<EntryReservation, LedgerError> {
        let key = self.reserve(symbol, kind)?;
        let kind_guard = self.lock_kind(kind).await;
        self.check_entry_limits(symbol, kind, now).await?;
        Ok(EntryReservation {
            key,
            _kind_guard: kind_guard,
        })
    }

    async fn check_entry_limits(
        &self,
        symbol: &str,
        kind: StrategyKind,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.store.find_open(symbol, kind).await?.is_some() {
            return Err(LedgerError::AlreadyOpen {
                symbol: symbol.to_string(),
                kind,
            });
        }
        let Some(limits) = self.limits.get(&kind) else {
            return Ok(());
        };
        let bought_today = self.symbols_bought_on_day(kind, now).await?;
        if !bought_today.contains(symbol) && bought_today.len() >= limits.daily_buy_cap {
            return Err(LedgerError::DailyCapReached {
                kind,
                cap: limits.daily_buy_cap,
            });
        }
        if self.store.count_open(kind).await? >= limits.max_open_positions {
            return Err(LedgerError::PortfolioCapReached {
                kind,
                cap: limits.max_open_positions,
            });
        }
        Ok(())
    }

    pub async fn open_position(&self, draft: PositionDraft) -> Result<Position, LedgerError> {
        let reservation = self
            .reserve_entry(&draft.symbol, draft.kind, draft.bought_at)
            .await?;
        self.open_reserved(&reservation, draft).await
    }

    /// Records a filled entry under a reservation already held by the caller.
    pub async fn open_reserved(
        &self,
        reservation: &EntryReservation,
        draft: PositionDraft,
    ) -> Result<Position, LedgerError> {
        Self::check_reservation(&reservation.key, &draft.symbol, draft.kind)?;
        let kind = draft.kind;
        let position = Position::open(draft).map_err(|err| LedgerError::Invalid(err.to_string()))?;
        self.store.insert_open(&position).await?;
        info!(
            "Opened {} position {} x{} @ {:.2} (stop {:.2}, target {:.2}, expiry {})",
            kind,
            position.symbol,
            position.quantity,
            position.buy_price,
            position.stop_loss,
            position.target,
            position.expiry
        );
        Ok(position)
    }

    /// The open record for a key, if any.
    pub async fn find_open(
        &self,
        symbol: &str,
        kind: StrategyKind,
    ) -> Result<Option<Position>, LedgerError> {
        Ok(self.store.find_open(symbol, kind).await?)
    }

    pub async fn close_position(
        &self,
        symbol: &str,
        kind: StrategyKind,
        sold_at: DateTime<Utc>,
        price: f64,
        reason: SellReason,
    ) -> Result<Position, LedgerError> {
        let reservation = self.reserve(symbol, kind)?;
        let open = self.find_open(symbol, kind).await?.ok_or_else(|| LedgerError::NotOpen {
            symbol: symbol.to_string(),
            kind,
        })?;
        self.close_reserved(&reservation, open.id, sold_at, price, reason).await
    }

    /// Closes the reserved key's open record, provided it is still the record
    /// `position_id` names. A record reopened since the caller read it is `NotOpen`.
    pub async fn close_reserved(
        &self,
        reservation: &KeyReservation,
        position_id: Uuid,
        sold_at: DateTime<Utc>,
        price: f64,
        reason: SellReason,
    ) -> Result<Position, LedgerError> {
        let symbol = reservation.symbol();
        let kind = reservation.kind();
        let not_open = || LedgerError::NotOpen {
            symbol: symbol.to_string(),
            kind,
        };

        let mut position = self.store.find_open(symbol, kind).await?.ok_or_else(not_open)?;
        if position.id != position_id {
            warn!(
                "{} position for {} was replaced since it was evaluated ({} is now {})",
                kind, symbol, position_id, position.id
            );
            return Err(not_open());
        }
        if !position.close(sold_at, price, reason) {
            return Err(not_open());
        }
        if !self.store.close_if_open(&position).await? {
            warn!("{} position for {} was closed concurrently", kind, symbol);
            return Err(not_open());
        }

        if let Some(exit) = &position.exit {
            info!(
                "Closed {} position {} @ {:.2}: {} (P&L {:.2}, {:.2}%)",
                kind, symbol, exit.price, exit.reason, exit.realized_pnl, exit.realized_pnl_percent
            );
        }
        Ok(position)
    }

    pub async fn extend_expiry(
        &self,
        symbol: &str,
        kind: StrategyKind,
        new_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        self.update_open(symbol, kind, |position| position.extend_expiry(new_expiry, now))
            .await
    }

    pub async fn raise_trailing_stop(
        &self,
        symbol: &str,
        kind: StrategyKind,
        level: f64,
        peak_price: f64,
        now: DateTime<Utc>,
    ) -> Result<Position, LedgerError> {
        self.update_open(symbol, kind, |position| {
            position.raise_trailing_stop(level, peak_price, now)
        })
        .await
    }

    fn check_reservation(
        reservation: &KeyReservation,
        symbol: &str,
        kind: StrategyKind,
    ) -> Result<(), LedgerError> {
        if reservation.symbol != symbol || reservation.kind != kind {
            return Err(LedgerError::Invalid(format!(
                "reservation for {} {} used for {} {}",
                reservation.kind, reservation.symbol, kind, symbol
            )));
        }
        Ok(())
    }

    async fn update_open<F>(
        &self,
        symbol: &str,
        kind: StrategyKind,
        apply: F,
    ) -> Result<Position, LedgerError>
    where
        F: FnOnce(&mut Position) -> bool,
    {
        let _guard = self.try_lock_key(symbol, kind)?;
        let not_open = || LedgerError::NotOpen {
            symbol: symbol.to_string(),
            kind,
        };

        let mut position = self.store.find_open(symbol, kind).await?.ok_or_else(not_open)?;
        if !apply(&mut position) {
            return Ok(position);
        }
        if !self.store.update_if_open(&position).await? {
            return Err(not_open());
        }
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryOhlc;
    use crate::store::InMemoryPositionStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        // 2025-05-06 15:25 IST
        Utc.with_ymd_and_hms(2025, 5, 6, 9, 55, 0).unwrap()
    }

    fn ledger_with_caps(daily: usize, open: usize) -> (PositionLedger, Arc<InMemoryPositionStore>) {
        let store = Arc::new(InMemoryPositionStore::new());
        let ledger = PositionLedger::new(store.clone(), TradingCalendar::nse_2025()).with_limits(
            StrategyKind::Swing,
            LedgerLimits {
                daily_buy_cap: daily,
                max_open_positions: open,
            },
        );
        (ledger, store)
    }

    fn draft(symbol: &str, bought_at: DateTime<Utc>) -> PositionDraft {
        PositionDraft {
            symbol: symbol.to_string(),
            name: format!("{} Ltd", symbol),
            kind: StrategyKind::Swing,
            order_id: Some(format!("ord-{}", symbol)),
            bought_at,
            buy_price: 100.0,
            quantity: 10,
            expiry: bought_at + Duration::days(14),
            entry_ohlc: EntryOhlc {
                open: 99.0,
                high: 101.0,
                low: 98.0,
                close: 100.0,
            },
            stop_loss: 90.0,
            target: 130.0,
        }
    }

    #[tokio::test]
    async fn second_open_for_same_key_is_rejected() {
        let (ledger, _) = ledger_with_caps(5, 5);
        ledger.open_position(draft("TCS", now())).await.unwrap();

        let err = ledger.open_position(draft("TCS", now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyOpen { .. }));
        assert!(ledger.has_open_position("TCS", StrategyKind::Swing).await.unwrap());
        assert!(!ledger.has_open_position("TCS", StrategyKind::Scalping).await.unwrap());
    }

    #[tokio::test]
    async fn daily_cap_counts_unique_symbols() {
        let (ledger, _) = ledger_with_caps(2, 10);
        ledger.open_position(draft("A", now())).await.unwrap();
        ledger
            .close_position("A", StrategyKind::Swing, now(), 99.0, SellReason::StopLoss)
            .await
            .unwrap();
        // Re-buying the same symbol does not consume another slot.
        ledger.open_position(draft("A", now())).await.unwrap();
        ledger.open_position(draft("B", now())).await.unwrap();
        assert_eq!(
            ledger.count_unique_buys_today(StrategyKind::Swing, now()).await.unwrap(),
            2
        );

        let err = ledger.open_position(draft("C", now())).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::DailyCapReached {
                kind: StrategyKind::Swing,
                cap: 2
            }
        );

        // The next trading day starts a fresh count.
        let tomorrow = now() + Duration::days(1);
        ledger.open_position(draft("C", tomorrow)).await.unwrap();
    }

    #[tokio::test]
    async fn portfolio_cap_limits_open_positions() {
        let (ledger, _) = ledger_with_caps(10, 1);
        ledger.open_position(draft("A", now())).await.unwrap();
        let err = ledger.open_position(draft("B", now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::PortfolioCapReached { cap: 1, .. }));
    }

    #[tokio::test]
    async fn closing_twice_reports_not_open() {
        let (ledger, _) = ledger_with_caps(5, 5);
        ledger.open_position(draft("INFY", now())).await.unwrap();

        let closed = ledger
            .close_position("INFY", StrategyKind::Swing, now(), 111.0, SellReason::ProfitTarget)
            .await
            .unwrap();
        let exit = closed.exit.expect("exit fields set");
        assert!((exit.realized_pnl - 110.0).abs() < 1e-9);
        assert!((exit.realized_pnl_percent - 11.0).abs() < 1e-9);

        let err = ledger
            .close_position("INFY", StrategyKind::Swing, now(), 111.0, SellReason::ProfitTarget)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotOpen { .. }));
    }

    #[tokio::test]
    async fn held_key_lock_is_reported_as_busy() {
        let (ledger, _) = ledger_with_caps(5, 5);
        ledger.open_position(draft("HDFC", now())).await.unwrap();

        let opened = ledger.find_open("HDFC", StrategyKind::Swing).await.unwrap().unwrap();
        let held = ledger.reserve("HDFC", StrategyKind::Swing).unwrap();
        let err = ledger
            .close_position("HDFC", StrategyKind::Swing, now(), 101.0, SellReason::Expired)
            .await
            .unwrap_err();
        assert!(err.is_busy());

        let closed = ledger
            .close_reserved(&held, opened.id, now(), 101.0, SellReason::Expired)
            .await
            .unwrap();
        assert!(!closed.is_open());
    }

    #[tokio::test]
    async fn reservation_must_match_the_draft_key() {
        let (ledger, _) = ledger_with_caps(5, 5);
        let held = ledger.reserve_entry("INFY", StrategyKind::Swing, now()).await.unwrap();
        let err = ledger.open_reserved(&held, draft("TCS", now())).await.unwrap_err();
        assert!(matches!(err, LedgerError::Invalid(_)));
        assert!(ledger.open_reserved(&held, draft("INFY", now())).await.is_ok());
    }

    #[tokio::test]
    async fn entry_reservation_holds_the_last_slot_until_recorded() {
        let (ledger, store) = ledger_with_caps(5, 1);
        let held = ledger.reserve_entry("TITAN", StrategyKind::Swing, now()).await.unwrap();

        // A second entry of the same kind waits for the slot instead of racing it.
        let waiting = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.reserve_entry("ZETA", StrategyKind::Swing, now()).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        ledger.open_reserved(&held, draft("TITAN", now())).await.unwrap();
        drop(held);

        let err = waiting.await.unwrap().err().unwrap();
        assert!(matches!(err, LedgerError::PortfolioCapReached { cap: 1, .. }));
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_position_id_does_not_close_a_reopened_record() {
        let (ledger, _) = ledger_with_caps(5, 5);
        let first = ledger.open_position(draft("SBIN", now())).await.unwrap();
        ledger
            .close_position("SBIN", StrategyKind::Swing, now(), 104.0, SellReason::ProfitTarget)
            .await
            .unwrap();
        let second = ledger.open_position(draft("SBIN", now())).await.unwrap();

        let held = ledger.reserve("SBIN", StrategyKind::Swing).unwrap();
        let err = ledger
            .close_reserved(&held, first.id, now(), 95.0, SellReason::StopLoss)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotOpen { .. }));

        let still_open = ledger.find_open("SBIN", StrategyKind::Swing).await.unwrap().unwrap();
        assert_eq!(still_open.id, second.id);
    }

    #[tokio::test]
    async fn concurrent_opens_leave_one_open_record() {
        let (ledger, store) = ledger_with_caps(5, 5);
        let first = ledger.clone();
        let second = ledger.clone();

        let (a, b) = tokio::join!(
            async move { first.open_position(draft("WIPRO", now())).await },
            async move { second.open_position(draft("WIPRO", now())).await },
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let open = store.snapshot().unwrap().into_iter().filter(|p| p.is_open()).count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn recent_profit_triggers_cool_down() {
        let (ledger, _) = ledger_with_caps(5, 5);
        ledger.open_position(draft("LT", now())).await.unwrap();
        ledger
            .close_position("LT", StrategyKind::Swing, now(), 105.0, SellReason::TrailingStop)
            .await
            .unwrap();

        let later = now() + Duration::days(7);
        assert!(ledger.was_recently_profitable("LT", 20, later).await.unwrap());
        let much_later = now() + Duration::days(60);
        assert!(!ledger.was_recently_profitable("LT", 20, much_later).await.unwrap());
        assert!(!ledger.was_recently_profitable("ONGC", 20, later).await.unwrap());
    }

    #[tokio::test]
    async fn expiry_extension_persists_and_is_monotonic() {
        let (ledger, store) = ledger_with_caps(5, 5);
        let opened = ledger.open_position(draft("BEL", now())).await.unwrap();

        let later = opened.expiry + Duration::days(1);
        let extended = ledger
            .extend_expiry("BEL", StrategyKind::Swing, later, now())
            .await
            .unwrap();
        assert_eq!(extended.expiry, later);

        let unchanged = ledger
            .extend_expiry("BEL", StrategyKind::Swing, opened.expiry, now())
            .await
            .unwrap();
        assert_eq!(unchanged.expiry, later);
        assert_eq!(store.snapshot().unwrap()[0].expiry, later);
    }
}
