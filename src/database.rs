use crate::error::StoreError;
use crate::models::{EntryOhlc, ExitFill, Position, PositionChange, PositionState, SellReason, StrategyKind};
use crate::retry::retry_db_operation;
use crate::store::PositionStore;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::error;
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, Row};

pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS positions (
    id UUID PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    is_open BOOLEAN NOT NULL DEFAULT TRUE,
    order_id TEXT,
    bought_at TIMESTAMPTZ NOT NULL,
    buy_price DOUBLE PRECISION NOT NULL,
    quantity INTEGER NOT NULL CHECK (quantity > 0),
    expiry TIMESTAMPTZ NOT NULL,
    entry_open DOUBLE PRECISION NOT NULL,
    entry_high DOUBLE PRECISION NOT NULL,
    entry_low DOUBLE PRECISION NOT NULL,
    entry_close DOUBLE PRECISION NOT NULL,
    stop_loss DOUBLE PRECISION NOT NULL,
    target DOUBLE PRECISION NOT NULL,
    peak_price DOUBLE PRECISION NOT NULL,
    trailing_stop DOUBLE PRECISION,
    sold_at TIMESTAMPTZ,
    sell_price DOUBLE PRECISION,
    realized_pnl DOUBLE PRECISION,
    realized_pnl_percent DOUBLE PRECISION,
    sell_reason TEXT,
    changes JSONB NOT NULL DEFAULT '[]'::jsonb
);
CREATE UNIQUE INDEX IF NOT EXISTS positions_one_open_per_key
    ON positions (symbol, kind) WHERE is_open;
CREATE INDEX IF NOT EXISTS positions_kind_bought_at ON positions (kind, bought_at);
CREATE INDEX IF NOT EXISTS positions_symbol_sold_at ON positions (symbol, sold_at);
";

const POSITION_COLUMNS: &str = "id, symbol, name, kind, is_open, order_id, bought_at, buy_price, \
     quantity, expiry, entry_open, entry_high, entry_low, entry_close, stop_loss, target, \
     peak_price, trailing_stop, sold_at, sell_price, realized_pnl, realized_pnl_percent, \
     sell_reason, changes";

/// Position store backed by a `positions` table in PostgreSQL. Every call is
/// bounded by `timeout`; expiry surfaces as `StoreError::Unavailable`.
pub struct PostgresPositionStore {
    client: Client,
    timeout: Duration,
}

impl PostgresPositionStore {
    pub async fn connect<S: AsRef<str>>(database_url: S, timeout: Duration) -> Result<Self> {
        let mut config: Config = database_url
            .as_ref()
            .parse()
            .context("invalid PostgreSQL connection string")?;
        config.connect_timeout(timeout);

        let (client, connection) = tokio::time::timeout(timeout, config.connect(NoTls))
            .await
            .map_err(|_| anyhow!("PostgreSQL connection timed out after {:?}", timeout))?
            .context("failed to connect to PostgreSQL")?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client, timeout })
    }

    /// Creates the table and indexes if they do not exist yet.
    pub async fn apply_schema(&self) -> Result<()> {
        tokio::time::timeout(self.timeout, self.client.batch_execute(SCHEMA_SQL))
            .await
            .map_err(|_| anyhow!("applying positions schema timed out after {:?}", self.timeout))?
            .context("failed to apply positions schema")
    }

    async fn query_positions(
        &self,
        context: &str,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Position>, StoreError> {
        let rows = bounded(self.timeout, context, async {
            retry_db_operation!(context, self.client.query(sql, params)).map_err(unavailable)
        })
        .await?;
        rows.iter().map(position_from_row).collect()
    }
}

async fn bounded<T, F>(limit: Duration, context: &str, operation: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "{} timed out after {:?}",
            context, limit
        ))),
    }
}

fn unavailable(err: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupt(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("invalid {} in positions row: {}", column, detail))
}

fn changes_to_json(changes: &[PositionChange]) -> Result<Value, StoreError> {
    serde_json::to_value(changes).map_err(|err| corrupt("changes", err))
}

fn changes_from_json(value: Value) -> Result<Vec<PositionChange>, StoreError> {
    serde_json::from_value(value).map_err(|err| corrupt("changes", err))
}

fn position_from_row(row: &Row) -> Result<Position, StoreError> {
    let get_err = |err: tokio_postgres::Error| StoreError::Unavailable(err.to_string());

    let kind_text: String = row.try_get("kind").map_err(get_err)?;
    let kind = StrategyKind::from_str(&kind_text).map_err(|err| corrupt("kind", err))?;
    let is_open: bool = row.try_get("is_open").map_err(get_err)?;

    let sold_at: Option<DateTime<Utc>> = row.try_get("sold_at").map_err(get_err)?;
    let sell_price: Option<f64> = row.try_get("sell_price").map_err(get_err)?;
    let realized_pnl: Option<f64> = row.try_get("realized_pnl").map_err(get_err)?;
    let realized_pnl_percent: Option<f64> = row.try_get("realized_pnl_percent").map_err(get_err)?;
    let sell_reason: Option<String> = row.try_get("sell_reason").map_err(get_err)?;

    let exit = match (sold_at, sell_price, realized_pnl, realized_pnl_percent, sell_reason) {
        (Some(sold_at), Some(price), Some(realized_pnl), Some(realized_pnl_percent), Some(reason)) => {
            Some(ExitFill {
                sold_at,
                price,
                realized_pnl,
                realized_pnl_percent,
                reason: SellReason::from_str(&reason).map_err(|err| corrupt("sell_reason", err))?,
            })
        }
        _ => None,
    };
    if !is_open && exit.is_none() {
        return Err(corrupt("sell fields", "closed position without exit"));
    }

    Ok(Position {
        id: row.try_get("id").map_err(get_err)?,
        symbol: row.try_get("symbol").map_err(get_err)?,
        name: row.try_get("name").map_err(get_err)?,
        kind,
        state: if is_open {
            PositionState::Open
        } else {
            PositionState::Closed
        },
        order_id: row.try_get("order_id").map_err(get_err)?,
        bought_at: row.try_get("bought_at").map_err(get_err)?,
        buy_price: row.try_get("buy_price").map_err(get_err)?,
        quantity: row.try_get("quantity").map_err(get_err)?,
        expiry: row.try_get("expiry").map_err(get_err)?,
        entry_ohlc: EntryOhlc {
            open: row.try_get("entry_open").map_err(get_err)?,
            high: row.try_get("entry_high").map_err(get_err)?,
            low: row.try_get("entry_low").map_err(get_err)?,
            close: row.try_get("entry_close").map_err(get_err)?,
        },
        stop_loss: row.try_get("stop_loss").map_err(get_err)?,
        target: row.try_get("target").map_err(get_err)?,
        peak_price: row.try_get("peak_price").map_err(get_err)?,
        trailing_stop: row.try_get("trailing_stop").map_err(get_err)?,
        exit,
        changes: changes_from_json(row.try_get("changes").map_err(get_err)?)?,
    })
}

#[async_trait]
impl PositionStore for PostgresPositionStore {
    async fn insert_open(&self, position: &Position) -> Result<(), StoreError> {
        let changes = changes_to_json(&position.changes)?;
        bounded(self.timeout, "insert open position", async {
            let result = self
                .client
                .execute(
                    "INSERT INTO positions (
                        id, symbol, name, kind, is_open, order_id, bought_at, buy_price, quantity,
                        expiry, entry_open, entry_high, entry_low, entry_close, stop_loss, target,
                        peak_price, trailing_stop, changes
                     ) VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
                    &[
                        &position.id,
                        &position.symbol,
                        &position.name,
                        &position.kind.as_str(),
                        &position.order_id,
                        &position.bought_at,
                        &position.buy_price,
                        &position.quantity,
                        &position.expiry,
                        &position.entry_ohlc.open,
                        &position.entry_ohlc.high,
                        &position.entry_ohlc.low,
                        &position.entry_ohlc.close,
                        &position.stop_loss,
                        &position.target,
                        &position.peak_price,
                        &position.trailing_stop,
                        &changes,
                    ],
                )
                .await;

            match result {
                Ok(_) => Ok(()),
                Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                    Err(StoreError::AlreadyOpen {
                        symbol: position.symbol.clone(),
                        kind: position.kind,
                    })
                }
                Err(err) => Err(unavailable(err)),
            }
        })
        .await
    }

    async fn close_if_open(&self, closed: &Position) -> Result<bool, StoreError> {
        let Some(exit) = closed.exit.as_ref() else {
            return Err(StoreError::Unavailable(format!(
                "position {} has no exit fields",
                closed.id
            )));
        };
        let changes = changes_to_json(&closed.changes)?;
        let row = bounded(self.timeout, "close open position", async {
            self.client
                .query_opt(
                    "UPDATE positions
                     SET is_open = FALSE, sold_at = $2, sell_price = $3, realized_pnl = $4,
                         realized_pnl_percent = $5, sell_reason = $6, peak_price = $7,
                         trailing_stop = $8, changes = $9
                     WHERE id = $1 AND is_open
                     RETURNING id",
                    &[
                        &closed.id,
                        &exit.sold_at,
                        &exit.price,
                        &exit.realized_pnl,
                        &exit.realized_pnl_percent,
                        &exit.reason.as_str(),
                        &closed.peak_price,
                        &closed.trailing_stop,
                        &changes,
                    ],
                )
                .await
                .map_err(unavailable)
        })
        .await?;
        Ok(row.is_some())
    }

    async fn update_if_open(&self, position: &Position) -> Result<bool, StoreError> {
        let changes = changes_to_json(&position.changes)?;
        let updated = bounded(self.timeout, "update open position", async {
            self.client
                .execute(
                    "UPDATE positions
                     SET expiry = $2, peak_price = $3, trailing_stop = $4, changes = $5
                     WHERE id = $1 AND is_open",
                    &[
                        &position.id,
                        &position.expiry,
                        &position.peak_price,
                        &position.trailing_stop,
                        &changes,
                    ],
                )
                .await
                .map_err(unavailable)
        })
        .await?;
        Ok(updated > 0)
    }

    async fn find_open(
        &self,
        symbol: &str,
        kind: StrategyKind,
    ) -> Result<Option<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE symbol = $1 AND kind = $2 AND is_open",
            POSITION_COLUMNS
        );
        let context = format!("find open {} {}", kind, symbol);
        let mut positions = self
            .query_positions(&context, &sql, &[&symbol, &kind.as_str()])
            .await?;
        Ok(positions.pop())
    }

    async fn list_open(&self, kind: Option<StrategyKind>) -> Result<Vec<Position>, StoreError> {
        match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {} FROM positions WHERE is_open AND kind = $1 ORDER BY bought_at",
                    POSITION_COLUMNS
                );
                self.query_positions("list open positions", &sql, &[&kind.as_str()])
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM positions WHERE is_open ORDER BY kind, bought_at",
                    POSITION_COLUMNS
                );
                self.query_positions("list open positions", &sql, &[]).await
            }
        }
    }

    async fn count_open(&self, kind: StrategyKind) -> Result<usize, StoreError> {
        let row = bounded(self.timeout, "count open positions", async {
            retry_db_operation!(
                "count open positions",
                self.client.query_one(
                    "SELECT COUNT(*) FROM positions WHERE is_open AND kind = $1",
                    &[&kind.as_str()],
                )
            )
            .map_err(unavailable)
        })
        .await?;
        let count: i64 = row.try_get(0).map_err(unavailable)?;
        Ok(count.max(0) as usize)
    }

    async fn bought_between(
        &self,
        kind: StrategyKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions WHERE kind = $1 AND bought_at >= $2 AND bought_at < $3",
            POSITION_COLUMNS
        );
        self.query_positions("positions bought in window", &sql, &[&kind.as_str(), &from, &to])
            .await
    }

    async fn closed_between(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {} FROM positions
             WHERE symbol = $1 AND NOT is_open AND sold_at >= $2 AND sold_at < $3",
            POSITION_COLUMNS
        );
        self.query_positions("positions closed in window", &sql, &[&symbol, &from, &to])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn schema_enforces_one_open_position_per_key() {
        assert!(SCHEMA_SQL.contains("ON positions (symbol, kind) WHERE is_open"));
        assert!(SCHEMA_SQL.contains("CREATE TABLE IF NOT EXISTS positions"));
        for column in POSITION_COLUMNS.split(',').map(str::trim) {
            assert!(SCHEMA_SQL.contains(&format!("{} ", column)), "missing column {}", column);
        }
    }

    #[tokio::test]
    async fn stalled_store_calls_fail_as_unavailable() {
        let stalled = bounded(
            Duration::from_millis(20),
            "count open positions",
            std::future::pending::<Result<usize, StoreError>>(),
        )
        .await;
        match stalled {
            Err(StoreError::Unavailable(message)) => {
                assert!(message.starts_with("count open positions timed out"), "{}", message)
            }
            other => panic!("expected a timeout, got {:?}", other),
        }

        let ready = bounded(Duration::from_millis(20), "count open positions", async { Ok(3) }).await;
        assert_eq!(ready.unwrap(), 3);
    }

    #[test]
    fn change_log_round_trips_through_jsonb_value() {
        let changes = vec![PositionChange {
            field: "expiry".to_string(),
            old_value: json!("2025-05-20T04:00:00Z"),
            new_value: json!("2025-05-21T04:00:00Z"),
            changed_at: Utc.with_ymd_and_hms(2025, 5, 20, 5, 0, 0).unwrap(),
        }];
        let value = changes_to_json(&changes).unwrap();
        assert!(value.is_array());
        assert_eq!(changes_from_json(value).unwrap(), changes);
        assert!(changes_from_json(json!({"not": "a list"})).is_err());
    }
}
