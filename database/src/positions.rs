//! Paired position store.
//!
//! Order rows created alongside a position state change are written in
//! the same transaction; no transaction is ever held across a venue
//! call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use funding_engine::{
    EngineError, EngineResult, NewOrder, NewPosition, PositionFilter, PositionRecord,
    PositionStatus, PositionStore,
};

use crate::rows::{parse_position_status, parse_venue};

pub struct PgPositionStore {
    pool: PgPool,
}

impl PgPositionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> EngineResult<PositionRecord> {
        let long_exchange: String = row.try_get("long_exchange").map_err(internal)?;
        let short_exchange: String = row.try_get("short_exchange").map_err(internal)?;
        let status: String = row.try_get("status").map_err(internal)?;
        Ok(PositionRecord {
            id: row.try_get("id").map_err(internal)?,
            symbol: row.try_get("symbol").map_err(internal)?,
            long_exchange: parse_venue(&long_exchange)?,
            short_exchange: parse_venue(&short_exchange)?,
            long_qty: row.try_get("long_qty").map_err(internal)?,
            short_qty: row.try_get("short_qty").map_err(internal)?,
            status: parse_position_status(&status)?,
            entry_spread_rate: row.try_get("entry_spread_rate").map_err(internal)?,
            opened_at: row.try_get("opened_at").map_err(internal)?,
            closed_at: row.try_get("closed_at").map_err(internal)?,
            extra: row.try_get("extra").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            updated_at: row.try_get("updated_at").map_err(internal)?,
        })
    }
}

fn internal(err: sqlx::Error) -> EngineError {
    EngineError::internal(err.to_string())
}

pub(crate) async fn insert_order_tx(
    tx: &mut Transaction<'_, Postgres>,
    position_id: Option<Uuid>,
    order: &NewOrder,
    now: DateTime<Utc>,
) -> EngineResult<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO orders
            (id, position_id, action, status, exchange, symbol, side, quantity,
             filled_qty, avg_price, exchange_order_id, note, extra, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
        "#,
    )
    .bind(id)
    .bind(position_id)
    .bind(order.action.as_str())
    .bind(order.status.as_str())
    .bind(order.exchange.as_str())
    .bind(&order.symbol)
    .bind(order.side.as_str())
    .bind(order.quantity)
    .bind(order.filled_qty)
    .bind(order.avg_price)
    .bind(&order.exchange_order_id)
    .bind(&order.note)
    .bind(&order.extra)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(internal)?;
    Ok(id)
}

#[async_trait]
impl PositionStore for PgPositionStore {
    async fn create_with_orders(
        &self,
        position: NewPosition,
        orders: Vec<NewOrder>,
    ) -> EngineResult<PositionRecord> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let row = sqlx::query(
            r#"
            INSERT INTO positions
                (id, symbol, long_exchange, short_exchange, long_qty, short_qty,
                 status, entry_spread_rate, opened_at, closed_at, extra, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, $10, $9, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&position.symbol)
        .bind(position.long_exchange.as_str())
        .bind(position.short_exchange.as_str())
        .bind(position.long_qty)
        .bind(position.short_qty)
        .bind(position.status.as_str())
        .bind(position.entry_spread_rate)
        .bind(now)
        .bind(&position.extra)
        .fetch_one(&mut *tx)
        .await
        .map_err(internal)?;

        for order in &orders {
            insert_order_tx(&mut tx, Some(id), order, now).await?;
        }

        tx.commit().await.map_err(internal)?;
        Self::map_row(&row)
    }

    async fn update_status_with_orders(
        &self,
        id: Uuid,
        status: PositionStatus,
        closed_at: Option<DateTime<Utc>>,
        orders: Vec<NewOrder>,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE positions SET status = $2, closed_at = COALESCE($3, closed_at), updated_at = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(closed_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::validation(format!("position not found: {id}")));
        }

        for order in &orders {
            insert_order_tx(&mut tx, Some(id), order, now).await?;
        }

        tx.commit().await.map_err(internal)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<PositionRecord>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(Self::map_row).transpose()
    }

    async fn list(&self, filter: PositionFilter) -> EngineResult<Vec<PositionRecord>> {
        let limit = filter.limit.unwrap_or(200).clamp(1, 2_000);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status = $1
                     ORDER BY created_at DESC LIMIT $2",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM positions ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(internal)?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn list_not_closed(
        &self,
        ids: Option<Vec<Uuid>>,
    ) -> EngineResult<Vec<PositionRecord>> {
        let rows = match ids {
            Some(ids) if !ids.is_empty() => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status <> 'closed' AND id = ANY($1)
                     ORDER BY created_at",
                )
                .bind(ids)
                .fetch_all(&self.pool)
                .await
            }
            _ => {
                sqlx::query(
                    "SELECT * FROM positions WHERE status <> 'closed' ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(internal)?;
        rows.iter().map(Self::map_row).collect()
    }
}
