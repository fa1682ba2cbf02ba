//! Per-leg order store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use funding_engine::{EngineError, EngineResult, NewOrder, OrderFilter, OrderRecord, OrderStore};

use crate::rows::{parse_order_action, parse_order_status, parse_side, parse_venue};

pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn map_row(row: &PgRow) -> EngineResult<OrderRecord> {
        let action: String = row.try_get("action").map_err(internal)?;
        let status: String = row.try_get("status").map_err(internal)?;
        let exchange: String = row.try_get("exchange").map_err(internal)?;
        let side: String = row.try_get("side").map_err(internal)?;
        Ok(OrderRecord {
            id: row.try_get("id").map_err(internal)?,
            position_id: row.try_get("position_id").map_err(internal)?,
            action: parse_order_action(&action)?,
            status: parse_order_status(&status)?,
            exchange: parse_venue(&exchange)?,
            symbol: row.try_get("symbol").map_err(internal)?,
            side: parse_side(&side)?,
            quantity: row.try_get("quantity").map_err(internal)?,
            filled_qty: row.try_get("filled_qty").map_err(internal)?,
            avg_price: row.try_get("avg_price").map_err(internal)?,
            exchange_order_id: row.try_get("exchange_order_id").map_err(internal)?,
            note: row.try_get("note").map_err(internal)?,
            extra: row.try_get("extra").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            updated_at: row.try_get("updated_at").map_err(internal)?,
        })
    }
}

fn internal(err: sqlx::Error) -> EngineError {
    EngineError::internal(err.to_string())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert(&self, order: NewOrder) -> EngineResult<OrderRecord> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let now = Utc::now();
        let id =
            crate::positions::insert_order_tx(&mut tx, order.position_id, &order, now).await?;
        tx.commit().await.map_err(internal)?;

        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
        Self::map_row(&row)
    }

    async fn list(&self, filter: OrderFilter) -> EngineResult<Vec<OrderRecord>> {
        let limit = filter.limit.unwrap_or(500).clamp(1, 5_000);
        let rows = match filter.action {
            Some(action) => {
                sqlx::query(
                    "SELECT * FROM orders WHERE action = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(action.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM orders ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(internal)?;
        rows.iter().map(Self::map_row).collect()
    }
}
