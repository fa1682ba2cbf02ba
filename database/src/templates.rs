//! Strategy template store: persisted parameter presets.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use venue_adapters::VenueId;

use crate::error::{DatabaseError, DatabaseResult};

#[derive(Debug, Clone, Serialize)]
pub struct StrategyTemplate {
    pub id: Uuid,
    pub name: String,
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub quantity: Option<Decimal>,
    pub notional_usd: Option<f64>,
    pub leverage: Option<f64>,
    pub hold_hours: Option<f64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewStrategyTemplate {
    pub name: String,
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub hold_hours: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StrategyTemplateUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub long_exchange: Option<VenueId>,
    #[serde(default)]
    pub short_exchange: Option<VenueId>,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub notional_usd: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub hold_hours: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

pub struct TemplateStore {
    pool: PgPool,
}

impl TemplateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> DatabaseResult<StrategyTemplate> {
        let long_exchange: String = row.try_get("long_exchange")?;
        let short_exchange: String = row.try_get("short_exchange")?;
        Ok(StrategyTemplate {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            symbol: row.try_get("symbol")?,
            long_exchange: VenueId::parse(&long_exchange).ok_or_else(|| {
                DatabaseError::Query(format!("unknown venue in template: {long_exchange}"))
            })?,
            short_exchange: VenueId::parse(&short_exchange).ok_or_else(|| {
                DatabaseError::Query(format!("unknown venue in template: {short_exchange}"))
            })?,
            quantity: row.try_get("quantity")?,
            notional_usd: row.try_get("notional_usd")?,
            leverage: row.try_get("leverage")?,
            hold_hours: row.try_get("hold_hours")?,
            note: row.try_get("note")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn list(&self, limit: i64) -> DatabaseResult<Vec<StrategyTemplate>> {
        let rows = sqlx::query(
            "SELECT * FROM strategy_templates ORDER BY updated_at DESC LIMIT $1",
        )
        .bind(limit.clamp(1, 2_000))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::map_row).collect()
    }

    pub async fn get(&self, id: Uuid) -> DatabaseResult<Option<StrategyTemplate>> {
        let row = sqlx::query("SELECT * FROM strategy_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }

    pub async fn create(
        &self,
        template: NewStrategyTemplate,
    ) -> DatabaseResult<StrategyTemplate> {
        let existing: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM strategy_templates WHERE name = $1")
                .bind(&template.name)
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(DatabaseError::Conflict(format!(
                "template name already exists: {}",
                template.name
            )));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO strategy_templates
                (id, name, symbol, long_exchange, short_exchange, quantity,
                 notional_usd, leverage, hold_hours, note, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&template.name)
        .bind(template.symbol.to_ascii_uppercase())
        .bind(template.long_exchange.as_str())
        .bind(template.short_exchange.as_str())
        .bind(template.quantity)
        .bind(template.notional_usd)
        .bind(template.leverage)
        .bind(template.hold_hours)
        .bind(&template.note)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_row(&row)
    }

    pub async fn update(
        &self,
        id: Uuid,
        update: StrategyTemplateUpdate,
    ) -> DatabaseResult<StrategyTemplate> {
        let current = self
            .get(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("template not found: {id}")))?;

        if let Some(name) = &update.name {
            let clash: Option<Uuid> = sqlx::query_scalar(
                "SELECT id FROM strategy_templates WHERE name = $1 AND id <> $2",
            )
            .bind(name)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            if clash.is_some() {
                return Err(DatabaseError::Conflict(format!(
                    "template name already exists: {name}"
                )));
            }
        }

        let row = sqlx::query(
            r#"
            UPDATE strategy_templates SET
                name = $2, symbol = $3, long_exchange = $4, short_exchange = $5,
                quantity = $6, notional_usd = $7, leverage = $8, hold_hours = $9,
                note = $10, updated_at = $11
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.name.unwrap_or(current.name))
        .bind(
            update
                .symbol
                .map(|symbol| symbol.to_ascii_uppercase())
                .unwrap_or(current.symbol),
        )
        .bind(update.long_exchange.unwrap_or(current.long_exchange).as_str())
        .bind(
            update
                .short_exchange
                .unwrap_or(current.short_exchange)
                .as_str(),
        )
        .bind(update.quantity.or(current.quantity))
        .bind(update.notional_usd.or(current.notional_usd))
        .bind(update.leverage.or(current.leverage))
        .bind(update.hold_hours.or(current.hold_hours))
        .bind(update.note.or(current.note))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Self::map_row(&row)
    }

    pub async fn delete(&self, id: Uuid) -> DatabaseResult<bool> {
        let result = sqlx::query("DELETE FROM strategy_templates WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
