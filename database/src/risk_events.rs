//! Append-only risk event ledger.
//!
//! Events are never deleted; `resolve` flips the flag once and is
//! idempotent after that.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use funding_engine::{
    EngineError, EngineResult, NewRiskEvent, RiskEventFilter, RiskEventRecord, RiskLedger,
};

use crate::rows::parse_severity;

pub struct PgRiskLedger {
    pool: PgPool,
}

impl PgRiskLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> EngineResult<RiskEventRecord> {
        let severity: String = row.try_get("severity").map_err(internal)?;
        Ok(RiskEventRecord {
            id: row.try_get("id").map_err(internal)?,
            event_type: row.try_get("event_type").map_err(internal)?,
            severity: parse_severity(&severity)?,
            message: row.try_get("message").map_err(internal)?,
            context: row.try_get("context").map_err(internal)?,
            resolved: row.try_get("resolved").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            updated_at: row.try_get("updated_at").map_err(internal)?,
        })
    }
}

fn internal(err: sqlx::Error) -> EngineError {
    EngineError::internal(err.to_string())
}

#[async_trait]
impl RiskLedger for PgRiskLedger {
    async fn append(&self, event: NewRiskEvent) -> EngineResult<RiskEventRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO risk_events
                (id, event_type, severity, message, context, resolved, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(&event.message)
        .bind(&event.context)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?;
        Self::map_row(&row)
    }

    async fn list(&self, filter: RiskEventFilter) -> EngineResult<Vec<RiskEventRecord>> {
        let limit = filter.limit.unwrap_or(200).clamp(1, 2_000);
        let severity = filter.severity.map(|severity| severity.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM risk_events
            WHERE ($1::text IS NULL OR severity = $1)
              AND ($2::boolean IS NULL OR resolved = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(severity)
        .bind(filter.resolved)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(Self::map_row).collect()
    }

    async fn resolve(&self, id: Uuid) -> EngineResult<RiskEventRecord> {
        let row = sqlx::query(
            "UPDATE risk_events SET resolved = TRUE, updated_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;

        match row {
            Some(row) => Self::map_row(&row),
            None => Err(EngineError::validation(format!(
                "risk event not found: {id}"
            ))),
        }
    }
}
