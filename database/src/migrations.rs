//! Embedded schema migrations.
//!
//! Idempotent DDL applied at startup. Statements are ordered so foreign
//! keys resolve on a fresh database.

use sqlx::PgPool;
use tracing::info;

use crate::error::DatabaseResult;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS positions (
        id UUID PRIMARY KEY,
        symbol TEXT NOT NULL,
        long_exchange TEXT NOT NULL,
        short_exchange TEXT NOT NULL,
        long_qty NUMERIC NOT NULL,
        short_qty NUMERIC NOT NULL,
        status TEXT NOT NULL,
        entry_spread_rate DOUBLE PRECISION,
        opened_at TIMESTAMPTZ NOT NULL,
        closed_at TIMESTAMPTZ,
        extra JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions (symbol)",
    "CREATE INDEX IF NOT EXISTS idx_positions_status ON positions (status)",
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id UUID PRIMARY KEY,
        position_id UUID REFERENCES positions (id),
        action TEXT NOT NULL,
        status TEXT NOT NULL,
        exchange TEXT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        quantity NUMERIC NOT NULL,
        filled_qty NUMERIC,
        avg_price DOUBLE PRECISION,
        exchange_order_id TEXT,
        note TEXT,
        extra JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_orders_position ON orders (position_id)",
    "CREATE INDEX IF NOT EXISTS idx_orders_action ON orders (action)",
    "CREATE INDEX IF NOT EXISTS idx_orders_created ON orders (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS risk_events (
        id UUID PRIMARY KEY,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        context JSONB NOT NULL DEFAULT '{}'::jsonb,
        resolved BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_risk_events_severity ON risk_events (severity)",
    "CREATE INDEX IF NOT EXISTS idx_risk_events_resolved ON risk_events (resolved)",
    "CREATE INDEX IF NOT EXISTS idx_risk_events_created ON risk_events (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS strategy_templates (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        symbol TEXT NOT NULL,
        long_exchange TEXT NOT NULL,
        short_exchange TEXT NOT NULL,
        quantity NUMERIC,
        notional_usd DOUBLE PRECISION,
        leverage DOUBLE PRECISION,
        hold_hours DOUBLE PRECISION,
        note TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exchange_credentials (
        exchange TEXT PRIMARY KEY,
        api_key_enc TEXT NOT NULL,
        api_secret_enc TEXT NOT NULL,
        passphrase_enc TEXT,
        testnet BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Apply every migration statement in order.
pub async fn run_migrations(pool: &PgPool) -> DatabaseResult<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database migrations applied");
    Ok(())
}
