//! Funding Engine
//!
//! Core of the cross-venue funding-rate arbitrage system:
//! - `provider`: concurrent market aggregation over the venue adapters
//!   with per-venue budgets, stale-cache fallback and fetch provenance.
//! - `cache`: bounded-TTL snapshot cache with a stale admission window.
//! - `board`: symbol pairing, spread scoring and ranked opportunity rows.
//! - `settlement`: merged settlement-event previews for paired legs.
//! - `execution`: the two-leg open/close/hedge coordinator with rollback
//!   discipline and the risk-event trail.
//!
//! Persistence is reached through the storage ports defined here; the
//! database crate provides the production implementations and tests plug
//! in in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use venue_adapters::{OrderSide, VenueCredential, VenueError, VenueId};

pub mod board;
pub mod cache;
pub mod execution;
pub mod provider;
pub mod settlement;

pub use board::{BoardQuery, OpportunityLeg, OpportunityRow};
pub use cache::{CacheLookup, SnapshotCache};
pub use execution::ExecutionCoordinator;
pub use provider::{BoardResult, FetchMeta, MarketProvider, VenueFailure};
pub use settlement::{CalcStatus, EventKind, LegSide, SettlementEvent, SettlementPreview};

/// Engine error carrying the system-wide `kind` taxonomy.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("risk condition: {0}")]
    Risk(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth(message.into())
    }

    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn risk<S: Into<String>>(message: S) -> Self {
        Self::Risk(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Taxonomy tag for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Auth(_) => "auth",
            EngineError::NotSupported(_) => "not_supported",
            EngineError::Transient(_) => "transient",
            EngineError::Risk(_) => "risk",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl From<VenueError> for EngineError {
    fn from(err: VenueError) -> Self {
        match err {
            VenueError::Transient { .. } => EngineError::Transient(err.to_string()),
            VenueError::Auth(message) => EngineError::Auth(message),
            VenueError::NotSupported(message) => EngineError::NotSupported(message),
            VenueError::Fatal(message) => EngineError::Internal(message),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine timing configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Snapshot cache TTL.
    pub cache_ttl: Duration,
    /// Window past expiry during which stale entries remain admissible.
    pub stale_max_age: Duration,
    /// Per-venue fetch deadline inside one `fetch_all`.
    pub venue_fetch_budget: Duration,
    /// Overall deadline for one `fetch_all`.
    pub total_fetch_budget: Duration,
    /// Deadline for a single outbound order call.
    pub order_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            stale_max_age: Duration::from_secs(120),
            venue_fetch_budget: Duration::from_millis(4_000),
            total_fetch_budget: Duration::from_millis(10_000),
            order_call_timeout: Duration::from_secs(10),
        }
    }
}

/// Paired position lifecycle. Transitions are forward-only:
/// `open -> closed`, `open -> risk_exposed -> closed`, or the terminal
/// failure states `open_failed` / `close_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
    RiskExposed,
    OpenFailed,
    CloseFailed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::RiskExposed => "risk_exposed",
            PositionStatus::OpenFailed => "open_failed",
            PositionStatus::CloseFailed => "close_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "risk_exposed" => Some(Self::RiskExposed),
            "open_failed" => Some(Self::OpenFailed),
            "close_failed" => Some(Self::CloseFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Open,
    Close,
    Hedge,
    Rollback,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Open => "open",
            OrderAction::Close => "close",
            OrderAction::Hedge => "hedge",
            OrderAction::Rollback => "rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(Self::Open),
            "close" => Some(Self::Close),
            "hedge" => Some(Self::Hedge),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Ok,
    Failed,
    Pending,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Ok => "ok",
            OrderStatus::Failed => "failed",
            OrderStatus::Pending => "pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl RiskSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskSeverity::Info => "info",
            RiskSeverity::Warning => "warning",
            RiskSeverity::High => "high",
            RiskSeverity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// New paired position awaiting insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPosition {
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub long_qty: Decimal,
    pub short_qty: Decimal,
    pub status: PositionStatus,
    pub entry_spread_rate: Option<f64>,
    pub extra: serde_json::Value,
}

/// Stored paired position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: Uuid,
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub long_qty: Decimal,
    pub short_qty: Decimal,
    pub status: PositionStatus,
    pub entry_spread_rate: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New per-leg order row awaiting insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub position_id: Option<Uuid>,
    pub action: OrderAction,
    pub status: OrderStatus,
    pub exchange: VenueId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<f64>,
    pub exchange_order_id: Option<String>,
    pub note: Option<String>,
    pub extra: serde_json::Value,
}

/// Stored per-leg order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: Uuid,
    pub position_id: Option<Uuid>,
    pub action: OrderAction,
    pub status: OrderStatus,
    pub exchange: VenueId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<f64>,
    pub exchange_order_id: Option<String>,
    pub note: Option<String>,
    pub extra: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New risk event awaiting append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRiskEvent {
    pub event_type: String,
    pub severity: RiskSeverity,
    pub message: String,
    pub context: serde_json::Value,
}

/// Stored risk event. Events are never deleted; `resolved` flips once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEventRecord {
    pub id: Uuid,
    pub event_type: String,
    pub severity: RiskSeverity,
    pub message: String,
    pub context: serde_json::Value,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct PositionFilter {
    pub status: Option<PositionStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub action: Option<OrderAction>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RiskEventFilter {
    pub severity: Option<RiskSeverity>,
    pub resolved: Option<bool>,
    pub limit: Option<i64>,
}

/// Storage port for paired positions. Order rows created alongside a
/// position state change are persisted in the same transaction.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create_with_orders(
        &self,
        position: NewPosition,
        orders: Vec<NewOrder>,
    ) -> EngineResult<PositionRecord>;

    async fn update_status_with_orders(
        &self,
        id: Uuid,
        status: PositionStatus,
        closed_at: Option<DateTime<Utc>>,
        orders: Vec<NewOrder>,
    ) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<PositionRecord>>;

    async fn list(&self, filter: PositionFilter) -> EngineResult<Vec<PositionRecord>>;

    /// Positions not yet closed, optionally restricted to a set of ids.
    async fn list_not_closed(&self, ids: Option<Vec<Uuid>>)
        -> EngineResult<Vec<PositionRecord>>;
}

/// Storage port for standalone order rows (hedges and ad-hoc closes).
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: NewOrder) -> EngineResult<OrderRecord>;

    async fn list(&self, filter: OrderFilter) -> EngineResult<Vec<OrderRecord>>;
}

/// Append-only risk event ledger.
#[async_trait]
pub trait RiskLedger: Send + Sync {
    async fn append(&self, event: NewRiskEvent) -> EngineResult<RiskEventRecord>;

    async fn list(&self, filter: RiskEventFilter) -> EngineResult<Vec<RiskEventRecord>>;

    async fn resolve(&self, id: Uuid) -> EngineResult<RiskEventRecord>;
}

/// Credential port: the only path on which plaintext credentials leave
/// the vault, pulled directly by the execution coordinator.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn plaintext(&self, venue: VenueId) -> EngineResult<Option<VenueCredential>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            PositionStatus::Open,
            PositionStatus::Closed,
            PositionStatus::RiskExposed,
            PositionStatus::OpenFailed,
            PositionStatus::CloseFailed,
        ] {
            assert_eq!(PositionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PositionStatus::parse("rolled_back"), None);
    }

    #[test]
    fn test_error_kind_taxonomy() {
        assert_eq!(EngineError::validation("x").kind(), "validation");
        assert_eq!(EngineError::auth("x").kind(), "auth");
        assert_eq!(EngineError::not_supported("x").kind(), "not_supported");
        assert_eq!(EngineError::transient("x").kind(), "transient");
        assert_eq!(EngineError::risk("x").kind(), "risk");
        assert_eq!(EngineError::internal("x").kind(), "internal");
    }

    #[test]
    fn test_venue_error_mapping() {
        assert_eq!(
            EngineError::from(VenueError::timeout("slow")).kind(),
            "transient"
        );
        assert_eq!(EngineError::from(VenueError::auth("bad")).kind(), "auth");
        assert_eq!(
            EngineError::from(VenueError::fatal("boom")).kind(),
            "internal"
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(RiskSeverity::Critical > RiskSeverity::High);
        assert!(RiskSeverity::High > RiskSeverity::Warning);
        assert!(RiskSeverity::Warning > RiskSeverity::Info);
    }
}
