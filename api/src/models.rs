//! API response and query models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use funding_engine::{FetchMeta, OpportunityRow, VenueFailure};
use venue_adapters::{FundingSnapshot, VenueId};

/// `/api/market/snapshots` response.
#[derive(Debug, Serialize)]
pub struct SnapshotsResponse {
    pub as_of: DateTime<Utc>,
    pub snapshots: Vec<FundingSnapshot>,
    pub errors: Vec<VenueFailure>,
    pub meta: FetchMeta,
}

/// `/api/market/board` response. Meta is the fetch meta plus the board
/// filter echo.
#[derive(Debug, Serialize)]
pub struct BoardResponse {
    pub as_of: DateTime<Utc>,
    pub total: usize,
    pub rows: Vec<OpportunityRow>,
    pub errors: Vec<VenueFailure>,
    pub meta: serde_json::Value,
}

/// Legacy flat opportunity shape kept for `/api/opportunities`.
#[derive(Debug, Serialize)]
pub struct Opportunity {
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub long_nominal_rate_1y: f64,
    pub short_nominal_rate_1y: f64,
    pub spread_rate_1y_nominal: f64,
    pub long_funding_rate_raw: Option<f64>,
    pub short_funding_rate_raw: Option<f64>,
    pub long_next_funding_time: Option<DateTime<Utc>>,
    pub short_next_funding_time: Option<DateTime<Utc>>,
}

impl Opportunity {
    pub fn from_row(row: &OpportunityRow) -> Self {
        Self {
            symbol: row.symbol.clone(),
            long_exchange: row.long_exchange,
            short_exchange: row.short_exchange,
            long_nominal_rate_1y: row.long_leg.rate_1y_nominal.unwrap_or_default(),
            short_nominal_rate_1y: row.short_leg.rate_1y_nominal.unwrap_or_default(),
            spread_rate_1y_nominal: row.spread_rate_1y_nominal,
            long_funding_rate_raw: row.long_leg.funding_rate_raw,
            short_funding_rate_raw: row.short_leg.funding_rate_raw,
            long_next_funding_time: row.long_leg.next_funding_time,
            short_next_funding_time: row.short_leg.next_funding_time,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OpportunitiesResponse {
    pub as_of: DateTime<Utc>,
    pub total: usize,
    pub opportunities: Vec<Opportunity>,
    pub errors: Vec<VenueFailure>,
}

#[derive(Debug, Serialize)]
pub struct CredentialsResponse {
    pub items: Vec<funding_arb_database::MaskedCredential>,
}

#[derive(Debug, Serialize)]
pub struct PositionsResponse {
    pub total: usize,
    pub items: Vec<funding_engine::PositionRecord>,
}

#[derive(Debug, Serialize)]
pub struct OrdersResponse {
    pub total: usize,
    pub items: Vec<funding_engine::OrderRecord>,
}

#[derive(Debug, Serialize)]
pub struct RiskEventsResponse {
    pub total: usize,
    pub items: Vec<funding_engine::RiskEventRecord>,
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub total: usize,
    pub items: Vec<funding_arb_database::StrategyTemplate>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

fn default_board_limit() -> usize {
    500
}

#[derive(Debug, Deserialize)]
pub struct BoardQueryParams {
    #[serde(default = "default_board_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_spread_rate_1y_nominal: f64,
    #[serde(default)]
    pub min_next_cycle_score: f64,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub symbol: Option<String>,
}

fn default_opportunities_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct OpportunitiesQuery {
    #[serde(default = "default_opportunities_limit")]
    pub limit: usize,
    #[serde(default)]
    pub min_spread_rate_1y_nominal: f64,
}

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RiskEventsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub severity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TemplatesQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}
