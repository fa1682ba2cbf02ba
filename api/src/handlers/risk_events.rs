//! Risk event ledger handlers.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use funding_engine::{RiskEventFilter, RiskEventRecord, RiskSeverity};

use crate::error::{ApiError, ApiResult};
use crate::models::{RiskEventsQuery, RiskEventsResponse};
use crate::AppState;

/// GET /api/risk-events
pub async fn list_risk_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RiskEventsQuery>,
) -> ApiResult<Json<RiskEventsResponse>> {
    let severity = query
        .severity
        .as_deref()
        .map(|raw| {
            RiskSeverity::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown severity: {raw}")))
        })
        .transpose()?;

    let items = state
        .risk
        .list(RiskEventFilter {
            severity,
            resolved: query.resolved,
            limit: query.limit,
        })
        .await?;
    Ok(Json(RiskEventsResponse {
        total: items.len(),
        items,
    }))
}

/// POST /api/risk-events/:id/resolve
pub async fn resolve_risk_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RiskEventRecord>> {
    let record = state.risk.resolve(id).await.map_err(|err| {
        if err.to_string().contains("not found") {
            ApiError::not_found(err.to_string())
        } else {
            ApiError::from(err)
        }
    })?;
    info!(%id, "risk event resolved");
    Ok(Json(record))
}
