//! Position and order listing handlers.

use axum::extract::{Query, State};
use axum::response::Json;
use std::sync::Arc;

use funding_engine::{OrderAction, OrderFilter, PositionFilter, PositionStatus};

use crate::error::{ApiError, ApiResult};
use crate::models::{OrdersQuery, OrdersResponse, PositionsQuery, PositionsResponse};
use crate::AppState;

/// GET /api/positions
pub async fn list_positions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult<Json<PositionsResponse>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            PositionStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown position status: {raw}")))
        })
        .transpose()?;

    let items = state
        .positions
        .list(PositionFilter {
            status,
            limit: query.limit,
        })
        .await?;
    Ok(Json(PositionsResponse {
        total: items.len(),
        items,
    }))
}

/// GET /api/orders
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> ApiResult<Json<OrdersResponse>> {
    let action = query
        .action
        .as_deref()
        .map(|raw| {
            OrderAction::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown order action: {raw}")))
        })
        .transpose()?;

    let items = state
        .orders
        .list(OrderFilter {
            action,
            limit: query.limit,
        })
        .await?;
    Ok(Json(OrdersResponse {
        total: items.len(),
        items,
    }))
}
