//! Execution handlers: preview, open, close, hedge, emergency close and
//! notional conversion.

use axum::extract::State;
use axum::response::Json;
use std::sync::Arc;
use tracing::info;

use funding_engine::execution::{
    CloseRequest, ConvertReport, ConvertRequest, EmergencyCloseRequest, ExecutionReport,
    HedgeRequest, OpenRequest, PreviewReport, PreviewRequest,
};

use crate::error::ApiResult;
use crate::AppState;

/// POST /api/execution/preview
pub async fn preview(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<Json<PreviewReport>> {
    let report = state.coordinator.preview(request).await?;
    Ok(Json(report))
}

/// POST /api/execution/open
pub async fn open(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OpenRequest>,
) -> ApiResult<Json<ExecutionReport>> {
    info!(symbol = %request.symbol, long = %request.long_exchange, short = %request.short_exchange, "open requested");
    let report = state.coordinator.open(request).await?;
    Ok(Json(report))
}

/// POST /api/execution/close
pub async fn close(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CloseRequest>,
) -> ApiResult<Json<ExecutionReport>> {
    let report = state.coordinator.close(request).await?;
    Ok(Json(report))
}

/// POST /api/execution/hedge
pub async fn hedge(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HedgeRequest>,
) -> ApiResult<Json<ExecutionReport>> {
    info!(symbol = %request.symbol, exchange = %request.exchange, "hedge requested");
    let report = state.coordinator.hedge(request).await?;
    Ok(Json(report))
}

/// POST /api/execution/emergency-close
pub async fn emergency_close(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmergencyCloseRequest>,
) -> ApiResult<Json<ExecutionReport>> {
    info!("emergency close requested");
    let report = state.coordinator.emergency_close(request).await?;
    Ok(Json(report))
}

/// POST /api/execution/convert
pub async fn convert(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConvertRequest>,
) -> ApiResult<Json<ConvertReport>> {
    let report = state.coordinator.convert_notional(request).await?;
    Ok(Json(report))
}
