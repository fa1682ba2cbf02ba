//! Strategy template CRUD handlers.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use std::sync::Arc;
use uuid::Uuid;

use funding_arb_database::{NewStrategyTemplate, StrategyTemplate, StrategyTemplateUpdate};

use crate::error::{ApiError, ApiResult};
use crate::models::{TemplatesQuery, TemplatesResponse};
use crate::AppState;

/// GET /api/templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TemplatesQuery>,
) -> ApiResult<Json<TemplatesResponse>> {
    let items = state.templates.list(query.limit.unwrap_or(200)).await?;
    Ok(Json(TemplatesResponse {
        total: items.len(),
        items,
    }))
}

/// POST /api/templates
pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewStrategyTemplate>,
) -> ApiResult<Json<StrategyTemplate>> {
    if request.name.trim().is_empty() {
        return Err(ApiError::validation("template name must not be empty"));
    }
    if request.long_exchange == request.short_exchange {
        return Err(ApiError::validation(
            "long and short legs must be on different venues",
        ));
    }
    let template = state.templates.create(request).await?;
    Ok(Json(template))
}

/// PUT /api/templates/:id
pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<StrategyTemplateUpdate>,
) -> ApiResult<Json<StrategyTemplate>> {
    let template = state.templates.update(id, request).await?;
    Ok(Json(template))
}

/// DELETE /api/templates/:id
pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state.templates.delete(id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("template not found: {id}")));
    }
    Ok(Json(serde_json::json!({"success": true})))
}
