//! Credential vault handlers. Responses only ever carry the masked view.

use axum::extract::{Path, State};
use axum::response::Json;
use std::sync::Arc;
use tracing::info;

use funding_arb_database::{CredentialUpsert, MaskedCredential};
use venue_adapters::VenueId;

use crate::error::{ApiError, ApiResult};
use crate::models::CredentialsResponse;
use crate::AppState;

fn parse_exchange(raw: &str) -> ApiResult<VenueId> {
    VenueId::parse(raw).ok_or_else(|| ApiError::validation(format!("unknown exchange: {raw}")))
}

/// GET /api/credentials
pub async fn list_credentials(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CredentialsResponse>> {
    let items = state.vault.list_status().await?;
    Ok(Json(CredentialsResponse { items }))
}

/// PUT /api/credentials/:exchange
pub async fn upsert_credential(
    State(state): State<Arc<AppState>>,
    Path(exchange): Path<String>,
    Json(request): Json<CredentialUpsert>,
) -> ApiResult<Json<MaskedCredential>> {
    let exchange = parse_exchange(&exchange)?;
    if request.api_key.trim().is_empty() || request.api_secret.trim().is_empty() {
        return Err(ApiError::validation("api_key and api_secret must not be empty"));
    }
    let masked = state.vault.put(exchange, request).await?;
    info!(%exchange, "credential upserted");
    Ok(Json(masked))
}

/// DELETE /api/credentials/:exchange
pub async fn delete_credential(
    State(state): State<Arc<AppState>>,
    Path(exchange): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let exchange = parse_exchange(&exchange)?;
    let deleted = state.vault.delete(exchange).await?;
    info!(%exchange, deleted, "credential delete requested");
    Ok(Json(serde_json::json!({
        "exchange": exchange,
        "deleted": deleted,
    })))
}
