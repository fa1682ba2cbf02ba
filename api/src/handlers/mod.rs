//! HTTP request handlers.

use axum::response::Json;
use chrono::Utc;

pub mod credentials;
pub mod execution;
pub mod market;
pub mod records;
pub mod risk_events;
pub mod templates;

/// GET /healthz
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "ts": Utc::now().to_rfc3339(),
    }))
}
