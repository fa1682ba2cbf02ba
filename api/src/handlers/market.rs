//! Market data handlers: the unified snapshot sweep, the ranked
//! opportunity board and the legacy flat opportunity list.

use axum::extract::{Query, RawQuery, State};
use axum::response::Json;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

use funding_engine::board::{build_board_rows, BoardQuery};
use venue_adapters::VenueId;

use crate::error::{ApiError, ApiResult};
use crate::models::{
    BoardQueryParams, BoardResponse, OpportunitiesQuery, OpportunitiesResponse, Opportunity,
    SnapshotsQuery, SnapshotsResponse,
};
use crate::AppState;

/// GET /api/market/snapshots
pub async fn get_snapshots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotsQuery>,
) -> ApiResult<Json<SnapshotsResponse>> {
    let result = state.provider.fetch_all(query.force_refresh).await;
    Ok(Json(SnapshotsResponse {
        as_of: result.as_of,
        snapshots: result.flattened(),
        errors: result.meta.venues_failed.clone(),
        meta: result.meta,
    }))
}

/// GET /api/market/board
pub async fn get_board(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BoardQueryParams>,
    RawQuery(raw_query): RawQuery,
) -> ApiResult<Json<BoardResponse>> {
    let exchanges = parse_exchanges(raw_query.as_deref())?;

    let result = state.provider.fetch_all(params.force_refresh).await;
    let snapshots = result.flattened();
    let board_query = BoardQuery {
        limit: params.limit.min(5_000),
        min_spread_rate_1y_nominal: params.min_spread_rate_1y_nominal,
        min_next_cycle_score: params.min_next_cycle_score,
        exchanges: exchanges.clone(),
        symbol: params.symbol.clone(),
    };
    let rows = build_board_rows(&snapshots, &board_query, Utc::now());
    info!(rows = rows.len(), "opportunity board built");

    let mut meta = serde_json::to_value(&result.meta)
        .map_err(|err| ApiError::internal(err.to_string()))?;
    if let Some(meta) = meta.as_object_mut() {
        meta.insert(
            "board_sort".into(),
            serde_json::json!("next_cycle_score_desc_nulls_last"),
        );
        meta.insert("board_limit".into(), serde_json::json!(board_query.limit));
        meta.insert(
            "board_min_spread_rate_1y_nominal".into(),
            serde_json::json!(params.min_spread_rate_1y_nominal),
        );
        meta.insert(
            "board_min_next_cycle_score".into(),
            serde_json::json!(params.min_next_cycle_score),
        );
        if let Some(exchanges) = &exchanges {
            let mut selected: Vec<&str> =
                exchanges.iter().map(|venue| venue.as_str()).collect();
            selected.sort_unstable();
            meta.insert("board_exchanges_filter".into(), serde_json::json!(selected));
            meta.insert(
                "board_exchanges_filter_mode".into(),
                serde_json::json!("single_include_or_multi_both"),
            );
        }
        if let Some(symbol) = params.symbol.as_deref().filter(|s| !s.trim().is_empty()) {
            meta.insert(
                "board_symbol_filter".into(),
                serde_json::json!(symbol.trim().to_ascii_uppercase()),
            );
        }
    }

    Ok(Json(BoardResponse {
        as_of: result.as_of,
        total: rows.len(),
        rows,
        errors: result.meta.venues_failed,
        meta,
    }))
}

/// GET /api/opportunities (legacy flat list)
pub async fn get_opportunities(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> ApiResult<Json<OpportunitiesResponse>> {
    let result = state.provider.fetch_all(false).await;
    let snapshots = result.flattened();
    let rows = build_board_rows(
        &snapshots,
        &BoardQuery {
            limit: query.limit.min(5_000),
            min_spread_rate_1y_nominal: query.min_spread_rate_1y_nominal,
            ..Default::default()
        },
        Utc::now(),
    );

    let opportunities: Vec<Opportunity> = rows.iter().map(Opportunity::from_row).collect();
    Ok(Json(OpportunitiesResponse {
        as_of: result.as_of,
        total: opportunities.len(),
        opportunities,
        errors: result.meta.venues_failed,
    }))
}

/// Collect every `exchanges=` occurrence from the raw query string.
/// Values may also be comma-separated inside a single occurrence.
fn parse_exchanges(raw_query: Option<&str>) -> ApiResult<Option<HashSet<VenueId>>> {
    let raw_query = match raw_query {
        Some(raw) => raw,
        None => return Ok(None),
    };

    let mut selected = HashSet::new();
    for pair in raw_query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key != "exchanges" {
            continue;
        }
        for token in value.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let venue = VenueId::parse(token).ok_or_else(|| {
                ApiError::validation(format!("unknown exchange: {token}"))
            })?;
            selected.insert(venue);
        }
    }

    if selected.is_empty() {
        Ok(None)
    } else {
        Ok(Some(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exchanges_repeated_and_csv() {
        let parsed = parse_exchanges(Some("exchanges=binance&exchanges=okx&limit=10"))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&VenueId::Binance));
        assert!(parsed.contains(&VenueId::Okx));

        let parsed = parse_exchanges(Some("exchanges=bybit,bitget")).unwrap().unwrap();
        assert_eq!(parsed.len(), 2);

        assert!(parse_exchanges(Some("limit=10")).unwrap().is_none());
        assert!(parse_exchanges(None).unwrap().is_none());
    }

    #[test]
    fn test_parse_exchanges_rejects_unknown() {
        assert!(parse_exchanges(Some("exchanges=kraken")).is_err());
    }
}
