//! Bybit linear perpetual adapter.
//!
//! Snapshots join the v5 linear tickers with the paginated
//! instruments-info feed; the funding interval prefers the ticker's
//! `fundingIntervalHour` and falls back to the instrument's
//! `fundingInterval` minutes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::utils::{ms_to_utc, parse_interval_hours, safe_f64, value_str};
use crate::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, OrderSide, OrderTransport,
    RateLimiter, RestOrderTransport, SignedRequest, SnapshotFields, SourceTag, VenueAdapter,
    VenueCredential, VenueError, VenueId, VenueResult,
};

const BYBIT_BASE_URL: &str = "https://api.bybit.com";
const DATA_TIMEOUT: Duration = Duration::from_secs(5);
const INSTRUMENTS_PAGE_LIMIT: usize = 20;

pub struct BybitAdapter {
    client: reqwest::Client,
    base_url: String,
    transport: Arc<dyn OrderTransport>,
    limiter: RateLimiter,
}

impl BybitAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BYBIT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DATA_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            transport: Arc::new(RestOrderTransport::new()),
            limiter: RateLimiter::new(10),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn OrderTransport>) -> Self {
        self.transport = transport;
        self
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> VenueResult<Value> {
        self.limiter.acquire().await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(VenueError::from)?
            .error_for_status()
            .map_err(VenueError::from)?;
        response.json().await.map_err(VenueError::from)
    }

    async fn fetch_tickers(&self) -> VenueResult<Vec<Value>> {
        let payload = self
            .get_json("/v5/market/tickers", &[("category", "linear")])
            .await?;
        Ok(payload["result"]["list"].as_array().cloned().unwrap_or_default())
    }

    async fn fetch_instruments(&self) -> VenueResult<Vec<Value>> {
        let mut rows = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..INSTRUMENTS_PAGE_LIMIT {
            let mut params: Vec<(&str, &str)> =
                vec![("category", "linear"), ("limit", "1000")];
            if let Some(cursor) = cursor.as_deref() {
                params.push(("cursor", cursor));
            }
            let payload = self
                .get_json("/v5/market/instruments-info", &params)
                .await?;
            let page = payload["result"]["list"].as_array().cloned().unwrap_or_default();
            if page.is_empty() {
                break;
            }
            rows.extend(page);
            cursor = value_str(&payload["result"]["nextPageCursor"]).map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(rows)
    }

    fn build_snapshots(
        &self,
        tickers: &[Value],
        instruments: &HashMap<String, Value>,
        source: SourceTag,
    ) -> Vec<FundingSnapshot> {
        let mut snapshots = Vec::with_capacity(tickers.len());
        for row in tickers {
            let symbol = match value_str(&row["symbol"]) {
                Some(symbol) if symbol.ends_with("USDT") => symbol.to_string(),
                _ => continue,
            };
            let instrument = instruments.get(&symbol);

            let funding_interval_hours = parse_interval_hours(&row["fundingIntervalHour"])
                .or_else(|| {
                    instrument.and_then(|item| {
                        safe_f64(&item["fundingInterval"]).map(|minutes| minutes / 60.0)
                    })
                })
                .unwrap_or(8.0);

            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Bybit,
                &symbol,
                SnapshotFields {
                    funding_rate_raw: safe_f64(&row["fundingRate"]),
                    funding_interval_hours: Some(funding_interval_hours),
                    next_funding_time: ms_to_utc(&row["nextFundingTime"]),
                    mark_price: safe_f64(&row["markPrice"]),
                    open_interest_usd: safe_f64(&row["openInterestValue"]),
                    volume24h_usd: safe_f64(&row["turnover24h"]),
                    max_leverage: instrument
                        .and_then(|item| safe_f64(&item["leverageFilter"]["maxLeverage"])),
                },
                source,
            ) {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

impl Default for BybitAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bybit wraps errors in HTTP 200 bodies keyed by `retCode`.
fn check_bybit_response(payload: Value) -> VenueResult<Value> {
    let ret_code = payload["retCode"].as_i64().unwrap_or(0);
    if ret_code == 0 {
        return Ok(payload);
    }
    let message = value_str(&payload["retMsg"]).unwrap_or("unknown bybit error");
    if ret_code == 10006 {
        // rate limited
        return Err(VenueError::transient(format!(
            "bybit retCode {ret_code}: {message}"
        )));
    }
    Err(VenueError::fatal(format!(
        "bybit retCode {ret_code}: {message}"
    )))
}

#[async_trait]
impl VenueAdapter for BybitAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Bybit
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        let tickers = self.fetch_tickers().await?;

        match self.fetch_instruments().await {
            Ok(instruments) => {
                let instrument_map: HashMap<String, Value> = instruments
                    .into_iter()
                    .filter_map(|row| {
                        value_str(&row["symbol"]).map(|symbol| (symbol.to_string(), row.clone()))
                    })
                    .collect();
                Ok(FundingBatch {
                    source: SourceTag::Ccxt,
                    snapshots: self.build_snapshots(&tickers, &instrument_map, SourceTag::Ccxt),
                })
            }
            Err(err) => {
                // Tickers alone still carry rate, interval and mark price.
                warn!(error = %err, "bybit instruments fetch failed, serving ticker-only snapshots");
                Ok(FundingBatch {
                    source: SourceTag::Rest,
                    snapshots: self.build_snapshots(&tickers, &HashMap::new(), SourceTag::Rest),
                })
            }
        }
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let payload = self
            .get_json(
                "/v5/market/tickers",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;
        payload["result"]["list"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["markPrice"]))
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                VenueError::not_supported(format!("bybit has no mark price for {symbol}"))
            })
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>> {
        let payload = self
            .get_json(
                "/v5/market/instruments-info",
                &[("category", "linear"), ("symbol", symbol)],
            )
            .await?;
        Ok(payload["result"]["list"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["leverageFilter"]["maxLeverage"])))
    }

    async fn contract_size(&self, _symbol: &str) -> VenueResult<Decimal> {
        // Linear contracts are sized directly in the base asset.
        Ok(Decimal::ONE)
    }

    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        let mut params = serde_json::Map::new();
        params.insert("category".into(), Value::String("linear".into()));
        params.insert("symbol".into(), Value::String(request.symbol.clone()));
        params.insert(
            "side".into(),
            Value::String(match request.side {
                OrderSide::Buy => "Buy".into(),
                OrderSide::Sell => "Sell".into(),
            }),
        );
        params.insert("orderType".into(), Value::String("Market".into()));
        params.insert(
            "qty".into(),
            Value::String(request.quantity.normalize().to_string()),
        );
        if request.reduce_only {
            params.insert("reduceOnly".into(), Value::Bool(true));
        }

        let payload = self
            .transport
            .execute(
                VenueId::Bybit,
                credential,
                SignedRequest::post("/v5/order/create", params),
            )
            .await?;
        let payload = check_bybit_response(payload)?;

        debug!(symbol = %request.symbol, "bybit order accepted");
        Ok(OrderAck {
            exchange_order_id: value_str(&payload["result"]["orderId"]).map(str::to_string),
            // Market orders fill for the requested size or reject outright.
            filled_qty: Some(request.quantity),
            avg_price: safe_f64(&payload["result"]["avgPrice"]),
            note: None,
            raw: payload,
        })
    }

    async fn cancel_order(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        order_id: &str,
    ) -> VenueResult<()> {
        let mut params = serde_json::Map::new();
        params.insert("category".into(), Value::String("linear".into()));
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert("orderId".into(), Value::String(order_id.to_string()));
        let payload = self
            .transport
            .execute(
                VenueId::Bybit,
                credential,
                SignedRequest::post("/v5/order/cancel", params),
            )
            .await?;
        check_bybit_response(payload)?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()> {
        let rendered = format!("{}", leverage.round() as i64);
        let mut params = serde_json::Map::new();
        params.insert("category".into(), Value::String("linear".into()));
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert("buyLeverage".into(), Value::String(rendered.clone()));
        params.insert("sellLeverage".into(), Value::String(rendered));
        let payload = self
            .transport
            .execute(
                VenueId::Bybit,
                credential,
                SignedRequest::post("/v5/position/set-leverage", params),
            )
            .await?;
        match check_bybit_response(payload) {
            Ok(_) => Ok(()),
            // 110043: leverage not modified; the precondition already holds.
            Err(err) if err.to_string().contains("110043") => Ok(()),
            Err(err) => Err(err),
        }
    }
}
