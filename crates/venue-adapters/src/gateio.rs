//! Gate.io USDT futures adapter.
//!
//! Funding fetches walk a three-tier fallback chain: the unified batch
//! join of contracts and tickers first, a minimal tickers-only REST pass
//! second, and the last values retained from the streaming cache third.
//! Order sizes are quoted in contracts (`quanto_multiplier` base units
//! per contract), so quantities are converted on the way in and out.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::utils::{safe_f64, sec_to_utc, value_str};
use crate::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, OrderSide, OrderTransport,
    RateLimiter, RestOrderTransport, SignedRequest, SnapshotFields, SourceTag, VenueAdapter,
    VenueCredential, VenueError, VenueId, VenueResult,
};

const GATEIO_BASE_URL: &str = "https://api.gateio.ws";
const DATA_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GateioAdapter {
    client: reqwest::Client,
    base_url: String,
    transport: Arc<dyn OrderTransport>,
    limiter: RateLimiter,
    /// Last successful snapshot set, standing in for a streaming feed's
    /// retained values when both REST tiers fail.
    stream_cache: RwLock<Option<Vec<FundingSnapshot>>>,
}

impl GateioAdapter {
    pub fn new() -> Self {
        Self::with_base_url(GATEIO_BASE_URL)
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
            stream_cache: RwLock::new(None),
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

    /// Unified tier: contracts and tickers joined for the full field set.
    async fn fetch_funding_unified(&self) -> VenueResult<Vec<FundingSnapshot>> {
        let (contracts, tickers) = tokio::try_join!(
            self.get_json("/api/v4/futures/usdt/contracts", &[]),
            self.get_json("/api/v4/futures/usdt/tickers", &[]),
        )?;

        let ticker_map: HashMap<String, Value> = tickers
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|row| {
                value_str(&row["contract"]).map(|name| (name.to_string(), row.clone()))
            })
            .collect();

        let rows = contracts.as_array().cloned().unwrap_or_default();
        let mut snapshots = Vec::with_capacity(rows.len());
        for contract in rows {
            let name = match value_str(&contract["name"]) {
                Some(name) if name.ends_with("_USDT") => name.to_string(),
                _ => continue,
            };
            if let Some(status) = value_str(&contract["status"]) {
                if !status.eq_ignore_ascii_case("trading") {
                    continue;
                }
            }

            let ticker = ticker_map.get(&name);
            let mark_price = ticker
                .and_then(|row| safe_f64(&row["mark_price"]))
                .or_else(|| safe_f64(&contract["mark_price"]));
            let multiplier = safe_f64(&contract["quanto_multiplier"]).unwrap_or(1.0);
            let open_interest_usd = match (mark_price, ticker.and_then(|row| safe_f64(&row["total_size"]))) {
                (Some(mark), Some(total_size)) => Some(total_size * mark * multiplier),
                _ => None,
            };

            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Gateio,
                &name,
                SnapshotFields {
                    funding_rate_raw: ticker
                        .and_then(|row| safe_f64(&row["funding_rate"]))
                        .or_else(|| safe_f64(&contract["funding_rate"])),
                    funding_interval_hours: Some(
                        safe_f64(&contract["funding_interval"])
                            .map(|seconds| seconds / 3600.0)
                            .filter(|hours| *hours > 0.0)
                            .unwrap_or(8.0),
                    ),
                    next_funding_time: sec_to_utc(&contract["funding_next_apply"]),
                    mark_price,
                    open_interest_usd,
                    volume24h_usd: ticker
                        .and_then(|row| safe_f64(&row["volume_24h_quote"]))
                        .or_else(|| ticker.and_then(|row| safe_f64(&row["volume_24h_settle"]))),
                    max_leverage: safe_f64(&contract["leverage_max"]),
                },
                SourceTag::Ccxt,
            ) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Native REST tier: tickers only, defaults for everything else.
    async fn fetch_funding_rest(&self) -> VenueResult<Vec<FundingSnapshot>> {
        let tickers = self.get_json("/api/v4/futures/usdt/tickers", &[]).await?;
        let rows = tickers.as_array().cloned().unwrap_or_default();

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let name = match value_str(&row["contract"]) {
                Some(name) if name.ends_with("_USDT") => name.to_string(),
                _ => continue,
            };
            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Gateio,
                &name,
                SnapshotFields {
                    funding_rate_raw: safe_f64(&row["funding_rate"]),
                    funding_interval_hours: Some(8.0),
                    mark_price: safe_f64(&row["mark_price"]),
                    volume24h_usd: safe_f64(&row["volume_24h_quote"]),
                    ..Default::default()
                },
                SourceTag::Rest,
            ) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn contract(&self, symbol: &str) -> VenueResult<Value> {
        let name = to_contract_name(symbol);
        self.get_json(&format!("/api/v4/futures/usdt/contracts/{name}"), &[])
            .await
    }
}

impl Default for GateioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// `BTCUSDT` -> `BTC_USDT`.
fn to_contract_name(symbol: &str) -> String {
    let base = symbol
        .to_ascii_uppercase()
        .strip_suffix("USDT")
        .map(str::to_string)
        .unwrap_or_else(|| symbol.to_ascii_uppercase());
    format!("{base}_USDT")
}

#[async_trait]
impl VenueAdapter for GateioAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Gateio
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        let unified_err = match self.fetch_funding_unified().await {
            Ok(snapshots) if !snapshots.is_empty() => {
                *self.stream_cache.write().await = Some(snapshots.clone());
                return Ok(FundingBatch {
                    source: SourceTag::Ccxt,
                    snapshots,
                });
            }
            Ok(_) => VenueError::transient("gateio unified fetch returned no rows"),
            Err(err) => err,
        };
        debug!(error = %unified_err, "gateio unified tier failed, trying native rest");

        let rest_err = match self.fetch_funding_rest().await {
            Ok(snapshots) if !snapshots.is_empty() => {
                *self.stream_cache.write().await = Some(snapshots.clone());
                return Ok(FundingBatch {
                    source: SourceTag::Rest,
                    snapshots,
                });
            }
            Ok(_) => VenueError::transient("gateio rest fetch returned no rows"),
            Err(err) => err,
        };
        warn!(error = %rest_err, "gateio rest tier failed, trying stream cache");

        if let Some(snapshots) = self.stream_cache.read().await.clone() {
            let snapshots: Vec<FundingSnapshot> = snapshots
                .into_iter()
                .map(|snapshot| snapshot.with_source(SourceTag::Ws))
                .collect();
            if !snapshots.is_empty() {
                return Ok(FundingBatch {
                    source: SourceTag::Ws,
                    snapshots,
                });
            }
        }

        Err(VenueError::transient(format!(
            "gateio fallback chain exhausted: unified={unified_err}, rest={rest_err}, ws=empty"
        )))
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let name = to_contract_name(symbol);
        let payload = self
            .get_json("/api/v4/futures/usdt/tickers", &[("contract", name.as_str())])
            .await?;
        payload
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["mark_price"]))
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                VenueError::not_supported(format!("gateio has no mark price for {symbol}"))
            })
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>> {
        let contract = self.contract(symbol).await?;
        Ok(safe_f64(&contract["leverage_max"]))
    }

    async fn contract_size(&self, symbol: &str) -> VenueResult<Decimal> {
        let contract = self.contract(symbol).await?;
        value_str(&contract["quanto_multiplier"])
            .and_then(|text| Decimal::from_str(text).ok())
            .or_else(|| {
                safe_f64(&contract["quanto_multiplier"]).and_then(Decimal::from_f64_retain)
            })
            .filter(|size| *size > Decimal::ZERO)
            .ok_or_else(|| {
                VenueError::not_supported(format!("gateio publishes no contract size for {symbol}"))
            })
    }

    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        let contract_size = self.contract_size(&request.symbol).await?;
        let contracts = request.quantity / contract_size;
        // Gate encodes direction in the sign of the contract count.
        let signed_size = match request.side {
            OrderSide::Buy => contracts,
            OrderSide::Sell => -contracts,
        };

        let mut params = serde_json::Map::new();
        params.insert(
            "contract".into(),
            Value::String(to_contract_name(&request.symbol)),
        );
        params.insert(
            "size".into(),
            serde_json::json!(signed_size
                .round()
                .to_string()
                .parse::<i64>()
                .unwrap_or_default()),
        );
        params.insert("price".into(), Value::String("0".into()));
        params.insert("tif".into(), Value::String("ioc".into()));
        if request.reduce_only {
            params.insert("reduce_only".into(), Value::Bool(true));
        }

        let payload = self
            .transport
            .execute(
                VenueId::Gateio,
                credential,
                SignedRequest::post("/api/v4/futures/usdt/orders", params),
            )
            .await?;

        let filled_contracts = payload["size"]
            .as_i64()
            .map(|size| size - payload["left"].as_i64().unwrap_or(0))
            .map(|filled| Decimal::from(filled.abs()));
        Ok(OrderAck {
            exchange_order_id: payload["id"].as_i64().map(|id| id.to_string()),
            filled_qty: filled_contracts.map(|contracts| contracts * contract_size),
            avg_price: safe_f64(&payload["fill_price"]),
            note: None,
            raw: payload,
        })
    }

    async fn cancel_order(
        &self,
        credential: &VenueCredential,
        _symbol: &str,
        order_id: &str,
    ) -> VenueResult<()> {
        self.transport
            .execute(
                VenueId::Gateio,
                credential,
                SignedRequest::delete(
                    format!("/api/v4/futures/usdt/orders/{order_id}"),
                    serde_json::Map::new(),
                ),
            )
            .await?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()> {
        let mut params = serde_json::Map::new();
        params.insert(
            "leverage".into(),
            Value::String(format!("{}", leverage.round() as i64)),
        );
        self.transport
            .execute(
                VenueId::Gateio,
                credential,
                SignedRequest::post(
                    format!(
                        "/api/v4/futures/usdt/positions/{}/leverage",
                        to_contract_name(symbol)
                    ),
                    params,
                ),
            )
            .await?;
        Ok(())
    }
}
