//! OKX swap adapter.
//!
//! Funding rates must be fetched per instrument, so the sweep runs under
//! a time budget with bounded concurrency and degrades to partial results
//! rather than stalling the whole snapshot. Orders default to a
//! `posSide` matching the leg's intent and retry once with `posSide=net`
//! (appending `reduceOnly` when closing) on a parameter error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::utils::{ms_to_utc, safe_f64, value_str};
use crate::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, OrderSide, OrderTransport,
    PositionSide, RateLimiter, RestOrderTransport, SignedRequest, SnapshotFields, SourceTag,
    VenueAdapter, VenueCredential, VenueError, VenueId, VenueResult,
};

const OKX_BASE_URL: &str = "https://www.okx.com";
const DATA_TIMEOUT: Duration = Duration::from_secs(5);
const FUNDING_SWEEP_BUDGET: Duration = Duration::from_secs(10);
const FUNDING_SWEEP_CONCURRENCY: usize = 16;

pub struct OkxAdapter {
    client: reqwest::Client,
    base_url: String,
    transport: Arc<dyn OrderTransport>,
    limiter: RateLimiter,
    funding_budget: Duration,
}

impl OkxAdapter {
    pub fn new() -> Self {
        Self::with_base_url(OKX_BASE_URL)
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
            funding_budget: FUNDING_SWEEP_BUDGET,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn OrderTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_funding_budget(mut self, budget: Duration) -> Self {
        self.funding_budget = budget;
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

    async fn fetch_instruments(&self) -> VenueResult<Vec<Value>> {
        let payload = self
            .get_json("/api/v5/public/instruments", &[("instType", "SWAP")])
            .await?;
        Ok(payload["data"].as_array().cloned().unwrap_or_default())
    }

    async fn fetch_funding_snapshots(&self, enrich: bool) -> VenueResult<Vec<FundingSnapshot>> {
        let instruments = self.fetch_instruments().await?;
        let tickers = self
            .get_json("/api/v5/market/tickers", &[("instType", "SWAP")])
            .await?;
        let open_interest = if enrich {
            self.get_json("/api/v5/public/open-interest", &[("instType", "SWAP")])
                .await
                .unwrap_or(Value::Null)
        } else {
            Value::Null
        };

        let usdt_swaps: Vec<Value> = instruments
            .into_iter()
            .filter(|item| {
                item["instType"].as_str() == Some("SWAP")
                    && item["settleCcy"].as_str() == Some("USDT")
                    && item["state"].as_str() == Some("live")
            })
            .collect();
        let inst_ids: Vec<String> = usdt_swaps
            .iter()
            .filter_map(|item| value_str(&item["instId"]).map(str::to_string))
            .collect();

        let funding_map = self.fetch_funding_rates(&inst_ids).await;
        let ticker_map = index_by_inst_id(&tickers["data"]);
        let oi_map = index_by_inst_id(&open_interest["data"]);

        let mut snapshots = Vec::with_capacity(usdt_swaps.len());
        for item in &usdt_swaps {
            let inst_id = match value_str(&item["instId"]) {
                Some(inst_id) => inst_id,
                None => continue,
            };
            let funding = funding_map.get(inst_id);
            let ticker = ticker_map.get(inst_id);
            let oi = oi_map.get(inst_id);

            let last_price = ticker.and_then(|row| safe_f64(&row["last"]));
            let volume24h_usd = match (last_price, ticker.and_then(|row| safe_f64(&row["volCcy24h"]))) {
                (Some(last), Some(vol_ccy)) => Some(last * vol_ccy),
                _ => None,
            };

            let funding_time = funding.and_then(|row| ms_to_utc(&row["fundingTime"]));
            let next_funding_time = funding.and_then(|row| ms_to_utc(&row["nextFundingTime"]));

            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Okx,
                inst_id,
                SnapshotFields {
                    funding_rate_raw: funding.and_then(|row| safe_f64(&row["fundingRate"])),
                    funding_interval_hours: Some(infer_funding_interval(
                        funding_time,
                        next_funding_time,
                    )),
                    next_funding_time,
                    mark_price: last_price,
                    open_interest_usd: oi.and_then(|row| safe_f64(&row["oiUsd"])),
                    volume24h_usd,
                    max_leverage: safe_f64(&item["lever"]),
                },
                if enrich { SourceTag::Ccxt } else { SourceTag::Rest },
            ) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Per-instrument funding sweep under a wall-clock budget. Instruments
    /// that miss the budget simply lack funding fields in this cycle.
    async fn fetch_funding_rates(&self, inst_ids: &[String]) -> HashMap<String, Value> {
        let started = Instant::now();
        let budget = self.funding_budget;
        let semaphore = Arc::new(Semaphore::new(FUNDING_SWEEP_CONCURRENCY));
        let mut handles = Vec::with_capacity(inst_ids.len());

        for inst_id in inst_ids {
            if started.elapsed() > budget {
                debug!("okx funding sweep budget exhausted, returning partial results");
                break;
            }
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let url = format!("{}/api/v5/public/funding-rate", self.base_url);
            let inst_id = inst_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                if started.elapsed() > budget {
                    return None;
                }
                let payload: Value = client
                    .get(url)
                    .query(&[("instId", inst_id.as_str())])
                    .send()
                    .await
                    .ok()?
                    .json()
                    .await
                    .ok()?;
                let row = payload["data"].as_array()?.first()?.clone();
                Some((inst_id, row))
            }));
        }

        let mut map = HashMap::new();
        for handle in handles {
            if let Ok(Some((inst_id, row))) = handle.await {
                map.insert(inst_id, row);
            }
        }
        map
    }

    async fn instrument(&self, symbol: &str) -> VenueResult<Value> {
        let inst_id = to_inst_id(symbol);
        let payload = self
            .get_json(
                "/api/v5/public/instruments",
                &[("instType", "SWAP"), ("instId", inst_id.as_str())],
            )
            .await?;
        payload["data"]
            .as_array()
            .and_then(|rows| rows.first().cloned())
            .ok_or_else(|| VenueError::not_supported(format!("okx has no swap for {symbol}")))
    }

    fn order_params(
        &self,
        request: &OrderRequest,
        contracts: Decimal,
        pos_side: &str,
        reduce_only: bool,
    ) -> serde_json::Map<String, Value> {
        let mut params = serde_json::Map::new();
        params.insert("instId".into(), Value::String(to_inst_id(&request.symbol)));
        params.insert("tdMode".into(), Value::String("cross".into()));
        params.insert("side".into(), Value::String(request.side.as_str().into()));
        params.insert("ordType".into(), Value::String("market".into()));
        params.insert(
            "sz".into(),
            Value::String(contracts.normalize().to_string()),
        );
        params.insert("posSide".into(), Value::String(pos_side.into()));
        if reduce_only {
            params.insert("reduceOnly".into(), Value::Bool(true));
        }
        params
    }

    async fn send_order(
        &self,
        credential: &VenueCredential,
        params: serde_json::Map<String, Value>,
    ) -> VenueResult<Value> {
        let payload = self
            .transport
            .execute(
                VenueId::Okx,
                credential,
                SignedRequest::post("/api/v5/trade/order", params),
            )
            .await?;
        check_okx_response(payload)
    }
}

impl Default for OkxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// `BTCUSDT` -> `BTC-USDT-SWAP`.
fn to_inst_id(symbol: &str) -> String {
    let base = symbol
        .to_ascii_uppercase()
        .strip_suffix("USDT")
        .map(str::to_string)
        .unwrap_or_else(|| symbol.to_ascii_uppercase());
    format!("{base}-USDT-SWAP")
}

fn index_by_inst_id(payload: &Value) -> HashMap<String, Value> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|row| {
            value_str(&row["instId"]).map(|inst_id| (inst_id.to_string(), row.clone()))
        })
        .collect()
}

fn infer_funding_interval(
    funding_time: Option<DateTime<Utc>>,
    next_funding_time: Option<DateTime<Utc>>,
) -> f64 {
    if let (Some(current), Some(next)) = (funding_time, next_funding_time) {
        let diff_hours = (next - current).num_seconds() as f64 / 3600.0;
        if diff_hours > 0.0 {
            return diff_hours;
        }
    }
    8.0
}

/// OKX wraps errors in HTTP 200 bodies; surface them as venue errors.
fn check_okx_response(payload: Value) -> VenueResult<Value> {
    let code = payload["code"].as_str().unwrap_or("0");
    if code == "0" {
        return Ok(payload);
    }
    let detail = payload["data"]
        .as_array()
        .and_then(|rows| rows.first())
        .and_then(|row| value_str(&row["sMsg"]))
        .or_else(|| value_str(&payload["msg"]))
        .unwrap_or("unknown okx error");
    Err(VenueError::fatal(format!("okx code {code}: {detail}")))
}

fn is_parameter_error(err: &VenueError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("posside") || text.contains("code 51000") || text.contains("parameter")
}

fn parse_order_ack(payload: &Value, contract_size: Decimal, note: Option<String>) -> OrderAck {
    let row = payload["data"]
        .as_array()
        .and_then(|rows| rows.first())
        .cloned()
        .unwrap_or(Value::Null);
    let filled_contracts = value_str(&row["accFillSz"])
        .and_then(|text| Decimal::from_str(text).ok());
    OrderAck {
        exchange_order_id: value_str(&row["ordId"]).map(str::to_string),
        filled_qty: filled_contracts.map(|contracts| contracts * contract_size),
        avg_price: safe_f64(&row["avgPx"]),
        note,
        raw: payload.clone(),
    }
}

#[async_trait]
impl VenueAdapter for OkxAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Okx
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        match self.fetch_funding_snapshots(true).await {
            Ok(snapshots) if !snapshots.is_empty() => {
                return Ok(FundingBatch {
                    source: SourceTag::Ccxt,
                    snapshots,
                })
            }
            Ok(_) => debug!("okx primary funding fetch returned no rows"),
            Err(err) => warn!(error = %err, "okx primary funding fetch failed"),
        }

        let snapshots = self.fetch_funding_snapshots(false).await?;
        Ok(FundingBatch {
            source: SourceTag::Rest,
            snapshots,
        })
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let inst_id = to_inst_id(symbol);
        let payload = self
            .get_json(
                "/api/v5/public/mark-price",
                &[("instType", "SWAP"), ("instId", inst_id.as_str())],
            )
            .await?;
        payload["data"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["markPx"]))
            .filter(|price| *price > 0.0)
            .ok_or_else(|| VenueError::not_supported(format!("okx has no mark price for {symbol}")))
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>> {
        let instrument = self.instrument(symbol).await?;
        Ok(safe_f64(&instrument["lever"]))
    }

    async fn contract_size(&self, symbol: &str) -> VenueResult<Decimal> {
        let instrument = self.instrument(symbol).await?;
        value_str(&instrument["ctVal"])
            .and_then(|text| Decimal::from_str(text).ok())
            .filter(|size| *size > Decimal::ZERO)
            .ok_or_else(|| {
                VenueError::not_supported(format!("okx publishes no contract size for {symbol}"))
            })
    }

    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        let contract_size = self.contract_size(&request.symbol).await?;
        let contracts = request.quantity / contract_size;

        let pos_side = match request.position_side {
            Some(PositionSide::Long) => "long",
            Some(PositionSide::Short) => "short",
            Some(PositionSide::Net) | Some(PositionSide::Both) => "net",
            None => match request.side {
                OrderSide::Buy => "long",
                OrderSide::Sell => "short",
            },
        };

        // posSide long/short implies direction; reduceOnly only applies in net mode.
        let params = self.order_params(request, contracts, pos_side, false);
        match self.send_order(credential, params).await {
            Ok(payload) => Ok(parse_order_ack(&payload, contract_size, None)),
            Err(err) if is_parameter_error(&err) => {
                warn!(symbol = %request.symbol, "okx rejected posSide, retrying in net mode");
                let retry_params =
                    self.order_params(request, contracts, "net", request.reduce_only);
                let payload = self.send_order(credential, retry_params).await?;
                Ok(parse_order_ack(
                    &payload,
                    contract_size,
                    Some("retried with posSide=net after parameter error".to_string()),
                ))
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        order_id: &str,
    ) -> VenueResult<()> {
        let mut params = serde_json::Map::new();
        params.insert("instId".into(), Value::String(to_inst_id(symbol)));
        params.insert("ordId".into(), Value::String(order_id.to_string()));
        let payload = self
            .transport
            .execute(
                VenueId::Okx,
                credential,
                SignedRequest::post("/api/v5/trade/cancel-order", params),
            )
            .await?;
        check_okx_response(payload)?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()> {
        let mut params = serde_json::Map::new();
        params.insert("instId".into(), Value::String(to_inst_id(symbol)));
        params.insert(
            "lever".into(),
            Value::String(format!("{}", leverage.round() as i64)),
        );
        params.insert("mgnMode".into(), Value::String("cross".into()));
        let payload = self
            .transport
            .execute(
                VenueId::Okx,
                credential,
                SignedRequest::post("/api/v5/account/set-leverage", params),
            )
            .await?;
        check_okx_response(payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_inst_id_round_trip() {
        assert_eq!(to_inst_id("BTCUSDT"), "BTC-USDT-SWAP");
        assert_eq!(to_inst_id("1000PEPEUSDT"), "1000PEPE-USDT-SWAP");
    }

    #[test]
    fn test_infer_funding_interval() {
        let current = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 8, 1, 4, 0, 0).unwrap();
        assert_eq!(infer_funding_interval(Some(current), Some(next)), 4.0);
        assert_eq!(infer_funding_interval(None, Some(next)), 8.0);
        // A non-positive delta falls back to the default cadence.
        assert_eq!(infer_funding_interval(Some(next), Some(current)), 8.0);
    }

    #[test]
    fn test_check_okx_response_surfaces_scode() {
        let payload = json!({
            "code": "1",
            "data": [{"sCode": "51000", "sMsg": "Parameter posSide error"}]
        });
        let err = check_okx_response(payload).unwrap_err();
        assert!(is_parameter_error(&err));

        let ok = json!({"code": "0", "data": [{"ordId": "1"}]});
        assert!(check_okx_response(ok).is_ok());
    }

    #[test]
    fn test_parse_order_ack_converts_contracts() {
        let payload = json!({
            "code": "0",
            "data": [{"ordId": "abc", "accFillSz": "10", "avgPx": "50000"}]
        });
        // 10 contracts at 0.01 BTC each -> 0.1 BTC
        let ack = parse_order_ack(&payload, Decimal::new(1, 2), None);
        assert_eq!(ack.filled_qty, Some(Decimal::new(1, 1)));
        assert_eq!(ack.exchange_order_id.as_deref(), Some("abc"));
    }
}
