//! Bitget USDT futures adapter.
//!
//! The public v2 mix feeds carry no next-funding timestamp, so snapshots
//! ship without one and the scoring layer treats those rows as
//! missing-data for settlement previews.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::utils::{parse_interval_hours, safe_f64, value_str};
use crate::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, OrderTransport, RateLimiter,
    RestOrderTransport, SignedRequest, SnapshotFields, SourceTag, VenueAdapter, VenueCredential,
    VenueError, VenueId, VenueResult,
};

const BITGET_BASE_URL: &str = "https://api.bitget.com";
const DATA_TIMEOUT: Duration = Duration::from_secs(5);
const PRODUCT_TYPE: &str = "USDT-FUTURES";

pub struct BitgetAdapter {
    client: reqwest::Client,
    base_url: String,
    transport: Arc<dyn OrderTransport>,
    limiter: RateLimiter,
}

impl BitgetAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BITGET_BASE_URL)
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

    fn build_snapshots(
        tickers: &[Value],
        contracts: &HashMap<String, Value>,
        source: SourceTag,
    ) -> Vec<FundingSnapshot> {
        let mut snapshots = Vec::with_capacity(tickers.len());
        for row in tickers {
            let symbol = match value_str(&row["symbol"]) {
                Some(symbol) if symbol.ends_with("USDT") => symbol.to_string(),
                _ => continue,
            };
            let contract = contracts.get(&symbol);

            let mark_price = safe_f64(&row["markPrice"]);
            let open_interest_usd = match (mark_price, safe_f64(&row["holdingAmount"])) {
                (Some(mark), Some(holding)) => Some(mark * holding),
                _ => None,
            };

            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Bitget,
                &symbol,
                SnapshotFields {
                    funding_rate_raw: safe_f64(&row["fundingRate"]),
                    funding_interval_hours: Some(
                        contract
                            .and_then(|item| parse_interval_hours(&item["fundInterval"]))
                            .unwrap_or(8.0),
                    ),
                    next_funding_time: None,
                    mark_price,
                    open_interest_usd,
                    volume24h_usd: safe_f64(&row["usdtVolume"])
                        .or_else(|| safe_f64(&row["quoteVolume"])),
                    max_leverage: contract.and_then(|item| safe_f64(&item["maxLever"])),
                },
                source,
            ) {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

impl Default for BitgetAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitget wraps errors in HTTP 200 bodies keyed by string code `00000`.
fn check_bitget_response(payload: Value) -> VenueResult<Value> {
    let code = payload["code"].as_str().unwrap_or("00000");
    if code == "00000" {
        return Ok(payload);
    }
    let message = value_str(&payload["msg"]).unwrap_or("unknown bitget error");
    Err(VenueError::fatal(format!("bitget code {code}: {message}")))
}

#[async_trait]
impl VenueAdapter for BitgetAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Bitget
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        let tickers_resp = self
            .get_json("/api/v2/mix/market/tickers", &[("productType", PRODUCT_TYPE)])
            .await?;
        let tickers = tickers_resp["data"].as_array().cloned().unwrap_or_default();

        match self
            .get_json(
                "/api/v2/mix/market/contracts",
                &[("productType", PRODUCT_TYPE)],
            )
            .await
        {
            Ok(contracts_resp) => {
                let contracts: HashMap<String, Value> = contracts_resp["data"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(|row| {
                        value_str(&row["symbol"]).map(|symbol| (symbol.to_string(), row.clone()))
                    })
                    .collect();
                Ok(FundingBatch {
                    source: SourceTag::Ccxt,
                    snapshots: Self::build_snapshots(&tickers, &contracts, SourceTag::Ccxt),
                })
            }
            Err(err) => {
                warn!(error = %err, "bitget contracts fetch failed, serving ticker-only snapshots");
                Ok(FundingBatch {
                    source: SourceTag::Rest,
                    snapshots: Self::build_snapshots(&tickers, &HashMap::new(), SourceTag::Rest),
                })
            }
        }
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let payload = self
            .get_json(
                "/api/v2/mix/market/ticker",
                &[("productType", PRODUCT_TYPE), ("symbol", symbol)],
            )
            .await?;
        payload["data"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["markPrice"]))
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                VenueError::not_supported(format!("bitget has no mark price for {symbol}"))
            })
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>> {
        let payload = self
            .get_json(
                "/api/v2/mix/market/contracts",
                &[("productType", PRODUCT_TYPE), ("symbol", symbol)],
            )
            .await?;
        Ok(payload["data"]
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(|row| safe_f64(&row["maxLever"])))
    }

    async fn contract_size(&self, _symbol: &str) -> VenueResult<Decimal> {
        // Mix futures order sizes are denominated in the base coin.
        Ok(Decimal::ONE)
    }

    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        let mut params = serde_json::Map::new();
        params.insert("symbol".into(), Value::String(request.symbol.clone()));
        params.insert("productType".into(), Value::String(PRODUCT_TYPE.into()));
        params.insert("marginMode".into(), Value::String("crossed".into()));
        params.insert("marginCoin".into(), Value::String("USDT".into()));
        params.insert(
            "size".into(),
            Value::String(request.quantity.normalize().to_string()),
        );
        params.insert("side".into(), Value::String(request.side.as_str().into()));
        params.insert("orderType".into(), Value::String("market".into()));
        if request.reduce_only {
            params.insert("reduceOnly".into(), Value::String("YES".into()));
        }

        let payload = self
            .transport
            .execute(
                VenueId::Bitget,
                credential,
                SignedRequest::post("/api/v2/mix/order/place-order", params),
            )
            .await?;
        let payload = check_bitget_response(payload)?;

        Ok(OrderAck {
            exchange_order_id: value_str(&payload["data"]["orderId"]).map(str::to_string),
            filled_qty: Some(request.quantity),
            avg_price: None,
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
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert("productType".into(), Value::String(PRODUCT_TYPE.into()));
        params.insert("orderId".into(), Value::String(order_id.to_string()));
        let payload = self
            .transport
            .execute(
                VenueId::Bitget,
                credential,
                SignedRequest::post("/api/v2/mix/order/cancel-order", params),
            )
            .await?;
        check_bitget_response(payload)?;
        Ok(())
    }

    async fn set_leverage(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()> {
        let mut params = serde_json::Map::new();
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert("productType".into(), Value::String(PRODUCT_TYPE.into()));
        params.insert("marginCoin".into(), Value::String("USDT".into()));
        params.insert(
            "leverage".into(),
            Value::String(format!("{}", leverage.round() as i64)),
        );
        let payload = self
            .transport
            .execute(
                VenueId::Bitget,
                credential,
                SignedRequest::post("/api/v2/mix/account/set-leverage", params),
            )
            .await?;
        check_bitget_response(payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_check_bitget_response() {
        assert!(check_bitget_response(json!({"code": "00000", "data": {}})).is_ok());
        let err =
            check_bitget_response(json!({"code": "40019", "msg": "param error"})).unwrap_err();
        assert!(err.to_string().contains("40019"));
    }

    #[test]
    fn test_build_snapshots_derives_open_interest() {
        let tickers = vec![json!({
            "symbol": "BTCUSDT",
            "fundingRate": "0.0001",
            "markPrice": "50000",
            "holdingAmount": "100",
            "usdtVolume": "2000000"
        })];
        let mut contracts = HashMap::new();
        contracts.insert(
            "BTCUSDT".to_string(),
            json!({"fundInterval": 8, "maxLever": "125"}),
        );

        let snapshots = BitgetAdapter::build_snapshots(&tickers, &contracts, SourceTag::Ccxt);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].open_interest_usd, Some(5_000_000.0));
        assert_eq!(snapshots[0].max_leverage, Some(125.0));
        assert!(snapshots[0].next_funding_time.is_none());
    }
}
