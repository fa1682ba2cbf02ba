//! Binance USDT-M futures adapter.
//!
//! Funding data joins the `premiumIndex`, 24h ticker and `exchangeInfo`
//! feeds, plus a bounded per-symbol open-interest sweep. Max leverage is
//! read from the public leverage-brackets endpoint before any private
//! probe. Orders carry the unified-account routing flag and retry once
//! with `positionSide=BOTH` on a `-4061` position-side mismatch.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::utils::{ms_to_utc, safe_f64, value_str};
use crate::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, OrderSide, OrderTransport,
    PositionSide, RateLimiter, RestOrderTransport, SignedRequest, SnapshotFields, SourceTag,
    VenueAdapter, VenueCredential, VenueError, VenueId, VenueResult,
};

const BINANCE_FAPI_URL: &str = "https://fapi.binance.com";
const DATA_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_INTEREST_CONCURRENCY: usize = 16;

pub struct BinanceAdapter {
    client: reqwest::Client,
    base_url: String,
    transport: Arc<dyn OrderTransport>,
    limiter: RateLimiter,
    /// Unified-account (portfolio margin) routing hint: every order and
    /// leverage call is steered through the papi surface when set.
    unified_account: bool,
    fetch_open_interest: bool,
    fetch_leverage_brackets: bool,
}

impl BinanceAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_FAPI_URL)
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
            unified_account: true,
            fetch_open_interest: true,
            fetch_leverage_brackets: true,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn OrderTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Skip the per-symbol open-interest sweep (tests and degraded mode).
    pub fn without_open_interest(mut self) -> Self {
        self.fetch_open_interest = false;
        self
    }

    /// Skip max-leverage enrichment on market sweeps.
    pub fn without_leverage_brackets(mut self) -> Self {
        self.fetch_leverage_brackets = false;
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

    /// Primary transport: full join of premium index, tickers, exchange
    /// info, leverage brackets and open interest.
    async fn fetch_funding_primary(&self) -> VenueResult<Vec<FundingSnapshot>> {
        let (premium, tickers, exchange_info) = tokio::try_join!(
            self.get_json("/fapi/v1/premiumIndex", &[]),
            self.get_json("/fapi/v1/ticker/24hr", &[]),
            self.get_json("/fapi/v1/exchangeInfo", &[]),
        )?;

        let symbols = usdt_perp_symbols(&exchange_info);
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let premium_map = index_by_symbol(&premium);
        let volume_map: HashMap<String, f64> = index_by_symbol(&tickers)
            .into_iter()
            .filter_map(|(symbol, row)| safe_f64(&row["quoteVolume"]).map(|v| (symbol, v)))
            .collect();
        let leverage_map = if self.fetch_leverage_brackets {
            self.leverage_brackets().await.unwrap_or_else(|err| {
                warn!(error = %err, "binance leverage brackets unavailable");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        let oi_map = if self.fetch_open_interest {
            self.fetch_open_interest_map(&symbols).await
        } else {
            HashMap::new()
        };

        let mut snapshots = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let row = match premium_map.get(symbol) {
                Some(row) => row,
                None => continue,
            };
            let mark_price = safe_f64(&row["markPrice"]);
            let open_interest_usd = match (oi_map.get(symbol), mark_price) {
                (Some(qty), Some(mark)) => Some(qty * mark),
                _ => None,
            };

            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Binance,
                symbol,
                SnapshotFields {
                    funding_rate_raw: safe_f64(&row["lastFundingRate"]),
                    funding_interval_hours: Some(8.0),
                    next_funding_time: ms_to_utc(&row["nextFundingTime"]),
                    mark_price,
                    open_interest_usd,
                    volume24h_usd: volume_map.get(symbol).copied(),
                    max_leverage: leverage_map.get(symbol).copied(),
                },
                SourceTag::Ccxt,
            ) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Minimal REST fallback: premium index only.
    async fn fetch_funding_rest(&self) -> VenueResult<Vec<FundingSnapshot>> {
        let premium = self.get_json("/fapi/v1/premiumIndex", &[]).await?;
        let rows = premium.as_array().cloned().unwrap_or_default();

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            let symbol = match value_str(&row["symbol"]) {
                Some(symbol) => symbol.to_string(),
                None => continue,
            };
            if let Some(snapshot) = FundingSnapshot::build(
                VenueId::Binance,
                &symbol,
                SnapshotFields {
                    funding_rate_raw: safe_f64(&row["lastFundingRate"]),
                    funding_interval_hours: Some(8.0),
                    next_funding_time: ms_to_utc(&row["nextFundingTime"]),
                    mark_price: safe_f64(&row["markPrice"]),
                    ..Default::default()
                },
                SourceTag::Rest,
            ) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    async fn leverage_brackets(&self) -> VenueResult<HashMap<String, f64>> {
        let payload = self.get_json("/fapi/v1/leverageBracket", &[]).await?;
        let rows = payload.as_array().cloned().unwrap_or_default();

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let symbol = match value_str(&row["symbol"]) {
                Some(symbol) => symbol.to_string(),
                None => continue,
            };
            let max = row["brackets"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|bracket| safe_f64(&bracket["initialLeverage"]))
                .fold(None, |acc: Option<f64>, lev| {
                    Some(acc.map_or(lev, |current| current.max(lev)))
                });
            if let Some(max) = max {
                map.insert(symbol, max);
            }
        }
        Ok(map)
    }

    async fn fetch_open_interest_map(&self, symbols: &[String]) -> HashMap<String, f64> {
        let semaphore = Arc::new(Semaphore::new(OPEN_INTEREST_CONCURRENCY));
        let mut handles = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let semaphore = Arc::clone(&semaphore);
            let client = self.client.clone();
            let url = format!("{}/fapi/v1/openInterest", self.base_url);
            let symbol = symbol.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                let payload: Value = client
                    .get(url)
                    .query(&[("symbol", symbol.as_str())])
                    .send()
                    .await
                    .ok()?
                    .json()
                    .await
                    .ok()?;
                safe_f64(&payload["openInterest"]).map(|value| (symbol, value))
            }));
        }

        let mut map = HashMap::new();
        for handle in handles {
            if let Ok(Some((symbol, value))) = handle.await {
                map.insert(symbol, value);
            }
        }
        map
    }

    fn order_path(&self) -> &'static str {
        if self.unified_account {
            "/papi/v1/um/order"
        } else {
            "/fapi/v1/order"
        }
    }

    fn leverage_path(&self) -> &'static str {
        if self.unified_account {
            "/papi/v1/um/leverage"
        } else {
            "/fapi/v1/leverage"
        }
    }

    fn order_params(&self, request: &OrderRequest, position_side: Option<PositionSide>) -> serde_json::Map<String, Value> {
        let mut params = serde_json::Map::new();
        params.insert("symbol".into(), Value::String(request.symbol.clone()));
        params.insert(
            "side".into(),
            Value::String(match request.side {
                OrderSide::Buy => "BUY".into(),
                OrderSide::Sell => "SELL".into(),
            }),
        );
        params.insert("type".into(), Value::String("MARKET".into()));
        params.insert(
            "quantity".into(),
            Value::String(request.quantity.normalize().to_string()),
        );
        if let Some(side) = position_side {
            params.insert(
                "positionSide".into(),
                Value::String(
                    match side {
                        PositionSide::Long => "LONG",
                        PositionSide::Short => "SHORT",
                        _ => "BOTH",
                    }
                    .into(),
                ),
            );
        }
        // Hedge-mode rejects reduceOnly alongside an explicit LONG/SHORT side.
        let hedged = matches!(
            position_side,
            Some(PositionSide::Long) | Some(PositionSide::Short)
        );
        if request.reduce_only && !hedged {
            params.insert("reduceOnly".into(), Value::String("true".into()));
        }
        params
    }
}

impl Default for BinanceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn usdt_perp_symbols(exchange_info: &Value) -> Vec<String> {
    exchange_info["symbols"]
        .as_array()
        .into_iter()
        .flatten()
        .filter(|row| {
            row["quoteAsset"].as_str() == Some("USDT")
                && row["contractType"].as_str() == Some("PERPETUAL")
                && row["status"].as_str() == Some("TRADING")
        })
        .filter_map(|row| value_str(&row["symbol"]).map(str::to_string))
        .collect()
}

fn index_by_symbol(payload: &Value) -> HashMap<String, Value> {
    payload
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|row| {
            value_str(&row["symbol"]).map(|symbol| (symbol.to_string(), row.clone()))
        })
        .collect()
}

fn parse_order_ack(payload: &Value, contract_note: Option<String>) -> OrderAck {
    let filled_qty = value_str(&payload["executedQty"])
        .and_then(|text| Decimal::from_str(text).ok())
        .or_else(|| payload["executedQty"].as_f64().and_then(Decimal::from_f64_retain));
    OrderAck {
        exchange_order_id: payload["orderId"]
            .as_i64()
            .map(|id| id.to_string())
            .or_else(|| value_str(&payload["orderId"]).map(str::to_string)),
        filled_qty,
        avg_price: safe_f64(&payload["avgPrice"]),
        note: contract_note,
        raw: payload.clone(),
    }
}

fn is_position_side_mismatch(err: &VenueError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("-4061") && text.contains("position side")
}

#[async_trait]
impl VenueAdapter for BinanceAdapter {
    fn venue(&self) -> VenueId {
        VenueId::Binance
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        match self.fetch_funding_primary().await {
            Ok(snapshots) if !snapshots.is_empty() => {
                return Ok(FundingBatch {
                    source: SourceTag::Ccxt,
                    snapshots,
                })
            }
            Ok(_) => debug!("binance primary funding fetch returned no rows"),
            Err(err) => warn!(error = %err, "binance primary funding fetch failed"),
        }

        let snapshots = self.fetch_funding_rest().await?;
        Ok(FundingBatch {
            source: SourceTag::Rest,
            snapshots,
        })
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        let payload = self
            .get_json("/fapi/v1/premiumIndex", &[("symbol", symbol)])
            .await?;
        safe_f64(&payload["markPrice"])
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                VenueError::not_supported(format!("binance has no mark price for {symbol}"))
            })
    }

    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>> {
        let brackets = self.leverage_brackets().await?;
        Ok(brackets.get(symbol).copied())
    }

    async fn contract_size(&self, _symbol: &str) -> VenueResult<Decimal> {
        // USDT-M futures are sized directly in the base asset.
        Ok(Decimal::ONE)
    }

    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        let params = self.order_params(request, request.position_side);
        let call = SignedRequest::post(self.order_path(), params);

        match self
            .transport
            .execute(VenueId::Binance, credential, call)
            .await
        {
            Ok(payload) => Ok(parse_order_ack(&payload, None)),
            Err(err) if is_position_side_mismatch(&err) => {
                // Account is in one-way mode: retry once with BOTH.
                warn!(symbol = %request.symbol, "binance position side mismatch, retrying with BOTH");
                let retry_params = self.order_params(request, Some(PositionSide::Both));
                let retry = SignedRequest::post(self.order_path(), retry_params);
                let payload = self
                    .transport
                    .execute(VenueId::Binance, credential, retry)
                    .await?;
                Ok(parse_order_ack(
                    &payload,
                    Some("retried with positionSide=BOTH after -4061".to_string()),
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
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert("orderId".into(), Value::String(order_id.to_string()));
        self.transport
            .execute(
                VenueId::Binance,
                credential,
                SignedRequest::delete(self.order_path(), params),
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
        params.insert("symbol".into(), Value::String(symbol.to_string()));
        params.insert(
            "leverage".into(),
            Value::String(format!("{}", leverage.round() as i64)),
        );
        self.transport
            .execute(
                VenueId::Binance,
                credential,
                SignedRequest::post(self.leverage_path(), params),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_usdt_perp_symbol_filter() {
        let info = json!({
            "symbols": [
                {"symbol": "BTCUSDT", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "TRADING"},
                {"symbol": "BTCUSD_PERP", "quoteAsset": "USD", "contractType": "PERPETUAL", "status": "TRADING"},
                {"symbol": "ETHUSDT", "quoteAsset": "USDT", "contractType": "CURRENT_QUARTER", "status": "TRADING"},
                {"symbol": "XRPUSDT", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "SETTLING"},
            ]
        });
        assert_eq!(usdt_perp_symbols(&info), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_position_side_mismatch_detection() {
        let err = VenueError::fatal(
            "http 400: {\"code\":-4061,\"msg\":\"Order's position side does not match user's setting.\"}",
        );
        assert!(is_position_side_mismatch(&err));

        let other = VenueError::fatal("http 400: {\"code\":-1102,\"msg\":\"param missing\"}");
        assert!(!is_position_side_mismatch(&other));
    }

    #[test]
    fn test_order_params_reduce_only_suppressed_in_hedge_mode() {
        let adapter = BinanceAdapter::new();
        let request = OrderRequest {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Sell,
            quantity: Decimal::new(1, 2),
            reduce_only: true,
            position_side: Some(PositionSide::Long),
        };

        let hedged = adapter.order_params(&request, Some(PositionSide::Long));
        assert_eq!(hedged["positionSide"], json!("LONG"));
        assert!(!hedged.contains_key("reduceOnly"));

        let one_way = adapter.order_params(&request, Some(PositionSide::Both));
        assert_eq!(one_way["positionSide"], json!("BOTH"));
        assert_eq!(one_way["reduceOnly"], json!("true"));
    }

    #[test]
    fn test_parse_order_ack() {
        let payload = json!({
            "orderId": 123456,
            "executedQty": "0.010",
            "avgPrice": "50000.5"
        });
        let ack = parse_order_ack(&payload, None);
        assert_eq!(ack.exchange_order_id.as_deref(), Some("123456"));
        assert_eq!(ack.filled_qty, Some(Decimal::new(10, 3)));
        assert_eq!(ack.avg_price, Some(50000.5));
    }
}
