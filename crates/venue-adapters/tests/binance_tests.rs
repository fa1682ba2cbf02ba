//! Integration tests for the Binance adapter.
//!
//! Uses wiremock for public market data endpoints and a scripted
//! transport for the private order surface, so no real exchange API is
//! touched.

use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use venue_adapters::binance::BinanceAdapter;
use venue_adapters::{
    OrderRequest, OrderSide, OrderTransport, PositionSide, SignedRequest, SourceTag,
    VenueAdapter, VenueCredential, VenueError, VenueId, VenueResult,
};

/// Transport double that replays a scripted sequence of responses and
/// records every signed request it saw.
struct ScriptedTransport {
    responses: Mutex<VecDeque<VenueResult<Value>>>,
    requests: Mutex<Vec<SignedRequest>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<VenueResult<Value>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    async fn recorded(&self) -> Vec<SignedRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl OrderTransport for ScriptedTransport {
    async fn execute(
        &self,
        _venue: VenueId,
        _credential: &VenueCredential,
        request: SignedRequest,
    ) -> VenueResult<Value> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(VenueError::fatal("scripted transport exhausted")))
    }
}

fn test_credential() -> VenueCredential {
    VenueCredential::new("key".into(), "secret".into(), None, false)
}

async fn mount_market_data(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "symbol": "BTCUSDT",
                "markPrice": "50000.0",
                "lastFundingRate": "0.0001",
                "nextFundingTime": 1_700_000_000_000i64
            },
            {
                "symbol": "BTCUSD_PERP",
                "markPrice": "50000.0",
                "lastFundingRate": "0.0002",
                "nextFundingTime": 1_700_000_000_000i64
            }
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/24hr"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "BTCUSDT", "quoteVolume": "123456789.0"}
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [
                {
                    "symbol": "BTCUSDT",
                    "quoteAsset": "USDT",
                    "contractType": "PERPETUAL",
                    "status": "TRADING"
                }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/leverageBracket"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "BTCUSDT", "brackets": [
                {"initialLeverage": 125}, {"initialLeverage": 50}
            ]}
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_funding_fetch_joins_feeds() {
    let server = MockServer::start().await;
    mount_market_data(&server).await;

    let adapter = BinanceAdapter::with_base_url(server.uri()).without_open_interest();
    let batch = adapter.fetch_funding().await.expect("fetch should succeed");

    assert_eq!(batch.source, SourceTag::Ccxt);
    assert_eq!(batch.snapshots.len(), 1);
    let snapshot = &batch.snapshots[0];
    assert_eq!(snapshot.symbol, "BTCUSDT");
    assert_eq!(snapshot.exchange, VenueId::Binance);
    assert_eq!(snapshot.funding_rate_raw, Some(0.0001));
    assert_eq!(snapshot.funding_interval_hours, Some(8.0));
    assert_eq!(snapshot.max_leverage, Some(125.0));
    assert_eq!(snapshot.volume24h_usd, Some(123_456_789.0));
    assert!(snapshot.next_funding_time.is_some());
}

#[tokio::test]
async fn test_funding_falls_back_to_rest_tier() {
    let server = MockServer::start().await;
    // Primary tier needs exchangeInfo; break it so only the premium index
    // remains usable.
    Mock::given(method("GET"))
        .and(path("/fapi/v1/exchangeInfo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/ticker/24hr"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "symbol": "ETHUSDT",
                "markPrice": "3000.0",
                "lastFundingRate": "0.0002",
                "nextFundingTime": 1_700_000_000_000i64
            }
        ])))
        .mount(&server)
        .await;

    let adapter = BinanceAdapter::with_base_url(server.uri()).without_open_interest();
    let batch = adapter.fetch_funding().await.expect("rest tier should serve");

    assert_eq!(batch.source, SourceTag::Rest);
    assert_eq!(batch.snapshots.len(), 1);
    assert_eq!(batch.snapshots[0].symbol, "ETHUSDT");
    assert_eq!(batch.snapshots[0].source_tag, SourceTag::Rest);
}

#[tokio::test]
async fn test_mark_price_rejects_non_positive() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fapi/v1/premiumIndex"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"symbol": "BTCUSDT", "markPrice": "0"})),
        )
        .mount(&server)
        .await;

    let adapter = BinanceAdapter::with_base_url(server.uri());
    let err = adapter.fetch_mark_price("BTCUSDT").await.unwrap_err();
    assert_eq!(err.kind(), "not_supported");
}

#[tokio::test]
async fn test_order_retries_position_side_mismatch() {
    let transport = ScriptedTransport::new(vec![
        Err(VenueError::fatal(
            "http 400: {\"code\":-4061,\"msg\":\"Order's position side does not match user's setting.\"}",
        )),
        Ok(json!({"orderId": 42, "executedQty": "0.01", "avgPrice": "50000"})),
    ]);
    let adapter = BinanceAdapter::new().with_transport(transport.clone());

    let ack = adapter
        .place_order(
            &test_credential(),
            &OrderRequest {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(0.01),
                reduce_only: false,
                position_side: Some(PositionSide::Long),
            },
        )
        .await
        .expect("retry should succeed");

    assert_eq!(ack.exchange_order_id.as_deref(), Some("42"));
    assert_eq!(ack.filled_qty, Some(dec!(0.01)));
    // The retry is annotated so the executor can surface a diagnostic
    // note without raising a risk event.
    assert!(ack.note.as_deref().unwrap_or_default().contains("-4061"));

    let requests = transport.recorded().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].params["positionSide"], json!("LONG"));
    assert_eq!(requests[1].params["positionSide"], json!("BOTH"));
}

#[tokio::test]
async fn test_order_other_errors_not_retried() {
    let transport = ScriptedTransport::new(vec![Err(VenueError::fatal(
        "http 400: {\"code\":-2019,\"msg\":\"Margin is insufficient.\"}",
    ))]);
    let adapter = BinanceAdapter::new().with_transport(transport.clone());

    let err = adapter
        .place_order(
            &test_credential(),
            &OrderRequest {
                symbol: "BTCUSDT".into(),
                side: OrderSide::Buy,
                quantity: dec!(0.01),
                reduce_only: false,
                position_side: Some(PositionSide::Long),
            },
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("-2019"));
    assert_eq!(transport.recorded().await.len(), 1);
}

#[tokio::test]
async fn test_cancel_order_routes_unified_account() {
    let transport = ScriptedTransport::new(vec![Ok(json!({"status": "CANCELED"}))]);
    let adapter = BinanceAdapter::new().with_transport(transport.clone());

    adapter
        .cancel_order(&test_credential(), "BTCUSDT", "42")
        .await
        .expect("cancel should succeed");

    let requests = transport.recorded().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "DELETE");
    assert_eq!(requests[0].path, "/papi/v1/um/order");
    assert_eq!(requests[0].params["orderId"], json!("42"));
}

#[tokio::test]
async fn test_set_leverage_routes_unified_account() {
    let transport = ScriptedTransport::new(vec![Ok(json!({"leverage": 10}))]);
    let adapter = BinanceAdapter::new().with_transport(transport.clone());

    adapter
        .set_leverage(&test_credential(), "BTCUSDT", 10.0)
        .await
        .expect("set_leverage should succeed");

    let requests = transport.recorded().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/papi/v1/um/leverage");
    assert_eq!(requests[0].params["leverage"], json!("10"));
}
