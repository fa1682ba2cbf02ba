//! Two-leg execution state machine tests over scripted adapters and
//! in-memory stores.

mod common;

use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{FixedCredentials, LeverageScript, MemoryStores, OrderScript, StubAdapter};
use funding_engine::execution::{
    CloseRequest, ConvertRequest, EmergencyCloseRequest, HedgeRequest, OpenRequest,
    PreviewRequest,
};
use funding_engine::{
    EngineConfig, ExecutionCoordinator, MarketProvider, OrderAction, OrderStatus,
    PositionStatus, RiskSeverity,
};
use venue_adapters::{OrderSide, VenueAdapter, VenueId};

struct Harness {
    binance: Arc<StubAdapter>,
    okx: Arc<StubAdapter>,
    stores: Arc<MemoryStores>,
    coordinator: ExecutionCoordinator,
}

fn harness_with_credentials(credentialed: &[VenueId]) -> Harness {
    let binance = StubAdapter::new(VenueId::Binance);
    let okx = StubAdapter::new(VenueId::Okx);

    let mut adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>> = BTreeMap::new();
    adapters.insert(VenueId::Binance, binance.clone());
    adapters.insert(VenueId::Okx, okx.clone());

    let config = EngineConfig {
        venue_fetch_budget: Duration::from_millis(200),
        total_fetch_budget: Duration::from_millis(500),
        order_call_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let provider = Arc::new(MarketProvider::new(adapters.clone(), config.clone()));
    let stores = MemoryStores::new();
    let coordinator = ExecutionCoordinator::new(
        adapters,
        provider,
        stores.clone(),
        stores.clone(),
        stores.clone(),
        FixedCredentials::for_venues(credentialed),
        config,
    );

    Harness {
        binance,
        okx,
        stores,
        coordinator,
    }
}

fn harness() -> Harness {
    harness_with_credentials(&[VenueId::Binance, VenueId::Okx])
}

fn open_request() -> OpenRequest {
    OpenRequest {
        symbol: "BTCUSDT".into(),
        long_exchange: VenueId::Binance,
        short_exchange: VenueId::Okx,
        quantity: dec!(0.01),
        leverage: Some(10.0),
        credentials: Default::default(),
        note: None,
    }
}

#[tokio::test]
async fn test_open_success_places_opposite_legs() {
    let harness = harness();
    let report = harness.coordinator.open(open_request()).await.unwrap();

    assert!(report.success);
    assert_eq!(report.legs.len(), 2);

    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::Open);
    drop(positions);

    // Exactly two ok orders with opposite sides on the named venues.
    let orders = harness.stores.orders.lock().await;
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|order| order.status == OrderStatus::Ok));
    let long = orders
        .iter()
        .find(|order| order.exchange == VenueId::Binance)
        .unwrap();
    let short = orders
        .iter()
        .find(|order| order.exchange == VenueId::Okx)
        .unwrap();
    assert_eq!(long.side, OrderSide::Buy);
    assert_eq!(short.side, OrderSide::Sell);
    assert!(orders.iter().all(|order| order.position_id.is_some()));
    drop(orders);

    // Leg 1 dispatch happened before leg 2.
    assert_eq!(harness.binance.placed_orders().await.len(), 1);
    assert_eq!(harness.okx.placed_orders().await.len(), 1);
    assert!(harness.stores.events.lock().await.is_empty());
}

#[tokio::test]
async fn test_open_first_leg_failure_places_nothing_else() {
    let harness = harness();
    harness
        .binance
        .script_order(OrderScript::Fail("margin insufficient".into()))
        .await;

    let report = harness.coordinator.open(open_request()).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.legs.len(), 1);

    // The short venue never saw an order.
    assert!(harness.okx.placed_orders().await.is_empty());

    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::OpenFailed);
    drop(positions);

    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "open_first_leg_failed");
    assert_eq!(events[0].severity, RiskSeverity::High);
}

#[tokio::test]
async fn test_open_second_leg_failure_rolls_back() {
    let harness = harness();
    harness
        .okx
        .script_order(OrderScript::Fail("insufficient balance".into()))
        .await;

    let report = harness.coordinator.open(open_request()).await.unwrap();
    assert!(!report.success);
    assert_eq!(report.legs.len(), 3);

    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::OpenFailed);
    let position_id = positions[0].id;
    drop(positions);

    // Three order rows: open-long ok, open-short failed, rollback ok.
    let orders = harness.stores.orders.lock().await;
    assert_eq!(orders.len(), 3);
    let open_long = orders
        .iter()
        .find(|order| order.action == OrderAction::Open && order.exchange == VenueId::Binance)
        .unwrap();
    let open_short = orders
        .iter()
        .find(|order| order.action == OrderAction::Open && order.exchange == VenueId::Okx)
        .unwrap();
    let rollback = orders
        .iter()
        .find(|order| order.action == OrderAction::Rollback)
        .unwrap();
    assert_eq!(open_long.status, OrderStatus::Ok);
    assert_eq!(open_short.status, OrderStatus::Failed);
    assert_eq!(rollback.status, OrderStatus::Ok);
    assert_eq!(rollback.exchange, VenueId::Binance);
    assert_eq!(rollback.side, OrderSide::Sell);
    assert_eq!(rollback.quantity, dec!(0.01));
    // The rollback references the position whose sibling order failed.
    assert_eq!(rollback.position_id, Some(position_id));
    drop(orders);

    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "open_second_leg_failed_rolled_back");
    assert_eq!(events[0].severity, RiskSeverity::High);
}

#[tokio::test]
async fn test_rollback_failure_marks_risk_exposed() {
    let harness = harness();
    harness
        .okx
        .script_order(OrderScript::Fail("insufficient balance".into()))
        .await;
    // The rollback on binance also fails.
    harness.binance.script_order(OrderScript::Ok).await;
    harness
        .binance
        .script_order(OrderScript::Fail("venue rejected rollback".into()))
        .await;

    let report = harness.coordinator.open(open_request()).await.unwrap();
    assert!(!report.success);

    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::RiskExposed);
    drop(positions);

    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "rollback_failed");
    assert_eq!(events[0].severity, RiskSeverity::Critical);
    // Full context travels with the critical event.
    assert!(events[0].context["legs"].is_array());
}

#[tokio::test]
async fn test_open_without_credentials_is_auth_error() {
    let harness = harness_with_credentials(&[VenueId::Binance]);

    let err = harness.coordinator.open(open_request()).await.unwrap_err();
    assert_eq!(err.kind(), "auth");

    // Nothing was placed or persisted.
    assert!(harness.binance.placed_orders().await.is_empty());
    assert!(harness.okx.placed_orders().await.is_empty());
    assert!(harness.stores.positions.lock().await.is_empty());
}

#[tokio::test]
async fn test_set_leverage_non_transient_aborts_before_orders() {
    let harness = harness();
    harness
        .binance
        .script_leverage(LeverageScript::FailAuth("leverage rejected".into()))
        .await;

    let err = harness.coordinator.open(open_request()).await.unwrap_err();
    assert_eq!(err.kind(), "auth");
    assert!(harness.binance.placed_orders().await.is_empty());
    assert!(harness.okx.placed_orders().await.is_empty());
    assert!(harness.stores.positions.lock().await.is_empty());
}

#[tokio::test]
async fn test_set_leverage_transient_retries_and_proceeds() {
    let harness = harness();
    harness
        .binance
        .script_leverage(LeverageScript::FailTransient("502 bad gateway".into()))
        .await;
    harness.binance.script_leverage(LeverageScript::Ok).await;

    let report = harness.coordinator.open(open_request()).await.unwrap();
    assert!(report.success);
    // Both venues saw a leverage call, binance twice.
    assert_eq!(harness.binance.leverage_calls.lock().await.len(), 2);
    assert_eq!(harness.okx.leverage_calls.lock().await.len(), 1);
}

#[tokio::test]
async fn test_order_timeout_is_pending_with_warning() {
    let harness = harness();
    harness.okx.script_order(OrderScript::Timeout).await;

    let report = harness.coordinator.open(open_request()).await.unwrap();
    assert!(!report.success);

    let orders = harness.stores.orders.lock().await;
    let short = orders
        .iter()
        .find(|order| order.exchange == VenueId::Okx)
        .unwrap();
    assert_eq!(short.status, OrderStatus::Pending);
    drop(orders);

    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::RiskExposed);
    drop(positions);

    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, RiskSeverity::Warning);
    assert!(events[0].message.contains("reconciliation"));
}

#[tokio::test]
async fn test_close_success_transitions_to_closed() {
    let harness = harness();
    let open_report = harness.coordinator.open(open_request()).await.unwrap();
    let position_id = open_report.position_id.unwrap();

    let report = harness
        .coordinator
        .close(CloseRequest {
            position_id: Some(position_id),
            symbol: None,
            long_exchange: None,
            short_exchange: None,
            long_quantity: None,
            short_quantity: None,
            leverage: None,
            credentials: Default::default(),
            note: None,
        })
        .await
        .unwrap();

    assert!(report.success);
    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::Closed);
    assert!(positions[0].closed_at.is_some());
    drop(positions);

    // Close legs run opposite to the open legs.
    let binance_orders = harness.binance.placed_orders().await;
    assert_eq!(binance_orders.len(), 2);
    assert_eq!(binance_orders[1].side, OrderSide::Sell);
    assert!(binance_orders[1].reduce_only);
    let okx_orders = harness.okx.placed_orders().await;
    assert_eq!(okx_orders[1].side, OrderSide::Buy);
    assert!(okx_orders[1].reduce_only);
}

#[tokio::test]
async fn test_close_second_leg_failure_escalates_without_rollback() {
    let harness = harness();
    let open_report = harness.coordinator.open(open_request()).await.unwrap();
    let position_id = open_report.position_id.unwrap();

    // Close: long leg ok, short leg rejected.
    harness.okx.script_order(OrderScript::Fail("rejected".into())).await;

    let report = harness
        .coordinator
        .close(CloseRequest {
            position_id: Some(position_id),
            symbol: None,
            long_exchange: None,
            short_exchange: None,
            long_quantity: None,
            short_quantity: None,
            leverage: None,
            credentials: Default::default(),
            note: None,
        })
        .await
        .unwrap();

    assert!(!report.success);
    let positions = harness.stores.positions.lock().await;
    assert_eq!(positions[0].status, PositionStatus::RiskExposed);
    drop(positions);

    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "close_second_leg_failed");
    assert_eq!(events[0].severity, RiskSeverity::Critical);

    // No rollback order on partial close.
    let orders = harness.stores.orders.lock().await;
    assert!(orders
        .iter()
        .all(|order| order.action != OrderAction::Rollback));
}

#[tokio::test]
async fn test_close_unknown_position_is_validation_error() {
    let harness = harness();
    let err = harness
        .coordinator
        .close(CloseRequest {
            position_id: Some(uuid::Uuid::new_v4()),
            symbol: None,
            long_exchange: None,
            short_exchange: None,
            long_quantity: None,
            short_quantity: None,
            leverage: None,
            credentials: Default::default(),
            note: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn test_hedge_always_records_warning_event() {
    let harness = harness();
    let report = harness
        .coordinator
        .hedge(HedgeRequest {
            symbol: "BTCUSDT".into(),
            exchange: VenueId::Binance,
            side: OrderSide::Sell,
            quantity: dec!(0.02),
            leverage: None,
            reason: Some("manual de-risk".into()),
            credentials: Default::default(),
        })
        .await
        .unwrap();

    assert!(report.success);
    let events = harness.stores.events.lock().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "hedge_executed");
    assert_eq!(events[0].severity, RiskSeverity::Warning);
    assert!(events[0].message.contains("manual de-risk"));
}

#[tokio::test]
async fn test_emergency_close_aggregates_and_never_short_circuits() {
    let harness = harness();
    let first = harness.coordinator.open(open_request()).await.unwrap();
    let second = harness
        .coordinator
        .open(OpenRequest {
            symbol: "ETHUSDT".into(),
            ..open_request()
        })
        .await
        .unwrap();
    assert!(first.success && second.success);

    // First position's long-leg close fails; the second closes cleanly.
    harness
        .binance
        .script_order(OrderScript::Fail("close rejected".into()))
        .await;

    let report = harness
        .coordinator
        .emergency_close(EmergencyCloseRequest {
            position_ids: None,
            credentials: Default::default(),
        })
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.message.contains("2 positions"));
    assert!(report.message.contains("1 failed"));

    let positions = harness.stores.positions.lock().await;
    let closed = positions
        .iter()
        .filter(|position| position.status == PositionStatus::Closed)
        .count();
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn test_convert_notional_uses_binance_oracle() {
    let harness = harness();
    harness
        .binance
        .script_funding(common::FundingScript::Ok(vec![common::snapshot(
            VenueId::Binance,
            "BTCUSDT",
            0.0001,
            8.0,
        )]))
        .await;
    harness
        .okx
        .script_funding(common::FundingScript::Ok(vec![common::snapshot(
            VenueId::Okx,
            "BTCUSDT",
            0.0002,
            8.0,
        )]))
        .await;

    let report = harness
        .coordinator
        .convert_notional(ConvertRequest {
            symbol: "BTCUSDT".into(),
            notional_usd: 5_000.0,
        })
        .await
        .unwrap();

    assert_eq!(report.exchange, VenueId::Binance);
    assert_eq!(report.mark_price, 50_000.0);
    assert_eq!(report.quantity, dec!(0.1));
}

#[tokio::test]
async fn test_preview_is_pure() {
    let harness = harness();
    harness
        .binance
        .script_funding(common::FundingScript::Ok(vec![common::snapshot(
            VenueId::Binance,
            "BTCUSDT",
            -0.0001,
            8.0,
        )]))
        .await;
    harness
        .okx
        .script_funding(common::FundingScript::Ok(vec![common::snapshot(
            VenueId::Okx,
            "BTCUSDT",
            0.0002,
            8.0,
        )]))
        .await;

    let report = harness
        .coordinator
        .preview(PreviewRequest {
            symbol: "BTCUSDT".into(),
            long_exchange: VenueId::Binance,
            short_exchange: VenueId::Okx,
            notional_usd: 10_000.0,
            hold_hours: 8.0,
            taker_fee_bps: 6.0,
        })
        .await
        .unwrap();

    let spread = report.spread_rate_1y_nominal.unwrap();
    assert!((spread - 0.0003 * 3.0 * 365.0).abs() < 1e-9);
    let expected = report.expected_funding_pnl_usd.unwrap();
    assert!((expected - 10_000.0 * spread * (8.0 / (24.0 * 365.0))).abs() < 1e-9);
    assert!((report.estimated_fee_usd - 10_000.0 * 2.0 * 0.0006).abs() < 1e-9);
    assert_eq!(report.max_usable_leverage, Some(20.0));

    // Pure: no orders, no positions, no events.
    assert!(harness.binance.placed_orders().await.is_empty());
    assert!(harness.stores.positions.lock().await.is_empty());
    assert!(harness.stores.events.lock().await.is_empty());
}
