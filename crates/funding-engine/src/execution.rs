//! Two-leg execution coordinator.
//!
//! Owns the paired-position state machine: open places the long leg
//! first and the short leg second, rolling the first leg back when the
//! second fails; close places reduce-only orders on both legs and
//! escalates a half-closed pair instead of rolling back; hedge is a
//! single-sided emergency order. Every failure past the first placed
//! order writes a risk event before the caller sees the response, and
//! order rows are persisted transactionally with their position change.
//!
//! Quantities cross this boundary in base-asset units; the adapters own
//! the contract-unit conversion on both directions.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use venue_adapters::{
    utils, OrderRequest, OrderSide, PositionSide, VenueAdapter, VenueCredential, VenueId,
};

use crate::board;
use crate::provider::{MarketProvider, VenueFailure};
use crate::{
    CredentialSource, EngineConfig, EngineError, EngineResult, NewOrder, NewPosition,
    NewRiskEvent, OrderAction, OrderStatus, OrderStore, PositionStatus, PositionStore,
    RiskLedger, RiskSeverity,
};

/// Inline credential override carried on execution requests. Overrides
/// the vault for its venue.
#[derive(Clone, Serialize, Deserialize)]
pub struct InlineCredential {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl InlineCredential {
    fn to_credential(&self) -> VenueCredential {
        VenueCredential::new(
            self.api_key.clone(),
            self.api_secret.clone(),
            self.passphrase.clone(),
            self.testnet,
        )
    }
}

impl std::fmt::Debug for InlineCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineCredential")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("testnet", &self.testnet)
            .finish()
    }
}

fn default_hold_hours() -> f64 {
    8.0
}

fn default_taker_fee_bps() -> f64 {
    6.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewRequest {
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub notional_usd: f64,
    #[serde(default = "default_hold_hours")]
    pub hold_hours: f64,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewReport {
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub spread_rate_1y_nominal: Option<f64>,
    pub expected_funding_pnl_usd: Option<f64>,
    pub estimated_fee_usd: f64,
    pub per_leg_notional_usd: f64,
    pub max_usable_leverage: Option<f64>,
    pub hold_hours: f64,
    pub snapshot_errors: Vec<VenueFailure>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenRequest {
    pub symbol: String,
    pub long_exchange: VenueId,
    pub short_exchange: VenueId,
    pub quantity: Decimal,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub credentials: HashMap<VenueId, InlineCredential>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub position_id: Option<Uuid>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub long_exchange: Option<VenueId>,
    #[serde(default)]
    pub short_exchange: Option<VenueId>,
    #[serde(default)]
    pub long_quantity: Option<Decimal>,
    #[serde(default)]
    pub short_quantity: Option<Decimal>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub credentials: HashMap<VenueId, InlineCredential>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgeRequest {
    pub symbol: String,
    pub exchange: VenueId,
    pub side: OrderSide,
    pub quantity: Decimal,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub credentials: HashMap<VenueId, InlineCredential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyCloseRequest {
    #[serde(default)]
    pub position_ids: Option<Vec<Uuid>>,
    #[serde(default)]
    pub credentials: HashMap<VenueId, InlineCredential>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertRequest {
    pub symbol: String,
    pub notional_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertReport {
    pub symbol: String,
    pub exchange: VenueId,
    pub notional_usd: f64,
    pub mark_price: f64,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Per-leg execution result, base-asset units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegReport {
    pub exchange: VenueId,
    pub symbol: String,
    pub side: OrderSide,
    pub action: OrderAction,
    pub quantity: Decimal,
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub action: String,
    pub position_id: Option<Uuid>,
    pub legs: Vec<LegReport>,
    pub risk_event_id: Option<Uuid>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

struct LegOutcome {
    report: LegReport,
    order: NewOrder,
}

impl LegOutcome {
    fn ok(&self) -> bool {
        self.report.status == OrderStatus::Ok
    }

    fn pending(&self) -> bool {
        self.report.status == OrderStatus::Pending
    }
}

pub struct ExecutionCoordinator {
    adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>>,
    provider: Arc<MarketProvider>,
    positions: Arc<dyn PositionStore>,
    orders: Arc<dyn OrderStore>,
    risk: Arc<dyn RiskLedger>,
    credentials: Arc<dyn CredentialSource>,
    config: EngineConfig,
}

impl ExecutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>>,
        provider: Arc<MarketProvider>,
        positions: Arc<dyn PositionStore>,
        orders: Arc<dyn OrderStore>,
        risk: Arc<dyn RiskLedger>,
        credentials: Arc<dyn CredentialSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            adapters,
            provider,
            positions,
            orders,
            risk,
            credentials,
            config,
        }
    }

    /// Pure projection of a candidate pair: no side effects.
    pub async fn preview(&self, request: PreviewRequest) -> EngineResult<PreviewReport> {
        let symbol = normalize_symbol(&request.symbol)?;
        if request.notional_usd <= 0.0 {
            return Err(EngineError::validation("notional_usd must be positive"));
        }
        if request.long_exchange == request.short_exchange {
            return Err(EngineError::validation(
                "long and short legs must be on different venues",
            ));
        }

        let result = self.provider.fetch_all(false).await;
        let snapshots = result.flattened();
        let spread = board::pair_spread(
            &snapshots,
            &symbol,
            request.long_exchange,
            request.short_exchange,
        );

        let expected_funding_pnl_usd = spread.map(|spread| {
            request.notional_usd * spread * (request.hold_hours / (24.0 * 365.0))
        });
        let estimated_fee_usd = request.notional_usd * 2.0 * (request.taker_fee_bps / 10_000.0);

        let leg_leverage = |venue: VenueId| {
            snapshots
                .iter()
                .find(|s| s.exchange == venue && s.symbol == symbol)
                .and_then(|s| s.max_leverage)
        };
        let max_usable_leverage = match (
            leg_leverage(request.long_exchange),
            leg_leverage(request.short_exchange),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            _ => None,
        };

        Ok(PreviewReport {
            symbol,
            long_exchange: request.long_exchange,
            short_exchange: request.short_exchange,
            spread_rate_1y_nominal: spread,
            expected_funding_pnl_usd,
            estimated_fee_usd,
            per_leg_notional_usd: request.notional_usd,
            max_usable_leverage,
            hold_hours: request.hold_hours,
            snapshot_errors: result.meta.venues_failed,
        })
    }

    /// Open a paired position: long leg first, short leg second, with a
    /// rollback of the long leg when the short leg fails.
    pub async fn open(&self, request: OpenRequest) -> EngineResult<ExecutionReport> {
        let symbol = normalize_symbol(&request.symbol)?;
        if request.long_exchange == request.short_exchange {
            return Err(EngineError::validation(
                "long and short legs must be on different venues",
            ));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(EngineError::validation("quantity must be positive"));
        }

        let long_venue = request.long_exchange;
        let short_venue = request.short_exchange;
        let long_credential = self.resolve_credential(long_venue, &request.credentials).await?;
        let short_credential = self
            .resolve_credential(short_venue, &request.credentials)
            .await?;

        // Contract sizes are resolved up front so an unsupported symbol
        // aborts before anything is placed.
        let long_contract_size = self.contract_size(long_venue, &symbol).await?;
        let short_contract_size = self.contract_size(short_venue, &symbol).await?;

        // Leverage is a precondition, not a best-effort side effect.
        if let Some(leverage) = request.leverage {
            self.require_leverage(long_venue, &long_credential, &symbol, leverage)
                .await?;
            self.require_leverage(short_venue, &short_credential, &symbol, leverage)
                .await?;
        }

        let entry_spread_rate = {
            let snapshots = self.provider.fetch_all(false).await.flattened();
            board::pair_spread(&snapshots, &symbol, long_venue, short_venue)
        };
        let mut contract_sizes = serde_json::Map::new();
        contract_sizes.insert(
            long_venue.as_str().to_string(),
            serde_json::json!(long_contract_size),
        );
        contract_sizes.insert(
            short_venue.as_str().to_string(),
            serde_json::json!(short_contract_size),
        );
        let extra = serde_json::json!({
            "note": request.note,
            "leverage": request.leverage,
            "contract_sizes": contract_sizes,
        });
        let new_position = |status: PositionStatus| NewPosition {
            symbol: symbol.clone(),
            long_exchange: long_venue,
            short_exchange: short_venue,
            long_qty: request.quantity,
            short_qty: request.quantity,
            status,
            entry_spread_rate,
            extra: extra.clone(),
        };

        // Leg 1: buy on the long venue. Its completion happens-before
        // the short leg dispatch.
        let long_leg = self
            .execute_leg(
                OrderAction::Open,
                long_venue,
                &symbol,
                OrderSide::Buy,
                request.quantity,
                false,
                Some(PositionSide::Long),
                &long_credential,
                request.note.clone(),
            )
            .await;

        if !long_leg.ok() {
            let position = self
                .positions
                .create_with_orders(new_position(PositionStatus::OpenFailed), vec![long_leg.order.clone()])
                .await?;
            let (event_type, severity) = if long_leg.pending() {
                ("open_first_leg_timeout", RiskSeverity::Warning)
            } else {
                ("open_first_leg_failed", RiskSeverity::High)
            };
            let risk_event_id = self
                .append_risk(
                    event_type,
                    severity,
                    format!(
                        "first leg of {symbol} open on {long_venue} did not complete: {}",
                        long_leg.report.message.as_deref().unwrap_or("unknown")
                    ),
                    serde_json::json!({
                        "position_id": position.id,
                        "leg": &long_leg.report,
                    }),
                )
                .await?;
            return Ok(ExecutionReport {
                success: false,
                action: "open".into(),
                position_id: Some(position.id),
                legs: vec![long_leg.report],
                risk_event_id: Some(risk_event_id),
                message: "open failed: first leg order did not complete".into(),
                timestamp: Utc::now(),
            });
        }

        // Leg 2: sell on the short venue.
        let short_leg = self
            .execute_leg(
                OrderAction::Open,
                short_venue,
                &symbol,
                OrderSide::Sell,
                request.quantity,
                false,
                Some(PositionSide::Short),
                &short_credential,
                request.note.clone(),
            )
            .await;

        if short_leg.ok() {
            let position = self
                .positions
                .create_with_orders(
                    new_position(PositionStatus::Open),
                    vec![long_leg.order, short_leg.order],
                )
                .await?;
            info!(symbol = %symbol, position_id = %position.id, "paired position opened");
            return Ok(ExecutionReport {
                success: true,
                action: "open".into(),
                position_id: Some(position.id),
                legs: vec![long_leg.report, short_leg.report],
                risk_event_id: None,
                message: "paired position opened".into(),
                timestamp: Utc::now(),
            });
        }

        if short_leg.pending() {
            // A timed-out order cannot be abandoned: exposure is unknown
            // until the operator reconciles it.
            let position = self
                .positions
                .create_with_orders(
                    new_position(PositionStatus::RiskExposed),
                    vec![long_leg.order, short_leg.order.clone()],
                )
                .await?;
            let risk_event_id = self
                .append_risk(
                    "open_second_leg_timeout",
                    RiskSeverity::Warning,
                    format!(
                        "short leg of {symbol} open on {short_venue} timed out; order left pending, reconciliation required"
                    ),
                    serde_json::json!({
                        "position_id": position.id,
                        "legs": [&long_leg.report, &short_leg.report],
                    }),
                )
                .await?;
            return Ok(ExecutionReport {
                success: false,
                action: "open".into(),
                position_id: Some(position.id),
                legs: vec![long_leg.report, short_leg.report],
                risk_event_id: Some(risk_event_id),
                message: "open incomplete: second leg timed out and is pending reconciliation"
                    .into(),
                timestamp: Utc::now(),
            });
        }

        // Second leg rejected outright: roll the first leg back at market.
        warn!(symbol = %symbol, "second open leg failed, rolling back the long leg");
        let rollback_leg = self
            .execute_leg(
                OrderAction::Rollback,
                long_venue,
                &symbol,
                OrderSide::Sell,
                request.quantity,
                true,
                Some(PositionSide::Long),
                &long_credential,
                Some("rollback of first open leg".into()),
            )
            .await;

        if rollback_leg.ok() {
            let position = self
                .positions
                .create_with_orders(
                    new_position(PositionStatus::OpenFailed),
                    vec![long_leg.order, short_leg.order, rollback_leg.order],
                )
                .await?;
            let risk_event_id = self
                .append_risk(
                    "open_second_leg_failed_rolled_back",
                    RiskSeverity::High,
                    format!(
                        "short leg of {symbol} open on {short_venue} failed; long leg rolled back: {}",
                        short_leg.report.message.as_deref().unwrap_or("unknown")
                    ),
                    serde_json::json!({
                        "position_id": position.id,
                        "legs": [&long_leg.report, &short_leg.report, &rollback_leg.report],
                    }),
                )
                .await?;
            return Ok(ExecutionReport {
                success: false,
                action: "open".into(),
                position_id: Some(position.id),
                legs: vec![long_leg.report, short_leg.report, rollback_leg.report],
                risk_event_id: Some(risk_event_id),
                message: "open failed: second leg rejected, first leg rolled back".into(),
                timestamp: Utc::now(),
            });
        }

        error!(symbol = %symbol, "rollback failed, position is one-sided");
        let position = self
            .positions
            .create_with_orders(
                new_position(PositionStatus::RiskExposed),
                vec![long_leg.order, short_leg.order, rollback_leg.order],
            )
            .await?;
        let risk_event_id = self
            .append_risk(
                "rollback_failed",
                RiskSeverity::Critical,
                format!(
                    "short leg of {symbol} open failed and the rollback on {long_venue} also failed; one-sided exposure of {} {symbol}",
                    request.quantity
                ),
                serde_json::json!({
                    "position_id": position.id,
                    "symbol": symbol,
                    "long_exchange": long_venue,
                    "short_exchange": short_venue,
                    "quantity": request.quantity,
                    "legs": [&long_leg.report, &short_leg.report, &rollback_leg.report],
                }),
            )
            .await?;
        Ok(ExecutionReport {
            success: false,
            action: "open".into(),
            position_id: Some(position.id),
            legs: vec![long_leg.report, short_leg.report, rollback_leg.report],
            risk_event_id: Some(risk_event_id),
            message: "open failed: rollback failed, position is risk-exposed".into(),
            timestamp: Utc::now(),
        })
    }

    /// Close a paired position with reduce-only orders on both legs. A
    /// half-closed pair escalates to a critical risk event; rollback is
    /// not attempted on partial closes.
    pub async fn close(&self, request: CloseRequest) -> EngineResult<ExecutionReport> {
        let plan = self.resolve_close_plan(&request).await?;
        let long_credential = self
            .resolve_credential(plan.long_exchange, &request.credentials)
            .await?;
        let short_credential = self
            .resolve_credential(plan.short_exchange, &request.credentials)
            .await?;

        let long_leg = self
            .execute_leg(
                OrderAction::Close,
                plan.long_exchange,
                &plan.symbol,
                OrderSide::Sell,
                plan.long_qty,
                true,
                Some(PositionSide::Long),
                &long_credential,
                request.note.clone(),
            )
            .await;

        if !long_leg.ok() {
            let (event_type, severity) = if long_leg.pending() {
                ("close_first_leg_timeout", RiskSeverity::Warning)
            } else {
                ("close_first_leg_failed", RiskSeverity::High)
            };
            self.record_close_orders(
                plan.position_id,
                PositionStatus::CloseFailed,
                None,
                vec![long_leg.order.clone()],
            )
            .await?;
            let risk_event_id = self
                .append_risk(
                    event_type,
                    severity,
                    format!(
                        "close of {} long leg on {} did not complete: {}",
                        plan.symbol,
                        plan.long_exchange,
                        long_leg.report.message.as_deref().unwrap_or("unknown")
                    ),
                    serde_json::json!({
                        "position_id": plan.position_id,
                        "leg": &long_leg.report,
                    }),
                )
                .await?;
            return Ok(ExecutionReport {
                success: false,
                action: "close".into(),
                position_id: plan.position_id,
                legs: vec![long_leg.report],
                risk_event_id: Some(risk_event_id),
                message: "close failed: first leg order did not complete".into(),
                timestamp: Utc::now(),
            });
        }

        let short_leg = self
            .execute_leg(
                OrderAction::Close,
                plan.short_exchange,
                &plan.symbol,
                OrderSide::Buy,
                plan.short_qty,
                true,
                Some(PositionSide::Short),
                &short_credential,
                request.note.clone(),
            )
            .await;

        if !short_leg.ok() {
            // One leg is flat and the other is live: escalate.
            self.record_close_orders(
                plan.position_id,
                PositionStatus::RiskExposed,
                None,
                vec![long_leg.order, short_leg.order.clone()],
            )
            .await?;
            let risk_event_id = self
                .append_risk(
                    "close_second_leg_failed",
                    RiskSeverity::Critical,
                    format!(
                        "close of {} short leg on {} did not complete; pair is half-closed",
                        plan.symbol, plan.short_exchange
                    ),
                    serde_json::json!({
                        "position_id": plan.position_id,
                        "legs": [&long_leg.report, &short_leg.report],
                    }),
                )
                .await?;
            return Ok(ExecutionReport {
                success: false,
                action: "close".into(),
                position_id: plan.position_id,
                legs: vec![long_leg.report, short_leg.report],
                risk_event_id: Some(risk_event_id),
                message: "close failed: pair is half-closed and risk-exposed".into(),
                timestamp: Utc::now(),
            });
        }

        self.record_close_orders(
            plan.position_id,
            PositionStatus::Closed,
            Some(Utc::now()),
            vec![long_leg.order, short_leg.order],
        )
        .await?;
        Ok(ExecutionReport {
            success: true,
            action: "close".into(),
            position_id: plan.position_id,
            legs: vec![long_leg.report, short_leg.report],
            risk_event_id: None,
            message: "paired position closed".into(),
            timestamp: Utc::now(),
        })
    }

    /// Single-sided emergency order. Always leaves a warning risk event
    /// carrying the supplied reason.
    pub async fn hedge(&self, request: HedgeRequest) -> EngineResult<ExecutionReport> {
        let symbol = normalize_symbol(&request.symbol)?;
        if request.quantity <= Decimal::ZERO {
            return Err(EngineError::validation("quantity must be positive"));
        }
        let credential = self
            .resolve_credential(request.exchange, &request.credentials)
            .await?;

        let leg = self
            .execute_leg(
                OrderAction::Hedge,
                request.exchange,
                &symbol,
                request.side,
                request.quantity,
                false,
                Some(match request.side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                }),
                &credential,
                request.reason.clone(),
            )
            .await;
        let success = leg.ok();
        self.orders.insert(leg.order.clone()).await?;

        let risk_event_id = self
            .append_risk(
                "hedge_executed",
                RiskSeverity::Warning,
                format!(
                    "manual hedge {} {} {} on {}: {}",
                    leg.report.side.as_str(),
                    leg.report.quantity,
                    symbol,
                    request.exchange,
                    request.reason.as_deref().unwrap_or("no reason supplied"),
                ),
                serde_json::json!({
                    "leg": &leg.report,
                    "reason": request.reason,
                }),
            )
            .await?;

        Ok(ExecutionReport {
            success,
            action: "hedge".into(),
            position_id: None,
            legs: vec![leg.report],
            risk_event_id: Some(risk_event_id),
            message: if success {
                "hedge order placed".into()
            } else {
                "hedge order failed".into()
            },
            timestamp: Utc::now(),
        })
    }

    /// Close every open position (or a supplied subset) best-effort.
    /// Individual failures never short-circuit the sweep.
    pub async fn emergency_close(
        &self,
        request: EmergencyCloseRequest,
    ) -> EngineResult<ExecutionReport> {
        let positions = self
            .positions
            .list_not_closed(request.position_ids.clone())
            .await?;

        let total = positions.len();
        let mut failed = 0usize;
        let mut legs = Vec::new();
        for position in positions {
            let close_request = CloseRequest {
                position_id: Some(position.id),
                symbol: None,
                long_exchange: None,
                short_exchange: None,
                long_quantity: None,
                short_quantity: None,
                leverage: None,
                credentials: request.credentials.clone(),
                note: Some("emergency close".into()),
            };
            match self.close(close_request).await {
                Ok(report) => {
                    if !report.success {
                        failed += 1;
                    }
                    legs.extend(report.legs);
                }
                Err(err) => {
                    warn!(position_id = %position.id, error = %err, "emergency close skipped a position");
                    failed += 1;
                }
            }
        }

        Ok(ExecutionReport {
            success: failed == 0,
            action: "emergency-close".into(),
            position_id: None,
            legs,
            risk_event_id: None,
            message: format!("emergency close processed {total} positions, {failed} failed"),
            timestamp: Utc::now(),
        })
    }

    /// Convert a USD notional to a base-asset quantity using the Binance
    /// mark price as the canonical oracle.
    pub async fn convert_notional(&self, request: ConvertRequest) -> EngineResult<ConvertReport> {
        let symbol = normalize_symbol(&request.symbol)?;
        if request.notional_usd <= 0.0 {
            return Err(EngineError::validation("notional_usd must be positive"));
        }

        let result = self.provider.fetch_all(false).await;
        let snapshot = result
            .snapshots_by_venue
            .get(&VenueId::Binance)
            .into_iter()
            .flatten()
            .find(|snapshot| snapshot.symbol == symbol)
            .cloned();

        let snapshot = snapshot.ok_or_else(|| {
            EngineError::validation(format!(
                "cannot convert notional: no binance snapshot for {symbol}"
            ))
        })?;
        let mark_price = snapshot
            .mark_price
            .filter(|price| *price > 0.0)
            .ok_or_else(|| {
                EngineError::validation(format!(
                    "cannot convert notional: binance mark price missing for {symbol}"
                ))
            })?;

        let quantity = Decimal::from_f64(request.notional_usd / mark_price)
            .filter(|quantity| *quantity > Decimal::ZERO)
            .ok_or_else(|| {
                EngineError::validation(format!("converted quantity invalid for {symbol}"))
            })?;

        Ok(ConvertReport {
            symbol,
            exchange: VenueId::Binance,
            notional_usd: request.notional_usd,
            mark_price,
            quantity,
            timestamp: snapshot.fetched_at,
        })
    }

    async fn resolve_credential(
        &self,
        venue: VenueId,
        inline: &HashMap<VenueId, InlineCredential>,
    ) -> EngineResult<VenueCredential> {
        if let Some(credential) = inline.get(&venue) {
            return Ok(credential.to_credential());
        }
        match self.credentials.plaintext(venue).await? {
            Some(credential) => Ok(credential),
            None => Err(EngineError::auth(format!(
                "no credential configured for {venue}"
            ))),
        }
    }

    fn adapter(&self, venue: VenueId) -> EngineResult<&Arc<dyn VenueAdapter>> {
        self.adapters
            .get(&venue)
            .ok_or_else(|| EngineError::validation(format!("no adapter configured for {venue}")))
    }

    async fn contract_size(&self, venue: VenueId, symbol: &str) -> EngineResult<Decimal> {
        let adapter = self.adapter(venue)?;
        adapter
            .contract_size(symbol)
            .await
            .map_err(EngineError::from)
    }

    /// Set leverage on one venue ahead of order placement. Transient
    /// failures are retried once and then tolerated; anything else
    /// aborts the surrounding flow.
    async fn require_leverage(
        &self,
        venue: VenueId,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> EngineResult<()> {
        let adapter = self.adapter(venue)?;
        match adapter.set_leverage(credential, symbol, leverage).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_transient() => {
                warn!(%venue, error = %err, "set_leverage transient failure, retrying once");
                match adapter.set_leverage(credential, symbol, leverage).await {
                    Ok(()) => Ok(()),
                    Err(retry_err) if retry_err.is_transient() => {
                        warn!(%venue, error = %retry_err, "set_leverage still transient, proceeding");
                        Ok(())
                    }
                    Err(retry_err) => Err(retry_err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_leg(
        &self,
        action: OrderAction,
        venue: VenueId,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
        position_side: Option<PositionSide>,
        credential: &VenueCredential,
        note: Option<String>,
    ) -> LegOutcome {
        let request = OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            reduce_only,
            position_side,
        };

        let adapter = match self.adapters.get(&venue) {
            Some(adapter) => adapter,
            None => {
                return self.leg_outcome(
                    action,
                    venue,
                    &request,
                    OrderStatus::Failed,
                    None,
                    Some(format!("no adapter configured for {venue}")),
                    note,
                    reduce_only,
                )
            }
        };

        let placed = tokio::time::timeout(
            self.config.order_call_timeout,
            adapter.place_order(credential, &request),
        )
        .await;

        match placed {
            Err(_) => self.leg_outcome(
                action,
                venue,
                &request,
                OrderStatus::Pending,
                None,
                Some("order call timed out; order may still execute, reconcile manually".into()),
                note,
                reduce_only,
            ),
            Ok(Err(err)) if err.timed_out() => self.leg_outcome(
                action,
                venue,
                &request,
                OrderStatus::Pending,
                None,
                Some(format!("order call timed out at the venue: {err}")),
                note,
                reduce_only,
            ),
            Ok(Err(err)) => self.leg_outcome(
                action,
                venue,
                &request,
                OrderStatus::Failed,
                None,
                Some(err.to_string()),
                note,
                reduce_only,
            ),
            Ok(Ok(ack)) => {
                let note = match (&note, &ack.note) {
                    (Some(request_note), Some(ack_note)) => {
                        Some(format!("{request_note}; {ack_note}"))
                    }
                    (None, Some(ack_note)) => Some(ack_note.clone()),
                    (Some(request_note), None) => Some(request_note.clone()),
                    (None, None) => None,
                };
                self.leg_outcome(
                    action,
                    venue,
                    &request,
                    OrderStatus::Ok,
                    Some(ack),
                    None,
                    note,
                    reduce_only,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn leg_outcome(
        &self,
        action: OrderAction,
        venue: VenueId,
        request: &OrderRequest,
        status: OrderStatus,
        ack: Option<venue_adapters::OrderAck>,
        message: Option<String>,
        note: Option<String>,
        reduce_only: bool,
    ) -> LegOutcome {
        let (exchange_order_id, filled_qty, avg_price, raw) = match ack {
            Some(ack) => (
                ack.exchange_order_id,
                ack.filled_qty.or(Some(request.quantity)),
                ack.avg_price,
                ack.raw,
            ),
            None => (None, None, None, serde_json::Value::Null),
        };

        let report = LegReport {
            exchange: venue,
            symbol: request.symbol.clone(),
            side: request.side,
            action,
            quantity: request.quantity,
            status,
            exchange_order_id: exchange_order_id.clone(),
            filled_qty,
            avg_price,
            message: message.clone(),
        };
        let order = NewOrder {
            position_id: None,
            action,
            status,
            exchange: venue,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_qty,
            avg_price,
            exchange_order_id,
            note: note.or(message),
            extra: serde_json::json!({
                "reduce_only": reduce_only,
                "position_side": request.position_side,
                "raw": raw,
            }),
        };
        LegOutcome { report, order }
    }

    async fn append_risk(
        &self,
        event_type: &str,
        severity: RiskSeverity,
        message: String,
        context: serde_json::Value,
    ) -> EngineResult<Uuid> {
        let record = self
            .risk
            .append(NewRiskEvent {
                event_type: event_type.to_string(),
                severity,
                message,
                context,
            })
            .await?;
        Ok(record.id)
    }

    async fn record_close_orders(
        &self,
        position_id: Option<Uuid>,
        status: PositionStatus,
        closed_at: Option<DateTime<Utc>>,
        orders: Vec<NewOrder>,
    ) -> EngineResult<()> {
        match position_id {
            Some(id) => {
                self.positions
                    .update_status_with_orders(id, status, closed_at, orders)
                    .await
            }
            None => {
                for order in orders {
                    self.orders.insert(order).await?;
                }
                Ok(())
            }
        }
    }

    async fn resolve_close_plan(&self, request: &CloseRequest) -> EngineResult<ClosePlan> {
        if let Some(position_id) = request.position_id {
            let position = self
                .positions
                .get(position_id)
                .await?
                .ok_or_else(|| {
                    EngineError::validation(format!("position not found: {position_id}"))
                })?;
            if position.status == PositionStatus::Closed {
                return Err(EngineError::validation(format!(
                    "position already closed: {position_id}"
                )));
            }
            return Ok(ClosePlan {
                position_id: Some(position.id),
                symbol: position.symbol,
                long_exchange: position.long_exchange,
                short_exchange: position.short_exchange,
                long_qty: position.long_qty,
                short_qty: position.short_qty,
            });
        }

        let symbol = request
            .symbol
            .as_deref()
            .ok_or_else(|| missing_close_fields())
            .and_then(normalize_symbol)?;
        let (long_exchange, short_exchange) =
            match (request.long_exchange, request.short_exchange) {
                (Some(long), Some(short)) => (long, short),
                _ => return Err(missing_close_fields()),
            };
        let (long_qty, short_qty) = match (request.long_quantity, request.short_quantity) {
            (Some(long), Some(short)) if long > Decimal::ZERO && short > Decimal::ZERO => {
                (long, short)
            }
            _ => return Err(missing_close_fields()),
        };

        Ok(ClosePlan {
            position_id: None,
            symbol,
            long_exchange,
            short_exchange,
            long_qty,
            short_qty,
        })
    }
}

struct ClosePlan {
    position_id: Option<Uuid>,
    symbol: String,
    long_exchange: VenueId,
    short_exchange: VenueId,
    long_qty: Decimal,
    short_qty: Decimal,
}

fn missing_close_fields() -> EngineError {
    EngineError::validation(
        "close without position_id requires symbol, both exchanges and both quantities",
    )
}

fn normalize_symbol(raw: &str) -> EngineResult<String> {
    utils::normalize_usdt_symbol(raw)
        .ok_or_else(|| EngineError::validation(format!("not a USDT perpetual symbol: {raw}")))
}
