//! Shared test doubles: scripted venue adapters, in-memory stores and a
//! fixed credential source.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use funding_engine::{
    EngineError, EngineResult, NewOrder, NewPosition, NewRiskEvent, OrderFilter, OrderRecord,
    OrderStore, PositionFilter, PositionRecord, PositionStatus, PositionStore, RiskEventFilter,
    RiskEventRecord, RiskLedger,
};
use venue_adapters::{
    FundingBatch, FundingSnapshot, OrderAck, OrderRequest, SnapshotFields, SourceTag,
    VenueAdapter, VenueCredential, VenueError, VenueId, VenueResult,
};

pub fn snapshot(venue: VenueId, symbol: &str, rate_raw: f64, interval: f64) -> FundingSnapshot {
    FundingSnapshot::build(
        venue,
        symbol,
        SnapshotFields {
            funding_rate_raw: Some(rate_raw),
            funding_interval_hours: Some(interval),
            next_funding_time: Some(Utc::now() + chrono::Duration::hours(4)),
            mark_price: Some(50_000.0),
            max_leverage: Some(20.0),
            ..Default::default()
        },
        SourceTag::Ccxt,
    )
    .unwrap()
}

/// One scripted funding fetch outcome.
pub enum FundingScript {
    Ok(Vec<FundingSnapshot>),
    Empty,
    Fail(String),
    Hang(Duration),
}

/// One scripted order outcome.
pub enum OrderScript {
    Ok,
    OkWithNote(String),
    Fail(String),
    FailAuth(String),
    Timeout,
}

/// One scripted set-leverage outcome.
pub enum LeverageScript {
    Ok,
    FailTransient(String),
    FailAuth(String),
}

pub struct StubAdapter {
    venue: VenueId,
    funding: Mutex<VecDeque<FundingScript>>,
    orders: Mutex<VecDeque<OrderScript>>,
    leverage: Mutex<VecDeque<LeverageScript>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    pub leverage_calls: Mutex<Vec<(String, f64)>>,
    pub funding_calls: AtomicUsize,
    contract_size: Decimal,
    mark_price: Option<f64>,
}

impl StubAdapter {
    pub fn new(venue: VenueId) -> Arc<Self> {
        Arc::new(Self {
            venue,
            funding: Mutex::new(VecDeque::new()),
            orders: Mutex::new(VecDeque::new()),
            leverage: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            leverage_calls: Mutex::new(Vec::new()),
            funding_calls: AtomicUsize::new(0),
            contract_size: Decimal::ONE,
            mark_price: Some(50_000.0),
        })
    }

    pub async fn script_funding(&self, script: FundingScript) {
        self.funding.lock().await.push_back(script);
    }

    pub async fn script_order(&self, script: OrderScript) {
        self.orders.lock().await.push_back(script);
    }

    pub async fn script_leverage(&self, script: LeverageScript) {
        self.leverage.lock().await.push_back(script);
    }

    pub async fn placed_orders(&self) -> Vec<OrderRequest> {
        self.placed.lock().await.clone()
    }
}

#[async_trait]
impl VenueAdapter for StubAdapter {
    fn venue(&self) -> VenueId {
        self.venue
    }

    async fn fetch_funding(&self) -> VenueResult<FundingBatch> {
        self.funding_calls.fetch_add(1, Ordering::SeqCst);
        match self.funding.lock().await.pop_front() {
            None | Some(FundingScript::Empty) => Ok(FundingBatch {
                source: SourceTag::Ccxt,
                snapshots: Vec::new(),
            }),
            Some(FundingScript::Ok(snapshots)) => Ok(FundingBatch {
                source: SourceTag::Ccxt,
                snapshots,
            }),
            Some(FundingScript::Fail(message)) => Err(VenueError::transient(message)),
            Some(FundingScript::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Err(VenueError::timeout("stub hang elapsed"))
            }
        }
    }

    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64> {
        self.mark_price
            .ok_or_else(|| VenueError::not_supported(format!("no mark price for {symbol}")))
    }

    async fn fetch_max_leverage(&self, _symbol: &str) -> VenueResult<Option<f64>> {
        Ok(Some(20.0))
    }

    async fn contract_size(&self, _symbol: &str) -> VenueResult<Decimal> {
        Ok(self.contract_size)
    }

    async fn place_order(
        &self,
        _credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck> {
        self.placed.lock().await.push(request.clone());
        match self.orders.lock().await.pop_front() {
            None | Some(OrderScript::Ok) => Ok(OrderAck {
                exchange_order_id: Some(format!("{}-order", self.venue)),
                filled_qty: Some(request.quantity),
                avg_price: Some(50_000.0),
                note: None,
                raw: serde_json::json!({}),
            }),
            Some(OrderScript::OkWithNote(note)) => Ok(OrderAck {
                exchange_order_id: Some(format!("{}-order", self.venue)),
                filled_qty: Some(request.quantity),
                avg_price: Some(50_000.0),
                note: Some(note),
                raw: serde_json::json!({}),
            }),
            Some(OrderScript::Fail(message)) => Err(VenueError::transient(message)),
            Some(OrderScript::FailAuth(message)) => Err(VenueError::auth(message)),
            Some(OrderScript::Timeout) => Err(VenueError::timeout("venue order timed out")),
        }
    }

    async fn cancel_order(
        &self,
        _credential: &VenueCredential,
        _symbol: &str,
        _order_id: &str,
    ) -> VenueResult<()> {
        Ok(())
    }

    async fn set_leverage(
        &self,
        _credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()> {
        self.leverage_calls
            .lock()
            .await
            .push((symbol.to_string(), leverage));
        match self.leverage.lock().await.pop_front() {
            None | Some(LeverageScript::Ok) => Ok(()),
            Some(LeverageScript::FailTransient(message)) => Err(VenueError::transient(message)),
            Some(LeverageScript::FailAuth(message)) => Err(VenueError::auth(message)),
        }
    }
}

/// In-memory implementation of every storage port.
#[derive(Default)]
pub struct MemoryStores {
    pub positions: Mutex<Vec<PositionRecord>>,
    pub orders: Mutex<Vec<OrderRecord>>,
    pub events: Mutex<Vec<RiskEventRecord>>,
}

impl MemoryStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn order_record(order: NewOrder, position_id: Option<Uuid>) -> OrderRecord {
        let now = Utc::now();
        OrderRecord {
            id: Uuid::new_v4(),
            position_id,
            action: order.action,
            status: order.status,
            exchange: order.exchange,
            symbol: order.symbol,
            side: order.side,
            quantity: order.quantity,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
            exchange_order_id: order.exchange_order_id,
            note: order.note,
            extra: order.extra,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl PositionStore for MemoryStores {
    async fn create_with_orders(
        &self,
        position: NewPosition,
        orders: Vec<NewOrder>,
    ) -> EngineResult<PositionRecord> {
        let now = Utc::now();
        let record = PositionRecord {
            id: Uuid::new_v4(),
            symbol: position.symbol,
            long_exchange: position.long_exchange,
            short_exchange: position.short_exchange,
            long_qty: position.long_qty,
            short_qty: position.short_qty,
            status: position.status,
            entry_spread_rate: position.entry_spread_rate,
            opened_at: now,
            closed_at: None,
            extra: position.extra,
            created_at: now,
            updated_at: now,
        };
        self.positions.lock().await.push(record.clone());
        let mut stored = self.orders.lock().await;
        for order in orders {
            stored.push(Self::order_record(order, Some(record.id)));
        }
        Ok(record)
    }

    async fn update_status_with_orders(
        &self,
        id: Uuid,
        status: PositionStatus,
        closed_at: Option<chrono::DateTime<Utc>>,
        orders: Vec<NewOrder>,
    ) -> EngineResult<()> {
        let mut positions = self.positions.lock().await;
        let position = positions
            .iter_mut()
            .find(|position| position.id == id)
            .ok_or_else(|| EngineError::internal(format!("position not found: {id}")))?;
        position.status = status;
        position.closed_at = closed_at;
        position.updated_at = Utc::now();
        drop(positions);

        let mut stored = self.orders.lock().await;
        for order in orders {
            stored.push(Self::order_record(order, Some(id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<PositionRecord>> {
        Ok(self
            .positions
            .lock()
            .await
            .iter()
            .find(|position| position.id == id)
            .cloned())
    }

    async fn list(&self, filter: PositionFilter) -> EngineResult<Vec<PositionRecord>> {
        let positions = self.positions.lock().await;
        let mut rows: Vec<PositionRecord> = positions
            .iter()
            .filter(|position| {
                filter
                    .status
                    .map_or(true, |status| position.status == status)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn list_not_closed(
        &self,
        ids: Option<Vec<Uuid>>,
    ) -> EngineResult<Vec<PositionRecord>> {
        let positions = self.positions.lock().await;
        Ok(positions
            .iter()
            .filter(|position| position.status != PositionStatus::Closed)
            .filter(|position| {
                ids.as_ref()
                    .map_or(true, |ids| ids.contains(&position.id))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OrderStore for MemoryStores {
    async fn insert(&self, order: NewOrder) -> EngineResult<OrderRecord> {
        let record = Self::order_record(order, None);
        self.orders.lock().await.push(record.clone());
        Ok(record)
    }

    async fn list(&self, filter: OrderFilter) -> EngineResult<Vec<OrderRecord>> {
        let orders = self.orders.lock().await;
        let mut rows: Vec<OrderRecord> = orders
            .iter()
            .filter(|order| filter.action.map_or(true, |action| order.action == action))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }
}

#[async_trait]
impl RiskLedger for MemoryStores {
    async fn append(&self, event: NewRiskEvent) -> EngineResult<RiskEventRecord> {
        let now = Utc::now();
        let record = RiskEventRecord {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            severity: event.severity,
            message: event.message,
            context: event.context,
            resolved: false,
            created_at: now,
            updated_at: now,
        };
        self.events.lock().await.push(record.clone());
        Ok(record)
    }

    async fn list(&self, filter: RiskEventFilter) -> EngineResult<Vec<RiskEventRecord>> {
        let events = self.events.lock().await;
        let mut rows: Vec<RiskEventRecord> = events
            .iter()
            .filter(|event| {
                filter
                    .severity
                    .map_or(true, |severity| event.severity == severity)
                    && filter
                        .resolved
                        .map_or(true, |resolved| event.resolved == resolved)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            rows.truncate(limit as usize);
        }
        Ok(rows)
    }

    async fn resolve(&self, id: Uuid) -> EngineResult<RiskEventRecord> {
        let mut events = self.events.lock().await;
        let event = events
            .iter_mut()
            .find(|event| event.id == id)
            .ok_or_else(|| EngineError::validation(format!("risk event not found: {id}")))?;
        event.resolved = true;
        event.updated_at = Utc::now();
        Ok(event.clone())
    }
}

/// Credential source with a fixed set of venues configured.
pub struct FixedCredentials {
    venues: Vec<VenueId>,
}

impl FixedCredentials {
    pub fn for_venues(venues: &[VenueId]) -> Arc<Self> {
        Arc::new(Self {
            venues: venues.to_vec(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self { venues: Vec::new() })
    }
}

#[async_trait]
impl funding_engine::CredentialSource for FixedCredentials {
    async fn plaintext(&self, venue: VenueId) -> EngineResult<Option<VenueCredential>> {
        if self.venues.contains(&venue) {
            Ok(Some(VenueCredential::new(
                format!("{venue}-key"),
                format!("{venue}-secret"),
                None,
                true,
            )))
        } else {
            Ok(None)
        }
    }
}
