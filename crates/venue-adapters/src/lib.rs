//! Venue Adapters for the Funding Arbitrage Engine
//!
//! This crate provides unified adapters for the five supported USDT
//! perpetual venues:
//! - Binance USDT-M futures
//! - OKX swaps
//! - Bybit linear perpetuals
//! - Bitget USDT futures
//! - Gate.io USDT futures
//!
//! All adapters implement the `VenueAdapter` trait for a consistent
//! interface. Venue-specific order quirks (position-side retries, unified
//! account routing, transport fallbacks) live in the concrete adapters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod gateio;
pub mod okx;
pub mod transport;
pub mod utils;

pub use transport::{OrderTransport, RestOrderTransport, SignedRequest};

/// Venue adapter error types, tagged with the engine-wide taxonomy.
#[derive(Error, Debug)]
pub enum VenueError {
    #[error("transient venue failure: {message}")]
    Transient { message: String, timed_out: bool },

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("fatal venue failure: {0}")]
    Fatal(String),
}

impl VenueError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Transient {
            message: message.into(),
            timed_out: true,
        }
    }

    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth(message.into())
    }

    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal(message.into())
    }

    /// Taxonomy tag surfaced in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            VenueError::Transient { .. } => "transient",
            VenueError::Auth(_) => "auth",
            VenueError::NotSupported(_) => "not_supported",
            VenueError::Fatal(_) => "internal",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient { .. })
    }

    pub fn timed_out(&self) -> bool {
        matches!(
            self,
            VenueError::Transient {
                timed_out: true,
                ..
            }
        )
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return VenueError::timeout(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return VenueError::transient(format!("http {status}: {err}"));
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return VenueError::auth(format!("http {status}: {err}"));
            }
            return VenueError::fatal(format!("http {status}: {err}"));
        }
        VenueError::transient(err.to_string())
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Unique identifiers for the supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueId {
    Binance,
    Okx,
    Bybit,
    Bitget,
    Gateio,
}

impl VenueId {
    pub const ALL: [VenueId; 5] = [
        VenueId::Binance,
        VenueId::Okx,
        VenueId::Bybit,
        VenueId::Bitget,
        VenueId::Gateio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "binance",
            VenueId::Okx => "okx",
            VenueId::Bybit => "bybit",
            VenueId::Bitget => "bitget",
            VenueId::Gateio => "gateio",
        }
    }

    pub fn parse(value: &str) -> Option<VenueId> {
        match value.to_ascii_lowercase().as_str() {
            "binance" => Some(VenueId::Binance),
            "okx" => Some(VenueId::Okx),
            "bybit" => Some(VenueId::Bybit),
            "bitget" => Some(VenueId::Bitget),
            "gateio" => Some(VenueId::Gateio),
            _ => None,
        }
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a funding snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Ccxt,
    Rest,
    Ws,
    Stale,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Ccxt => "ccxt",
            SourceTag::Rest => "rest",
            SourceTag::Ws => "ws",
            SourceTag::Stale => "stale",
        }
    }
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified funding snapshot for one `(venue, symbol)` pair.
///
/// Symbols are normalized to uppercase `BASEUSDT`. Rate conversions are
/// derived once at construction so downstream consumers never recompute
/// them from partial data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub exchange: VenueId,
    pub symbol: String,
    pub funding_rate_raw: Option<f64>,
    pub funding_interval_hours: Option<f64>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub mark_price: Option<f64>,
    pub open_interest_usd: Option<f64>,
    pub volume24h_usd: Option<f64>,
    pub max_leverage: Option<f64>,
    pub rate_1h: Option<f64>,
    pub rate_8h: Option<f64>,
    pub rate_1y_compounded: Option<f64>,
    pub rate_1y_nominal: Option<f64>,
    pub leveraged_nominal_rate_1y: Option<f64>,
    pub source_tag: SourceTag,
    pub fetched_at: DateTime<Utc>,
}

/// Per-interval funding rate converted to hourly, 8-hour, compounded
/// annual and linear nominal annual terms.
pub fn convert_funding_rate(
    funding_rate_raw: Option<f64>,
    funding_interval_hours: Option<f64>,
) -> (Option<f64>, Option<f64>, Option<f64>, Option<f64>) {
    let (raw, interval) = match (funding_rate_raw, funding_interval_hours) {
        (Some(raw), Some(interval)) if interval > 0.0 => (raw, interval),
        _ => return (None, None, None, None),
    };

    let rate_1h = raw / interval;
    let rate_8h = rate_1h * 8.0;
    let nominal_rate_1y = rate_1h * 24.0 * 365.0;
    let compounded = (1.0 + rate_1h).powf(24.0 * 365.0) - 1.0;
    let rate_1y_compounded = compounded.is_finite().then_some(compounded);

    (
        Some(rate_1h),
        Some(rate_8h),
        rate_1y_compounded,
        Some(nominal_rate_1y),
    )
}

/// Raw field bundle used by adapters to assemble a snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFields {
    pub funding_rate_raw: Option<f64>,
    pub funding_interval_hours: Option<f64>,
    pub next_funding_time: Option<DateTime<Utc>>,
    pub mark_price: Option<f64>,
    pub open_interest_usd: Option<f64>,
    pub volume24h_usd: Option<f64>,
    pub max_leverage: Option<f64>,
}

impl FundingSnapshot {
    /// Build a snapshot from venue-native fields. Returns `None` when the
    /// symbol does not normalize to a USDT perpetual.
    pub fn build(
        exchange: VenueId,
        raw_symbol: &str,
        fields: SnapshotFields,
        source_tag: SourceTag,
    ) -> Option<Self> {
        let symbol = utils::normalize_usdt_symbol(raw_symbol)?;
        let (rate_1h, rate_8h, rate_1y_compounded, rate_1y_nominal) =
            convert_funding_rate(fields.funding_rate_raw, fields.funding_interval_hours);
        let leveraged_nominal_rate_1y = match (rate_1y_nominal, fields.max_leverage) {
            (Some(nominal), Some(leverage)) => Some(nominal * leverage),
            _ => None,
        };

        Some(Self {
            exchange,
            symbol,
            funding_rate_raw: fields.funding_rate_raw,
            funding_interval_hours: fields.funding_interval_hours,
            next_funding_time: fields.next_funding_time,
            mark_price: fields.mark_price,
            open_interest_usd: fields.open_interest_usd,
            volume24h_usd: fields.volume24h_usd,
            max_leverage: fields.max_leverage,
            rate_1h,
            rate_8h,
            rate_1y_compounded,
            rate_1y_nominal,
            leveraged_nominal_rate_1y,
            source_tag,
            fetched_at: Utc::now(),
        })
    }

    /// Re-tag the snapshot's provenance, e.g. when served from the stale
    /// window of the cache.
    pub fn with_source(mut self, source_tag: SourceTag) -> Self {
        self.source_tag = source_tag;
        self
    }
}

/// One transport tier's worth of snapshots plus its provenance tag.
#[derive(Debug, Clone)]
pub struct FundingBatch {
    pub source: SourceTag,
    pub snapshots: Vec<FundingSnapshot>,
}

/// Order side enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Hedge-mode position side hint attached to venue orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Both,
    Net,
}

/// Market order request in base-asset units.
///
/// Adapters convert the quantity to the venue's native unit (contracts
/// where applicable) before dispatch and convert fills back on the ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub position_side: Option<PositionSide>,
}

/// Venue acknowledgement of a placed order, quantities in base-asset
/// units regardless of the venue's native sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: Option<String>,
    pub filled_qty: Option<Decimal>,
    pub avg_price: Option<f64>,
    pub note: Option<String>,
    pub raw: serde_json::Value,
}

/// API credential material handed to an adapter for private calls.
///
/// Secret fields are wrapped so debug output never leaks them.
#[derive(Clone)]
pub struct VenueCredential {
    pub api_key: Secret<String>,
    pub api_secret: Secret<String>,
    pub passphrase: Option<Secret<String>>,
    pub testnet: bool,
}

impl VenueCredential {
    pub fn new(
        api_key: String,
        api_secret: String,
        passphrase: Option<String>,
        testnet: bool,
    ) -> Self {
        Self {
            api_key: Secret::new(api_key),
            api_secret: Secret::new(api_secret),
            passphrase: passphrase.map(Secret::new),
            testnet,
        }
    }

    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    pub fn api_secret(&self) -> &str {
        self.api_secret.expose_secret()
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_ref().map(|s| s.expose_secret().as_str())
    }
}

impl std::fmt::Debug for VenueCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueCredential")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .field("testnet", &self.testnet)
            .finish()
    }
}

/// Main venue adapter trait.
///
/// `set_leverage` is a precondition for order placement: callers must not
/// place the surrounding order when it fails with a non-transient error.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Venue identifier.
    fn venue(&self) -> VenueId;

    /// Fetch funding snapshots for every live USDT perpetual, walking the
    /// adapter's transport fallback chain.
    async fn fetch_funding(&self) -> VenueResult<FundingBatch>;

    /// Current mark price for one symbol.
    async fn fetch_mark_price(&self, symbol: &str) -> VenueResult<f64>;

    /// Maximum venue leverage for one symbol, if published.
    async fn fetch_max_leverage(&self, symbol: &str) -> VenueResult<Option<f64>>;

    /// Base-asset quantity represented by one venue contract. Venues that
    /// size orders directly in the base asset report `1`.
    async fn contract_size(&self, symbol: &str) -> VenueResult<Decimal>;

    /// Place a market order sized in base-asset units.
    async fn place_order(
        &self,
        credential: &VenueCredential,
        request: &OrderRequest,
    ) -> VenueResult<OrderAck>;

    /// Cancel a resting order.
    async fn cancel_order(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        order_id: &str,
    ) -> VenueResult<()>;

    /// Set the account leverage for a symbol ahead of order placement.
    async fn set_leverage(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        leverage: f64,
    ) -> VenueResult<()>;
}

/// Rate limiter for venue API calls.
pub struct RateLimiter {
    governor: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        use governor::{Quota, RateLimiter as GovernorRateLimiter};
        use std::num::NonZeroU32;

        let quota =
            Quota::per_second(NonZeroU32::new(requests_per_second.max(1)).expect("nonzero quota"));
        Self {
            governor: GovernorRateLimiter::direct(quota),
        }
    }

    pub async fn acquire(&self) {
        self.governor.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_funding_rate_eight_hour_interval() {
        let (rate_1h, rate_8h, _, nominal) = convert_funding_rate(Some(0.0008), Some(8.0));
        assert!((rate_1h.unwrap() - 0.0001).abs() < 1e-12);
        assert!((rate_8h.unwrap() - 0.0008).abs() < 1e-12);
        assert!((nominal.unwrap() - 0.0001 * 24.0 * 365.0).abs() < 1e-9);
    }

    #[test]
    fn test_convert_funding_rate_missing_interval() {
        let converted = convert_funding_rate(Some(0.0001), None);
        assert_eq!(converted, (None, None, None, None));
        let converted = convert_funding_rate(Some(0.0001), Some(0.0));
        assert_eq!(converted, (None, None, None, None));
    }

    #[test]
    fn test_snapshot_build_normalizes_symbol() {
        let snapshot = FundingSnapshot::build(
            VenueId::Okx,
            "BTC-USDT-SWAP",
            SnapshotFields {
                funding_rate_raw: Some(0.0001),
                funding_interval_hours: Some(8.0),
                ..Default::default()
            },
            SourceTag::Rest,
        )
        .expect("usdt swap should normalize");
        assert_eq!(snapshot.symbol, "BTCUSDT");
        assert!(snapshot.rate_1y_nominal.is_some());
        assert!(snapshot.leveraged_nominal_rate_1y.is_none());
    }

    #[test]
    fn test_snapshot_build_rejects_non_usdt() {
        let snapshot = FundingSnapshot::build(
            VenueId::Binance,
            "BTCUSD_PERP",
            SnapshotFields::default(),
            SourceTag::Rest,
        );
        assert!(snapshot.is_none());
    }

    #[test]
    fn test_snapshot_leveraged_nominal() {
        let snapshot = FundingSnapshot::build(
            VenueId::Binance,
            "ETHUSDT",
            SnapshotFields {
                funding_rate_raw: Some(0.0008),
                funding_interval_hours: Some(8.0),
                max_leverage: Some(20.0),
                ..Default::default()
            },
            SourceTag::Ccxt,
        )
        .unwrap();
        let nominal = snapshot.rate_1y_nominal.unwrap();
        let leveraged = snapshot.leveraged_nominal_rate_1y.unwrap();
        assert!((leveraged - nominal * 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_credential_debug_redacts_secrets() {
        let credential = VenueCredential::new(
            "super_secret_key".to_string(),
            "super_secret_value".to_string(),
            Some("super_secret_phrase".to_string()),
            false,
        );
        let debug_output = format!("{:?}", credential);
        assert!(!debug_output.contains("super_secret_key"));
        assert!(!debug_output.contains("super_secret_value"));
        assert!(!debug_output.contains("super_secret_phrase"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_venue_id_round_trip() {
        for venue in VenueId::ALL {
            assert_eq!(VenueId::parse(venue.as_str()), Some(venue));
        }
        assert_eq!(VenueId::parse("kraken"), None);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(VenueError::timeout("t").kind(), "transient");
        assert!(VenueError::timeout("t").timed_out());
        assert!(!VenueError::transient("t").timed_out());
        assert_eq!(VenueError::auth("a").kind(), "auth");
        assert_eq!(VenueError::not_supported("n").kind(), "not_supported");
        assert_eq!(VenueError::fatal("f").kind(), "internal");
    }
}
