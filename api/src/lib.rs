//! # Funding Arbitrage API
//!
//! REST surface for the funding-rate arbitrage engine, built on Axum.
//!
//! ## Architecture
//! - `handlers`: HTTP request handlers per resource
//! - `models`: request/response models and query params
//! - `config`: `FA_`-prefixed environment configuration
//! - `error`: `{detail, kind}` error mapping
//!
//! `AppState` wires the venue adapters, market provider, execution
//! coordinator and the persistence stores together.

use axum::http::HeaderValue;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use funding_arb_database::{
    migrations, CredentialVault, DatabaseConfig, DatabaseManager, PgOrderStore, PgPositionStore,
    PgRiskLedger, TemplateStore,
};
use funding_engine::{
    ExecutionCoordinator, MarketProvider, OrderStore, PositionStore, RiskLedger,
};
use venue_adapters::{
    binance::BinanceAdapter, bitget::BitgetAdapter, bybit::BybitAdapter, gateio::GateioAdapter,
    okx::OkxAdapter, VenueAdapter, VenueId,
};

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};

/// Startup failures, split so the binary can map them to exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database unavailable: {0}")]
    Database(String),

    #[error("server error: {0}")]
    Server(String),
}

/// Application state shared across all handlers.
pub struct AppState {
    pub provider: Arc<MarketProvider>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub vault: Arc<CredentialVault>,
    pub positions: Arc<dyn PositionStore>,
    pub orders: Arc<dyn OrderStore>,
    pub risk: Arc<dyn RiskLedger>,
    pub templates: Arc<TemplateStore>,
    pub config: Arc<ApiConfig>,
}

impl AppState {
    pub async fn new(config: ApiConfig) -> Result<Self, StartupError> {
        let db = DatabaseManager::new(DatabaseConfig::new(config.database_url.clone()))
            .await
            .map_err(|err| StartupError::Database(err.to_string()))?;
        migrations::run_migrations(db.pool())
            .await
            .map_err(|err| StartupError::Database(err.to_string()))?;

        let vault = Arc::new(
            CredentialVault::new(
                db.pool().clone(),
                config.credential_encryption_key.as_deref(),
            )
            .map_err(|err| StartupError::Config(err.to_string()))?,
        );

        let adapters = build_adapters(&config);
        let engine_config = config.engine_config();
        let provider = Arc::new(MarketProvider::new(adapters.clone(), engine_config.clone()));

        let positions: Arc<dyn PositionStore> =
            Arc::new(PgPositionStore::new(db.pool().clone()));
        let orders: Arc<dyn OrderStore> = Arc::new(PgOrderStore::new(db.pool().clone()));
        let risk: Arc<dyn RiskLedger> = Arc::new(PgRiskLedger::new(db.pool().clone()));
        let templates = Arc::new(TemplateStore::new(db.pool().clone()));

        let coordinator = Arc::new(ExecutionCoordinator::new(
            adapters,
            Arc::clone(&provider),
            Arc::clone(&positions),
            Arc::clone(&orders),
            Arc::clone(&risk),
            vault.clone(),
            engine_config,
        ));

        Ok(Self {
            provider,
            coordinator,
            vault,
            positions,
            orders,
            risk,
            templates,
            config: Arc::new(config),
        })
    }
}

fn build_adapters(config: &ApiConfig) -> BTreeMap<VenueId, Arc<dyn VenueAdapter>> {
    let binance = if config.enable_ccxt_market_leverage {
        BinanceAdapter::new()
    } else {
        BinanceAdapter::new().without_leverage_brackets()
    };

    let mut adapters: BTreeMap<VenueId, Arc<dyn VenueAdapter>> = BTreeMap::new();
    adapters.insert(VenueId::Binance, Arc::new(binance));
    adapters.insert(VenueId::Okx, Arc::new(OkxAdapter::new()));
    adapters.insert(VenueId::Bybit, Arc::new(BybitAdapter::new()));
    adapters.insert(VenueId::Bitget, Arc::new(BitgetAdapter::new()));
    adapters.insert(VenueId::Gateio, Arc::new(GateioAdapter::new()));
    adapters
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origin_list()
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(handlers::healthz))
        // Market data
        .route("/api/market/snapshots", get(handlers::market::get_snapshots))
        .route("/api/market/board", get(handlers::market::get_board))
        .route("/api/opportunities", get(handlers::market::get_opportunities))
        // Execution
        .route("/api/execution/preview", post(handlers::execution::preview))
        .route("/api/execution/open", post(handlers::execution::open))
        .route("/api/execution/close", post(handlers::execution::close))
        .route("/api/execution/hedge", post(handlers::execution::hedge))
        .route(
            "/api/execution/emergency-close",
            post(handlers::execution::emergency_close),
        )
        .route("/api/execution/convert", post(handlers::execution::convert))
        // Credentials (masked only)
        .route("/api/credentials", get(handlers::credentials::list_credentials))
        .route(
            "/api/credentials/:exchange",
            put(handlers::credentials::upsert_credential),
        )
        .route(
            "/api/credentials/:exchange",
            delete(handlers::credentials::delete_credential),
        )
        // Records
        .route("/api/positions", get(handlers::records::list_positions))
        .route("/api/orders", get(handlers::records::list_orders))
        // Risk ledger
        .route("/api/risk-events", get(handlers::risk_events::list_risk_events))
        .route(
            "/api/risk-events/:id/resolve",
            post(handlers::risk_events::resolve_risk_event),
        )
        // Templates
        .route("/api/templates", get(handlers::templates::list_templates))
        .route("/api/templates", post(handlers::templates::create_template))
        .route("/api/templates/:id", put(handlers::templates::update_template))
        .route(
            "/api/templates/:id",
            delete(handlers::templates::delete_template),
        )
        .layer(cors)
        .with_state(state)
}

/// API server wrapper owning the router and bind address.
pub struct ApiServer {
    router: Router,
    bind_address: String,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        let bind_address = state.config.bind_address.clone();
        Self {
            router: build_router(state),
            bind_address,
        }
    }

    /// Bind and serve until the process is stopped.
    pub async fn serve(self) -> Result<(), StartupError> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|err| {
                StartupError::Server(format!("failed to bind {}: {err}", self.bind_address))
            })?;
        info!("listening on http://{}", self.bind_address);

        axum::serve(listener, self.router)
            .await
            .map_err(|err| StartupError::Server(err.to_string()))
    }
}
