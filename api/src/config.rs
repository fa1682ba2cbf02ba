//! API configuration.
//!
//! Loaded from `FA_`-prefixed environment variables with sane defaults.
//! The credential encryption key is optional; when absent the vault is
//! disabled, and when present-but-blank startup is rejected.

use config::{Config, ConfigError, Environment};
use funding_engine::EngineConfig;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server bind address.
    pub bind_address: String,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Comma-separated CORS origins.
    pub cors_origins: String,

    /// Master key for the credential vault. Absent disables the vault.
    pub credential_encryption_key: Option<String>,

    /// Snapshot cache TTL in seconds.
    pub market_cache_ttl_seconds: u64,

    /// Stale admission window past cache expiry, seconds.
    pub stale_max_age_seconds: u64,

    /// Per-venue fetch deadline, milliseconds.
    pub venue_fetch_budget_ms: u64,

    /// Overall market sweep deadline, milliseconds.
    pub total_fetch_budget_ms: u64,

    /// Per-order venue call deadline, milliseconds.
    pub order_call_timeout_ms: u64,

    /// Enrich market sweeps with unified-client leverage metadata.
    pub enable_ccxt_market_leverage: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
            database_url: "postgresql://localhost/funding_arb".to_string(),
            cors_origins: "http://localhost:5173,http://127.0.0.1:5173".to_string(),
            credential_encryption_key: None,
            market_cache_ttl_seconds: 300,
            stale_max_age_seconds: 120,
            venue_fetch_budget_ms: 4_000,
            total_fetch_budget_ms: 10_000,
            order_call_timeout_ms: 10_000,
            enable_ccxt_market_leverage: true,
        }
    }
}

impl ApiConfig {
    /// Load configuration from `FA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(Environment::with_prefix("FA").try_parsing(true))
            .build()?;

        let mut api_config = ApiConfig::default();
        if let Ok(value) = config.get_string("bind_address") {
            api_config.bind_address = value;
        }
        if let Ok(value) = config.get_string("database_url") {
            api_config.database_url = value;
        }
        if let Ok(value) = config.get_string("cors_origins") {
            api_config.cors_origins = value;
        }
        if let Ok(value) = config.get_string("credential_encryption_key") {
            api_config.credential_encryption_key = Some(value);
        }
        if let Ok(value) = config.get_int("market_cache_ttl_seconds") {
            api_config.market_cache_ttl_seconds = value.max(0) as u64;
        }
        if let Ok(value) = config.get_int("stale_max_age_seconds") {
            api_config.stale_max_age_seconds = value.max(0) as u64;
        }
        if let Ok(value) = config.get_int("venue_fetch_budget_ms") {
            api_config.venue_fetch_budget_ms = value.max(1) as u64;
        }
        if let Ok(value) = config.get_int("total_fetch_budget_ms") {
            api_config.total_fetch_budget_ms = value.max(1) as u64;
        }
        if let Ok(value) = config.get_int("order_call_timeout_ms") {
            api_config.order_call_timeout_ms = value.max(1) as u64;
        }
        if let Ok(value) = config.get_bool("enable_ccxt_market_leverage") {
            api_config.enable_ccxt_market_leverage = value;
        }

        api_config.validate()?;

        info!("configuration loaded");
        info!("  bind address: {}", api_config.bind_address);
        // Connection strings may carry credentials.
        info!("  database: [REDACTED]");
        info!("  cors origins: {:?}", api_config.cors_origin_list());
        info!(
            "  market cache ttl: {}s (+{}s stale window)",
            api_config.market_cache_ttl_seconds, api_config.stale_max_age_seconds
        );
        info!(
            "  fetch budgets: {}ms per venue, {}ms total",
            api_config.venue_fetch_budget_ms, api_config.total_fetch_budget_ms
        );
        if api_config.credential_encryption_key.is_none() {
            warn!("FA_CREDENTIAL_ENCRYPTION_KEY not set; credential vault is disabled");
        }

        Ok(api_config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::Message("bind_address is empty".to_string()));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Message("database_url is empty".to_string()));
        }
        // Credential features are enabled by supplying a key; a blank
        // key is a configuration error rather than a disabled vault.
        if let Some(key) = &self.credential_encryption_key {
            if key.trim().is_empty() {
                return Err(ConfigError::Message(
                    "credential_encryption_key is set but empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_ttl: Duration::from_secs(self.market_cache_ttl_seconds),
            stale_max_age: Duration::from_secs(self.stale_max_age_seconds),
            venue_fetch_budget: Duration::from_millis(self.venue_fetch_budget_ms),
            total_fetch_budget: Duration::from_millis(self.total_fetch_budget_ms),
            order_call_timeout: Duration::from_millis(self.order_call_timeout_ms),
        }
    }
}
