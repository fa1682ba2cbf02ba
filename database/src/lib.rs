//! # Persistence Layer
//!
//! PostgreSQL-backed stores for the funding arbitrage engine: paired
//! positions with their per-leg orders, the append-only risk-event
//! ledger, strategy templates, and the encrypted credential vault.
//! Implements the storage ports defined by `funding-engine`.

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod migrations;
pub mod orders;
pub mod positions;
pub mod risk_events;
mod rows;
pub mod templates;
pub mod vault;

pub use config::DatabaseConfig;
pub use crypto::CredentialCipher;
pub use database::DatabaseManager;
pub use error::{DatabaseError, DatabaseResult};
pub use orders::PgOrderStore;
pub use positions::PgPositionStore;
pub use risk_events::PgRiskLedger;
pub use templates::{NewStrategyTemplate, StrategyTemplate, StrategyTemplateUpdate, TemplateStore};
pub use vault::{mask_api_key, CredentialUpsert, CredentialVault, MaskedCredential};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
