//! Funding arbitrage service entry point.
//!
//! Exit codes: `0` on clean shutdown, `2` on invalid configuration
//! (including a present-but-invalid credential encryption key), `3` when
//! the database is unreachable at startup.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use funding_arb_api::{ApiConfig, ApiServer, AppState, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Config(message)) => {
            error!("invalid configuration: {message}");
            ExitCode::from(2)
        }
        Err(StartupError::Database(message)) => {
            error!("database unreachable: {message}");
            ExitCode::from(3)
        }
        Err(StartupError::Server(message)) => {
            error!("server failed: {message}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let config =
        ApiConfig::from_env().map_err(|err| StartupError::Config(err.to_string()))?;

    info!("starting funding arbitrage service");
    let state = Arc::new(AppState::new(config).await?);
    ApiServer::new(state).serve().await
}
