pub mod aggregator;
pub mod api;
pub mod cache;
pub mod config;
pub mod fetch;
pub mod metrics_defs;
pub mod registry;
pub mod sanitize;
pub mod scheduler;
pub mod session;
pub mod state_store;
pub mod tabular;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::aggregator::Aggregator;
use crate::api::{ApiServeError, AppState};
use crate::config::{Config, ValidationError};
use crate::fetch::HttpUpstream;
use crate::registry::{Registry, RegistryError};
use crate::scheduler::Scheduler;
use crate::session::{PasswordHash, SessionError, SessionManager};
use crate::state_store::get_state_store;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum AggregatorError {
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),

    #[error("could not load source registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("invalid admin credentials config: {0}")]
    Session(#[from] SessionError),

    #[error(transparent)]
    Serve(#[from] ApiServeError),
}

/// Runs the service until ctrl-c.
pub async fn run(config: Config) -> Result<(), AggregatorError> {
    config.validate()?;

    let store = get_state_store(&config.state_store);
    let registry = Registry::load(config.builtin_sources(), store)?;
    let upstream = Arc::new(HttpUpstream::new(&config.fetch));
    let aggregator = Aggregator::new(registry, upstream);

    let password = PasswordHash::from_config(&config.admin)?;
    let sessions = Arc::new(SessionManager::new(
        password,
        Duration::from_secs(config.admin.session_ttl_secs),
    ));
    let sweeper = sessions
        .clone()
        .spawn_sweeper(Duration::from_secs(config.admin.sweep_interval_secs));

    let (scheduler, worker) = Scheduler::spawn(aggregator.clone(), config.refresh.clone());

    let state = AppState {
        aggregator,
        sessions,
        scheduler: scheduler.clone(),
    };
    let result = api::serve(&config.listener, state, shutdown_signal()).await;

    scheduler.shutdown().await;
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "Refresh worker failed");
    }
    sweeper.abort();

    result?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
