//! failopen -- statistical fail-open circuit breaker for third-party CAPTCHA verification.
//!
//! Every verification attempt is counted into a fixed-length time bucket. When a
//! bucket closes, its success rate is compared against a rolling baseline of
//! earlier buckets; a rate far below normal means the provider is degraded, and
//! the installed hook is told to fail open.

pub mod api;
pub mod breaker;
pub mod config;
pub mod detect;
pub mod simulate;
pub mod store;
pub mod window;

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::trace::TraceLayer;

use crate::breaker::FailOpenBreaker;
use crate::config::{BreakerConfig, StoreBackend};
use crate::detect::{IncidentLog, LogHook};
use crate::store::{MemoryStore, SqliteStore};

/// A breaker wired to the stores named in its configuration.
#[derive(Clone)]
pub struct Deployment {
    pub breaker: Arc<FailOpenBreaker>,
    /// Present for the sqlite backend, where trips are persisted.
    pub incidents: Option<Arc<IncidentLog>>,
}

/// Open the configured store and build a breaker over it.
pub fn open_deployment(config: BreakerConfig) -> Result<Deployment> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::default());
            let breaker = FailOpenBreaker::new(config, store.clone(), store)?
                .with_hook(Arc::new(LogHook));
            Ok(Deployment {
                breaker: Arc::new(breaker),
                incidents: None,
            })
        }
        StoreBackend::Sqlite => {
            tracing::info!(path = %config.store.path.display(), "Initializing database");
            let store = Arc::new(
                SqliteStore::open(&config.store.path, config.store.busy_timeout_ms)
                    .context("failed to open sqlite store")?,
            );
            let incidents = Arc::new(IncidentLog::new(store.pool().clone()));
            let breaker =
                FailOpenBreaker::new(config, store.clone(), store)?.with_hook(incidents.clone());
            Ok(Deployment {
                breaker: Arc::new(breaker),
                incidents: Some(incidents),
            })
        }
    }
}

/// Run the HTTP surface on `bind` until the process is stopped.
pub async fn serve(bind: &str, config: BreakerConfig) -> Result<()> {
    let deployment = open_deployment(config)?;
    let addr: std::net::SocketAddr = bind.parse()?;
    let app = api::router(api::state::AppState::from(deployment)).layer(TraceLayer::new_for_http());

    tracing::info!(%addr, "failopen listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
