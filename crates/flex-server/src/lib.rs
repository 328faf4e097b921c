use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use flex_core::{CapabilityRegistry, EngineConfig, RunCoordinator};
use flex_telemetry::EventBus;

mod http;
mod sse;

pub use http::app_router;

/// Tracks the cancellation token for every run currently in flight, so a
/// `POST /v1/runs/{id}/cancel` can reach a task it did not spawn.
#[derive(Clone, Default)]
pub struct RunRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, run_id: String, token: CancellationToken) {
        self.tokens.write().await.insert(run_id, token);
    }

    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.read().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn forget(&self, run_id: &str) {
        self.tokens.write().await.remove(run_id);
    }
}

/// Bounds how many runs the gateway drives concurrently
/// (`SSE_CONCURRENCY`) and how many callers may wait for a free slot
/// before new submissions are rejected outright (`SSE_MAX_PENDING`),
/// per spec.md §5 / §6.5.
pub struct AdmissionGate {
    concurrency: Arc<Semaphore>,
    pending: Arc<AtomicU64>,
    max_pending: u64,
}

pub struct AdmissionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(concurrency: usize, max_pending: usize) -> Self {
        Self {
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
            pending: Arc::new(AtomicU64::new(0)),
            max_pending: max_pending as u64,
        }
    }

    /// Returns `Err(pending)` immediately when the backlog is already
    /// full; otherwise waits for a concurrency slot and returns a permit
    /// that frees the slot on drop.
    pub async fn acquire(&self) -> Result<AdmissionPermit, u64> {
        let pending = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(pending - 1);
        }
        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(AdmissionPermit { _permit: permit })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
    pub registry: Arc<CapabilityRegistry>,
    pub event_bus: Arc<EventBus>,
    pub runs: RunRegistry,
    pub admission: Arc<AdmissionGate>,
    pub config: EngineConfig,
}

impl AppState {
    pub fn new(
        coordinator: Arc<RunCoordinator>,
        registry: Arc<CapabilityRegistry>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        let admission = Arc::new(AdmissionGate::new(
            config.sse_concurrency,
            config.sse_max_pending,
        ));
        Self {
            coordinator,
            registry,
            event_bus,
            runs: RunRegistry::new(),
            admission,
            config,
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "flex.obs", %addr, "flex-server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
