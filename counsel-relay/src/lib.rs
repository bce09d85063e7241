//! counsel-relay library
//!
//! Streams answers from a remote AI service to browsers over Server-Sent
//! Events, one relay session per question.

use axum::Router;
use counsel_common::config::RelayConfig;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod db;
pub mod error;
pub mod relay;
pub mod upstream;

pub use error::{ApiError, ApiResult};

use db::SqlitePersistence;
use relay::{Persistence, RelayContext, SessionAggregator};
use upstream::RemoteStreamClient;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Collaborators handed to every relay session
    pub relay: RelayContext,
    pub startup_time: Instant,
    active_sessions: Arc<AtomicUsize>,
}

impl AppState {
    /// State backed by SQLite persistence
    pub fn new(
        db: SqlitePool,
        client: Arc<dyn RemoteStreamClient>,
        config: RelayConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(db.clone()));
        Self {
            relay: RelayContext {
                client,
                aggregator: SessionAggregator::new(persistence),
                config,
                shutdown,
            },
            db,
            startup_time: Instant::now(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Relay sessions currently streaming
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Count a relay session as active until the guard is dropped
    pub fn track_session(&self) -> ActiveSessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        ActiveSessionGuard {
            counter: self.active_sessions.clone(),
        }
    }
}

pub struct ActiveSessionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::{get, post};

    let api = Router::new()
        .route("/api/chat/stream", post(api::chat_stream))
        .route("/api/conversations", post(api::create_conversation))
        .route("/api/conversations/:id", get(api::get_conversation));

    Router::new()
        .merge(api)
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
