//! Streaming relay core
//!
//! One relay session runs two tokio tasks joined by a bounded channel:
//!
//! - [`consumer::UpstreamConsumer`] reads the remote stream, then classifies,
//!   deduplicates and extracts each unit before pushing it
//! - [`sse_loop::SseRelayLoop`] turns channel entries into SSE frames
//!
//! When the loop has written its terminal frame (or the client is gone) the
//! consumer is cancelled, awaited for a bounded grace period, and the session
//! is handed to [`aggregator::SessionAggregator`].

pub mod aggregator;
pub mod channel;
pub mod classifier;
pub mod consumer;
pub mod dedup;
pub mod extractor;
pub mod session;
pub mod sse_loop;
pub mod types;

pub use aggregator::{Persistence, SessionAggregator, SummaryUpdate};
pub use session::{RelaySession, SessionAggregate, SessionStatus};
pub use sse_loop::{FrameSink, LoopOutcome};
pub use types::{RelayFailure, StreamUnit};

use counsel_common::config::RelayConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::upstream::RemoteStreamClient;
use channel::relay_channel;
use consumer::UpstreamConsumer;
use sse_loop::SseRelayLoop;

/// Shared collaborators of every relay session
#[derive(Clone)]
pub struct RelayContext {
    pub client: Arc<dyn RemoteStreamClient>,
    pub aggregator: SessionAggregator,
    pub config: RelayConfig,
    /// Application-wide shutdown token; each session derives a child
    pub shutdown: CancellationToken,
}

/// Run a relay session on its own task
pub fn spawn_relay<S>(
    ctx: RelayContext,
    session: RelaySession,
    sink: S,
) -> JoinHandle<SessionAggregate>
where
    S: FrameSink + 'static,
{
    tokio::spawn(run_relay(ctx, session, sink))
}

/// Relay one session to completion and return its persisted aggregate
pub async fn run_relay<S: FrameSink>(
    ctx: RelayContext,
    mut session: RelaySession,
    mut sink: S,
) -> SessionAggregate {
    let (tx, rx) = relay_channel(ctx.config.channel_capacity);
    let cancel = ctx.shutdown.child_token();

    let mut consumer = UpstreamConsumer::new(
        session.session_id,
        ctx.client.clone(),
        session.correlation_key.clone(),
        session.question.clone(),
        ctx.config.stream_timeout(),
        tx,
        cancel.clone(),
    )
    .spawn();

    let mut relay_loop =
        SseRelayLoop::new(rx, ctx.config.heartbeat_interval(), ctx.shutdown.clone());
    let outcome = relay_loop.run(&mut session, &mut sink).await;

    // Receiver and response body go first so the client sees the end of the
    // stream without waiting for upstream cleanup
    drop(relay_loop);
    drop(sink);
    cancel.cancel();

    match tokio::time::timeout(ctx.config.shutdown_grace(), &mut consumer).await {
        Ok(Ok(report)) => debug!(
            session_id = %session.session_id,
            loop_outcome = ?outcome,
            consumer_outcome = report.outcome.as_str(),
            "Upstream consumer joined"
        ),
        Ok(Err(e)) => error!(
            session_id = %session.session_id,
            error = %e,
            "Upstream consumer task failed"
        ),
        Err(_) => {
            warn!(
                session_id = %session.session_id,
                grace_ms = ctx.config.shutdown_grace_ms,
                "Upstream consumer did not stop within grace period, aborting"
            );
            consumer.abort();
        }
    }

    ctx.aggregator.finalize(session).await
}
