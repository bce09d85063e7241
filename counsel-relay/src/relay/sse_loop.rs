//! SSE relay loop
//!
//! Drains the relay channel into SSE frames for one session:
//!
//! ```text
//! Waiting --unit--> Emitting --> Waiting
//! Waiting --poll timeout--> Heartbeat --> Waiting
//! Waiting --Terminal--> Complete
//! Waiting --Error unit | closed | shutdown--> Error
//! any write failure --> Disconnected
//! ```
//!
//! Exactly one terminal frame (`complete` or `error`) is written, and nothing
//! is written after it.

use async_trait::async_trait;
use counsel_common::sse::SseFrame;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{Popped, RelayReceiver};
use super::session::RelaySession;
use super::types::{QueueEntry, RelayFailure, StreamUnit};

/// Downstream client is gone
#[derive(Debug, Error, PartialEq, Eq)]
#[error("SSE client disconnected")]
pub struct SinkClosed;

/// Destination for SSE frames
#[async_trait]
pub trait FrameSink: Send {
    async fn write(&mut self, frame: SseFrame) -> Result<(), SinkClosed>;
}

/// The receiving half becomes the HTTP response body; dropping it (client
/// disconnect) makes every later write fail.
#[async_trait]
impl FrameSink for mpsc::Sender<SseFrame> {
    async fn write(&mut self, frame: SseFrame) -> Result<(), SinkClosed> {
        self.send(frame).await.map_err(|_| SinkClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Waiting,
    Emitting,
    Heartbeat,
    Complete,
    Error,
    Disconnected,
}

impl RelayState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayState::Complete | RelayState::Error | RelayState::Disconnected
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Completed,
    Failed(RelayFailure),
    Disconnected,
}

pub struct SseRelayLoop {
    rx: RelayReceiver,
    heartbeat: Duration,
    shutdown: CancellationToken,
    state: RelayState,
    frames_written: usize,
    heartbeats_sent: usize,
}

impl SseRelayLoop {
    /// `shutdown` is the application-wide token, not the session's own
    pub fn new(rx: RelayReceiver, heartbeat: Duration, shutdown: CancellationToken) -> Self {
        Self {
            rx,
            heartbeat,
            shutdown,
            state: RelayState::Waiting,
            frames_written: 0,
            heartbeats_sent: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    pub fn heartbeats_sent(&self) -> usize {
        self.heartbeats_sent
    }

    pub async fn run<S: FrameSink>(
        &mut self,
        session: &mut RelaySession,
        sink: &mut S,
    ) -> LoopOutcome {
        loop {
            self.state = RelayState::Waiting;

            let popped = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                popped = self.rx.pop(self.heartbeat) => Some(popped),
            };

            let entry = match popped {
                None => return self.fail(session, sink, RelayFailure::Shutdown).await,
                Some(Popped::TimedOut) => {
                    self.state = RelayState::Heartbeat;
                    if self.emit(sink, SseFrame::heartbeat()).await.is_err() {
                        return self.disconnected(session);
                    }
                    self.heartbeats_sent += 1;
                    continue;
                }
                Some(Popped::Closed) => {
                    return self.fail(session, sink, RelayFailure::WorkerLost).await
                }
                Some(Popped::Entry(entry)) => entry,
            };

            match entry {
                QueueEntry::Terminal => return self.complete(session, sink).await,
                QueueEntry::Unit(StreamUnit::TextDelta(text)) => {
                    self.state = RelayState::Emitting;
                    if self.emit(sink, SseFrame::chunk(text.as_str())).await.is_err() {
                        return self.disconnected(session);
                    }
                    session.append_text(&text);
                }
                QueueEntry::Unit(StreamUnit::Component(payload)) => {
                    self.state = RelayState::Emitting;
                    if self.emit(sink, SseFrame::component(payload.to_chunk())).await.is_err() {
                        return self.disconnected(session);
                    }
                    session.merge_documents(&payload.items);
                }
                QueueEntry::Unit(StreamUnit::Error(failure)) => {
                    return self.fail(session, sink, failure).await
                }
                QueueEntry::Unit(unit @ (StreamUnit::Heartbeat | StreamUnit::Complete(_))) => {
                    debug!(
                        session_id = %session.session_id,
                        kind = unit.kind(),
                        "Relay loop: unit not forwarded"
                    );
                }
            }
        }
    }

    async fn complete<S: FrameSink>(
        &mut self,
        session: &mut RelaySession,
        sink: &mut S,
    ) -> LoopOutcome {
        let frame = SseFrame::complete(
            session.question.as_str(),
            true,
            session.elapsed_secs(),
            session.documents().to_vec(),
        );
        if self.emit(sink, frame).await.is_err() {
            return self.disconnected(session);
        }

        self.state = RelayState::Complete;
        session.mark_completed();
        info!(
            session_id = %session.session_id,
            frames = self.frames_written,
            heartbeats = self.heartbeats_sent,
            documents = session.documents().len(),
            elapsed_ms = session.elapsed().as_millis() as u64,
            "Relay session completed"
        );
        LoopOutcome::Completed
    }

    async fn fail<S: FrameSink>(
        &mut self,
        session: &mut RelaySession,
        sink: &mut S,
        failure: RelayFailure,
    ) -> LoopOutcome {
        self.state = RelayState::Error;
        if self.emit(sink, SseFrame::error(failure.to_string())).await.is_err() {
            debug!(
                session_id = %session.session_id,
                "Client disconnected before the error frame was written"
            );
        }

        warn!(
            session_id = %session.session_id,
            reason = failure.tag(),
            error = %failure,
            "Relay session ended with error"
        );
        session.mark_failed(failure.clone());
        LoopOutcome::Failed(failure)
    }

    fn disconnected(&mut self, session: &mut RelaySession) -> LoopOutcome {
        self.state = RelayState::Disconnected;
        session.mark_disconnected();
        info!(
            session_id = %session.session_id,
            frames = self.frames_written,
            "Client disconnected, stopping relay"
        );
        LoopOutcome::Disconnected
    }

    async fn emit<S: FrameSink>(&mut self, sink: &mut S, frame: SseFrame) -> Result<(), SinkClosed> {
        sink.write(frame).await?;
        self.frames_written += 1;
        Ok(())
    }
}
