//! Upstream consumer task
//!
//! Owns the single upstream stream call of one relay session. Every raw unit
//! goes through classify → dedupe → extract before it is pushed onto the
//! relay channel. The drive future is raced against the wall-clock ceiling and
//! the session's cancellation token; whichever way the race ends, the upstream
//! handle is closed and exactly one `Terminal` sentinel is pushed.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::RelaySender;
use super::classifier::classify;
use super::dedup::Deduplicator;
use super::extractor::extract_documents;
use super::types::{QueueEntry, RelayFailure, StreamUnit};
use crate::upstream::{RemoteStreamClient, UpstreamStream};

/// How the consumer stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerOutcome {
    /// Upstream ended the stream (end of body or explicit end event)
    Finished,
    /// Upstream failed; the failure was pushed as an `Error` unit
    Failed(RelayFailure),
    /// Wall-clock ceiling expired
    TimedOut,
    /// Session cancellation token fired
    Cancelled,
    /// Relay loop dropped its receiver
    Abandoned,
    /// Drive future panicked
    Panicked(String),
}

impl ConsumerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerOutcome::Finished => "finished",
            ConsumerOutcome::Failed(_) => "failed",
            ConsumerOutcome::TimedOut => "timed_out",
            ConsumerOutcome::Cancelled => "cancelled",
            ConsumerOutcome::Abandoned => "abandoned",
            ConsumerOutcome::Panicked(_) => "panicked",
        }
    }
}

/// Per-session summary returned by the consumer task
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerReport {
    pub outcome: ConsumerOutcome,
    /// Units pushed onto the relay channel (terminal entries excluded)
    pub units_relayed: usize,
    pub duplicates_suppressed: usize,
    /// Units the classifier could not decode
    pub units_dropped: usize,
    pub elapsed: Duration,
}

pub struct UpstreamConsumer {
    session_id: Uuid,
    client: Arc<dyn RemoteStreamClient>,
    correlation_key: String,
    input: String,
    ceiling: Duration,
    tx: RelaySender,
    cancel: CancellationToken,
}

impl UpstreamConsumer {
    pub fn new(
        session_id: Uuid,
        client: Arc<dyn RemoteStreamClient>,
        correlation_key: impl Into<String>,
        input: impl Into<String>,
        ceiling: Duration,
        tx: RelaySender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            client,
            correlation_key: correlation_key.into(),
            input: input.into(),
            ceiling,
            tx,
            cancel,
        }
    }

    /// Run the consumer on its own tokio task
    pub fn spawn(self) -> JoinHandle<ConsumerReport> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> ConsumerReport {
        let started = Instant::now();
        let mut state = DriveState::default();

        debug!(
            session_id = %self.session_id,
            correlation_key = %self.correlation_key,
            ceiling_secs = self.ceiling.as_secs_f64(),
            "Upstream consumer starting"
        );

        let outcome = {
            let drive = AssertUnwindSafe(state.drive(
                self.client.as_ref(),
                &self.correlation_key,
                &self.input,
                &self.tx,
            ))
            .catch_unwind();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => ConsumerOutcome::Cancelled,
                result = tokio::time::timeout(self.ceiling, drive) => match result {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(panic)) => ConsumerOutcome::Panicked(panic_message(panic.as_ref())),
                    Err(_) => ConsumerOutcome::TimedOut,
                },
            }
        };

        // Cleanup runs on every path from here on
        if let Some(handle) = state.handle.as_mut() {
            handle.close().await;
        }

        let failure = match &outcome {
            ConsumerOutcome::Failed(failure) => Some(failure.clone()),
            ConsumerOutcome::TimedOut => Some(RelayFailure::Timeout {
                ceiling: self.ceiling,
            }),
            ConsumerOutcome::Panicked(_) => Some(RelayFailure::WorkerLost),
            _ => None,
        };
        if let Some(failure) = failure {
            self.deliver(QueueEntry::Unit(StreamUnit::Error(failure))).await;
        }
        self.deliver(QueueEntry::Terminal).await;

        let report = ConsumerReport {
            outcome,
            units_relayed: state.relayed,
            duplicates_suppressed: state.dedup.suppressed_count(),
            units_dropped: state.dropped,
            elapsed: started.elapsed(),
        };
        self.log_report(&report);
        report
    }

    /// Push a cleanup entry; never waits once the session is cancelled
    async fn deliver(&self, entry: QueueEntry) {
        if self.cancel.is_cancelled() {
            let _ = self.tx.try_push(entry);
            return;
        }
        tokio::select! {
            result = self.tx.push(entry.clone()) => {
                if result.is_err() {
                    debug!(session_id = %self.session_id, "Relay loop already gone, dropping cleanup entry");
                }
            }
            _ = self.cancel.cancelled() => {
                let _ = self.tx.try_push(entry);
            }
        }
    }

    fn log_report(&self, report: &ConsumerReport) {
        let elapsed_ms = report.elapsed.as_millis() as u64;
        match &report.outcome {
            ConsumerOutcome::TimedOut => warn!(
                session_id = %self.session_id,
                correlation_key = %self.correlation_key,
                ceiling_secs = self.ceiling.as_secs_f64(),
                units_relayed = report.units_relayed,
                "Upstream stream exceeded its time ceiling"
            ),
            ConsumerOutcome::Failed(failure) => warn!(
                session_id = %self.session_id,
                correlation_key = %self.correlation_key,
                error = %failure,
                units_relayed = report.units_relayed,
                "Upstream stream failed"
            ),
            ConsumerOutcome::Panicked(message) => error!(
                session_id = %self.session_id,
                correlation_key = %self.correlation_key,
                panic = %message,
                "Upstream consumer panicked"
            ),
            _ => {}
        }

        info!(
            session_id = %self.session_id,
            correlation_key = %self.correlation_key,
            outcome = report.outcome.as_str(),
            units_relayed = report.units_relayed,
            duplicates_suppressed = report.duplicates_suppressed,
            units_dropped = report.units_dropped,
            elapsed_ms,
            "Upstream consumer finished"
        );
    }
}

#[derive(Default)]
struct DriveState {
    handle: Option<Box<dyn UpstreamStream>>,
    dedup: Deduplicator,
    relayed: usize,
    dropped: usize,
}

impl DriveState {
    async fn drive(
        &mut self,
        client: &dyn RemoteStreamClient,
        correlation_key: &str,
        input: &str,
        tx: &RelaySender,
    ) -> ConsumerOutcome {
        let stream = match client.open_stream(correlation_key, input).await {
            Ok(stream) => self.handle.insert(stream),
            Err(e) => return ConsumerOutcome::Failed(RelayFailure::Upstream(e.to_string())),
        };

        while let Some(next) = stream.next_unit().await {
            let raw = match next {
                Ok(raw) => raw,
                Err(e) => return ConsumerOutcome::Failed(RelayFailure::Upstream(e.to_string())),
            };

            let Some(unit) = classify(&raw) else {
                self.dropped += 1;
                continue;
            };

            let unit = match unit {
                StreamUnit::TextDelta(text) => {
                    if !self.dedup.should_relay_text(&text) {
                        debug!(len = text.len(), "Suppressed duplicate text fragment");
                        continue;
                    }
                    StreamUnit::TextDelta(text)
                }
                StreamUnit::Component(mut payload) => {
                    if !self.dedup.should_relay_component(&payload) {
                        debug!(component_id = %payload.id, "Suppressed duplicate component");
                        continue;
                    }
                    payload.items = extract_documents(&payload);
                    StreamUnit::Component(payload)
                }
                StreamUnit::Heartbeat => continue,
                StreamUnit::Complete(_) => return ConsumerOutcome::Finished,
                StreamUnit::Error(failure) => return ConsumerOutcome::Failed(failure),
            };

            if tx.push(QueueEntry::Unit(unit)).await.is_err() {
                return ConsumerOutcome::Abandoned;
            }
            self.relayed += 1;
        }

        ConsumerOutcome::Finished
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
