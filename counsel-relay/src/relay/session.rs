//! Relay session state
//!
//! A [`RelaySession`] is created per request, mutated only by the SSE relay
//! loop, and consumed exactly once by [`RelaySession::into_aggregate`].

use chrono::{DateTime, Utc};
use counsel_common::sse::DocumentRef;
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::types::RelayFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Streaming,
    Completed,
    Failed,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Streaming => "streaming",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug)]
pub struct RelaySession {
    pub session_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub correlation_key: String,
    pub question: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    accumulated_text: String,
    documents: Vec<DocumentRef>,
    status: SessionStatus,
    failure: Option<RelayFailure>,
}

impl RelaySession {
    pub fn new(
        conversation_id: Option<Uuid>,
        correlation_key: impl Into<String>,
        question: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            conversation_id,
            correlation_key: correlation_key.into(),
            question: question.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            accumulated_text: String::new(),
            documents: Vec::new(),
            status: SessionStatus::Streaming,
            failure: None,
        }
    }

    pub fn append_text(&mut self, fragment: &str) {
        self.accumulated_text.push_str(fragment);
    }

    /// Merge document refs, deduplicated by name
    ///
    /// A repeated name replaces the stored URL but keeps its original position.
    pub fn merge_documents(&mut self, refs: &[DocumentRef]) {
        for doc in refs {
            match self.documents.iter_mut().find(|d| d.name == doc.name) {
                Some(existing) => existing.file_url = doc.file_url.clone(),
                None => self.documents.push(doc.clone()),
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn documents(&self) -> &[DocumentRef] {
        &self.documents
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn failure(&self) -> Option<&RelayFailure> {
        self.failure.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
    }

    pub fn mark_failed(&mut self, failure: RelayFailure) {
        self.status = SessionStatus::Failed;
        self.failure = Some(failure);
    }

    pub fn mark_disconnected(&mut self) {
        self.status = SessionStatus::Disconnected;
    }

    /// Consume the session into its persisted aggregate
    pub fn into_aggregate(self) -> SessionAggregate {
        let response_time = (self.elapsed_secs() * 100.0).round() / 100.0;
        let success = matches!(
            self.status,
            SessionStatus::Completed | SessionStatus::Disconnected
        );
        SessionAggregate {
            session_id: self.session_id,
            conversation_id: self.conversation_id,
            correlation_key: self.correlation_key,
            question: self.question,
            status: self.status,
            success,
            response_text: self.accumulated_text,
            related_documents: self.documents,
            failure: self.failure.map(|f| f.to_string()),
            response_time,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }
}

/// Final record of one relay session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAggregate {
    pub session_id: Uuid,
    pub conversation_id: Option<Uuid>,
    pub correlation_key: String,
    pub question: String,
    pub status: SessionStatus,
    pub success: bool,
    pub response_text: String,
    pub related_documents: Vec<DocumentRef>,
    pub failure: Option<String>,
    /// Seconds, two decimal places
    pub response_time: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documents_deduplicated_by_name() {
        let mut session = RelaySession::new(None, "key", "q");
        session.merge_documents(&[
            DocumentRef::new("Law A", "http://x/a1"),
            DocumentRef::new("Law B", "http://x/b"),
        ]);
        session.merge_documents(&[
            DocumentRef::new("Law C", "http://x/c"),
            DocumentRef::new("Law A", "http://x/a2"),
        ]);

        assert_eq!(
            session.documents(),
            &[
                DocumentRef::new("Law A", "http://x/a2"),
                DocumentRef::new("Law B", "http://x/b"),
                DocumentRef::new("Law C", "http://x/c"),
            ]
        );
    }

    #[test]
    fn test_failed_session_aggregate_keeps_partial_text() {
        let mut session = RelaySession::new(Some(Uuid::new_v4()), "key", "q");
        session.append_text("one ");
        session.append_text("two");
        session.mark_failed(RelayFailure::Upstream("boom".to_string()));

        let aggregate = session.into_aggregate();
        assert_eq!(aggregate.response_text, "one two");
        assert!(!aggregate.success);
        assert_eq!(aggregate.status, SessionStatus::Failed);
        assert_eq!(aggregate.failure.as_deref(), Some("Upstream error: boom"));
        assert!(aggregate.ended_at >= aggregate.started_at);
    }

    #[test]
    fn test_disconnect_counts_as_success() {
        let mut session = RelaySession::new(None, "key", "q");
        session.mark_disconnected();
        let aggregate = session.into_aggregate();
        assert!(aggregate.success);
        assert_eq!(aggregate.status.as_str(), "disconnected");
        assert!(aggregate.failure.is_none());
    }
}
