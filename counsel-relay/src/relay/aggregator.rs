//! Session aggregation and persistence
//!
//! Runs once per relay session after the relay loop has written its last
//! frame. Failures here are logged and never reach the client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use counsel_common::db::MessageRole;
use counsel_common::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::session::{RelaySession, SessionAggregate};

/// Title length limit (characters) before the ellipsis
pub const TITLE_MAX_CHARS: usize = 30;

/// Conversation summary changes after one turn
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryUpdate {
    /// Added to the stored message count
    pub messages_added: i64,
    pub last_activity: DateTime<Utc>,
    /// Applied only while the conversation has no title
    pub title: Option<String>,
}

/// Storage collaborator of the aggregator
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store the per-session aggregate record
    async fn record_session(&self, aggregate: &SessionAggregate) -> Result<()>;

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Value,
    ) -> Result<()>;

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        update: SummaryUpdate,
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct SessionAggregator {
    persistence: Arc<dyn Persistence>,
}

impl SessionAggregator {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Consume the session and persist its aggregate
    pub async fn finalize(&self, session: RelaySession) -> SessionAggregate {
        let aggregate = session.into_aggregate();

        if let Err(e) = self.persistence.record_session(&aggregate).await {
            error!(
                session_id = %aggregate.session_id,
                error = %e,
                "Failed to record relay session"
            );
        }

        if aggregate.success {
            if let Some(conversation_id) = aggregate.conversation_id {
                if let Err(e) = self.record_turn(conversation_id, &aggregate).await {
                    error!(
                        session_id = %aggregate.session_id,
                        conversation_id = %conversation_id,
                        error = %e,
                        "Failed to store assistant reply"
                    );
                }
            }
        }

        info!(
            session_id = %aggregate.session_id,
            correlation_key = %aggregate.correlation_key,
            status = aggregate.status.as_str(),
            success = aggregate.success,
            response_chars = aggregate.response_text.chars().count(),
            documents = aggregate.related_documents.len(),
            response_time = aggregate.response_time,
            "Relay session summary"
        );

        aggregate
    }

    async fn record_turn(&self, conversation_id: Uuid, aggregate: &SessionAggregate) -> Result<()> {
        let mut messages_added = 0;
        if aggregate.response_text.is_empty() && aggregate.related_documents.is_empty() {
            debug!(
                session_id = %aggregate.session_id,
                "Nothing was relayed, skipping assistant message"
            );
        } else {
            let metadata = json!({
                "session_id": aggregate.session_id,
                "response_time": aggregate.response_time,
                "related_documents": aggregate.related_documents,
                "status": aggregate.status,
            });
            self.persistence
                .append_message(
                    conversation_id,
                    MessageRole::Assistant,
                    &aggregate.response_text,
                    metadata,
                )
                .await?;
            messages_added = 1;
        }

        self.persistence
            .update_conversation_summary(
                conversation_id,
                SummaryUpdate {
                    messages_added,
                    last_activity: aggregate.ended_at,
                    title: derive_title(&aggregate.question),
                },
            )
            .await
    }
}

/// Conversation title from the first question
///
/// At most [`TITLE_MAX_CHARS`] characters, with `...` appended when cut.
pub fn derive_title(question: &str) -> Option<String> {
    let question = question.trim();
    if question.is_empty() {
        return None;
    }
    if question.chars().count() <= TITLE_MAX_CHARS {
        return Some(question.to_string());
    }
    let mut title: String = question.chars().take(TITLE_MAX_CHARS).collect();
    title.push_str("...");
    Some(title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::types::RelayFailure;
    use counsel_common::Error;
    use std::sync::Mutex;

    #[test]
    fn test_short_question_is_title() {
        assert_eq!(derive_title("  What is Law A?  ").as_deref(), Some("What is Law A?"));
        assert_eq!(derive_title("   "), None);
    }

    #[test]
    fn test_long_question_is_truncated_by_chars() {
        let question = "é".repeat(40);
        let title = derive_title(&question).unwrap();
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
        assert!(title.ends_with("..."));

        let exact = "x".repeat(TITLE_MAX_CHARS);
        assert_eq!(derive_title(&exact), Some(exact.clone()));
    }

    #[derive(Default)]
    struct FlakyPersistence {
        calls: Mutex<Vec<&'static str>>,
        updates: Mutex<Vec<SummaryUpdate>>,
    }

    #[async_trait]
    impl Persistence for FlakyPersistence {
        async fn record_session(&self, _aggregate: &SessionAggregate) -> Result<()> {
            self.calls.lock().unwrap().push("record_session");
            Err(Error::Internal("disk full".to_string()))
        }

        async fn append_message(
            &self,
            _conversation_id: Uuid,
            _role: MessageRole,
            _content: &str,
            _metadata: Value,
        ) -> Result<()> {
            self.calls.lock().unwrap().push("append_message");
            Ok(())
        }

        async fn update_conversation_summary(
            &self,
            _conversation_id: Uuid,
            update: SummaryUpdate,
        ) -> Result<()> {
            self.calls.lock().unwrap().push("update_conversation_summary");
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_persistence_failures_are_contained() {
        let persistence = Arc::new(FlakyPersistence::default());
        let aggregator = SessionAggregator::new(persistence.clone());

        let mut session = RelaySession::new(Some(Uuid::new_v4()), "key", "q");
        session.append_text("answer");
        session.mark_completed();

        let aggregate = aggregator.finalize(session).await;
        assert!(aggregate.success);
        assert_eq!(
            *persistence.calls.lock().unwrap(),
            vec!["record_session", "append_message", "update_conversation_summary"]
        );
    }

    #[tokio::test]
    async fn test_failed_session_skips_conversation_update() {
        let persistence = Arc::new(FlakyPersistence::default());
        let aggregator = SessionAggregator::new(persistence.clone());

        let mut session = RelaySession::new(Some(Uuid::new_v4()), "key", "q");
        session.append_text("partial");
        session.mark_failed(RelayFailure::Shutdown);

        let aggregate = aggregator.finalize(session).await;
        assert!(!aggregate.success);
        assert_eq!(*persistence.calls.lock().unwrap(), vec!["record_session"]);
    }

    #[tokio::test]
    async fn test_empty_turn_still_refreshes_summary() {
        let persistence = Arc::new(FlakyPersistence::default());
        let aggregator = SessionAggregator::new(persistence.clone());

        let mut session = RelaySession::new(Some(Uuid::new_v4()), "key", "What is Law A?");
        session.mark_completed();

        let aggregate = aggregator.finalize(session).await;
        assert!(aggregate.success);
        assert_eq!(
            *persistence.calls.lock().unwrap(),
            vec!["record_session", "update_conversation_summary"]
        );

        let updates = persistence.updates.lock().unwrap();
        assert_eq!(updates[0].messages_added, 0);
        assert_eq!(updates[0].last_activity, aggregate.ended_at);
        assert_eq!(updates[0].title.as_deref(), Some("What is Law A?"));
    }
}
