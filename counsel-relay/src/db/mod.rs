//! Relay database access
//!
//! UUIDs and timestamps are stored as TEXT (RFC 3339); JSON columns hold
//! serialized strings.

pub mod conversations;
pub mod sessions;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use counsel_common::db::MessageRole;
use counsel_common::{Error, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::relay::{Persistence, SessionAggregate, SummaryUpdate};

/// SQLite-backed [`Persistence`]
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn record_session(&self, aggregate: &SessionAggregate) -> Result<()> {
        sessions::record_session(&self.pool, aggregate).await
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Value,
    ) -> Result<()> {
        conversations::append_message(&self.pool, conversation_id, role, content, &metadata).await
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        update: SummaryUpdate,
    ) -> Result<()> {
        conversations::update_summary(&self.pool, conversation_id, &update).await
    }
}

pub(crate) fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelaySession, SessionAggregator};
    use counsel_common::db::init_memory_database;
    use std::sync::Arc;

    /// Starts another turn on the same conversation right after the
    /// assistant reply is stored
    struct ConcurrentTurn {
        inner: SqlitePersistence,
        pool: SqlitePool,
    }

    #[async_trait]
    impl Persistence for ConcurrentTurn {
        async fn record_session(&self, aggregate: &SessionAggregate) -> Result<()> {
            self.inner.record_session(aggregate).await
        }

        async fn append_message(
            &self,
            conversation_id: Uuid,
            role: MessageRole,
            content: &str,
            metadata: Value,
        ) -> Result<()> {
            self.inner
                .append_message(conversation_id, role, content, metadata)
                .await?;
            conversations::begin_turn(&self.pool, conversation_id, "Second question").await
        }

        async fn update_conversation_summary(
            &self,
            conversation_id: Uuid,
            update: SummaryUpdate,
        ) -> Result<()> {
            self.inner.update_conversation_summary(conversation_id, update).await
        }
    }

    #[tokio::test]
    async fn test_message_count_survives_overlapping_turns() {
        let pool = init_memory_database().await.unwrap();
        let conversation = conversations::create_conversation(&pool).await.unwrap();
        conversations::begin_turn(&pool, conversation.id, "First question").await.unwrap();

        let aggregator = SessionAggregator::new(Arc::new(ConcurrentTurn {
            inner: SqlitePersistence::new(pool.clone()),
            pool: pool.clone(),
        }));
        let mut session = RelaySession::new(
            Some(conversation.id),
            conversation.upstream_key.clone(),
            "First question",
        );
        session.append_text("First answer");
        session.mark_completed();
        aggregator.finalize(session).await;

        let messages = conversations::list_messages(&pool, conversation.id).await.unwrap();
        let stored = conversations::get_conversation(&pool, conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(stored.message_count, 3);
        assert_eq!(stored.title.as_deref(), Some("First question"));
    }
}
