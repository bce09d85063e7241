//! Conversation and message queries

use chrono::Utc;
use counsel_common::db::{Conversation, MessageRole, StoredMessage};
use counsel_common::{Error, Result};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::parse_timestamp;
use crate::relay::SummaryUpdate;

/// Create an empty conversation with a fresh upstream correlation key
pub async fn create_conversation(pool: &SqlitePool) -> Result<Conversation> {
    let now = Utc::now();
    let conversation = Conversation {
        id: Uuid::new_v4(),
        upstream_key: Uuid::new_v4().to_string(),
        title: None,
        message_count: 0,
        created_at: now,
        last_activity: now,
    };

    sqlx::query(
        r#"
        INSERT INTO conversations (id, upstream_key, title, message_count, created_at, last_activity)
        VALUES (?, ?, NULL, 0, ?, ?)
        "#,
    )
    .bind(conversation.id.to_string())
    .bind(&conversation.upstream_key)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(conversation)
}

pub async fn get_conversation(pool: &SqlitePool, id: Uuid) -> Result<Option<Conversation>> {
    let row = sqlx::query(
        r#"
        SELECT id, upstream_key, title, message_count, created_at, last_activity
        FROM conversations
        WHERE id = ?
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| conversation_from_row(&row)).transpose()
}

/// Append a message at the end of the conversation history
pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: Uuid,
    role: MessageRole,
    content: &str,
    metadata: &Value,
) -> Result<()> {
    let metadata = serde_json::to_string(metadata)?;

    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, seq, role, content, metadata, created_at)
        SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?
        FROM messages
        WHERE conversation_id = ?
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id.to_string())
    .bind(role.as_str())
    .bind(content)
    .bind(metadata)
    .bind(Utc::now().to_rfc3339())
    .bind(conversation_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Messages of a conversation in insertion order
pub async fn list_messages(pool: &SqlitePool, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT id, conversation_id, role, content, metadata, created_at
        FROM messages
        WHERE conversation_id = ?
        ORDER BY seq ASC
        "#,
    )
    .bind(conversation_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(message_from_row).collect()
}

/// Store the user's question and bump the conversation counters
pub async fn begin_turn(pool: &SqlitePool, conversation_id: Uuid, question: &str) -> Result<()> {
    append_message(
        pool,
        conversation_id,
        MessageRole::User,
        question,
        &Value::Object(Default::default()),
    )
    .await?;

    sqlx::query(
        r#"
        UPDATE conversations
        SET message_count = message_count + 1, last_activity = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(conversation_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Apply a turn's summary changes in one statement
///
/// The count is incremented in place so concurrent turns on the same
/// conversation never overwrite each other. An existing title is kept.
pub async fn update_summary(pool: &SqlitePool, conversation_id: Uuid, update: &SummaryUpdate) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE conversations
        SET message_count = message_count + ?, last_activity = ?, title = COALESCE(title, ?)
        WHERE id = ?
        "#,
    )
    .bind(update.messages_added)
    .bind(update.last_activity.to_rfc3339())
    .bind(update.title.as_deref())
    .bind(conversation_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Conversation {}", conversation_id)));
    }
    Ok(())
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let id: String = row.get("id");
    let created_at: String = row.get("created_at");
    let last_activity: String = row.get("last_activity");

    Ok(Conversation {
        id: parse_uuid(&id)?,
        upstream_key: row.get("upstream_key"),
        title: row.get("title"),
        message_count: row.get("message_count"),
        created_at: parse_timestamp(&created_at, "created_at")?,
        last_activity: parse_timestamp(&last_activity, "last_activity")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let id: String = row.get("id");
    let conversation_id: String = row.get("conversation_id");
    let role: String = row.get("role");
    let metadata: String = row.get("metadata");
    let created_at: String = row.get("created_at");

    Ok(StoredMessage {
        id: parse_uuid(&id)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: role.parse()?,
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_timestamp(&created_at, "created_at")?,
    })
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid UUID '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_common::db::init_memory_database;
    use serde_json::json;

    #[tokio::test]
    async fn test_turn_bookkeeping() {
        let pool = init_memory_database().await.unwrap();
        let conversation = create_conversation(&pool).await.unwrap();
        assert_ne!(conversation.upstream_key, conversation.id.to_string());

        begin_turn(&pool, conversation.id, "First question").await.unwrap();
        append_message(
            &pool,
            conversation.id,
            MessageRole::Assistant,
            "First answer",
            &json!({"response_time": 1.5}),
        )
        .await
        .unwrap();

        let messages = list_messages(&pool, conversation.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "First question");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].metadata["response_time"], json!(1.5));

        let stored = get_conversation(&pool, conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 1);
        assert!(stored.title.is_none());
    }

    #[tokio::test]
    async fn test_update_summary_keeps_existing_title() {
        let pool = init_memory_database().await.unwrap();
        let conversation = create_conversation(&pool).await.unwrap();

        let first = SummaryUpdate {
            messages_added: 1,
            last_activity: Utc::now(),
            title: Some("First".to_string()),
        };
        update_summary(&pool, conversation.id, &first).await.unwrap();

        let second = SummaryUpdate {
            messages_added: 1,
            last_activity: Utc::now(),
            title: Some("Second".to_string()),
        };
        update_summary(&pool, conversation.id, &second).await.unwrap();

        let stored = get_conversation(&pool, conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 2);
        assert_eq!(stored.title.as_deref(), Some("First"));
    }

    #[tokio::test]
    async fn test_update_summary_counts_turns_started_meanwhile() {
        let pool = init_memory_database().await.unwrap();
        let conversation = create_conversation(&pool).await.unwrap();

        begin_turn(&pool, conversation.id, "First question").await.unwrap();
        // A second request starts its turn before the first reply is summarized
        begin_turn(&pool, conversation.id, "Second question").await.unwrap();

        let update = SummaryUpdate {
            messages_added: 1,
            last_activity: Utc::now(),
            title: None,
        };
        update_summary(&pool, conversation.id, &update).await.unwrap();

        let stored = get_conversation(&pool, conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 3);
        assert!(stored.title.is_none());
    }

    #[tokio::test]
    async fn test_update_summary_unknown_conversation() {
        let pool = init_memory_database().await.unwrap();
        let update = SummaryUpdate {
            messages_added: 1,
            last_activity: Utc::now(),
            title: None,
        };
        let err = update_summary(&pool, Uuid::new_v4(), &update).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(get_conversation(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}
