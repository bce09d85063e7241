//! Relay session aggregate records

use counsel_common::sse::DocumentRef;
use counsel_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::relay::SessionAggregate;

/// Stored form of a [`SessionAggregate`]
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub conversation_id: Option<String>,
    pub correlation_key: String,
    pub question: String,
    pub status: String,
    pub success: bool,
    pub response_text: String,
    pub related_documents: Vec<DocumentRef>,
    pub failure: Option<String>,
    pub response_time: f64,
}

/// Insert the aggregate for a finished session
///
/// A session id is only ever recorded once; a second insert is a database error.
pub async fn record_session(pool: &SqlitePool, aggregate: &SessionAggregate) -> Result<()> {
    let related_documents = serde_json::to_string(&aggregate.related_documents)?;

    sqlx::query(
        r#"
        INSERT INTO relay_sessions (
            session_id, conversation_id, correlation_key, question, status,
            success, response_text, related_documents, failure, response_time,
            started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(aggregate.session_id.to_string())
    .bind(aggregate.conversation_id.map(|id| id.to_string()))
    .bind(&aggregate.correlation_key)
    .bind(&aggregate.question)
    .bind(aggregate.status.as_str())
    .bind(aggregate.success)
    .bind(&aggregate.response_text)
    .bind(related_documents)
    .bind(aggregate.failure.as_deref())
    .bind(aggregate.response_time)
    .bind(aggregate.started_at.to_rfc3339())
    .bind(aggregate.ended_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_session(pool: &SqlitePool, session_id: Uuid) -> Result<Option<SessionRecord>> {
    let row = sqlx::query(
        r#"
        SELECT conversation_id, correlation_key, question, status, success,
               response_text, related_documents, failure, response_time
        FROM relay_sessions
        WHERE session_id = ?
        "#,
    )
    .bind(session_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let related_documents: String = row.get("related_documents");
    Ok(Some(SessionRecord {
        session_id,
        conversation_id: row.get("conversation_id"),
        correlation_key: row.get("correlation_key"),
        question: row.get("question"),
        status: row.get("status"),
        success: row.get("success"),
        response_text: row.get("response_text"),
        related_documents: serde_json::from_str(&related_documents)?,
        failure: row.get("failure"),
        response_time: row.get("response_time"),
    }))
}

/// Number of recorded sessions, optionally limited to one correlation key
pub async fn count_sessions(pool: &SqlitePool, correlation_key: Option<&str>) -> Result<i64> {
    let count: i64 = match correlation_key {
        Some(key) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM relay_sessions WHERE correlation_key = ?")
                .bind(key)
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM relay_sessions")
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}
