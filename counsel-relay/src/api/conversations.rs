//! Conversation endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use counsel_common::db::{Conversation, StoredMessage};
use serde::Serialize;
use uuid::Uuid;

use crate::db::conversations;
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
}

/// POST /api/conversations
pub async fn create_conversation(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = conversations::create_conversation(&state.db).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// GET /api/conversations/:id
pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ConversationDetail>> {
    let conversation = conversations::get_conversation(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Conversation {}", id)))?;
    let messages = conversations::list_messages(&state.db, id).await?;

    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}
