//! Streaming chat endpoint
//!
//! `POST /api/chat/stream` answers with an SSE stream of `chunk` frames and
//! exactly one terminal `complete` or `error` frame. The relay itself runs on
//! a spawned task and writes frames into a bounded channel whose receiving end
//! is the response body, so a client disconnect surfaces as a failed write.

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Json,
};
use counsel_common::sse::SseFrame;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use crate::db::conversations;
use crate::relay::{self, RelaySession};
use crate::{ApiError, ApiResult, AppState};

/// Frames buffered between the relay task and the response body
const FRAME_BUFFER: usize = 32;

const CONVERSATION_ID_HEADER: &str = "x-conversation-id";
const SESSION_ID_HEADER: &str = "x-session-id";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    /// Continue an existing conversation; a new one is created when absent
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
}

/// POST /api/chat/stream
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("question must not be empty".to_string()));
    }
    if state.relay.shutdown.is_cancelled() {
        return Err(ApiError::Unavailable("Server is shutting down".to_string()));
    }

    let conversation = match request.conversation_id {
        Some(id) => conversations::get_conversation(&state.db, id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("Conversation {}", id)))?,
        None => conversations::create_conversation(&state.db).await?,
    };
    conversations::begin_turn(&state.db, conversation.id, question).await?;

    let session = RelaySession::new(
        Some(conversation.id),
        conversation.upstream_key.clone(),
        question,
    );
    let session_id = session.session_id;

    info!(
        session_id = %session_id,
        conversation_id = %conversation.id,
        correlation_key = %conversation.upstream_key,
        turn = conversation.message_count / 2 + 1,
        "Relay session started"
    );

    let (frame_tx, frame_rx) = mpsc::channel::<SseFrame>(FRAME_BUFFER);
    let guard = state.track_session();
    let ctx = state.relay.clone();
    tokio::spawn(async move {
        let _guard = guard;
        relay::run_relay(ctx, session, frame_tx).await;
    });

    let stream = ReceiverStream::new(frame_rx)
        .map(|frame| Ok::<Event, Infallible>(frame.to_event()));

    let headers = [
        (HeaderName::from_static(CONVERSATION_ID_HEADER), header_value(conversation.id)?),
        (HeaderName::from_static(SESSION_ID_HEADER), header_value(session_id)?),
    ];

    Ok((headers, Sse::new(stream)))
}

fn header_value(id: Uuid) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&id.to_string())
        .map_err(|e| ApiError::Internal(format!("Invalid header value: {}", e)))
}
