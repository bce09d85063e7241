//! Server-Sent Events (SSE) wire frames
//!
//! Every frame written to a browser during a relay session is one of:
//! - a heartbeat comment (`: heartbeat`), sent while upstream is silent
//! - a `chunk` data frame carrying one relayed fragment
//! - a terminal `complete` or `error` data frame (`"done": true`)

use axum::response::sse::Event;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Comment text used for heartbeat frames
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// Reference to a document surfaced by a successful upstream component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub name: String,
    #[serde(rename = "fileUrl", alias = "file_url")]
    pub file_url: String,
}

impl DocumentRef {
    pub fn new(name: impl Into<String>, file_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_url: file_url.into(),
        }
    }
}

/// Component details attached to a `chunk` frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentChunk {
    pub id: String,
    pub status: String,
    pub related_documents: Vec<DocumentRef>,
}

/// JSON body of a `data:` frame
///
/// Serialized with an internal `type` tag so the browser can switch on
/// `frame.type` without inspecting the SSE event name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FramePayload {
    Chunk {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        component: Option<ComponentChunk>,
        done: bool,
    },
    Complete {
        question: String,
        success: bool,
        response_time: f64,
        related_documents: Vec<DocumentRef>,
        done: bool,
    },
    Error {
        message: String,
        done: bool,
    },
}

/// One frame of the relay's SSE response
#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    /// Comment line keeping idle proxies from closing the connection
    Heartbeat,
    /// `data:` line carrying a JSON payload
    Data(FramePayload),
}

impl SseFrame {
    pub fn heartbeat() -> Self {
        SseFrame::Heartbeat
    }

    /// Text fragment frame
    pub fn chunk(content: impl Into<String>) -> Self {
        SseFrame::Data(FramePayload::Chunk {
            content: content.into(),
            component: None,
            done: false,
        })
    }

    /// Component frame (empty text content plus component details)
    pub fn component(component: ComponentChunk) -> Self {
        SseFrame::Data(FramePayload::Chunk {
            content: String::new(),
            component: Some(component),
            done: false,
        })
    }

    /// Terminal success frame
    ///
    /// `response_time` is rounded to two decimal places (seconds).
    pub fn complete(
        question: impl Into<String>,
        success: bool,
        response_time: f64,
        related_documents: Vec<DocumentRef>,
    ) -> Self {
        SseFrame::Data(FramePayload::Complete {
            question: question.into(),
            success,
            response_time: (response_time * 100.0).round() / 100.0,
            related_documents,
            done: true,
        })
    }

    /// Terminal failure frame
    pub fn error(message: impl Into<String>) -> Self {
        SseFrame::Data(FramePayload::Error {
            message: message.into(),
            done: true,
        })
    }

    /// True for `complete` and `error` frames
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SseFrame::Data(FramePayload::Complete { .. } | FramePayload::Error { .. })
        )
    }

    /// Serialized JSON payload, or `None` for heartbeats
    pub fn payload_json(&self) -> Option<String> {
        match self {
            SseFrame::Heartbeat => None,
            SseFrame::Data(payload) => match serde_json::to_string(payload) {
                Ok(json) => Some(json),
                Err(e) => {
                    warn!("SSE: Failed to serialize frame payload: {}", e);
                    Some(r#"{"type":"error","message":"frame serialization failed","done":true}"#.to_string())
                }
            },
        }
    }

    /// Exact bytes this frame occupies on the wire
    pub fn encode(&self) -> String {
        match self.payload_json() {
            None => format!(": {}\n\n", HEARTBEAT_COMMENT),
            Some(json) => format!("data: {}\n\n", json),
        }
    }

    /// Convert into an axum SSE event
    pub fn to_event(&self) -> Event {
        match self.payload_json() {
            None => Event::default().comment(HEARTBEAT_COMMENT),
            Some(json) => Event::default().data(json),
        }
    }
}
