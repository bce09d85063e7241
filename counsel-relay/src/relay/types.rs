//! Normalized relay units
//!
//! Upstream payloads arrive in heterogeneous JSON shapes. The classifier
//! decodes each one into a [`StreamUnit`]; only `StreamUnit`s (and the
//! terminal sentinel) travel through the relay channel.

use counsel_common::sse::{ComponentChunk, DocumentRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// One undecoded unit as received from the remote stream
pub type RawUnit = Value;

/// Lifecycle status of an upstream component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Pending,
    Success,
    Error,
}

impl ComponentStatus {
    /// Lenient parse of an upstream status string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" | "running" | "processing" | "in_progress" => Some(ComponentStatus::Pending),
            "success" | "succeeded" | "completed" | "done" => Some(ComponentStatus::Success),
            "error" | "failed" | "failure" => Some(ComponentStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Pending => "pending",
            ComponentStatus::Success => "success",
            ComponentStatus::Error => "error",
        }
    }
}

/// Structured upstream component
///
/// `data` holds the raw items exactly as received; `items` is filled by the
/// component extractor and stays empty unless `status` is `Success`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentPayload {
    pub id: String,
    pub status: ComponentStatus,
    pub data: Vec<Value>,
    pub items: Vec<DocumentRef>,
}

impl ComponentPayload {
    pub fn new(id: impl Into<String>, status: ComponentStatus, data: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            status,
            data,
            items: Vec::new(),
        }
    }

    /// Component section of a `chunk` frame
    pub fn to_chunk(&self) -> ComponentChunk {
        ComponentChunk {
            id: self.id.clone(),
            status: self.status.as_str().to_string(),
            related_documents: self.items.clone(),
        }
    }
}

/// Why a relay session ended without success
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelayFailure {
    #[error("Request timed out: upstream stream exceeded {}s", .ceiling.as_secs_f64())]
    Timeout { ceiling: Duration },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Server is shutting down")]
    Shutdown,

    #[error("Upstream worker stopped unexpectedly")]
    WorkerLost,
}

impl RelayFailure {
    /// Short machine-readable tag stored with the session aggregate
    pub fn tag(&self) -> &'static str {
        match self {
            RelayFailure::Timeout { .. } => "timeout",
            RelayFailure::Upstream(_) => "upstream_error",
            RelayFailure::Shutdown => "shutdown",
            RelayFailure::WorkerLost => "worker_lost",
        }
    }
}

/// Normalized representation of one relayed item
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUnit {
    TextDelta(String),
    Component(ComponentPayload),
    Heartbeat,
    /// Explicit end-of-answer marker, with whatever result object came with it
    Complete(Option<Value>),
    Error(RelayFailure),
}

impl StreamUnit {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamUnit::TextDelta(_) => "text_delta",
            StreamUnit::Component(_) => "component",
            StreamUnit::Heartbeat => "heartbeat",
            StreamUnit::Complete(_) => "complete",
            StreamUnit::Error(_) => "error",
        }
    }
}

/// Entry on the relay channel
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    Unit(StreamUnit),
    /// Pushed exactly once when the upstream worker exits
    Terminal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_status_parse_is_lenient() {
        assert_eq!(ComponentStatus::parse("SUCCESS"), Some(ComponentStatus::Success));
        assert_eq!(ComponentStatus::parse(" pending "), Some(ComponentStatus::Pending));
        assert_eq!(ComponentStatus::parse("failed"), Some(ComponentStatus::Error));
        assert_eq!(ComponentStatus::parse("unknown"), None);
    }

    #[test]
    fn test_timeout_message_mentions_timeout() {
        let failure = RelayFailure::Timeout {
            ceiling: Duration::from_secs(120),
        };
        let message = failure.to_string();
        assert!(message.contains("timed out"));
        assert!(message.contains("120"));
        assert_eq!(failure.tag(), "timeout");
    }
}
