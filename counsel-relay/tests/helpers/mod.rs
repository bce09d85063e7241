//! Shared test doubles for relay integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use counsel_common::config::RelayConfig;
use counsel_common::db::{Conversation, MessageRole};
use counsel_common::sse::{FramePayload, SseFrame};
use counsel_common::Result;
use counsel_relay::relay::types::RawUnit;
use counsel_relay::relay::{Persistence, SessionAggregate, SummaryUpdate};
use counsel_relay::upstream::{RemoteStreamClient, UpstreamError, UpstreamStream};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// One scripted upstream behaviour
#[derive(Debug, Clone)]
pub enum Step {
    Unit(RawUnit),
    Fail(String),
    Delay(Duration),
    /// Never yields again
    Hang,
}

pub fn unit(raw: Value) -> Step {
    Step::Unit(raw)
}

/// Remote client replaying one script per `open_stream` call
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    opened: Mutex<Vec<(String, String)>>,
    closes: Arc<AtomicUsize>,
    closed: Arc<Notify>,
}

impl ScriptedClient {
    pub fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    pub fn single(script: Vec<Step>) -> Arc<Self> {
        Self::new(vec![script])
    }

    /// `(correlation_key, input)` of every opened stream
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Resolves once any stream has been closed
    pub async fn wait_closed(&self) {
        if self.close_count() > 0 {
            return;
        }
        self.closed.notified().await;
    }
}

#[async_trait]
impl RemoteStreamClient for ScriptedClient {
    async fn open_stream(
        &self,
        correlation_key: &str,
        input: &str,
    ) -> std::result::Result<Box<dyn UpstreamStream>, UpstreamError> {
        self.opened
            .lock()
            .unwrap()
            .push((correlation_key.to_string(), input.to_string()));

        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            steps: script.into(),
            closes: self.closes.clone(),
            closed: self.closed.clone(),
            is_closed: false,
        }))
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    closes: Arc<AtomicUsize>,
    closed: Arc<Notify>,
    is_closed: bool,
}

#[async_trait]
impl UpstreamStream for ScriptedStream {
    async fn next_unit(&mut self) -> Option<std::result::Result<RawUnit, UpstreamError>> {
        loop {
            match self.steps.pop_front()? {
                Step::Unit(raw) => return Some(Ok(raw)),
                Step::Fail(cause) => return Some(Err(UpstreamError::Transport(cause))),
                Step::Delay(wait) => tokio::time::sleep(wait).await,
                Step::Hang => std::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) {
        if !self.is_closed {
            self.is_closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.closed.notify_one();
        }
    }
}

/// In-memory persistence recording every call
pub struct RecordingPersistence {
    pub aggregates: Mutex<Vec<SessionAggregate>>,
    pub messages: Mutex<Vec<(Uuid, MessageRole, String, Value)>>,
    pub conversation: Mutex<Option<Conversation>>,
}

impl RecordingPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            aggregates: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            conversation: Mutex::new(None),
        })
    }

    /// Persistence that already knows one conversation
    pub fn with_conversation(id: Uuid) -> Arc<Self> {
        let persistence = Self::new();
        *persistence.conversation.lock().unwrap() = Some(Conversation {
            id,
            upstream_key: "conversation-key".to_string(),
            title: None,
            message_count: 1,
            created_at: Utc::now(),
            last_activity: Utc::now(),
        });
        persistence
    }

    pub fn aggregates(&self) -> Vec<SessionAggregate> {
        self.aggregates.lock().unwrap().clone()
    }
}

#[async_trait]
impl Persistence for RecordingPersistence {
    async fn record_session(&self, aggregate: &SessionAggregate) -> Result<()> {
        self.aggregates.lock().unwrap().push(aggregate.clone());
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        role: MessageRole,
        content: &str,
        metadata: Value,
    ) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((conversation_id, role, content.to_string(), metadata));
        Ok(())
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        update: SummaryUpdate,
    ) -> Result<()> {
        if let Some(conversation) = self.conversation.lock().unwrap().as_mut() {
            if conversation.id == conversation_id {
                conversation.message_count += update.messages_added;
                conversation.last_activity = update.last_activity;
                if conversation.title.is_none() {
                    conversation.title = update.title;
                }
            }
        }
        Ok(())
    }
}

/// Relay settings with short timings for tests
pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        heartbeat_interval_ms: 100,
        stream_timeout_secs: 5,
        channel_capacity: 16,
        shutdown_grace_ms: 500,
    }
}

/// Exactly one terminal frame, and it is the last one
pub fn assert_single_terminal_last(frames: &[SseFrame]) {
    let terminals: Vec<usize> = frames
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_terminal())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(terminals.len(), 1, "expected one terminal frame in {:?}", frames);
    assert_eq!(terminals[0], frames.len() - 1, "terminal frame must be last");
}

/// Text content of all chunk frames, in order
pub fn chunk_texts(frames: &[SseFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            SseFrame::Data(FramePayload::Chunk { content, component: None, .. }) => {
                Some(content.clone())
            }
            _ => None,
        })
        .collect()
}
