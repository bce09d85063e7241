//! Bounded FIFO handoff between the upstream worker and the SSE relay loop

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::QueueEntry;

/// Receiver side has been dropped (relay loop finished or client gone)
#[derive(Debug, Error, PartialEq, Eq)]
#[error("relay channel receiver dropped")]
pub struct ChannelClosed;

/// Result of a bounded-wait pop
#[derive(Debug, PartialEq)]
pub enum Popped {
    Entry(QueueEntry),
    /// Nothing arrived within the wait
    TimedOut,
    /// All senders dropped and the buffer is drained
    Closed,
}

/// Create a relay channel holding at most `capacity` entries
pub fn relay_channel(capacity: usize) -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RelaySender { tx }, RelayReceiver { rx })
}

/// Producer handle, owned by the upstream worker
#[derive(Debug)]
pub struct RelaySender {
    tx: mpsc::Sender<QueueEntry>,
}

impl RelaySender {
    /// Push an entry, waiting for capacity if the buffer is full
    pub async fn push(&self, entry: QueueEntry) -> Result<(), ChannelClosed> {
        self.tx.send(entry).await.map_err(|_| ChannelClosed)
    }

    /// Push without waiting; fails when full or closed
    pub fn try_push(&self, entry: QueueEntry) -> Result<(), ChannelClosed> {
        self.tx.try_send(entry).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer handle, owned by the SSE relay loop
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::Receiver<QueueEntry>,
}

impl RelayReceiver {
    /// Pop the next entry, waiting at most `timeout`
    pub async fn pop(&mut self, timeout: Duration) -> Popped {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(entry)) => Popped::Entry(entry),
            Ok(None) => Popped::Closed,
            Err(_) => Popped::TimedOut,
        }
    }
}
