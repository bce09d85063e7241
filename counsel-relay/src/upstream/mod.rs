//! Remote AI streaming API client abstraction
//!
//! The relay talks to the remote service only through [`RemoteStreamClient`]
//! and the [`UpstreamStream`] handle it returns, so tests can substitute a
//! scripted client.

mod http_client;

pub use http_client::{HttpStreamClient, LineDecoder};

use async_trait::async_trait;
use thiserror::Error;

use crate::relay::types::RawUnit;

/// Upstream client errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    /// Request could not be sent (DNS, connect, TLS)
    #[error("Connection error: {0}")]
    Connect(String),

    /// Remote service answered with a non-success status
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    /// Stream broke while reading the body
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Factory for upstream streams
///
/// `open_stream` has create-or-resume semantics on `correlation_key`: an
/// unseen key starts a new upstream context, a reused key continues it.
#[async_trait]
pub trait RemoteStreamClient: Send + Sync {
    async fn open_stream(
        &self,
        correlation_key: &str,
        input: &str,
    ) -> Result<Box<dyn UpstreamStream>, UpstreamError>;
}

/// One open upstream stream
#[async_trait]
pub trait UpstreamStream: Send {
    /// Next raw unit, `None` at end of stream
    async fn next_unit(&mut self) -> Option<Result<RawUnit, UpstreamError>>;

    /// Release the underlying connection (idempotent)
    async fn close(&mut self);
}
