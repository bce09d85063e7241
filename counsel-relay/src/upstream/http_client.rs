//! HTTP implementation of the remote stream client
//!
//! Sends `POST <stream_url>` with `{"session_id", "input", "stream": true}` and
//! reads the response body line by line. Both SSE (`data: ...`) and NDJSON
//! bodies are accepted; `[DONE]` ends the stream.

use async_trait::async_trait;
use bytes::Bytes;
use counsel_common::config::UpstreamConfig;
use futures::stream::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::debug;

use super::{RemoteStreamClient, UpstreamError, UpstreamStream};
use crate::relay::types::RawUnit;

const USER_AGENT: &str = concat!("counsel-relay/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept from a failed upstream response
const MAX_ERROR_BODY: usize = 512;

/// Longest body line or SSE event accepted from upstream
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// reqwest-backed [`RemoteStreamClient`]
///
/// The inner `reqwest::Client` (and its connection pool) is shared by every
/// session; each `open_stream` call owns its own response body.
#[derive(Clone)]
pub struct HttpStreamClient {
    http: reqwest::Client,
    stream_url: String,
    api_key: Option<String>,
}

impl HttpStreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| UpstreamError::Connect(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            stream_url: config.stream_url(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }
}

#[async_trait]
impl RemoteStreamClient for HttpStreamClient {
    async fn open_stream(
        &self,
        correlation_key: &str,
        input: &str,
    ) -> Result<Box<dyn UpstreamStream>, UpstreamError> {
        let body = json!({
            "session_id": correlation_key,
            "input": input,
            "stream": true,
        });

        let mut request = self
            .http
            .post(&self.stream_url)
            .header(ACCEPT, "text/event-stream, application/x-ndjson")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| text.is_char_boundary(*i))
                    .unwrap_or(0);
                text.truncate(cut);
            }
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(
            correlation_key = %correlation_key,
            url = %self.stream_url,
            "Upstream stream opened"
        );

        Ok(Box::new(HttpUpstreamStream {
            body: Some(Box::pin(response.bytes_stream())),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
        }))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct HttpUpstreamStream {
    /// `None` once the body is exhausted or closed
    body: Option<ByteStream>,
    decoder: LineDecoder,
    pending: VecDeque<RawUnit>,
}

#[async_trait]
impl UpstreamStream for HttpUpstreamStream {
    async fn next_unit(&mut self) -> Option<Result<RawUnit, UpstreamError>> {
        loop {
            if let Some(unit) = self.pending.pop_front() {
                return Some(Ok(unit));
            }
            if self.decoder.is_done() {
                self.body = None;
                return None;
            }

            let body = self.body.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => match self.decoder.feed(&chunk) {
                    Ok(units) => self.pending.extend(units),
                    Err(e) => {
                        self.body = None;
                        return Some(Err(e));
                    }
                },
                Some(Err(e)) => {
                    self.body = None;
                    return Some(Err(UpstreamError::Transport(e.to_string())));
                }
                None => {
                    self.body = None;
                    match self.decoder.finish() {
                        Ok(units) => self.pending.extend(units),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the body stream aborts the HTTP response
        if self.body.take().is_some() {
            debug!("Upstream response body released");
        }
        self.pending.clear();
    }
}

/// Incremental decoder for SSE and NDJSON response bodies
///
/// - consecutive `data:` lines form one SSE event, joined with `\n` and
///   dispatched at the blank line that ends it
/// - lines without an SSE field prefix are NDJSON and decoded on their own
/// - `:` comments and the `event:`, `id:` and `retry:` fields are ignored
/// - payloads that parse as JSON yield that value, anything else a JSON string
/// - `[DONE]` marks the end; later bytes are ignored
///
/// A line or event larger than the byte cap fails the stream.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    event_data: Vec<String>,
    event_len: usize,
    max_bytes: usize,
    done: bool,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder failing once a line or event exceeds `max_bytes`
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            event_data: Vec::new(),
            event_len: 0,
            max_bytes,
            done: false,
        }
    }

    /// Feed body bytes, returning every unit completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RawUnit>, UpstreamError> {
        if self.done {
            return Ok(Vec::new());
        }
        self.buffer.extend_from_slice(bytes);

        let mut units = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut units)?;
            if self.done {
                self.buffer.clear();
                return Ok(units);
            }
        }

        if self.buffer.len() > self.max_bytes {
            return Err(self.too_large("line"));
        }
        Ok(units)
    }

    /// Flush a trailing line and any event left open by the end of the body
    pub fn finish(&mut self) -> Result<Vec<RawUnit>, UpstreamError> {
        let mut units = Vec::new();
        if self.done {
            self.buffer.clear();
            return Ok(units);
        }
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut units)?;
        }
        if !self.done {
            self.dispatch_event(&mut units);
        }
        Ok(units)
    }

    /// True once `[DONE]` has been seen
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn decode_line(&mut self, raw: &[u8], units: &mut Vec<RawUnit>) -> Result<(), UpstreamError> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(|c| c == '\r' || c == '\n');

        if line.trim().is_empty() {
            self.dispatch_event(units);
            return Ok(());
        }
        if line.starts_with(':') || is_sse_field(line) {
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.strip_prefix(' ').unwrap_or(rest);
            self.event_len += data.len() + 1;
            if self.event_len > self.max_bytes {
                return Err(self.too_large("event"));
            }
            self.event_data.push(data.to_string());
            return Ok(());
        }

        if let Some(unit) = self.decode_payload(line) {
            units.push(unit);
        }
        Ok(())
    }

    fn dispatch_event(&mut self, units: &mut Vec<RawUnit>) {
        if self.event_data.is_empty() {
            return;
        }
        let payload = self.event_data.join("\n");
        self.event_data.clear();
        self.event_len = 0;
        if let Some(unit) = self.decode_payload(&payload) {
            units.push(unit);
        }
    }

    fn decode_payload(&mut self, payload: &str) -> Option<RawUnit> {
        if payload.trim() == "[DONE]" {
            self.done = true;
            return None;
        }
        match serde_json::from_str::<Value>(payload) {
            Ok(value) => Some(value),
            Err(_) => Some(Value::String(payload.to_string())),
        }
    }

    fn too_large(&mut self, what: &str) -> UpstreamError {
        self.done = true;
        self.buffer.clear();
        self.event_data.clear();
        UpstreamError::Transport(format!(
            "upstream {} exceeds {} bytes",
            what, self.max_bytes
        ))
    }
}

fn is_sse_field(line: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_body_decoding() {
        let mut decoder = LineDecoder::new();
        let units = decoder
            .feed(
                b"event: message\ndata: {\"type\":\"message\",\"data\":\"Hi\"}\n\n: keepalive\n\ndata: [DONE]\n\ndata: \"ignored\"\n\n",
            )
            .unwrap();
        assert_eq!(units, vec![json!({"type": "message", "data": "Hi"})]);
        assert!(decoder.is_done());
        assert!(decoder.feed(b"data: \"late\"\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_multi_line_event_is_one_unit() {
        let mut decoder = LineDecoder::new();
        let units = decoder
            .feed(b"data: {\"type\":\"message\",\ndata: \"data\":\"Hi\"}\n\n")
            .unwrap();
        assert_eq!(units, vec![json!({"type": "message", "data": "Hi"})]);

        // Event boundary arriving in a later chunk
        assert!(decoder.feed(b"data: first\r\ndata: second\r\n").unwrap().is_empty());
        assert_eq!(decoder.feed(b"\r\n").unwrap(), vec![json!("first\nsecond")]);
    }

    #[test]
    fn test_ndjson_and_bare_text_lines() {
        let mut decoder = LineDecoder::new();
        let units = decoder
            .feed(b"{\"type\":\"ping\"}\r\nplain words \n\"quoted\"\n")
            .unwrap();
        assert_eq!(
            units,
            vec![json!({"type": "ping"}), json!("plain words "), json!("quoted")]
        );
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = LineDecoder::new();
        let text = "data: \"héllo\"\n\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.feed(&text[..split]).unwrap().is_empty());
        assert_eq!(decoder.feed(&text[split..]).unwrap(), vec![json!("héllo")]);
    }

    #[test]
    fn test_finish_flushes_trailing_line() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"data: \"tail\"").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), vec![json!("tail")]);
        assert!(decoder.finish().unwrap().is_empty());

        let mut decoder = LineDecoder::new();
        assert!(decoder.feed(b"data: \"open\"\n").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), vec![json!("open")]);
    }

    #[test]
    fn test_oversized_line_fails_stream() {
        let mut decoder = LineDecoder::with_limit(16);
        assert!(decoder.feed(b"0123456789").unwrap().is_empty());
        let err = decoder.feed(b"0123456789").unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
        assert!(decoder.is_done());

        let mut decoder = LineDecoder::with_limit(16);
        decoder.feed(b"data: 0123456789\n").unwrap();
        assert!(decoder.feed(b"data: 0123456789\n").is_err());

        let mut decoder = LineDecoder::with_limit(16);
        assert_eq!(
            decoder.feed(b"\"short\"\n\"also short\"\n").unwrap(),
            vec![json!("short"), json!("also short")]
        );
    }

    #[test]
    fn test_client_builds_stream_url() {
        let config = UpstreamConfig {
            base_url: "http://ai.local:9000/".to_string(),
            stream_path: "chat/stream".to_string(),
            api_key: Some(String::new()),
            ..UpstreamConfig::default()
        };
        let client = HttpStreamClient::new(&config).unwrap();
        assert_eq!(client.stream_url(), "http://ai.local:9000/chat/stream");
        assert!(client.api_key.is_none(), "blank keys are not sent");
    }
}
