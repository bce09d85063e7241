//! Per-session fragment deduplication
//!
//! Upstream services occasionally emit the same fragment twice (for example a
//! delta followed by a `message` echo of the same text). Each relay session
//! owns one [`Deduplicator`]; it is created with the upstream worker and
//! dropped with it.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::types::ComponentPayload;

/// 128-bit content hash
pub type DedupeKey = [u8; 16];

/// Session-scoped seen-set of content hashes
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<DedupeKey>,
    text_keys: usize,
    suppressed: usize,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time `content` is seen in this session
    pub fn should_relay_text(&mut self, content: &str) -> bool {
        let key = hash_parts(b"text", &[content.as_bytes()]);
        let fresh = self.admit(key);
        if fresh {
            self.text_keys += 1;
        }
        fresh
    }

    /// True the first time this component identity is seen
    ///
    /// Identity is `(id, status)`, so a component moving from `pending` to
    /// `success` is relayed at each step but a repeated `success` is not.
    pub fn should_relay_component(&mut self, component: &ComponentPayload) -> bool {
        let key = hash_parts(
            b"component",
            &[component.id.as_bytes(), component.status.as_str().as_bytes()],
        );
        self.admit(key)
    }

    /// Distinct text fragments admitted so far
    pub fn distinct_text_count(&self) -> usize {
        self.text_keys
    }

    /// Units rejected as duplicates so far
    pub fn suppressed_count(&self) -> usize {
        self.suppressed
    }

    fn admit(&mut self, key: DedupeKey) -> bool {
        if self.seen.insert(key) {
            true
        } else {
            self.suppressed += 1;
            false
        }
    }
}

/// Domain-separated, length-prefixed SHA-256 truncated to 128 bits
fn hash_parts(domain: &[u8], parts: &[&[u8]]) -> DedupeKey {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}
