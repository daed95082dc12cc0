//! Inbound message deduplication
//!
//! The same logical event can arrive more than once: over STOMP and as the body
//! of an HTTP response, or replayed by the backend after a reconnect. Each event
//! is reduced to a [`Fingerprint`] and dropped when the fingerprint was already
//! seen.

use crate::protocol::{EventKind, EventPayload, InboundEvent};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Characters of content kept in the default fingerprint
const PREFIX_CHARS: usize = 100;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_RETAIN: usize = 500;

/// Derived identity of an inbound event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of an event.
///
/// `exchange` counts the messages the user has sent in this session. The
/// backend stamps few events, so an unstamped response, prompt or error is
/// only a duplicate of one seen in the same exchange: the same "OK" in a later
/// turn, or a prompt repeated after an unhelpful answer, must get through.
///
/// - `toolExecution`: type, session, batch id and whether the batch is still
///   executing, so the "started" and "completed" reports of a batch both pass.
/// - `response`: type, session, timestamp (or exchange) and a hash of the full
///   content.
/// - anything else: type, session, exchange, content length and content prefix.
pub fn fingerprint(event: &InboundEvent, exchange: u64) -> Fingerprint {
    let kind = event.kind().as_str();
    let session = &event.session_id;
    let key = match &event.payload {
        EventPayload::ToolExecution(batch) => {
            let phase = if batch.is_executing() {
                "executing"
            } else {
                "completed"
            };
            format!("{kind}|{session}|{}|{phase}", batch.batch_id)
        }
        EventPayload::Response { content } => {
            let stamp = event
                .timestamp
                .map_or_else(|| format!("#{exchange}"), |t| t.to_string());
            format!("{kind}|{session}|{stamp}|{}", content_hash(content))
        }
        _ => {
            let text = event.text();
            let prefix: String = text.chars().take(PREFIX_CHARS).collect();
            format!("{kind}|{session}|#{exchange}|{}|{prefix}", text.len())
        }
    };
    Fingerprint(key)
}

/// SHA-256 over the full content, truncated to 64 bits
fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Bounded set of seen fingerprints
#[derive(Debug)]
pub struct Deduplicator {
    seen: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
    max_entries: usize,
    retain: usize,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_RETAIN)
    }
}

impl Deduplicator {
    pub fn new(max_entries: usize, retain: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            max_entries,
            retain: retain.min(max_entries),
        }
    }

    /// Returns `false` for a duplicate. Heartbeats are never recorded.
    pub fn accept(&mut self, event: &InboundEvent, exchange: u64) -> bool {
        if event.kind() == EventKind::Heartbeat {
            return true;
        }

        let fp = fingerprint(event, exchange);
        if self.seen.contains(&fp) {
            tracing::debug!(fingerprint = %fp, "Dropping duplicate event");
            return false;
        }

        self.seen.insert(fp.clone());
        self.order.push_back(fp);
        if self.order.len() > self.max_entries {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        let drop = self.order.len() - self.retain;
        for fp in self.order.drain(..drop) {
            self.seen.remove(&fp);
        }
        tracing::debug!(retained = self.order.len(), "Compacted dedup set");
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
