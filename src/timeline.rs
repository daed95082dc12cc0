//! Conversation timeline
//!
//! Append-only log of what the user saw. The only mutation of an existing
//! entry is [`Timeline::replace_last`], used when a placeholder reply is
//! superseded by the real result.

use crate::history::HistoryRecord;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationEntry {
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<ConversationEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    pub fn push(&mut self, sender: Sender, content: impl Into<String>, timestamp: DateTime<Utc>) {
        self.append(ConversationEntry {
            sender,
            content: content.into(),
            timestamp,
        });
    }

    /// Replace the content of the latest entry from `sender`.
    ///
    /// Returns false (and changes nothing) when there is no such entry.
    pub fn replace_last(&mut self, sender: Sender, content: impl Into<String>) -> bool {
        match self.entries.iter_mut().rev().find(|e| e.sender == sender) {
            Some(entry) => {
                entry.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Append unless the latest entry from `sender` already has this content
    pub fn append_unless_last(
        &mut self,
        sender: Sender,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let already_shown = self
            .entries
            .iter()
            .rev()
            .find(|e| e.sender == sender)
            .is_some_and(|e| e.content == content);
        if already_shown {
            return false;
        }
        self.push(sender, content, timestamp);
        true
    }

    pub fn last(&self) -> Option<&ConversationEntry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

const RULE_WIDTH: usize = 50;
const SEPARATOR_WIDTH: usize = 30;

/// Human-readable transcript of archived exchanges, oldest first.
///
/// Depends only on `records`: the same records always give the same text.
pub fn export_text(records: &[HistoryRecord]) -> String {
    let mut sorted: Vec<&HistoryRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    let mut out = String::new();
    out.push_str("Agent Chat Transcript\n");
    out.push_str(&"=".repeat(RULE_WIDTH));
    out.push_str("\n\n");

    for (i, record) in sorted.iter().enumerate() {
        let _ = writeln!(out, "Conversation {} ({})", i + 1, format_timestamp(record.timestamp));
        let _ = writeln!(out, "User: {}", record.user);
        let _ = writeln!(out, "Agent: {}", record.agent);
        out.push_str(&"-".repeat(SEPARATOR_WIDTH));
        out.push_str("\n\n");
    }
    out
}

fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

/// Local wall-clock rendering for interactive output
pub fn local_time(timestamp: DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format("%H:%M:%S").to_string()
}
