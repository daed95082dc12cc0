//! Effects produced by turn transitions

use super::state::ToolExecutionRecord;
use crate::protocol::OutboundMessage;
use crate::timeline::Sender;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Responded,
    Errored,
    TimedOut,
    Cancelled,
}

/// Effects to be executed after a transition, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver a message to the backend. Always the first effect when present.
    Send(OutboundMessage),

    /// Add an entry to the timeline
    AppendEntry { sender: Sender, content: String },

    /// Show a prompt unless it already is the latest agent entry
    AppendPrompt { content: String },

    /// Archive a completed exchange
    RecordHistory { user: String, agent: String },

    /// Ask the runtime to feed back `ResponseRendered`
    Settle,

    /// Tool records of the active turn changed
    ToolsUpdated { tools: Vec<ToolExecutionRecord> },

    TurnFinished { turn_id: String, outcome: TurnOutcome },
}

impl Effect {
    pub fn user_entry(content: impl Into<String>) -> Self {
        Effect::AppendEntry {
            sender: Sender::User,
            content: content.into(),
        }
    }

    pub fn agent_entry(content: impl Into<String>) -> Self {
        Effect::AppendEntry {
            sender: Sender::Agent,
            content: content.into(),
        }
    }

    pub fn finished(turn_id: &str, outcome: TurnOutcome) -> Self {
        Effect::TurnFinished {
            turn_id: turn_id.to_string(),
            outcome,
        }
    }
}
