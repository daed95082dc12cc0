//! Turn state types

use super::detector::InputRequestDetector;
use crate::protocol::{FormRequest, ToolBatch};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One tool invocation as tracked by the turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecutionRecord {
    pub batch_id: String,
    pub index: usize,
    pub tool_name: String,
    pub arguments: String,
    pub executing: bool,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One user request and its agent-side handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// `{session}:{start millis}`
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub user_message: String,
    /// Replies sent while the agent waited for input
    pub replies: Vec<String>,
    pub tools: Vec<ToolExecutionRecord>,
    pub response: Option<String>,
}

impl Turn {
    pub fn new(session_id: &str, user_message: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("{session_id}:{}", started_at.timestamp_millis()),
            session_id: session_id.to_string(),
            started_at,
            user_message: user_message.into(),
            replies: Vec::new(),
            tools: Vec::new(),
            response: None,
        }
    }

    /// Most recent text the user sent in this turn
    pub fn latest_user_text(&self) -> &str {
        self.replies.last().unwrap_or(&self.user_message)
    }

    pub fn has_executing_tools(&self) -> bool {
        self.tools.iter().any(|t| t.executing)
    }

    /// Create or update records matched by (batch id, index).
    ///
    /// A completed record is final: a late `executing` report never reopens it.
    pub fn upsert_tools(&mut self, batch: &ToolBatch) {
        for (index, exec) in batch.tool_executions.iter().enumerate() {
            let existing = self
                .tools
                .iter_mut()
                .find(|t| t.batch_id == batch.batch_id && t.index == index);
            match existing {
                Some(record) if !record.executing => {}
                Some(record) => {
                    record.tool_name.clone_from(&exec.tool_name);
                    record.arguments = exec.arguments_text();
                    record.executing = exec.executing;
                    record.success = exec.success;
                    record.result.clone_from(&exec.result);
                    record.error.clone_from(&exec.error_message);
                    record.duration_ms = exec.duration;
                }
                None => self.tools.push(ToolExecutionRecord {
                    batch_id: batch.batch_id.clone(),
                    index,
                    tool_name: exec.tool_name.clone(),
                    arguments: exec.arguments_text(),
                    executing: exec.executing,
                    success: exec.success,
                    result: exec.result.clone(),
                    error: exec.error_message.clone(),
                    duration_ms: exec.duration,
                }),
            }
        }
    }
}

/// Turn state of a session
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TurnState {
    /// Ready for a new user message
    #[default]
    Idle,

    /// Request sent, waiting for the agent
    Thinking { turn: Turn },

    /// At least one tool is running
    ToolExecuting { turn: Turn },

    /// Response received, input-request check pending
    Responding { turn: Turn },

    /// Agent asked a question; the next user message continues this turn
    AwaitingUserInput { turn: Turn, prompt: String },

    /// Agent asked for a structured form
    AwaitingForm { turn: Turn, form: FormRequest },
}

/// Data-free view of [`TurnState`] for observers and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnPhase {
    Idle,
    Thinking,
    ToolExecuting,
    Responding,
    AwaitingUserInput,
    AwaitingForm,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnPhase::Idle => "idle",
            TurnPhase::Thinking => "thinking",
            TurnPhase::ToolExecuting => "tool_executing",
            TurnPhase::Responding => "responding",
            TurnPhase::AwaitingUserInput => "awaiting_user_input",
            TurnPhase::AwaitingForm => "awaiting_form",
        };
        f.write_str(s)
    }
}

impl TurnState {
    pub fn phase(&self) -> TurnPhase {
        match self {
            TurnState::Idle => TurnPhase::Idle,
            TurnState::Thinking { .. } => TurnPhase::Thinking,
            TurnState::ToolExecuting { .. } => TurnPhase::ToolExecuting,
            TurnState::Responding { .. } => TurnPhase::Responding,
            TurnState::AwaitingUserInput { .. } => TurnPhase::AwaitingUserInput,
            TurnState::AwaitingForm { .. } => TurnPhase::AwaitingForm,
        }
    }

    pub fn turn(&self) -> Option<&Turn> {
        match self {
            TurnState::Idle => None,
            TurnState::Thinking { turn }
            | TurnState::ToolExecuting { turn }
            | TurnState::Responding { turn }
            | TurnState::AwaitingUserInput { turn, .. }
            | TurnState::AwaitingForm { turn, .. } => Some(turn),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TurnState::Idle)
    }

    /// A result for this turn is still expected from the backend
    pub fn awaits_result(&self) -> bool {
        matches!(self, TurnState::Thinking { .. } | TurnState::ToolExecuting { .. })
    }
}

/// Static inputs of the transition function
#[derive(Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub detector: Arc<dyn InputRequestDetector>,
}

impl TurnContext {
    pub fn new(session_id: impl Into<String>, detector: Arc<dyn InputRequestDetector>) -> Self {
        Self {
            session_id: session_id.into(),
            detector,
        }
    }
}

impl fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolExecution;
    use serde_json::Value;

    fn batch(id: &str, executing: &[bool]) -> ToolBatch {
        ToolBatch {
            batch_id: id.to_string(),
            tool_executions: executing
                .iter()
                .map(|&executing| ToolExecution {
                    tool_name: "search".to_string(),
                    arguments: Value::String("{}".to_string()),
                    executing,
                    success: !executing,
                    result: (!executing).then(|| "done".to_string()),
                    error_message: None,
                    duration: 12,
                })
                .collect(),
            execution_mode: None,
        }
    }

    #[test]
    fn test_turn_id() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let turn = Turn::new("session_1", "Hello", at);
        assert_eq!(turn.id, "session_1:1700000000123");
        assert_eq!(turn.latest_user_text(), "Hello");
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut turn = Turn::new("s1", "x", Utc::now());
        turn.upsert_tools(&batch("b1", &[true, true]));
        assert_eq!(turn.tools.len(), 2);
        assert!(turn.has_executing_tools());

        turn.upsert_tools(&batch("b1", &[false, false]));
        assert_eq!(turn.tools.len(), 2);
        assert!(!turn.has_executing_tools());
        assert_eq!(turn.tools[0].result.as_deref(), Some("done"));

        turn.upsert_tools(&batch("b2", &[true]));
        assert_eq!(turn.tools.len(), 3);
        assert_eq!(turn.tools[2].index, 0);
    }

    #[test]
    fn test_completed_record_never_reopens() {
        let mut turn = Turn::new("s1", "x", Utc::now());
        turn.upsert_tools(&batch("b1", &[false]));
        turn.upsert_tools(&batch("b1", &[true]));
        assert!(!turn.tools[0].executing);
        assert!(turn.tools[0].success);
    }
}
