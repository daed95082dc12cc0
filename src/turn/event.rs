//! Events that drive turn transitions

use crate::protocol::{FormRequest, ToolBatch};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    // User events
    UserMessage {
        text: String,
        at: DateTime<Utc>,
    },
    FormSubmitted {
        payload: Value,
    },
    /// Dismiss a pending form without answering it
    Cancel,

    // Backend events
    ToolExecution {
        batch: ToolBatch,
    },
    Response {
        content: String,
    },
    UserInputRequired {
        prompt: String,
        at: DateTime<Utc>,
    },
    UserInputFormRequired {
        form: FormRequest,
        at: DateTime<Utc>,
    },
    BackendError {
        message: String,
    },

    // Runtime events
    /// The response was rendered; decide whether the agent is asking something
    ResponseRendered,
    /// Fallback polling gave up
    TimedOut {
        waited: Duration,
    },
}

impl TurnEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::UserMessage { .. } => "user_message",
            TurnEvent::FormSubmitted { .. } => "form_submitted",
            TurnEvent::Cancel => "cancel",
            TurnEvent::ToolExecution { .. } => "tool_execution",
            TurnEvent::Response { .. } => "response",
            TurnEvent::UserInputRequired { .. } => "user_input_required",
            TurnEvent::UserInputFormRequired { .. } => "user_input_form_required",
            TurnEvent::BackendError { .. } => "backend_error",
            TurnEvent::ResponseRendered => "response_rendered",
            TurnEvent::TimedOut { .. } => "timed_out",
        }
    }
}
