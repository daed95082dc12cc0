//! Inbound events pushed by the backend

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse event classification, used for fingerprints and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Response,
    ToolExecution,
    UserInputRequired,
    UserInputFormRequired,
    Error,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Response => "response",
            EventKind::ToolExecution => "toolExecution",
            EventKind::UserInputRequired => "userInputRequired",
            EventKind::UserInputFormRequired => "userInputFormRequired",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

/// A single event received from any inbound channel
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Session the event is addressed to. Empty means "every session".
    pub session_id: String,
    /// Backend timestamp in milliseconds, when the backend supplies one
    pub timestamp: Option<i64>,
    pub payload: EventPayload,
}

/// Type-specific event content
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Response { content: String },
    ToolExecution(ToolBatch),
    UserInputRequired { prompt: String },
    UserInputFormRequired(FormRequest),
    Error { message: String },
    Heartbeat,
}

/// A group of tool invocations reported together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolBatch {
    pub batch_id: String,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_mode: Option<String>,
}

impl ToolBatch {
    /// True while any tool in the batch is still running
    pub fn is_executing(&self) -> bool {
        self.tool_executions.iter().any(|t| t.executing)
    }
}

/// One tool invocation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_name: String,
    /// Arguments as sent by the backend (usually a JSON string)
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub executing: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Execution time in milliseconds
    #[serde(default)]
    pub duration: u64,
}

impl ToolExecution {
    /// Arguments rendered as text, whatever shape the backend used
    pub fn arguments_text(&self) -> String {
        match &self.arguments {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A structured form the agent wants the user to fill in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Value,
}

impl FormRequest {
    /// Text shown in the timeline when the form is requested
    pub fn display_text(&self) -> String {
        match (self.title.is_empty(), self.description.is_empty()) {
            (false, false) => format!("{}\n{}", self.title, self.description),
            (false, true) => self.title.clone(),
            (true, false) => self.description.clone(),
            (true, true) => "Please fill in the form".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WireEvent {
    #[serde(rename_all = "camelCase")]
    Response {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    ToolExecution {
        #[serde(default)]
        session_id: String,
        data: ToolBatch,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    UserInputRequired {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    UserInputFormRequired {
        #[serde(default)]
        session_id: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        schema: Value,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default)]
        session_id: String,
        #[serde(default, alias = "message")]
        error: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(alias = "connection", alias = "ping", alias = "pong")]
    Heartbeat,
}

impl From<WireEvent> for InboundEvent {
    fn from(wire: WireEvent) -> Self {
        let (session_id, timestamp, payload) = match wire {
            WireEvent::Response {
                session_id,
                content,
                timestamp,
            } => (session_id, timestamp, EventPayload::Response { content }),
            WireEvent::ToolExecution {
                session_id,
                data,
                timestamp,
            } => (session_id, timestamp, EventPayload::ToolExecution(data)),
            WireEvent::UserInputRequired {
                session_id,
                prompt,
                timestamp,
            } => (session_id, timestamp, EventPayload::UserInputRequired { prompt }),
            WireEvent::UserInputFormRequired {
                session_id,
                title,
                description,
                schema,
                timestamp,
            } => (
                session_id,
                timestamp,
                EventPayload::UserInputFormRequired(FormRequest {
                    title,
                    description,
                    schema,
                }),
            ),
            WireEvent::Error {
                session_id,
                error,
                timestamp,
            } => (session_id, timestamp, EventPayload::Error { message: error }),
            WireEvent::Heartbeat => (String::new(), None, EventPayload::Heartbeat),
        };
        Self {
            session_id,
            timestamp,
            payload,
        }
    }
}

impl InboundEvent {
    /// Parse a JSON event body
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<WireEvent>(text).map(Into::into)
    }

    /// Build a `response` event for a body returned by the request/response path
    pub fn response(
        session_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp,
            payload: EventPayload::Response {
                content: content.into(),
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Response { .. } => EventKind::Response,
            EventPayload::ToolExecution(_) => EventKind::ToolExecution,
            EventPayload::UserInputRequired { .. } => EventKind::UserInputRequired,
            EventPayload::UserInputFormRequired(_) => EventKind::UserInputFormRequired,
            EventPayload::Error { .. } => EventKind::Error,
            EventPayload::Heartbeat => EventKind::Heartbeat,
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ToolExecution(batch) => Some(&batch.batch_id),
            _ => None,
        }
    }

    /// Primary text carried by the event
    pub fn text(&self) -> &str {
        match &self.payload {
            EventPayload::Response { content } => content,
            EventPayload::UserInputRequired { prompt } => prompt,
            EventPayload::UserInputFormRequired(form) => &form.title,
            EventPayload::Error { message } => message,
            EventPayload::ToolExecution(_) | EventPayload::Heartbeat => "",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, EventPayload::Heartbeat)
    }

    /// Topics are broadcast, so every client filters by its own session
    pub fn belongs_to(&self, session_id: &str) -> bool {
        self.session_id.is_empty() || self.session_id == session_id
    }
}
