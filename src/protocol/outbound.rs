//! Requests sent to the backend

use serde::Serialize;
use serde_json::{json, Value};

/// Chat payload understood by both the HTTP and the STOMP endpoints
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub chat: String,
    pub session_id: String,
}

/// Answer to a `userInputFormRequired` event
#[derive(Debug, Clone, PartialEq)]
pub struct FormSubmission {
    pub session_id: String,
    pub form: Value,
}

impl FormSubmission {
    /// The form object with the session id folded in
    pub fn to_value(&self) -> Value {
        match &self.form {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("sessionId".to_string(), json!(self.session_id));
                Value::Object(map)
            }
            other => json!({ "sessionId": self.session_id, "value": other }),
        }
    }
}

/// Logical outbound operations of a turn
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// First message of a new turn
    Chat(ChatRequest),
    /// Reply to a pending user-input request (continues the same turn)
    HumanInput(ChatRequest),
    /// Submission of a pending form (continues the same turn)
    Form(FormSubmission),
}

impl OutboundMessage {
    pub fn chat(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        OutboundMessage::Chat(ChatRequest {
            chat: text.into(),
            session_id: session_id.into(),
        })
    }

    pub fn human_input(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        OutboundMessage::HumanInput(ChatRequest {
            chat: text.into(),
            session_id: session_id.into(),
        })
    }

    pub fn form(session_id: impl Into<String>, form: Value) -> Self {
        OutboundMessage::Form(FormSubmission {
            session_id: session_id.into(),
            form,
        })
    }

    pub fn session_id(&self) -> &str {
        match self {
            OutboundMessage::Chat(req) | OutboundMessage::HumanInput(req) => &req.session_id,
            OutboundMessage::Form(form) => &form.session_id,
        }
    }

    pub fn destination<'a>(&self, destinations: &'a Destinations) -> &'a str {
        match self {
            OutboundMessage::Chat(_) => &destinations.chat,
            OutboundMessage::HumanInput(_) => &destinations.human_input,
            OutboundMessage::Form(_) => &destinations.form_submit,
        }
    }

    /// Body of the STOMP `SEND` frame; the backend unwraps `request` or `form`
    pub fn stomp_body(&self) -> Value {
        match self {
            OutboundMessage::Chat(req) | OutboundMessage::HumanInput(req) => {
                json!({ "request": req })
            }
            OutboundMessage::Form(form) => json!({ "form": form.to_value() }),
        }
    }
}

/// STOMP destinations and topics of the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destinations {
    pub chat: String,
    pub human_input: String,
    pub form_submit: String,
    pub reply_topic: String,
    pub error_topic: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            chat: "/app/traveling/chat".to_string(),
            human_input: "/app/traveling/human/input".to_string(),
            form_submit: "/app/traveling/form/submit".to_string(),
            reply_topic: "/topic/reply".to_string(),
            error_topic: "/topic/error".to_string(),
        }
    }
}

impl Destinations {
    /// Topics subscribed on every (re)connect
    pub fn topics(&self) -> Vec<String> {
        vec![self.reply_topic.clone(), self.error_topic.clone()]
    }
}
