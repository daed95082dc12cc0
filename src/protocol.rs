//! Wire formats exchanged with the agent backend
//!
//! Inbound events arrive as JSON over STOMP `MESSAGE` frames, SSE `data:` lines
//! or plain HTTP bodies. Outbound requests are JSON payloads addressed to a
//! backend destination.

mod inbound;
mod outbound;
pub mod stomp;

pub use inbound::{EventKind, EventPayload, FormRequest, InboundEvent, ToolBatch, ToolExecution};
pub use outbound::{ChatRequest, Destinations, FormSubmission, OutboundMessage};
