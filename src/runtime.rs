//! Client runtime
//!
//! [`ChatClient`] owns one session: turn state, deduplicator, timeline and
//! history. The [`Driver`] serializes everything that touches it on one task.
//! Observers subscribe to [`ClientEvent`]s.

mod client;
mod driver;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use client::{ChatClient, ClientSettings};
pub use driver::{spawn_status_check, Driver, DriverHandle};
pub use traits::*;

use crate::history::PersistenceError;
use crate::timeline::ConversationEntry;
use crate::transport::{AgentStatus, ConnectionStatus, TransportError};
use crate::turn::{ToolExecutionRecord, TransitionError, TurnOutcome, TurnPhase};
use thiserror::Error;

/// Events broadcast to observers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged { phase: TurnPhase },
    EntryAppended(ConversationEntry),
    /// A placeholder entry was superseded in place
    EntryReplaced(ConversationEntry),
    ToolsUpdated(Vec<ToolExecutionRecord>),
    ConnectionChanged(ConnectionStatus),
    AgentStatusChanged(AgentStatus),
    TurnFinished { turn_id: String, outcome: TurnOutcome },
    /// Non-fatal problem worth surfacing
    Warning(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// The channel cannot take the message; nothing was committed and the
    /// input may be retried
    #[error("Message not sent: {0}")]
    SendRejected(TransportError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Client has stopped")]
    Stopped,
}
