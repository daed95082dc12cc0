//! Transports to the agent backend
//!
//! - [`connector`]: the multiplexed STOMP channel with reconnection and heartbeat
//! - [`http`]: request/response endpoints
//! - [`sse`]: optional Server-Sent Events subscription
//! - [`polling`]: fallback result polling

pub mod connector;
pub mod http;
pub mod polling;
pub mod reconnect;
pub mod sse;
pub mod websocket;

pub use connector::{ConnectorHandle, Dialer, Link, TransportConnector};
pub use http::{AgentStatus, HttpBackend};
pub use polling::{await_result, PollPolicy, ResultSource};
pub use reconnect::{ReconnectPolicy, ReconnectTracker};
pub use sse::SseSubscriber;
pub use websocket::WebSocketDialer;

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Transport error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(TransportErrorKind::NotConnected, "Not connected to the backend")
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout(waited: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("Timed out after {}s", waited.as_secs()),
        )
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "Transport closed")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::new(
                TransportErrorKind::Auth,
                format!("Authentication failed: {body}"),
            ),
            400 | 413 | 415 | 422 => Self::invalid_request(format!("Invalid request: {body}")),
            429 => Self::new(TransportErrorKind::RateLimit, format!("Rate limited: {body}")),
            500..=599 => Self::new(
                TransportErrorKind::ServerError,
                format!("Server error: {body}"),
            ),
            _ => Self::new(TransportErrorKind::Unknown, format!("HTTP {status}: {body}")),
        }
    }

    /// Classify a reqwest failure the same way for every endpoint
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(TransportErrorKind::Timeout, format!("Request timeout: {err}"))
        } else if err.is_connect() {
            Self::network(format!("Connection failed: {err}"))
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), &err.to_string())
        } else {
            Self::network(format!("Request failed: {err}"))
        }
    }
}

/// Error classification for retry and reporting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Push channel is down; the send was not attempted
    NotConnected,
    /// Network failure, dial failure, or dropped link - retryable
    Network,
    /// Request or wait exceeded its deadline - retryable
    Timeout,
    /// Rate limited (429) - retryable
    RateLimit,
    /// Server error (5xx) - retryable
    ServerError,
    /// Authentication failed (401, 403)
    Auth,
    /// Rejected request or failed client-side validation
    InvalidRequest,
    /// Malformed frame or payload from the backend
    Protocol,
    /// The transport was closed explicitly
    Closed,
    Unknown,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError
        )
    }

    /// The request certainly never reached the backend
    pub fn never_sent(self) -> bool {
        matches!(self, Self::NotConnected | Self::InvalidRequest | Self::Closed)
    }
}

/// Connection status of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Closed explicitly; never retried
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}
