//! Trait abstractions for runtime I/O
//!
//! The client only knows [`Outbound`]; the concrete transport is chosen at
//! startup and mocked in tests.

use crate::protocol::{Destinations, OutboundMessage};
use crate::transport::{ConnectionStatus, ConnectorHandle, HttpBackend, TransportError};
use async_trait::async_trait;
use std::sync::Arc;

/// What a successful delivery yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted; the result will arrive on the push channel
    Pushed,
    /// The result came back with the request
    Immediate(String),
}

/// Delivers turn messages to the backend.
///
/// [`ready`](Outbound::ready) is checked before anything is committed;
/// [`deliver`](Outbound::deliver) runs afterwards off the client's task and may
/// take as long as the backend does.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Whether a delivery can be attempted right now
    fn ready(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError>;
}

/// Push delivery over the STOMP connector
#[derive(Clone)]
pub struct StompOutbound {
    handle: ConnectorHandle,
    destinations: Destinations,
}

impl StompOutbound {
    pub fn new(handle: ConnectorHandle, destinations: Destinations) -> Self {
        Self {
            handle,
            destinations,
        }
    }
}

#[async_trait]
impl Outbound for StompOutbound {
    fn ready(&self) -> Result<(), TransportError> {
        if self.handle.status() == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(TransportError::not_connected())
        }
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        let destination = message.destination(&self.destinations);
        self.handle
            .send(destination, message.stomp_body().to_string())
            .await?;
        Ok(Delivery::Pushed)
    }
}

/// Request/response delivery over HTTP
#[derive(Clone)]
pub struct HttpOutbound {
    backend: Arc<HttpBackend>,
}

impl HttpOutbound {
    pub fn new(backend: Arc<HttpBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Outbound for HttpOutbound {
    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        let body = match message {
            OutboundMessage::Chat(req) | OutboundMessage::HumanInput(req) => {
                self.backend.submit_message(&req.session_id, &req.chat).await?
            }
            OutboundMessage::Form(form) => {
                self.backend.submit_form(&form.session_id, &form.form).await?
            }
        };
        Ok(Delivery::Immediate(body))
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Outbound + ?Sized> Outbound for Arc<T> {
    fn ready(&self) -> Result<(), TransportError> {
        (**self).ready()
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        (**self).deliver(message).await
    }
}

#[async_trait]
impl<T: Outbound + ?Sized> Outbound for Box<T> {
    fn ready(&self) -> Result<(), TransportError> {
        (**self).ready()
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        (**self).deliver(message).await
    }
}
