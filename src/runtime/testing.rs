//! Mock implementations for testing
//!
//! These mocks enable testing the client, driver and connector without real
//! sockets or HTTP.

use super::client::{ChatClient, ClientSettings};
use super::traits::{Delivery, Outbound};
use super::ClientError;
use crate::history::{HistoryConfig, HistoryStore, MemoryStore};
use crate::protocol::stomp::{Command, Frame, HEARTBEAT};
use crate::protocol::OutboundMessage;
use crate::transport::{Dialer, Link, ResultSource, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ============================================================================
// Mock Outbound
// ============================================================================

/// Outbound adapter that records messages and replays scripted outcomes.
///
/// With an empty script every delivery succeeds as [`Delivery::Pushed`].
pub struct MockOutbound {
    script: Mutex<VecDeque<(Duration, Result<Delivery, TransportError>)>>,
    sent: Mutex<Vec<OutboundMessage>>,
    connected: AtomicBool,
}

impl Default for MockOutbound {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }
}

impl MockOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_delivery(&self, delivery: Delivery) {
        self.push_delayed(Duration::ZERO, Ok(delivery));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push_delayed(Duration::ZERO, Err(error));
    }

    /// Outcome that takes `delay` to come back, like a slow request
    pub fn push_delayed(&self, delay: Duration, outcome: Result<Delivery, TransportError>) {
        self.script.lock().unwrap().push_back((delay, outcome));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Every message a delivery was attempted for
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Outbound for MockOutbound {
    fn ready(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::not_connected())
        }
    }

    async fn deliver(&self, message: &OutboundMessage) -> Result<Delivery, TransportError> {
        self.sent.lock().unwrap().push(message.clone());
        let next = self.script.lock().unwrap().pop_front();
        let Some((delay, outcome)) = next else {
            return Ok(Delivery::Pushed);
        };
        tokio::time::sleep(delay).await;
        outcome
    }
}

/// Client over a mock outbound and an in-memory history
pub fn test_client(outbound: Arc<MockOutbound>) -> (ChatClient<Arc<MockOutbound>>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let history = HistoryStore::new(store.clone(), HistoryConfig::default());
    let client = ChatClient::new(outbound, history, ClientSettings::with_defaults().unwrap());
    (client, store)
}

/// Submit and run the delivery to completion on the caller's task
pub async fn submit_now(
    client: &mut ChatClient<Arc<MockOutbound>>,
    text: &str,
) -> Result<(), ClientError> {
    let pending = client.submit(text)?;
    let report = pending.deliver(&client.outbound()).await;
    client.delivery_finished(report);
    Ok(())
}

/// [`submit_now`] for a form answer
pub async fn submit_form_now(
    client: &mut ChatClient<Arc<MockOutbound>>,
    payload: Value,
) -> Result<(), ClientError> {
    let pending = client.submit_form(payload)?;
    let report = pending.deliver(&client.outbound()).await;
    client.delivery_finished(report);
    Ok(())
}

// ============================================================================
// Mock Result Source
// ============================================================================

/// Scripted poll results; an empty script reads as still pending
#[derive(Default)]
pub struct MockResultSource {
    script: Mutex<VecDeque<Result<Option<String>, TransportError>>>,
    polls: AtomicUsize,
}

impl MockResultSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pending(&self) {
        self.script.lock().unwrap().push_back(Ok(None));
    }

    pub fn push_ready(&self, result: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(Some(result.to_string())));
    }

    pub fn push_error(&self, error: TransportError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSource for MockResultSource {
    async fn poll_result(&self, _session_id: &str) -> Result<Option<String>, TransportError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }
}

// ============================================================================
// Mock Dialer
// ============================================================================

/// Receiving side of a [`MockDialer`]
pub struct DialerTaps {
    /// When each dial happened
    pub attempts: mpsc::UnboundedReceiver<Instant>,
    /// Broker ends of successful dials
    pub servers: mpsc::UnboundedReceiver<MockServer>,
}

/// Dialer that succeeds or fails as scripted; an empty script fails
pub struct MockDialer {
    script: Mutex<VecDeque<bool>>,
    dials: AtomicUsize,
    attempts: mpsc::UnboundedSender<Instant>,
    servers: mpsc::UnboundedSender<MockServer>,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, DialerTaps) {
        let (attempts_tx, attempts) = mpsc::unbounded_channel();
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            dials: AtomicUsize::new(0),
            attempts: attempts_tx,
            servers: servers_tx,
        });
        (dialer, DialerTaps { attempts, servers })
    }

    pub fn push_success(&self) {
        self.script.lock().unwrap().push_back(true);
    }

    pub fn push_failure(&self) {
        self.script.lock().unwrap().push_back(false);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self) -> Result<Link, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let _ = self.attempts.send(Instant::now());

        let succeed = self.script.lock().unwrap().pop_front().unwrap_or(false);
        if !succeed {
            return Err(TransportError::network("connection refused"));
        }

        let (outgoing, from_client) = mpsc::unbounded_channel();
        let (to_client, incoming) = mpsc::unbounded_channel();
        let _ = self.servers.send(MockServer {
            to_client,
            from_client,
        });
        Ok(Link { outgoing, incoming })
    }

    fn host(&self) -> String {
        "mock".to_string()
    }
}

/// Broker end of a mock link. Dropping it closes the link.
pub struct MockServer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    /// Complete the handshake
    pub fn accept(&self) {
        self.send(&Frame::new(Command::Connected).header("version", "1.2"));
    }

    pub fn push_event(&self, body: &Value) {
        self.send(
            &Frame::new(Command::Message)
                .header("destination", "/topic/reply")
                .header("subscription", "sub-0")
                .with_body(body.to_string()),
        );
    }

    /// Send an ERROR frame
    pub fn fail(&self, message: &str) {
        self.send(&Frame::new(Command::Error).header("message", message));
    }

    /// Next frame from the client, skipping heartbeats
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let raw = self.from_client.recv().await?;
            if raw == HEARTBEAT {
                continue;
            }
            if let Some(frame) = Frame::decode_all(&raw).ok()?.into_iter().next() {
                return Some(frame);
            }
        }
    }

    /// Next frame with the given command
    pub async fn next_of(&mut self, command: Command) -> Option<Frame> {
        loop {
            let frame = self.next_frame().await?;
            if frame.command == command {
                return Some(frame);
            }
        }
    }

    /// Heartbeats received so far; other traffic is discarded
    pub async fn heartbeats(&mut self) -> usize {
        tokio::task::yield_now().await;
        let mut count = 0;
        while let Ok(raw) = self.from_client.try_recv() {
            if raw == HEARTBEAT {
                count += 1;
            }
        }
        count
    }

    fn send(&self, frame: &Frame) {
        let _ = self.to_client.send(frame.encode());
    }
}
