//! Multiplexed STOMP channel
//!
//! The connector is an actor owning the link. It dials through a [`Dialer`],
//! performs the STOMP handshake, (re)subscribes to the reply topics, forwards
//! inbound `MESSAGE` bodies as [`InboundEvent`]s and keeps the link alive with
//! heart-beats. Failures are retried under a [`ReconnectPolicy`]; once the
//! attempts are exhausted only an explicit `retry_now` dials again.

use super::reconnect::{ReconnectPolicy, ReconnectTracker};
use super::{ConnectionStatus, TransportError};
use crate::protocol::stomp::{Command as StompCommand, Frame, HEARTBEAT};
use crate::protocol::{Destinations, InboundEvent};
use async_trait::async_trait;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A raw text link to the broker. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the broker
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Link, TransportError>;

    /// Value of the STOMP `host` header
    fn host(&self) -> String;
}

#[async_trait]
impl<T: Dialer> Dialer for Arc<T> {
    async fn dial(&self) -> Result<Link, TransportError> {
        (**self).dial().await
    }

    fn host(&self) -> String {
        (**self).host()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub destinations: Destinations,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            destinations: Destinations::default(),
        }
    }
}

enum Command {
    Connect,
    Send {
        destination: String,
        body: String,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    RetryNow,
    Close,
}

/// Cloneable handle to a running connector
#[derive(Clone)]
pub struct ConnectorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectorHandle {
    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Transmit a payload. At-most-once: there is no application-level ack.
    pub async fn send(&self, destination: &str, body: String) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::not_connected());
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                destination: destination.to_string(),
                body,
                reply,
            })
            .map_err(|_| TransportError::closed())?;
        rx.await.map_err(|_| TransportError::closed())?
    }

    /// Reset the attempt counter and dial immediately
    pub fn retry_now(&self) {
        let _ = self.commands.send(Command::RetryNow);
    }

    /// Terminal close. Fire-and-forget.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

pub struct TransportConnector<D: Dialer> {
    dialer: D,
    config: ConnectorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::UnboundedSender<InboundEvent>,
    link: Option<Link>,
    subscriptions: Vec<String>,
    next_subscription: u64,
    tracker: ReconnectTracker,
    retry_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
}

impl<D: Dialer> TransportConnector<D> {
    pub fn new(
        dialer: D,
        config: ConnectorConfig,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> (Self, ConnectorHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let tracker = ReconnectTracker::new(config.reconnect);
        let connector = Self {
            dialer,
            config,
            commands,
            status,
            events,
            link: None,
            subscriptions: Vec::new(),
            next_subscription: 0,
            tracker,
            retry_at: None,
            handshake_deadline: None,
        };
        let handle = ConnectorHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (connector, handle)
    }

    /// Spawn the actor onto the current runtime
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.config.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let connected = self.current_status() == ConnectionStatus::Connected;
            tokio::select! {
                () = cancel.cancelled() => {
                    self.shutdown();
                    break;
                }
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        self.shutdown();
                        break;
                    };
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                text = recv_link(&mut self.link) => self.handle_link_message(text),
                () = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.dial().await;
                }
                () = sleep_until_opt(self.handshake_deadline) => {
                    self.connection_failed("STOMP handshake timed out");
                }
                _ = heartbeat.tick(), if connected => self.send_raw(HEARTBEAT.to_string()),
            }
        }
        tracing::debug!("Transport connector stopped");
    }

    /// Returns true when the actor should stop
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => match self.current_status() {
                ConnectionStatus::Disconnected => {
                    self.retry_at = None;
                    self.dial().await;
                }
                ConnectionStatus::Closed => {
                    tracing::warn!("Connect requested on a closed transport, ignoring");
                }
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {}
            },
            Command::RetryNow => match self.current_status() {
                ConnectionStatus::Disconnected => {
                    tracing::info!("Manual retry requested");
                    self.tracker.reset();
                    self.retry_at = None;
                    self.dial().await;
                }
                ConnectionStatus::Closed
                | ConnectionStatus::Connecting
                | ConnectionStatus::Connected => {}
            },
            Command::Send {
                destination,
                body,
                reply,
            } => {
                let result = self.send_frame(&destination, body);
                let _ = reply.send(result);
            }
            Command::Close => {
                self.shutdown();
                return true;
            }
        }
        false
    }

    fn send_frame(&mut self, destination: &str, body: String) -> Result<(), TransportError> {
        if self.current_status() != ConnectionStatus::Connected {
            return Err(TransportError::not_connected());
        }
        let Some(link) = &self.link else {
            return Err(TransportError::not_connected());
        };
        let frame = Frame::send(destination, body).encode();
        if link.outgoing.send(frame).is_err() {
            self.connection_failed("link closed while sending");
            return Err(TransportError::network("Link closed while sending"));
        }
        tracing::debug!(destination = %destination, "Sent STOMP frame");
        Ok(())
    }

    fn send_raw(&self, text: String) {
        if let Some(link) = &self.link {
            let _ = link.outgoing.send(text);
        }
    }

    async fn dial(&mut self) {
        self.teardown_link();
        self.set_status(ConnectionStatus::Connecting);
        tracing::info!(attempt = self.tracker.attempts(), "Connecting to broker");

        match timeout(self.config.connect_timeout, self.dialer.dial()).await {
            Ok(Ok(link)) => {
                let connect = Frame::connect(&self.dialer.host(), self.config.heartbeat).encode();
                if link.outgoing.send(connect).is_err() {
                    self.connection_failed("link closed before handshake");
                    return;
                }
                self.link = Some(link);
                self.handshake_deadline = Some(Instant::now() + self.config.connect_timeout);
            }
            Ok(Err(e)) => self.connection_failed(&e.message),
            Err(_) => self.connection_failed("dial timed out"),
        }
    }

    fn handle_link_message(&mut self, text: Option<String>) {
        let Some(text) = text else {
            if self.current_status() != ConnectionStatus::Closed {
                self.connection_failed("link closed by peer");
            }
            return;
        };

        let frames = match Frame::decode_all(&text) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding malformed STOMP payload");
                return;
            }
        };

        for frame in frames {
            match frame.command {
                StompCommand::Connected => self.on_connected(&frame),
                StompCommand::Message => self.forward_message(&frame),
                StompCommand::Error => {
                    let message = frame.get("message").unwrap_or("broker error").to_string();
                    tracing::warn!(error = %message, body = %frame.body, "Broker sent ERROR frame");
                    self.connection_failed(&message);
                    return;
                }
                StompCommand::Receipt => {
                    tracing::debug!(receipt = ?frame.get("receipt-id"), "Receipt");
                }
                other => {
                    tracing::debug!(command = other.as_str(), "Ignoring unexpected frame");
                }
            }
        }
    }

    fn on_connected(&mut self, frame: &Frame) {
        self.handshake_deadline = None;
        self.tracker.reset();

        for topic in self.config.destinations.topics() {
            let id = format!("sub-{}", self.next_subscription);
            self.next_subscription += 1;
            self.send_raw(Frame::subscribe(&id, &topic).encode());
            tracing::debug!(subscription = %id, topic = %topic, "Subscribed");
            self.subscriptions.push(id);
        }

        tracing::info!(version = ?frame.get("version"), "Connected to broker");
        self.set_status(ConnectionStatus::Connected);
    }

    fn forward_message(&self, frame: &Frame) {
        match InboundEvent::parse(&frame.body) {
            Ok(event) => {
                tracing::debug!(
                    kind = event.kind().as_str(),
                    session_id = %event.session_id,
                    destination = ?frame.get("destination"),
                    "Inbound event"
                );
                let _ = self.events.send(event);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unparseable message body");
            }
        }
    }

    /// Unsubscribe the previous link's subscriptions and drop it
    fn teardown_link(&mut self) {
        if let Some(link) = self.link.take() {
            for id in self.subscriptions.drain(..) {
                let _ = link.outgoing.send(Frame::unsubscribe(&id).encode());
            }
        }
        self.subscriptions.clear();
        self.handshake_deadline = None;
    }

    fn connection_failed(&mut self, reason: &str) {
        tracing::warn!(reason = %reason, "Connection lost");
        self.teardown_link();
        self.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.tracker.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.tracker.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None => {
                tracing::warn!(
                    attempts = self.tracker.attempts(),
                    "Reconnect attempts exhausted, waiting for manual retry"
                );
                self.retry_at = None;
            }
        }
    }

    fn shutdown(&mut self) {
        if let Some(link) = &self.link {
            let _ = link.outgoing.send(Frame::disconnect().encode());
        }
        self.link = None;
        self.subscriptions.clear();
        self.retry_at = None;
        self.handshake_deadline = None;
        self.set_status(ConnectionStatus::Closed);
    }

    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            tracing::info!(status = %status, "Connection status changed");
        }
    }
}

async fn recv_link(link: &mut Option<Link>) -> Option<String> {
    match link {
        Some(link) => link.incoming.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
