//! Client event loop
//!
//! The driver owns the [`ChatClient`] and is the only task that mutates it.
//! User commands, inbound events, connection status changes, delivery reports
//! and fallback poll results all funnel through one `select!` loop. Anything
//! slow (HTTP deliveries, polling) runs on spawned tasks that report back.

use super::client::{ChatClient, DeliveryReport, PendingDelivery};
use super::traits::Outbound;
use super::{ClientError, ClientEvent};
use crate::history::HistoryRecord;
use crate::protocol::InboundEvent;
use crate::transport::{
    await_result, AgentStatus, ConnectionStatus, HttpBackend, PollPolicy, ResultSource,
    TransportError, TransportErrorKind,
};
use chrono::Utc;
use serde_json::Value;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 32;

enum Command {
    Submit {
        text: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SubmitForm {
        payload: Value,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    CancelForm {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    NewChat {
        reply: oneshot::Sender<String>,
    },
    SessionId {
        reply: oneshot::Sender<String>,
    },
    Export {
        reply: oneshot::Sender<String>,
    },
    History {
        reply: oneshot::Sender<Vec<HistoryRecord>>,
    },
    DeleteHistory {
        index: usize,
        reply: oneshot::Sender<Result<Option<HistoryRecord>, ClientError>>,
    },
    ClearHistory {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Notice(String),
    AgentStatus(AgentStatus),
}

struct PollOutcome {
    exchange: u64,
    result: Result<String, TransportError>,
}

/// Fallback poll in flight
struct ActivePoll {
    /// Exchange the poll fetches the result of
    exchange: u64,
    /// Started while the turn waited; ends with the wait
    for_turn: bool,
    cancel: CancellationToken,
}

/// Cloneable handle for talking to a running [`Driver`]
#[derive(Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl DriverHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn submit(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::Submit { text, reply }).await?
    }

    pub async fn submit_form(&self, payload: Value) -> Result<(), ClientError> {
        self.request(|reply| Command::SubmitForm { payload, reply })
            .await?
    }

    pub async fn cancel_form(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::CancelForm { reply }).await?
    }

    /// Start a fresh session; returns its id
    pub async fn new_chat(&self) -> Result<String, ClientError> {
        self.request(|reply| Command::NewChat { reply }).await
    }

    pub async fn session_id(&self) -> Result<String, ClientError> {
        self.request(|reply| Command::SessionId { reply }).await
    }

    pub async fn export_transcript(&self) -> Result<String, ClientError> {
        self.request(|reply| Command::Export { reply }).await
    }

    /// Archived exchanges, newest first
    pub async fn history(&self) -> Result<Vec<HistoryRecord>, ClientError> {
        self.request(|reply| Command::History { reply }).await
    }

    pub async fn delete_history(&self, index: usize) -> Result<Option<HistoryRecord>, ClientError> {
        self.request(|reply| Command::DeleteHistory { index, reply })
            .await?
    }

    pub async fn clear_history(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::ClearHistory { reply }).await?
    }

    pub async fn notice(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::Notice(text.into()))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    pub async fn report_agent_status(&self, status: AgentStatus) -> Result<(), ClientError> {
        self.commands
            .send(Command::AgentStatus(status))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }
}

pub struct Driver<O: Outbound, R: ResultSource> {
    client: ChatClient<O>,
    results: Arc<R>,
    poll_policy: PollPolicy,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    status: Option<watch::Receiver<ConnectionStatus>>,
    delivery_tx: mpsc::UnboundedSender<DeliveryReport>,
    delivery_rx: mpsc::UnboundedReceiver<DeliveryReport>,
    poll_tx: mpsc::UnboundedSender<PollOutcome>,
    poll_rx: mpsc::UnboundedReceiver<PollOutcome>,
    poll: Option<ActivePoll>,
    /// Parent of every spawned task; cancelled when the loop exits
    tasks: CancellationToken,
}

impl<O, R> Driver<O, R>
where
    O: Outbound + Clone + 'static,
    R: ResultSource,
{
    pub fn new(
        client: ChatClient<O>,
        results: Arc<R>,
        poll_policy: PollPolicy,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> (Self, DriverHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let handle = DriverHandle {
            commands: commands_tx,
            events: client.events_sender(),
        };
        let driver = Self {
            client,
            results,
            poll_policy,
            commands,
            inbound,
            status: None,
            delivery_tx,
            delivery_rx,
            poll_tx,
            poll_rx,
            poll: None,
            tasks: CancellationToken::new(),
        };
        (driver, handle)
    }

    /// Follow the push channel's connection status
    pub fn with_status(mut self, status: watch::Receiver<ConnectionStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(session_id = %self.client.session_id(), "Driver started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd);
                }
                Some(event) = self.inbound.recv() => self.client.handle_inbound(event),
                changed = next_status(&mut self.status) => match changed {
                    Some(status) => self.client.on_connection_status(status),
                    None => self.status = None,
                },
                Some(report) = self.delivery_rx.recv() => self.client.delivery_finished(report),
                Some(outcome) = self.poll_rx.recv() => self.on_poll_outcome(outcome),
            }
            self.retire_stale_poll();
            self.maybe_start_poll();
        }
        self.tasks.cancel();
        tracing::info!("Driver stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { text, reply } => {
                let result = self.client.submit(&text).map(|p| self.spawn_delivery(p));
                let _ = reply.send(result);
            }
            Command::SubmitForm { payload, reply } => {
                let result = self.client.submit_form(payload).map(|p| self.spawn_delivery(p));
                let _ = reply.send(result);
            }
            Command::CancelForm { reply } => {
                let _ = reply.send(self.client.cancel_form());
            }
            Command::NewChat { reply } => {
                self.client.new_chat();
                let _ = reply.send(self.client.session_id().to_string());
            }
            Command::SessionId { reply } => {
                let _ = reply.send(self.client.session_id().to_string());
            }
            Command::Export { reply } => {
                let _ = reply.send(self.client.export_transcript());
            }
            Command::History { reply } => {
                let _ = reply.send(self.client.history().load(Utc::now()));
            }
            Command::DeleteHistory { index, reply } => {
                let result = self.client.history().delete(index).map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::ClearHistory { reply } => {
                let result = self.client.history().clear().map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Command::Notice(text) => self.client.append_notice(text),
            Command::AgentStatus(status) => self.client.on_agent_status(status),
        }
    }

    /// The turn is already committed; the backend may take its time
    fn spawn_delivery(&self, pending: PendingDelivery) {
        let outbound = self.client.outbound();
        let tx = self.delivery_tx.clone();
        let cancel = self.tasks.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                report = pending.deliver(&outbound) => {
                    let _ = tx.send(report);
                }
            }
        });
    }

    /// Stop a poll whose exchange is over
    fn retire_stale_poll(&mut self) {
        let Some(poll) = &self.poll else { return };
        let superseded = poll.exchange != self.client.exchange();
        let answered = poll.for_turn && !self.client.state().awaits_result();
        if superseded || answered {
            tracing::info!(exchange = poll.exchange, superseded, "Stopping fallback poll");
            poll.cancel.cancel();
            self.poll = None;
        }
    }

    fn maybe_start_poll(&mut self) {
        if !self.client.take_poll_request() {
            return;
        }
        let exchange = self.client.exchange();
        if self.poll.as_ref().is_some_and(|p| p.exchange == exchange) {
            return;
        }

        let session_id = self.client.session_id().to_string();
        tracing::info!(session_id = %session_id, exchange, budget_s = self.poll_policy.budget().as_secs(), "Starting fallback poll");
        let results = self.results.clone();
        let policy = self.poll_policy;
        let tx = self.poll_tx.clone();
        let cancel = self.tasks.child_token();
        self.poll = Some(ActivePoll {
            exchange,
            for_turn: self.client.state().awaits_result(),
            cancel: cancel.clone(),
        });
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = await_result(results.as_ref(), &session_id, policy) => {
                    let _ = tx.send(PollOutcome { exchange, result });
                }
            }
        });
    }

    fn on_poll_outcome(&mut self, outcome: PollOutcome) {
        if self.poll.as_ref().map(|p| p.exchange) != Some(outcome.exchange) {
            tracing::debug!(exchange = outcome.exchange, "Discarding result of a stopped poll");
            return;
        }
        self.poll = None;
        match outcome.result {
            Ok(content) => self.client.apply_polled_result(content),
            Err(e) if e.kind == TransportErrorKind::Timeout => {
                self.client.poll_exhausted(self.poll_policy.budget());
            }
            Err(e) => self.client.poll_failed(&e),
        }
    }
}

async fn next_status(
    status: &mut Option<watch::Receiver<ConnectionStatus>>,
) -> Option<ConnectionStatus> {
    match status {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => pending().await,
    }
}

/// Check agent liveness every `period` and report it to the driver
pub fn spawn_status_check(
    backend: Arc<HttpBackend>,
    period: Duration,
    handle: DriverHandle,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let status = backend.request_status().await;
                    if handle.report_agent_status(status).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{test_client, MockOutbound, MockResultSource};
    use crate::runtime::Delivery;
    use crate::timeline::Sender;
    use crate::turn::{TurnOutcome, TurnPhase};
    use serde_json::json;

    struct Harness {
        handle: DriverHandle,
        inbound: mpsc::UnboundedSender<InboundEvent>,
        status: watch::Sender<ConnectionStatus>,
        outbound: Arc<MockOutbound>,
        results: Arc<MockResultSource>,
        cancel: CancellationToken,
    }

    fn start() -> Harness {
        let outbound = Arc::new(MockOutbound::new());
        let results = Arc::new(MockResultSource::new());
        let (client, _) = test_client(outbound.clone());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let policy = PollPolicy {
            attempts: 3,
            interval: Duration::from_secs(5),
        };
        let (driver, handle) = Driver::new(client, results.clone(), policy, inbound_rx);
        let cancel = CancellationToken::new();
        tokio::spawn(driver.with_status(status_rx).run(cancel.clone()));
        Harness {
            handle,
            inbound: inbound_tx,
            status: status_tx,
            outbound,
            results,
            cancel,
        }
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<ClientEvent>,
        pred: impl Fn(&ClientEvent) -> bool,
    ) -> ClientEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_response_finishes_turn() {
        let h = start();
        let mut rx = h.handle.subscribe();
        h.handle.submit("Hello").await.unwrap();

        let session = h.handle.session_id().await.unwrap();
        h.inbound.send(InboundEvent::response(session, "Hi", None)).unwrap();

        let finished = next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;
        assert!(matches!(
            finished,
            ClientEvent::TurnFinished {
                outcome: TurnOutcome::Responded,
                ..
            }
        ));
        assert_eq!(h.handle.history().await.unwrap().len(), 1);
        assert!(h.handle.export_transcript().await.unwrap().contains("User: Hello"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_reply_is_polled_and_replaced() {
        let h = start();
        h.outbound
            .push_delivery(Delivery::Immediate("Please wait, your plan is being generated".to_string()));
        h.results.push_pending();
        h.results.push_ready("Day 1: Louvre");
        let mut rx = h.handle.subscribe();

        h.handle.submit("Plan a trip").await.unwrap();
        let replaced = next_matching(&mut rx, |e| matches!(e, ClientEvent::EntryReplaced(_))).await;
        let ClientEvent::EntryReplaced(entry) = replaced else {
            unreachable!()
        };
        assert_eq!(entry.sender, Sender::Agent);
        assert_eq!(entry.content, "Day 1: Louvre");
        assert_eq!(h.results.polls(), 2);

        let history = h.handle.history().await.unwrap();
        assert_eq!(history[0].agent, "Day 1: Louvre");
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_turn_times_out_after_budget() {
        let h = start();
        let mut rx = h.handle.subscribe();
        h.handle.submit("Hello").await.unwrap();

        let started = tokio::time::Instant::now();
        h.status.send(ConnectionStatus::Disconnected).unwrap();

        let finished = next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;
        assert!(matches!(
            finished,
            ClientEvent::TurnFinished {
                outcome: TurnOutcome::TimedOut,
                ..
            }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
        assert_eq!(h.results.polls(), 3);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejected_reaches_caller() {
        let h = start();
        h.outbound.set_connected(false);
        let err = h.handle.submit("Hello").await.unwrap_err();
        assert!(matches!(err, ClientError::SendRejected(_)));

        h.outbound.set_connected(true);
        h.handle.submit("Hello").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.outbound.sent().len(), 1);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_delivery_does_not_block_loop() {
        let h = start();
        h.outbound.push_delayed(
            Duration::from_secs(60),
            Ok(Delivery::Immediate("Flight AF12 at 09:40".to_string())),
        );
        let mut rx = h.handle.subscribe();
        let started = tokio::time::Instant::now();

        h.handle.submit("Find flights").await.unwrap();
        next_matching(&mut rx, |e| {
            matches!(e, ClientEvent::StateChanged { phase: TurnPhase::Thinking })
        })
        .await;
        let session = h.handle.session_id().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        let tools = json!({
            "type": "toolExecution",
            "sessionId": session,
            "data": {
                "batchId": "b1",
                "toolExecutions": [{"toolName": "search_flights", "executing": true}]
            }
        });
        h.inbound
            .send(InboundEvent::parse(&tools.to_string()).unwrap())
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::ToolsUpdated(_))).await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        let finished = next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;
        assert!(matches!(
            finished,
            ClientEvent::TurnFinished {
                outcome: TurnOutcome::Responded,
                ..
            }
        ));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(h.handle.history().await.unwrap()[0].agent, "Flight AF12 at 09:40");
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_of_finished_turn_does_not_feed_next_turn() {
        let h = start();
        let mut rx = h.handle.subscribe();
        h.handle.submit("Hello").await.unwrap();
        h.status.send(ConnectionStatus::Disconnected).unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::ConnectionChanged(_))).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.results.polls(), 1);

        // Push channel is back and delivers the answer itself
        h.status.send(ConnectionStatus::Connected).unwrap();
        let session = h.handle.session_id().await.unwrap();
        h.inbound
            .send(InboundEvent::response(session.clone(), "Hi", None))
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;

        h.results.push_ready("stale answer");
        h.handle.submit("And tomorrow?").await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.results.polls(), 1);

        h.inbound
            .send(InboundEvent::response(session, "Rain tomorrow", None))
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;
        let history = h.handle.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].agent, "Rain tomorrow");
        assert!(!h.handle.export_transcript().await.unwrap().contains("stale answer"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_poll_stops_when_next_turn_starts() {
        let h = start();
        h.outbound
            .push_delivery(Delivery::Immediate("Please wait, searching hotels".to_string()));
        let mut rx = h.handle.subscribe();
        h.handle.submit("Find a hotel").await.unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::TurnFinished { .. })).await;

        h.handle.submit("Actually, find a car").await.unwrap();
        h.results.push_ready("Hotel Lutetia");
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(h.results.polls(), 0);
        let transcript = h.handle.export_transcript().await.unwrap();
        assert!(!transcript.contains("Hotel Lutetia"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_chat_stops_poll_of_old_session() {
        let h = start();
        let mut rx = h.handle.subscribe();
        h.handle.submit("Hello").await.unwrap();
        h.status.send(ConnectionStatus::Disconnected).unwrap();
        next_matching(&mut rx, |e| matches!(e, ClientEvent::ConnectionChanged(_))).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        h.results.push_ready("late answer");
        h.handle.new_chat().await.unwrap();
        let mut rx = h.handle.subscribe();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.results.polls(), 1);

        h.handle.notice("marker").await.unwrap();
        let event = next_matching(&mut rx, |e| {
            matches!(e, ClientEvent::EntryAppended(_) | ClientEvent::EntryReplaced(_))
        })
        .await;
        assert!(matches!(event, ClientEvent::EntryAppended(entry) if entry.content == "marker"));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_reports_stopped_driver() {
        let h = start();
        h.cancel.cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            h.handle.submit("Hello").await,
            Err(ClientError::Stopped)
        ));
    }
}
