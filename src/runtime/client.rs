//! Session-owning chat client

use super::traits::{Delivery, Outbound};
use super::{ClientError, ClientEvent};
use crate::dedup::{Deduplicator, DEFAULT_MAX_ENTRIES, DEFAULT_RETAIN};
use crate::history::{HistoryRecord, HistoryStore};
use crate::protocol::{EventPayload, InboundEvent, OutboundMessage};
use crate::timeline::{export_text, ConversationEntry, Sender, Timeline};
use crate::transport::{AgentStatus, ConnectionStatus, TransportError, TransportErrorKind};
use crate::turn::{
    transition, Effect, InputRequestDetector, PhraseMatcher, TransitionError, TurnContext,
    TurnEvent, TurnOutcome, TurnState,
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const EVENT_CAPACITY: usize = 256;

/// Construction-time knobs of a [`ChatClient`]
#[derive(Clone)]
pub struct ClientSettings {
    /// Decides whether a response asks the user something
    pub detector: Arc<dyn InputRequestDetector>,
    /// Recognizes stand-in replies whose real result must be polled
    pub placeholder: PhraseMatcher,
    pub dedup_max_entries: usize,
    pub dedup_retain: usize,
}

impl ClientSettings {
    pub fn with_defaults() -> Result<Self, regex::Error> {
        Ok(Self {
            detector: Arc::new(PhraseMatcher::trigger_phrases()?),
            placeholder: PhraseMatcher::placeholder_phrases()?,
            dedup_max_entries: DEFAULT_MAX_ENTRIES,
            dedup_retain: DEFAULT_RETAIN,
        })
    }
}

/// A committed user message that still has to reach the backend
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    /// Exchange the message opened
    pub exchange: u64,
    pub message: OutboundMessage,
}

impl PendingDelivery {
    /// Run the delivery. May take as long as the backend takes to answer.
    pub async fn deliver<O: Outbound + ?Sized>(self, outbound: &O) -> DeliveryReport {
        let started = Instant::now();
        let result = outbound.deliver(&self.message).await;
        DeliveryReport {
            exchange: self.exchange,
            result,
            elapsed: started.elapsed(),
        }
    }
}

/// Outcome of a [`PendingDelivery`], fed back through [`ChatClient::delivery_finished`]
#[derive(Debug)]
pub struct DeliveryReport {
    pub exchange: u64,
    pub result: Result<Delivery, TransportError>,
    pub elapsed: Duration,
}

/// Application context for one chat session.
///
/// Every mutation goes through here: inbound events are filtered by session,
/// deduplicated and fed to the turn state machine, and the resulting effects
/// are applied to the timeline and history store.
pub struct ChatClient<O: Outbound> {
    context: TurnContext,
    state: TurnState,
    dedup: Deduplicator,
    timeline: Timeline,
    history: HistoryStore,
    outbound: O,
    placeholder: PhraseMatcher,
    events: broadcast::Sender<ClientEvent>,
    /// Bumped by every delivered user message and by a new chat
    exchange: u64,
    poll_requested: bool,
    agent_status: Option<AgentStatus>,
}

impl<O: Outbound> ChatClient<O> {
    pub fn new(outbound: O, history: HistoryStore, settings: ClientSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let session_id = new_session_id();
        tracing::info!(session_id = %session_id, "Starting chat session");
        Self {
            context: TurnContext::new(session_id, settings.detector),
            state: TurnState::Idle,
            dedup: Deduplicator::new(settings.dedup_max_entries, settings.dedup_retain),
            timeline: Timeline::new(),
            history,
            outbound,
            placeholder: settings.placeholder,
            events,
            exchange: 0,
            poll_requested: false,
            agent_status: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn exchange(&self) -> u64 {
        self.exchange
    }

    pub fn outbound(&self) -> O
    where
        O: Clone,
    {
        self.outbound.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(super) fn events_sender(&self) -> broadcast::Sender<ClientEvent> {
        self.events.clone()
    }

    /// Send a user message: a new turn from idle, or the reply to a pending
    /// question.
    ///
    /// The turn is committed right away and the returned delivery is run by
    /// the caller. On [`ClientError::SendRejected`] the state and timeline are
    /// untouched.
    pub fn submit(&mut self, text: &str) -> Result<PendingDelivery, ClientError> {
        self.dispatch(TurnEvent::UserMessage {
            text: text.to_string(),
            at: Utc::now(),
        })
    }

    /// Answer a pending form
    pub fn submit_form(&mut self, payload: Value) -> Result<PendingDelivery, ClientError> {
        self.dispatch(TurnEvent::FormSubmitted { payload })
    }

    /// Apply the outcome of a delivery started by [`submit`](Self::submit)
    pub fn delivery_finished(&mut self, report: DeliveryReport) {
        if report.exchange != self.exchange {
            tracing::debug!(
                exchange = report.exchange,
                current = self.exchange,
                "Discarding delivery outcome of an earlier exchange"
            );
            return;
        }
        match report.result {
            Ok(Delivery::Pushed) => {}
            Ok(Delivery::Immediate(body)) => self.accept_immediate(body),
            Err(e) => self.delivery_failed(&e, report.elapsed),
        }
    }

    /// Dismiss a pending form
    pub fn cancel_form(&mut self) -> Result<(), ClientError> {
        self.apply(TurnEvent::Cancel)?;
        Ok(())
    }

    /// Feed one event from any inbound channel
    pub fn handle_inbound(&mut self, event: InboundEvent) {
        if !event.belongs_to(self.session_id()) {
            tracing::trace!(session_id = %event.session_id, "Ignoring event for another session");
            return;
        }
        if event.is_heartbeat() || !self.dedup.accept(&event, self.exchange) {
            return;
        }

        let at = Utc::now();
        let (turn_event, error_text) = match event.payload {
            EventPayload::Response { content } => (TurnEvent::Response { content }, None),
            EventPayload::ToolExecution(batch) => (TurnEvent::ToolExecution { batch }, None),
            EventPayload::UserInputRequired { prompt } => {
                (TurnEvent::UserInputRequired { prompt, at }, None)
            }
            EventPayload::UserInputFormRequired(form) => {
                (TurnEvent::UserInputFormRequired { form, at }, None)
            }
            EventPayload::Error { message } => (
                TurnEvent::BackendError {
                    message: message.clone(),
                },
                Some(message),
            ),
            EventPayload::Heartbeat => return,
        };

        let name = turn_event.name();
        if let Err(e) = self.apply(turn_event) {
            tracing::debug!(event = name, phase = %self.state.phase(), error = %e, "Inbound event not applicable");
            // Errors outside a turn are still worth showing
            if let Some(message) = error_text {
                self.warn(format!("Error: {message}"));
            }
        }
    }

    /// Start over with a fresh session. History is kept.
    pub fn new_chat(&mut self) {
        let session_id = new_session_id();
        tracing::info!(
            previous = %self.context.session_id,
            session_id = %session_id,
            forgotten = self.dedup.len(),
            "New chat session"
        );
        self.context.session_id = session_id;
        self.exchange += 1;
        self.dedup.reset();
        self.timeline.clear();
        self.poll_requested = false;

        let abandoned = std::mem::take(&mut self.state);
        if let Some(turn) = abandoned.turn() {
            self.emit(ClientEvent::StateChanged {
                phase: self.state.phase(),
            });
            self.emit(ClientEvent::TurnFinished {
                turn_id: turn.id.clone(),
                outcome: TurnOutcome::Cancelled,
            });
        }
    }

    /// Add a local agent-side notice (upload confirmations, status replies)
    pub fn append_notice(&mut self, content: impl Into<String>) {
        let entry = ConversationEntry {
            sender: Sender::Agent,
            content: content.into(),
            timestamp: Utc::now(),
        };
        self.timeline.append(entry.clone());
        self.emit(ClientEvent::EntryAppended(entry));
    }

    pub fn on_connection_status(&mut self, status: ConnectionStatus) {
        tracing::info!(status = %status, phase = %self.state.phase(), "Connection status changed");
        self.emit(ClientEvent::ConnectionChanged(status));
        if status == ConnectionStatus::Disconnected && self.state.awaits_result() {
            tracing::info!(session_id = %self.session_id(), "Push channel lost mid-turn, falling back to polling");
            self.poll_requested = true;
        }
    }

    pub fn on_agent_status(&mut self, status: AgentStatus) {
        if self.agent_status.as_ref() == Some(&status) {
            return;
        }
        tracing::info!(online = status.is_online(), "Agent status changed");
        self.agent_status = Some(status.clone());
        self.emit(ClientEvent::AgentStatusChanged(status));
    }

    /// Whether a fallback poll should be started; clears the request
    pub fn take_poll_request(&mut self) -> bool {
        std::mem::take(&mut self.poll_requested)
    }

    /// A result fetched by fallback polling.
    ///
    /// While the turn still waits it becomes the turn's response; otherwise it
    /// supersedes the placeholder already shown and archived.
    pub fn apply_polled_result(&mut self, content: String) {
        if self.state.awaits_result() {
            let event = InboundEvent::response(
                self.session_id(),
                content,
                Some(Utc::now().timestamp_millis()),
            );
            self.handle_inbound(event);
            return;
        }

        if self.timeline.replace_last(Sender::Agent, content.as_str()) {
            if let Some(entry) = self
                .timeline
                .entries()
                .iter()
                .rev()
                .find(|e| e.sender == Sender::Agent)
                .cloned()
            {
                self.emit(ClientEvent::EntryReplaced(entry));
            }
        } else {
            self.append_notice(content.clone());
        }

        let session_id = self.session_id().to_string();
        match self
            .history
            .replace_latest_agent_message(&session_id, &content)
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(session_id = %session_id, "No archived exchange to update"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to update archived exchange");
                self.warn(e.to_string());
            }
        }
    }

    /// Polling spent its budget without a result
    pub fn poll_exhausted(&mut self, waited: Duration) {
        if self.state.awaits_result() {
            if let Err(e) = self.apply(TurnEvent::TimedOut { waited }) {
                tracing::warn!(error = %e, "Failed to time out turn");
            }
        } else {
            self.warn(format!(
                "The final result was not available after {}s",
                waited.as_secs()
            ));
        }
    }

    /// Polling hit a non-retryable error
    pub fn poll_failed(&mut self, error: &TransportError) {
        if self.state.awaits_result() {
            if let Err(e) = self.apply(TurnEvent::BackendError {
                message: error.to_string(),
            }) {
                tracing::warn!(error = %e, "Failed to end turn after poll error");
            }
        } else {
            self.warn(format!("Fetching the final result failed: {error}"));
        }
    }

    /// Transcript of the archived (non-expired) exchanges
    pub fn export_transcript(&self) -> String {
        let mut records: Vec<HistoryRecord> = self.history.load(Utc::now());
        records.reverse();
        export_text(&records)
    }

    // ========================================================================
    // Transition plumbing
    // ========================================================================

    /// Commit a user event whose first effect is a delivery
    fn dispatch(&mut self, event: TurnEvent) -> Result<PendingDelivery, ClientError> {
        let name = event.name();
        let result = transition(&self.state, &self.context, event)?;
        let mut effects = result.effects.into_iter().peekable();

        let Some(Effect::Send(message)) = effects.next_if(|e| matches!(e, Effect::Send(_)))
        else {
            return Err(
                TransitionError::InvalidTransition(format!("{name} has nothing to send")).into(),
            );
        };
        if let Err(e) = self.outbound.ready() {
            tracing::warn!(event = name, error = %e, "Cannot deliver, nothing committed");
            return Err(ClientError::SendRejected(e));
        }

        self.exchange += 1;
        let follow_ups = self.commit(result.new_state, effects.collect());
        for event in follow_ups {
            self.apply(event)?;
        }
        Ok(PendingDelivery {
            exchange: self.exchange,
            message,
        })
    }

    /// The turn was committed but its message failed
    fn delivery_failed(&mut self, error: &TransportError, elapsed: Duration) {
        tracing::warn!(
            error = %error,
            kind = ?error.kind,
            waited_s = elapsed.as_secs(),
            "Delivery failed"
        );
        let event = match error.kind {
            TransportErrorKind::Timeout => TurnEvent::TimedOut { waited: elapsed },
            kind if kind.never_sent() => TurnEvent::BackendError {
                message: format!("Message not sent: {error}"),
            },
            _ => TurnEvent::BackendError {
                message: error.to_string(),
            },
        };
        if let Err(e) = self.apply(event) {
            tracing::debug!(phase = %self.state.phase(), error = %e, "Delivery failure after the turn moved on");
            self.warn(format!("Delivery failed: {error}"));
        }
    }

    /// Run an event and any follow-ups it triggers
    fn apply(&mut self, event: TurnEvent) -> Result<(), TransitionError> {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let name = event.name();
            let result = transition(&self.state, &self.context, event)?;
            tracing::debug!(event = name, from = %self.state.phase(), to = %result.new_state.phase(), "Transition");
            pending.extend(self.commit(result.new_state, result.effects));
        }
        Ok(())
    }

    fn commit(&mut self, new_state: TurnState, effects: Vec<Effect>) -> Vec<TurnEvent> {
        let before = self.state.phase();
        self.state = new_state;
        if self.state.phase() != before {
            self.emit(ClientEvent::StateChanged {
                phase: self.state.phase(),
            });
        }

        let mut follow_ups = Vec::new();
        for effect in effects {
            match effect {
                Effect::Send(message) => {
                    tracing::warn!(session_id = %message.session_id(), "Send effect outside a user action ignored");
                }
                Effect::AppendEntry { sender, content } => {
                    let entry = ConversationEntry {
                        sender,
                        content,
                        timestamp: Utc::now(),
                    };
                    self.timeline.append(entry.clone());
                    self.emit(ClientEvent::EntryAppended(entry));
                }
                Effect::AppendPrompt { content } => {
                    if self
                        .timeline
                        .append_unless_last(Sender::Agent, &content, Utc::now())
                    {
                        if let Some(entry) = self.timeline.last().cloned() {
                            self.emit(ClientEvent::EntryAppended(entry));
                        }
                    }
                }
                Effect::RecordHistory { user, agent } => {
                    let record = HistoryRecord {
                        session_id: self.context.session_id.clone(),
                        timestamp: Utc::now().timestamp_millis(),
                        user,
                        agent,
                    };
                    if let Err(e) = self.history.record(record) {
                        tracing::warn!(error = %e, "Exchange not archived");
                        self.warn(e.to_string());
                    }
                }
                Effect::Settle => follow_ups.push(TurnEvent::ResponseRendered),
                Effect::ToolsUpdated { tools } => self.emit(ClientEvent::ToolsUpdated(tools)),
                Effect::TurnFinished { turn_id, outcome } => {
                    tracing::info!(turn_id = %turn_id, outcome = ?outcome, "Turn finished");
                    self.emit(ClientEvent::TurnFinished { turn_id, outcome });
                }
            }
        }
        follow_ups
    }

    /// A result returned with the request joins the inbound pipeline
    fn accept_immediate(&mut self, body: String) {
        let placeholder = self.placeholder.matches(&body);
        // Stamped locally so the same text in a later turn is not a duplicate
        let event = InboundEvent::response(
            self.session_id(),
            body,
            Some(Utc::now().timestamp_millis()),
        );
        self.handle_inbound(event);
        if placeholder {
            tracing::info!(session_id = %self.session_id(), "Placeholder reply, polling for the result");
            self.poll_requested = true;
        }
    }

    fn warn(&self, message: String) {
        self.emit(ClientEvent::Warning(message));
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// `session_<millis>_<9 random chars>`
fn new_session_id() -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(9)
        .collect();
    format!("session_{}_{suffix}", Utc::now().timestamp_millis())
}
