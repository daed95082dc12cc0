//! Pure turn transition function

use super::effect::{Effect, TurnOutcome};
use super::event::TurnEvent;
use super::state::{Turn, TurnContext, TurnState};
use crate::protocol::OutboundMessage;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("A turn is already in progress; wait for the agent to finish")]
    TurnInProgress,
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function.
///
/// Given the same inputs it always produces the same outputs; all I/O is
/// expressed as [`Effect`]s for the runtime to execute.
#[allow(clippy::too_many_lines)]
pub fn transition(
    state: &TurnState,
    context: &TurnContext,
    event: TurnEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // User messages
        // ============================================================

        // Busy states reject without side effects
        (
            TurnState::Thinking { .. } | TurnState::ToolExecuting { .. } | TurnState::Responding { .. },
            TurnEvent::UserMessage { .. },
        ) => Err(TransitionError::TurnInProgress),

        (_, TurnEvent::UserMessage { text, .. }) if text.trim().is_empty() => {
            Err(TransitionError::EmptyMessage)
        }

        // Idle + UserMessage -> Thinking (new turn)
        (TurnState::Idle, TurnEvent::UserMessage { text, at }) => {
            let turn = Turn::new(&context.session_id, text.clone(), at);
            Ok(TransitionResult::new(TurnState::Thinking { turn })
                .with_effect(Effect::Send(OutboundMessage::chat(&context.session_id, &text)))
                .with_effect(Effect::user_entry(text)))
        }

        // Awaiting input + UserMessage -> Thinking (same turn)
        (
            TurnState::AwaitingUserInput { turn, .. } | TurnState::AwaitingForm { turn, .. },
            TurnEvent::UserMessage { text, .. },
        ) => {
            let mut turn = turn.clone();
            turn.replies.push(text.clone());
            turn.response = None;
            Ok(TransitionResult::new(TurnState::Thinking { turn })
                .with_effect(Effect::Send(OutboundMessage::human_input(
                    &context.session_id,
                    &text,
                )))
                .with_effect(Effect::user_entry(text)))
        }

        // ============================================================
        // Forms
        // ============================================================
        (TurnState::AwaitingForm { turn, .. }, TurnEvent::FormSubmitted { payload }) => {
            let summary = payload.to_string();
            let mut turn = turn.clone();
            turn.replies.push(summary.clone());
            turn.response = None;
            Ok(TransitionResult::new(TurnState::Thinking { turn })
                .with_effect(Effect::Send(OutboundMessage::form(&context.session_id, payload)))
                .with_effect(Effect::user_entry(summary)))
        }

        // Cancel is local only: nothing is sent
        (TurnState::AwaitingForm { turn, .. }, TurnEvent::Cancel) => {
            Ok(TransitionResult::new(TurnState::Idle)
                .with_effect(Effect::finished(&turn.id, TurnOutcome::Cancelled)))
        }

        // ============================================================
        // Tool execution
        // ============================================================
        (
            TurnState::Thinking { turn } | TurnState::ToolExecuting { turn },
            TurnEvent::ToolExecution { batch },
        ) => {
            let mut turn = turn.clone();
            turn.upsert_tools(&batch);
            let tools = turn.tools.clone();
            let next = if turn.has_executing_tools() {
                TurnState::ToolExecuting { turn }
            } else {
                // Completion of a batch waits for the final response
                TurnState::Thinking { turn }
            };
            Ok(TransitionResult::new(next).with_effect(Effect::ToolsUpdated { tools }))
        }

        // ============================================================
        // Responses
        // ============================================================
        (
            TurnState::Thinking { turn } | TurnState::ToolExecuting { turn },
            TurnEvent::Response { content },
        ) => {
            let mut turn = turn.clone();
            turn.response = Some(content.clone());
            let user = turn.latest_user_text().to_string();
            Ok(TransitionResult::new(TurnState::Responding { turn })
                .with_effect(Effect::agent_entry(content.clone()))
                .with_effect(Effect::RecordHistory {
                    user,
                    agent: content,
                })
                .with_effect(Effect::Settle))
        }

        // Responding + ResponseRendered -> AwaitingUserInput | Idle
        (TurnState::Responding { turn }, TurnEvent::ResponseRendered) => {
            let response = turn.response.clone().unwrap_or_default();
            if context.detector.is_input_request(&response) {
                Ok(TransitionResult::new(TurnState::AwaitingUserInput {
                    turn: turn.clone(),
                    prompt: response,
                }))
            } else {
                Ok(TransitionResult::new(TurnState::Idle)
                    .with_effect(Effect::finished(&turn.id, TurnOutcome::Responded)))
            }
        }

        // ============================================================
        // Input requests
        // ============================================================
        (_, TurnEvent::UserInputRequired { prompt, at }) => {
            let turn = prompt_target(state, context, at)?;
            Ok(
                TransitionResult::new(TurnState::AwaitingUserInput {
                    turn,
                    prompt: prompt.clone(),
                })
                .with_effect(Effect::AppendPrompt { content: prompt }),
            )
        }

        (_, TurnEvent::UserInputFormRequired { form, at }) => {
            let turn = prompt_target(state, context, at)?;
            let content = form.display_text();
            Ok(TransitionResult::new(TurnState::AwaitingForm { turn, form })
                .with_effect(Effect::AppendPrompt { content }))
        }

        // ============================================================
        // Errors
        // ============================================================
        (TurnState::Idle, TurnEvent::BackendError { .. }) => Err(TransitionError::InvalidTransition(
            "backend error with no active turn".to_string(),
        )),

        (state, TurnEvent::BackendError { message }) => {
            let turn_id = state.turn().map(|t| t.id.clone()).unwrap_or_default();
            Ok(TransitionResult::new(TurnState::Idle).with_effects([
                Effect::agent_entry(format!("Error: {message}")),
                Effect::finished(&turn_id, TurnOutcome::Errored),
            ]))
        }

        (
            TurnState::Thinking { turn } | TurnState::ToolExecuting { turn },
            TurnEvent::TimedOut { waited },
        ) => Ok(TransitionResult::new(TurnState::Idle).with_effects([
            Effect::agent_entry(format!(
                "Timed out after {}s waiting for the agent. It may still be working; try again later.",
                waited.as_secs()
            )),
            Effect::finished(&turn.id, TurnOutcome::TimedOut),
        ])),

        // ============================================================
        // Everything else is rejected
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "{} in state {}",
            event.name(),
            state.phase()
        ))),
    }
}

/// Turn that a prompt or form request attaches to.
///
/// A prompt arriving after the response already settled reopens the session
/// as a continuation with no user message of its own.
fn prompt_target(
    state: &TurnState,
    context: &TurnContext,
    at: DateTime<Utc>,
) -> Result<Turn, TransitionError> {
    match state {
        TurnState::Idle => Ok(Turn::new(&context.session_id, String::new(), at)),
        TurnState::Thinking { turn }
        | TurnState::Responding { turn }
        | TurnState::AwaitingUserInput { turn, .. }
        | TurnState::AwaitingForm { turn, .. } => Ok(turn.clone()),
        TurnState::ToolExecuting { .. } => Err(TransitionError::InvalidTransition(
            "input request while tools are executing".to_string(),
        )),
    }
}
