//! Property-based tests for the turn state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::effect::Effect;
use super::event::TurnEvent;
use super::state::*;
use super::transition::*;
use super::PhraseMatcher;
use crate::protocol::{FormRequest, OutboundMessage, ToolBatch, ToolExecution};
use chrono::DateTime;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn test_context() -> TurnContext {
    TurnContext::new(
        "s1",
        Arc::new(PhraseMatcher::trigger_phrases().expect("default phrases compile")),
    )
}

fn test_turn() -> Turn {
    Turn::new(
        "s1",
        "Plan a trip",
        DateTime::from_timestamp_millis(1_700_000_000_000).expect("valid timestamp"),
    )
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_tool_batch() -> impl Strategy<Value = ToolBatch> {
    (
        "b[0-3]",
        proptest::collection::vec((any::<bool>(), any::<bool>()), 1..4),
    )
        .prop_map(|(batch_id, tools)| ToolBatch {
            batch_id,
            tool_executions: tools
                .into_iter()
                .map(|(executing, success)| ToolExecution {
                    tool_name: "search".to_string(),
                    arguments: Value::String("{}".to_string()),
                    executing,
                    success,
                    result: None,
                    error_message: None,
                    duration: 0,
                })
                .collect(),
            execution_mode: None,
        })
}

fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z ]{0,30}",
        Just("Please provide your destination".to_string()),
        Just("请选择酒店".to_string()),
    ]
}

fn arb_state() -> impl Strategy<Value = TurnState> {
    prop_oneof![
        Just(TurnState::Idle),
        Just(TurnState::Thinking { turn: test_turn() }),
        Just(TurnState::ToolExecuting { turn: test_turn() }),
        Just(TurnState::Responding { turn: test_turn() }),
        arb_text().prop_map(|prompt| TurnState::AwaitingUserInput {
            turn: test_turn(),
            prompt
        }),
        Just(TurnState::AwaitingForm {
            turn: test_turn(),
            form: FormRequest {
                title: "Trip".to_string(),
                description: String::new(),
                schema: json!({}),
            },
        }),
    ]
}

fn arb_busy_state() -> impl Strategy<Value = TurnState> {
    prop_oneof![
        Just(TurnState::Thinking { turn: test_turn() }),
        Just(TurnState::ToolExecuting { turn: test_turn() }),
        Just(TurnState::Responding { turn: test_turn() }),
    ]
}

fn arb_event() -> impl Strategy<Value = TurnEvent> {
    let at = DateTime::from_timestamp_millis(1_700_000_001_000).expect("valid timestamp");
    prop_oneof![
        arb_text().prop_map(move |text| TurnEvent::UserMessage { text, at }),
        Just(TurnEvent::FormSubmitted {
            payload: json!({"city": "Paris"})
        }),
        Just(TurnEvent::Cancel),
        arb_tool_batch().prop_map(|batch| TurnEvent::ToolExecution { batch }),
        arb_text().prop_map(|content| TurnEvent::Response { content }),
        Just(TurnEvent::ResponseRendered),
        arb_text().prop_map(move |prompt| TurnEvent::UserInputRequired { prompt, at }),
        Just(TurnEvent::UserInputFormRequired {
            form: FormRequest {
                title: "Details".to_string(),
                description: String::new(),
                schema: Value::Null,
            },
            at,
        }),
        "[a-z ]{1,20}".prop_map(|message| TurnEvent::BackendError { message }),
        (1u64..600).prop_map(|s| TurnEvent::TimedOut {
            waited: Duration::from_secs(s)
        }),
    ]
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Busy states reject user messages and produce nothing
    #[test]
    fn busy_states_reject_user_messages(state in arb_busy_state(), text in "[a-zA-Z]{1,20}") {
        let event = TurnEvent::UserMessage {
            text,
            at: DateTime::from_timestamp_millis(0).expect("valid timestamp"),
        };
        let result = transition(&state, &test_context(), event);
        prop_assert_eq!(result.unwrap_err(), TransitionError::TurnInProgress);
    }

    /// A send, when present, is always the first effect
    #[test]
    fn send_is_first_effect(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, &test_context(), event) {
            for (i, effect) in result.effects.iter().enumerate() {
                if matches!(effect, Effect::Send(_)) {
                    prop_assert_eq!(i, 0);
                }
            }
        }
    }

    /// Every accepted event moves the machine or emits an effect
    #[test]
    fn accepted_events_are_observable(state in arb_state(), event in arb_event()) {
        if let Ok(result) = transition(&state, &test_context(), event) {
            prop_assert!(result.new_state != state || !result.effects.is_empty());
        }
    }

    /// Errors and timeouts always land in Idle
    #[test]
    fn failures_return_to_idle(state in arb_state(), message in "[a-z]{1,10}") {
        let result = transition(&state, &test_context(), TurnEvent::BackendError { message });
        match result {
            Ok(r) => prop_assert!(r.new_state.is_idle()),
            Err(_) => prop_assert!(state.is_idle()),
        }
    }

    /// Only Idle opens a new turn with a chat message; continuations use human input
    #[test]
    fn new_turns_only_from_idle(events in proptest::collection::vec(arb_event(), 1..30)) {
        let ctx = test_context();
        let mut state = TurnState::Idle;
        let mut active = 0usize;
        for event in events {
            let was_idle = state.is_idle();
            if let Ok(result) = transition(&state, &ctx, event) {
                for effect in &result.effects {
                    if let Effect::Send(OutboundMessage::Chat(_)) = effect {
                        prop_assert!(was_idle);
                        active += 1;
                    }
                }
                if result.new_state.is_idle() {
                    active = 0;
                }
                state = result.new_state;
            }
            prop_assert!(active <= 1);
        }
    }

    /// Tool records never go back to executing once completed
    #[test]
    fn tool_records_complete_once(batches in proptest::collection::vec(arb_tool_batch(), 1..10)) {
        let ctx = test_context();
        let mut state = TurnState::Thinking { turn: test_turn() };
        let mut completed: Vec<(String, usize)> = Vec::new();
        for batch in batches {
            let Ok(result) = transition(&state, &ctx, TurnEvent::ToolExecution { batch }) else {
                continue;
            };
            state = result.new_state;
            let turn = state.turn().expect("tool events keep the turn");
            for key in &completed {
                let record = turn
                    .tools
                    .iter()
                    .find(|t| t.batch_id == key.0 && t.index == key.1)
                    .expect("records are never removed");
                prop_assert!(!record.executing);
            }
            completed = turn
                .tools
                .iter()
                .filter(|t| !t.executing)
                .map(|t| (t.batch_id.clone(), t.index))
                .collect();
        }
    }
}
