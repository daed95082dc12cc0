//! Turn state machine
//!
//! Elm-style: [`transition`] is pure and returns effects that the runtime
//! executes. One turn per session may be active at a time.

mod detector;
mod effect;
mod event;
mod state;
mod transition;

#[cfg(test)]
mod proptests;

pub use detector::{
    InputRequestDetector, PhraseMatcher, DEFAULT_PLACEHOLDER_PHRASES, DEFAULT_TRIGGER_PHRASES,
};
pub use effect::{Effect, TurnOutcome};
pub use event::TurnEvent;
pub use state::{ToolExecutionRecord, Turn, TurnContext, TurnPhase, TurnState};
pub use transition::{transition, TransitionError, TransitionResult};
