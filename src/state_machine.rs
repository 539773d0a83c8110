//! State machine for a voice conversation
//!
//! This module implements the conversation lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.
//!
//! ```text
//! Idle ──Start──▶ Initializing ──(capture + connection ready)──▶ Listening ⇄ Speaking
//!   ▲                                                                  │
//!   └────────Reset──── Error ◀──── any failure ────────────────────────┘
//!                      Closed ◀─── Close (from anywhere, terminal)
//! ```

use serde::Serialize;
use uuid::Uuid;

use crate::audio::capture::CaptureError;
use crate::session::SessionError;

/// Internal state of the conversation.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Idle,
    Initializing {
        session_id: Uuid,
        capture_ready: bool,
        connected: bool,
    },
    Listening {
        session_id: Uuid,
    },
    Speaking {
        session_id: Uuid,
    },
    Error {
        error: SessionError,
    },
    Closed,
}

impl State {
    /// Id of the start attempt this state belongs to, if one is in flight
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Initializing { session_id, .. }
            | State::Listening { session_id }
            | State::Speaking { session_id } => Some(*session_id),
            State::Idle | State::Error { .. } | State::Closed => None,
        }
    }

    /// Projection for observers
    pub fn public(&self) -> ConversationState {
        match self {
            State::Idle => ConversationState::Idle,
            State::Initializing { .. } => ConversationState::Initializing,
            State::Listening { .. } => ConversationState::Listening,
            State::Speaking { .. } => ConversationState::Speaking,
            State::Error { error } => ConversationState::Error {
                message: error.to_string(),
                error: error.clone(),
            },
            State::Closed => ConversationState::Closed,
        }
    }
}

/// Conversation state as seen by the UI.
/// Uses tagged union format: `{ "status": "listening" }` or
/// `{ "status": "error", "message": "...", "error": {...} }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ConversationState {
    Idle,
    Initializing,
    Listening,
    Speaking,
    Error { message: String, error: SessionError },
    Closed,
}

impl ConversationState {
    /// No further transitions without caller action
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationState::Error { .. } | ConversationState::Closed)
    }
}

/// Events that can trigger state transitions.
/// These come from the handle (start/reset/close), device acquisition,
/// the connection task and the inbound event stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked to start a conversation
    Start,
    /// Caller asked to stop and return to Idle
    Reset,
    /// Caller asked to close the session for good
    Close,

    // Device events
    CaptureReady {
        id: Uuid,
    },
    CaptureFailed {
        id: Uuid,
        error: CaptureError,
    },
    OutputFailed {
        id: Uuid,
        message: String,
    },

    // Connection events
    Connected {
        id: Uuid,
    },
    ConnectFailed {
        id: Uuid,
        message: String,
    },
    StreamFailed {
        id: Uuid,
        message: String,
    },

    // Conversation events
    /// Audio or model transcript arrived for the current turn
    ModelOutput {
        id: Uuid,
    },
    /// Every scheduled buffer finished playing
    PlaybackDrained {
        id: Uuid,
    },
    /// Barge-in reported by the engine
    Interrupted {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
/// The session actor runs these in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Open the speaker and acquire the microphone
    AcquireDevices { id: Uuid },
    /// Connect to the engine (capture already granted)
    OpenConnection { id: Uuid },
    /// Anchor the playback cursor at the current clock
    ResetTimeline,
    /// Stop every scheduled buffer and rewind the cursor
    StopPlayback,
    /// Drop the model's unfinished turn from the transcript
    DiscardModelTranscript,
    /// Release microphone, speaker and connection
    Teardown,
    /// Publish a new snapshot to observers
    EmitState,
}

fn fail(error: SessionError) -> (State, Vec<Effect>) {
    (
        State::Error { error },
        vec![Effect::Teardown, Effect::EmitState],
    )
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Every fatal failure tears down and lands in Error
/// - Close wins from any state
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();

    // Helper: check if event's ID belongs to another start attempt
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Close / Reset (any state)
        // -----------------
        (Closed, _) => (Closed, vec![]),
        (_, Close) => (Closed, vec![Teardown, EmitState]),

        (Idle, Reset) => (Idle, vec![]),
        (Error { .. }, Reset) => (Idle, vec![EmitState]),
        (_, Reset) => (Idle, vec![Teardown, EmitState]),

        // -----------------
        // Idle
        // -----------------
        (Idle, Start) => {
            let id = Uuid::new_v4();
            (
                Initializing {
                    session_id: id,
                    capture_ready: false,
                    connected: false,
                },
                vec![AcquireDevices { id }, EmitState],
            )
        }

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureReady { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, OutputFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, Connected { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, ConnectFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, StreamFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ModelOutput { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackDrained { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, Interrupted { id }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Fatal failures (current attempt)
        // -----------------
        (_, CaptureFailed { error, .. }) => fail(SessionError::from(error)),
        (_, OutputFailed { message, .. }) => fail(SessionError::DeviceUnavailable(message)),
        (_, ConnectFailed { message, .. }) => fail(SessionError::ConnectionFailed(message)),
        (_, StreamFailed { message, .. }) => fail(SessionError::StreamError(message)),

        // -----------------
        // Initializing
        // -----------------
        (
            Initializing {
                session_id,
                connected,
                ..
            },
            CaptureReady { .. },
        ) => {
            if *connected {
                (
                    Listening {
                        session_id: *session_id,
                    },
                    vec![ResetTimeline, EmitState],
                )
            } else {
                (
                    Initializing {
                        session_id: *session_id,
                        capture_ready: true,
                        connected: false,
                    },
                    vec![OpenConnection { id: *session_id }],
                )
            }
        }
        (
            Initializing {
                session_id,
                capture_ready,
                ..
            },
            Connected { .. },
        ) => {
            if *capture_ready {
                (
                    Listening {
                        session_id: *session_id,
                    },
                    vec![ResetTimeline, EmitState],
                )
            } else {
                (
                    Initializing {
                        session_id: *session_id,
                        capture_ready: false,
                        connected: true,
                    },
                    vec![],
                )
            }
        }

        // -----------------
        // Listening / Speaking
        // -----------------
        (Listening { session_id }, ModelOutput { .. }) => (
            Speaking {
                session_id: *session_id,
            },
            vec![EmitState],
        ),
        (Speaking { session_id }, PlaybackDrained { .. }) => (
            Listening {
                session_id: *session_id,
            },
            vec![EmitState],
        ),
        (Speaking { session_id }, Interrupted { .. }) => (
            Listening {
                session_id: *session_id,
            },
            vec![StopPlayback, DiscardModelTranscript, EmitState],
        ),
        // Playback already drained mid-turn; the partial response still goes
        (Listening { .. }, Interrupted { .. }) => (
            state.clone(),
            vec![StopPlayback, DiscardModelTranscript, EmitState],
        ),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
