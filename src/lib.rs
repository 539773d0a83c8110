//! Real-time voice conversation pipeline for the event concierge
//!
//! Microphone frames are encoded and streamed to a remote conversational
//! engine; synthesized speech comes back in chunks and is scheduled for
//! gapless playback, with barge-in cutting it off mid-sentence.
//!
//! The UI (or the bundled binary) drives a [`ConversationHandle`] and
//! observes [`SessionSnapshot`]s; everything else happens inside the
//! session actor.

pub mod audio;
pub mod playback;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use audio::{CaptureSource, CpalCapture, CpalOutput};
pub use session::{
    ConversationConfig, ConversationHandle, ConversationSession, SessionError, SessionSettings,
    SessionSnapshot,
};
pub use state_machine::ConversationState;
pub use streaming::{EngineEndpoint, StreamingSessionClient, VoiceId};

/// Initialise `env_logger` with an `info` default, overridable via `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
