//! Conversational engine wire protocol
//!
//! JSON text frames in both directions.
//!
//! # Protocol Overview
//!
//! 1. Connect to the engine endpoint (bearer token when configured)
//! 2. Send `{"setup": {...}}` with persona, context, voice and modalities
//! 3. Receive `{"setupComplete": {"sessionId": ...}}`
//! 4. Stream microphone audio as `{"realtimeInput": {"data", "mimeType"}}`
//! 5. Receive audio chunks, transcript deltas, interruptions and turn ends

use serde::{Deserialize, Serialize};

use crate::audio::codec::{decode_base64, DecodeError, EncodedFrame, OUTPUT_SAMPLE_RATE};

/// Default engine model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Prebuilt synthesis voices offered by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoiceId {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
}

/// Response modality requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Which sides of the conversation the engine should transcribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub input: bool,
    pub output: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
        }
    }
}

/// Session setup sent once, right after the socket opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectConfig {
    pub model: String,
    /// System instruction describing the assistant
    pub persona: String,
    /// Opaque block of facts the assistant may reference
    pub context: String,
    pub voice: VoiceId,
    pub modalities: Vec<Modality>,
    pub transcription: TranscriptionConfig,
}

impl ConnectConfig {
    /// Audio-out configuration with both transcriptions enabled
    pub fn new(
        model: impl Into<String>,
        persona: impl Into<String>,
        context: impl Into<String>,
        voice: VoiceId,
    ) -> Self {
        Self {
            model: model.into(),
            persona: persona.into(),
            context: context.into(),
            voice,
            modalities: vec![Modality::Audio],
            transcription: TranscriptionConfig::default(),
        }
    }
}

// ============================================================================
// Client Messages (sent TO the engine)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Configure the session
    Setup(ConnectConfig),

    /// One encoded microphone frame
    RealtimeInput(EncodedFrame),
}

// ============================================================================
// Server Messages (received FROM the engine)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Who produced a transcript fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    pub speaker: Speaker,
    pub text: String,
}

fn default_output_rate() -> u32 {
    OUTPUT_SAMPLE_RATE
}

/// Messages received from the engine.
///
/// Each shape is keyed by its single top-level field, so the enum is
/// untagged; anything unrecognised lands in `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: SetupComplete,
    },
    Error {
        error: ErrorInfo,
    },
    Audio {
        #[serde(rename = "audioData")]
        audio_data: String,
        #[serde(rename = "sampleRate", default = "default_output_rate")]
        sample_rate: u32,
    },
    Transcript {
        transcript: TranscriptPayload,
    },
    Interrupted {
        interrupted: bool,
    },
    TurnComplete {
        #[serde(rename = "turnComplete")]
        turn_complete: bool,
    },
    Unknown(serde_json::Value),
}

/// Conversation event delivered to the session, exactly one payload kind each
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Raw little-endian PCM16 bytes
    AudioChunk { data: Vec<u8>, sample_rate: u32 },
    TranscriptDelta { speaker: Speaker, text: String },
    Interrupted,
    TurnComplete,
}

impl ServerMessage {
    pub fn audio(data: &[u8], sample_rate: u32) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};
        Self::Audio {
            audio_data: STANDARD.encode(data),
            sample_rate,
        }
    }

    pub fn transcript(speaker: Speaker, text: impl Into<String>) -> Self {
        Self::Transcript {
            transcript: TranscriptPayload {
                speaker,
                text: text.into(),
            },
        }
    }

    pub fn interrupted() -> Self {
        Self::Interrupted { interrupted: true }
    }

    pub fn turn_complete() -> Self {
        Self::TurnComplete {
            turn_complete: true,
        }
    }

    /// Convert a conversation message into an inbound event.
    ///
    /// Returns `Ok(None)` for control messages (setup, errors), `false`
    /// flags and unknown shapes.
    pub fn into_event(self) -> Result<Option<InboundEvent>, DecodeError> {
        let event = match self {
            ServerMessage::Audio {
                audio_data,
                sample_rate,
            } => Some(InboundEvent::AudioChunk {
                data: decode_base64(&audio_data)?,
                sample_rate,
            }),
            ServerMessage::Transcript { transcript } => Some(InboundEvent::TranscriptDelta {
                speaker: transcript.speaker,
                text: transcript.text,
            }),
            ServerMessage::Interrupted { interrupted: true } => Some(InboundEvent::Interrupted),
            ServerMessage::TurnComplete {
                turn_complete: true,
            } => Some(InboundEvent::TurnComplete),
            _ => None,
        };
        Ok(event)
    }
}
