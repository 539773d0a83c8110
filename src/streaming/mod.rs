//! Bidirectional streaming connection to the conversational engine
//!
//! # Architecture
//!
//! ```text
//! capture callback ──▶ FrameSender ──▶ OutboundQueue ──▶ writer task ──▶ WebSocket
//!                                                                           │
//!          on_event handler ◀── StreamEvent channel ◀── reader task ◀──────┘
//! ```
//!
//! # Failure Strategy
//!
//! - A connection attempt is made exactly once; failures go back to the caller
//! - Mid-stream errors are reported as `StreamEvent::Error`, never retried
//! - After `close()` nothing more is delivered

mod client;
mod protocol;

pub use client::{
    outbound_queue, ConnectTimeouts, EngineEndpoint, FrameSender, OutboundQueue,
    StreamingSessionClient,
};
pub use protocol::{
    ClientMessage, ConnectConfig, ErrorInfo, InboundEvent, Modality, ServerMessage, SetupComplete,
    Speaker, TranscriptPayload, TranscriptionConfig, VoiceId, DEFAULT_MODEL,
};

use thiserror::Error;

/// Errors that can occur on the engine connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    /// Endpoint URL could not be turned into a request
    #[error("invalid engine endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to connect to the conversational engine: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("websocket protocol error: {0}")]
    ProtocolError(String),
    /// Connection was closed by the remote side
    #[error("websocket disconnected: {0}")]
    Disconnected(String),
    #[error("failed to send audio: {0}")]
    SendFailed(String),
    #[error("connection is closed")]
    Closed,
}

/// What the client reports to its event handler
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Inbound(InboundEvent),
    /// Unrecoverable mid-stream failure; the connection is dead afterwards
    Error(StreamingError),
    /// The reader finished (remote close or after an error)
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::AuthenticationFailed("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));

        assert_eq!(StreamingError::Closed.to_string(), "connection is closed");
    }
}
