//! Realtime streaming session with the conversational speech service.
//!
//! # Architecture
//!
//! ```text
//! Microphone ──▶ AudioPipeline ──▶ outbound queue ──▶ StreamConnection ──▶ service
//!                    ▲                                      │
//!                    │ play deltas              server events│
//!                    │                                      ▼
//!                Speaker ◀── ConversationSession (one ordered event loop)
//! ```
//!
//! The connection owns the socket and its worker loops; the pipeline frames
//! outbound audio and renders inbound deltas; the session is the per-turn
//! state machine that drives both. All inbound events funnel into a single
//! channel drained by the session loop, so there is exactly one ordered
//! consumption point.

pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use connection::{ConnectionTuning, LinkStatus, StreamConnection};
pub use pipeline::{AudioPipeline, FlushOutcome};
pub use protocol::{ClientEvent, ServerEvent, SessionConfig};
pub use session::{reduce, ConversationSession, TurnCaptions, TurnEffect, TurnEvent, TurnPhase};

/// Errors that can occur on the streaming path.
#[derive(Debug, Clone)]
pub enum StreamingError {
    /// Service API key not configured
    MissingApiKey,
    /// Failed to establish the WebSocket connection
    ConnectionFailed(String),
    /// Authentication with the service failed
    AuthenticationFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to enqueue an outbound event
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "Service API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to realtime service: {}", e)
            }
            StreamingError::AuthenticationFailed(e) => {
                write!(f, "Authentication failed: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to enqueue outbound event: {}", e)
            }
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("OPENAI_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::SendFailed("queue full".to_string());
        assert!(err.to_string().contains("queue full"));
    }
}
