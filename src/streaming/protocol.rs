//! Wire protocol for the realtime conversational service.
//!
//! JSON events exchanged over the persistent WebSocket, tagged by `type`.
//!
//! # Protocol Overview
//!
//! 1. Connect; the service emits `session.created`
//! 2. Send `session.update` naming audio formats, voice and transcription
//! 3. Stream audio via `input_audio_buffer.append`, then `commit`
//! 4. Send `response.create`; the reply streams back as `response.audio.delta`
//!    and `response.text.delta`, terminated by `response.done`

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::settings::VoiceSettings;

/// Stream audio format negotiated in both directions.
pub const STREAM_AUDIO_FORMAT: &str = "pcm16";

/// Sample rate of the negotiated stream format (mono PCM16).
pub const STREAM_SAMPLE_RATE: u32 = 24_000;

/// Session configuration sent in `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Reply modalities; audio plus a text caption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format - must be "pcm16" for raw PCM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Turn detection - null for manual control
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
}

impl SessionConfig {
    /// Build the session configuration from the kiosk settings.
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            model: Some(settings.realtime_model.clone()),
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            voice: Some(settings.voice.clone()),
            input_audio_format: Some(STREAM_AUDIO_FORMAT.to_string()),
            output_audio_format: Some(STREAM_AUDIO_FORMAT.to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: settings.transcription_model.clone(),
            }),
            turn_detection: None, // Manual control
        }
    }
}

/// Transcription model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Turn detection configuration (null = manual)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub detection_type: String,
}

/// Per-response configuration sent in `response.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Session information returned by the service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Whether this error means the credential is bad (fatal for the session).
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some("invalid_api_key") | Some("invalid_authentication")
        ) || self.error_type == "authentication_error"
    }
}

/// Completed-response summary carried by `response.done`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseSummary {
    #[serde(default)]
    pub status: String,
}

impl ResponseSummary {
    /// Structured failure signal used for retry classification.
    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

/// Conversation item carried by `conversation.item.created`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationItem {
    #[serde(default)]
    pub content: Vec<ItemContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemContent {
    #[serde(default)]
    pub transcript: Option<String>,
}

impl ConversationItem {
    /// First transcript attached to this item, if any.
    pub fn transcript(&self) -> Option<&str> {
        self.content.first().and_then(|c| c.transcript.as_deref())
    }
}

// ============================================================================
// Client events (sent TO the service)
// ============================================================================

/// Events sent from the kiosk to the service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append base64 PCM16 audio to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseConfig },
}

impl ClientEvent {
    pub fn session_update(settings: &VoiceSettings) -> Self {
        Self::SessionUpdate {
            session: SessionConfig::from_settings(settings),
        }
    }

    /// Wrap raw PCM16 bytes as an append event.
    pub fn audio_append(pcm: &[u8]) -> Self {
        Self::AudioAppend {
            audio: STANDARD.encode(pcm),
        }
    }

    pub fn response_create(instructions: &str) -> Self {
        Self::ResponseCreate {
            response: ResponseConfig {
                modalities: vec!["text".to_string(), "audio".to_string()],
                instructions: if instructions.is_empty() {
                    None
                } else {
                    Some(instructions.to_string())
                },
            },
        }
    }
}

// ============================================================================
// Server events (received FROM the service)
// ============================================================================

/// Events received from the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },

    #[serde(rename = "input_audio_buffer.cleared")]
    AudioCleared,

    /// Service-side VAD detected the start of speech.
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: Option<u64>,
    },

    /// Carries the transcript of the committed utterance.
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        #[serde(default)]
        item: ConversationItem,
    },

    /// Incremental base64 PCM16 chunk of the synthesized reply.
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    /// Incremental text caption of the reply.
    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseSummary,
    },

    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Catch-all so unknown event types never fail the read loop.
    #[serde(other)]
    Unknown,
}

/// Decode a base64 audio delta payload.
pub fn decode_audio(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_serialization() {
        let settings = VoiceSettings::default();
        let msg = ClientEvent::session_update(&settings);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"session.update\""));
        assert!(json.contains("\"model\":\"gpt-4o-realtime-preview-2024-12-17\""));
        assert!(json.contains("\"voice\":\"alloy\""));
        assert!(json.contains("\"input_audio_format\":\"pcm16\""));
        assert!(json.contains("\"output_audio_format\":\"pcm16\""));
        assert!(json.contains("\"modalities\":[\"text\",\"audio\"]"));
    }

    #[test]
    fn audio_append_round_trip() {
        let pcm = [0x34u8, 0x12, 0x78, 0x56];
        let msg = ClientEvent::audio_append(&pcm);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"input_audio_buffer.append\""));

        if let ClientEvent::AudioAppend { audio } = msg {
            assert_eq!(decode_audio(&audio).unwrap(), pcm);
        } else {
            panic!("Expected AudioAppend");
        }
    }

    #[test]
    fn response_create_serialization() {
        let msg = ClientEvent::response_create("Reply briefly.");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"response.create\""));
        assert!(json.contains("\"instructions\":\"Reply briefly.\""));
    }

    #[test]
    fn session_created_deserialization() {
        let json = r#"{
            "type": "session.created",
            "session": { "id": "sess_123", "model": "gpt-4o-realtime-preview" }
        }"#;

        let msg: ServerEvent = serde_json::from_str(json).unwrap();
        match msg {
            ServerEvent::SessionCreated { session } => assert_eq!(session.id, "sess_123"),
            _ => panic!("Expected SessionCreated"),
        }
    }

    #[test]
    fn session_created_without_payload() {
        let msg: ServerEvent = serde_json::from_str(r#"{"type": "session.created"}"#).unwrap();
        assert!(matches!(msg, ServerEvent::SessionCreated { .. }));
    }

    #[test]
    fn response_done_failure_detection() {
        let json = r#"{
            "type": "response.done",
            "response": { "status": "failed" }
        }"#;
        let msg: ServerEvent = serde_json::from_str(json).unwrap();
        match msg {
            ServerEvent::ResponseDone { response } => assert!(response.is_failed()),
            _ => panic!("Expected ResponseDone"),
        }

        let ok: ServerEvent = serde_json::from_str(
            r#"{"type": "response.done", "response": {"status": "completed"}}"#,
        )
        .unwrap();
        match ok {
            ServerEvent::ResponseDone { response } => assert!(!response.is_failed()),
            _ => panic!("Expected ResponseDone"),
        }
    }

    #[test]
    fn transcript_extraction() {
        let json = r#"{
            "type": "conversation.item.created",
            "item": { "content": [ { "transcript": "what's the weather" } ] }
        }"#;
        let msg: ServerEvent = serde_json::from_str(json).unwrap();
        match msg {
            ServerEvent::ItemCreated { item } => {
                assert_eq!(item.transcript(), Some("what's the weather"));
            }
            _ => panic!("Expected ItemCreated"),
        }
    }

    #[test]
    fn auth_error_classification() {
        let err = ErrorInfo {
            error_type: "invalid_request_error".to_string(),
            code: Some("invalid_api_key".to_string()),
            message: "Invalid API key".to_string(),
        };
        assert!(err.is_auth_failure());

        let transient = ErrorInfo {
            error_type: "server_error".to_string(),
            code: None,
            message: "overloaded".to_string(),
        };
        assert!(!transient.is_auth_failure());
    }

    #[test]
    fn unknown_event_type() {
        let msg: ServerEvent =
            serde_json::from_str(r#"{"type": "some.future.event", "data": 1}"#).unwrap();
        assert!(matches!(msg, ServerEvent::Unknown));
    }
}
