//! Realtime wire events
//!
//! Outbound events are a serde enum tagged by `type`; every constructor
//! stamps a fresh `event_id`. Inbound events are matched on their `type`
//! string so unknown tags fall through to [`ServerEvent::Unknown`].

use crate::integration::config::SessionConfig;
use crate::{ChatterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Audio encoding name used on the wire; always 24 kHz mono PCM16
pub const PCM16: &str = "pcm16";

const PCM16_RATE: u32 = 24_000;

/// Turn detection announced to the server: turns are committed by the local
/// detector, never by the server
pub const CLIENT_TURN_DETECTION: &str = "none";

/// Server error codes after which the session cannot continue
const FATAL_ERROR_CODES: &[&str] = &[
    "session_expired",
    "invalid_api_key",
    "authentication_error",
    "insufficient_quota",
    "session_closed",
];

fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
}

impl TurnDetection {
    pub fn client_driven() -> Self {
        Self {
            kind: CLIENT_TURN_DETECTION.to_string(),
        }
    }
}

/// Body of `session.update`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub model: String,
    pub voice: String,
    pub turn_detection: TurnDetection,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            modalities: config.modalities.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            turn_detection: TurnDetection::client_driven(),
            input_audio_format: PCM16.to_string(),
            output_audio_format: PCM16.to_string(),
            instructions: config.instructions.clone(),
        }
    }

    /// Sample rate implied by the negotiated input format
    pub fn sample_rate(&self) -> Option<u32> {
        match self.input_audio_format.as_str() {
            PCM16 => Some(PCM16_RATE),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "user".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

/// Events sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate {
        event_id: String,
        session: SessionSettings,
    },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { event_id: String, audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit { event_id: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        event_id: String,
        item: ConversationItem,
    },

    #[serde(rename = "response.create")]
    ResponseCreate { event_id: String },

    #[serde(rename = "response.cancel")]
    ResponseCancel { event_id: String },
}

impl ClientEvent {
    pub fn session_update(session: SessionSettings) -> Self {
        ClientEvent::SessionUpdate {
            event_id: new_event_id(),
            session,
        }
    }

    /// `audio` is already base64 encoded
    pub fn audio_append(audio: String) -> Self {
        ClientEvent::InputAudioAppend {
            event_id: new_event_id(),
            audio,
        }
    }

    pub fn audio_commit() -> Self {
        ClientEvent::InputAudioCommit {
            event_id: new_event_id(),
        }
    }

    pub fn user_message(text: impl Into<String>) -> Self {
        ClientEvent::ConversationItemCreate {
            event_id: new_event_id(),
            item: ConversationItem::user_text(text),
        }
    }

    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate {
            event_id: new_event_id(),
        }
    }

    pub fn response_cancel() -> Self {
        ClientEvent::ResponseCancel {
            event_id: new_event_id(),
        }
    }

    pub fn event_id(&self) -> &str {
        match self {
            ClientEvent::SessionUpdate { event_id, .. }
            | ClientEvent::InputAudioAppend { event_id, .. }
            | ClientEvent::InputAudioCommit { event_id }
            | ClientEvent::ConversationItemCreate { event_id, .. }
            | ClientEvent::ResponseCreate { event_id }
            | ClientEvent::ResponseCancel { event_id } => event_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioCommit { .. } => "input_audio_buffer.commit",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel { .. } => "response.cancel",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Events received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SessionCreated { session_id: Option<String> },
    SessionUpdated { session: Option<SessionSettings> },
    TextDelta { delta: String },
    /// Base64 PCM16, still encoded
    AudioDelta { delta: String },
    AudioTranscriptDelta { delta: String },
    SpeechStarted,
    SpeechStopped,
    ResponseDone { response_id: Option<String> },
    Error { message: String, code: Option<String> },
    Unknown { event_type: String },
}

impl ServerEvent {
    /// Parse one inbound text frame
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn from_value(payload: &Value) -> Result<Self> {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatterError::ProtocolError("Event has no type tag".into()))?;

        let event = match event_type {
            "session.created" => ServerEvent::SessionCreated {
                session_id: string_at(payload, &["session", "id"]),
            },
            "session.updated" => ServerEvent::SessionUpdated {
                session: payload
                    .get("session")
                    .and_then(|s| serde_json::from_value(s.clone()).ok()),
            },
            "response.text.delta" => ServerEvent::TextDelta {
                delta: required_delta(payload, event_type)?,
            },
            "response.audio.delta" => ServerEvent::AudioDelta {
                delta: required_delta(payload, event_type)?,
            },
            "response.audio_transcript.delta" => ServerEvent::AudioTranscriptDelta {
                delta: required_delta(payload, event_type)?,
            },
            "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
            "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
            "response.done" => ServerEvent::ResponseDone {
                response_id: string_at(payload, &["response", "id"]),
            },
            "error" => ServerEvent::Error {
                message: string_at(payload, &["error", "message"])
                    .or_else(|| string_field(payload, "message"))
                    .unwrap_or_else(|| "Realtime server error".to_string()),
                code: string_at(payload, &["error", "code"])
                    .or_else(|| string_at(payload, &["error", "type"])),
            },
            other => ServerEvent::Unknown {
                event_type: other.to_string(),
            },
        };
        Ok(event)
    }

    pub fn event_type(&self) -> &str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::TextDelta { .. } => "response.text.delta",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::SpeechStarted => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped => "input_audio_buffer.speech_stopped",
            ServerEvent::ResponseDone { .. } => "response.done",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown { event_type } => event_type,
        }
    }

    /// Convert a server `error` event into the crate error type
    pub fn into_error(self) -> Option<ChatterError> {
        match self {
            ServerEvent::Error { message, code } => {
                let fatal = code
                    .as_deref()
                    .map(|c| FATAL_ERROR_CODES.contains(&c))
                    .unwrap_or(false);
                Some(ChatterError::ServerError {
                    message,
                    code,
                    fatal,
                })
            }
            _ => None,
        }
    }
}

fn required_delta(payload: &Value, event_type: &str) -> Result<String> {
    string_field(payload, "delta")
        .ok_or_else(|| ChatterError::ProtocolError(format!("{} without delta", event_type)))
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().map(ToString::to_string)
}
