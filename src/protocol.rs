//! Realtime channel wire protocol
//!
//! JSON events tagged by `type`. Outbound events are wrapped with a fresh
//! `event_id`; inbound events are decoded in two steps so that unknown event
//! types are skipped instead of failing the stream.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audio::buffer::bytes_to_pcm16;
use crate::config::{ChannelConfig, TurnDetection};
use crate::error::ChannelError;

/// Role of a message item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Item type on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireItemType {
    Message,
    FunctionCall,
    FunctionCallOutput,
}

/// One content part of a message item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentPart {
    /// `input_text`, `input_audio`, `text` or `audio`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
}

/// Conversation item as carried by the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: WireItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl WireItem {
    /// A user text message ready for `conversation.item.create`
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: WireItemType::Message,
            role: Some(Role::User),
            status: None,
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: Some(text.into()),
                ..Default::default()
            }],
            call_id: None,
            name: None,
            arguments: None,
            output: None,
        }
    }
}

/// Transcription model settings for `session.update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Turn detection settings for `session.update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetectionSettings {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Session declaration sent right after the channel opens
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionSettings,
    /// `null` selects manual turn taking
    pub turn_detection: Option<TurnDetectionSettings>,
}

impl SessionSettings {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionSettings {
                model: config.transcription_model.clone(),
            },
            turn_detection: match config.turn_detection {
                TurnDetection::ServerVad => Some(TurnDetectionSettings {
                    kind: "server_vad".to_string(),
                }),
                TurnDetection::Manual => None,
            },
        }
    }
}

/// Events sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    /// One capture chunk as base64 PCM16 LE
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: WireItem },

    #[serde(rename = "conversation.item.delete")]
    ItemDelete { item_id: String },

    /// What was actually heard of the interrupted track
    #[serde(rename = "response.cancel")]
    ResponseCancel { track_id: String, sample_offset: u64 },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundEvent {
    /// Upload PCM16 LE bytes of one capture chunk
    pub fn audio_append(pcm: &[u8]) -> Self {
        OutboundEvent::InputAudioAppend {
            audio: BASE64.encode(pcm),
        }
    }

    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::SessionUpdate { .. } => "session.update",
            OutboundEvent::InputAudioAppend { .. } => "input_audio_buffer.append",
            OutboundEvent::ItemCreate { .. } => "conversation.item.create",
            OutboundEvent::ItemDelete { .. } => "conversation.item.delete",
            OutboundEvent::ResponseCancel { .. } => "response.cancel",
            OutboundEvent::ResponseCreate => "response.create",
        }
    }
}

/// Outbound event with its envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub event_id: String,
    #[serde(flatten)]
    pub event: OutboundEvent,
}

impl OutboundMessage {
    pub fn new(event: OutboundEvent) -> Self {
        Self {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

/// Error payload of an inbound `error` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerError {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Outbound event that caused the error, if any
    #[serde(default)]
    pub event_id: Option<String>,
}

impl ServerError {
    /// Errors after which the backend will not continue the session
    pub fn is_fatal(&self) -> bool {
        self.code.as_deref() == Some("session_expired")
    }
}

/// Response summary carried by `response.done`
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<WireItem>,
}

/// Events received from the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "error")]
    Error { error: ServerError },

    /// The user started talking over the assistant
    #[serde(rename = "conversation.interrupted", alias = "input_audio_buffer.speech_started")]
    Interrupted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        audio_start_ms: Option<u64>,
    },

    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        item: WireItem,
        #[serde(default)]
        previous_item_id: Option<String>,
    },

    #[serde(rename = "conversation.item.updated")]
    ItemUpdated { item: WireItem },

    #[serde(rename = "conversation.item.deleted")]
    ItemDeleted { item_id: String },

    /// Base64 PCM16 for a track; the track defaults to the item id
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        item_id: String,
        #[serde(default)]
        track_id: Option<String>,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        item_id: String,
        #[serde(default)]
        track_id: Option<String>,
    },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { item_id: String, delta: String },

    #[serde(rename = "response.text.delta")]
    TextDelta { item_id: String, delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted { item_id: String, transcript: String },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: WireItem },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: WireResponse,
    },

    #[serde(rename = "session.created", alias = "session.updated")]
    SessionAck {
        #[serde(default)]
        session: Value,
    },

    #[serde(other)]
    Unknown,
}

/// Inbound event with its envelope
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub event_id: Option<String>,
    /// Wire name, kept for logging
    pub kind: String,
    pub event: InboundEvent,
}

/// Parse one inbound text frame
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ChannelError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ChannelError::Protocol(format!("invalid JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ChannelError::Protocol("event without type".to_string()))?
        .to_string();
    let event_id = value.get("event_id").and_then(Value::as_str).map(str::to_string);

    let event: InboundEvent = serde_json::from_value(value)
        .map_err(|e| ChannelError::Protocol(format!("malformed {}: {}", kind, e)))?;

    Ok(InboundMessage { event_id, kind, event })
}

/// Decode a base64 PCM16 payload
pub fn decode_audio(delta: &str) -> Result<Vec<i16>, ChannelError> {
    let bytes = BASE64
        .decode(delta)
        .map_err(|e| ChannelError::Protocol(format!("invalid base64 audio: {}", e)))?;
    bytes_to_pcm16(&bytes).ok_or_else(|| ChannelError::Protocol("odd-length PCM16 payload".to_string()))
}
