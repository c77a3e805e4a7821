#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication

use crate::media::{AppData, MediaKind, TransportDirection};
use crate::session::{
    ConsumerDescription, ErrorCategory, ParticipantControlState, ParticipantSummary,
    ProducerSummary, SessionError, SessionEvent,
};
use crate::turn::IceServer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_SESSION_ID_LEN: usize = 128;
pub const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Inbound frame: an optional correlation id plus the message itself
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client-to-server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Leave { session_id: String },
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities { session_id: String },
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        session_id: String,
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        session_id: String,
        transport_id: String,
        dtls_parameters: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        session_id: String,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
        #[serde(default)]
        app_data: AppData,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        session_id: String,
        producer_id: String,
        rtp_capabilities: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        session_id: String,
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        session_id: String,
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        session_id: String,
        producer_id: String,
    },
    /// Mute / camera off
    #[serde(rename_all = "camelCase")]
    PauseProducer {
        session_id: String,
        producer_id: String,
        #[serde(default)]
        kind: Option<MediaKind>,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Unmute / camera on
    #[serde(rename_all = "camelCase")]
    ResumeProducer {
        session_id: String,
        producer_id: String,
        #[serde(default)]
        kind: Option<MediaKind>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetProducers { session_id: String },
    #[serde(rename_all = "camelCase")]
    GetSessionControlState { session_id: String },
}

impl ClientMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ClientMessage::Join { session_id, .. }
            | ClientMessage::Leave { session_id }
            | ClientMessage::GetRouterRtpCapabilities { session_id }
            | ClientMessage::CreateTransport { session_id, .. }
            | ClientMessage::ConnectTransport { session_id, .. }
            | ClientMessage::Produce { session_id, .. }
            | ClientMessage::Consume { session_id, .. }
            | ClientMessage::ResumeConsumer { session_id, .. }
            | ClientMessage::PauseConsumer { session_id, .. }
            | ClientMessage::CloseProducer { session_id, .. }
            | ClientMessage::PauseProducer { session_id, .. }
            | ClientMessage::ResumeProducer { session_id, .. }
            | ClientMessage::GetProducers { session_id }
            | ClientMessage::GetSessionControlState { session_id } => session_id,
        }
    }

    /// Shape checks that do not need session state
    pub fn validate(&self) -> Result<(), SessionError> {
        validate_session_id(self.session_id())?;
        if let ClientMessage::Join { display_name: Some(name), .. } = self {
            let len = name.trim().chars().count();
            if len == 0 || len > MAX_DISPLAY_NAME_LEN {
                return Err(SessionError::InvalidRequest(format!(
                    "displayName must be 1-{MAX_DISPLAY_NAME_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let len = session_id.chars().count();
    if len == 0 || len > MAX_SESSION_ID_LEN {
        return Err(SessionError::InvalidRequest(format!(
            "sessionId must be 1-{MAX_SESSION_ID_LEN} characters"
        )));
    }
    if session_id.chars().any(char::is_control) {
        return Err(SessionError::InvalidRequest("sessionId contains control characters".into()));
    }
    Ok(())
}

/// What can be salvaged from a frame that failed to parse
#[derive(Debug, Clone, Default)]
pub struct MalformedRequest {
    pub id: Option<serde_json::Value>,
    pub kind: Option<String>,
    pub request_id: Option<String>,
    pub producer_id: Option<String>,
}

impl MalformedRequest {
    /// Reads fields one by one from untyped JSON so a single mistyped field loses only itself
    pub fn salvage(text: &str) -> Self {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => return Self::default(),
        };
        Self {
            id: value.get("id").cloned(),
            kind: value.get("type").and_then(|v| v.as_str()).map(str::to_string),
            request_id: value.get("requestId").and_then(lenient_string),
            producer_id: value.get("producerId").and_then(lenient_string),
        }
    }

    /// Control requests are answered with a failed `controlResult`, never a protocol error
    pub fn is_control(&self) -> bool {
        matches!(self.kind.as_deref(), Some("pauseProducer" | "resumeProducer"))
    }
}

/// Strings as-is, other scalars in their JSON text form
fn lenient_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Outbound frame; `id` echoes the request's correlation id
#[derive(Debug, Clone, Serialize)]
pub struct ServerEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    pub fn reply(id: Option<serde_json::Value>, message: ServerMessage) -> Self {
        Self { id, message }
    }

    pub fn push(message: ServerMessage) -> Self {
        Self { id: None, message }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined {
        session_id: String,
        participant_id: String,
        existing_participants: Vec<ParticipantSummary>,
        producers: Vec<ProducerSummary>,
        rtp_capabilities: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Left { participant_id: String },
    /// Reply to `getSessionControlState`, and the snapshot pushed to a new joiner
    #[serde(rename_all = "camelCase")]
    SessionState {
        session_id: String,
        participants: Vec<ParticipantControlState>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: TransportDirection,
        ice_parameters: serde_json::Value,
        ice_candidates: serde_json::Value,
        dtls_parameters: serde_json::Value,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        ice_servers: Vec<IceServer>,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerCreated { producer_id: String, kind: MediaKind },
    ConsumerCreated(ConsumerDescription),
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename_all = "camelCase")]
    Producers {
        session_id: String,
        producers: Vec<ProducerSummary>,
    },
    /// Outcome of pauseProducer/resumeProducer, successful or not
    #[serde(rename_all = "camelCase")]
    ControlResult {
        request_id: Option<String>,
        success: bool,
        producer_id: String,
        paused: bool,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<&'static str>,
    },
    Error {
        code: &'static str,
        category: ErrorCategory,
        message: String,
    },

    // Broadcasts
    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        session_id: String,
        #[serde(flatten)]
        participant: ParticipantSummary,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        session_id: String,
        participant_id: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    NewStreamAvailable {
        session_id: String,
        participant_id: String,
        producer_id: String,
        kind: MediaKind,
        #[serde(skip_serializing_if = "AppData::is_empty")]
        app_data: AppData,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    StreamClosed {
        session_id: String,
        participant_id: String,
        producer_id: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    ParticipantMuted(ControlBroadcast),
    ParticipantUnmuted(ControlBroadcast),
    ParticipantCameraDisabled(ControlBroadcast),
    ParticipantCameraEnabled(ControlBroadcast),
}

/// Body shared by the four mute/camera broadcasts
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlBroadcast {
    pub session_id: String,
    pub participant_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl ServerMessage {
    pub fn error(err: &SessionError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl From<&SessionEvent> for ServerMessage {
    fn from(event: &SessionEvent) -> Self {
        match event.clone() {
            SessionEvent::ParticipantJoined { session_id, participant, timestamp } => {
                ServerMessage::ParticipantJoined { session_id, participant, timestamp }
            }
            SessionEvent::ParticipantLeft { session_id, participant_id, timestamp } => {
                ServerMessage::ParticipantLeft { session_id, participant_id, timestamp }
            }
            SessionEvent::NewStreamAvailable { session_id, participant_id, producer_id, kind, app_data, timestamp } => {
                ServerMessage::NewStreamAvailable { session_id, participant_id, producer_id, kind, app_data, timestamp }
            }
            SessionEvent::StreamClosed { session_id, participant_id, producer_id, timestamp } => {
                ServerMessage::StreamClosed { session_id, participant_id, producer_id, timestamp }
            }
            SessionEvent::ControlChanged { session_id, participant_id, producer_id, kind, paused, timestamp } => {
                let body = ControlBroadcast { session_id, participant_id, producer_id, kind, paused, timestamp };
                // Audio and video travel as separate event names.
                match (kind, paused) {
                    (MediaKind::Audio, true) => ServerMessage::ParticipantMuted(body),
                    (MediaKind::Audio, false) => ServerMessage::ParticipantUnmuted(body),
                    (MediaKind::Video, true) => ServerMessage::ParticipantCameraDisabled(body),
                    (MediaKind::Video, false) => ServerMessage::ParticipantCameraEnabled(body),
                }
            }
        }
    }
}
