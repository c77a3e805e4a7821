#![forbid(unsafe_code)]

// Common types and error handling for the media engine seam

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by (or on the way to) the SFU media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media engine rejected {operation}: {reason}")]
    Rejected { operation: &'static str, reason: String },

    #[error("Media engine did not answer {operation} within {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    #[error("Media object already closed: {0}")]
    Closed(String),

    #[error("Invalid media parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MediaError {
    pub fn rejected(operation: &'static str, reason: impl fmt::Display) -> Self {
        Self::Rejected { operation, reason: reason.to_string() }
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Direction of a participant's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Opaque application metadata attached to a producer.
///
/// The orchestration layer never inspects it; it is stored with the producer and forwarded
/// verbatim to peers in `newStreamAvailable`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppData(serde_json::Map<String, serde_json::Value>);

impl AppData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.0)
    }
}

/// Connection parameters of a freshly created transport, handed to the client as-is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Options for a new transport
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub direction: TransportDirection,
    pub participant_id: String,
}

/// Options for a new producer on a send transport
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
    pub app_data: AppData,
}

/// Options for a new consumer on a receive transport
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: String,
    /// Kind of the producer being consumed, as recorded by the session
    pub kind: MediaKind,
    pub rtp_capabilities: serde_json::Value,
    pub paused: bool,
}
