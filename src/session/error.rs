#![forbid(unsafe_code)]

// Error taxonomy for session orchestration

use crate::media::MediaError;
use serde::Serialize;
use thiserror::Error;

/// Coarse error class, reported on the wire next to the specific code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Capacity,
    Unauthorized,
    UpstreamFailure,
    InvalidRequest,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Producer {0} is already paused")]
    AlreadyPaused(String),

    #[error("Producer {0} is not paused")]
    NotPaused(String),

    #[error("Session {session_id} is full ({capacity} participants)")]
    SessionFull { session_id: String, capacity: usize },

    #[error("Consumer limit reached ({0})")]
    ConsumerLimit(usize),

    #[error("Connection has not joined this session")]
    NotJoined,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Media engine failure: {0}")]
    Upstream(#[from] MediaError),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SessionError::SessionNotFound(_)
            | SessionError::ParticipantNotFound(_)
            | SessionError::TransportNotFound(_)
            | SessionError::ProducerNotFound(_)
            | SessionError::ConsumerNotFound(_) => ErrorCategory::NotFound,
            SessionError::AlreadyPaused(_) | SessionError::NotPaused(_) => ErrorCategory::Conflict,
            SessionError::SessionFull { .. } | SessionError::ConsumerLimit(_) => ErrorCategory::Capacity,
            SessionError::NotJoined => ErrorCategory::Unauthorized,
            SessionError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            SessionError::Upstream(_) => ErrorCategory::UpstreamFailure,
        }
    }

    /// Stable machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::ParticipantNotFound(_) => "participant_not_found",
            SessionError::TransportNotFound(_) => "transport_not_found",
            SessionError::ProducerNotFound(_) => "producer_not_found",
            SessionError::ConsumerNotFound(_) => "consumer_not_found",
            SessionError::AlreadyPaused(_) => "already_paused",
            SessionError::NotPaused(_) => "not_paused",
            SessionError::SessionFull { .. } => "session_full",
            SessionError::ConsumerLimit(_) => "consumer_limit",
            SessionError::NotJoined => "not_joined",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::Upstream(MediaError::Timeout { .. }) => "upstream_timeout",
            SessionError::Upstream(_) => "upstream_failure",
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_the_taxonomy() {
        assert_eq!(SessionError::ProducerNotFound("p".into()).category(), ErrorCategory::NotFound);
        assert_eq!(SessionError::AlreadyPaused("p".into()).category(), ErrorCategory::Conflict);
        assert_eq!(
            SessionError::SessionFull { session_id: "m1".into(), capacity: 4 }.category(),
            ErrorCategory::Capacity
        );
        assert_eq!(SessionError::NotJoined.category(), ErrorCategory::Unauthorized);
        assert_eq!(
            SessionError::from(MediaError::Closed("t".into())).category(),
            ErrorCategory::UpstreamFailure
        );
    }

    #[test]
    fn timeouts_get_their_own_code() {
        let err = SessionError::from(MediaError::Timeout { operation: "produce", timeout_ms: 10 });
        assert_eq!(err.code(), "upstream_timeout");
        assert_eq!(SessionError::NotPaused("p".into()).code(), "not_paused");
    }
}
