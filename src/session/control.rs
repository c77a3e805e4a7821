#![forbid(unsafe_code)]

// Control state machine - pause/resume of a participant's outbound streams and the
// mute/camera flags mirrored from them.

use super::error::{SessionError, SessionResult};
use super::registry::SessionRegistry;
use super::{Notifier, SessionEvent};
use crate::media::{bounded, MediaKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
}

impl ControlAction {
    fn target_paused(self) -> bool {
        matches!(self, ControlAction::Pause)
    }

    fn operation(self) -> &'static str {
        match self {
            ControlAction::Pause => "pauseProducer",
            ControlAction::Resume => "resumeProducer",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAction::Pause => f.write_str("pause"),
            ControlAction::Resume => f.write_str("resume"),
        }
    }
}

/// Mute/camera flags of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantControlState {
    pub participant_id: String,
    pub audio_muted: bool,
    pub video_disabled: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

/// An applied pause or resume
#[derive(Debug, Clone, PartialEq)]
pub struct ControlTransition {
    pub session_id: String,
    pub participant_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct ControlStateMachine {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    echo_to_sender: bool,
}

impl ControlStateMachine {
    /// With `echo_to_sender` the actor receives its own change broadcast too
    pub fn new(registry: Arc<SessionRegistry>, notifier: Arc<dyn Notifier>, echo_to_sender: bool) -> Self {
        Self { registry, notifier, echo_to_sender }
    }

    /// Pauses an active producer
    ///
    /// # Errors
    /// `SessionNotFound`, `ParticipantNotFound`, `ProducerNotFound`, `AlreadyPaused`,
    /// or the engine failure
    pub async fn pause(&self, session_id: &str, participant_id: &str, producer_id: &str) -> SessionResult<ControlTransition> {
        self.apply(ControlAction::Pause, session_id, participant_id, producer_id, None).await
    }

    /// Resumes a paused producer
    ///
    /// # Errors
    /// As [`Self::pause`], with `NotPaused` in place of `AlreadyPaused`
    pub async fn resume(&self, session_id: &str, participant_id: &str, producer_id: &str) -> SessionResult<ControlTransition> {
        self.apply(ControlAction::Resume, session_id, participant_id, producer_id, None).await
    }

    /// Applies `action` to a producer. When the caller names the stream kind it must
    /// match the producer's; the producer's own kind decides which flag changes.
    pub async fn apply(
        &self,
        action: ControlAction,
        session_id: &str,
        participant_id: &str,
        producer_id: &str,
        expected_kind: Option<MediaKind>,
    ) -> SessionResult<ControlTransition> {
        let result = self
            .transition(action, session_id, participant_id, producer_id, expected_kind)
            .await;
        match &result {
            Ok(_) => self.registry.metrics().inc_control_changes(),
            Err(e) => {
                self.registry.metrics().inc_control_rejections();
                debug!("Rejected {} of producer {} in session {}: {}", action, producer_id, session_id, e);
            }
        }
        result
    }

    async fn transition(
        &self,
        action: ControlAction,
        session_id: &str,
        participant_id: &str,
        producer_id: &str,
        expected_kind: Option<MediaKind>,
    ) -> SessionResult<ControlTransition> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let paused = action.target_paused();

        // The lock is held across the engine call: a second pause for the same producer
        // waits here and then sees the updated flag.
        let mut state = session.lock_open().await?;
        let participant = state.participant_mut(participant_id)?;
        let producer = participant
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| SessionError::ProducerNotFound(producer_id.to_string()))?;

        if let Some(kind) = expected_kind {
            if kind != producer.kind {
                return Err(SessionError::InvalidRequest(format!(
                    "producer {producer_id} is {}, not {kind}",
                    producer.kind
                )));
            }
        }
        if producer.paused == paused {
            return Err(match action {
                ControlAction::Pause => SessionError::AlreadyPaused(producer_id.to_string()),
                ControlAction::Resume => SessionError::NotPaused(producer_id.to_string()),
            });
        }

        let media = producer.media.clone();
        let timeout = self.registry.request_timeout();
        match action {
            ControlAction::Pause => bounded(action.operation(), timeout, media.pause()).await?,
            ControlAction::Resume => bounded(action.operation(), timeout, media.resume()).await?,
        }

        producer.paused = paused;
        let kind = producer.kind;
        match kind {
            MediaKind::Audio => participant.audio_muted = paused,
            MediaKind::Video => participant.video_disabled = paused,
        }
        let timestamp = Utc::now();
        participant.last_updated = timestamp;

        let recipients = if self.echo_to_sender {
            state.connections()
        } else {
            state.connections_except(participant_id)
        };
        self.notifier.notify(&recipients, &SessionEvent::ControlChanged {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
            paused,
            timestamp,
        });
        drop(state);

        info!("{} {} producer {} for participant {} in session {}",
              if paused { "Paused" } else { "Resumed" }, kind, producer_id, participant_id, session_id);
        Ok(ControlTransition {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            producer_id: producer_id.to_string(),
            kind,
            paused,
            timestamp,
        })
    }

    /// Control flags of everyone in the session in join order; empty for unknown sessions
    pub async fn session_control_state(&self, session_id: &str) -> Vec<ParticipantControlState> {
        match self.registry.get(session_id) {
            Some(session) => session
                .state
                .lock()
                .await
                .ordered()
                .iter()
                .map(|p| p.control_state())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Mirrored pause flag of a producer, if the session and producer exist
    pub async fn producer_paused(&self, session_id: &str, producer_id: &str) -> Option<bool> {
        let session = self.registry.get(session_id)?;
        let state = session.state.lock().await;
        state.find_producer(producer_id).map(|(_, producer)| producer.paused)
    }
}
