#![forbid(unsafe_code)]

// Session module - in-memory registry of sessions, their participants and the
// media handles each participant owns.

pub mod control;
pub mod error;
pub mod participants;
pub mod registry;

pub use control::{ControlAction, ControlStateMachine, ControlTransition, ParticipantControlState};
pub use error::{ErrorCategory, SessionError, SessionResult};
pub use participants::{
    ClosedStream, ConsumerDescription, Departure, JoinOutcome, NewParticipant, ParticipantManager,
    ProduceRequest, SessionLimits,
};
pub use registry::SessionRegistry;

use crate::media::{
    bounded, AppData, MediaConsumer, MediaKind, MediaProducer, MediaTransport, SessionResource,
    TransportDirection,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

/// Identifier of one live client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Mirror of a producer held by the media engine. `paused` is only ever written
/// after the matching engine call succeeded.
pub struct ProducerHandle {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub app_data: AppData,
    pub(crate) media: Arc<dyn MediaProducer>,
}

pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    pub(crate) media: Arc<dyn MediaConsumer>,
}

pub(crate) struct TransportEntry {
    pub(crate) owner: String,
    pub(crate) direction: TransportDirection,
    pub(crate) media: Arc<dyn MediaTransport>,
}

/// One connected endpoint inside a session
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub connection_id: ConnectionId,
    pub send_transport_id: Option<String>,
    pub recv_transport_id: Option<String>,
    pub producers: HashMap<String, ProducerHandle>,
    pub consumers: HashMap<String, ConsumerHandle>,
    pub audio_muted: bool,
    pub video_disabled: bool,
    pub last_updated: DateTime<Utc>,
    pub joined_at: DateTime<Utc>,
    pub(crate) join_seq: u64,
}

impl Participant {
    pub(crate) fn new(user_id: String, display_name: String, connection_id: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            display_name,
            connection_id,
            send_transport_id: None,
            recv_transport_id: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            audio_muted: false,
            video_disabled: false,
            last_updated: now,
            joined_at: now,
            join_seq: 0,
        }
    }

    pub fn transport_id(&self, direction: TransportDirection) -> Option<&str> {
        match direction {
            TransportDirection::Send => self.send_transport_id.as_deref(),
            TransportDirection::Recv => self.recv_transport_id.as_deref(),
        }
    }

    pub fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            participant_id: self.id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            audio_muted: self.audio_muted,
            video_disabled: self.video_disabled,
        }
    }

    pub fn control_state(&self) -> ParticipantControlState {
        ParticipantControlState {
            participant_id: self.id.clone(),
            audio_muted: self.audio_muted,
            video_disabled: self.video_disabled,
            last_updated: self.last_updated,
        }
    }
}

/// What peers learn about a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub participant_id: String,
    pub user_id: String,
    pub display_name: String,
    pub audio_muted: bool,
    pub video_disabled: bool,
}

/// A stream a participant can subscribe to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub participant_id: String,
    pub kind: MediaKind,
    pub paused: bool,
    #[serde(skip_serializing_if = "AppData::is_empty")]
    pub app_data: AppData,
}

/// Mutable part of a session. Only touched while holding `Session::state`.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) participants: HashMap<String, Participant>,
    pub(crate) transports: HashMap<String, TransportEntry>,
    pub(crate) closed: bool,
    pub(crate) next_join_seq: u64,
}

impl SessionState {
    pub(crate) fn participant(&self, participant_id: &str) -> SessionResult<&Participant> {
        self.participants
            .get(participant_id)
            .ok_or_else(|| SessionError::ParticipantNotFound(participant_id.to_string()))
    }

    pub(crate) fn participant_mut(&mut self, participant_id: &str) -> SessionResult<&mut Participant> {
        self.participants
            .get_mut(participant_id)
            .ok_or_else(|| SessionError::ParticipantNotFound(participant_id.to_string()))
    }

    /// Participants in join order
    pub(crate) fn ordered(&self) -> Vec<&Participant> {
        let mut participants: Vec<&Participant> = self.participants.values().collect();
        participants.sort_by_key(|p| p.join_seq);
        participants
    }

    pub(crate) fn connections(&self) -> Vec<ConnectionId> {
        self.ordered().iter().map(|p| p.connection_id).collect()
    }

    pub(crate) fn connections_except(&self, participant_id: &str) -> Vec<ConnectionId> {
        self.ordered()
            .iter()
            .filter(|p| p.id != participant_id)
            .map(|p| p.connection_id)
            .collect()
    }

    pub(crate) fn find_producer(&self, producer_id: &str) -> Option<(&Participant, &ProducerHandle)> {
        self.participants
            .values()
            .find_map(|p| p.producers.get(producer_id).map(|producer| (p, producer)))
    }

    pub(crate) fn producers(&self) -> Vec<ProducerSummary> {
        self.ordered()
            .iter()
            .flat_map(|p| {
                p.producers.values().map(|producer| ProducerSummary {
                    producer_id: producer.id.clone(),
                    participant_id: p.id.clone(),
                    kind: producer.kind,
                    paused: producer.paused,
                    app_data: producer.app_data.clone(),
                })
            })
            .collect()
    }

    /// Drops every consumer of `producer_id` held by any participant
    pub(crate) fn detach_consumers_of(&mut self, producer_id: &str, teardown: &mut Teardown) {
        for participant in self.participants.values_mut() {
            participant.consumers.retain(|_, consumer| {
                if consumer.producer_id == producer_id {
                    teardown.consumers.push(consumer.media.clone());
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Removes a participant and collects every handle it owns, plus the consumers
    /// other participants hold on its producers.
    pub(crate) fn detach_participant(&mut self, participant_id: &str) -> Option<(Participant, Teardown)> {
        let mut participant = self.participants.remove(participant_id)?;
        let mut teardown = Teardown::default();

        teardown
            .consumers
            .extend(participant.consumers.drain().map(|(_, consumer)| consumer.media));

        let producer_ids: Vec<String> = participant.producers.keys().cloned().collect();
        for producer_id in &producer_ids {
            self.detach_consumers_of(producer_id, &mut teardown);
        }
        teardown
            .producers
            .extend(participant.producers.values().map(|producer| producer.media.clone()));

        for transport_id in [participant.send_transport_id.take(), participant.recv_transport_id.take()]
            .into_iter()
            .flatten()
        {
            if let Some(entry) = self.transports.remove(&transport_id) {
                teardown.transports.push(entry.media);
            }
        }
        // Anything else registered under this owner (should be nothing).
        let orphaned: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, entry)| entry.owner == participant_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in orphaned {
            if let Some(entry) = self.transports.remove(&transport_id) {
                teardown.transports.push(entry.media);
            }
        }

        Some((participant, teardown))
    }

    /// Detaches every participant
    pub(crate) fn drain(&mut self) -> (Vec<Participant>, Teardown) {
        let ids: Vec<String> = self.participants.keys().cloned().collect();
        let mut removed = Vec::with_capacity(ids.len());
        let mut teardown = Teardown::default();
        for id in ids {
            if let Some((participant, t)) = self.detach_participant(&id) {
                removed.push(participant);
                teardown.absorb(t);
            }
        }
        for (_, entry) in self.transports.drain() {
            teardown.transports.push(entry.media);
        }
        (removed, teardown)
    }
}

/// Media handles detached from session state, closed after the state lock is released
#[derive(Default)]
pub(crate) struct Teardown {
    pub(crate) consumers: Vec<Arc<dyn MediaConsumer>>,
    pub(crate) producers: Vec<Arc<dyn MediaProducer>>,
    pub(crate) transports: Vec<Arc<dyn MediaTransport>>,
}

impl Teardown {
    fn absorb(&mut self, other: Teardown) {
        self.consumers.extend(other.consumers);
        self.producers.extend(other.producers);
        self.transports.extend(other.transports);
    }

    /// Closes consumers, then producers, then transports. Failures are logged, never returned.
    pub(crate) async fn run(self, session_id: &str, timeout: Duration) {
        for consumer in self.consumers {
            if let Err(e) = bounded("closeConsumer", timeout, consumer.close()).await {
                warn!("Failed to close consumer {} in session {}: {}", consumer.id(), session_id, e);
            }
        }
        for producer in self.producers {
            if let Err(e) = bounded("closeProducer", timeout, producer.close()).await {
                warn!("Failed to close producer {} in session {}: {}", producer.id(), session_id, e);
            }
        }
        for transport in self.transports {
            if let Err(e) = bounded("closeTransport", timeout, transport.close()).await {
                warn!("Failed to close transport {} in session {}: {}", transport.id(), session_id, e);
            }
        }
    }
}

/// One multi-party call
pub struct Session {
    id: String,
    resource: Arc<dyn SessionResource>,
    created_at: DateTime<Utc>,
    closed: AtomicBool,
    released: AtomicBool,
    pub(crate) state: TokioMutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: String, resource: Arc<dyn SessionResource>) -> Self {
        Self {
            id,
            resource,
            created_at: Utc::now(),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            state: TokioMutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn media_resource_id(&self) -> String {
        self.resource.id()
    }

    pub fn rtp_capabilities(&self) -> serde_json::Value {
        self.resource.rtp_capabilities()
    }

    pub(crate) fn resource(&self) -> Arc<dyn SessionResource> {
        self.resource.clone()
    }

    /// Locks the state of a session that is still open
    pub(crate) async fn lock_open(&self) -> SessionResult<MutexGuard<'_, SessionState>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(SessionError::SessionNotFound(self.id.clone()));
        }
        Ok(state)
    }

    /// Set once the session starts tearing down; a closed session never accepts participants again
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Call with the state lock held, together with `SessionState::closed = true`
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// True for exactly one caller
    pub(crate) fn take_release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }

    pub async fn participant_ids(&self) -> Vec<String> {
        self.state.lock().await.ordered().iter().map(|p| p.id.clone()).collect()
    }
}

/// State changes pushed to session members
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ParticipantJoined {
        session_id: String,
        participant: ParticipantSummary,
        timestamp: DateTime<Utc>,
    },
    ParticipantLeft {
        session_id: String,
        participant_id: String,
        timestamp: DateTime<Utc>,
    },
    NewStreamAvailable {
        session_id: String,
        participant_id: String,
        producer_id: String,
        kind: MediaKind,
        app_data: AppData,
        timestamp: DateTime<Utc>,
    },
    StreamClosed {
        session_id: String,
        participant_id: String,
        producer_id: String,
        timestamp: DateTime<Utc>,
    },
    ControlChanged {
        session_id: String,
        participant_id: String,
        producer_id: String,
        kind: MediaKind,
        paused: bool,
        timestamp: DateTime<Utc>,
    },
}

/// Delivers session events to connections. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipients: &[ConnectionId], event: &SessionEvent);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that keeps every delivery for assertions
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        deliveries: Mutex<Vec<(Vec<ConnectionId>, SessionEvent)>>,
    }

    impl RecordingNotifier {
        pub(crate) fn deliveries(&self) -> Vec<(Vec<ConnectionId>, SessionEvent)> {
            self.deliveries.lock().unwrap().clone()
        }

        pub(crate) fn control_events(&self) -> Vec<(Vec<ConnectionId>, SessionEvent)> {
            self.deliveries()
                .into_iter()
                .filter(|(_, event)| matches!(event, SessionEvent::ControlChanged { .. }))
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, recipients: &[ConnectionId], event: &SessionEvent) {
            self.deliveries.lock().unwrap().push((recipients.to_vec(), event.clone()));
        }
    }
}
