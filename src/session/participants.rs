#![forbid(unsafe_code)]

// Participant session manager - membership, capacity and the lifecycle of each
// participant's transport/producer/consumer handles.

use super::control::ParticipantControlState;
use super::error::{SessionError, SessionResult};
use super::registry::SessionRegistry;
use super::{
    ConnectionId, ConsumerHandle, Notifier, Participant, ParticipantSummary, ProducerHandle,
    ProducerSummary, Session, SessionEvent, Teardown, TransportEntry,
};
use crate::media::{
    bounded, AppData, ConsumeOptions, MediaKind, ProduceOptions, TransportDirection,
    TransportOptions, TransportParameters,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_MAX_PARTICIPANTS: usize = 4;
pub const DEFAULT_MAX_CONSUMERS: usize = 16;

/// Per-session and per-participant caps
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_participants: usize,
    pub max_consumers_per_participant: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            max_consumers_per_participant: DEFAULT_MAX_CONSUMERS,
        }
    }
}

/// Identity of a joining participant, already validated upstream
#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub connection_id: ConnectionId,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
}

/// Everything a participant needs right after joining, captured atomically
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub session_id: String,
    pub participant: ParticipantSummary,
    pub existing: Vec<ParticipantSummary>,
    pub producers: Vec<ProducerSummary>,
    pub control_state: Vec<ParticipantControlState>,
    pub rtp_capabilities: serde_json::Value,
}

/// Result of a removal that actually removed someone
#[derive(Debug, Clone)]
pub struct Departure {
    pub participant_id: String,
    pub connection_id: ConnectionId,
    pub closed_producers: Vec<String>,
    pub session_closed: bool,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
    pub app_data: AppData,
}

/// Parameters a client needs to attach a consumer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescription {
    pub consumer_id: String,
    pub producer_id: String,
    pub producer_participant_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: serde_json::Value,
    pub paused: bool,
    pub producer_paused: bool,
}

#[derive(Debug, Clone)]
pub struct ClosedStream {
    pub producer_id: String,
    pub dropped_consumers: usize,
}

/// Owns the participants of every session and the media handles they hold
pub struct ParticipantManager {
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
    limits: SessionLimits,
}

impl ParticipantManager {
    pub fn new(registry: Arc<SessionRegistry>, notifier: Arc<dyn Notifier>, limits: SessionLimits) -> Self {
        Self { registry, notifier, limits }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    fn session(&self, session_id: &str) -> SessionResult<Arc<Session>> {
        self.registry
            .get(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Adds a participant to an existing session and tells its peers.
    ///
    /// # Errors
    /// `SessionNotFound` if the session is absent or closing, `SessionFull` at capacity
    pub async fn add_participant(&self, session_id: &str, info: NewParticipant) -> SessionResult<JoinOutcome> {
        let session = self.session(session_id)?;
        let mut state = session.lock_open().await?;

        if state.participants.len() >= self.limits.max_participants {
            return Err(SessionError::SessionFull {
                session_id: session_id.to_string(),
                capacity: self.limits.max_participants,
            });
        }

        let existing: Vec<ParticipantSummary> = state.ordered().iter().map(|p| p.summary()).collect();
        let peers = state.connections();

        let mut participant = Participant::new(String::new(), String::new(), info.connection_id);
        participant.user_id = info.user_id.unwrap_or_else(|| participant.id.clone());
        participant.display_name = info.display_name.unwrap_or_else(|| "Guest".to_string());
        participant.join_seq = state.next_join_seq;
        state.next_join_seq += 1;
        let summary = participant.summary();
        let joined_at = participant.joined_at;
        let participant_id = participant.id.clone();
        state.participants.insert(participant_id.clone(), participant);

        let outcome = JoinOutcome {
            session_id: session_id.to_string(),
            participant: summary.clone(),
            existing,
            producers: state.producers(),
            control_state: state.ordered().iter().map(|p| p.control_state()).collect(),
            rtp_capabilities: session.rtp_capabilities(),
        };

        self.notifier.notify(&peers, &SessionEvent::ParticipantJoined {
            session_id: session_id.to_string(),
            participant: summary,
            timestamp: joined_at,
        });
        drop(state);

        self.registry.metrics().inc_joins();
        info!("Participant {} ({}) joined session {}",
              participant_id, outcome.participant.display_name, session_id);
        Ok(outcome)
    }

    /// Removes a participant and everything it owns. Returns `None` when there was nothing
    /// to remove, so racing leave and disconnect paths converge without errors. Empties the
    /// session and closes it when this was the last participant.
    pub async fn remove_participant(&self, session_id: &str, participant_id: &str) -> Option<Departure> {
        let session = self.registry.get(session_id)?;

        let (departure, teardown) = {
            let mut state = session.state.lock().await;
            let (participant, teardown) = state.detach_participant(participant_id)?;

            let closed_producers: Vec<String> = participant.producers.keys().cloned().collect();
            let remaining = state.connections();
            let now = Utc::now();
            for producer_id in &closed_producers {
                self.notifier.notify(&remaining, &SessionEvent::StreamClosed {
                    session_id: session_id.to_string(),
                    participant_id: participant_id.to_string(),
                    producer_id: producer_id.clone(),
                    timestamp: now,
                });
            }
            self.notifier.notify(&remaining, &SessionEvent::ParticipantLeft {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                timestamp: now,
            });

            let session_closed = state.participants.is_empty();
            if session_closed {
                // Joiners racing with us now see a closed session and start a fresh one.
                state.closed = true;
                session.mark_closed();
            }

            (
                Departure {
                    participant_id: participant_id.to_string(),
                    connection_id: participant.connection_id,
                    closed_producers,
                    session_closed,
                },
                teardown,
            )
        };

        teardown.run(session_id, self.registry.request_timeout()).await;
        self.registry.metrics().inc_leaves();
        info!("Participant {} left session {}", participant_id, session_id);

        if departure.session_closed {
            info!("Session {} is empty, cleaning up", session_id);
            self.registry.close_session(&session).await;
        }
        Some(departure)
    }

    /// Creates the participant's send or receive transport
    ///
    /// # Errors
    /// `SessionNotFound`, `ParticipantNotFound`, `InvalidRequest` if that direction already
    /// has a transport, or the engine failure
    pub async fn create_transport(
        &self,
        session_id: &str,
        participant_id: &str,
        direction: TransportDirection,
    ) -> SessionResult<TransportParameters> {
        let session = self.session(session_id)?;
        {
            let state = session.lock_open().await?;
            if state.participant(participant_id)?.transport_id(direction).is_some() {
                return Err(SessionError::InvalidRequest(format!("{direction} transport already exists")));
            }
        }

        let transport = bounded(
            "createTransport",
            self.registry.request_timeout(),
            session.resource().create_transport(TransportOptions {
                direction,
                participant_id: participant_id.to_string(),
            }),
        )
        .await?;
        let transport_id = transport.id();

        let registered = async {
            let mut state = session.lock_open().await?;
            let participant = state.participant_mut(participant_id)?;
            let slot = match direction {
                TransportDirection::Send => &mut participant.send_transport_id,
                TransportDirection::Recv => &mut participant.recv_transport_id,
            };
            if slot.is_some() {
                return Err(SessionError::InvalidRequest(format!("{direction} transport already exists")));
            }
            *slot = Some(transport_id.clone());
            state.transports.insert(transport_id.clone(), TransportEntry {
                owner: participant_id.to_string(),
                direction,
                media: transport.clone(),
            });
            Ok::<(), SessionError>(())
        }
        .await;

        if let Err(e) = registered {
            debug!("Discarding transport {} created for departed participant {}", transport_id, participant_id);
            Teardown { transports: vec![transport], ..Teardown::default() }
                .run(session_id, self.registry.request_timeout())
                .await;
            return Err(e);
        }

        info!("Created {} transport {} for participant {} in session {}",
              direction, transport_id, participant_id, session_id);
        Ok(transport.parameters())
    }

    /// Completes the DTLS handshake setup of one of the caller's transports
    ///
    /// # Errors
    /// `TransportNotFound` unless the transport belongs to the caller
    pub async fn connect_transport(
        &self,
        session_id: &str,
        participant_id: &str,
        transport_id: &str,
        dtls_parameters: serde_json::Value,
    ) -> SessionResult<()> {
        let session = self.session(session_id)?;
        let (transport, direction) = {
            let state = session.lock_open().await?;
            state.participant(participant_id)?;
            match state.transports.get(transport_id) {
                Some(entry) if entry.owner == participant_id => (entry.media.clone(), entry.direction),
                _ => return Err(SessionError::TransportNotFound(transport_id.to_string())),
            }
        };

        bounded("connectTransport", self.registry.request_timeout(), transport.connect(dtls_parameters)).await?;
        debug!("Connected {} transport {} for participant {}", direction, transport_id, participant_id);
        Ok(())
    }

    /// Creates a producer on the caller's send transport and announces it to peers.
    /// A producer starts active.
    ///
    /// # Errors
    /// `TransportNotFound` unless `transport_id` is the caller's send transport, or the engine failure
    pub async fn create_producer(
        &self,
        session_id: &str,
        participant_id: &str,
        request: ProduceRequest,
    ) -> SessionResult<ProducerSummary> {
        let session = self.session(session_id)?;
        let transport = {
            let state = session.lock_open().await?;
            let participant = state.participant(participant_id)?;
            if participant.send_transport_id.as_deref() != Some(request.transport_id.as_str()) {
                return Err(SessionError::TransportNotFound(request.transport_id));
            }
            match state.transports.get(&request.transport_id) {
                Some(entry) => entry.media.clone(),
                None => return Err(SessionError::TransportNotFound(request.transport_id)),
            }
        };

        let producer = bounded(
            "produce",
            self.registry.request_timeout(),
            transport.produce(ProduceOptions {
                kind: request.kind,
                rtp_parameters: request.rtp_parameters,
                app_data: request.app_data.clone(),
            }),
        )
        .await?;
        let producer_id = producer.id();

        let registered = async {
            let mut state = session.lock_open().await?;
            let participant = state.participant_mut(participant_id)?;
            if participant.send_transport_id.as_deref() != Some(request.transport_id.as_str()) {
                return Err(SessionError::TransportNotFound(request.transport_id.clone()));
            }
            participant.producers.insert(producer_id.clone(), ProducerHandle {
                id: producer_id.clone(),
                kind: request.kind,
                paused: false,
                app_data: request.app_data.clone(),
                media: producer.clone(),
            });

            let peers = state.connections_except(participant_id);
            self.notifier.notify(&peers, &SessionEvent::NewStreamAvailable {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                producer_id: producer_id.clone(),
                kind: request.kind,
                app_data: request.app_data.clone(),
                timestamp: Utc::now(),
            });
            Ok::<(), SessionError>(())
        }
        .await;

        if let Err(e) = registered {
            debug!("Discarding producer {} after failed registration: {}", producer_id, e);
            Teardown { producers: vec![producer], ..Teardown::default() }
                .run(session_id, self.registry.request_timeout())
                .await;
            return Err(e);
        }

        self.registry.metrics().inc_producers_created();
        info!("Created {} producer {} for participant {} in session {}",
              request.kind, producer_id, participant_id, session_id);
        Ok(ProducerSummary {
            producer_id,
            participant_id: participant_id.to_string(),
            kind: request.kind,
            paused: false,
            app_data: request.app_data,
        })
    }

    /// Subscribes the caller to a producer. The consumer always starts paused; the client
    /// resumes it once its receiving side is attached.
    ///
    /// # Errors
    /// `ConsumerLimit`, `ProducerNotFound`, `TransportNotFound` without a receive transport,
    /// or the engine failure
    pub async fn create_consumer(
        &self,
        session_id: &str,
        participant_id: &str,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> SessionResult<ConsumerDescription> {
        let session = self.session(session_id)?;
        let (transport, recv_transport_id, kind, producer_participant_id, producer_paused) = {
            let state = session.lock_open().await?;
            let participant = state.participant(participant_id)?;
            if participant.consumers.len() >= self.limits.max_consumers_per_participant {
                return Err(SessionError::ConsumerLimit(self.limits.max_consumers_per_participant));
            }
            let (owner, producer) = state
                .find_producer(producer_id)
                .ok_or_else(|| SessionError::ProducerNotFound(producer_id.to_string()))?;
            let recv_transport_id = participant
                .recv_transport_id
                .clone()
                .ok_or_else(|| SessionError::TransportNotFound("recv".to_string()))?;
            let transport = state
                .transports
                .get(&recv_transport_id)
                .map(|entry| entry.media.clone())
                .ok_or_else(|| SessionError::TransportNotFound(recv_transport_id.clone()))?;
            (transport, recv_transport_id, producer.kind, owner.id.clone(), producer.paused)
        };

        let consumer = bounded(
            "consume",
            self.registry.request_timeout(),
            transport.consume(ConsumeOptions {
                producer_id: producer_id.to_string(),
                kind,
                rtp_capabilities,
                paused: true,
            }),
        )
        .await?;
        let consumer_id = consumer.id();

        let registered = async {
            let mut state = session.lock_open().await?;
            if state.find_producer(producer_id).is_none() {
                return Err(SessionError::ProducerNotFound(producer_id.to_string()));
            }
            let participant = state.participant_mut(participant_id)?;
            if participant.recv_transport_id.as_deref() != Some(recv_transport_id.as_str()) {
                return Err(SessionError::TransportNotFound(recv_transport_id.clone()));
            }
            if participant.consumers.len() >= self.limits.max_consumers_per_participant {
                return Err(SessionError::ConsumerLimit(self.limits.max_consumers_per_participant));
            }
            participant.consumers.insert(consumer_id.clone(), ConsumerHandle {
                id: consumer_id.clone(),
                producer_id: producer_id.to_string(),
                kind,
                paused: true,
                media: consumer.clone(),
            });
            Ok::<(), SessionError>(())
        }
        .await;

        if let Err(e) = registered {
            debug!("Discarding consumer {} after failed registration: {}", consumer_id, e);
            Teardown { consumers: vec![consumer], ..Teardown::default() }
                .run(session_id, self.registry.request_timeout())
                .await;
            return Err(e);
        }

        self.registry.metrics().inc_consumers_created();
        debug!("Created consumer {} of producer {} for participant {} in session {}",
               consumer_id, producer_id, participant_id, session_id);
        Ok(ConsumerDescription {
            consumer_id,
            producer_id: producer_id.to_string(),
            producer_participant_id,
            kind,
            rtp_parameters: consumer.rtp_parameters(),
            paused: true,
            producer_paused,
        })
    }

    /// Starts media flow on one of the caller's consumers. Resuming an active consumer is a no-op.
    pub async fn resume_consumer(&self, session_id: &str, participant_id: &str, consumer_id: &str) -> SessionResult<()> {
        self.set_consumer_paused(session_id, participant_id, consumer_id, false).await
    }

    /// Stops media flow on one of the caller's consumers. Pausing a paused consumer is a no-op.
    pub async fn pause_consumer(&self, session_id: &str, participant_id: &str, consumer_id: &str) -> SessionResult<()> {
        self.set_consumer_paused(session_id, participant_id, consumer_id, true).await
    }

    async fn set_consumer_paused(
        &self,
        session_id: &str,
        participant_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> SessionResult<()> {
        let session = self.session(session_id)?;
        // Held across the engine call so the mirrored flag cannot diverge.
        let mut state = session.lock_open().await?;
        let consumer = state
            .participant_mut(participant_id)?
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::ConsumerNotFound(consumer_id.to_string()))?;
        if consumer.paused == paused {
            return Ok(());
        }

        let media = consumer.media.clone();
        if paused {
            bounded("pauseConsumer", self.registry.request_timeout(), media.pause()).await?;
        } else {
            bounded("resumeConsumer", self.registry.request_timeout(), media.resume()).await?;
        }
        consumer.paused = paused;

        debug!("{} consumer {} for participant {}",
               if paused { "Paused" } else { "Resumed" }, consumer_id, participant_id);
        Ok(())
    }

    /// Closes one of the caller's producers, drops every consumer of it and tells peers
    ///
    /// # Errors
    /// `ProducerNotFound` unless the caller owns the producer
    pub async fn close_producer(
        &self,
        session_id: &str,
        participant_id: &str,
        producer_id: &str,
    ) -> SessionResult<ClosedStream> {
        let session = self.session(session_id)?;
        let teardown = {
            let mut state = session.lock_open().await?;
            let producer = state
                .participant_mut(participant_id)?
                .producers
                .remove(producer_id)
                .ok_or_else(|| SessionError::ProducerNotFound(producer_id.to_string()))?;

            let mut teardown = Teardown::default();
            state.detach_consumers_of(producer_id, &mut teardown);
            teardown.producers.push(producer.media);

            let peers = state.connections_except(participant_id);
            self.notifier.notify(&peers, &SessionEvent::StreamClosed {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                producer_id: producer_id.to_string(),
                timestamp: Utc::now(),
            });
            teardown
        };

        let dropped_consumers = teardown.consumers.len();
        teardown.run(session_id, self.registry.request_timeout()).await;
        info!("Closed producer {} for participant {} in session {}", producer_id, participant_id, session_id);
        Ok(ClosedStream { producer_id: producer_id.to_string(), dropped_consumers })
    }

    /// Every producer in the session, in participant join order. Empty for unknown sessions.
    pub async fn list_producers(&self, session_id: &str) -> Vec<ProducerSummary> {
        match self.registry.get(session_id) {
            Some(session) => session.state.lock().await.producers(),
            None => Vec::new(),
        }
    }

    /// Codec capabilities of the session's media resource
    ///
    /// # Errors
    /// `SessionNotFound`
    pub fn rtp_capabilities(&self, session_id: &str) -> SessionResult<serde_json::Value> {
        Ok(self.session(session_id)?.rtp_capabilities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::Operation;
    use crate::media::LoopbackEngine;
    use crate::metrics::ServerMetrics;
    use crate::session::testing::RecordingNotifier;
    use std::time::Duration;

    struct Fixture {
        engine: LoopbackEngine,
        notifier: Arc<RecordingNotifier>,
        manager: ParticipantManager,
    }

    fn fixture(limits: SessionLimits) -> Fixture {
        let engine = LoopbackEngine::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(engine.clone()),
            Duration::from_secs(5),
            ServerMetrics::new(),
        ));
        let manager = ParticipantManager::new(registry, notifier.clone(), limits);
        Fixture { engine, notifier, manager }
    }

    async fn join(manager: &ParticipantManager, session_id: &str, name: &str) -> JoinOutcome {
        manager.registry().get_or_create(session_id).await.unwrap();
        manager
            .add_participant(session_id, NewParticipant {
                connection_id: ConnectionId::new(),
                user_id: None,
                display_name: Some(name.to_string()),
            })
            .await
            .unwrap()
    }

    /// Participant with a connected send transport and one producer of `kind`
    async fn publisher(manager: &ParticipantManager, session_id: &str, kind: MediaKind) -> (String, String) {
        let joined = join(manager, session_id, "publisher").await;
        let pid = joined.participant.participant_id;
        let transport = manager.create_transport(session_id, &pid, TransportDirection::Send).await.unwrap();
        manager.connect_transport(session_id, &pid, &transport.id, serde_json::json!({})).await.unwrap();
        let producer = manager
            .create_producer(session_id, &pid, ProduceRequest {
                transport_id: transport.id,
                kind,
                rtp_parameters: serde_json::json!({}),
                app_data: AppData::new(),
            })
            .await
            .unwrap();
        (pid, producer.producer_id)
    }

    #[tokio::test]
    async fn join_requires_a_session() {
        let f = fixture(SessionLimits::default());
        let err = f
            .manager
            .add_participant("nope", NewParticipant {
                connection_id: ConnectionId::new(),
                user_id: None,
                display_name: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::SessionNotFound("nope".into()));
    }

    #[tokio::test]
    async fn join_reports_existing_participants_in_order() {
        let f = fixture(SessionLimits::default());
        let p1 = join(&f.manager, "m1", "alice").await;
        assert!(p1.existing.is_empty());
        assert_eq!(p1.participant.display_name, "alice");
        assert_eq!(p1.participant.user_id, p1.participant.participant_id);

        let p2 = join(&f.manager, "m1", "bob").await;
        assert_eq!(p2.existing, vec![p1.participant.clone()]);
        assert_eq!(p2.control_state.len(), 2);
    }

    #[tokio::test]
    async fn full_session_rejects_and_keeps_membership() {
        let f = fixture(SessionLimits { max_participants: 2, ..SessionLimits::default() });
        join(&f.manager, "m1", "a").await;
        join(&f.manager, "m1", "b").await;
        let session = f.manager.registry().get("m1").unwrap();
        let before = session.participant_ids().await;

        let err = f
            .manager
            .add_participant("m1", NewParticipant {
                connection_id: ConnectionId::new(),
                user_id: None,
                display_name: Some("c".into()),
            })
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::SessionFull { session_id: "m1".into(), capacity: 2 });
        assert_eq!(session.participant_ids().await, before);
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_closes_each_handle_once() {
        let f = fixture(SessionLimits::default());
        let (pid, producer_id) = publisher(&f.manager, "m1", MediaKind::Audio).await;
        join(&f.manager, "m1", "listener").await;

        let first = f.manager.remove_participant("m1", &pid).await.unwrap();
        assert_eq!(first.closed_producers, vec![producer_id.clone()]);
        assert!(!first.session_closed);

        assert!(f.manager.remove_participant("m1", &pid).await.is_none());
        assert!(f.manager.remove_participant("unknown", &pid).await.is_none());
        assert_eq!(f.engine.close_count(&producer_id), 1);

        let left = f
            .notifier
            .deliveries()
            .into_iter()
            .filter(|(_, event)| matches!(event, SessionEvent::ParticipantLeft { .. }))
            .count();
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn concurrent_removals_tear_down_once() {
        let f = Arc::new(fixture(SessionLimits::default()));
        let (pid, producer_id) = publisher(&f.manager, "m1", MediaKind::Video).await;

        let a = { let f = f.clone(); let pid = pid.clone(); tokio::spawn(async move { f.manager.remove_participant("m1", &pid).await }) };
        let b = { let f = f.clone(); let pid = pid.clone(); tokio::spawn(async move { f.manager.remove_participant("m1", &pid).await }) };
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(f.engine.close_count(&producer_id), 1);
        assert_eq!(f.engine.stats().sessions_closed, 1);
    }

    #[tokio::test]
    async fn last_departure_closes_the_session() {
        let f = fixture(SessionLimits::default());
        let joined = join(&f.manager, "m1", "solo").await;

        let departure = f.manager.remove_participant("m1", &joined.participant.participant_id).await.unwrap();

        assert!(departure.session_closed);
        assert!(f.manager.registry().get("m1").is_none());
        assert_eq!(f.engine.stats().sessions_closed, 1);
    }

    #[tokio::test]
    async fn consumers_start_paused_and_resume_explicitly() {
        let f = fixture(SessionLimits::default());
        let (_, producer_id) = publisher(&f.manager, "m1", MediaKind::Audio).await;
        let sub = join(&f.manager, "m1", "sub").await.participant.participant_id;
        f.manager.create_transport("m1", &sub, TransportDirection::Recv).await.unwrap();

        let consumer = f.manager.create_consumer("m1", &sub, &producer_id, serde_json::json!({})).await.unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Audio);

        f.manager.resume_consumer("m1", &sub, &consumer.consumer_id).await.unwrap();
        f.manager.resume_consumer("m1", &sub, &consumer.consumer_id).await.unwrap();

        let session = f.manager.registry().get("m1").unwrap();
        let state = session.state.lock().await;
        assert!(!state.participants[&sub].consumers[&consumer.consumer_id].paused);
    }

    #[tokio::test]
    async fn consume_needs_a_receive_transport_and_a_known_producer() {
        let f = fixture(SessionLimits::default());
        let (_, producer_id) = publisher(&f.manager, "m1", MediaKind::Audio).await;
        let sub = join(&f.manager, "m1", "sub").await.participant.participant_id;

        let err = f.manager.create_consumer("m1", &sub, &producer_id, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportNotFound(_)));

        f.manager.create_transport("m1", &sub, TransportDirection::Recv).await.unwrap();
        let err = f.manager.create_consumer("m1", &sub, "ghost", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, SessionError::ProducerNotFound("ghost".into()));
    }

    #[tokio::test]
    async fn consumer_limit_is_enforced() {
        let f = fixture(SessionLimits { max_participants: 4, max_consumers_per_participant: 1 });
        let (_, producer_id) = publisher(&f.manager, "m1", MediaKind::Video).await;
        let sub = join(&f.manager, "m1", "sub").await.participant.participant_id;
        f.manager.create_transport("m1", &sub, TransportDirection::Recv).await.unwrap();

        f.manager.create_consumer("m1", &sub, &producer_id, serde_json::json!({})).await.unwrap();
        let err = f.manager.create_consumer("m1", &sub, &producer_id, serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, SessionError::ConsumerLimit(1));
    }

    #[tokio::test]
    async fn failed_produce_registers_nothing() {
        let f = fixture(SessionLimits::default());
        let pid = join(&f.manager, "m1", "p").await.participant.participant_id;
        let transport = f.manager.create_transport("m1", &pid, TransportDirection::Send).await.unwrap();
        f.engine.fail_next(Operation::Produce);

        let err = f
            .manager
            .create_producer("m1", &pid, ProduceRequest {
                transport_id: transport.id,
                kind: MediaKind::Audio,
                rtp_parameters: serde_json::json!({}),
                app_data: AppData::new(),
            })
            .await
            .unwrap_err();

        assert_eq!(err.category(), crate::session::ErrorCategory::UpstreamFailure);
        assert!(f.manager.list_producers("m1").await.is_empty());
        assert!(f.notifier.deliveries().iter().all(|(_, e)| !matches!(e, SessionEvent::NewStreamAvailable { .. })));
    }

    #[tokio::test]
    async fn failed_transport_creation_leaves_the_slot_free() {
        let f = fixture(SessionLimits::default());
        let pid = join(&f.manager, "m1", "p").await.participant.participant_id;
        f.engine.fail_next(Operation::CreateTransport);

        assert!(f.manager.create_transport("m1", &pid, TransportDirection::Send).await.is_err());
        let session = f.manager.registry().get("m1").unwrap();
        assert!(session.state.lock().await.transports.is_empty());

        f.manager.create_transport("m1", &pid, TransportDirection::Send).await.unwrap();
        let err = f.manager.create_transport("m1", &pid, TransportDirection::Send).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn producer_must_use_the_callers_send_transport() {
        let f = fixture(SessionLimits::default());
        let pid = join(&f.manager, "m1", "p").await.participant.participant_id;
        let recv = f.manager.create_transport("m1", &pid, TransportDirection::Recv).await.unwrap();

        let err = f
            .manager
            .create_producer("m1", &pid, ProduceRequest {
                transport_id: recv.id.clone(),
                kind: MediaKind::Audio,
                rtp_parameters: serde_json::json!({}),
                app_data: AppData::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::TransportNotFound(recv.id));
    }

    #[tokio::test]
    async fn closing_a_producer_drops_its_consumers() {
        let f = fixture(SessionLimits::default());
        let (owner, producer_id) = publisher(&f.manager, "m1", MediaKind::Video).await;
        let sub = join(&f.manager, "m1", "sub").await.participant.participant_id;
        f.manager.create_transport("m1", &sub, TransportDirection::Recv).await.unwrap();
        let consumer = f.manager.create_consumer("m1", &sub, &producer_id, serde_json::json!({})).await.unwrap();

        let closed = f.manager.close_producer("m1", &owner, &producer_id).await.unwrap();

        assert_eq!(closed.dropped_consumers, 1);
        assert_eq!(f.engine.close_count(&consumer.consumer_id), 1);
        assert!(f.manager.list_producers("m1").await.is_empty());
        assert!(f.manager.close_producer("m1", &owner, &producer_id).await.is_err());
    }

    #[tokio::test]
    async fn new_streams_are_announced_to_peers_only() {
        let f = fixture(SessionLimits::default());
        let listener = join(&f.manager, "m1", "listener").await;
        let (owner, producer_id) = publisher(&f.manager, "m1", MediaKind::Audio).await;

        let session = f.manager.registry().get("m1").unwrap();
        let listener_conn = session.state.lock().await.participants[&listener.participant.participant_id].connection_id;

        let announced: Vec<_> = f
            .notifier
            .deliveries()
            .into_iter()
            .filter(|(_, e)| matches!(e, SessionEvent::NewStreamAvailable { .. }))
            .collect();
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].0, vec![listener_conn]);

        let producers = f.manager.list_producers("m1").await;
        assert_eq!(producers.len(), 1);
        assert_eq!(producers[0].participant_id, owner);
        assert_eq!(producers[0].producer_id, producer_id);
    }
}
