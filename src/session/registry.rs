#![forbid(unsafe_code)]

// Session registry - memoized session creation and teardown

use super::error::{SessionError, SessionResult};
use super::Session;
use crate::media::{bounded, MediaEngine};
use crate::metrics::ServerMetrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A map entry is a cell rather than a session so concurrent creators for the same
/// id all await the one in-flight creation.
type SessionSlot = Arc<OnceCell<Arc<Session>>>;

fn slot_is_live(slot: &SessionSlot) -> bool {
    slot.get().map_or(true, |session| !session.is_closed())
}

/// Owns every live session
pub struct SessionRegistry {
    engine: Arc<dyn MediaEngine>,
    // Outer lock is held briefly and never across an await
    sessions: StdRwLock<HashMap<String, SessionSlot>>,
    request_timeout: Duration,
    metrics: ServerMetrics,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, request_timeout: Duration, metrics: ServerMetrics) -> Self {
        Self {
            engine,
            sessions: StdRwLock::new(HashMap::new()),
            request_timeout,
            metrics,
        }
    }

    /// Bound applied to every media engine call made on behalf of a session
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub(crate) fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Current slot for `session_id`, replacing one whose session already closed
    fn slot(&self, session_id: &str) -> SessionSlot {
        // Fast path: brief outer read lock
        {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = sessions.get(session_id) {
                if slot_is_live(slot) {
                    return slot.clone();
                }
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get(session_id) {
            Some(slot) if slot_is_live(slot) => slot.clone(),
            _ => {
                let slot = SessionSlot::default();
                sessions.insert(session_id.to_string(), slot.clone());
                slot
            }
        }
    }

    /// Returns the live session for `session_id`, creating it if needed.
    ///
    /// Concurrent callers for the same id share a single creation: the media engine is
    /// asked for exactly one resource and every caller gets the same session.
    ///
    /// # Errors
    /// Returns the engine failure if the session resource cannot be created. The failed
    /// attempt is not cached; the next call tries again.
    pub async fn get_or_create(&self, session_id: &str) -> SessionResult<Arc<Session>> {
        let slot = self.slot(session_id);

        let created = slot
            .get_or_try_init(|| async {
                info!("Creating new session: {}", session_id);
                let resource = bounded(
                    "createSessionResource",
                    self.request_timeout,
                    self.engine.create_session_resource(session_id),
                )
                .await?;
                self.metrics.inc_sessions_created();
                debug!("Session {} backed by media resource {}", session_id, resource.id());
                Ok::<_, SessionError>(Arc::new(Session::new(session_id.to_string(), resource)))
            })
            .await;

        match created {
            Ok(session) => Ok(session.clone()),
            Err(e) => {
                warn!("Failed to create session {}: {}", session_id, e);
                self.discard_slot(session_id, &slot);
                Err(e)
            }
        }
    }

    /// Drops an uninitialized slot nobody else is waiting on
    fn discard_slot(&self, session_id: &str, slot: &SessionSlot) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = sessions.get(session_id) {
            // Clones of a slot are only made under this lock, so two references
            // (the map's and ours) means no waiter will initialize it later.
            if Arc::ptr_eq(current, slot) && current.get().is_none() && Arc::strong_count(slot) == 2 {
                sessions.remove(session_id);
            }
        }
    }

    /// Live session for `session_id`, if any
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .and_then(|slot| slot.get())
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Closes the session with this id and everything it owns. No-op if absent.
    pub async fn close(&self, session_id: &str) {
        if let Some(session) = self.get(session_id) {
            self.close_session(&session).await;
        }
    }

    /// Tears down `session`: detaches every participant, removes the registry entry if it
    /// still points at this instance, closes the detached handles and finally releases the
    /// media resource. Safe to call more than once; the resource is released once.
    pub(crate) async fn close_session(&self, session: &Arc<Session>) {
        let (participants, teardown) = {
            let mut state = session.state.lock().await;
            state.closed = true;
            session.mark_closed();
            state.drain()
        };

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            let same_instance = sessions
                .get(session.id())
                .and_then(|slot| slot.get())
                .map_or(false, |current| Arc::ptr_eq(current, session));
            if same_instance {
                sessions.remove(session.id());
            }
        }

        if !participants.is_empty() {
            info!("Closing session {} with {} participants still attached", session.id(), participants.len());
        }
        teardown.run(session.id(), self.request_timeout).await;

        if session.take_release() {
            if let Err(e) = bounded(
                "closeSessionResource",
                self.request_timeout,
                self.engine.close_session_resource(session.resource()),
            )
            .await
            {
                warn!("Failed to release media resource for session {}: {}", session.id(), e);
            }
            let lifetime = Utc::now() - session.created_at();
            info!("Session {} closed after {}s", session.id(), lifetime.num_seconds());
        }
    }

    /// Closes every session
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions...");
        let all: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.values().filter_map(|slot| slot.get().cloned()).collect()
        };
        for session in &all {
            self.close_session(session).await;
        }
        info!("All sessions shut down ({} total)", all.len());
    }

    pub fn session_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .values()
            .filter(|slot| slot.get().map_or(false, |s| !s.is_closed()))
            .count()
    }

    /// Total participants across sessions; sessions busy at the moment are skipped
    pub fn participant_count(&self) -> usize {
        let live: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.values().filter_map(|slot| slot.get().cloned()).collect()
        };
        live.iter()
            .filter_map(|session| session.state.try_lock().ok().map(|state| state.participants.len()))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::Operation;
    use crate::media::{AppData, LoopbackEngine, MediaKind, TransportDirection};
    use crate::session::testing::RecordingNotifier;
    use crate::session::{ConnectionId, NewParticipant, ParticipantManager, ProduceRequest, SessionLimits};

    fn registry(engine: &LoopbackEngine) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            Arc::new(engine.clone()),
            Duration::from_secs(5),
            ServerMetrics::new(),
        ))
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_session() {
        let engine = LoopbackEngine::with_latency(Duration::from_millis(20));
        let registry = registry(&engine);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get_or_create("m1").await }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(engine.stats().sessions_created, 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.metrics().sessions_created(), 1);
    }

    #[tokio::test]
    async fn failed_creation_is_not_cached() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine);
        engine.fail_next(Operation::CreateSession);

        let err = registry.get_or_create("m1").await.err().unwrap();
        assert!(matches!(err, SessionError::Upstream(_)));
        assert!(registry.get("m1").is_none());

        let session = registry.get_or_create("m1").await.unwrap();
        assert_eq!(session.id(), "m1");
        assert_eq!(engine.stats().sessions_created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_creation_times_out() {
        let engine = LoopbackEngine::with_latency(Duration::from_secs(30));
        let registry = registry(&engine);

        let err = registry.get_or_create("m1").await.err().unwrap();
        assert_eq!(err.code(), "upstream_timeout");
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn close_releases_resource_once_and_allows_recreation() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine);

        let first = registry.get_or_create("m1").await.unwrap();
        let resource_id = first.media_resource_id();

        registry.close("m1").await;
        registry.close_session(&first).await;
        registry.close("m1").await;

        assert!(first.is_closed());
        assert!(registry.get("m1").is_none());
        assert_eq!(engine.close_count(&resource_id), 1);

        let second = registry.get_or_create("m1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.stats().sessions_created, 2);
    }

    #[tokio::test]
    async fn closing_a_stale_instance_leaves_the_new_one() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine);

        let stale = registry.get_or_create("m1").await.unwrap();
        stale.mark_closed();
        let fresh = registry.get_or_create("m1").await.unwrap();

        registry.close_session(&stale).await;

        let current = registry.get("m1").unwrap();
        assert!(Arc::ptr_eq(&current, &fresh));
    }

    #[tokio::test]
    async fn closing_a_populated_session_closes_every_handle_once() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine);
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = ParticipantManager::new(registry.clone(), notifier, SessionLimits::default());
        let session = registry.get_or_create("m1").await.unwrap();
        let resource_id = session.media_resource_id();

        let mut joined = Vec::new();
        for name in ["publisher", "subscriber"] {
            let outcome = manager
                .add_participant("m1", NewParticipant {
                    connection_id: ConnectionId::new(),
                    user_id: None,
                    display_name: Some(name.into()),
                })
                .await
                .unwrap();
            joined.push(outcome.participant.participant_id);
        }
        let (publisher, subscriber) = (&joined[0], &joined[1]);

        let send = manager.create_transport("m1", publisher, TransportDirection::Send).await.unwrap();
        let producer = manager
            .create_producer("m1", publisher, ProduceRequest {
                transport_id: send.id.clone(),
                kind: MediaKind::Audio,
                rtp_parameters: serde_json::json!({}),
                app_data: AppData::new(),
            })
            .await
            .unwrap();
        let recv = manager.create_transport("m1", subscriber, TransportDirection::Recv).await.unwrap();
        let consumer = manager
            .create_consumer("m1", subscriber, &producer.producer_id, serde_json::json!({}))
            .await
            .unwrap();

        registry.close("m1").await;
        registry.close("m1").await;

        assert!(registry.get("m1").is_none());
        assert_eq!(registry.participant_count(), 0);
        for id in [&send.id, &recv.id, &producer.producer_id, &consumer.consumer_id, &resource_id] {
            assert_eq!(engine.close_count(id), 1, "{id}");
        }
        assert_eq!(engine.stats().sessions_closed, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine);
        registry.get_or_create("m1").await.unwrap();
        registry.get_or_create("m2").await.unwrap();

        registry.shutdown().await;

        assert_eq!(registry.session_count(), 0);
        assert_eq!(engine.stats().sessions_closed, 2);
    }
}
