#![forbid(unsafe_code)]

// Loopback media engine - allocates ids and mirrors pause state without moving any media.
// Runs the signaling plane on its own (no SFU attached) and backs every test.

use super::types::{
    ConsumeOptions, MediaError, MediaKind, MediaResult, ProduceOptions, TransportOptions,
    TransportParameters,
};
use super::{MediaConsumer, MediaEngine, MediaProducer, MediaTransport, SessionResource};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Engine calls that can be made to fail once via [`LoopbackEngine::fail_next`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateSession,
    CreateTransport,
    ConnectTransport,
    Produce,
    Consume,
    PauseProducer,
    ResumeProducer,
    PauseConsumer,
    ResumeConsumer,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::CreateSession => "createSessionResource",
            Operation::CreateTransport => "createTransport",
            Operation::ConnectTransport => "connectTransport",
            Operation::Produce => "produce",
            Operation::Consume => "consume",
            Operation::PauseProducer => "pauseProducer",
            Operation::ResumeProducer => "resumeProducer",
            Operation::PauseConsumer => "pauseConsumer",
            Operation::ResumeConsumer => "resumeConsumer",
        }
    }
}

/// Counters of everything the loopback engine has been asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub sessions_created: usize,
    pub sessions_closed: usize,
    pub transports_created: usize,
    pub producers_created: usize,
    pub consumers_created: usize,
    pub pause_calls: usize,
    pub resume_calls: usize,
}

#[derive(Default)]
struct Shared {
    latency: Mutex<Duration>,
    failures: Mutex<HashSet<Operation>>,
    closes: Mutex<HashMap<String, usize>>,
    sessions_created: AtomicUsize,
    sessions_closed: AtomicUsize,
    transports_created: AtomicUsize,
    producers_created: AtomicUsize,
    consumers_created: AtomicUsize,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
}

impl Shared {
    /// Simulated round trip to the engine: always yields, optionally sleeps,
    /// then consumes a pending injected failure.
    async fn round_trip(&self, operation: Operation) -> MediaResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }

        let failed = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&operation);
        if failed {
            debug!("Loopback engine failing {} on request", operation.name());
            return Err(MediaError::rejected(operation.name(), "injected failure"));
        }
        Ok(())
    }

    fn record_close(&self, id: &str) {
        let mut closes = self.closes.lock().unwrap_or_else(|e| e.into_inner());
        *closes.entry(id.to_string()).or_insert(0) += 1;
    }
}

/// In-process [`MediaEngine`] with no media plane
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every engine call sleeps for `latency` before answering
    pub fn with_latency(latency: Duration) -> Self {
        let engine = Self::new();
        engine.set_latency(latency);
        engine
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Makes the next call of `operation` fail with `MediaError::Rejected`
    pub fn fail_next(&self, operation: Operation) {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation);
    }

    pub fn stats(&self) -> LoopbackStats {
        let s = &self.shared;
        LoopbackStats {
            sessions_created: s.sessions_created.load(Relaxed),
            sessions_closed: s.sessions_closed.load(Relaxed),
            transports_created: s.transports_created.load(Relaxed),
            producers_created: s.producers_created.load(Relaxed),
            consumers_created: s.consumers_created.load(Relaxed),
            pause_calls: s.pause_calls.load(Relaxed),
            resume_calls: s.resume_calls.load(Relaxed),
        }
    }

    /// How many times the object with this id has been closed
    pub fn close_count(&self, id: &str) -> usize {
        self.shared
            .closes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_session_resource(&self, session_id: &str) -> MediaResult<Arc<dyn SessionResource>> {
        self.shared.round_trip(Operation::CreateSession).await?;
        self.shared.sessions_created.fetch_add(1, Relaxed);
        let id = Uuid::new_v4().to_string();
        debug!("Loopback router {} created for session {}", id, session_id);
        Ok(Arc::new(LoopbackRouter { id, shared: self.shared.clone() }))
    }

    async fn close_session_resource(&self, resource: Arc<dyn SessionResource>) -> MediaResult<()> {
        self.shared.record_close(&resource.id());
        self.shared.sessions_closed.fetch_add(1, Relaxed);
        Ok(())
    }
}

struct LoopbackRouter {
    id: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl SessionResource for LoopbackRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> serde_json::Value {
        serde_json::json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
            ],
            "headerExtensions": []
        })
    }

    async fn create_transport(&self, options: TransportOptions) -> MediaResult<Arc<dyn MediaTransport>> {
        self.shared.round_trip(Operation::CreateTransport).await?;
        self.shared.transports_created.fetch_add(1, Relaxed);
        let id = Uuid::new_v4().to_string();
        debug!("Loopback {} transport {} for participant {}", options.direction, id, options.participant_id);
        Ok(Arc::new(LoopbackTransport {
            id,
            shared: self.shared.clone(),
            connected: AtomicBool::new(false),
        }))
    }
}

struct LoopbackTransport {
    id: String,
    shared: Arc<Shared>,
    connected: AtomicBool,
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn parameters(&self) -> TransportParameters {
        TransportParameters {
            id: self.id.clone(),
            ice_parameters: serde_json::json!({
                "usernameFragment": self.id.split('-').next().unwrap_or_default(),
                "password": "loopback",
                "iceLite": true
            }),
            ice_candidates: serde_json::json!([]),
            dtls_parameters: serde_json::json!({ "role": "auto", "fingerprints": [] }),
        }
    }

    async fn connect(&self, _dtls_parameters: serde_json::Value) -> MediaResult<()> {
        self.shared.round_trip(Operation::ConnectTransport).await?;
        if self.connected.swap(true, Relaxed) {
            return Err(MediaError::rejected("connectTransport", "transport already connected"));
        }
        Ok(())
    }

    async fn produce(&self, options: ProduceOptions) -> MediaResult<Arc<dyn MediaProducer>> {
        self.shared.round_trip(Operation::Produce).await?;
        self.shared.producers_created.fetch_add(1, Relaxed);
        Ok(Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind: options.kind,
            paused: AtomicBool::new(false),
            shared: self.shared.clone(),
        }))
    }

    async fn consume(&self, options: ConsumeOptions) -> MediaResult<Arc<dyn MediaConsumer>> {
        self.shared.round_trip(Operation::Consume).await?;
        self.shared.consumers_created.fetch_add(1, Relaxed);
        Ok(Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: options.producer_id,
            kind: options.kind,
            paused: AtomicBool::new(options.paused),
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> MediaResult<()> {
        self.shared.record_close(&self.id);
        Ok(())
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    paused: AtomicBool,
    shared: Arc<Shared>,
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> MediaResult<()> {
        self.shared.round_trip(Operation::PauseProducer).await?;
        self.shared.pause_calls.fetch_add(1, Relaxed);
        self.paused.store(true, Relaxed);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.shared.round_trip(Operation::ResumeProducer).await?;
        self.shared.resume_calls.fetch_add(1, Relaxed);
        self.paused.store(false, Relaxed);
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        self.shared.record_close(&self.id);
        Ok(())
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    shared: Arc<Shared>,
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> serde_json::Value {
        serde_json::json!({ "mid": "0", "codecs": [], "encodings": [] })
    }

    async fn pause(&self) -> MediaResult<()> {
        self.shared.round_trip(Operation::PauseConsumer).await?;
        self.paused.store(true, Relaxed);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.shared.round_trip(Operation::ResumeConsumer).await?;
        self.paused.store(false, Relaxed);
        Ok(())
    }

    async fn close(&self) -> MediaResult<()> {
        self.shared.record_close(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TransportDirection;

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let engine = LoopbackEngine::new();
        engine.fail_next(Operation::CreateSession);

        assert!(engine.create_session_resource("m1").await.is_err());
        assert!(engine.create_session_resource("m1").await.is_ok());
        assert_eq!(engine.stats().sessions_created, 1);
    }

    #[tokio::test]
    async fn transport_connects_only_once() {
        let engine = LoopbackEngine::new();
        let router = engine.create_session_resource("m1").await.unwrap();
        let transport = router
            .create_transport(TransportOptions {
                direction: TransportDirection::Send,
                participant_id: "p1".into(),
            })
            .await
            .unwrap();

        transport.connect(serde_json::json!({})).await.unwrap();
        assert!(transport.connect(serde_json::json!({})).await.is_err());
        assert_eq!(transport.parameters().id, transport.id());
    }

    #[tokio::test]
    async fn closes_are_counted_per_object() {
        let engine = LoopbackEngine::new();
        let router = engine.create_session_resource("m1").await.unwrap();
        let router_id = router.id();

        engine.close_session_resource(router).await.unwrap();

        assert_eq!(engine.close_count(&router_id), 1);
        assert_eq!(engine.close_count("unknown"), 0);
        assert_eq!(engine.stats().sessions_closed, 1);
    }
}
