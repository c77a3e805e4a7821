#![forbid(unsafe_code)]

// mediasoup-backed media engine: a worker pool, one router per session,
// WebRTC transports, producers and consumers.

use super::config::MediaConfig;
use super::types::{
    ConsumeOptions, MediaError, MediaKind, MediaResult, ProduceOptions, TransportOptions,
    TransportParameters,
};
use super::{MediaConsumer, MediaEngine, MediaProducer, MediaTransport, SessionResource};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::worker_manager::WorkerManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

impl From<MediaKind> for mediasoup::rtp_parameters::MediaKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
            MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
        }
    }
}

impl From<mediasoup::rtp_parameters::MediaKind> for MediaKind {
    fn from(kind: mediasoup::rtp_parameters::MediaKind) -> Self {
        match kind {
            mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
            mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn from_value<T: serde::de::DeserializeOwned>(what: &str, value: serde_json::Value) -> MediaResult<T> {
    serde_json::from_value(value).map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}

/// Pool of mediasoup workers; routers are spread round-robin
pub struct MediasoupEngine {
    workers: Vec<Worker>,
    next_worker_idx: AtomicUsize,
    config: Arc<MediaConfig>,
    _worker_manager: WorkerManager,
}

impl MediasoupEngine {
    /// Spawns `config.num_workers` workers
    ///
    /// # Errors
    /// Returns an error if a worker process cannot be started
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        if config.num_workers == 0 {
            return Err(MediaError::Configuration("at least one worker is required".into()));
        }
        info!("Starting mediasoup with {} workers", config.num_workers);

        let worker_manager = WorkerManager::new();
        let mut workers = Vec::with_capacity(config.num_workers);
        for index in 0..config.num_workers {
            let worker = worker_manager
                .create_worker(config.worker_settings())
                .await
                .map_err(|e| MediaError::Configuration(format!("Failed to create worker: {e}")))?;

            let worker_id = worker.id();
            worker
                .on_dead(move |_reason| {
                    error!("Worker {} (index {}) died", worker_id, index);
                })
                .detach();
            info!("Created worker {} with id {}", index, worker_id);
            workers.push(worker);
        }

        Ok(Self {
            workers,
            next_worker_idx: AtomicUsize::new(0),
            config: Arc::new(config),
            _worker_manager: worker_manager,
        })
    }

    fn next_worker(&self) -> MediaResult<&Worker> {
        let idx = self.next_worker_idx.fetch_add(1, Ordering::Relaxed) % self.workers.len().max(1);
        self.workers
            .get(idx)
            .ok_or_else(|| MediaError::Configuration("no workers available".into()))
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_session_resource(&self, session_id: &str) -> MediaResult<Arc<dyn SessionResource>> {
        let worker = self.next_worker()?;
        let router = worker
            .create_router(self.config.router_options())
            .await
            .map_err(|e| MediaError::rejected("createRouter", e))?;

        info!("Created router {} for session {} on worker {}", router.id(), session_id, worker.id());
        Ok(Arc::new(MediasoupRouter { router, config: self.config.clone() }))
    }

    async fn close_session_resource(&self, resource: Arc<dyn SessionResource>) -> MediaResult<()> {
        // The router closes with its last handle.
        debug!("Releasing router {}", resource.id());
        drop(resource);
        Ok(())
    }
}

struct MediasoupRouter {
    router: Router,
    config: Arc<MediaConfig>,
}

#[async_trait]
impl SessionResource for MediasoupRouter {
    fn id(&self) -> String {
        self.router.id().to_string()
    }

    fn rtp_capabilities(&self) -> serde_json::Value {
        to_value(self.router.rtp_capabilities())
    }

    async fn create_transport(&self, options: TransportOptions) -> MediaResult<Arc<dyn MediaTransport>> {
        let transport = self
            .router
            .create_webrtc_transport(self.config.transport_options())
            .await
            .map_err(|e| MediaError::rejected("createTransport", e))?;

        let transport_id = transport.id();
        let participant_id = options.participant_id.clone();
        let direction = options.direction;
        transport
            .on_ice_state_change(move |ice_state| {
                debug!("ICE state {:?} on {} transport {} (participant {})",
                       ice_state, direction, transport_id, participant_id);
            })
            .detach();

        Ok(Arc::new(MediasoupTransport { inner: Mutex::new(Some(transport)) }))
    }
}

/// Handles own an `Option` so `close` can drop the mediasoup object (which closes it)
/// while other clones of our wrapper are still around.
struct MediasoupTransport {
    inner: Mutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed("transport".into()))
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.transport().map(|t| t.id().to_string()).unwrap_or_default()
    }

    fn parameters(&self) -> TransportParameters {
        match self.transport() {
            Ok(t) => TransportParameters {
                id: t.id().to_string(),
                ice_parameters: to_value(t.ice_parameters()),
                ice_candidates: to_value(t.ice_candidates()),
                dtls_parameters: to_value(&t.dtls_parameters()),
            },
            Err(_) => TransportParameters {
                id: String::new(),
                ice_parameters: serde_json::Value::Null,
                ice_candidates: serde_json::Value::Null,
                dtls_parameters: serde_json::Value::Null,
            },
        }
    }

    async fn connect(&self, dtls_parameters: serde_json::Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters = from_value("dtlsParameters", dtls_parameters)?;
        self.transport()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::rejected("connectTransport", e))
    }

    async fn produce(&self, options: ProduceOptions) -> MediaResult<Arc<dyn MediaProducer>> {
        let rtp_parameters: RtpParameters = from_value("rtpParameters", options.rtp_parameters)?;
        let mut producer_options = ProducerOptions::new(options.kind.into(), rtp_parameters);
        producer_options.app_data = AppData::new(options.app_data.into_value());

        let producer = self
            .transport()?
            .produce(producer_options)
            .await
            .map_err(|e| MediaError::rejected("produce", e))?;
        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind: producer.kind().into(),
            inner: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(&self, options: ConsumeOptions) -> MediaResult<Arc<dyn MediaConsumer>> {
        let producer_id: ProducerId = options
            .producer_id
            .parse()
            .map_err(|_| MediaError::InvalidParameters(format!("producer id {}", options.producer_id)))?;
        let rtp_capabilities: RtpCapabilities = from_value("rtpCapabilities", options.rtp_capabilities)?;
        let mut consumer_options = ConsumerOptions::new(producer_id, rtp_capabilities);
        consumer_options.paused = options.paused;

        let consumer = self
            .transport()?
            .consume(consumer_options)
            .await
            .map_err(|e| MediaError::rejected("consume", e))?;
        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind().into(),
            rtp_parameters: to_value(consumer.rtp_parameters()),
            inner: Mutex::new(Some(consumer)),
        }))
    }

    async fn close(&self) -> MediaResult<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    inner: Mutex<Option<Producer>>,
}

impl MediasoupProducer {
    fn producer(&self) -> MediaResult<Producer> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(self.id.clone()))
    }
}

#[async_trait]
impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn pause(&self) -> MediaResult<()> {
        self.producer()?.pause().await.map_err(|e| MediaError::rejected("pauseProducer", e))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.producer()?.resume().await.map_err(|e| MediaError::rejected("resumeProducer", e))
    }

    async fn close(&self) -> MediaResult<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: serde_json::Value,
    inner: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> MediaResult<Consumer> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| MediaError::Closed(self.id.clone()))
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> MediaResult<()> {
        self.consumer()?.pause().await.map_err(|e| MediaError::rejected("pauseConsumer", e))
    }

    async fn resume(&self) -> MediaResult<()> {
        self.consumer()?.resume().await.map_err(|e| MediaError::rejected("resumeConsumer", e))
    }

    async fn close(&self) -> MediaResult<()> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}
