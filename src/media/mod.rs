#![forbid(unsafe_code)]

// Media module - the seam between session orchestration and the SFU media engine.
// Routers, transports, producers and consumers live behind these traits; everything
// above them only ever holds opaque handles.

#[cfg(feature = "mediasoup")]
pub mod config;
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

#[cfg(feature = "mediasoup")]
pub use config::MediaConfig;
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::MediasoupEngine;
pub use loopback::LoopbackEngine;
pub use types::{
    AppData, ConsumeOptions, MediaError, MediaKind, MediaResult, ProduceOptions,
    TransportDirection, TransportOptions, TransportParameters,
};

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Entry point into the SFU: one session resource (router) per call
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Creates the media-plane resource backing one session
    async fn create_session_resource(&self, session_id: &str) -> MediaResult<Arc<dyn SessionResource>>;

    /// Releases a session resource and everything still attached to it
    async fn close_session_resource(&self, resource: Arc<dyn SessionResource>) -> MediaResult<()>;
}

/// Media-plane resource for one session (a router)
#[async_trait]
pub trait SessionResource: Send + Sync {
    fn id(&self) -> String;

    /// Codec capabilities clients need before producing or consuming
    fn rtp_capabilities(&self) -> serde_json::Value;

    async fn create_transport(&self, options: TransportOptions) -> MediaResult<Arc<dyn MediaTransport>>;
}

/// One direction of a participant's media connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: serde_json::Value) -> MediaResult<()>;

    async fn produce(&self, options: ProduceOptions) -> MediaResult<Arc<dyn MediaProducer>>;

    async fn consume(&self, options: ConsumeOptions) -> MediaResult<Arc<dyn MediaConsumer>>;

    async fn close(&self) -> MediaResult<()>;
}

/// Outbound stream handle
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    async fn close(&self) -> MediaResult<()>;
}

/// Inbound subscription handle
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> serde_json::Value;

    async fn pause(&self) -> MediaResult<()>;

    async fn resume(&self) -> MediaResult<()>;

    async fn close(&self) -> MediaResult<()>;
}

/// Bounds a media engine call. Expiry is reported as `MediaError::Timeout`; nothing is retried.
pub async fn bounded<T, F>(operation: &'static str, timeout: Duration, call: F) -> MediaResult<T>
where
    F: Future<Output = MediaResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout {
            operation,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
