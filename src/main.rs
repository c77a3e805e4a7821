#![forbid(unsafe_code)]

use anyhow::Result;
use huddle::config::ServerConfig;
use huddle::media::MediaEngine;
use huddle::metrics::ServerMetrics;
use huddle::session::SessionRegistry;
use huddle::signaling::{SignalingGateway, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "mediasoup")]
async fn media_engine(config: &ServerConfig) -> Result<Arc<dyn MediaEngine>> {
    use huddle::media::{MediaConfig, MediasoupEngine};

    info!("Using ANNOUNCE_IP={}", config.announce_ip);
    let media_config = MediaConfig::default().with_announced_ip(config.announce_ip);
    Ok(Arc::new(MediasoupEngine::new(media_config).await?))
}

#[cfg(not(feature = "mediasoup"))]
async fn media_engine(_config: &ServerConfig) -> Result<Arc<dyn MediaEngine>> {
    info!("Built without the mediasoup feature, using the loopback media engine");
    Ok(Arc::new(huddle::media::LoopbackEngine::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Huddle - Starting server");

    let config = ServerConfig::from_env();
    let engine = media_engine(&config).await?;

    let metrics = ServerMetrics::new();
    let registry = Arc::new(SessionRegistry::new(engine, config.media_request_timeout, metrics));

    if let Some(ref tc) = config.turn {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }
    info!("Sessions hold at most {} participants, control echo to sender: {}",
          config.limits.max_participants, config.control_echo_to_sender);

    let gateway = Arc::new(SignalingGateway::new(
        registry.clone(),
        config.limits,
        config.control_echo_to_sender,
        config.turn.clone(),
    ));
    let signaling_server = SignalingServer::new(gateway, config.max_connections, config.metrics_token.clone());

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    registry.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
