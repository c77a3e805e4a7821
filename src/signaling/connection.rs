#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::gateway::SignalingGateway;
use super::protocol::{ClientRequest, ServerMessage};
use crate::session::{ConnectionId, ErrorCategory};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
pub const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Token bucket over inbound frames
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

enum Admission {
    Allowed,
    /// First rejected frame of a burst; the client is told once
    Limited,
    Dropped,
}

impl RateLimiter {
    fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    fn admit(&mut self, now: Instant) -> Admission {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            Admission::Allowed
        } else if !self.warned {
            self.warned = true;
            Admission::Limited
        } else {
            Admission::Dropped
        }
    }
}

/// Handles a single WebSocket connection until it closes, then runs disconnect cleanup
pub async fn handle_connection(
    socket: WebSocket,
    gateway: Arc<SignalingGateway>,
    _permit: OwnedSemaphorePermit,
) {
    let connection = ConnectionId::new();
    info!("New WebSocket connection: {}", connection);

    let metrics = gateway.metrics().clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    gateway.connect(connection, tx.clone());

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection);
    });

    let mut limiter = RateLimiter::new(Instant::now());

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match limiter.admit(Instant::now()) {
                    Admission::Allowed => {}
                    Admission::Limited => {
                        warn!("Rate limit exceeded for connection {}", connection);
                        gateway.push(connection, ServerMessage::Error {
                            code: "rate_limited",
                            category: ErrorCategory::Capacity,
                            message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        });
                        continue;
                    }
                    Admission::Dropped => continue,
                }

                match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => gateway.handle(connection, request).await,
                    Err(e) => gateway.handle_malformed(connection, &text, &e),
                }

                // Send task has exited, nobody is listening
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection);
            }
        }
    }

    gateway.disconnect(connection).await;

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for connection: {}", connection);
}
