#![forbid(unsafe_code)]

// Per-connection outbound queues. Messages are serialized once and fanned out with
// try_send; a full queue drops the message rather than stalling the sender.

use super::protocol::{ServerEnvelope, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::session::{ConnectionId, Notifier, SessionEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type OutboundSender = mpsc::Sender<Arc<String>>;

pub struct Outbox {
    senders: StdRwLock<HashMap<ConnectionId, OutboundSender>>,
    metrics: ServerMetrics,
}

impl Outbox {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self {
            senders: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn register(&self, connection: ConnectionId, sender: OutboundSender) {
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        senders.insert(connection, sender);
    }

    pub fn unregister(&self, connection: ConnectionId) {
        let mut senders = self.senders.write().unwrap_or_else(|e| e.into_inner());
        senders.remove(&connection);
    }

    /// Queues one frame for a single connection
    pub fn send(&self, connection: ConnectionId, envelope: &ServerEnvelope) -> bool {
        match serde_json::to_string(envelope) {
            Ok(json) => self.deliver(&[connection], Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", connection, e);
                false
            }
        }
    }

    /// Queues a pre-serialized frame for each recipient. Returns whether every queue accepted it.
    fn deliver(&self, recipients: &[ConnectionId], json: Arc<String>) -> bool {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        let mut all = true;
        for connection in recipients {
            let Some(sender) = senders.get(connection) else {
                debug!("No outbound queue for connection {}", connection);
                all = false;
                continue;
            };
            match sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for connection {}, dropping message", connection);
                    all = false;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for connection {} (disconnected)", connection);
                    all = false;
                }
            }
        }
        all
    }

    pub fn len(&self) -> usize {
        self.senders.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for Outbox {
    fn notify(&self, recipients: &[ConnectionId], event: &SessionEvent) {
        if recipients.is_empty() {
            return;
        }
        let envelope = ServerEnvelope::push(ServerMessage::from(event));
        match serde_json::to_string(&envelope) {
            Ok(json) => {
                self.deliver(recipients, Arc::new(json));
            }
            Err(e) => {
                self.metrics.inc_errors();
                warn!("Failed to serialize broadcast: {}", e);
            }
        }
    }
}
