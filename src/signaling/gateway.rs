#![forbid(unsafe_code)]

// Signaling gateway - resolves each connection to its participant and routes protocol
// requests into the participant manager and control state machine.

use super::directory::{Binding, ConnectionDirectory};
use super::outbox::{OutboundSender, Outbox};
use super::protocol::{ClientMessage, ClientRequest, MalformedRequest, ServerEnvelope, ServerMessage};
use crate::media::MediaKind;
use crate::metrics::ServerMetrics;
use crate::session::{
    ConnectionId, ControlAction, ControlStateMachine, ErrorCategory, JoinOutcome, NewParticipant,
    Notifier, ParticipantManager, ProduceRequest, SessionError, SessionLimits, SessionRegistry,
    SessionResult,
};
use crate::turn::{IceServer, TurnConfig};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub struct SignalingGateway {
    directory: ConnectionDirectory,
    outbox: Arc<Outbox>,
    participants: ParticipantManager,
    control: ControlStateMachine,
    turn: Option<TurnConfig>,
    metrics: ServerMetrics,
}

impl SignalingGateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        limits: SessionLimits,
        echo_to_sender: bool,
        turn: Option<TurnConfig>,
    ) -> Self {
        let metrics = registry.metrics().clone();
        let outbox = Arc::new(Outbox::new(metrics.clone()));
        let notifier: Arc<dyn Notifier> = outbox.clone();
        Self {
            directory: ConnectionDirectory::new(),
            participants: ParticipantManager::new(registry.clone(), notifier.clone(), limits),
            control: ControlStateMachine::new(registry, notifier, echo_to_sender),
            outbox,
            turn,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.participants.registry()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Registers the outbound queue of a freshly accepted connection
    pub fn connect(&self, connection: ConnectionId, sender: OutboundSender) {
        self.outbox.register(connection, sender);
    }

    /// Queues an unsolicited frame for one connection
    pub fn push(&self, connection: ConnectionId, message: ServerMessage) -> bool {
        self.outbox.send(connection, &ServerEnvelope::push(message))
    }

    fn reply(&self, connection: ConnectionId, id: Option<serde_json::Value>, message: ServerMessage) {
        self.outbox.send(connection, &ServerEnvelope::reply(id, message));
    }

    /// Handles one parsed request to completion. Setup failures are answered with an
    /// `error` frame; pause/resume always answer with a `controlResult`.
    pub async fn handle(&self, connection: ConnectionId, request: ClientRequest) {
        let start = Instant::now();
        let ClientRequest { id, message } = request;

        match message {
            ClientMessage::PauseProducer { session_id, producer_id, kind, request_id } => {
                let result = self
                    .control_result(connection, ControlAction::Pause, session_id, producer_id, kind, request_id)
                    .await;
                self.reply(connection, id, result);
            }
            ClientMessage::ResumeProducer { session_id, producer_id, kind, request_id } => {
                let result = self
                    .control_result(connection, ControlAction::Resume, session_id, producer_id, kind, request_id)
                    .await;
                self.reply(connection, id, result);
            }
            message => {
                if let Err(e) = self.dispatch(connection, id.clone(), message).await {
                    self.metrics.inc_errors();
                    match e.category() {
                        ErrorCategory::UpstreamFailure => error!("Error handling message from {}: {}", connection, e),
                        _ => debug!("Rejected request from {}: {}", connection, e),
                    }
                    self.reply(connection, id, ServerMessage::error(&e));
                }
            }
        }

        self.metrics.observe_request_handling(start.elapsed());
    }

    /// Answers a frame that did not parse. Control requests still get a `controlResult`.
    pub fn handle_malformed(&self, connection: ConnectionId, text: &str, cause: &serde_json::Error) {
        self.metrics.inc_errors();
        debug!("Invalid message format from {}: {}", connection, cause);

        let salvaged = MalformedRequest::salvage(text);
        let err = SessionError::InvalidRequest(cause.to_string());
        let message = if salvaged.is_control() {
            ServerMessage::ControlResult {
                request_id: salvaged.request_id,
                success: false,
                producer_id: salvaged.producer_id.unwrap_or_default(),
                paused: false,
                timestamp: Utc::now(),
                error: Some(err.to_string()),
                code: Some(err.code()),
            }
        } else {
            ServerMessage::error(&err)
        };
        self.reply(connection, salvaged.id, message);
    }

    /// Cleans up after a dropped connection. Never fails; converges with an explicit leave.
    pub async fn disconnect(&self, connection: ConnectionId) {
        if let Some(binding) = self.directory.resolve(connection) {
            info!("Connection {} dropped, removing participant {} from session {}",
                  connection, binding.participant_id, binding.session_id);
            self.leave(connection, &binding).await;
        }
        self.directory.unbind(connection);
        self.outbox.unregister(connection);
    }

    /// The `sessionState` payload for a session; empty participants when it does not exist
    pub async fn session_state(&self, session_id: &str) -> ServerMessage {
        ServerMessage::SessionState {
            session_id: session_id.to_string(),
            participants: self.control.session_control_state(session_id).await,
            timestamp: Utc::now(),
        }
    }

    pub fn bound_connections(&self) -> usize {
        self.directory.len()
    }

    /// The caller's binding, required to match the session the request names
    fn bound(&self, connection: ConnectionId, session_id: &str) -> SessionResult<Binding> {
        match self.directory.resolve(connection) {
            Some(binding) if binding.session_id == session_id => Ok(binding),
            _ => Err(SessionError::NotJoined),
        }
    }

    async fn dispatch(
        &self,
        connection: ConnectionId,
        id: Option<serde_json::Value>,
        message: ClientMessage,
    ) -> SessionResult<()> {
        message.validate()?;

        match message {
            ClientMessage::Join { session_id, user_id, display_name } => {
                if let Some(previous) = self.directory.resolve(connection) {
                    debug!("Connection {} switching from session {} to {}", connection, previous.session_id, session_id);
                    self.leave(connection, &previous).await;
                }

                let info = NewParticipant {
                    connection_id: connection,
                    user_id,
                    display_name: display_name.map(|name| name.trim().to_string()),
                };
                let outcome = self.join(&session_id, info).await?;
                let participant_id = outcome.participant.participant_id.clone();
                self.directory.bind(connection, Binding {
                    session_id: session_id.clone(),
                    participant_id: participant_id.clone(),
                });

                self.reply(connection, id, ServerMessage::Joined {
                    session_id: session_id.clone(),
                    participant_id,
                    existing_participants: outcome.existing,
                    producers: outcome.producers,
                    rtp_capabilities: outcome.rtp_capabilities,
                });
                self.push(connection, ServerMessage::SessionState {
                    session_id,
                    participants: outcome.control_state,
                    timestamp: Utc::now(),
                });
            }

            ClientMessage::Leave { session_id } => {
                let binding = self.bound(connection, &session_id)?;
                self.leave(connection, &binding).await;
                self.reply(connection, id, ServerMessage::Left { participant_id: binding.participant_id });
            }

            ClientMessage::GetRouterRtpCapabilities { session_id } => {
                self.bound(connection, &session_id)?;
                let rtp_capabilities = self.participants.rtp_capabilities(&session_id)?;
                self.reply(connection, id, ServerMessage::RouterRtpCapabilities { rtp_capabilities });
            }

            ClientMessage::CreateTransport { session_id, direction } => {
                let binding = self.bound(connection, &session_id)?;
                let transport = self
                    .participants
                    .create_transport(&session_id, &binding.participant_id, direction)
                    .await?;
                self.reply(connection, id, ServerMessage::TransportCreated {
                    transport_id: transport.id,
                    direction,
                    ice_parameters: transport.ice_parameters,
                    ice_candidates: transport.ice_candidates,
                    dtls_parameters: transport.dtls_parameters,
                    ice_servers: self.ice_servers(&binding.participant_id),
                });
            }

            ClientMessage::ConnectTransport { session_id, transport_id, dtls_parameters } => {
                let binding = self.bound(connection, &session_id)?;
                self.participants
                    .connect_transport(&session_id, &binding.participant_id, &transport_id, dtls_parameters)
                    .await?;
                self.reply(connection, id, ServerMessage::TransportConnected { transport_id });
            }

            ClientMessage::Produce { session_id, transport_id, kind, rtp_parameters, app_data } => {
                let binding = self.bound(connection, &session_id)?;
                let producer = self
                    .participants
                    .create_producer(&session_id, &binding.participant_id, ProduceRequest {
                        transport_id,
                        kind,
                        rtp_parameters,
                        app_data,
                    })
                    .await?;
                self.reply(connection, id, ServerMessage::ProducerCreated {
                    producer_id: producer.producer_id,
                    kind: producer.kind,
                });
            }

            ClientMessage::Consume { session_id, producer_id, rtp_capabilities } => {
                let binding = self.bound(connection, &session_id)?;
                let consumer = self
                    .participants
                    .create_consumer(&session_id, &binding.participant_id, &producer_id, rtp_capabilities)
                    .await?;
                self.reply(connection, id, ServerMessage::ConsumerCreated(consumer));
            }

            ClientMessage::ResumeConsumer { session_id, consumer_id } => {
                let binding = self.bound(connection, &session_id)?;
                self.participants
                    .resume_consumer(&session_id, &binding.participant_id, &consumer_id)
                    .await?;
                self.reply(connection, id, ServerMessage::ConsumerResumed { consumer_id });
            }

            ClientMessage::PauseConsumer { session_id, consumer_id } => {
                let binding = self.bound(connection, &session_id)?;
                self.participants
                    .pause_consumer(&session_id, &binding.participant_id, &consumer_id)
                    .await?;
                self.reply(connection, id, ServerMessage::ConsumerPaused { consumer_id });
            }

            ClientMessage::CloseProducer { session_id, producer_id } => {
                let binding = self.bound(connection, &session_id)?;
                let closed = self
                    .participants
                    .close_producer(&session_id, &binding.participant_id, &producer_id)
                    .await?;
                self.reply(connection, id, ServerMessage::ProducerClosed { producer_id: closed.producer_id });
            }

            ClientMessage::GetProducers { session_id } => {
                self.bound(connection, &session_id)?;
                let producers = self.participants.list_producers(&session_id).await;
                self.reply(connection, id, ServerMessage::Producers { session_id, producers });
            }

            // Any joined connection may poll any session
            ClientMessage::GetSessionControlState { session_id } => {
                if self.directory.resolve(connection).is_none() {
                    return Err(SessionError::NotJoined);
                }
                let state = self.session_state(&session_id).await;
                self.reply(connection, id, state);
            }

            ClientMessage::PauseProducer { .. } | ClientMessage::ResumeProducer { .. } => {
                // Answered with controlResult by handle()
            }
        }

        Ok(())
    }

    /// Creates the session on first use. A session can close between lookup and insert
    /// when its last participant leaves concurrently, so that case is retried once.
    async fn join(&self, session_id: &str, info: NewParticipant) -> SessionResult<JoinOutcome> {
        let mut retried = false;
        loop {
            self.registry().get_or_create(session_id).await?;
            match self.participants.add_participant(session_id, info.clone()).await {
                Err(SessionError::SessionNotFound(_)) if !retried => {
                    debug!("Session {} closed during join, retrying", session_id);
                    retried = true;
                }
                result => return result,
            }
        }
    }

    async fn leave(&self, connection: ConnectionId, binding: &Binding) {
        if let Some(departure) = self
            .participants
            .remove_participant(&binding.session_id, &binding.participant_id)
            .await
        {
            debug!("Participant {} removed ({} producers closed, session closed: {})",
                   departure.participant_id, departure.closed_producers.len(), departure.session_closed);
        }
        self.directory.unbind_participant(connection, &binding.participant_id);
    }

    async fn control_result(
        &self,
        connection: ConnectionId,
        action: ControlAction,
        session_id: String,
        producer_id: String,
        kind: Option<MediaKind>,
        request_id: Option<String>,
    ) -> ServerMessage {
        let binding = self.bound(connection, &session_id);
        let result = match &binding {
            Ok(binding) => {
                self.control
                    .apply(action, &session_id, &binding.participant_id, &producer_id, kind)
                    .await
            }
            Err(e) => Err(e.clone()),
        };

        match result {
            Ok(transition) => ServerMessage::ControlResult {
                request_id,
                success: true,
                producer_id,
                paused: transition.paused,
                timestamp: transition.timestamp,
                error: None,
                code: None,
            },
            Err(e) => {
                // Report the state the producer is actually in
                let paused = match binding {
                    Ok(_) => self.control.producer_paused(&session_id, &producer_id).await.unwrap_or(false),
                    Err(_) => false,
                };
                ServerMessage::ControlResult {
                    request_id,
                    success: false,
                    producer_id,
                    paused,
                    timestamp: Utc::now(),
                    error: Some(e.to_string()),
                    code: Some(e.code()),
                }
            }
        }
    }

    fn ice_servers(&self, participant_id: &str) -> Vec<IceServer> {
        self.turn
            .as_ref()
            .and_then(|turn| turn.credentials_for(participant_id))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::loopback::Operation;
    use crate::media::LoopbackEngine;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Inbox = mpsc::Receiver<Arc<String>>;

    struct Harness {
        engine: LoopbackEngine,
        gateway: SignalingGateway,
    }

    fn harness_with(turn: Option<TurnConfig>) -> Harness {
        let engine = LoopbackEngine::new();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(engine.clone()),
            Duration::from_secs(5),
            ServerMetrics::new(),
        ));
        let gateway = SignalingGateway::new(registry, SessionLimits::default(), true, turn);
        Harness { engine, gateway }
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    impl Harness {
        fn client(&self) -> (ConnectionId, Inbox) {
            let connection = ConnectionId::new();
            let (tx, rx) = mpsc::channel(64);
            self.gateway.connect(connection, tx);
            (connection, rx)
        }

        async fn send(&self, connection: ConnectionId, frame: Value) {
            let request: ClientRequest = serde_json::from_value(frame).unwrap();
            self.gateway.handle(connection, request).await;
        }

        /// Joins and returns the participant id, discarding the join frames
        async fn join(&self, connection: ConnectionId, inbox: &mut Inbox, session_id: &str) -> String {
            self.send(connection, json!({ "type": "join", "sessionId": session_id })).await;
            let frames = drain(inbox);
            assert_eq!(frames[0]["type"], "joined", "{frames:?}");
            frames[0]["participantId"].as_str().unwrap().to_string()
        }

        async fn produce(&self, connection: ConnectionId, inbox: &mut Inbox, session_id: &str, kind: &str) -> String {
            self.send(connection, json!({ "type": "createTransport", "sessionId": session_id, "direction": "send" })).await;
            let frames = drain(inbox);
            let created = frames.iter().find(|f| f["type"] == "transportCreated").unwrap();
            let transport_id = created["transportId"].as_str().unwrap().to_string();
            self.send(connection, json!({
                "type": "produce", "sessionId": session_id, "transportId": transport_id,
                "kind": kind, "rtpParameters": {}
            }))
            .await;
            let frames = drain(inbox);
            let created = frames.iter().find(|f| f["type"] == "producerCreated").unwrap();
            created["producerId"].as_str().unwrap().to_string()
        }
    }

    fn drain(inbox: &mut Inbox) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(json) = inbox.try_recv() {
            frames.push(serde_json::from_str(&json).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn two_party_mute_scenario() {
        let h = harness();
        let (a, mut inbox_a) = h.client();
        let (b, mut inbox_b) = h.client();

        h.send(a, json!({ "id": 1, "type": "join", "sessionId": "m1", "displayName": "Ada" })).await;
        let frames = drain(&mut inbox_a);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "joined");
        assert_eq!(frames[0]["id"], 1);
        assert_eq!(frames[0]["existingParticipants"], json!([]));
        assert_eq!(frames[1]["type"], "sessionState");
        let p1 = frames[0]["participantId"].as_str().unwrap().to_string();

        h.send(b, json!({ "id": 2, "type": "join", "sessionId": "m1" })).await;
        let frames = drain(&mut inbox_b);
        assert_eq!(frames[0]["existingParticipants"][0]["participantId"], p1.as_str());
        assert_eq!(frames[0]["existingParticipants"][0]["displayName"], "Ada");
        let joined = drain(&mut inbox_a);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0]["type"], "participantJoined");

        let audio = h.produce(a, &mut inbox_a, "m1", "audio").await;
        assert_eq!(drain(&mut inbox_b)[0]["type"], "newStreamAvailable");

        h.send(a, json!({
            "id": 3, "type": "pauseProducer", "sessionId": "m1", "producerId": audio,
            "kind": "audio", "requestId": "r1"
        }))
        .await;
        let frames = drain(&mut inbox_a);
        let result = frames.iter().find(|f| f["type"] == "controlResult").unwrap();
        assert_eq!(result["id"], 3);
        assert_eq!(result["requestId"], "r1");
        assert_eq!(result["success"], true);
        assert_eq!(result["paused"], true);

        let broadcasts = drain(&mut inbox_b);
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0]["type"], "participantMuted");
        assert_eq!(broadcasts[0]["participantId"], p1.as_str());
        assert_eq!(broadcasts[0]["kind"], "audio");
        assert_eq!(broadcasts[0]["paused"], true);

        h.send(b, json!({ "type": "getSessionControlState", "sessionId": "m1" })).await;
        let state = drain(&mut inbox_b).remove(0);
        assert_eq!(state["type"], "sessionState");
        assert_eq!(state["participants"][0]["participantId"], p1.as_str());
        assert_eq!(state["participants"][0]["audioMuted"], true);
        assert_eq!(state["participants"][1]["audioMuted"], false);
    }

    #[tokio::test]
    async fn requests_outside_the_bound_session_are_not_joined() {
        let h = harness();
        let (a, mut inbox) = h.client();

        h.send(a, json!({ "id": "x", "type": "createTransport", "sessionId": "m1", "direction": "send" })).await;
        let frames = drain(&mut inbox);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["id"], "x");
        assert_eq!(frames[0]["code"], "not_joined");

        h.join(a, &mut inbox, "m1").await;
        h.send(a, json!({ "type": "getProducers", "sessionId": "other" })).await;
        assert_eq!(drain(&mut inbox)[0]["code"], "not_joined");

        h.send(a, json!({ "type": "resumeProducer", "sessionId": "other", "producerId": "p", "requestId": "r2" })).await;
        let result = drain(&mut inbox).remove(0);
        assert_eq!(result["type"], "controlResult");
        assert_eq!(result["success"], false);
        assert_eq!(result["code"], "not_joined");
    }

    #[tokio::test]
    async fn repeated_pause_reports_failure_without_broadcasting() {
        let h = harness();
        let (a, mut inbox_a) = h.client();
        let (b, mut inbox_b) = h.client();
        h.join(a, &mut inbox_a, "m1").await;
        h.join(b, &mut inbox_b, "m1").await;
        drain(&mut inbox_a);
        let video = h.produce(a, &mut inbox_a, "m1", "video").await;
        drain(&mut inbox_b);

        let pause = json!({ "type": "pauseProducer", "sessionId": "m1", "producerId": video });
        h.send(a, pause.clone()).await;
        h.send(a, pause).await;

        let results: Vec<Value> = drain(&mut inbox_a)
            .into_iter()
            .filter(|f| f["type"] == "controlResult")
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["success"], false);
        assert_eq!(results[1]["code"], "already_paused");
        assert_eq!(results[1]["paused"], true);

        let broadcasts = drain(&mut inbox_b);
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0]["type"], "participantCameraDisabled");
        assert_eq!(h.engine.stats().pause_calls, 1);
    }

    #[tokio::test]
    async fn engine_failures_surface_as_errors() {
        let h = harness();
        let (a, mut inbox) = h.client();
        h.join(a, &mut inbox, "m1").await;

        h.engine.fail_next(Operation::CreateTransport);
        h.send(a, json!({ "type": "createTransport", "sessionId": "m1", "direction": "recv" })).await;
        let frames = drain(&mut inbox);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["category"], "upstreamFailure");
    }

    #[tokio::test]
    async fn leave_then_disconnect_tears_down_once() {
        let h = harness();
        let (a, mut inbox_a) = h.client();
        let (b, mut inbox_b) = h.client();
        let p1 = h.join(a, &mut inbox_a, "m1").await;
        h.join(b, &mut inbox_b, "m1").await;
        h.produce(a, &mut inbox_a, "m1", "audio").await;
        drain(&mut inbox_b);

        h.send(a, json!({ "id": 9, "type": "leave", "sessionId": "m1" })).await;
        let frames = drain(&mut inbox_a);
        assert_eq!(frames[0]["type"], "left");
        assert_eq!(frames[0]["participantId"], p1.as_str());

        h.gateway.disconnect(a).await;

        let seen: Vec<Value> = drain(&mut inbox_b);
        let kinds: Vec<&str> = seen.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(kinds, vec!["streamClosed", "participantLeft"]);
        assert_eq!(h.gateway.registry().participant_count(), 1);
        assert_eq!(h.gateway.bound_connections(), 1);
    }

    #[tokio::test]
    async fn last_disconnect_closes_the_session() {
        let h = harness();
        let (a, mut inbox) = h.client();
        h.join(a, &mut inbox, "m1").await;

        h.gateway.disconnect(a).await;

        assert!(h.gateway.registry().get("m1").is_none());
        assert_eq!(h.engine.stats().sessions_closed, 1);
        assert_eq!(h.gateway.bound_connections(), 0);
    }

    #[tokio::test]
    async fn rejoining_leaves_the_previous_session() {
        let h = harness();
        let (a, mut inbox) = h.client();
        h.join(a, &mut inbox, "m1").await;
        h.join(a, &mut inbox, "m2").await;

        assert!(h.gateway.registry().get("m1").is_none());
        assert!(h.gateway.registry().get("m2").is_some());

        h.send(a, json!({ "type": "getProducers", "sessionId": "m2" })).await;
        assert_eq!(drain(&mut inbox)[0]["type"], "producers");
    }

    #[tokio::test]
    async fn joining_after_the_session_emptied_starts_a_fresh_one() {
        let h = harness();
        let (a, mut inbox_a) = h.client();
        let (b, mut inbox_b) = h.client();
        h.join(a, &mut inbox_a, "m1").await;
        h.gateway.disconnect(a).await;

        h.send(b, json!({ "type": "join", "sessionId": "m1" })).await;
        let frames = drain(&mut inbox_b);
        assert_eq!(frames[0]["type"], "joined");
        assert_eq!(frames[0]["existingParticipants"], json!([]));
        assert_eq!(h.engine.stats().sessions_created, 2);
    }

    #[tokio::test]
    async fn malformed_frames_are_answered() {
        let h = harness();
        let (a, mut inbox) = h.client();

        let text = r#"{"id":4,"type":"pauseProducer","producerId":"p9","requestId":"r4"}"#;
        let cause = serde_json::from_str::<ClientRequest>(text).unwrap_err();
        h.gateway.handle_malformed(a, text, &cause);
        let result = drain(&mut inbox).remove(0);
        assert_eq!(result["type"], "controlResult");
        assert_eq!(result["id"], 4);
        assert_eq!(result["success"], false);
        assert_eq!(result["producerId"], "p9");
        assert_eq!(result["code"], "invalid_request");

        let cause = serde_json::from_str::<ClientRequest>("{oops").unwrap_err();
        h.gateway.handle_malformed(a, "{oops", &cause);
        let error = drain(&mut inbox).remove(0);
        assert_eq!(error["type"], "error");
        assert_eq!(error["code"], "invalid_request");
    }

    #[tokio::test]
    async fn mistyped_control_fields_still_get_a_control_result() {
        let h = harness();
        let (a, mut inbox) = h.client();

        for (id, text) in [
            (1, r#"{"id":1,"type":"pauseProducer","sessionId":"m1","producerId":"p1","requestId":5}"#),
            (2, r#"{"id":2,"type":"resumeProducer","sessionId":"m1","producerId":42}"#),
        ] {
            let cause = serde_json::from_str::<ClientRequest>(text).unwrap_err();
            h.gateway.handle_malformed(a, text, &cause);
            let result = drain(&mut inbox).remove(0);
            assert_eq!(result["type"], "controlResult", "{result}");
            assert_eq!(result["id"], id);
            assert_eq!(result["success"], false);
            assert_eq!(result["paused"], false);
            assert_eq!(result["code"], "invalid_request");
        }
    }

    #[tokio::test]
    async fn dropped_connection_is_announced_to_the_remaining_peer() {
        let h = harness();
        let (a, mut inbox_a) = h.client();
        let (b, mut inbox_b) = h.client();
        let p1 = h.join(a, &mut inbox_a, "m1").await;
        h.join(b, &mut inbox_b, "m1").await;
        let audio = h.produce(a, &mut inbox_a, "m1", "audio").await;
        drain(&mut inbox_b);

        h.gateway.disconnect(a).await;

        let seen = drain(&mut inbox_b);
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert_eq!(seen[0]["type"], "streamClosed");
        assert_eq!(seen[0]["producerId"], audio.as_str());
        assert_eq!(seen[1]["type"], "participantLeft");
        assert_eq!(seen[1]["participantId"], p1.as_str());
        assert_eq!(h.gateway.bound_connections(), 1);
        assert_eq!(h.gateway.registry().participant_count(), 1);
        assert_eq!(h.engine.close_count(&audio), 1);

        // The dropped connection no longer resolves to a participant
        h.send(a, json!({ "type": "getProducers", "sessionId": "m1" })).await;
        assert!(drain(&mut inbox_a).is_empty());
    }

    #[tokio::test]
    async fn unknown_sessions_report_an_empty_control_state() {
        let h = harness();
        let value = serde_json::to_value(h.gateway.session_state("nobody-here").await).unwrap();
        assert_eq!(value["type"], "sessionState");
        assert_eq!(value["sessionId"], "nobody-here");
        assert_eq!(value["participants"], json!([]));
        assert!(value["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn invalid_display_names_are_rejected_before_joining() {
        let h = harness();
        let (a, mut inbox) = h.client();

        h.send(a, json!({ "type": "join", "sessionId": "m1", "displayName": "" })).await;

        assert_eq!(drain(&mut inbox)[0]["code"], "invalid_request");
        assert_eq!(h.engine.stats().sessions_created, 0);
    }

    #[tokio::test]
    async fn transports_carry_turn_credentials_when_configured() {
        let h = harness_with(Some(TurnConfig {
            urls: vec!["turn:turn.example.com:3478".into()],
            secret: "s3cret".into(),
            ttl_secs: 600,
        }));
        let (a, mut inbox) = h.client();
        let p1 = h.join(a, &mut inbox, "m1").await;

        h.send(a, json!({ "type": "createTransport", "sessionId": "m1", "direction": "recv" })).await;
        let created = drain(&mut inbox).remove(0);
        assert_eq!(created["direction"], "recv");
        let username = created["iceServers"][0]["username"].as_str().unwrap();
        assert!(username.ends_with(&format!(":{p1}")));
    }
}
