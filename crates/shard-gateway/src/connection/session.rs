//! Shard session state machine
//!
//! Pure protocol logic for one shard: consumes inbound frames and timer/permission
//! signals, and answers with the actions the runner must perform. Session continuity
//! data (sequence, session id) lives here and survives reconnects.

use serde_json::Value;
use shard_core::{ShardInfo, ShardState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::events::ShardEvent;
use crate::protocol::{
    CloseCode, GatewayMessage, IdentifyPayload, IdentifyProperties, OpCode,
    PresenceUpdatePayload, ResumePayload,
};

/// Static parameters of a shard's session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bot token, passed through verbatim
    pub token: String,
    pub intents: u64,
    pub large_threshold: u32,
    pub compress: bool,
    pub presence: Option<PresenceUpdatePayload>,
    pub properties: IdentifyProperties,
}

impl SessionConfig {
    pub fn new(token: impl Into<String>, intents: u64) -> Self {
        Self {
            token: token.into(),
            intents,
            large_threshold: 50,
            compress: false,
            presence: None,
            properties: IdentifyProperties::default(),
        }
    }
}

/// Side effect requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ShardAction {
    /// Queue an application frame behind pending frames, subject to the send budget
    Send(GatewayMessage),
    /// Queue an identify or resume frame on the control queue
    ///
    /// The control queue is never locked by the send budget.
    SendControl(GatewayMessage),
    /// Front-insert a heartbeat on the control queue; the runner reports when it is written
    SendHeartbeat(GatewayMessage),
    /// (Re)arm the periodic heartbeat timer
    StartHeartbeat(Duration),
    /// Ask the handshake gate for permission to identify
    RequestIdentify,
    /// Drop queued outbound frames
    FlushQueue,
    /// Close the socket with this code
    Close(CloseCode),
    /// Publish an event
    Emit(ShardEvent),
}

/// What happens after the socket closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect and resume the cached session
    Resume,
    /// Reconnect with a fresh Identify
    Reidentify,
    /// Do not reconnect
    Stop,
}

/// Protocol state of one shard
#[derive(Debug)]
pub struct ShardSession {
    shard: ShardInfo,
    config: Arc<SessionConfig>,
    state: ShardState,
    /// Last accepted sequence; 0 when none
    sequence: u64,
    session_id: Option<String>,
    resume_url: Option<String>,
    heartbeat_interval: Option<Duration>,
    heartbeat_acked: bool,
    /// A heartbeat is queued but not yet on the wire
    heartbeat_unsent: bool,
    last_heartbeat_sent: Option<Instant>,
    last_ack: Option<Instant>,
    latency: Option<Duration>,
    awaiting_identify: bool,
}

impl ShardSession {
    pub fn new(shard: ShardInfo, config: Arc<SessionConfig>) -> Self {
        Self {
            shard,
            config,
            state: ShardState::Disconnected,
            sequence: 0,
            session_id: None,
            resume_url: None,
            heartbeat_interval: None,
            heartbeat_acked: true,
            heartbeat_unsent: false,
            last_heartbeat_sent: None,
            last_ack: None,
            latency: None,
            awaiting_identify: false,
        }
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// URL announced in READY for resuming this session
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn heartbeat_acked(&self) -> bool {
        self.heartbeat_acked
    }

    /// Round-trip time of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_ack(&self) -> Option<Instant> {
        self.last_ack
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    /// A new socket is being opened
    pub fn begin_connect(&mut self) -> Vec<ShardAction> {
        let mut actions = Vec::new();
        self.heartbeat_interval = None;
        self.heartbeat_acked = true;
        self.heartbeat_unsent = false;
        self.awaiting_identify = false;
        self.set_state(ShardState::Connecting, &mut actions);
        actions
    }

    /// Process one inbound frame
    pub fn handle_message(&mut self, message: GatewayMessage) -> Vec<ShardAction> {
        let mut actions = Vec::new();

        if let Some(seq) = message.s {
            if !self.accept_sequence(seq, &mut actions) {
                return actions;
            }
        }

        match message.op {
            OpCode::Hello => self.on_hello(&message, &mut actions),
            OpCode::Heartbeat => {
                actions.push(ShardAction::SendHeartbeat(self.heartbeat_message()));
            }
            OpCode::HeartbeatAck => self.on_heartbeat_ack(&mut actions),
            OpCode::Reconnect => {
                tracing::info!(shard_id = self.shard.id(), "Gateway requested reconnect");
                actions.push(ShardAction::Close(CloseCode::ReconnectRequested));
            }
            OpCode::InvalidSession => {
                let resumable = message.as_invalid_session().unwrap_or(false);
                self.on_invalid_session(resumable, &mut actions);
            }
            OpCode::Dispatch => self.on_dispatch(message, &mut actions),
            op => {
                tracing::warn!(shard_id = self.shard.id(), op = %op, "Unexpected op from gateway");
            }
        }

        actions
    }

    /// The heartbeat timer fired
    pub fn on_heartbeat_tick(&mut self) -> Vec<ShardAction> {
        if self.heartbeat_unsent {
            // Not on the wire yet, so its ack cannot be late
            tracing::debug!(shard_id = self.shard.id(), "Previous heartbeat still queued");
            return Vec::new();
        }
        if !self.heartbeat_acked {
            tracing::warn!(
                shard_id = self.shard.id(),
                "Heartbeat not acknowledged, closing zombied connection"
            );
            return vec![ShardAction::Close(CloseCode::HeartbeatTimeout)];
        }
        vec![ShardAction::SendHeartbeat(self.send_heartbeat())]
    }

    /// A heartbeat frame reached the socket at `at`
    pub fn on_heartbeat_written(&mut self, at: Instant) {
        if !self.heartbeat_unsent {
            return;
        }
        self.heartbeat_unsent = false;
        if !self.heartbeat_acked {
            self.last_heartbeat_sent = Some(at);
        }
    }

    /// The handshake gate granted permission to identify
    pub fn on_identify_permitted(&mut self) -> Vec<ShardAction> {
        let mut actions = Vec::new();
        if !self.awaiting_identify {
            tracing::debug!(shard_id = self.shard.id(), "Ignoring stale identify permission");
            return actions;
        }
        self.awaiting_identify = false;

        let identify = IdentifyPayload {
            token: self.config.token.clone(),
            properties: self.config.properties.clone(),
            shard: self.shard,
            intents: self.config.intents,
            large_threshold: self.config.large_threshold,
            compress: self.config.compress,
            presence: self.config.presence.clone(),
        };
        tracing::debug!(shard_id = self.shard.id(), "Identifying");
        actions.push(ShardAction::SendControl(GatewayMessage::identify(&identify)));
        self.set_state(ShardState::Identifying, &mut actions);
        actions
    }

    /// The socket closed; `code` is `None` when the stream ended without a close frame
    pub fn on_close(&mut self, code: Option<u16>) -> (CloseDisposition, Vec<ShardAction>) {
        let mut actions = Vec::new();
        self.heartbeat_interval = None;
        self.awaiting_identify = false;
        self.set_state(ShardState::Disconnected, &mut actions);

        let known = code.and_then(|c| CloseCode::try_from(c).ok());
        let disposition = match known {
            Some(code) if code.is_fatal() => {
                tracing::error!(shard_id = self.shard.id(), code = %code, "Fatal close code");
                self.reset_session();
                CloseDisposition::Stop
            }
            Some(code) if !code.preserves_session() => {
                self.reset_session();
                CloseDisposition::Reidentify
            }
            _ if self.can_resume() => CloseDisposition::Resume,
            _ => CloseDisposition::Reidentify,
        };

        (disposition, actions)
    }

    fn on_hello(&mut self, message: &GatewayMessage, actions: &mut Vec<ShardAction>) {
        let Some(hello) = message.as_hello() else {
            tracing::warn!(shard_id = self.shard.id(), "Malformed Hello");
            return;
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.heartbeat_interval = Some(interval);
        self.heartbeat_acked = true;
        self.heartbeat_unsent = false;
        actions.push(ShardAction::StartHeartbeat(interval));
        actions.push(ShardAction::SendHeartbeat(self.send_heartbeat()));

        if let Some(resume) = self.resume_message() {
            tracing::debug!(shard_id = self.shard.id(), seq = self.sequence, "Resuming session");
            actions.push(ShardAction::SendControl(resume));
            self.set_state(ShardState::Resuming, actions);
        } else {
            self.request_identify(actions);
        }
    }

    fn on_heartbeat_ack(&mut self, actions: &mut Vec<ShardAction>) {
        let now = Instant::now();
        self.heartbeat_acked = true;
        self.heartbeat_unsent = false;
        self.last_ack = Some(now);
        if let Some(sent) = self.last_heartbeat_sent {
            let latency = now.saturating_duration_since(sent);
            self.latency = Some(latency);
            actions.push(ShardAction::Emit(ShardEvent::HeartbeatAck {
                shard_id: self.shard.id(),
                latency,
            }));
        }
    }

    fn on_invalid_session(&mut self, resumable: bool, actions: &mut Vec<ShardAction>) {
        if resumable {
            if let Some(resume) = self.resume_message() {
                tracing::info!(shard_id = self.shard.id(), "Session invalidated, resuming");
                actions.push(ShardAction::SendControl(resume));
                self.set_state(ShardState::Resuming, actions);
                return;
            }
        }

        tracing::info!(shard_id = self.shard.id(), "Session invalidated, re-identifying");
        self.reset_session();
        actions.push(ShardAction::FlushQueue);
        self.set_state(ShardState::Connecting, actions);
        self.request_identify(actions);
    }

    fn on_dispatch(&mut self, message: GatewayMessage, actions: &mut Vec<ShardAction>) {
        let shard_id = self.shard.id();
        let event_type = message.t.clone().unwrap_or_default();

        match event_type.as_str() {
            "READY" => match message.as_ready() {
                Some(ready) => {
                    tracing::info!(shard_id, session_id = %ready.session_id, "Shard ready");
                    self.session_id = Some(ready.session_id.clone());
                    self.resume_url = ready.resume_gateway_url;
                    self.set_state(ShardState::Connected, actions);
                    actions.push(ShardAction::Emit(ShardEvent::Ready {
                        shard_id,
                        session_id: ready.session_id,
                    }));
                }
                None => tracing::warn!(shard_id, "Malformed READY payload"),
            },
            "RESUMED" => {
                tracing::info!(shard_id, seq = self.sequence, "Session resumed");
                self.set_state(ShardState::Connected, actions);
                actions.push(ShardAction::Emit(ShardEvent::Resumed { shard_id }));
            }
            _ => {}
        }

        actions.push(ShardAction::Emit(ShardEvent::Dispatch {
            shard_id,
            event_type,
            sequence: message.s.unwrap_or(self.sequence),
            data: message.d.unwrap_or(Value::Null),
        }));
    }

    /// Validate and record an inbound sequence; `false` means the frame must be dropped
    fn accept_sequence(&mut self, seq: u64, actions: &mut Vec<ShardAction>) -> bool {
        let prev = self.sequence;
        let shard_id = self.shard.id();

        if prev > 0 && seq <= prev {
            tracing::warn!(shard_id, seq, prev, "Non-increasing sequence, ignoring frame");
            return false;
        }

        if prev > 0 && seq > prev + 1 && self.state != ShardState::Resuming {
            if let Some(resume) = self.resume_message() {
                tracing::warn!(shard_id, seq, prev, "Sequence gap, resuming");
                actions.push(ShardAction::SendControl(resume));
                self.set_state(ShardState::Resuming, actions);
                return false;
            }
            tracing::warn!(shard_id, seq, prev, "Sequence gap without a session to resume");
        }

        self.sequence = seq;
        true
    }

    fn request_identify(&mut self, actions: &mut Vec<ShardAction>) {
        if !self.awaiting_identify {
            self.awaiting_identify = true;
            actions.push(ShardAction::RequestIdentify);
        }
    }

    fn resume_message(&self) -> Option<GatewayMessage> {
        let session_id = self.session_id.clone()?;
        Some(GatewayMessage::resume(&ResumePayload {
            token: self.config.token.clone(),
            session_id,
            seq: self.sequence,
        }))
    }

    fn heartbeat_message(&self) -> GatewayMessage {
        GatewayMessage::heartbeat((self.sequence > 0).then_some(self.sequence))
    }

    fn send_heartbeat(&mut self) -> GatewayMessage {
        self.heartbeat_acked = false;
        self.heartbeat_unsent = true;
        self.last_heartbeat_sent = Some(Instant::now());
        self.heartbeat_message()
    }

    fn reset_session(&mut self) {
        self.sequence = 0;
        self.session_id = None;
        self.resume_url = None;
    }

    fn set_state(&mut self, new: ShardState, actions: &mut Vec<ShardAction>) {
        if self.state == new {
            return;
        }
        let old = std::mem::replace(&mut self.state, new);
        tracing::debug!(shard_id = self.shard.id(), %old, %new, "Shard state changed");
        actions.push(ShardAction::Emit(ShardEvent::StateChanged {
            shard_id: self.shard.id(),
            old,
            new,
        }));
    }
}
