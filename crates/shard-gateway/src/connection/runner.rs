//! Shard connection runner
//!
//! One tokio task per shard owns the socket, the heartbeat timer and the session state
//! machine, and reconnects with backoff until the shard is killed or closed fatally.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use shard_core::{ShardInfo, ShardState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::handle::ShardCommand;
use super::{
    Backoff, CloseDisposition, HandshakeGate, SendBudget, ShardAction, ShardConfig, ShardHandle,
    ShardSession,
};
use crate::events::{EventBus, ShardEvent};
use crate::protocol::{connection_url, CloseCode, GatewayMessage};
use crate::queue::{QueueRegistry, QueueTask, RateLimitedQueue};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Write side of one socket
///
/// Application frames wait on the shard's registry queue, which the send budget locks.
/// Heartbeat, identify and resume frames use a separate control queue that is never
/// locked, so a spent budget cannot stall liveness or the handshake.
struct Outbound {
    sink: SharedSink,
    control: Arc<RateLimitedQueue<u32>>,
    heartbeat_written: mpsc::UnboundedSender<Instant>,
}

/// How long to wait for our close frame to be written
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between failed handshake-permission requests
const GATE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// A shard ready to be started
pub struct ShardConnection {
    shard: ShardInfo,
    config: Arc<ShardConfig>,
    gate: Arc<dyn HandshakeGate>,
    queues: Arc<QueueRegistry<u32>>,
    events: EventBus<ShardEvent>,
}

impl ShardConnection {
    pub fn new(
        shard: ShardInfo,
        config: Arc<ShardConfig>,
        gate: Arc<dyn HandshakeGate>,
        queues: Arc<QueueRegistry<u32>>,
        events: EventBus<ShardEvent>,
    ) -> Self {
        Self {
            shard,
            config,
            gate,
            queues,
            events,
        }
    }

    /// Start the runner task
    pub fn spawn(self) -> ShardHandle {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ShardState::Disconnected);
        let (latency_tx, latency_rx) = watch::channel(None);

        let runner = Runner {
            session: ShardSession::new(self.shard, Arc::clone(&self.config.session)),
            backoff: Backoff::new(self.config.reconnect_base, self.config.reconnect_max),
            budget: Arc::new(SendBudget::new(self.config.send_limit, self.config.send_window)),
            reached_connected: false,
            state_tx,
            latency_tx,
            connection: self,
        };
        let handle = ShardHandle::new(runner.session.shard(), command_tx, state_rx, latency_rx);

        tokio::spawn(runner.run(commands));
        handle
    }
}

enum Outcome {
    Closed {
        disposition: CloseDisposition,
        code: Option<u16>,
    },
    Killed,
}

struct Runner {
    connection: ShardConnection,
    session: ShardSession,
    backoff: Backoff,
    budget: Arc<SendBudget>,
    /// Set once the current attempt reached CONNECTED
    reached_connected: bool,
    state_tx: watch::Sender<ShardState>,
    latency_tx: watch::Sender<Option<Duration>>,
}

impl Runner {
    fn shard_id(&self) -> u32 {
        self.connection.shard.id()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ShardCommand>) {
        let shard_id = self.shard_id();
        tracing::info!(shard_id, shard = %self.connection.shard, "Shard starting");

        let stop_code = loop {
            let url = self.next_url();
            let actions = self.session.begin_connect();
            self.emit_all(actions);
            self.reached_connected = false;

            tracing::debug!(shard_id, url = %url, "Connecting");
            let outcome = match connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    tracing::info!(shard_id, "Socket open");
                    self.drive(ws, &mut commands).await
                }
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "Connection failed");
                    self.closed(None, e.to_string())
                }
            };

            let code = match outcome {
                Outcome::Killed => break Some(CloseCode::Normal.as_u16()),
                Outcome::Closed {
                    disposition: CloseDisposition::Stop,
                    code,
                } => break code,
                Outcome::Closed { code, .. } => code,
            };

            if self.reached_connected {
                self.backoff.reset();
            }
            let delay = self.backoff.next_delay();
            tracing::info!(
                shard_id,
                code = ?code,
                delay_ms = delay.as_millis(),
                resume = self.session.can_resume(),
                "Reconnecting"
            );
            self.emit(ShardEvent::Reconnecting { shard_id, delay });

            if !self.wait_before_reconnect(delay, &mut commands).await {
                break Some(CloseCode::Normal.as_u16());
            }
        };

        self.connection.queues.clear(&shard_id);
        tracing::info!(shard_id, code = ?stop_code, "Shard stopped");
        self.emit(ShardEvent::Stopped {
            shard_id,
            code: stop_code,
        });
    }

    /// Sleep through the backoff delay; `false` if the shard was killed meanwhile
    async fn wait_before_reconnect(
        &self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = commands.recv() => match command {
                    Some(ShardCommand::Reconnect) => return true,
                    Some(ShardCommand::Send(message)) => {
                        tracing::debug!(
                            shard_id = self.shard_id(),
                            op = %message.op,
                            "Dropping frame sent while disconnected"
                        );
                    }
                    Some(ShardCommand::Kill) | None => return false,
                },
            }
        }
    }

    fn next_url(&self) -> String {
        let base = self
            .session
            .resume_url()
            .filter(|_| self.session.can_resume())
            .unwrap_or(self.connection.config.url.as_str());
        connection_url(base)
    }

    async fn drive(
        &mut self,
        ws: WsStream,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Outcome {
        let shard_id = self.shard_id();
        let (sink, mut stream) = ws.split();
        let (heartbeat_written, mut written) = mpsc::unbounded_channel();
        let out = Outbound {
            sink: Arc::new(Mutex::new(sink)),
            control: RateLimitedQueue::new(shard_id),
            heartbeat_written,
        };

        // Frames queued for a previous socket are stale, and its budget lock with them
        self.connection.queues.clear(&shard_id);
        self.connection.queues.unlock(&shard_id);
        self.budget.reset();

        let mut heartbeat: Option<Interval> = None;
        let mut gate_task: Option<JoinHandle<()>> = None;

        let outcome = loop {
            let actions = tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match GatewayMessage::from_json(&text) {
                        Ok(message) => {
                            tracing::trace!(shard_id, message = %message, "Frame received");
                            self.session.handle_message(message)
                        }
                        Err(e) => {
                            tracing::warn!(shard_id, error = %e, "Failed to parse frame");
                            Vec::new()
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        let reason = frame.map(|f| f.reason.into_owned()).unwrap_or_default();
                        tracing::info!(
                            shard_id,
                            code = ?code,
                            reason = %reason,
                            "Gateway closed socket"
                        );
                        break self.closed(code, reason);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::warn!(shard_id, "Binary frames are not supported, ignoring");
                        Vec::new()
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        tracing::warn!(shard_id, error = %e, "Transport error");
                        Vec::new()
                    }
                    None => break self.closed(None, "stream ended".to_string()),
                },
                () = next_heartbeat(&mut heartbeat) => self.session.on_heartbeat_tick(),
                Some(at) = written.recv() => {
                    self.session.on_heartbeat_written(at);
                    Vec::new()
                }
                granted = gate_granted(&mut gate_task) => {
                    gate_task = None;
                    if granted {
                        self.session.on_identify_permitted()
                    } else {
                        Vec::new()
                    }
                }
                command = commands.recv() => match command {
                    Some(ShardCommand::Send(message)) => vec![ShardAction::Send(message)],
                    Some(ShardCommand::Reconnect) => {
                        vec![ShardAction::Close(CloseCode::ReconnectRequested)]
                    }
                    Some(ShardCommand::Kill) | None => {
                        close_socket(&out.sink, CloseCode::Normal).await;
                        let _ = self.closed(Some(CloseCode::Normal.as_u16()), "killed".to_string());
                        break Outcome::Killed;
                    }
                },
            };

            if let Some(outcome) = self
                .apply(actions, &out, &mut heartbeat, &mut gate_task)
                .await
            {
                break outcome;
            }
        };

        if let Some(task) = gate_task {
            task.abort();
        }
        out.control.clear();
        self.connection.queues.clear(&shard_id);
        outcome
    }

    async fn apply(
        &mut self,
        actions: Vec<ShardAction>,
        out: &Outbound,
        heartbeat: &mut Option<Interval>,
        gate_task: &mut Option<JoinHandle<()>>,
    ) -> Option<Outcome> {
        for action in actions {
            match action {
                ShardAction::Send(message) => self.enqueue_frame(out, message),
                ShardAction::SendControl(message) => self.enqueue_control(out, message, false),
                ShardAction::SendHeartbeat(message) => self.enqueue_control(out, message, true),
                ShardAction::StartHeartbeat(period) => {
                    let mut timer = interval_at(Instant::now() + period, period);
                    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    *heartbeat = Some(timer);
                }
                ShardAction::RequestIdentify => {
                    if gate_task.is_none() {
                        *gate_task = Some(self.request_identify());
                    }
                }
                ShardAction::FlushQueue => self.connection.queues.clear(&self.shard_id()),
                ShardAction::Close(code) => {
                    close_socket(&out.sink, code).await;
                    return Some(self.closed(Some(code.as_u16()), code.reason().to_string()));
                }
                ShardAction::Emit(event) => self.emit(event),
            }
        }
        None
    }

    /// Queue an application frame; spending the budget locks the queue
    fn enqueue_frame(&self, out: &Outbound, message: GatewayMessage) {
        let shard_id = self.shard_id();
        let sink = Arc::clone(&out.sink);
        let queues = Arc::clone(&self.connection.queues);
        let budget = Arc::clone(&self.budget);

        let task: QueueTask = Box::pin(async move {
            if !write_frame(&sink, shard_id, &message).await {
                return;
            }
            if let Some(pause) = budget.record_application() {
                tracing::debug!(shard_id, pause_ms = pause.as_millis(), "Send budget spent");
                queues.lock(&shard_id, pause);
            }
        });

        self.connection.queues.enqueue(&shard_id, task, false);
    }

    /// Queue a control frame; heartbeats go first and report when they hit the socket
    fn enqueue_control(&self, out: &Outbound, message: GatewayMessage, heartbeat: bool) {
        let shard_id = self.shard_id();
        let sink = Arc::clone(&out.sink);
        let budget = Arc::clone(&self.budget);
        let written = heartbeat.then(|| out.heartbeat_written.clone());

        let task: QueueTask = Box::pin(async move {
            if write_frame(&sink, shard_id, &message).await {
                budget.record_control();
            }
            // A failed write is reported too, so the missed ack still closes the socket
            if let Some(written) = written {
                let _ = written.send(Instant::now());
            }
        });

        out.control.enqueue(task, heartbeat);
    }

    fn request_identify(&self) -> JoinHandle<()> {
        let shard_id = self.shard_id();
        let gate = Arc::clone(&self.connection.gate);

        tokio::spawn(async move {
            loop {
                match gate.acquire(shard_id).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(
                            shard_id,
                            error = %e,
                            "Handshake permission failed, retrying"
                        );
                        tokio::time::sleep(GATE_RETRY_DELAY).await;
                    }
                }
            }
        })
    }

    fn closed(&mut self, code: Option<u16>, reason: String) -> Outcome {
        let (disposition, actions) = self.session.on_close(code);
        self.emit_all(actions);
        self.emit(ShardEvent::Closed {
            shard_id: self.shard_id(),
            code,
            reason,
        });
        Outcome::Closed { disposition, code }
    }

    fn emit_all(&mut self, actions: Vec<ShardAction>) {
        for action in actions {
            if let ShardAction::Emit(event) = action {
                self.emit(event);
            }
        }
    }

    fn emit(&mut self, event: ShardEvent) {
        match &event {
            ShardEvent::StateChanged { new, .. } => {
                self.state_tx.send_replace(*new);
                if *new == ShardState::Connected {
                    self.reached_connected = true;
                }
            }
            ShardEvent::HeartbeatAck { latency, .. } => {
                self.latency_tx.send_replace(Some(*latency));
            }
            _ => {}
        }
        self.connection.events.publish(event);
    }
}

/// Encode and write one frame; `false` if it never reached the socket
async fn write_frame(sink: &SharedSink, shard_id: u32, message: &GatewayMessage) -> bool {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(shard_id, error = %e, "Failed to encode frame");
            return false;
        }
    };

    if let Err(e) = sink.lock().await.send(Message::Text(json)).await {
        tracing::warn!(shard_id, op = %message.op, error = %e, "Failed to send frame");
        return false;
    }
    tracing::trace!(shard_id, op = %message.op, "Frame sent");
    true
}

async fn close_socket(sink: &SharedSink, code: CloseCode) {
    let frame = CloseFrame {
        code: WsCloseCode::from(code.as_u16()),
        reason: code.reason().into(),
    };
    let close = async {
        let mut sink = sink.lock().await;
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        tracing::debug!(code = %code, "Timed out writing close frame");
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves when the pending handshake request finishes; `false` if it was aborted
async fn gate_granted(task: &mut Option<JoinHandle<()>>) -> bool {
    match task {
        Some(task) => task.await.is_ok(),
        None => std::future::pending().await,
    }
}
