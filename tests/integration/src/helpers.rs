//! Test helpers for integration tests
//!
//! A scriptable mock gateway (one [`GatewayPeer`] per accepted socket), an auto-serving
//! gateway for cluster tests, and small waiting utilities.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use shard_core::ShardState;
use shard_gateway::{GatewayMessage, OpCode, ShardHandle};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

/// Default bound on every wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat interval long enough to never fire during a test
pub const QUIET_HEARTBEAT_MS: u64 = 45_000;

/// Mock gateway handing each accepted socket to the test
pub struct MockGateway {
    pub addr: SocketAddr,
    peers: mpsc::UnboundedReceiver<GatewayPeer>,
    _handle: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, peers) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(stream).await {
                    if tx.send(GatewayPeer { ws }).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            peers,
            _handle: handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Result<GatewayPeer> {
        tokio::time::timeout(TEST_TIMEOUT, self.peers.recv())
            .await
            .map_err(|_| anyhow!("no connection within {TEST_TIMEOUT:?}"))?
            .ok_or_else(|| anyhow!("gateway listener stopped"))
    }
}

/// Server side of one client socket
pub struct GatewayPeer {
    ws: WebSocketStream<TcpStream>,
}

impl GatewayPeer {
    pub async fn send(&mut self, message: &GatewayMessage) -> Result<()> {
        self.ws.send(Message::Text(message.to_json()?)).await?;
        Ok(())
    }

    pub async fn hello(&mut self, heartbeat_interval_ms: u64) -> Result<()> {
        self.send(&GatewayMessage::hello(heartbeat_interval_ms)).await
    }

    /// Send the READY dispatch
    pub async fn ready(
        &mut self,
        seq: u64,
        session_id: &str,
        resume_url: Option<&str>,
    ) -> Result<()> {
        let data = json!({
            "session_id": session_id,
            "resume_gateway_url": resume_url,
        });
        self.send(&GatewayMessage::dispatch("READY", seq, data)).await
    }

    pub async fn dispatch(&mut self, event: &str, seq: u64) -> Result<()> {
        self.send(&GatewayMessage::dispatch(event, seq, json!({}))).await
    }

    /// Close with a close frame carrying `code`
    pub async fn close(&mut self, code: u16) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: "test".into(),
        };
        self.ws.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    /// Next client frame; `None` once the client closed
    pub async fn recv(&mut self) -> Result<Option<GatewayMessage>> {
        tokio::time::timeout(TEST_TIMEOUT, self.next_message())
            .await
            .map_err(|_| anyhow!("no frame within {TEST_TIMEOUT:?}"))?
    }

    async fn next_message(&mut self) -> Result<Option<GatewayMessage>> {
        while let Some(frame) = self.ws.next().await {
            match frame {
                Ok(Message::Text(text)) => return Ok(Some(GatewayMessage::from_json(&text)?)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {}
                Err(e) => bail!("socket error: {e}"),
            }
        }
        Ok(None)
    }

    /// Next client frame with `op`, skipping heartbeats
    pub async fn expect(&mut self, op: OpCode) -> Result<GatewayMessage> {
        loop {
            match self.recv().await? {
                Some(message) if message.op == op => return Ok(message),
                Some(message) if message.op == OpCode::Heartbeat => continue,
                Some(message) => bail!("expected {op}, got {}", message.op),
                None => bail!("socket closed while waiting for {op}"),
            }
        }
    }

    /// Read until the client closes; the close code it sent, if any
    pub async fn closed_by_client(&mut self) -> Result<Option<u16>> {
        loop {
            let frame = tokio::time::timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow!("client did not close within {TEST_TIMEOUT:?}"))?;
            match frame {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| u16::from(f.code)));
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(None),
            }
        }
    }
}

/// Gateway that completes every handshake on its own
///
/// Hello, READY after Identify, RESUMED after Resume, and an ACK for every heartbeat.
/// Identify arrival times are recorded per shard.
pub struct AutoGateway {
    pub addr: SocketAddr,
    identifies: Arc<Mutex<Vec<(u32, Instant)>>>,
    _handle: JoinHandle<()>,
}

impl AutoGateway {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let identifies = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&identifies);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        let _ = serve_peer(GatewayPeer { ws }, log).await;
                    }
                });
            }
        });

        Ok(Self {
            addr,
            identifies,
            _handle: handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Shard ids in the order they identified, with arrival times
    pub fn identifies(&self) -> Vec<(u32, Instant)> {
        self.identifies.lock().clone()
    }
}

async fn serve_peer(mut peer: GatewayPeer, log: Arc<Mutex<Vec<(u32, Instant)>>>) -> Result<()> {
    peer.hello(QUIET_HEARTBEAT_MS).await?;
    let mut seq = 0;

    while let Some(message) = peer.next_message().await.ok().flatten() {
        match message.op {
            OpCode::Heartbeat => peer.send(&GatewayMessage::heartbeat_ack()).await?,
            OpCode::Identify => {
                let shard = message
                    .as_identify()
                    .map(|identify| identify.shard.id())
                    .ok_or_else(|| anyhow!("malformed identify"))?;
                log.lock().push((shard, Instant::now()));
                seq += 1;
                let session = format!("session-{shard}");
                peer.ready(seq, &session, None).await?;
            }
            OpCode::Resume => {
                seq += 1;
                peer.dispatch("RESUMED", seq).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Wait until `handle` reports `state`
pub async fn wait_for_state(handle: &ShardHandle, state: ShardState) -> Result<()> {
    let mut changes = handle.state_changes();
    tokio::time::timeout(TEST_TIMEOUT, changes.wait_for(|s| *s == state))
        .await
        .map_err(|_| anyhow!("shard {} never reached {state}", handle.id()))?
        .map_err(|_| anyhow!("shard {} stopped", handle.id()))?;
    Ok(())
}
