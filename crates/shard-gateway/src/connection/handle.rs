//! Shard handle
//!
//! Cloneable control surface of a running shard. All influence on a shard goes through
//! its command channel; state and latency are observed through watch channels.

use serde_json::Value;
use shard_core::{ShardInfo, ShardState};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{GatewayMessage, PresenceUpdatePayload, VoiceStateUpdatePayload};

/// Commands accepted by a shard runner
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Queue an outbound frame
    Send(GatewayMessage),
    /// Close the socket and resume on a new one
    Reconnect,
    /// Close cleanly and stop the runner
    Kill,
}

/// Control handle for one shard
#[derive(Debug, Clone)]
pub struct ShardHandle {
    shard: ShardInfo,
    commands: mpsc::UnboundedSender<ShardCommand>,
    state: watch::Receiver<ShardState>,
    latency: watch::Receiver<Option<Duration>>,
}

impl ShardHandle {
    pub(crate) fn new(
        shard: ShardInfo,
        commands: mpsc::UnboundedSender<ShardCommand>,
        state: watch::Receiver<ShardState>,
        latency: watch::Receiver<Option<Duration>>,
    ) -> Self {
        Self {
            shard,
            commands,
            state,
            latency,
        }
    }

    pub fn shard(&self) -> ShardInfo {
        self.shard
    }

    pub fn id(&self) -> u32 {
        self.shard.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ShardState {
        *self.state.borrow()
    }

    /// Last heartbeat round-trip time
    pub fn latency(&self) -> Option<Duration> {
        *self.latency.borrow()
    }

    /// Whether the runner task is still alive
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Watch lifecycle transitions
    pub fn state_changes(&self) -> watch::Receiver<ShardState> {
        self.state.clone()
    }

    /// Wait until the shard reaches `target`
    pub async fn wait_for_state(&self, target: ShardState) -> GatewayResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::ShardStopped(self.id()))
    }

    /// Queue a raw frame
    pub fn send(&self, message: GatewayMessage) -> GatewayResult<()> {
        self.command(ShardCommand::Send(message))
    }

    pub fn update_presence(&self, presence: &PresenceUpdatePayload) -> GatewayResult<()> {
        self.send(GatewayMessage::presence_update(presence))
    }

    pub fn update_voice_state(&self, voice_state: &VoiceStateUpdatePayload) -> GatewayResult<()> {
        self.send(GatewayMessage::voice_state_update(voice_state))
    }

    /// Request guild members; the payload is passed through as-is
    pub fn request_guild_members(&self, payload: Value) -> GatewayResult<()> {
        self.send(GatewayMessage::request_guild_members(payload))
    }

    /// Drop the socket and resume on a new one
    pub fn reconnect(&self) -> GatewayResult<()> {
        self.command(ShardCommand::Reconnect)
    }

    /// Close cleanly and stop; the session is discarded
    pub fn kill(&self) -> GatewayResult<()> {
        self.command(ShardCommand::Kill)
    }

    fn command(&self, command: ShardCommand) -> GatewayResult<()> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::ShardStopped(self.id()))
    }
}
