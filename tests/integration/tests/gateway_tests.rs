//! Shard connection tests against a mock gateway
//!
//! Run with: cargo test -p integration-tests --test gateway_tests

use std::sync::Arc;
use std::time::Duration;

use integration_tests::{
    shard_config, wait_for_state, GatewayPeer, MockGateway, QUIET_HEARTBEAT_MS, TEST_TOKEN,
};
use serde_json::json;
use shard_core::ShardState;
use shard_gateway::{GatewayMessage, ImmediateGate, OpCode, ShardEvent, ShardHandle, ShardManager};
use tokio::time::Instant;

fn manager(gateway: &MockGateway, shard_count: u32) -> ShardManager {
    ShardManager::new(shard_config(&gateway.url()), Arc::new(ImmediateGate), shard_count)
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_identify_then_ready_connects() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 2);
    let handle = manager.spawn(1).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();

    let identify = peer.expect(OpCode::Identify).await.unwrap();
    let identify = identify.as_identify().unwrap();
    assert_eq!(identify.token, TEST_TOKEN);
    assert_eq!(identify.shard.id(), 1);
    assert_eq!(identify.shard.count(), 2);
    assert_eq!(identify.intents, 513);

    peer.ready(1, "session-a", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    manager.kill_all();
}

#[tokio::test]
async fn test_heartbeat_ack_reports_latency() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let mut events = manager.events().subscribe();
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();

    // The first heartbeat goes out right after Hello
    let heartbeat = peer.recv().await.unwrap().unwrap();
    assert_eq!(heartbeat.op, OpCode::Heartbeat);
    peer.send(&GatewayMessage::heartbeat_ack()).await.unwrap();

    loop {
        if let ShardEvent::HeartbeatAck { shard_id, .. } = events.recv().await.unwrap() {
            assert_eq!(shard_id, 0);
            break;
        }
    }
    assert!(handle.latency().is_some());

    manager.kill_all();
}

// ============================================================================
// Session recovery
// ============================================================================

#[tokio::test]
async fn test_missed_heartbeat_ack_reconnects_and_resumes() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let handle = manager.spawn(0).unwrap();
    let url = gateway.url();

    // Short interval, never acknowledged
    let mut peer = gateway.accept().await.unwrap();
    peer.hello(300).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-z", Some(&url)).await.unwrap();
    peer.dispatch("MESSAGE_CREATE", 2).await.unwrap();

    let code = peer.closed_by_client().await.unwrap();
    assert_eq!(code, Some(4900));

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    let resume = peer.expect(OpCode::Resume).await.unwrap();
    let resume = resume.as_resume().unwrap();
    assert_eq!(resume.session_id, "session-z");
    assert_eq!(resume.seq, 2);
    assert_eq!(resume.token, TEST_TOKEN);

    peer.dispatch("RESUMED", 3).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    manager.kill_all();
}

#[tokio::test]
async fn test_sequence_gap_resumes_on_open_socket() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-gap", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    // 2..=4 never arrive
    peer.dispatch("MESSAGE_CREATE", 5).await.unwrap();

    let resume = peer.expect(OpCode::Resume).await.unwrap();
    let resume = resume.as_resume().unwrap();
    assert_eq!(resume.session_id, "session-gap");
    assert_eq!(resume.seq, 1);
    wait_for_state(&handle, ShardState::Resuming).await.unwrap();

    peer.dispatch("RESUMED", 2).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    manager.kill_all();
}

#[tokio::test]
async fn test_invalid_session_reidentifies() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-old", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    peer.send(&GatewayMessage::invalid_session(false)).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();

    peer.ready(1, "session-new", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    manager.kill_all();
}

#[tokio::test]
async fn test_reconnect_request_resumes_on_new_socket() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-r", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    peer.send(&GatewayMessage::reconnect()).await.unwrap();
    assert_eq!(peer.closed_by_client().await.unwrap(), Some(4901));

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    let resume = peer.expect(OpCode::Resume).await.unwrap();
    assert_eq!(resume.as_resume().unwrap().session_id, "session-r");

    manager.kill_all();
}

// ============================================================================
// Close codes
// ============================================================================

#[tokio::test]
async fn test_fatal_close_stops_shard() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let mut events = manager.events().subscribe();
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.close(4004).await.unwrap();

    loop {
        if let ShardEvent::Stopped { shard_id, code } = events.recv().await.unwrap() {
            assert_eq!(shard_id, 0);
            assert_eq!(code, Some(4004));
            break;
        }
    }
    assert_eq!(handle.state(), ShardState::Disconnected);
}

#[tokio::test]
async fn test_normal_close_reidentifies() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = manager(&gateway, 1);
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-1000", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();
    peer.close(1000).await.unwrap();

    // A 1000 close drops the session, so the next socket identifies from scratch
    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();

    manager.kill_all();
}

// ============================================================================
// Send budget
// ============================================================================

/// Manager whose shards may send 4 frames per 30 s, one of them reserved
fn tight_budget_manager(gateway: &MockGateway) -> ShardManager {
    let mut config = shard_config(&gateway.url());
    config.send_limit = 4;
    config.send_window = Duration::from_secs(30);
    ShardManager::new(config, Arc::new(ImmediateGate), 1)
}

fn request_members(handle: &ShardHandle, count: usize) {
    for guild in 0..count {
        let payload = json!({"guild_id": guild.to_string(), "query": "", "limit": 0});
        handle.request_guild_members(payload).unwrap();
    }
}

/// Ack every heartbeat until `within` elapses; (heartbeats, member requests) seen
async fn serve_for(peer: &mut GatewayPeer, within: Duration) -> (usize, usize) {
    let deadline = Instant::now() + within;
    let (mut heartbeats, mut members) = (0, 0);

    while let Ok(frame) = tokio::time::timeout_at(deadline, peer.recv()).await {
        match frame.unwrap() {
            Some(message) if message.op == OpCode::Heartbeat => {
                heartbeats += 1;
                peer.send(&GatewayMessage::heartbeat_ack()).await.unwrap();
            }
            Some(message) if message.op == OpCode::RequestGuildMembers => members += 1,
            Some(message) => panic!("unexpected {}", message.op),
            None => panic!("client closed a healthy socket"),
        }
    }
    (heartbeats, members)
}

#[tokio::test]
async fn test_spent_send_budget_does_not_stall_heartbeats() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = tight_budget_manager(&gateway);
    let handle = manager.spawn(0).unwrap();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(400).await.unwrap();
    assert_eq!(peer.recv().await.unwrap().unwrap().op, OpCode::Heartbeat);
    peer.send(&GatewayMessage::heartbeat_ack()).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-budget", None).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    // Heartbeat and identify used two slots; the first request spends the rest
    request_members(&handle, 3);

    let (heartbeats, members) = serve_for(&mut peer, Duration::from_millis(1_500)).await;
    assert!(heartbeats >= 2, "only {heartbeats} heartbeats");
    assert_eq!(members, 1);
    assert_eq!(handle.state(), ShardState::Connected);

    manager.kill_all();
}

#[tokio::test]
async fn test_new_socket_starts_with_fresh_budget() {
    let mut gateway = MockGateway::start().await.unwrap();
    let manager = tight_budget_manager(&gateway);
    let handle = manager.spawn(0).unwrap();
    let url = gateway.url();

    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    peer.expect(OpCode::Identify).await.unwrap();
    peer.ready(1, "session-fresh", Some(&url)).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    request_members(&handle, 2);
    peer.expect(OpCode::RequestGuildMembers).await.unwrap();
    handle.reconnect().unwrap();
    assert_eq!(peer.closed_by_client().await.unwrap(), Some(4901));

    // The old socket's lock and budget do not carry over
    let mut peer = gateway.accept().await.unwrap();
    peer.hello(QUIET_HEARTBEAT_MS).await.unwrap();
    assert_eq!(peer.recv().await.unwrap().unwrap().op, OpCode::Heartbeat);
    peer.expect(OpCode::Resume).await.unwrap();
    peer.dispatch("RESUMED", 2).await.unwrap();
    wait_for_state(&handle, ShardState::Connected).await.unwrap();

    request_members(&handle, 1);
    peer.expect(OpCode::RequestGuildMembers).await.unwrap();

    manager.kill_all();
}
