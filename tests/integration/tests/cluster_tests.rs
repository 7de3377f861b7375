//! Multi-process cluster tests
//!
//! Workers run in-process over in-memory pipes, or are played by the test itself.
//!
//! Run with: cargo test -p integration-tests --test cluster_tests

use std::sync::Arc;
use std::time::Duration;

use integration_tests::{
    app_config, AutoGateway, InProcessLauncher, ScriptedLauncher, ScriptedWorker,
    StallingEvaluator, StubRestClient, TEST_TIMEOUT, UNREACHABLE_GATEWAY,
};
use serde_json::json;
use shard_cluster::ipc::{EvalPayload, EvalResult, RestPayload};
use shard_cluster::{
    resolve_layout, BuiltinEvaluator, ClusterError, ClusterEvent, ClusterOrchestrator, Evaluator,
    IpcMessage, IpcOp, OrchestratorConfig, ProcessStatus, ProcessSupervisor, RestError,
    RestOperation, SupervisorConfig,
};
use shard_common::ShardCount;
use shard_core::{ClusterLayout, NonceGenerator, ShardState};
use shard_gateway::EventBus;
use tokio::sync::{broadcast, mpsc};

fn supervisor_config(respawn: bool) -> SupervisorConfig {
    SupervisorConfig {
        respawn,
        respawn_delay: Duration::from_millis(50),
        spawn_timeout: Some(TEST_TIMEOUT),
        eval_timeout: TEST_TIMEOUT,
    }
}

fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrency: 1,
        identify_spacing: Duration::from_millis(200),
        handshake_timeout: TEST_TIMEOUT,
        queue_expire: Duration::from_secs(60),
        rest_cache_ttl: Duration::from_secs(60),
        supervisor: supervisor_config(false),
    }
}

async fn next_worker(workers: &mut mpsc::UnboundedReceiver<ScriptedWorker>) -> ScriptedWorker {
    tokio::time::timeout(TEST_TIMEOUT, workers.recv())
        .await
        .expect("worker launched in time")
        .expect("launcher alive")
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<ClusterEvent>,
    matches: impl Fn(&ClusterEvent) -> bool,
) -> ClusterEvent {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event in time")
}

/// Start a one-cluster orchestrator whose worker is played by the test
async fn scripted_orchestrator(
    rest: Arc<StubRestClient>,
) -> (
    Arc<ClusterOrchestrator>,
    ScriptedWorker,
    mpsc::UnboundedReceiver<ScriptedWorker>,
) {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let layout = ClusterLayout::for_all_shards(2, 1).unwrap();
    let orchestrator = ClusterOrchestrator::new(layout, orchestrator_config(), launcher, rest);

    let starting = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.start().await }
    });
    let worker = next_worker(&mut workers).await;
    worker.ready().unwrap();
    starting.await.unwrap().unwrap();

    (orchestrator, worker, workers)
}

/// Start a six-shard, three-cluster orchestrator with in-process workers
async fn three_clusters(
    evaluator: Arc<dyn Evaluator>,
    overrides: &[(&str, &str)],
) -> (
    Arc<ClusterOrchestrator>,
    Arc<InProcessLauncher>,
    Arc<StubRestClient>,
) {
    let mut vars = vec![
        ("TOTAL_SHARDS", "6"),
        ("CLUSTER_COUNT", "3"),
        ("MAX_CONCURRENCY", "1"),
    ];
    vars.extend_from_slice(overrides);
    let config = app_config(UNREACHABLE_GATEWAY, &vars).unwrap();

    let launcher = InProcessLauncher::new(config.clone(), evaluator);
    let rest = StubRestClient::new(6, 1);
    let orchestrator =
        ClusterOrchestrator::from_app_config(&config, launcher.clone(), rest.clone())
            .await
            .unwrap();
    orchestrator.start().await.unwrap();
    (orchestrator, launcher, rest)
}

// ============================================================================
// Layout
// ============================================================================

#[tokio::test]
async fn test_resolve_layout_asks_gateway_when_automatic() {
    let rest = StubRestClient::new(8, 4);
    let config = app_config(UNREACHABLE_GATEWAY, &[("CLUSTER_COUNT", "2")]).unwrap();
    assert_eq!(config.sharding.total_shards, ShardCount::Auto);

    let (layout, max_concurrency) = resolve_layout(&config.sharding, rest.as_ref()).await.unwrap();
    assert_eq!(layout.total_shards(), 8);
    assert_eq!(layout.cluster_count(), 2);
    assert_eq!(layout.clusters()[1].shard_ids(), 4..=7);
    assert_eq!(max_concurrency, 4);
    assert_eq!(rest.calls(), 1);
}

#[tokio::test]
async fn test_resolve_layout_uses_fixed_values() {
    let rest = StubRestClient::new(8, 4);
    let config = app_config(
        UNREACHABLE_GATEWAY,
        &[
            ("TOTAL_SHARDS", "10"),
            ("DEPLOYMENT_FIRST_SHARD", "4"),
            ("DEPLOYMENT_LAST_SHARD", "9"),
            ("CLUSTER_COUNT", "3"),
            ("MAX_CONCURRENCY", "2"),
        ],
    )
    .unwrap();

    let (layout, max_concurrency) = resolve_layout(&config.sharding, rest.as_ref()).await.unwrap();
    assert_eq!(layout.total_shards(), 10);
    assert_eq!(layout.clusters()[0].shard_ids(), 4..=5);
    assert_eq!(layout.clusters()[2].shard_ids(), 8..=9);
    assert_eq!(max_concurrency, 2);
    assert_eq!(rest.calls(), 0);
}

// ============================================================================
// Broadcast evaluation
// ============================================================================

#[tokio::test]
async fn test_broadcast_eval_reaches_every_cluster() {
    let config = app_config(
        UNREACHABLE_GATEWAY,
        &[
            ("TOTAL_SHARDS", "6"),
            ("CLUSTER_COUNT", "3"),
            ("MAX_CONCURRENCY", "1"),
        ],
    )
    .unwrap();
    let launcher = InProcessLauncher::new(config.clone(), Arc::new(BuiltinEvaluator::new()));
    let orchestrator =
        ClusterOrchestrator::from_app_config(&config, launcher.clone(), StubRestClient::new(6, 1))
            .await
            .unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(launcher.launches(), 3);

    let ids = orchestrator.broadcast_eval("this.clusterId", None).await;
    let ids: Vec<_> = ids.into_iter().map(Result::unwrap).collect();
    assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);

    // Only the owner of shard 3 evaluates
    let owned = orchestrator.broadcast_eval("this.shards", Some(3)).await;
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].as_ref().unwrap(), &json!([2, 3]));

    let failed = orchestrator.broadcast_eval("process.exit()", None).await;
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(Result::is_err));

    assert_eq!(orchestrator.eval_on(2, "this.firstShardId").await.unwrap(), json!(4));
    assert!(matches!(
        orchestrator.eval_on(7, "this.clusterId").await,
        Err(ClusterError::UnknownCluster(7))
    ));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_broadcast_goes_through_parent() {
    let (orchestrator, mut worker, _workers) =
        scripted_orchestrator(StubRestClient::new(2, 1)).await;
    let nonces = NonceGenerator::new(0);

    let nonce = nonces.next();
    let request = EvalPayload::request(nonce, "this.clusterId", None);
    worker
        .send(IpcMessage::with_payload(IpcOp::Eval, &request).unwrap().as_request())
        .unwrap();

    // The parent fans the request back out to every cluster, this one included
    let fan_out = worker.expect(IpcOp::Eval).await.unwrap();
    assert!(fan_out.request);
    let fan_out: EvalPayload = fan_out.payload().unwrap();
    assert_ne!(fan_out.nonce, nonce);
    let answer = EvalPayload::success(fan_out.nonce, json!(7));
    worker
        .send(IpcMessage::with_payload(IpcOp::Eval, &answer).unwrap())
        .unwrap();

    let reply = worker.expect(IpcOp::Eval).await.unwrap();
    assert!(!reply.request);
    let reply: EvalPayload = reply.payload().unwrap();
    assert_eq!(reply.nonce, nonce);
    assert_eq!(reply.results, Some(vec![EvalResult::Ok { result: json!(7) }]));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_broadcast_eval_collects_every_cluster() {
    let (orchestrator, launcher, _rest) =
        three_clusters(Arc::new(BuiltinEvaluator::new()), &[]).await;
    let agent = launcher.agent(1).unwrap();

    let ids = agent.broadcast_eval("this.clusterId", None).await.unwrap();
    let ids: Vec<_> = ids.into_iter().map(Result::unwrap).collect();
    assert_eq!(ids, vec![json!(0), json!(1), json!(2)]);

    // Only the owner of shard 4 evaluates
    let owned = agent.broadcast_eval("this.lastShardId", Some(4)).await.unwrap();
    assert_eq!(owned, vec![Ok(json!(5))]);

    // Remote failures come back as errors, one per cluster
    let failed = agent.broadcast_eval("process.exit()", None).await.unwrap();
    assert_eq!(failed.len(), 3);
    for result in failed {
        let error = result.unwrap_err();
        assert_eq!(error.name, "EvalError");
        assert!(error.message.contains("process.exit()"));
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_worker_broadcast_reports_stalled_cluster() {
    let (orchestrator, launcher, _rest) =
        three_clusters(StallingEvaluator::new(2), &[("EVAL_TIMEOUT_MS", "300")]).await;
    let agent = launcher.agent(0).unwrap();
    assert!(agent.request_timeout() > Duration::from_millis(300));

    // The parent gives up on cluster 2 first and still answers with the other values
    let results = agent.broadcast_eval("this.clusterId", None).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0], Ok(json!(0)));
    assert_eq!(results[1], Ok(json!(1)));
    assert_eq!(results[2].as_ref().unwrap_err().name, "TIMEOUT");

    orchestrator.shutdown().await;
}

// ============================================================================
// REST proxy
// ============================================================================

#[tokio::test]
async fn test_worker_rest_calls_share_parent_cache() {
    let (orchestrator, launcher, rest) =
        three_clusters(Arc::new(BuiltinEvaluator::new()), &[]).await;
    let calls = rest.calls();
    let first = launcher.agent(0).unwrap();
    let third = launcher.agent(2).unwrap();

    let get_user = || RestOperation::GetUser {
        user_id: "42".to_string(),
    };
    let user = first.rest(get_user()).await.unwrap();
    assert_eq!(user["id"], json!("42"));
    assert_eq!(third.rest(get_user()).await.unwrap(), user);
    assert_eq!(rest.calls(), calls + 1);

    let missing = RestOperation::GetGuild {
        guild_id: "404".to_string(),
    };
    let err = first.rest(missing).await.unwrap_err();
    let ClusterError::Rest(RestError::Remote(remote)) = &err else {
        panic!("expected a remote REST error, got {err:?}");
    };
    assert!(remote.message.contains("404"));

    orchestrator.shutdown().await;
}

async fn rest_round_trip(
    worker: &mut ScriptedWorker,
    nonces: &NonceGenerator,
    method: &str,
    args: Vec<serde_json::Value>,
) -> RestPayload {
    let nonce = nonces.next();
    let request = RestPayload::request(nonce, method, args);
    worker
        .send(IpcMessage::with_payload(IpcOp::RestRequest, &request).unwrap().as_request())
        .unwrap();

    let reply: RestPayload = worker
        .expect(IpcOp::RestRequest)
        .await
        .unwrap()
        .payload()
        .unwrap();
    assert_eq!(reply.nonce, nonce);
    reply
}

#[tokio::test]
async fn test_rest_requests_are_proxied_and_cached() {
    let rest = StubRestClient::new(2, 1);
    let (orchestrator, mut worker, _workers) = scripted_orchestrator(Arc::clone(&rest)).await;
    let nonces = NonceGenerator::new(0);

    let first = rest_round_trip(&mut worker, &nonces, "getUser", vec![json!("42")]).await;
    assert_eq!(first.result.unwrap()["id"], json!("42"));
    let second = rest_round_trip(&mut worker, &nonces, "getUser", vec![json!("42")]).await;
    assert!(second.error.is_none());
    assert_eq!(rest.calls(), 1);

    // Writes are never cached
    let body = vec![json!("10"), json!({ "content": "hi" })];
    rest_round_trip(&mut worker, &nonces, "createMessage", body.clone()).await;
    rest_round_trip(&mut worker, &nonces, "createMessage", body).await;
    assert_eq!(rest.calls(), 3);

    let failed = rest_round_trip(&mut worker, &nonces, "getGuild", vec![json!("404")]).await;
    assert!(failed.result.is_none());
    assert!(failed.error.unwrap().message.contains("404"));

    let unknown = rest_round_trip(&mut worker, &nonces, "deleteEverything", vec![]).await;
    assert!(unknown.error.is_some());

    orchestrator.shutdown().await;
}

// ============================================================================
// Supervision
// ============================================================================

#[tokio::test]
async fn test_worker_crash_rejects_pending_and_respawns() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let layout = ClusterLayout::for_all_shards(2, 1).unwrap();
    let (inbound, _inbound_rx) = mpsc::unbounded_channel();
    let bus: EventBus<ClusterEvent> = EventBus::new();
    let mut events = bus.subscribe();
    let supervisor = ProcessSupervisor::new(
        layout.clusters()[0],
        1,
        launcher,
        supervisor_config(true),
        inbound,
        bus,
    );

    let starting = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.spawn().await }
    });
    let mut worker = next_worker(&mut workers).await;
    worker.ready().unwrap();
    starting.await.unwrap().unwrap();
    assert_eq!(supervisor.status(), ProcessStatus::Ready);

    // Two evaluations and one grant the worker never answers
    let evals: Vec<_> = (0..2)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.eval("this.clusterId", None, None).await })
        })
        .collect();
    let grant = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.grant_identify(1, TEST_TIMEOUT).await }
    });

    let mut ops = Vec::new();
    for _ in 0..3 {
        ops.push(worker.recv().await.unwrap().op);
    }
    assert_eq!(ops.iter().filter(|op| **op == IpcOp::Eval).count(), 2);
    assert!(ops.contains(&IpcOp::IdentifyRequest));
    assert_eq!(supervisor.pending_evals(), 2);
    assert_eq!(supervisor.pending_grants(), 1);

    drop(worker);

    for eval in evals {
        let err = eval.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "process closed");
    }
    assert!(matches!(grant.await.unwrap(), Err(ClusterError::ProcessClosed)));

    let exited = wait_for_event(&mut events, |e| matches!(e, ClusterEvent::Exited { .. })).await;
    assert!(matches!(
        exited,
        ClusterEvent::Exited {
            cluster_id: 0,
            code: None,
            respawning: true
        }
    ));

    let respawned = next_worker(&mut workers).await;
    respawned.ready().unwrap();
    wait_for_event(&mut events, |e| matches!(e, ClusterEvent::Ready { cluster_id: 0 })).await;
    assert_eq!(supervisor.status(), ProcessStatus::Ready);

    assert!(supervisor.kill());
    supervisor.wait_stopped().await;
    assert!(
        next_worker_within(&mut workers, Duration::from_millis(200))
            .await
            .is_none(),
        "killed worker must not be respawned"
    );
}

async fn next_worker_within(
    workers: &mut mpsc::UnboundedReceiver<ScriptedWorker>,
    limit: Duration,
) -> Option<ScriptedWorker> {
    tokio::time::timeout(limit, workers.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_spawn_times_out_without_ready() {
    let (launcher, mut workers) = ScriptedLauncher::new();
    let layout = ClusterLayout::for_all_shards(1, 1).unwrap();
    let (inbound, _inbound_rx) = mpsc::unbounded_channel();
    let mut config = supervisor_config(true);
    config.spawn_timeout = Some(Duration::from_millis(100));
    let supervisor =
        ProcessSupervisor::new(layout.clusters()[0], 1, launcher, config, inbound, EventBus::new());

    let result = supervisor.spawn().await;
    assert!(matches!(result, Err(ClusterError::Timeout("READY"))));
    supervisor.wait_stopped().await;

    // The silent worker was launched once and not replaced
    assert!(next_worker_within(&mut workers, Duration::from_millis(50)).await.is_some());
    assert!(next_worker_within(&mut workers, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_worker_can_request_respawn_of_all() {
    let (orchestrator, worker, mut workers) =
        scripted_orchestrator(StubRestClient::new(2, 1)).await;
    let mut events = orchestrator.events().subscribe();

    worker.send(IpcMessage::respawn_all()).unwrap();

    let replacement = next_worker(&mut workers).await;
    replacement.ready().unwrap();
    wait_for_event(&mut events, |e| matches!(e, ClusterEvent::Ready { cluster_id: 0 })).await;

    drop(worker);
    orchestrator.shutdown().await;
}

// ============================================================================
// Handshake gating
// ============================================================================

#[tokio::test]
async fn test_handshakes_in_one_group_are_spaced() {
    let gateway = AutoGateway::start().await.unwrap();
    let config = app_config(
        &gateway.url(),
        &[
            ("TOTAL_SHARDS", "3"),
            ("CLUSTER_COUNT", "1"),
            ("MAX_CONCURRENCY", "1"),
            ("IDENTIFY_SPACING_MS", "200"),
        ],
    )
    .unwrap();
    let launcher = InProcessLauncher::new(config.clone(), Arc::new(BuiltinEvaluator::new()));
    let orchestrator =
        ClusterOrchestrator::from_app_config(&config, launcher, StubRestClient::new(3, 1))
            .await
            .unwrap();
    let mut events = orchestrator.events().subscribe();
    orchestrator.start().await.unwrap();

    for _ in 0..3 {
        wait_for_event(&mut events, |e| {
            matches!(
                e,
                ClusterEvent::ShardState {
                    new: ShardState::Connected,
                    ..
                }
            )
        })
        .await;
    }
    for shard_id in 0..3 {
        assert_eq!(orchestrator.shard_state(shard_id), Some(ShardState::Connected));
    }

    let mut identifies = gateway.identifies();
    identifies.sort_by_key(|(_, at)| *at);
    let mut shards: Vec<u32> = identifies.iter().map(|(id, _)| *id).collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![0, 1, 2]);

    for pair in identifies.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= Duration::from_millis(180), "handshakes only {gap:?} apart");
    }

    assert_eq!(
        orchestrator.eval_on(0, "this.connectedShards").await.unwrap(),
        json!(3)
    );

    orchestrator.shutdown().await;
}
