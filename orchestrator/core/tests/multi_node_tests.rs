// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end tests with two nodes talking over real HTTP.
//!
//! Node A owns the runs (its team definitions and ingress are used), node B
//! hosts the `helper` member. Both serve the full axum router on an
//! ephemeral localhost port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;

use teamgrid_core::application::command_ingress::ToolApprovalCommand;
use teamgrid_core::domain::dispatch::{
    ErrorCode, InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent,
};
use teamgrid_core::domain::envelope::RunBootstrapPayload;
use teamgrid_core::domain::events::RunEvent;
use teamgrid_core::domain::node_config::{NodeConfigManifest, StaticPeerConfig};
use teamgrid_core::domain::peer::{NodeId, PeerCapabilities, PeerStatus, TrustMode};
use teamgrid_core::domain::runtime::{LocalMemberRuntime, RunContext, RuntimeError};
use teamgrid_core::domain::team::TeamDefinition;
use teamgrid_core::infrastructure::event_bus::DomainEvent;
use teamgrid_core::TeamgridNode;

#[derive(Default)]
struct RecordingRuntime {
    prepared: Mutex<Vec<RunContext>>,
    delivered: Mutex<Vec<String>>,
    stopped: Mutex<Vec<RunContext>>,
    fail_deliveries: AtomicBool,
    approval_delay_ms: AtomicU64,
}

impl RecordingRuntime {
    fn record(&self, label: String) -> Result<(), RuntimeError> {
        if self.fail_deliveries.load(Ordering::SeqCst) {
            return Err(RuntimeError::DeliveryFailed(label));
        }
        self.delivered.lock().push(label);
        Ok(())
    }
}

#[async_trait]
impl LocalMemberRuntime for RecordingRuntime {
    async fn prepare_run(
        &self,
        run: RunContext,
        _bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RuntimeError> {
        self.prepared.lock().push(run);
        Ok(())
    }

    async fn deliver_user_message(
        &self,
        _run: RunContext,
        event: &UserMessageEvent,
    ) -> Result<(), RuntimeError> {
        self.record(format!("user:{}:{}", event.target_member_name, event.content))
    }

    async fn deliver_inter_agent_message(
        &self,
        _run: RunContext,
        event: &InterAgentMessageEvent,
    ) -> Result<(), RuntimeError> {
        self.record(format!(
            "agent:{}->{}",
            event.sender_member_name, event.recipient_member_name
        ))
    }

    async fn deliver_tool_approval(
        &self,
        _run: RunContext,
        event: &ToolApprovalEvent,
    ) -> Result<(), RuntimeError> {
        let delay = self.approval_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record(format!("approval:{}:{}", event.agent_name, event.is_approved))
    }

    async fn stop_run(&self, run: RunContext) -> Result<(), RuntimeError> {
        self.stopped.lock().push(run);
        Ok(())
    }
}

struct RunningNode {
    node: Arc<TeamgridNode>,
    runtime: Arc<RecordingRuntime>,
    base_url: String,
}

fn research_team() -> TeamDefinition {
    serde_json::from_value(json!({
        "id": "research",
        "name": "Research",
        "coordinator_member_name": "lead",
        "members": [
            {"kind": "agent", "member_name": "lead", "agent_definition_id": "planner", "home_node_id": "node-a"},
            {"kind": "agent", "member_name": "helper", "agent_definition_id": "reader", "home_node_id": "node-b"}
        ]
    }))
    .unwrap()
}

fn strict(config: &mut NodeConfigManifest, peer: &str) {
    config.spec.transport.trust_mode = TrustMode::StrictSigned;
    config.spec.transport.key_id = Some("k1".to_string());
    config.spec.transport.shared_secrets =
        HashMap::from([("k1".to_string(), "integration-shared-secret".to_string())]);
    config.spec.transport.allowed_node_ids = vec![peer.to_string()];
}

async fn spawn_node(
    id: &str,
    configure: impl FnOnce(&mut NodeConfigManifest),
) -> RunningNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let mut config = NodeConfigManifest::default();
    config.spec.node.id = id.to_string();
    config.spec.node.base_url = base_url.clone();
    configure(&mut config);
    config.validate().unwrap();

    let runtime = Arc::new(RecordingRuntime::default());
    let node = Arc::new(TeamgridNode::build_with_runtime(config, runtime.clone()).unwrap());
    let app = node.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    RunningNode {
        node,
        runtime,
        base_url,
    }
}

/// Node B first, then node A with B as a static peer.
async fn spawn_pair(strict_signed: bool) -> (RunningNode, RunningNode) {
    let b = spawn_node("node-b", |config| {
        if strict_signed {
            strict(config, "node-a");
        }
    })
    .await;
    let b_url = b.base_url.clone();
    let a = spawn_node("node-a", move |config| {
        config.spec.teams = vec![research_team()];
        config.spec.discovery.static_peers = vec![StaticPeerConfig {
            node_id: "node-b".to_string(),
            node_name: None,
            base_url: b_url,
            advertised_base_url: None,
            capabilities: PeerCapabilities::default(),
        }];
        if strict_signed {
            strict(config, "node-b");
        }
    })
    .await;
    (a, b)
}

async fn post(url: String, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body = response.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn remote_member_is_bootstrapped_once_and_stopped_with_the_run() {
    let (a, b) = spawn_pair(false).await;

    let (status, receipt) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "find sources"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{receipt}");

    let (status, _) = post(
        format!("{}/api/teams/research/inter-agent-messages", a.base_url),
        json!({"senderMemberName": "lead", "recipientMemberName": "helper", "content": "and summarize"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"content": "status?"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    assert_eq!(b.runtime.prepared.lock().len(), 1);
    assert_eq!(
        *b.runtime.delivered.lock(),
        vec![
            "user:helper:find sources".to_string(),
            "agent:lead->helper".to_string()
        ]
    );
    assert_eq!(*a.runtime.delivered.lock(), vec!["user:lead:status?".to_string()]);

    let bindings = b.node.inbound.bindings().list();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].run_version, receipt["runVersion"].as_u64().unwrap());
    assert_eq!(bindings[0].owner_node_id.as_str(), "node-a");

    let (status, _) = post(format!("{}/api/teams/research/stop", a.base_url), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(a.runtime.stopped.lock().len(), 1);
    assert_eq!(b.runtime.stopped.lock().len(), 1);
    assert!(b.node.inbound.bindings().list().is_empty());

    // A new run gets a higher version and bootstraps node B again.
    let (status, receipt) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "again"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(receipt["runVersion"], 2);
    assert_eq!(b.runtime.prepared.lock().len(), 2);
}

#[tokio::test]
async fn strict_signed_nodes_reject_unsigned_envelopes() {
    let (a, b) = spawn_pair(true).await;

    let (status, receipt) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "signed hello"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{receipt}");
    assert_eq!(
        *b.runtime.delivered.lock(),
        vec!["user:helper:signed hello".to_string()]
    );

    let (status, ack) = post(
        format!("{}/api/internal/envelopes", b.base_url),
        json!({
            "envelope": {
                "runId": receipt["runId"],
                "runVersion": receipt["runVersion"],
                "kind": "USER_MESSAGE",
                "payload": {"targetMemberName": "helper", "content": "forged"}
            },
            "senderNodeId": "node-a"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(ack["errorCode"], "ENVELOPE_REJECTED");
    assert_eq!(b.runtime.delivered.lock().len(), 1);
}

#[tokio::test]
async fn repeated_remote_failures_degrade_then_auto_stop_the_run() {
    let (a, b) = spawn_pair(false).await;
    let mut events = a.node.event_bus.subscribe();

    let (status, _) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "warm up"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    b.runtime.fail_deliveries.store(true, Ordering::SeqCst);
    let mut codes = Vec::new();
    for attempt in 0..5 {
        let (status, body) = post(
            format!("{}/api/teams/research/messages", a.base_url),
            json!({"targetMemberName": "helper", "content": format!("attempt {attempt}")}),
        )
        .await;
        assert!(!status.is_success());
        codes.push(body["code"].as_str().unwrap_or_default().to_string());
    }

    assert_eq!(codes[..4], ["DISPATCH_FAILED"; 4]);
    assert_eq!(codes[4], "RUN_AUTO_STOPPED");
    assert_eq!(b.runtime.stopped.lock().len(), 1);

    let runs: serde_json::Value = reqwest::get(format!("{}/api/runs", a.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(runs, json!([]));

    let mut auto_stopped = false;
    let mut degraded = false;
    while let Ok(event) = events.try_recv() {
        match event {
            DomainEvent::Run(RunEvent::RunDegraded { .. }) => degraded = true,
            DomainEvent::Run(RunEvent::RunAutoStopped { .. }) => auto_stopped = true,
            _ => {}
        }
    }
    assert!(degraded);
    assert!(auto_stopped);
}

#[tokio::test]
async fn peer_sync_introduces_nodes_to_each_other() {
    let (a, b) = spawn_pair(false).await;
    let node_a = NodeId::new("node-a");
    assert!(b.node.registry.get(&node_a).is_none());

    a.node.peer_sync.run_round().await;
    let learned = b.node.registry.get(&node_a).unwrap();
    assert_eq!(learned.base_url, a.base_url);
    assert_eq!(learned.status, PeerStatus::Ready);

    b.node.peer_sync.run_round().await;
    let ids: Vec<String> = a
        .node
        .registry
        .peers()
        .into_iter()
        .map(|peer| peer.node_id.to_string())
        .collect();
    assert_eq!(ids, vec!["node-a", "node-b"]);
}

#[tokio::test]
async fn restarted_remote_node_is_bootstrapped_again() {
    let (a, b) = spawn_pair(false).await;

    let (status, receipt) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "first"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{receipt}");

    // Node B forgets the run as if it had restarted.
    let bindings = b.node.inbound.bindings().list();
    b.node.inbound.bindings().unbind(bindings[0].run_id);

    let (status, body) = post(
        format!("{}/api/teams/research/messages", a.base_url),
        json!({"targetMemberName": "helper", "content": "second"}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert_eq!(body["runVersion"], receipt["runVersion"]);
    assert_eq!(b.runtime.prepared.lock().len(), 2);
    assert_eq!(
        *b.runtime.delivered.lock(),
        vec!["user:helper:first".to_string(), "user:helper:second".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_approvals_apply_once() {
    let node = spawn_node("node-a", |config| {
        config.spec.teams = vec![research_team()];
    })
    .await;
    node.runtime.approval_delay_ms.store(50, Ordering::SeqCst);

    let token = node
        .node
        .ingress
        .issue_tool_approval_token("research", "inv-1", "lead", None)
        .await
        .unwrap();
    let command = ToolApprovalCommand {
        token,
        is_approved: true,
        reason: None,
        agent_name: None,
    };

    let first = {
        let ingress = node.node.ingress.clone();
        let command = command.clone();
        tokio::spawn(async move { ingress.dispatch_tool_approval("research", command).await })
    };
    let second = {
        let ingress = node.node.ingress.clone();
        let command = command.clone();
        tokio::spawn(async move { ingress.dispatch_tool_approval("research", command).await })
    };
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    let rejected = outcomes.iter().find_map(|outcome| outcome.as_ref().err()).unwrap();
    assert_eq!(rejected.code, ErrorCode::ApprovalInvocationNotPending);
    assert_eq!(
        *node.runtime.delivered.lock(),
        vec!["approval:lead:true".to_string()]
    );

    // The consumed token cannot be replayed afterwards either.
    let replay = node
        .node
        .ingress
        .dispatch_tool_approval("research", command)
        .await
        .unwrap_err();
    assert_eq!(replay.code, ErrorCode::ApprovalInvocationNotPending);
}
