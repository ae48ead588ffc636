// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Routing Port
//!
//! One routing port exists per active run. It is the only component that knows
//! where a member lives and how to reach it: members placed on the local node
//! are handed to the [`LocalMemberRuntime`], everything else is wrapped in an
//! [`Envelope`] and sent through a [`RemoteDispatcher`] after the target node
//! has been bootstrapped for the run.
//!
//! Transport and remote-processing failures never escape as errors from
//! [`DistributedRoutingPort`]; they come back as non-accepted
//! [`DispatchResult`]s so the orchestrator's failure handling sees one shape.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::domain::dispatch::{
    DispatchResult, ErrorCode, InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent,
};
use crate::domain::envelope::{Envelope, EnvelopeKind, RemoteAck, RunBootstrapPayload};
use crate::domain::peer::NodeId;
use crate::domain::run::{PlacementByMember, RunId, RunVersion};
use crate::domain::runtime::{LocalMemberRuntime, RunContext, RuntimeError};
use crate::domain::team::TeamDefinitionId;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No reachable address known for node {0}")]
    UnknownNode(NodeId),

    #[error("Request to node {node_id} failed: {message}")]
    Unreachable { node_id: NodeId, message: String },

    #[error("Node {node_id} answered HTTP {status}: {message}")]
    Http {
        node_id: NodeId,
        status: u16,
        message: String,
    },

    #[error("Envelope security error: {0}")]
    Security(String),

    #[error("Malformed response from node {node_id}: {message}")]
    InvalidResponse { node_id: NodeId, message: String },
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Member '{0}' is not placed in this run")]
    UnknownMember(String),

    #[error("Bootstrap of node {node_id} rejected: {code}: {message}")]
    BootstrapRejected {
        node_id: NodeId,
        code: ErrorCode,
        message: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Failed to encode envelope payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RoutingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoutingError::BootstrapRejected { code, .. } => *code,
            RoutingError::UnknownMember(_) => ErrorCode::DispatchRejected,
            _ => ErrorCode::DispatchFailed,
        }
    }

    fn into_result(self) -> DispatchResult {
        DispatchResult::rejected(self.code(), self.to_string())
    }
}

// ============================================================================
// Capability traits
// ============================================================================

/// Sends a run-scoped envelope to a peer node.
#[async_trait]
pub trait RemoteDispatcher: Send + Sync {
    async fn send(&self, target: &NodeId, envelope: Envelope) -> Result<RemoteAck, TransportError>;
}

/// Makes sure a remote node has the run bound before commands reach it.
#[async_trait]
pub trait NodeReadinessEnsurer: Send + Sync {
    async fn ensure_node_ready(
        &self,
        target: &NodeId,
        run: RunContext,
        bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RoutingError>;

    /// Drop any readiness state kept for the run.
    fn forget_run(&self, run_id: RunId);

    /// Drop the readiness of one node, so the next command bootstraps it again.
    fn forget_node(&self, run_id: RunId, node_id: &NodeId);
}

#[async_trait]
pub trait RoutingPort: Send + Sync {
    async fn dispatch_user_message(
        &self,
        event: &UserMessageEvent,
    ) -> Result<DispatchResult, RoutingError>;

    async fn dispatch_inter_agent_message(
        &self,
        event: &InterAgentMessageEvent,
    ) -> Result<DispatchResult, RoutingError>;

    async fn dispatch_tool_approval(
        &self,
        event: &ToolApprovalEvent,
    ) -> Result<DispatchResult, RoutingError>;

    /// Stop the run on every node hosting at least one of its members.
    async fn dispatch_control_stop(&self) -> Result<DispatchResult, RoutingError>;

    /// Release per-run resources once the run is gone.
    fn dispose(&self) {}
}

/// Everything a routing port needs to know about its run.
#[derive(Debug, Clone)]
pub struct RoutingPortSpec {
    pub run_id: RunId,
    pub team_definition_id: TeamDefinitionId,
    pub run_version: RunVersion,
    pub local_node_id: NodeId,
    pub placement_by_member: PlacementByMember,
    pub bootstrap: RunBootstrapPayload,
}

pub trait RoutingPortFactory: Send + Sync {
    fn create(&self, spec: RoutingPortSpec) -> Arc<dyn RoutingPort>;
}

// ============================================================================
// Distributed implementation
// ============================================================================

pub struct DistributedRoutingPort {
    spec: RoutingPortSpec,
    dispatcher: Arc<dyn RemoteDispatcher>,
    readiness: Arc<dyn NodeReadinessEnsurer>,
    runtime: Arc<dyn LocalMemberRuntime>,
}

enum Target<'a> {
    Local,
    Remote(&'a NodeId),
}

impl DistributedRoutingPort {
    pub fn new(
        spec: RoutingPortSpec,
        dispatcher: Arc<dyn RemoteDispatcher>,
        readiness: Arc<dyn NodeReadinessEnsurer>,
        runtime: Arc<dyn LocalMemberRuntime>,
    ) -> Self {
        Self {
            spec,
            dispatcher,
            readiness,
            runtime,
        }
    }

    fn context(&self) -> RunContext {
        RunContext {
            run_id: self.spec.run_id,
            run_version: self.spec.run_version,
        }
    }

    fn target_for(&self, member: &str) -> Result<Target<'_>, RoutingError> {
        let node = self
            .spec
            .placement_by_member
            .node_for(member)
            .ok_or_else(|| RoutingError::UnknownMember(member.to_string()))?;
        if *node == self.spec.local_node_id {
            Ok(Target::Local)
        } else {
            Ok(Target::Remote(node))
        }
    }

    async fn send_remote<T: Serialize + Sync>(
        &self,
        node: &NodeId,
        kind: EnvelopeKind,
        payload: &T,
    ) -> Result<DispatchResult, RoutingError> {
        self.readiness
            .ensure_node_ready(node, self.context(), &self.spec.bootstrap)
            .await?;

        let envelope = Envelope::new(self.spec.run_id, self.spec.run_version, kind, payload)?;
        let mut ack = self.dispatcher.send(node, envelope.clone()).await?;
        if ack.error_code == Some(ErrorCode::RunNotBound) {
            // The node lost its binding, most likely through a restart.
            tracing::info!(
                run_id = %self.spec.run_id,
                node_id = %node,
                "Remote node no longer has the run bound; bootstrapping again"
            );
            self.readiness.forget_node(self.spec.run_id, node);
            self.readiness
                .ensure_node_ready(node, self.context(), &self.spec.bootstrap)
                .await?;
            ack = self.dispatcher.send(node, envelope).await?;
        }
        if !ack.accepted {
            tracing::warn!(
                run_id = %self.spec.run_id,
                node_id = %node,
                kind = ?kind,
                error_code = ?ack.error_code,
                "Remote node rejected envelope"
            );
        }
        Ok(ack.into())
    }

    fn local_result(result: Result<(), RuntimeError>) -> DispatchResult {
        match result {
            Ok(()) => DispatchResult::accepted(),
            Err(e) => DispatchResult::rejected(ErrorCode::DispatchFailed, e.to_string()),
        }
    }

    async fn stop_on(&self, node: &NodeId) -> DispatchResult {
        if *node == self.spec.local_node_id {
            return Self::local_result(self.runtime.stop_run(self.context()).await);
        }

        let sent = async {
            let envelope = Envelope::new(
                self.spec.run_id,
                self.spec.run_version,
                EnvelopeKind::ControlStop,
                &serde_json::json!({}),
            )?;
            Ok::<_, RoutingError>(self.dispatcher.send(node, envelope).await?)
        }
        .await;

        match sent {
            Ok(ack) => ack.into(),
            Err(e) => e.into_result(),
        }
    }
}

#[async_trait]
impl RoutingPort for DistributedRoutingPort {
    async fn dispatch_user_message(
        &self,
        event: &UserMessageEvent,
    ) -> Result<DispatchResult, RoutingError> {
        let result = match self.target_for(&event.target_member_name) {
            Ok(Target::Local) => {
                Self::local_result(self.runtime.deliver_user_message(self.context(), event).await)
            }
            Ok(Target::Remote(node)) => self
                .send_remote(node, EnvelopeKind::UserMessage, event)
                .await
                .unwrap_or_else(RoutingError::into_result),
            Err(e) => e.into_result(),
        };
        Ok(result)
    }

    async fn dispatch_inter_agent_message(
        &self,
        event: &InterAgentMessageEvent,
    ) -> Result<DispatchResult, RoutingError> {
        let result = match self.target_for(&event.recipient_member_name) {
            Ok(Target::Local) => Self::local_result(
                self.runtime
                    .deliver_inter_agent_message(self.context(), event)
                    .await,
            ),
            Ok(Target::Remote(node)) => self
                .send_remote(node, EnvelopeKind::InterAgentMessage, event)
                .await
                .unwrap_or_else(RoutingError::into_result),
            Err(e) => e.into_result(),
        };
        Ok(result)
    }

    async fn dispatch_tool_approval(
        &self,
        event: &ToolApprovalEvent,
    ) -> Result<DispatchResult, RoutingError> {
        let result = match self.target_for(&event.agent_name) {
            Ok(Target::Local) => Self::local_result(
                self.runtime
                    .deliver_tool_approval(self.context(), event)
                    .await,
            ),
            Ok(Target::Remote(node)) => self
                .send_remote(node, EnvelopeKind::ToolApproval, event)
                .await
                .unwrap_or_else(RoutingError::into_result),
            Err(e) => e.into_result(),
        };
        Ok(result)
    }

    async fn dispatch_control_stop(&self) -> Result<DispatchResult, RoutingError> {
        let mut failures = Vec::new();
        for node in self.spec.placement_by_member.hosting_nodes() {
            let result = self.stop_on(&node).await;
            if !result.accepted {
                failures.push(format!("{node}: {}", result.message_or_default()));
            }
        }

        if failures.is_empty() {
            Ok(DispatchResult::accepted())
        } else {
            Ok(DispatchResult::rejected(
                ErrorCode::StopDispatchFailed,
                failures.join("; "),
            ))
        }
    }

    fn dispose(&self) {
        self.readiness.forget_run(self.spec.run_id);
    }
}

/// Builds [`DistributedRoutingPort`]s sharing one set of adapters.
pub struct DistributedRoutingPortFactory {
    dispatcher: Arc<dyn RemoteDispatcher>,
    readiness: Arc<dyn NodeReadinessEnsurer>,
    runtime: Arc<dyn LocalMemberRuntime>,
}

impl DistributedRoutingPortFactory {
    pub fn new(
        dispatcher: Arc<dyn RemoteDispatcher>,
        readiness: Arc<dyn NodeReadinessEnsurer>,
        runtime: Arc<dyn LocalMemberRuntime>,
    ) -> Self {
        Self {
            dispatcher,
            readiness,
            runtime,
        }
    }
}

impl RoutingPortFactory for DistributedRoutingPortFactory {
    fn create(&self, spec: RoutingPortSpec) -> Arc<dyn RoutingPort> {
        Arc::new(DistributedRoutingPort::new(
            spec,
            self.dispatcher.clone(),
            self.readiness.clone(),
            self.runtime.clone(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording doubles for the routing capability traits.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};

    #[derive(Default)]
    pub struct RecordingDispatcher {
        pub sent: Mutex<Vec<(NodeId, Envelope)>>,
        pub scripted: Mutex<VecDeque<Result<RemoteAck, String>>>,
    }

    impl RecordingDispatcher {
        pub fn kinds_sent_to(&self, node: &str) -> Vec<EnvelopeKind> {
            self.sent
                .lock()
                .iter()
                .filter(|(target, _)| target.as_str() == node)
                .map(|(_, envelope)| envelope.kind)
                .collect()
        }
    }

    #[async_trait]
    impl RemoteDispatcher for RecordingDispatcher {
        async fn send(&self, target: &NodeId, envelope: Envelope) -> Result<RemoteAck, TransportError> {
            self.sent.lock().push((target.clone(), envelope));
            match self.scripted.lock().pop_front() {
                None => Ok(RemoteAck::accepted()),
                Some(Ok(ack)) => Ok(ack),
                Some(Err(message)) => Err(TransportError::Unreachable {
                    node_id: target.clone(),
                    message,
                }),
            }
        }
    }

    #[derive(Default)]
    pub struct RecordingRuntime {
        pub delivered: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<RunId>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingRuntime {
        fn outcome(&self, label: String) -> Result<(), RuntimeError> {
            if *self.fail.lock() {
                return Err(RuntimeError::DeliveryFailed(label));
            }
            self.delivered.lock().push(label);
            Ok(())
        }
    }

    #[async_trait]
    impl LocalMemberRuntime for RecordingRuntime {
        async fn deliver_user_message(
            &self,
            _run: RunContext,
            event: &UserMessageEvent,
        ) -> Result<(), RuntimeError> {
            self.outcome(format!("user:{}", event.target_member_name))
        }

        async fn deliver_inter_agent_message(
            &self,
            _run: RunContext,
            event: &InterAgentMessageEvent,
        ) -> Result<(), RuntimeError> {
            self.outcome(format!("agent:{}", event.recipient_member_name))
        }

        async fn deliver_tool_approval(
            &self,
            _run: RunContext,
            event: &ToolApprovalEvent,
        ) -> Result<(), RuntimeError> {
            self.outcome(format!("approval:{}", event.invocation_id))
        }

        async fn stop_run(&self, run: RunContext) -> Result<(), RuntimeError> {
            self.stopped.lock().push(run.run_id);
            Ok(())
        }
    }

    /// Sends one bootstrap per (run, node) through the wrapped dispatcher.
    pub struct OnceReadiness {
        pub dispatcher: Arc<RecordingDispatcher>,
        pub ready: Mutex<HashSet<(RunId, NodeId)>>,
    }

    #[async_trait]
    impl NodeReadinessEnsurer for OnceReadiness {
        async fn ensure_node_ready(
            &self,
            target: &NodeId,
            run: RunContext,
            bootstrap: &RunBootstrapPayload,
        ) -> Result<(), RoutingError> {
            if self.ready.lock().contains(&(run.run_id, target.clone())) {
                return Ok(());
            }
            let envelope = Envelope::new(
                run.run_id,
                run.run_version,
                EnvelopeKind::RunBootstrap,
                bootstrap,
            )?;
            self.dispatcher.send(target, envelope).await?;
            self.ready.lock().insert((run.run_id, target.clone()));
            Ok(())
        }

        fn forget_run(&self, run_id: RunId) {
            self.ready.lock().retain(|(run, _)| *run != run_id);
        }

        fn forget_node(&self, run_id: RunId, node_id: &NodeId) {
            self.ready.lock().remove(&(run_id, node_id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::domain::team::fixtures::{agent, team};
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashSet};

    struct Fixture {
        port: DistributedRoutingPort,
        dispatcher: Arc<RecordingDispatcher>,
        runtime: Arc<RecordingRuntime>,
    }

    fn fixture() -> Fixture {
        let definition = team(
            "t",
            "lead",
            vec![agent("lead", None), agent("helper", Some("node-b"))],
        );
        let placement = PlacementByMember::new(BTreeMap::from([
            ("lead".to_string(), NodeId::new("node-a")),
            ("helper".to_string(), NodeId::new("node-b")),
        ]));
        let spec = RoutingPortSpec {
            run_id: RunId::new(),
            team_definition_id: definition.id.clone(),
            run_version: 1,
            local_node_id: NodeId::new("node-a"),
            bootstrap: RunBootstrapPayload::from_definition(&definition, &placement),
            placement_by_member: placement,
        };
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let runtime = Arc::new(RecordingRuntime::default());
        let readiness = Arc::new(OnceReadiness {
            dispatcher: dispatcher.clone(),
            ready: Mutex::new(HashSet::new()),
        });
        Fixture {
            port: DistributedRoutingPort::new(spec, dispatcher.clone(), readiness, runtime.clone()),
            dispatcher,
            runtime,
        }
    }

    fn message(target: &str) -> UserMessageEvent {
        UserMessageEvent {
            target_member_name: target.to_string(),
            content: "hello".to_string(),
            sender_id: None,
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn local_members_use_the_runtime() {
        let f = fixture();
        let result = f.port.dispatch_user_message(&message("lead")).await.unwrap();

        assert!(result.accepted);
        assert_eq!(*f.runtime.delivered.lock(), vec!["user:lead".to_string()]);
        assert!(f.dispatcher.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn remote_members_are_bootstrapped_once() {
        let f = fixture();
        f.port.dispatch_user_message(&message("helper")).await.unwrap();
        f.port
            .dispatch_inter_agent_message(&InterAgentMessageEvent {
                sender_member_name: "lead".to_string(),
                recipient_member_name: "helper".to_string(),
                content: "ping".to_string(),
                message_type: "message".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            f.dispatcher.kinds_sent_to("node-b"),
            vec![
                EnvelopeKind::RunBootstrap,
                EnvelopeKind::UserMessage,
                EnvelopeKind::InterAgentMessage
            ]
        );

        let sent = f.dispatcher.sent.lock();
        let bootstrap: RunBootstrapPayload = sent[0].1.payload_as().unwrap();
        assert_eq!(bootstrap.member_configs.len(), 1);
        assert_eq!(bootstrap.member_configs[0].route_key, "helper");
    }

    #[tokio::test]
    async fn transport_and_runtime_failures_become_results() {
        let f = fixture();
        f.dispatcher
            .scripted
            .lock()
            .extend([Ok(RemoteAck::accepted()), Err("connection refused".to_string())]);

        let remote = f.port.dispatch_user_message(&message("helper")).await.unwrap();
        assert_eq!(remote.error_code, Some(ErrorCode::DispatchFailed));

        *f.runtime.fail.lock() = true;
        let local = f.port.dispatch_user_message(&message("lead")).await.unwrap();
        assert_eq!(local.error_code, Some(ErrorCode::DispatchFailed));

        let unknown = f.port.dispatch_user_message(&message("nobody")).await.unwrap();
        assert_eq!(unknown.error_code, Some(ErrorCode::DispatchRejected));
    }

    #[tokio::test]
    async fn remote_rejection_is_preserved() {
        let f = fixture();
        f.dispatcher.scripted.lock().extend([
            Ok(RemoteAck::accepted()),
            Ok(RemoteAck::rejected(ErrorCode::StaleRunVersion, "old")),
        ]);

        let result = f.port.dispatch_user_message(&message("helper")).await.unwrap();
        assert!(!result.accepted);
        assert_eq!(result.error_code, Some(ErrorCode::StaleRunVersion));
    }

    #[tokio::test]
    async fn unbound_remote_node_is_bootstrapped_again() {
        let f = fixture();
        f.port.dispatch_user_message(&message("helper")).await.unwrap();

        f.dispatcher.scripted.lock().push_back(Ok(RemoteAck::rejected(
            ErrorCode::RunNotBound,
            "no binding",
        )));
        let result = f.port.dispatch_user_message(&message("helper")).await.unwrap();

        assert!(result.accepted);
        assert_eq!(
            f.dispatcher.kinds_sent_to("node-b"),
            vec![
                EnvelopeKind::RunBootstrap,
                EnvelopeKind::UserMessage,
                EnvelopeKind::UserMessage,
                EnvelopeKind::RunBootstrap,
                EnvelopeKind::UserMessage
            ]
        );
    }

    #[tokio::test]
    async fn control_stop_reaches_every_hosting_node() {
        let f = fixture();
        let result = f.port.dispatch_control_stop().await.unwrap();

        assert!(result.accepted);
        assert_eq!(f.runtime.stopped.lock().len(), 1);
        assert_eq!(f.dispatcher.kinds_sent_to("node-b"), vec![EnvelopeKind::ControlStop]);

        f.dispatcher
            .scripted
            .lock()
            .push_back(Err("down".to_string()));
        let failed = f.port.dispatch_control_stop().await.unwrap();
        assert_eq!(failed.error_code, Some(ErrorCode::StopDispatchFailed));
    }
}
