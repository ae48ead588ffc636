// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Inbound Envelope Handler
//!
//! Receiving side of the routing port. Every envelope from a peer is verified
//! by the [`EnvelopeSecurity`] boundary first, then either binds a run
//! (`RUN_BOOTSTRAP`) or is fenced against the [`RunBindings`] table before it
//! reaches the local agent runtime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::run_version_fence::{FenceError, RunVersionFence, RunVersionResolver};
use crate::domain::dispatch::{
    ErrorCode, InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent,
};
use crate::domain::envelope::{
    Envelope, EnvelopeKind, EnvelopeSecurity, RemoteAck, RunBootstrapPayload, SignedEnvelope,
};
use crate::domain::peer::NodeId;
use crate::domain::run::{RunId, RunVersion};
use crate::domain::runtime::{LocalMemberRuntime, RunContext};
use crate::domain::team::TeamDefinitionId;

// ============================================================================
// Run bindings
// ============================================================================

/// A remote run incarnation this node has been bootstrapped for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBinding {
    pub run_id: RunId,
    pub run_version: RunVersion,
    pub team_definition_id: TeamDefinitionId,
    pub owner_node_id: NodeId,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
    Rebound { previous: RunVersion },
    Stale { current: RunVersion },
}

#[derive(Default)]
pub struct RunBindings {
    bindings: RwLock<HashMap<RunId, RunBinding>>,
}

impl RunBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// What binding `run_id` at `run_version` would do, without binding.
    pub fn classify(&self, run_id: RunId, run_version: RunVersion) -> BindOutcome {
        match self.bindings.read().get(&run_id) {
            None => BindOutcome::Bound,
            Some(existing) if existing.run_version == run_version => BindOutcome::AlreadyBound,
            Some(existing) if existing.run_version > run_version => BindOutcome::Stale {
                current: existing.run_version,
            },
            Some(existing) => BindOutcome::Rebound {
                previous: existing.run_version,
            },
        }
    }

    pub fn bind(&self, binding: RunBinding) -> BindOutcome {
        let mut bindings = self.bindings.write();
        let outcome = match bindings.get(&binding.run_id) {
            None => BindOutcome::Bound,
            Some(existing) if existing.run_version == binding.run_version => {
                return BindOutcome::AlreadyBound
            }
            Some(existing) if existing.run_version > binding.run_version => {
                return BindOutcome::Stale {
                    current: existing.run_version,
                }
            }
            Some(existing) => BindOutcome::Rebound {
                previous: existing.run_version,
            },
        };
        bindings.insert(binding.run_id, binding);
        outcome
    }

    pub fn unbind(&self, run_id: RunId) -> Option<RunBinding> {
        self.bindings.write().remove(&run_id)
    }

    pub fn get(&self, run_id: RunId) -> Option<RunBinding> {
        self.bindings.read().get(&run_id).cloned()
    }

    pub fn list(&self) -> Vec<RunBinding> {
        let mut bindings: Vec<_> = self.bindings.read().values().cloned().collect();
        bindings.sort_by(|a, b| a.bound_at.cmp(&b.bound_at));
        bindings
    }
}

#[async_trait]
impl RunVersionResolver for RunBindings {
    async fn current_run_version(&self, run_id: RunId) -> Option<RunVersion> {
        self.bindings.read().get(&run_id).map(|binding| binding.run_version)
    }
}

// ============================================================================
// Handler
// ============================================================================

pub struct InboundEnvelopeHandler {
    security: Arc<dyn EnvelopeSecurity>,
    bindings: Arc<RunBindings>,
    fence: RunVersionFence,
    runtime: Arc<dyn LocalMemberRuntime>,
}

impl InboundEnvelopeHandler {
    pub fn new(
        security: Arc<dyn EnvelopeSecurity>,
        bindings: Arc<RunBindings>,
        runtime: Arc<dyn LocalMemberRuntime>,
    ) -> Self {
        Self {
            security,
            fence: RunVersionFence::new(bindings.clone()),
            bindings,
            runtime,
        }
    }

    pub fn bindings(&self) -> &RunBindings {
        &self.bindings
    }

    pub async fn handle(&self, signed: SignedEnvelope) -> RemoteAck {
        if let Err(e) = self.security.verify(&signed) {
            warn!(sender = %signed.sender_node_id, error = %e, "Rejected inbound envelope");
            metrics::counter!("teamgrid_envelopes_rejected_total").increment(1);
            return RemoteAck::rejected(ErrorCode::EnvelopeRejected, e.to_string());
        }

        let envelope = &signed.envelope;
        metrics::counter!("teamgrid_envelopes_received_total", "kind" => kind_label(envelope.kind))
            .increment(1);
        debug!(
            sender = %signed.sender_node_id,
            run_id = %envelope.run_id,
            run_version = envelope.run_version,
            kind = kind_label(envelope.kind),
            "Inbound envelope"
        );

        match envelope.kind {
            EnvelopeKind::RunBootstrap => self.bootstrap(&signed.sender_node_id, envelope).await,
            EnvelopeKind::UserMessage => {
                self.deliver::<UserMessageEvent, _, _>(envelope, |run, event| async move {
                    self.runtime.deliver_user_message(run, &event).await
                })
                .await
            }
            EnvelopeKind::InterAgentMessage => {
                self.deliver::<InterAgentMessageEvent, _, _>(envelope, |run, event| async move {
                    self.runtime.deliver_inter_agent_message(run, &event).await
                })
                .await
            }
            EnvelopeKind::ToolApproval => {
                self.deliver::<ToolApprovalEvent, _, _>(envelope, |run, event| async move {
                    self.runtime.deliver_tool_approval(run, &event).await
                })
                .await
            }
            EnvelopeKind::ControlStop => self.stop(envelope).await,
        }
    }

    async fn bootstrap(&self, sender: &NodeId, envelope: &Envelope) -> RemoteAck {
        let payload: RunBootstrapPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                return RemoteAck::rejected(
                    ErrorCode::InvalidRequest,
                    format!("Malformed bootstrap payload: {e}"),
                )
            }
        };
        let run = RunContext {
            run_id: envelope.run_id,
            run_version: envelope.run_version,
        };

        match self.bindings.classify(run.run_id, run.run_version) {
            BindOutcome::AlreadyBound => {
                debug!(run_id = %run.run_id, "Run already bound");
                return RemoteAck::already_bound();
            }
            BindOutcome::Stale { current } => {
                warn!(
                    run_id = %run.run_id,
                    claimed = run.run_version,
                    current,
                    "Rejected bootstrap for superseded run version"
                );
                return RemoteAck::rejected(
                    ErrorCode::StaleRunVersion,
                    format!(
                        "Run {} is bound at version {current}, bootstrap carries {}",
                        run.run_id, run.run_version
                    ),
                );
            }
            BindOutcome::Rebound { previous } => {
                info!(run_id = %run.run_id, previous, next = run.run_version, "Rebinding run to newer version");
                let previous_run = RunContext {
                    run_id: run.run_id,
                    run_version: previous,
                };
                if let Err(e) = self.runtime.stop_run(previous_run).await {
                    warn!(run_id = %run.run_id, error = %e, "Failed to stop previous run incarnation");
                }
            }
            BindOutcome::Bound => {}
        }

        if let Err(e) = self.runtime.prepare_run(run, &payload).await {
            warn!(run_id = %run.run_id, error = %e, "Local runtime refused bootstrap");
            return RemoteAck::rejected(ErrorCode::DispatchFailed, e.to_string());
        }

        let outcome = self.bindings.bind(RunBinding {
            run_id: run.run_id,
            run_version: run.run_version,
            team_definition_id: payload.team_definition_id.clone(),
            owner_node_id: sender.clone(),
            bound_at: Utc::now(),
        });
        info!(
            run_id = %run.run_id,
            run_version = run.run_version,
            team_definition_id = %payload.team_definition_id,
            owner = %sender,
            members = payload.member_configs.len(),
            outcome = ?outcome,
            "Bound remote run"
        );
        RemoteAck::accepted()
    }

    async fn deliver<T, F, Fut>(&self, envelope: &Envelope, deliver: F) -> RemoteAck
    where
        T: serde::de::DeserializeOwned,
        F: FnOnce(RunContext, T) -> Fut,
        Fut: std::future::Future<Output = Result<(), crate::domain::runtime::RuntimeError>>,
    {
        if let Err(e) = self.fence.check(envelope.run_id, envelope.run_version).await {
            return fence_rejection(e);
        }
        let event: T = match envelope.payload_as() {
            Ok(event) => event,
            Err(e) => {
                return RemoteAck::rejected(
                    ErrorCode::InvalidRequest,
                    format!("Malformed {} payload: {e}", kind_label(envelope.kind)),
                )
            }
        };

        let run = RunContext {
            run_id: envelope.run_id,
            run_version: envelope.run_version,
        };
        match deliver(run, event).await {
            Ok(()) => RemoteAck::accepted(),
            Err(e) => RemoteAck::rejected(ErrorCode::DispatchFailed, e.to_string()),
        }
    }

    async fn stop(&self, envelope: &Envelope) -> RemoteAck {
        match self.fence.check(envelope.run_id, envelope.run_version).await {
            Ok(_) => {}
            Err(FenceError::RunNotBound(_)) => {
                debug!(run_id = %envelope.run_id, "Stop for unbound run, nothing to do");
                return RemoteAck::accepted();
            }
            Err(e) => return fence_rejection(e),
        }

        let run = RunContext {
            run_id: envelope.run_id,
            run_version: envelope.run_version,
        };
        if let Err(e) = self.runtime.stop_run(run).await {
            warn!(run_id = %run.run_id, error = %e, "Local runtime failed to stop run");
            return RemoteAck::rejected(ErrorCode::DispatchFailed, e.to_string());
        }
        self.bindings.unbind(run.run_id);
        info!(run_id = %run.run_id, run_version = run.run_version, "Unbound remote run");
        RemoteAck::accepted()
    }
}

fn fence_rejection(error: FenceError) -> RemoteAck {
    RemoteAck::rejected(error.code(), error.to_string())
}

fn kind_label(kind: EnvelopeKind) -> &'static str {
    match kind {
        EnvelopeKind::RunBootstrap => "RUN_BOOTSTRAP",
        EnvelopeKind::UserMessage => "USER_MESSAGE",
        EnvelopeKind::InterAgentMessage => "INTER_AGENT_MESSAGE",
        EnvelopeKind::ToolApproval => "TOOL_APPROVAL",
        EnvelopeKind::ControlStop => "CONTROL_STOP",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::routing_port::testing::RecordingRuntime;
    use crate::domain::envelope::EnvelopeSecurityError;
    use crate::domain::run::PlacementByMember;
    use std::collections::BTreeMap;

    struct AllowAll;

    impl EnvelopeSecurity for AllowAll {
        fn seal(&self, envelope: Envelope) -> Result<SignedEnvelope, EnvelopeSecurityError> {
            Ok(SignedEnvelope {
                envelope,
                sender_node_id: NodeId::new("node-a"),
                key_id: None,
                signature: None,
            })
        }

        fn verify(&self, signed: &SignedEnvelope) -> Result<(), EnvelopeSecurityError> {
            if signed.sender_node_id.as_str() == "intruder" {
                return Err(EnvelopeSecurityError::SenderNotAllowed(signed.sender_node_id.clone()));
            }
            Ok(())
        }
    }

    fn handler() -> (InboundEnvelopeHandler, Arc<RecordingRuntime>) {
        let runtime = Arc::new(RecordingRuntime::default());
        let handler = InboundEnvelopeHandler::new(
            Arc::new(AllowAll),
            Arc::new(RunBindings::new()),
            runtime.clone(),
        );
        (handler, runtime)
    }

    fn signed<T: Serialize>(run_id: RunId, version: RunVersion, kind: EnvelopeKind, payload: &T) -> SignedEnvelope {
        AllowAll
            .seal(Envelope::new(run_id, version, kind, payload).unwrap())
            .unwrap()
    }

    fn bootstrap_payload() -> RunBootstrapPayload {
        RunBootstrapPayload {
            team_definition_id: TeamDefinitionId::new("support"),
            coordinator_member_name: Some("lead".to_string()),
            placement_by_member: PlacementByMember::new(BTreeMap::from([(
                "helper".to_string(),
                NodeId::new("node-b"),
            )])),
            member_configs: vec![],
        }
    }

    fn message() -> UserMessageEvent {
        UserMessageEvent {
            target_member_name: "helper".to_string(),
            content: "hi".to_string(),
            sender_id: None,
            attachments: vec![],
        }
    }

    #[tokio::test]
    async fn bootstrap_binds_once_and_fences_versions() {
        let (handler, _) = handler();
        let run = RunId::new();

        let first = handler.handle(signed(run, 2, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        assert!(first.accepted && !first.already_bound);

        let repeat = handler.handle(signed(run, 2, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        assert!(repeat.accepted && repeat.already_bound);

        let older = handler.handle(signed(run, 1, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        assert_eq!(older.error_code, Some(ErrorCode::StaleRunVersion));

        let newer = handler.handle(signed(run, 3, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        assert!(newer.accepted);
        assert_eq!(handler.bindings().get(run).unwrap().run_version, 3);
    }

    #[tokio::test]
    async fn commands_are_fenced_by_binding() {
        let (handler, runtime) = handler();
        let run = RunId::new();

        let unbound = handler.handle(signed(run, 1, EnvelopeKind::UserMessage, &message())).await;
        assert_eq!(unbound.error_code, Some(ErrorCode::RunNotBound));

        handler.handle(signed(run, 1, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        let stale = handler.handle(signed(run, 2, EnvelopeKind::UserMessage, &message())).await;
        assert_eq!(stale.error_code, Some(ErrorCode::StaleRunVersion));

        let delivered = handler.handle(signed(run, 1, EnvelopeKind::UserMessage, &message())).await;
        assert!(delivered.accepted);
        assert_eq!(*runtime.delivered.lock(), vec!["user:helper".to_string()]);

        let malformed = handler
            .handle(signed(run, 1, EnvelopeKind::ToolApproval, &serde_json::json!({"x": 1})))
            .await;
        assert_eq!(malformed.error_code, Some(ErrorCode::InvalidRequest));
    }

    #[tokio::test]
    async fn stop_unbinds_and_tolerates_unknown_runs() {
        let (handler, runtime) = handler();
        let run = RunId::new();

        let noop = handler.handle(signed(run, 1, EnvelopeKind::ControlStop, &serde_json::json!({}))).await;
        assert!(noop.accepted);
        assert!(runtime.stopped.lock().is_empty());

        handler.handle(signed(run, 1, EnvelopeKind::RunBootstrap, &bootstrap_payload())).await;
        let stopped = handler.handle(signed(run, 1, EnvelopeKind::ControlStop, &serde_json::json!({}))).await;
        assert!(stopped.accepted);
        assert_eq!(*runtime.stopped.lock(), vec![run]);
        assert!(handler.bindings().get(run).is_none());
    }

    #[tokio::test]
    async fn security_rejections_come_first() {
        let (handler, _) = handler();
        let mut envelope = signed(RunId::new(), 1, EnvelopeKind::RunBootstrap, &bootstrap_payload());
        envelope.sender_node_id = NodeId::new("intruder");

        let ack = handler.handle(envelope).await;
        assert_eq!(ack.error_code, Some(ErrorCode::EnvelopeRejected));
        assert!(handler.bindings().list().is_empty());
    }
}
