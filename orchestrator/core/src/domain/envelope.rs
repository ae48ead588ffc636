// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Node-to-Node Envelopes
//!
//! Wire format for run-scoped commands exchanged between nodes.
//!
//! ```text
//! owner node                                   member-hosting node
//!   RoutingPort ── RUN_BOOTSTRAP (once) ──────▶ InboundEnvelopeHandler ─▶ bind run
//!               ── USER_MESSAGE / ... ───────▶   fence(run_version) ──▶ local runtime
//!               ── CONTROL_STOP ─────────────▶   unbind + stop
//! ```
//!
//! Envelopes travel inside a [`SignedEnvelope`]; whether the signature fields
//! are populated depends on the sender's [`crate::domain::peer::TrustMode`].

use serde::{Deserialize, Serialize};

use crate::domain::dispatch::{DispatchResult, ErrorCode};
use crate::domain::peer::NodeId;
use crate::domain::run::{PlacementByMember, RunId, RunVersion};
use crate::domain::team::{TeamDefinition, TeamDefinitionId, TeamMember};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    RunBootstrap,
    UserMessage,
    InterAgentMessage,
    ToolApproval,
    ControlStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub run_id: RunId,
    pub run_version: RunVersion,
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(
        run_id: RunId,
        run_version: RunVersion,
        kind: EnvelopeKind,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            run_id,
            run_version,
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Envelope plus transport-security metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedEnvelope {
    pub envelope: Envelope,
    pub sender_node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Runtime configuration for one member, shipped on bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberConfigSnapshot {
    pub route_key: String,
    pub agent_definition_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Everything a node needs to recreate its share of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBootstrapPayload {
    pub team_definition_id: TeamDefinitionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_member_name: Option<String>,
    pub placement_by_member: PlacementByMember,
    pub member_configs: Vec<MemberConfigSnapshot>,
}

impl RunBootstrapPayload {
    /// Bootstrap payload for the agent members of `definition`.
    pub fn from_definition(definition: &TeamDefinition, placement: &PlacementByMember) -> Self {
        let member_configs = definition
            .flatten_members()
            .into_iter()
            .filter_map(|entry| match entry.member {
                TeamMember::Agent(agent) => Some(MemberConfigSnapshot {
                    route_key: entry.route_key,
                    agent_definition_id: agent.agent_definition_id.clone(),
                    config: agent.config.clone(),
                }),
                TeamMember::SubTeam(_) => None,
            })
            .collect();

        Self {
            team_definition_id: definition.id.clone(),
            coordinator_member_name: definition.resolve_coordinator(),
            placement_by_member: placement.clone(),
            member_configs,
        }
    }

    /// Copy restricted to the members hosted on `node_id`.
    pub fn for_node(&self, node_id: &NodeId) -> Self {
        let hosted = self.placement_by_member.members_on(node_id);
        Self {
            member_configs: self
                .member_configs
                .iter()
                .filter(|member| hosted.contains(&member.route_key))
                .cloned()
                .collect(),
            ..self.clone()
        }
    }
}

/// Reply to an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAck {
    pub accepted: bool,
    /// Set on a bootstrap reply when the run was bound before this envelope.
    #[serde(default)]
    pub already_bound: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RemoteAck {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            already_bound: false,
            error_code: None,
            error_message: None,
        }
    }

    pub fn already_bound() -> Self {
        Self {
            already_bound: true,
            ..Self::accepted()
        }
    }

    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            already_bound: false,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }
}

impl From<RemoteAck> for DispatchResult {
    fn from(ack: RemoteAck) -> Self {
        if ack.accepted {
            DispatchResult::accepted()
        } else {
            DispatchResult {
                accepted: false,
                error_code: Some(ack.error_code.unwrap_or(ErrorCode::DispatchRejected)),
                error_message: Some(
                    ack.error_message
                        .unwrap_or_else(|| "remote node rejected the envelope".to_string()),
                ),
            }
        }
    }
}

/// Transport-security boundary for node-to-node envelopes.
pub trait EnvelopeSecurity: Send + Sync {
    /// Wrap an outgoing envelope, signing it when the trust mode requires.
    fn seal(&self, envelope: Envelope) -> Result<SignedEnvelope, EnvelopeSecurityError>;

    /// Check an incoming envelope before anything else touches it.
    fn verify(&self, signed: &SignedEnvelope) -> Result<(), EnvelopeSecurityError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeSecurityError {
    #[error("Envelope is not signed")]
    MissingSignature,

    #[error("Unknown signing key '{0}'")]
    UnknownKey(String),

    #[error("Sender {0} is not allowed to send envelopes")]
    SenderNotAllowed(NodeId),

    #[error("Envelope signature does not verify")]
    InvalidSignature,

    #[error("Signing is not configured: {0}")]
    NotConfigured(String),

    #[error("Envelope encoding failed: {0}")]
    Encoding(String),
}
