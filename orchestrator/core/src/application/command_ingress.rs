// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command Ingress Gateway
//!
//! Validates and normalizes client commands before they reach the
//! [`RunOrchestrator`]. Validation failures are answered here and never touch
//! the orchestrator; non-accepted orchestrator results are raised as
//! [`IngressError`]s carrying the orchestrator's code and message.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::application::invocation_fence::{InvocationCheck, InvocationVersionFence};
use crate::application::run_orchestrator::RunOrchestrator;
use crate::domain::approval::{ApprovalToken, INITIAL_INVOCATION_VERSION};
use crate::domain::dispatch::{
    DispatchResult, ErrorCode, InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent,
};
use crate::domain::run::{RunId, RunVersion};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct IngressError {
    pub code: ErrorCode,
    pub message: String,
}

impl IngressError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn from_result(result: DispatchResult) -> Self {
        Self::new(result.code_or_default(), result.message_or_default())
    }
}

/// Where the active run of a client-facing team lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLocation {
    pub team_id: String,
    pub run_id: RunId,
    pub run_version: RunVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_member_name: Option<String>,
}

/// Maps client-facing team ids to runs.
#[async_trait]
pub trait RunLocator: Send + Sync {
    /// Resolve the active run for the team, starting one if none is active.
    async fn locate_or_start(&self, team_id: &str) -> Result<RunLocation, IngressError>;

    /// Resolve the active run for the team without starting one.
    async fn locate_active(&self, team_id: &str) -> Result<Option<RunLocation>, IngressError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageCommand {
    #[serde(default)]
    pub target_member_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterAgentMessageCommand {
    pub sender_member_name: String,
    #[serde(default)]
    pub recipient_member_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolApprovalCommand {
    pub token: ApprovalToken,
    pub is_approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Acknowledgement of a command accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub run_id: RunId,
    pub run_version: RunVersion,
    pub target_member_name: String,
}

pub struct CommandIngressGateway {
    orchestrator: Arc<RunOrchestrator>,
    locator: Arc<dyn RunLocator>,
    invocations: Arc<InvocationVersionFence>,
}

impl CommandIngressGateway {
    pub fn new(
        orchestrator: Arc<RunOrchestrator>,
        locator: Arc<dyn RunLocator>,
        invocations: Arc<InvocationVersionFence>,
    ) -> Self {
        Self {
            orchestrator,
            locator,
            invocations,
        }
    }

    pub async fn dispatch_user_message(
        &self,
        team_id: &str,
        command: UserMessageCommand,
    ) -> Result<DispatchReceipt, IngressError> {
        let location = self.locator.locate_or_start(team_id).await?;
        let target = resolve_target(command.target_member_name.as_deref(), &location)?;

        let event = UserMessageEvent {
            target_member_name: target.clone(),
            content: command.content,
            sender_id: command.sender_id,
            attachments: command.attachments,
        };
        let result = self
            .orchestrator
            .dispatch_user_message(location.run_id, event)
            .await;
        self.receipt(&location, target, result)
    }

    pub async fn dispatch_inter_agent_message(
        &self,
        team_id: &str,
        command: InterAgentMessageCommand,
    ) -> Result<DispatchReceipt, IngressError> {
        if command.sender_member_name.trim().is_empty() {
            return Err(IngressError::new(
                ErrorCode::InvalidRequest,
                "senderMemberName is required",
            ));
        }

        let location = self.locator.locate_or_start(team_id).await?;
        let target = resolve_target(command.recipient_member_name.as_deref(), &location)?;

        let mut event = InterAgentMessageEvent {
            sender_member_name: command.sender_member_name,
            recipient_member_name: target.clone(),
            content: command.content,
            message_type: "message".to_string(),
        };
        if let Some(message_type) = command.message_type.filter(|t| !t.trim().is_empty()) {
            event.message_type = message_type;
        }

        let result = self
            .orchestrator
            .dispatch_inter_agent_message(location.run_id, event)
            .await;
        self.receipt(&location, target, result)
    }

    /// Issue an approval token and register the invocation as pending.
    pub async fn issue_tool_approval_token(
        &self,
        team_id: &str,
        invocation_id: &str,
        target_member_name: &str,
        invocation_version: Option<u64>,
    ) -> Result<ApprovalToken, IngressError> {
        if invocation_id.trim().is_empty() || target_member_name.trim().is_empty() {
            return Err(IngressError::new(
                ErrorCode::InvalidRequest,
                "invocationId and targetMemberName are required",
            ));
        }
        let invocation_version = invocation_version.unwrap_or(INITIAL_INVOCATION_VERSION);
        if invocation_version == 0 {
            return Err(IngressError::new(
                ErrorCode::InvalidRequest,
                "invocationVersion must be a positive integer",
            ));
        }

        let location = self.locator.locate_or_start(team_id).await?;
        let token = ApprovalToken {
            run_id: location.run_id,
            run_version: location.run_version,
            invocation_id: invocation_id.to_string(),
            invocation_version,
            target_member_name: target_member_name.to_string(),
        };
        self.invocations
            .register(token.run_id, &token.invocation_id, token.invocation_version);

        debug!(
            team_id,
            run_id = %token.run_id,
            invocation_id,
            invocation_version,
            "Issued tool approval token"
        );
        Ok(token)
    }

    pub async fn dispatch_tool_approval(
        &self,
        team_id: &str,
        command: ToolApprovalCommand,
    ) -> Result<DispatchReceipt, IngressError> {
        let location = self.locator.locate_active(team_id).await?.ok_or_else(|| {
            IngressError::new(
                ErrorCode::TeamRunNotFound,
                format!("No active run for team {team_id}"),
            )
        })?;

        let token = &command.token;
        if token.target_member_name.trim().is_empty() || token.invocation_id.trim().is_empty() {
            return Err(IngressError::new(
                ErrorCode::InvalidRequest,
                "approval token requires targetMemberName and invocationId",
            ));
        }
        if token.run_version == 0 || token.invocation_version == 0 {
            return Err(IngressError::new(
                ErrorCode::InvalidRequest,
                "approval token versions must be positive integers",
            ));
        }
        if token.run_id != location.run_id || token.run_version != location.run_version {
            return Err(IngressError::new(
                ErrorCode::StaleApprovalToken,
                format!(
                    "Token targets run {} v{}, active run is {} v{}",
                    token.run_id, token.run_version, location.run_id, location.run_version
                ),
            ));
        }
        if let Some(agent_name) = command.agent_name.as_deref() {
            if agent_name != token.target_member_name {
                return Err(IngressError::new(
                    ErrorCode::ApprovalTargetMismatch,
                    format!(
                        "Approval for '{agent_name}' does not match token target '{}'",
                        token.target_member_name
                    ),
                ));
            }
        }

        match self
            .invocations
            .claim(token.run_id, &token.invocation_id, token.invocation_version)
        {
            InvocationCheck::Valid => {}
            InvocationCheck::NotPending => {
                return Err(IngressError::new(
                    ErrorCode::ApprovalInvocationNotPending,
                    format!("Invocation {} is not pending", token.invocation_id),
                ));
            }
            InvocationCheck::Stale { current_version } => {
                return Err(IngressError::new(
                    ErrorCode::StaleApprovalToken,
                    format!(
                        "Invocation {} is at version {current_version}, token carries {}",
                        token.invocation_id, token.invocation_version
                    ),
                ));
            }
        }

        let event = ToolApprovalEvent {
            agent_name: token.target_member_name.clone(),
            invocation_id: token.invocation_id.clone(),
            invocation_version: token.invocation_version,
            is_approved: command.is_approved,
            reason: command.reason.clone(),
        };
        let result = self
            .orchestrator
            .dispatch_tool_approval(location.run_id, event)
            .await;
        if !result.accepted {
            self.invocations
                .release(token.run_id, &token.invocation_id, token.invocation_version);
        }
        self.receipt(&location, token.target_member_name.clone(), result)
    }

    /// Client-initiated stop of the team's active run.
    pub async fn stop_team(&self, team_id: &str) -> Result<RunLocation, IngressError> {
        let location = self.locator.locate_active(team_id).await?.ok_or_else(|| {
            IngressError::new(
                ErrorCode::TeamRunNotFound,
                format!("No active run for team {team_id}"),
            )
        })?;

        let result = self.orchestrator.dispatch_control_stop(location.run_id).await;
        if !result.accepted {
            return Err(IngressError::from_result(result));
        }
        self.invocations.clear_run(location.run_id);
        info!(team_id, run_id = %location.run_id, "Team run stopped by client");
        Ok(location)
    }

    fn receipt(
        &self,
        location: &RunLocation,
        target_member_name: String,
        result: DispatchResult,
    ) -> Result<DispatchReceipt, IngressError> {
        if result.accepted {
            return Ok(DispatchReceipt {
                run_id: location.run_id,
                run_version: location.run_version,
                target_member_name,
            });
        }
        if result.error_code == Some(ErrorCode::RunAutoStopped) {
            self.invocations.clear_run(location.run_id);
        }
        Err(IngressError::from_result(result))
    }
}

fn resolve_target(requested: Option<&str>, location: &RunLocation) -> Result<String, IngressError> {
    requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .or(location.coordinator_member_name.as_deref())
        .map(str::to_string)
        .ok_or_else(|| {
            IngressError::new(
                ErrorCode::TargetMemberRequired,
                format!(
                    "Team {} has no coordinator; a target member is required",
                    location.team_id
                ),
            )
        })
}
