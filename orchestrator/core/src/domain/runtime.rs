// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Port to the agent execution runtime hosting members on this node.
//!
//! The routing layer never executes agents itself. When a member is placed on
//! the local node it hands the command to a [`LocalMemberRuntime`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::dispatch::{InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent};
use crate::domain::envelope::RunBootstrapPayload;
use crate::domain::run::{RunId, RunVersion};

/// Identifies the run incarnation a local delivery belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub run_id: RunId,
    pub run_version: RunVersion,
}

#[async_trait]
pub trait LocalMemberRuntime: Send + Sync {
    /// Prepare locally hosted members of a run bootstrapped by a remote owner.
    async fn prepare_run(
        &self,
        _run: RunContext,
        _bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn deliver_user_message(
        &self,
        run: RunContext,
        event: &UserMessageEvent,
    ) -> Result<(), RuntimeError>;

    async fn deliver_inter_agent_message(
        &self,
        run: RunContext,
        event: &InterAgentMessageEvent,
    ) -> Result<(), RuntimeError>;

    async fn deliver_tool_approval(
        &self,
        run: RunContext,
        event: &ToolApprovalEvent,
    ) -> Result<(), RuntimeError>;

    async fn stop_run(&self, run: RunContext) -> Result<(), RuntimeError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Member not hosted here: {0}")]
    MemberNotHosted(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Runtime unavailable: {0}")]
    Unavailable(String),
}
