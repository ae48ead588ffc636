// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local agent runtime adapters.
//!
//! [`WebhookAgentRuntime`] forwards every local delivery to an external agent
//! runtime over HTTP. [`LoggingAgentRuntime`] is used when no endpoint is
//! configured: it accepts everything and only logs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::info;

use crate::domain::dispatch::{InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent};
use crate::domain::envelope::RunBootstrapPayload;
use crate::domain::runtime::{LocalMemberRuntime, RunContext, RuntimeError};

/// Body of a runtime webhook call.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RuntimeDelivery<'a> {
    PrepareRun {
        #[serde(flatten)]
        run: RunContext,
        bootstrap: &'a RunBootstrapPayload,
    },
    UserMessage {
        #[serde(flatten)]
        run: RunContext,
        event: &'a UserMessageEvent,
    },
    InterAgentMessage {
        #[serde(flatten)]
        run: RunContext,
        event: &'a InterAgentMessageEvent,
    },
    ToolApproval {
        #[serde(flatten)]
        run: RunContext,
        event: &'a ToolApprovalEvent,
    },
    StopRun {
        #[serde(flatten)]
        run: RunContext,
    },
}

pub struct WebhookAgentRuntime {
    client: Client,
    endpoint: String,
}

impl WebhookAgentRuntime {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, RuntimeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, delivery: RuntimeDelivery<'_>) -> Result<(), RuntimeError> {
        let url = format!("{}/deliveries", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&delivery)
            .send()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(RuntimeError::MemberNotHosted(body))
        } else {
            Err(RuntimeError::DeliveryFailed(format!("runtime answered {status}: {body}")))
        }
    }
}

#[async_trait]
impl LocalMemberRuntime for WebhookAgentRuntime {
    async fn prepare_run(
        &self,
        run: RunContext,
        bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RuntimeError> {
        self.post(RuntimeDelivery::PrepareRun { run, bootstrap }).await
    }

    async fn deliver_user_message(
        &self,
        run: RunContext,
        event: &UserMessageEvent,
    ) -> Result<(), RuntimeError> {
        self.post(RuntimeDelivery::UserMessage { run, event }).await
    }

    async fn deliver_inter_agent_message(
        &self,
        run: RunContext,
        event: &InterAgentMessageEvent,
    ) -> Result<(), RuntimeError> {
        self.post(RuntimeDelivery::InterAgentMessage { run, event }).await
    }

    async fn deliver_tool_approval(
        &self,
        run: RunContext,
        event: &ToolApprovalEvent,
    ) -> Result<(), RuntimeError> {
        self.post(RuntimeDelivery::ToolApproval { run, event }).await
    }

    async fn stop_run(&self, run: RunContext) -> Result<(), RuntimeError> {
        self.post(RuntimeDelivery::StopRun { run }).await
    }
}

#[derive(Debug, Default)]
pub struct LoggingAgentRuntime;

#[async_trait]
impl LocalMemberRuntime for LoggingAgentRuntime {
    async fn prepare_run(
        &self,
        run: RunContext,
        bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RuntimeError> {
        info!(
            run_id = %run.run_id,
            run_version = run.run_version,
            members = bootstrap.member_configs.len(),
            "Prepared run members"
        );
        Ok(())
    }

    async fn deliver_user_message(
        &self,
        run: RunContext,
        event: &UserMessageEvent,
    ) -> Result<(), RuntimeError> {
        info!(run_id = %run.run_id, member = %event.target_member_name, "User message delivered");
        Ok(())
    }

    async fn deliver_inter_agent_message(
        &self,
        run: RunContext,
        event: &InterAgentMessageEvent,
    ) -> Result<(), RuntimeError> {
        info!(
            run_id = %run.run_id,
            from = %event.sender_member_name,
            to = %event.recipient_member_name,
            "Inter-agent message delivered"
        );
        Ok(())
    }

    async fn deliver_tool_approval(
        &self,
        run: RunContext,
        event: &ToolApprovalEvent,
    ) -> Result<(), RuntimeError> {
        info!(
            run_id = %run.run_id,
            agent = %event.agent_name,
            invocation_id = %event.invocation_id,
            approved = event.is_approved,
            "Tool approval delivered"
        );
        Ok(())
    }

    async fn stop_run(&self, run: RunContext) -> Result<(), RuntimeError> {
        info!(run_id = %run.run_id, run_version = run.run_version, "Run stopped locally");
        Ok(())
    }
}
