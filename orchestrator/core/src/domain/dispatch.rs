// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatch Commands and Results
//!
//! The runtime commands routed to team members and the uniform
//! `{accepted, errorCode, errorMessage}` result every dispatch path returns.

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced at every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TeamRunNotFound,
    TargetMemberRequired,
    StaleApprovalToken,
    ApprovalInvocationNotPending,
    ApprovalTargetMismatch,
    DispatchFailed,
    DispatchRejected,
    StopDispatchFailed,
    RunAutoStopped,
    RunAutoStopFailed,
    NodeIdConflict,
    BaseUrlConflict,
    StaleRunVersion,
    RunNotBound,
    EnvelopeRejected,
    TeamDefinitionNotFound,
    PlacementFailed,
    InvalidBaseUrl,
    InvalidRequest,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::TeamRunNotFound => "TEAM_RUN_NOT_FOUND",
            ErrorCode::TargetMemberRequired => "TARGET_MEMBER_REQUIRED",
            ErrorCode::StaleApprovalToken => "STALE_APPROVAL_TOKEN",
            ErrorCode::ApprovalInvocationNotPending => "APPROVAL_INVOCATION_NOT_PENDING",
            ErrorCode::ApprovalTargetMismatch => "APPROVAL_TARGET_MISMATCH",
            ErrorCode::DispatchFailed => "DISPATCH_FAILED",
            ErrorCode::DispatchRejected => "DISPATCH_REJECTED",
            ErrorCode::StopDispatchFailed => "STOP_DISPATCH_FAILED",
            ErrorCode::RunAutoStopped => "RUN_AUTO_STOPPED",
            ErrorCode::RunAutoStopFailed => "RUN_AUTO_STOP_FAILED",
            ErrorCode::NodeIdConflict => "NODE_ID_CONFLICT",
            ErrorCode::BaseUrlConflict => "BASE_URL_CONFLICT",
            ErrorCode::StaleRunVersion => "STALE_RUN_VERSION",
            ErrorCode::RunNotBound => "RUN_NOT_BOUND",
            ErrorCode::EnvelopeRejected => "ENVELOPE_REJECTED",
            ErrorCode::TeamDefinitionNotFound => "TEAM_DEFINITION_NOT_FOUND",
            ErrorCode::PlacementFailed => "PLACEMENT_FAILED",
            ErrorCode::InvalidBaseUrl => "INVALID_BASE_URL",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a dispatch. Rejections carry a code and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DispatchResult {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }

    /// Code of a rejection, `DISPATCH_REJECTED` when the rejection carried none.
    pub fn code_or_default(&self) -> ErrorCode {
        self.error_code.unwrap_or(ErrorCode::DispatchRejected)
    }

    pub fn message_or_default(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "dispatch was not accepted".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessageEvent {
    pub target_member_name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterAgentMessageEvent {
    pub sender_member_name: String,
    pub recipient_member_name: String,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "message".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolApprovalEvent {
    pub agent_name: String,
    pub invocation_id: String,
    pub invocation_version: u64,
    pub is_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::ApprovalInvocationNotPending).unwrap();
        assert_eq!(json, "\"APPROVAL_INVOCATION_NOT_PENDING\"");
        assert_eq!(ErrorCode::RunAutoStopFailed.to_string(), "RUN_AUTO_STOP_FAILED");
    }

    #[test]
    fn rejected_result_defaults() {
        let bare = DispatchResult {
            accepted: false,
            error_code: None,
            error_message: None,
        };
        assert_eq!(bare.code_or_default(), ErrorCode::DispatchRejected);

        let result = DispatchResult::rejected(ErrorCode::DispatchFailed, "connection refused");
        assert_eq!(result.code_or_default(), ErrorCode::DispatchFailed);
        assert_eq!(result.message_or_default(), "connection refused");

        let json = serde_json::to_value(DispatchResult::accepted()).unwrap();
        assert_eq!(json, serde_json::json!({ "accepted": true }));
    }
}
