// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Approval tokens issued for pending tool invocations.
//!
//! A token is only honored while its `run_id`/`run_version` match the active
//! run and its `invocation_version` is the latest registered for the
//! invocation. See [`crate::application::command_ingress`].

use serde::{Deserialize, Serialize};

use crate::domain::run::{RunId, RunVersion};

/// First version of every tool invocation.
pub const INITIAL_INVOCATION_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalToken {
    pub run_id: RunId,
    pub run_version: RunVersion,
    pub invocation_id: String,
    pub invocation_version: u64,
    pub target_member_name: String,
}
