// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::dispatch::ErrorCode;
use crate::domain::peer::{NodeId, PeerRecord};
use crate::domain::run::{RunId, RunVersion};
use crate::domain::team::TeamDefinitionId;

/// Run lifecycle events published by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        team_definition_id: TeamDefinitionId,
        run_version: RunVersion,
        hosting_nodes: Vec<NodeId>,
        started_at: DateTime<Utc>,
    },
    RunDegraded {
        run_id: RunId,
        error_code: ErrorCode,
        degraded_at: DateTime<Utc>,
    },
    RunRecovered {
        run_id: RunId,
        recovered_at: DateTime<Utc>,
    },
    RunStopped {
        run_id: RunId,
        team_definition_id: TeamDefinitionId,
        run_version: RunVersion,
        stopped_at: DateTime<Utc>,
    },
    RunAutoStopped {
        run_id: RunId,
        last_failure: String,
        stopped_at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunDegraded { run_id, .. }
            | RunEvent::RunRecovered { run_id, .. }
            | RunEvent::RunStopped { run_id, .. }
            | RunEvent::RunAutoStopped { run_id, .. } => *run_id,
        }
    }
}

/// Peer set changes published by the discovery registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiscoveryEvent {
    PeersChanged {
        peers: Vec<PeerRecord>,
        pruned_node_ids: Vec<NodeId>,
        changed_at: DateTime<Utc>,
    },
}
