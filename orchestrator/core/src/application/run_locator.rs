// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run Locator backed by the local [`RunOrchestrator`].
//!
//! Client-facing team ids are team definition ids. Definitions come from a
//! [`TeamDefinitionProvider`] and placement sees the current peer snapshot.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::command_ingress::{IngressError, RunLocation, RunLocator};
use crate::application::run_orchestrator::RunOrchestrator;
use crate::domain::dispatch::ErrorCode;
use crate::domain::peer::PeerSnapshotProvider;
use crate::domain::run::RunRecord;
use crate::domain::team::{TeamDefinitionId, TeamDefinitionProvider};

pub struct OrchestratorRunLocator {
    orchestrator: Arc<RunOrchestrator>,
    definitions: Arc<dyn TeamDefinitionProvider>,
    peers: Arc<dyn PeerSnapshotProvider>,
}

impl OrchestratorRunLocator {
    pub fn new(
        orchestrator: Arc<RunOrchestrator>,
        definitions: Arc<dyn TeamDefinitionProvider>,
        peers: Arc<dyn PeerSnapshotProvider>,
    ) -> Self {
        Self {
            orchestrator,
            definitions,
            peers,
        }
    }
}

fn to_location(team_id: &str, record: RunRecord) -> RunLocation {
    RunLocation {
        team_id: team_id.to_string(),
        run_id: record.run_id,
        run_version: record.run_version,
        coordinator_member_name: record.coordinator_member_name,
    }
}

#[async_trait]
impl RunLocator for OrchestratorRunLocator {
    async fn locate_or_start(&self, team_id: &str) -> Result<RunLocation, IngressError> {
        let definition_id = TeamDefinitionId::new(team_id);
        if definition_id.is_empty() {
            return Err(IngressError::new(ErrorCode::InvalidRequest, "teamId is required"));
        }

        let definition = self
            .definitions
            .find_team_definition(&definition_id)
            .await
            .ok_or_else(|| {
                IngressError::new(
                    ErrorCode::TeamDefinitionNotFound,
                    format!("Unknown team definition {team_id}"),
                )
            })?;

        let local = self.orchestrator.local_node_id().clone();
        let snapshot = self.peers.peer_snapshot();
        let record = self
            .orchestrator
            .start_run_if_missing(&definition, &local, &snapshot, &local)
            .await
            .map_err(|e| IngressError::new(e.code(), e.to_string()))?;

        Ok(to_location(team_id, record))
    }

    async fn locate_active(&self, team_id: &str) -> Result<Option<RunLocation>, IngressError> {
        let record = self
            .orchestrator
            .find_active_run(&TeamDefinitionId::new(team_id))
            .await
            .map_err(|e| IngressError::new(e.code(), e.to_string()))?;
        Ok(record.map(|record| to_location(team_id, record)))
    }
}
