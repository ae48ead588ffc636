// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run Orchestrator Application Service
//!
//! Single authority over distributed run lifecycle and dispatch, coordinating:
//! - Placement resolution and the dependency availability check at start
//! - One routing port per active run
//! - The degradation policy fed by every dispatch outcome
//! - Run record persistence and run lifecycle events
//!
//! Operations on the same run are serialized by a per-run async lock held
//! across the read, dispatch and write steps. Different runs never contend.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::application::degradation::{DegradationPolicy, RouteTransition};
use crate::application::placement::{
    ensure_member_dependencies_available, resolve_placement, PlacementError,
};
use crate::application::routing_port::{RoutingPort, RoutingPortFactory, RoutingPortSpec};
use crate::application::run_version_fence::RunVersionResolver;
use crate::domain::dispatch::{
    DispatchResult, ErrorCode, InterAgentMessageEvent, ToolApprovalEvent, UserMessageEvent,
};
use crate::domain::envelope::RunBootstrapPayload;
use crate::domain::events::RunEvent;
use crate::domain::peer::{NodeId, PeerSnapshotEntry};
use crate::domain::repository::{RepositoryError, RunRecordRepository};
use crate::domain::run::{RunId, RunRecord, RunStatus, RunVersion};
use crate::domain::team::{TeamDefinition, TeamDefinitionId};
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Team definition id is required")]
    MissingTeamDefinitionId,

    #[error("Placement failed: {0}")]
    Placement(#[from] PlacementError),

    #[error("Run record storage failed: {0}")]
    Repository(#[from] RepositoryError),
}

impl OrchestratorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OrchestratorError::MissingTeamDefinitionId => ErrorCode::InvalidRequest,
            OrchestratorError::Placement(_) => ErrorCode::PlacementFailed,
            OrchestratorError::Repository(_) => ErrorCode::DispatchFailed,
        }
    }
}

/// A runtime command addressed to one member of a run.
#[derive(Debug, Clone)]
enum RunCommand {
    UserMessage(UserMessageEvent),
    InterAgentMessage(InterAgentMessageEvent),
    ToolApproval(ToolApprovalEvent),
}

impl RunCommand {
    fn target_member(&self) -> &str {
        match self {
            RunCommand::UserMessage(event) => &event.target_member_name,
            RunCommand::InterAgentMessage(event) => &event.recipient_member_name,
            RunCommand::ToolApproval(event) => &event.agent_name,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RunCommand::UserMessage(_) => "user_message",
            RunCommand::InterAgentMessage(_) => "inter_agent_message",
            RunCommand::ToolApproval(_) => "tool_approval",
        }
    }

    async fn route(&self, port: &dyn RoutingPort) -> DispatchResult {
        let outcome = match self {
            RunCommand::UserMessage(event) => port.dispatch_user_message(event).await,
            RunCommand::InterAgentMessage(event) => port.dispatch_inter_agent_message(event).await,
            RunCommand::ToolApproval(event) => port.dispatch_tool_approval(event).await,
        };
        outcome.unwrap_or_else(|e| DispatchResult::rejected(ErrorCode::DispatchFailed, e.to_string()))
    }
}

#[derive(Clone)]
struct ActiveRun {
    port: Arc<dyn RoutingPort>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

pub struct RunOrchestrator {
    local_node_id: NodeId,
    repository: Arc<dyn RunRecordRepository>,
    routing_factory: Arc<dyn RoutingPortFactory>,
    degradation: DegradationPolicy,
    event_bus: EventBus,
    active_runs: Mutex<HashMap<RunId, ActiveRun>>,
    run_versions: Mutex<HashMap<TeamDefinitionId, RunVersion>>,
    start_lock: tokio::sync::Mutex<()>,
}

impl RunOrchestrator {
    pub fn new(
        local_node_id: NodeId,
        repository: Arc<dyn RunRecordRepository>,
        routing_factory: Arc<dyn RoutingPortFactory>,
        degradation: DegradationPolicy,
        event_bus: EventBus,
    ) -> Self {
        Self {
            local_node_id,
            repository,
            routing_factory,
            degradation,
            event_bus,
            active_runs: Mutex::new(HashMap::new()),
            run_versions: Mutex::new(HashMap::new()),
            start_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn degradation(&self) -> &DegradationPolicy {
        &self.degradation
    }

    /// Return the active run for the definition, or start a new one.
    pub async fn start_run_if_missing(
        &self,
        definition: &TeamDefinition,
        owner_node_id: &NodeId,
        peer_snapshot: &[PeerSnapshotEntry],
        default_node_id: &NodeId,
    ) -> Result<RunRecord, OrchestratorError> {
        if definition.id.is_empty() {
            return Err(OrchestratorError::MissingTeamDefinitionId);
        }

        let _start = self.start_lock.lock().await;

        if let Some(existing) = self.repository.find_active_by_definition(&definition.id).await? {
            debug!(run_id = %existing.run_id, team_definition_id = %definition.id, "Run already active");
            return Ok(existing);
        }

        let placement = resolve_placement(definition, peer_snapshot, default_node_id)?;
        let mut known_nodes: BTreeSet<NodeId> =
            peer_snapshot.iter().map(|peer| peer.node_id.clone()).collect();
        known_nodes.insert(default_node_id.clone());
        ensure_member_dependencies_available(definition, &placement, &known_nodes)?;

        let run_version = self.next_run_version(&definition.id);
        let record = RunRecord::new(
            definition.id.clone(),
            definition.resolve_coordinator(),
            run_version,
            owner_node_id.clone(),
            placement.clone(),
        );
        self.repository.save(&record).await?;

        let port = self.routing_factory.create(RoutingPortSpec {
            run_id: record.run_id,
            team_definition_id: definition.id.clone(),
            run_version,
            local_node_id: self.local_node_id.clone(),
            bootstrap: RunBootstrapPayload::from_definition(definition, &placement),
            placement_by_member: placement,
        });
        self.active_runs.lock().insert(
            record.run_id,
            ActiveRun {
                port,
                lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );

        let hosting_nodes: Vec<NodeId> = record.placement_by_member.hosting_nodes().into_iter().collect();
        info!(
            run_id = %record.run_id,
            team_definition_id = %definition.id,
            run_version,
            hosting_nodes = ?hosting_nodes,
            "Started distributed run"
        );
        metrics::counter!("teamgrid_runs_started_total").increment(1);
        self.event_bus.publish_run_event(RunEvent::RunStarted {
            run_id: record.run_id,
            team_definition_id: definition.id.clone(),
            run_version,
            hosting_nodes,
            started_at: record.created_at,
        });

        Ok(record)
    }

    fn next_run_version(&self, definition_id: &TeamDefinitionId) -> RunVersion {
        let mut versions = self.run_versions.lock();
        let version = versions.entry(definition_id.clone()).or_insert(0);
        *version += 1;
        *version
    }

    pub async fn dispatch_user_message(&self, run_id: RunId, event: UserMessageEvent) -> DispatchResult {
        self.dispatch(run_id, RunCommand::UserMessage(event)).await
    }

    pub async fn dispatch_inter_agent_message(
        &self,
        run_id: RunId,
        event: InterAgentMessageEvent,
    ) -> DispatchResult {
        self.dispatch(run_id, RunCommand::InterAgentMessage(event)).await
    }

    pub async fn dispatch_tool_approval(&self, run_id: RunId, event: ToolApprovalEvent) -> DispatchResult {
        self.dispatch(run_id, RunCommand::ToolApproval(event)).await
    }

    /// Stop the run on every hosting node and forget it locally.
    pub async fn dispatch_control_stop(&self, run_id: RunId) -> DispatchResult {
        let Some(active) = self.active_run(run_id) else {
            return run_not_found(run_id);
        };
        let _guard = active.lock.lock().await;

        match self.load_active_record(run_id).await {
            Some(record) => self.stop_locked(&record, &active).await,
            None => run_not_found(run_id),
        }
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>, OrchestratorError> {
        Ok(self.repository.find_by_id(run_id).await?)
    }

    pub async fn find_active_run(
        &self,
        definition_id: &TeamDefinitionId,
    ) -> Result<Option<RunRecord>, OrchestratorError> {
        Ok(self.repository.find_active_by_definition(definition_id).await?)
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>, OrchestratorError> {
        Ok(self.repository.list_active().await?)
    }

    fn active_run(&self, run_id: RunId) -> Option<ActiveRun> {
        self.active_runs.lock().get(&run_id).cloned()
    }

    async fn load_active_record(&self, run_id: RunId) -> Option<RunRecord> {
        match self.repository.find_by_id(run_id).await {
            Ok(Some(record)) if record.is_active() => Some(record),
            Ok(_) => None,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load run record");
                None
            }
        }
    }

    async fn dispatch(&self, run_id: RunId, command: RunCommand) -> DispatchResult {
        let Some(active) = self.active_run(run_id) else {
            return run_not_found(run_id);
        };
        let _guard = active.lock.lock().await;

        let Some(mut record) = self.load_active_record(run_id).await else {
            return run_not_found(run_id);
        };

        let target = command.target_member().to_string();
        let is_coordinator = record.is_coordinator(&target);
        let result = command.route(active.port.as_ref()).await;

        if result.accepted {
            metrics::counter!("teamgrid_dispatch_total", "outcome" => "accepted").increment(1);
            self.degradation.record_route_success(run_id, is_coordinator);
            if record.status == RunStatus::Degraded {
                record.transition_to(RunStatus::Running);
                self.persist(&record).await;
                info!(run_id = %run_id, "Run recovered from degraded state");
                self.event_bus.publish_run_event(RunEvent::RunRecovered {
                    run_id,
                    recovered_at: record.updated_at,
                });
            }
            return result;
        }

        metrics::counter!("teamgrid_dispatch_total", "outcome" => "rejected").increment(1);
        warn!(
            run_id = %run_id,
            member = %target,
            coordinator = is_coordinator,
            command = command.label(),
            error_code = %result.code_or_default(),
            "Dispatch not accepted"
        );

        match self.degradation.record_route_failure(run_id, is_coordinator) {
            RouteTransition::None => result,
            RouteTransition::Degraded => {
                record.transition_to(RunStatus::Degraded);
                self.persist(&record).await;
                warn!(run_id = %run_id, "Run degraded after repeated routing failures");
                self.event_bus.publish_run_event(RunEvent::RunDegraded {
                    run_id,
                    error_code: result.code_or_default(),
                    degraded_at: record.updated_at,
                });
                result
            }
            RouteTransition::Stop => self.auto_stop(&record, &active, &result).await,
        }
    }

    async fn auto_stop(
        &self,
        record: &RunRecord,
        active: &ActiveRun,
        failure: &DispatchResult,
    ) -> DispatchResult {
        let last_failure = failure.message_or_default();
        warn!(run_id = %record.run_id, last_failure = %last_failure, "Auto-stopping run");

        let stop = self.stop_locked(record, active).await;
        if stop.accepted {
            metrics::counter!("teamgrid_runs_auto_stopped_total").increment(1);
            self.event_bus.publish_run_event(RunEvent::RunAutoStopped {
                run_id: record.run_id,
                last_failure: last_failure.clone(),
                stopped_at: Utc::now(),
            });
            DispatchResult::rejected(
                ErrorCode::RunAutoStopped,
                format!("Run {} was stopped after repeated failures: {last_failure}", record.run_id),
            )
        } else {
            error!(
                run_id = %record.run_id,
                stop_error = %stop.message_or_default(),
                "Auto-stop failed"
            );
            DispatchResult::rejected(
                ErrorCode::RunAutoStopFailed,
                format!(
                    "Run {} could not be stopped after repeated failures: {last_failure}; stop error: {}",
                    record.run_id,
                    stop.message_or_default()
                ),
            )
        }
    }

    /// Caller holds the run's lock.
    async fn stop_locked(&self, record: &RunRecord, active: &ActiveRun) -> DispatchResult {
        let result = active
            .port
            .dispatch_control_stop()
            .await
            .unwrap_or_else(|e| DispatchResult::rejected(ErrorCode::StopDispatchFailed, e.to_string()));

        if !result.accepted {
            warn!(
                run_id = %record.run_id,
                error = %result.message_or_default(),
                "Stop dispatch failed"
            );
            return DispatchResult::rejected(ErrorCode::StopDispatchFailed, result.message_or_default());
        }

        let mut stopped = record.clone();
        stopped.transition_to(RunStatus::Stopped);

        self.degradation.clear_run(record.run_id);
        active.port.dispose();
        self.active_runs.lock().remove(&record.run_id);
        if let Err(e) = self.repository.delete(record.run_id).await {
            error!(run_id = %record.run_id, error = %e, "Failed to delete stopped run record");
        }

        info!(
            run_id = %record.run_id,
            team_definition_id = %record.team_definition_id,
            run_version = record.run_version,
            "Run stopped"
        );
        self.event_bus.publish_run_event(RunEvent::RunStopped {
            run_id: record.run_id,
            team_definition_id: record.team_definition_id.clone(),
            run_version: record.run_version,
            stopped_at: stopped.updated_at,
        });

        DispatchResult::accepted()
    }

    async fn persist(&self, record: &RunRecord) {
        if let Err(e) = self.repository.save(record).await {
            error!(run_id = %record.run_id, error = %e, "Failed to persist run record");
        }
    }
}

fn run_not_found(run_id: RunId) -> DispatchResult {
    DispatchResult::rejected(ErrorCode::TeamRunNotFound, format!("Run {run_id} is not active"))
}

#[async_trait]
impl RunVersionResolver for RunOrchestrator {
    async fn current_run_version(&self, run_id: RunId) -> Option<RunVersion> {
        self.load_active_record(run_id).await.map(|record| record.run_version)
    }
}
