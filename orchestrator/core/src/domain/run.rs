// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Run Aggregate
//!
//! A [`RunRecord`] is one live, possibly multi-node execution of a
//! [`crate::domain::team::TeamDefinition`].
//!
//! ## Invariants
//!
//! - At most one non-stopped record exists per `team_definition_id`.
//! - `run_version` strictly increases per `team_definition_id` and is never
//!   reused, even across stop/restart.
//! - `placement_by_member` is fixed once the run starts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::peer::NodeId;
use crate::domain::team::TeamDefinitionId;

/// Opaque identifier for a run, generated at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fencing token identifying one incarnation of a team definition's run.
pub type RunVersion = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Degraded,
    Stopped,
}

/// Member route key → hosting node. Immutable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlacementByMember(BTreeMap<String, NodeId>);

impl PlacementByMember {
    pub fn new(entries: BTreeMap<String, NodeId>) -> Self {
        Self(entries)
    }

    pub fn node_for(&self, member_route_key: &str) -> Option<&NodeId> {
        self.0.get(member_route_key)
    }

    /// Distinct nodes hosting at least one member.
    pub fn hosting_nodes(&self) -> BTreeSet<NodeId> {
        self.0.values().cloned().collect()
    }

    /// Members placed on `node_id`.
    pub fn members_on(&self, node_id: &NodeId) -> Vec<String> {
        self.0
            .iter()
            .filter(|(_, node)| *node == node_id)
            .map(|(member, _)| member.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeId)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub team_definition_id: TeamDefinitionId,
    pub coordinator_member_name: Option<String>,
    pub run_version: RunVersion,
    pub owner_node_id: NodeId,
    pub placement_by_member: PlacementByMember,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        team_definition_id: TeamDefinitionId,
        coordinator_member_name: Option<String>,
        run_version: RunVersion,
        owner_node_id: NodeId,
        placement_by_member: PlacementByMember,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            team_definition_id,
            coordinator_member_name,
            run_version,
            owner_node_id,
            placement_by_member,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != RunStatus::Stopped
    }

    pub fn is_coordinator(&self, member_route_key: &str) -> bool {
        self.coordinator_member_name.as_deref() == Some(member_route_key)
    }

    pub fn transition_to(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> PlacementByMember {
        PlacementByMember::new(BTreeMap::from([
            ("lead".to_string(), NodeId::new("node-a")),
            ("sub/reader".to_string(), NodeId::new("node-b")),
            ("sub/writer".to_string(), NodeId::new("node-b")),
        ]))
    }

    #[test]
    fn hosting_nodes_are_distinct() {
        let nodes: Vec<_> = placement().hosting_nodes().into_iter().collect();
        assert_eq!(nodes, vec![NodeId::new("node-a"), NodeId::new("node-b")]);
        assert_eq!(
            placement().members_on(&NodeId::new("node-b")),
            vec!["sub/reader".to_string(), "sub/writer".to_string()]
        );
    }

    #[test]
    fn transition_updates_timestamp() {
        let mut record = RunRecord::new(
            TeamDefinitionId::new("team"),
            Some("lead".to_string()),
            1,
            NodeId::new("node-a"),
            placement(),
        );
        let created = record.updated_at;
        assert!(record.is_active());
        assert!(record.is_coordinator("lead"));
        assert!(!record.is_coordinator("sub/reader"));

        record.transition_to(RunStatus::Stopped);
        assert!(!record.is_active());
        assert!(record.updated_at >= created);
    }
}
