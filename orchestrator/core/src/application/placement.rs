// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Placement Resolver
//!
//! Decides once per run start which node hosts each team member, then checks
//! that every node the run will need to reach is actually known.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::domain::peer::{NodeId, PeerSnapshotEntry};
use crate::domain::run::PlacementByMember;
use crate::domain::team::{route_key, TeamDefinition, ROUTE_KEY_SEPARATOR};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("Team definition has no members")]
    EmptyTeam,

    #[error("Member '{member}' is placed on unknown node '{node_id}'")]
    UnknownNode { member: String, node_id: NodeId },

    #[error("Member '{member}' depends on '{dependency}', which is not part of the team")]
    MissingDependency { member: String, dependency: String },

    #[error("Dependency '{dependency}' of member '{member}' is placed on unknown node '{node_id}'")]
    DependencyOnUnknownNode {
        member: String,
        dependency: String,
        node_id: NodeId,
    },
}

/// Map every member (nested ones under hierarchical route keys) to a node.
///
/// A declared home node is honored only when the snapshot reports it healthy
/// and able to execute agents; every other member lands on `default_node_id`.
pub fn resolve_placement(
    definition: &TeamDefinition,
    peer_snapshot: &[PeerSnapshotEntry],
    default_node_id: &NodeId,
) -> Result<PlacementByMember, PlacementError> {
    let members = definition.flatten_members();
    if members.is_empty() {
        return Err(PlacementError::EmptyTeam);
    }

    let eligible: BTreeSet<&NodeId> = peer_snapshot
        .iter()
        .filter(|peer| peer.is_healthy && peer.supports_agent_execution)
        .map(|peer| &peer.node_id)
        .collect();

    let mut placement = BTreeMap::new();
    for entry in members {
        let node = match entry.member.home_node_id() {
            Some(home) if eligible.contains(home) => home.clone(),
            Some(home) => {
                tracing::debug!(
                    member = %entry.route_key,
                    home_node_id = %home,
                    fallback = %default_node_id,
                    "Home node not eligible, placing member on default node"
                );
                default_node_id.clone()
            }
            None => default_node_id.clone(),
        };
        placement.insert(entry.route_key, node);
    }

    Ok(PlacementByMember::new(placement))
}

/// Fail fast when a member, or any of its dependencies, sits on a node that
/// is not in `known_nodes`.
pub fn ensure_member_dependencies_available(
    definition: &TeamDefinition,
    placement: &PlacementByMember,
    known_nodes: &BTreeSet<NodeId>,
) -> Result<(), PlacementError> {
    for entry in definition.flatten_members() {
        if let Some(node_id) = placement.node_for(&entry.route_key) {
            if !known_nodes.contains(node_id) {
                return Err(PlacementError::UnknownNode {
                    member: entry.route_key.clone(),
                    node_id: node_id.clone(),
                });
            }
        }

        for dependency in entry.member.dependencies() {
            let Some((_, node_id)) = resolve_dependency(placement, &entry.route_key, dependency)
            else {
                return Err(PlacementError::MissingDependency {
                    member: entry.route_key.clone(),
                    dependency: dependency.clone(),
                });
            };
            if !known_nodes.contains(node_id) {
                return Err(PlacementError::DependencyOnUnknownNode {
                    member: entry.route_key.clone(),
                    dependency: dependency.clone(),
                    node_id: node_id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Dependencies name a sibling first, then an absolute route key.
fn resolve_dependency<'a>(
    placement: &'a PlacementByMember,
    member_key: &str,
    dependency: &str,
) -> Option<(String, &'a NodeId)> {
    let parent = member_key
        .rsplit_once(ROUTE_KEY_SEPARATOR)
        .map(|(parent, _)| parent);
    let sibling = route_key(parent, dependency);

    [sibling, dependency.to_string()]
        .into_iter()
        .find_map(|key| placement.node_for(&key).map(|node| (key, node)))
}
