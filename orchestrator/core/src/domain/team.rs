// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Team Definitions
//!
//! A [`TeamDefinition`] describes the members of an agent team and, optionally,
//! which node each member would like to be hosted on. Members may themselves be
//! sub-teams; nested members are addressed by hierarchical route keys of the
//! form `subTeam/member`.
//!
//! Definitions are owned by an external CRUD surface. The core only reads them
//! through [`TeamDefinitionProvider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::peer::NodeId;

/// Separator between the segments of a hierarchical member route key.
pub const ROUTE_KEY_SEPARATOR: char = '/';

/// Identifier of a team definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamDefinitionId(pub String);

impl TeamDefinitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for TeamDefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static description of a team: its members and coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamDefinition {
    pub id: TeamDefinitionId,

    #[serde(default)]
    pub name: String,

    /// Route key of the member that receives messages with no explicit target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_member_name: Option<String>,

    #[serde(default)]
    pub members: Vec<TeamMember>,
}

/// A single node in the member tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamMember {
    Agent(AgentMember),
    SubTeam(SubTeamMember),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMember {
    pub member_name: String,

    /// Agent definition the runtime instantiates for this member.
    #[serde(default)]
    pub agent_definition_id: String,

    /// Preferred hosting node. Honored only while the node is healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_node_id: Option<NodeId>,

    /// Route keys of members this member needs to reach at runtime.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Opaque runtime configuration shipped to the hosting node on bootstrap.
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTeamMember {
    pub member_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_node_id: Option<NodeId>,

    #[serde(default)]
    pub members: Vec<TeamMember>,
}

impl TeamMember {
    pub fn member_name(&self) -> &str {
        match self {
            TeamMember::Agent(agent) => &agent.member_name,
            TeamMember::SubTeam(sub) => &sub.member_name,
        }
    }

    pub fn home_node_id(&self) -> Option<&NodeId> {
        match self {
            TeamMember::Agent(agent) => agent.home_node_id.as_ref(),
            TeamMember::SubTeam(sub) => sub.home_node_id.as_ref(),
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            TeamMember::Agent(agent) => &agent.dependencies,
            TeamMember::SubTeam(_) => &[],
        }
    }
}

/// A member flattened out of the tree together with its route key.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberEntry<'a> {
    pub route_key: String,
    pub member: &'a TeamMember,
}

/// Join a parent route key and a member name.
pub fn route_key(parent: Option<&str>, member_name: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{parent}{ROUTE_KEY_SEPARATOR}{member_name}"),
        _ => member_name.to_string(),
    }
}

impl TeamDefinition {
    /// Every member in the tree, depth first, sub-team nodes included.
    pub fn flatten_members(&self) -> Vec<MemberEntry<'_>> {
        let mut entries = Vec::new();
        collect_members(&self.members, None, &mut entries);
        entries
    }

    /// Look up a member by route key.
    pub fn find_member(&self, key: &str) -> Option<&TeamMember> {
        self.flatten_members()
            .into_iter()
            .find(|entry| entry.route_key == key)
            .map(|entry| entry.member)
    }

    /// Coordinator route key, falling back to the first top-level agent.
    pub fn resolve_coordinator(&self) -> Option<String> {
        if let Some(name) = self
            .coordinator_member_name
            .as_ref()
            .filter(|name| !name.trim().is_empty())
        {
            return Some(name.clone());
        }
        self.members.iter().find_map(|member| match member {
            TeamMember::Agent(agent) => Some(agent.member_name.clone()),
            TeamMember::SubTeam(_) => None,
        })
    }
}

fn collect_members<'a>(
    members: &'a [TeamMember],
    parent: Option<&str>,
    out: &mut Vec<MemberEntry<'a>>,
) {
    for member in members {
        let key = route_key(parent, member.member_name());
        out.push(MemberEntry {
            route_key: key.clone(),
            member,
        });
        if let TeamMember::SubTeam(sub) = member {
            collect_members(&sub.members, Some(&key), out);
        }
    }
}

/// Read access to team definitions owned elsewhere.
#[async_trait]
pub trait TeamDefinitionProvider: Send + Sync {
    async fn find_team_definition(&self, id: &TeamDefinitionId) -> Option<TeamDefinition>;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn agent(name: &str, home: Option<&str>) -> TeamMember {
        TeamMember::Agent(AgentMember {
            member_name: name.to_string(),
            agent_definition_id: format!("{name}-def"),
            home_node_id: home.map(NodeId::new),
            dependencies: vec![],
            config: serde_json::Value::Null,
        })
    }

    pub fn team(id: &str, coordinator: &str, members: Vec<TeamMember>) -> TeamDefinition {
        TeamDefinition {
            id: TeamDefinitionId::new(id),
            name: id.to_string(),
            coordinator_member_name: Some(coordinator.to_string()),
            members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn flatten_uses_hierarchical_route_keys() {
        let definition = team(
            "team-a",
            "lead",
            vec![
                agent("lead", None),
                TeamMember::SubTeam(SubTeamMember {
                    member_name: "research".to_string(),
                    home_node_id: None,
                    members: vec![agent("reader", None), agent("writer", Some("node-b"))],
                }),
            ],
        );

        let keys: Vec<String> = definition
            .flatten_members()
            .into_iter()
            .map(|entry| entry.route_key)
            .collect();

        assert_eq!(keys, vec!["lead", "research", "research/reader", "research/writer"]);
        assert!(definition.find_member("research/writer").is_some());
        assert!(definition.find_member("writer").is_none());
    }

    #[test]
    fn coordinator_falls_back_to_first_agent() {
        let mut definition = team("team-a", "lead", vec![agent("first", None), agent("second", None)]);
        assert_eq!(definition.resolve_coordinator().as_deref(), Some("lead"));

        definition.coordinator_member_name = None;
        assert_eq!(definition.resolve_coordinator().as_deref(), Some("first"));

        definition.members.clear();
        assert_eq!(definition.resolve_coordinator(), None);
    }

    #[test]
    fn deserializes_tagged_members_from_yaml() {
        let yaml = r#"
id: support
coordinator_member_name: triage
members:
  - kind: agent
    member_name: triage
    home_node_id: node-a
  - kind: sub_team
    member_name: billing
    members:
      - kind: agent
        member_name: refunds
        dependencies: [triage]
"#;
        let definition: TeamDefinition = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(definition.id.as_str(), "support");
        assert_eq!(
            definition.find_member("billing/refunds").unwrap().dependencies(),
            &["triage".to_string()]
        );
        assert_eq!(
            definition.find_member("triage").unwrap().home_node_id(),
            Some(&NodeId::new("node-a"))
        );
    }
}
