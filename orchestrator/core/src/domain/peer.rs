// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Peer Nodes
//!
//! Types describing the other nodes a node knows about. The authoritative set
//! lives in [`crate::infrastructure::discovery_registry::DiscoveryRegistry`];
//! placement only ever sees a point-in-time [`PeerSnapshotEntry`] list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Believed health of a peer, derived from time since it was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Ready,
    Degraded,
    Unreachable,
}

/// How envelopes exchanged with a peer are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Unsigned envelopes, for networks where every node is trusted.
    #[default]
    TrustedLan,
    /// Every envelope carries an HMAC signature keyed by a shared secret.
    StrictSigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Whether the node can host agent members.
    #[serde(default = "default_true")]
    pub agent_execution: bool,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            agent_execution: true,
            tags: vec![],
        }
    }
}

fn default_true() -> bool {
    true
}

/// A node as tracked by the discovery registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub node_name: String,
    /// Normalized http(s) URL without trailing slash.
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertised_base_url: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub status: PeerStatus,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
    #[serde(default)]
    pub trust_mode: TrustMode,
}

impl PeerRecord {
    /// URL other nodes should use to reach this peer.
    pub fn reachable_url(&self) -> &str {
        self.advertised_base_url.as_deref().unwrap_or(&self.base_url)
    }

    pub fn to_snapshot_entry(&self) -> PeerSnapshotEntry {
        PeerSnapshotEntry {
            node_id: self.node_id.clone(),
            base_url: self.base_url.clone(),
            is_healthy: self.status == PeerStatus::Ready,
            supports_agent_execution: self.capabilities.agent_execution,
        }
    }
}

/// Point-in-time view of a peer used for placement decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshotEntry {
    pub node_id: NodeId,
    pub base_url: String,
    pub is_healthy: bool,
    pub supports_agent_execution: bool,
}

/// Source of peer snapshots for placement.
pub trait PeerSnapshotProvider: Send + Sync {
    fn peer_snapshot(&self) -> Vec<PeerSnapshotEntry>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid base URL '{url}': {reason}")]
pub struct InvalidBaseUrl {
    pub url: String,
    pub reason: String,
}

/// Normalize a peer base URL: http/https only, no trailing slash.
pub fn normalize_base_url(raw: &str) -> Result<String, InvalidBaseUrl> {
    let invalid = |reason: &str| InvalidBaseUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    let parsed = url::Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid("query and fragment are not allowed"));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_trailing_slashes_and_case() {
        assert_eq!(
            normalize_base_url("HTTP://Node-A.local:8080/").unwrap(),
            "http://node-a.local:8080"
        );
        assert_eq!(
            normalize_base_url(" https://example.com/team/api// ").unwrap(),
            "https://example.com/team/api"
        );
    }

    #[test]
    fn rejects_non_http_urls() {
        assert!(normalize_base_url("ftp://example.com").is_err());
        assert!(normalize_base_url("example.com").is_err());
        assert!(normalize_base_url("").is_err());
        assert!(normalize_base_url("http://example.com/?a=1").is_err());
    }

    #[test]
    fn snapshot_entry_reflects_health() {
        let mut record = PeerRecord {
            node_id: NodeId::new("a"),
            node_name: "a".to_string(),
            base_url: "http://a:1".to_string(),
            advertised_base_url: Some("https://a.example.com".to_string()),
            last_seen_at: Utc::now(),
            status: PeerStatus::Ready,
            capabilities: PeerCapabilities::default(),
            trust_mode: TrustMode::TrustedLan,
        };
        assert!(record.to_snapshot_entry().is_healthy);
        assert_eq!(record.reachable_url(), "https://a.example.com");

        record.status = PeerStatus::Degraded;
        assert!(!record.to_snapshot_entry().is_healthy);
    }
}
