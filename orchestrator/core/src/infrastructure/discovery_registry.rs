// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Discovery Registry - believed-health peer set
//!
//! Tracks every node this node knows about, derives their status from the time
//! since they were last seen, and feeds placement through
//! [`PeerSnapshotProvider`].
//!
//! Invariants:
//! - node ids are unique and base URLs are unique
//! - protected node ids (typically the local node) are never pruned by the TTL
//!   and survive merges that omit or contradict them
//!
//! Change notifications go to subscribed listeners. Each listener runs
//! isolated: a panicking listener is logged and the remaining listeners still
//! run.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Peer health registry and its periodic maintenance task

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::dispatch::ErrorCode;
use crate::domain::node_config::DiscoveryConfig;
use crate::domain::peer::{
    normalize_base_url, InvalidBaseUrl, NodeId, PeerCapabilities, PeerRecord, PeerSnapshotEntry,
    PeerSnapshotProvider, PeerStatus, TrustMode,
};

// ============================================================================
// Configuration & requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryThresholds {
    pub ttl: Duration,
    pub degraded_after: Duration,
    pub unreachable_after: Duration,
}

impl Default for DiscoveryThresholds {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(120_000),
            degraded_after: Duration::from_millis(20_000),
            unreachable_after: Duration::from_millis(45_000),
        }
    }
}

impl From<&DiscoveryConfig> for DiscoveryThresholds {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            ttl: Duration::from_millis(config.ttl_ms),
            degraded_after: Duration::from_millis(config.degraded_after_ms),
            unreachable_after: Duration::from_millis(config.unreachable_after_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub node_name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub advertised_base_url: Option<String>,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
    #[serde(default)]
    pub trust_mode: TrustMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Node {node_id} is already registered with base URL {existing_base_url}")]
    NodeIdConflict {
        node_id: NodeId,
        existing_base_url: String,
    },

    #[error("Base URL {base_url} already belongs to node {existing_node_id}")]
    BaseUrlConflict {
        base_url: String,
        existing_node_id: NodeId,
    },

    #[error(transparent)]
    InvalidBaseUrl(#[from] InvalidBaseUrl),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::NodeIdConflict { .. } => ErrorCode::NodeIdConflict,
            RegistryError::BaseUrlConflict { .. } => ErrorCode::BaseUrlConflict,
            RegistryError::InvalidBaseUrl(_) => ErrorCode::InvalidBaseUrl,
        }
    }
}

/// Notification delivered to listeners whenever the peer set changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerChange {
    pub peers: Vec<PeerRecord>,
    pub pruned_node_ids: Vec<NodeId>,
}

pub type PeerChangeListener = Arc<dyn Fn(&PeerChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// Registry
// ============================================================================

pub struct DiscoveryRegistry {
    thresholds: DiscoveryThresholds,
    protected: HashSet<NodeId>,
    peers: RwLock<HashMap<NodeId, PeerRecord>>,
    listeners: RwLock<Vec<(ListenerId, PeerChangeListener)>>,
    next_listener_id: AtomicU64,
}

impl DiscoveryRegistry {
    pub fn new(thresholds: DiscoveryThresholds, protected: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            thresholds,
            protected: protected.into_iter().collect(),
            peers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn thresholds(&self) -> DiscoveryThresholds {
        self.thresholds
    }

    pub fn is_protected(&self, node_id: &NodeId) -> bool {
        self.protected.contains(node_id)
    }

    pub fn announce(&self, request: AnnounceRequest) -> Result<PeerRecord, RegistryError> {
        self.announce_at(request, Utc::now())
    }

    /// Insert or refresh a peer, rejecting id and URL conflicts.
    pub fn announce_at(
        &self,
        request: AnnounceRequest,
        now: DateTime<Utc>,
    ) -> Result<PeerRecord, RegistryError> {
        let base_url = normalize_base_url(&request.base_url)?;
        let advertised_base_url = request
            .advertised_base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .map(normalize_base_url)
            .transpose()?;

        let (record, changed) = {
            let mut peers = self.peers.write();

            if let Some(existing) = peers.get(&request.node_id) {
                if existing.base_url != base_url {
                    warn!(
                        node_id = %request.node_id,
                        existing = %existing.base_url,
                        requested = %base_url,
                        "Rejected announce: node id conflict"
                    );
                    return Err(RegistryError::NodeIdConflict {
                        node_id: request.node_id,
                        existing_base_url: existing.base_url.clone(),
                    });
                }
            }
            if let Some(owner) = peers
                .values()
                .find(|peer| peer.base_url == base_url && peer.node_id != request.node_id)
            {
                warn!(
                    node_id = %request.node_id,
                    base_url = %base_url,
                    owner = %owner.node_id,
                    "Rejected announce: base URL conflict"
                );
                return Err(RegistryError::BaseUrlConflict {
                    base_url,
                    existing_node_id: owner.node_id.clone(),
                });
            }

            let previous_status = peers.get(&request.node_id).map(|peer| peer.status);
            let record = PeerRecord {
                node_name: request
                    .node_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| request.node_id.to_string()),
                node_id: request.node_id,
                base_url,
                advertised_base_url,
                last_seen_at: now,
                status: PeerStatus::Ready,
                capabilities: request.capabilities,
                trust_mode: request.trust_mode,
            };
            peers.insert(record.node_id.clone(), record.clone());
            (record, previous_status != Some(PeerStatus::Ready))
        };

        if changed {
            info!(node_id = %record.node_id, base_url = %record.base_url, "Peer announced");
            self.notify(Vec::new());
        }
        Ok(record)
    }

    /// Refresh a known peer. Returns whether the node was known.
    pub fn heartbeat(&self, node_id: &NodeId, last_seen_at: Option<DateTime<Utc>>) -> bool {
        let recovered = {
            let mut peers = self.peers.write();
            let Some(peer) = peers.get_mut(node_id) else {
                return false;
            };
            let recovered = peer.status != PeerStatus::Ready;
            peer.last_seen_at = last_seen_at.unwrap_or_else(Utc::now);
            peer.status = PeerStatus::Ready;
            recovered
        };

        if recovered {
            debug!(node_id = %node_id, "Peer back to ready after heartbeat");
            self.notify(Vec::new());
        }
        true
    }

    /// Replace the peer set with an upstream snapshot, keeping protected
    /// nodes at their local record. Returns the node ids that disappeared.
    pub fn merge_peers(&self, snapshot: Vec<PeerRecord>) -> Vec<NodeId> {
        let (disappeared, changed) = {
            let mut peers = self.peers.write();

            let mut merged: HashMap<NodeId, PeerRecord> = peers
                .iter()
                .filter(|(id, _)| self.protected.contains(*id))
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect();
            let mut urls: HashSet<String> = merged.values().map(|p| p.base_url.clone()).collect();

            for mut record in snapshot {
                if self.protected.contains(&record.node_id) || merged.contains_key(&record.node_id) {
                    continue;
                }
                match normalize_base_url(&record.base_url) {
                    Ok(url) => record.base_url = url,
                    Err(e) => {
                        warn!(node_id = %record.node_id, error = %e, "Skipping merged peer");
                        continue;
                    }
                }
                if !urls.insert(record.base_url.clone()) {
                    warn!(
                        node_id = %record.node_id,
                        base_url = %record.base_url,
                        "Skipping merged peer with duplicate base URL"
                    );
                    continue;
                }
                merged.insert(record.node_id.clone(), record);
            }

            let mut disappeared: Vec<NodeId> = peers
                .keys()
                .filter(|id| !merged.contains_key(*id))
                .cloned()
                .collect();
            disappeared.sort();

            let changed = *peers != merged;
            *peers = merged;
            (disappeared, changed)
        };

        if changed {
            info!(removed = disappeared.len(), "Merged upstream peer snapshot");
            self.notify(disappeared.clone());
        }
        disappeared
    }

    /// Recompute peer status at `now` and prune peers past the TTL.
    pub fn tick_maintenance(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let (pruned, changed) = {
            let mut peers = self.peers.write();
            let mut pruned = Vec::new();
            let mut changed = false;

            peers.retain(|node_id, peer| {
                if self.protected.contains(node_id) {
                    return true;
                }
                let elapsed = (now - peer.last_seen_at).to_std().unwrap_or(Duration::ZERO);
                if elapsed > self.thresholds.ttl {
                    pruned.push(node_id.clone());
                    return false;
                }

                let status = if elapsed > self.thresholds.unreachable_after {
                    PeerStatus::Unreachable
                } else if elapsed > self.thresholds.degraded_after {
                    PeerStatus::Degraded
                } else {
                    PeerStatus::Ready
                };
                if peer.status != status {
                    debug!(node_id = %node_id, from = ?peer.status, to = ?status, "Peer status changed");
                    peer.status = status;
                    changed = true;
                }
                true
            });

            pruned.sort();
            let changed = changed || !pruned.is_empty();
            (pruned, changed)
        };

        if !pruned.is_empty() {
            info!(pruned = ?pruned, "Pruned expired peers");
            metrics::counter!("teamgrid_peers_pruned_total").increment(pruned.len() as u64);
        }
        if changed {
            self.notify(pruned.clone());
        }
        pruned
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    pub fn get(&self, node_id: &NodeId) -> Option<PeerRecord> {
        self.peers.read().get(node_id).cloned()
    }

    pub fn subscribe(&self, listener: PeerChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn notify(&self, pruned_node_ids: Vec<NodeId>) {
        let listeners: Vec<PeerChangeListener> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        if listeners.is_empty() {
            return;
        }

        let change = PeerChange {
            peers: self.peers(),
            pruned_node_ids,
        };
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                warn!("Peer change listener panicked; continuing with remaining listeners");
            }
        }
    }
}

impl PeerSnapshotProvider for DiscoveryRegistry {
    fn peer_snapshot(&self) -> Vec<PeerSnapshotEntry> {
        self.peers().iter().map(PeerRecord::to_snapshot_entry).collect()
    }
}

// ============================================================================
// Maintenance task
// ============================================================================

/// Runs [`DiscoveryRegistry::tick_maintenance`] on a fixed interval.
/// Starting and stopping are idempotent.
pub struct DiscoveryMaintenance {
    registry: Arc<DiscoveryRegistry>,
    period: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DiscoveryMaintenance {
    pub fn new(registry: Arc<DiscoveryRegistry>, period: Duration) -> Self {
        Self {
            registry,
            period: period.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the maintenance loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let registry = self.registry.clone();
        let period = self.period;
        let shutdown = token.clone();

        let handle = tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Starting discovery maintenance");
            let mut tick = interval(period);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.tick_maintenance(Utc::now());
                    }
                    _ = shutdown.cancelled() => {
                        break;
                    }
                }
            }
            info!("Discovery maintenance stopped");
        });

        *running = Some((token, handle));
        true
    }

    /// Stop the loop and wait for it to exit. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let Some((token, handle)) = self.running.lock().take() else {
            return false;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Discovery maintenance task ended abnormally");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn request(id: &str, url: &str) -> AnnounceRequest {
        AnnounceRequest {
            node_id: NodeId::new(id),
            node_name: None,
            base_url: url.to_string(),
            advertised_base_url: None,
            capabilities: PeerCapabilities::default(),
            trust_mode: TrustMode::TrustedLan,
        }
    }

    fn registry() -> DiscoveryRegistry {
        DiscoveryRegistry::new(DiscoveryThresholds::default(), [NodeId::new("local")])
    }

    #[test]
    fn announce_normalizes_and_rejects_conflicts() {
        let registry = registry();
        let record = registry.announce_at(request("a", "http://a.local:8400/"), t(0)).unwrap();
        assert_eq!(record.base_url, "http://a.local:8400");
        assert_eq!(record.node_name, "a");

        let id_conflict = registry
            .announce_at(request("a", "http://elsewhere:8400"), t(0))
            .unwrap_err();
        assert_eq!(id_conflict.code(), ErrorCode::NodeIdConflict);

        let url_conflict = registry
            .announce_at(request("b", "http://a.local:8400"), t(0))
            .unwrap_err();
        assert_eq!(url_conflict.code(), ErrorCode::BaseUrlConflict);

        let invalid = registry.announce_at(request("c", "ftp://c"), t(0)).unwrap_err();
        assert_eq!(invalid.code(), ErrorCode::InvalidBaseUrl);

        assert_eq!(registry.peers().len(), 1);
        assert_eq!(registry.get(&NodeId::new("a")).unwrap().base_url, "http://a.local:8400");
    }

    #[test]
    fn heartbeat_refreshes_known_nodes_only() {
        let registry = registry();
        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();
        registry.tick_maintenance(t(30_000));
        assert_eq!(registry.get(&NodeId::new("a")).unwrap().status, PeerStatus::Degraded);

        assert!(registry.heartbeat(&NodeId::new("a"), Some(t(30_000))));
        let peer = registry.get(&NodeId::new("a")).unwrap();
        assert_eq!(peer.status, PeerStatus::Ready);
        assert_eq!(peer.last_seen_at, t(30_000));

        assert!(!registry.heartbeat(&NodeId::new("ghost"), None));
    }

    #[test]
    fn maintenance_ages_and_prunes_peers() {
        let registry = registry();
        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();
        registry.announce_at(request("local", "http://local:1"), t(0)).unwrap();

        assert!(registry.tick_maintenance(t(25_000)).is_empty());
        assert_eq!(registry.get(&NodeId::new("a")).unwrap().status, PeerStatus::Degraded);

        registry.tick_maintenance(t(50_000));
        assert_eq!(registry.get(&NodeId::new("a")).unwrap().status, PeerStatus::Unreachable);

        assert_eq!(registry.tick_maintenance(t(130_000)), vec![NodeId::new("a")]);
        assert!(registry.get(&NodeId::new("a")).is_none());

        let local = registry.get(&NodeId::new("local")).unwrap();
        assert_eq!(local.status, PeerStatus::Ready);
    }

    #[test]
    fn maintenance_is_idempotent_at_fixed_time() {
        let registry = registry();
        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();
        registry.announce_at(request("b", "http://b:1"), t(100_000)).unwrap();

        let first = registry.tick_maintenance(t(125_000));
        let statuses = registry.peers();
        let second = registry.tick_maintenance(t(125_000));

        assert_eq!(first, vec![NodeId::new("a")]);
        assert!(second.is_empty());
        assert_eq!(registry.peers(), statuses);
    }

    #[test]
    fn merge_preserves_protected_nodes() {
        let registry = registry();
        let local = registry.announce_at(request("local", "http://local:1"), t(0)).unwrap();
        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();

        let mut imposter = local.clone();
        imposter.base_url = "http://hijack:1".to_string();
        let mut fresh = local.clone();
        fresh.node_id = NodeId::new("b");
        fresh.base_url = "http://b:1/".to_string();

        let disappeared = registry.merge_peers(vec![imposter, fresh]);
        assert_eq!(disappeared, vec![NodeId::new("a")]);
        assert_eq!(registry.get(&NodeId::new("local")).unwrap(), local);
        assert_eq!(registry.get(&NodeId::new("b")).unwrap().base_url, "http://b:1");

        let disappeared = registry.merge_peers(vec![]);
        assert_eq!(disappeared, vec![NodeId::new("b")]);
        assert!(registry.get(&NodeId::new("local")).is_some());
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = registry();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_: &PeerChange| panic!("listener failure")));
        let counter = calls.clone();
        let id = registry.subscribe(Arc::new(move |change: &PeerChange| {
            counter.fetch_add(change.peers.len(), Ordering::SeqCst);
        }));

        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.peers().len(), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.announce_at(request("b", "http://b:1"), t(0)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_reports_health() {
        let registry = registry();
        registry.announce_at(request("a", "http://a:1"), t(0)).unwrap();
        registry.announce_at(request("b", "http://b:1"), t(0)).unwrap();
        registry.heartbeat(&NodeId::new("b"), Some(t(20_000)));
        registry.tick_maintenance(t(25_000));

        let snapshot = registry.peer_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[0].is_healthy);
        assert!(snapshot[1].is_healthy);
    }

    #[tokio::test]
    async fn maintenance_start_stop_is_idempotent() {
        let registry = Arc::new(registry());
        let maintenance = DiscoveryMaintenance::new(registry, Duration::from_millis(10));

        assert!(maintenance.start());
        assert!(!maintenance.start());
        assert!(maintenance.is_running());

        assert!(maintenance.stop().await);
        assert!(!maintenance.stop().await);
        assert!(!maintenance.is_running());
    }
}
