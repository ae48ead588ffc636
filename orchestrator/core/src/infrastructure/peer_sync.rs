// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Peer Sync - keeps this node and its peers aware of each other
//!
//! Two modes, chosen by `spec.discovery.upstream_url`:
//!
//! - **Upstream:** announce to the registry node and replace the local peer
//!   set with its snapshot ([`DiscoveryRegistry::merge_peers`]).
//! - **Mesh:** heartbeat every known peer. A peer that answers refreshes its
//!   local record; a peer that no longer knows us gets a fresh announce.
//!   Static peers missing from the registry are re-announced to.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Outbound half of the discovery protocol (`reqwest`)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::node_config::StaticPeerConfig;
use crate::domain::peer::{NodeId, PeerRecord, TrustMode};
use crate::infrastructure::discovery_registry::{AnnounceRequest, DiscoveryRegistry};

pub const ANNOUNCE_PATH: &str = "/api/discovery/announce";
pub const HEARTBEAT_PATH: &str = "/api/discovery/heartbeat";
pub const PEERS_PATH: &str = "/api/discovery/peers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub known: bool,
}

impl AnnounceRequest {
    pub fn from_static_peer(peer: &StaticPeerConfig, trust_mode: TrustMode) -> Self {
        Self {
            node_id: NodeId::new(peer.node_id.as_str()),
            node_name: peer.node_name.clone(),
            base_url: peer.base_url.clone(),
            advertised_base_url: peer.advertised_base_url.clone(),
            capabilities: peer.capabilities.clone(),
            trust_mode,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryClientError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} answered HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct DiscoveryClient {
    client: Client,
}

impl DiscoveryClient {
    pub fn new(timeout: Duration) -> Result<Self, DiscoveryClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryClientError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub async fn announce(
        &self,
        base_url: &str,
        request: &AnnounceRequest,
    ) -> Result<PeerRecord, DiscoveryClientError> {
        let url = format!("{base_url}{ANNOUNCE_PATH}");
        let response = self.client.post(&url).json(request).send().await;
        Self::decode(url, response).await
    }

    pub async fn heartbeat(
        &self,
        base_url: &str,
        request: &HeartbeatRequest,
    ) -> Result<bool, DiscoveryClientError> {
        let url = format!("{base_url}{HEARTBEAT_PATH}");
        let response = self.client.post(&url).json(request).send().await;
        let answer: HeartbeatResponse = Self::decode(url, response).await?;
        Ok(answer.known)
    }

    pub async fn fetch_peers(&self, base_url: &str) -> Result<Vec<PeerRecord>, DiscoveryClientError> {
        let url = format!("{base_url}{PEERS_PATH}");
        let response = self.client.get(&url).send().await;
        Self::decode(url, response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        url: String,
        response: reqwest::Result<reqwest::Response>,
    ) -> Result<T, DiscoveryClientError> {
        let response = response.map_err(|e| DiscoveryClientError::Request {
            url: url.clone(),
            message: e.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryClientError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DiscoveryClientError::Request {
                url,
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Sync loop
// ============================================================================

pub struct PeerSync {
    registry: Arc<DiscoveryRegistry>,
    client: DiscoveryClient,
    local: AnnounceRequest,
    static_peers: Vec<AnnounceRequest>,
    upstream_url: Option<String>,
    period: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PeerSync {
    pub fn new(
        registry: Arc<DiscoveryRegistry>,
        client: DiscoveryClient,
        local: AnnounceRequest,
        static_peers: Vec<AnnounceRequest>,
        upstream_url: Option<String>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            local,
            static_peers,
            upstream_url: upstream_url.map(|url| url.trim_end_matches('/').to_string()),
            period: period.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    /// One sync round in whichever mode is configured.
    pub async fn run_round(&self) {
        match &self.upstream_url {
            Some(upstream) => self.sync_with_upstream(upstream).await,
            None => self.heartbeat_mesh().await,
        }
    }

    async fn sync_with_upstream(&self, upstream: &str) {
        if let Err(e) = self.client.announce(upstream, &self.local).await {
            warn!(upstream, error = %e, "Announce to upstream registry failed");
            return;
        }
        match self.client.fetch_peers(upstream).await {
            Ok(snapshot) => {
                let removed = self.registry.merge_peers(snapshot);
                if !removed.is_empty() {
                    debug!(removed = ?removed, "Upstream snapshot dropped peers");
                }
            }
            Err(e) => warn!(upstream, error = %e, "Fetching upstream peers failed"),
        }
    }

    async fn heartbeat_mesh(&self) {
        let beat = HeartbeatRequest {
            node_id: self.local.node_id.clone(),
            last_seen_at: None,
        };

        for peer in self.registry.peers() {
            if peer.node_id == self.local.node_id {
                continue;
            }
            let url = peer.reachable_url().to_string();
            let reached = match self.client.heartbeat(&url, &beat).await {
                Ok(true) => true,
                Ok(false) => {
                    info!(node_id = %peer.node_id, "Peer forgot this node; re-announcing");
                    self.client.announce(&url, &self.local).await.is_ok()
                }
                Err(e) => {
                    debug!(node_id = %peer.node_id, error = %e, "Heartbeat failed");
                    false
                }
            };
            if reached {
                self.registry.heartbeat(&peer.node_id, None);
            }
        }

        for peer in &self.static_peers {
            if self.registry.get(&peer.node_id).is_some() {
                continue;
            }
            let url = peer
                .advertised_base_url
                .as_deref()
                .unwrap_or(&peer.base_url)
                .trim_end_matches('/')
                .to_string();
            if self.client.announce(&url, &self.local).await.is_ok() {
                if let Err(e) = self.registry.announce(peer.clone()) {
                    warn!(node_id = %peer.node_id, error = %e, "Static peer rejected by registry");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the sync loop. Returns false if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let sync = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                interval_ms = sync.period.as_millis() as u64,
                upstream = ?sync.upstream_url,
                "Starting peer sync"
            );
            let mut tick = interval(sync.period);
            loop {
                tokio::select! {
                    _ = tick.tick() => sync.run_round().await,
                    _ = shutdown.cancelled() => break,
                }
            }
            info!("Peer sync stopped");
        });

        *running = Some((token, handle));
        true
    }

    pub async fn stop(&self) -> bool {
        let Some((token, handle)) = self.running.lock().take() else {
            return false;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Peer sync task ended abnormally");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::peer::{PeerCapabilities, PeerStatus};
    use crate::infrastructure::discovery_registry::DiscoveryThresholds;

    fn announce(node: &str, url: &str) -> AnnounceRequest {
        AnnounceRequest {
            node_id: NodeId::new(node),
            node_name: None,
            base_url: url.to_string(),
            advertised_base_url: None,
            capabilities: PeerCapabilities::default(),
            trust_mode: TrustMode::TrustedLan,
        }
    }

    fn sync(registry: Arc<DiscoveryRegistry>, upstream: Option<String>) -> PeerSync {
        PeerSync::new(
            registry,
            DiscoveryClient::new(Duration::from_secs(5)).unwrap(),
            announce("local", "http://127.0.0.1:1"),
            Vec::new(),
            upstream,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn heartbeat_reannounces_to_forgetful_peers() {
        let mut server = mockito::Server::new_async().await;
        let beat = server
            .mock("POST", HEARTBEAT_PATH)
            .with_status(200)
            .with_body(r#"{"known":false}"#)
            .create_async()
            .await;
        let reannounce = server
            .mock("POST", ANNOUNCE_PATH)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({"nodeId": "local"})))
            .with_status(200)
            .with_body(
                serde_json::to_string(&serde_json::json!({
                    "nodeId": "local",
                    "nodeName": "local",
                    "baseUrl": "http://127.0.0.1:1",
                    "lastSeenAt": Utc::now(),
                    "status": "ready",
                    "capabilities": {"agent_execution": true, "tags": []},
                    "trustMode": "trusted_lan"
                }))
                .unwrap(),
            )
            .create_async()
            .await;

        let registry = Arc::new(DiscoveryRegistry::new(
            DiscoveryThresholds::default(),
            vec![NodeId::new("local")],
        ));
        registry.announce(announce("local", "http://127.0.0.1:1")).unwrap();
        registry.announce(announce("peer", &server.url())).unwrap();
        registry.tick_maintenance(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(registry.get(&NodeId::new("peer")).unwrap().status, PeerStatus::Degraded);

        sync(registry.clone(), None).run_round().await;

        beat.assert_async().await;
        reannounce.assert_async().await;
        assert_eq!(registry.get(&NodeId::new("peer")).unwrap().status, PeerStatus::Ready);
    }

    #[tokio::test]
    async fn upstream_snapshot_replaces_unprotected_peers() {
        let mut server = mockito::Server::new_async().await;
        let now = Utc::now();
        let peer = |id: &str, url: &str| {
            serde_json::json!({
                "nodeId": id,
                "nodeName": id,
                "baseUrl": url,
                "lastSeenAt": now,
                "status": "ready",
                "capabilities": {"agent_execution": true, "tags": []},
                "trustMode": "trusted_lan"
            })
        };
        server
            .mock("POST", ANNOUNCE_PATH)
            .with_status(200)
            .with_body(peer("local", "http://127.0.0.1:1").to_string())
            .create_async()
            .await;
        server
            .mock("GET", PEERS_PATH)
            .with_status(200)
            .with_body(
                serde_json::json!([
                    peer("local", "http://10.9.9.9:1"),
                    peer("node-c", "http://10.0.0.3:8400")
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let registry = Arc::new(DiscoveryRegistry::new(
            DiscoveryThresholds::default(),
            vec![NodeId::new("local")],
        ));
        registry.announce(announce("local", "http://127.0.0.1:1")).unwrap();
        registry.announce(announce("node-b", "http://10.0.0.2:8400")).unwrap();

        sync(registry.clone(), Some(format!("{}/", server.url()))).run_round().await;

        let ids: Vec<String> = registry
            .peers()
            .into_iter()
            .map(|p| p.node_id.to_string())
            .collect();
        assert_eq!(ids, vec!["local", "node-c"]);
        assert_eq!(
            registry.get(&NodeId::new("local")).unwrap().base_url,
            "http://127.0.0.1:1"
        );
    }
}
