// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node assembly
//!
//! Wires one node's object graph from its [`NodeConfigManifest`]:
//!
//! ```text
//! DiscoveryRegistry ──▶ HttpRemoteDispatcher ──▶ BootstrapOnceReadiness
//!        │                       │                        │
//!        │                       └──── DistributedRoutingPortFactory ◀── LocalMemberRuntime
//!        │                                        │
//!        └──▶ OrchestratorRunLocator ──▶ RunOrchestrator ◀── CommandIngressGateway
//!
//! RunBindings ──▶ InboundEnvelopeHandler (receiving side)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::Router;
use tracing::{info, warn};

use crate::application::command_ingress::CommandIngressGateway;
use crate::application::degradation::{DegradationPolicy, DegradationThresholds};
use crate::application::envelope_ingress::{InboundEnvelopeHandler, RunBindings};
use crate::application::invocation_fence::InvocationVersionFence;
use crate::application::routing_port::DistributedRoutingPortFactory;
use crate::application::run_locator::OrchestratorRunLocator;
use crate::application::run_orchestrator::RunOrchestrator;
use crate::domain::node_config::NodeConfigManifest;
use crate::domain::peer::NodeId;
use crate::domain::runtime::LocalMemberRuntime;
use crate::infrastructure::discovery_registry::{
    AnnounceRequest, DiscoveryMaintenance, DiscoveryRegistry, DiscoveryThresholds,
};
use crate::infrastructure::envelope_security;
use crate::infrastructure::event_bus::{forward_peer_changes, EventBus};
use crate::infrastructure::http_dispatcher::HttpRemoteDispatcher;
use crate::infrastructure::node_readiness::BootstrapOnceReadiness;
use crate::infrastructure::peer_sync::{DiscoveryClient, PeerSync};
use crate::infrastructure::repositories::InMemoryRunRecordRepository;
use crate::infrastructure::runtime::{LoggingAgentRuntime, WebhookAgentRuntime};
use crate::infrastructure::team_definitions::StaticTeamDefinitionProvider;
use crate::presentation::api::{self, AppState};

pub struct TeamgridNode {
    pub node_id: NodeId,
    pub config: NodeConfigManifest,
    pub event_bus: EventBus,
    pub registry: Arc<DiscoveryRegistry>,
    pub maintenance: DiscoveryMaintenance,
    pub peer_sync: Arc<PeerSync>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub ingress: Arc<CommandIngressGateway>,
    pub inbound: Arc<InboundEnvelopeHandler>,
    pub definitions: Arc<StaticTeamDefinitionProvider>,
    started_at: Instant,
}

impl TeamgridNode {
    /// Build the node with the runtime selected by `spec.runtime.endpoint`.
    pub fn build(config: NodeConfigManifest) -> anyhow::Result<Self> {
        let timeout = Duration::from_millis(config.spec.transport.request_timeout_ms);
        let runtime: Arc<dyn LocalMemberRuntime> = match &config.spec.runtime.endpoint {
            Some(endpoint) => Arc::new(
                WebhookAgentRuntime::new(endpoint.as_str(), timeout)
                    .context("Failed to create agent runtime client")?,
            ),
            None => {
                warn!("No agent runtime endpoint configured; deliveries are only logged");
                Arc::new(LoggingAgentRuntime)
            }
        };
        Self::build_with_runtime(config, runtime)
    }

    pub fn build_with_runtime(
        config: NodeConfigManifest,
        runtime: Arc<dyn LocalMemberRuntime>,
    ) -> anyhow::Result<Self> {
        let spec = &config.spec;
        let node_id = NodeId::new(spec.node.id.as_str());
        let timeout = Duration::from_millis(spec.transport.request_timeout_ms);

        // Discovery
        let registry = Arc::new(DiscoveryRegistry::new(
            DiscoveryThresholds::from(&spec.discovery),
            [node_id.clone()],
        ));
        let event_bus = EventBus::with_default_capacity();
        forward_peer_changes(&registry, event_bus.clone());

        let local = AnnounceRequest {
            node_id: node_id.clone(),
            node_name: spec.node.name.clone(),
            base_url: spec.node.base_url.clone(),
            advertised_base_url: spec.node.advertised_base_url.clone(),
            capabilities: spec.node.capabilities.clone(),
            trust_mode: spec.transport.trust_mode,
        };
        registry
            .announce(local.clone())
            .context("Failed to register the local node")?;

        let static_peers: Vec<AnnounceRequest> = spec
            .discovery
            .static_peers
            .iter()
            .map(|peer| AnnounceRequest::from_static_peer(peer, spec.transport.trust_mode))
            .collect();
        for peer in &static_peers {
            if let Err(e) = registry.announce(peer.clone()) {
                warn!(node_id = %peer.node_id, error = %e, "Skipping static peer");
            }
        }

        let maintenance = DiscoveryMaintenance::new(
            registry.clone(),
            Duration::from_millis(spec.discovery.maintenance_interval_ms),
        );
        let peer_sync = Arc::new(PeerSync::new(
            registry.clone(),
            DiscoveryClient::new(timeout).context("Failed to create discovery client")?,
            local,
            static_peers,
            spec.discovery.upstream_url.clone(),
            Duration::from_millis(spec.discovery.maintenance_interval_ms),
        ));

        // Outbound routing
        let security = envelope_security::from_transport_config(&node_id, &spec.transport)
            .context("Failed to configure envelope security")?;
        let dispatcher = Arc::new(
            HttpRemoteDispatcher::new(registry.clone(), security.clone(), timeout)
                .context("Failed to create envelope dispatcher")?,
        );
        let readiness = Arc::new(BootstrapOnceReadiness::new(dispatcher.clone()));
        let routing_factory = Arc::new(DistributedRoutingPortFactory::new(
            dispatcher,
            readiness,
            runtime.clone(),
        ));

        let orchestrator = Arc::new(RunOrchestrator::new(
            node_id.clone(),
            Arc::new(InMemoryRunRecordRepository::new()),
            routing_factory,
            DegradationPolicy::new(DegradationThresholds::from(&spec.degradation)),
            event_bus.clone(),
        ));

        let definitions = Arc::new(StaticTeamDefinitionProvider::new(spec.teams.clone()));
        let locator = Arc::new(OrchestratorRunLocator::new(
            orchestrator.clone(),
            definitions.clone(),
            registry.clone(),
        ));
        let ingress = Arc::new(CommandIngressGateway::new(
            orchestrator.clone(),
            locator,
            Arc::new(InvocationVersionFence::new()),
        ));

        // Inbound envelopes
        let inbound = Arc::new(InboundEnvelopeHandler::new(
            security,
            Arc::new(RunBindings::new()),
            runtime,
        ));

        info!(
            node_id = %node_id,
            teams = spec.teams.len(),
            static_peers = spec.discovery.static_peers.len(),
            trust_mode = ?spec.transport.trust_mode,
            "Node assembled"
        );

        Ok(Self {
            node_id,
            config,
            event_bus,
            registry,
            maintenance,
            peer_sync,
            orchestrator,
            ingress,
            inbound,
            definitions,
            started_at: Instant::now(),
        })
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            node_id: self.node_id.clone(),
            ingress: self.ingress.clone(),
            orchestrator: self.orchestrator.clone(),
            registry: self.registry.clone(),
            inbound: self.inbound.clone(),
            started_at: self.started_at,
        })
    }

    pub fn router(&self) -> Router {
        api::router(self.app_state())
    }

    /// Start discovery maintenance and peer sync.
    pub fn start_background_tasks(&self) {
        self.maintenance.start();
        self.peer_sync.start();
    }

    pub async fn stop_background_tasks(&self) {
        self.peer_sync.stop().await;
        self.maintenance.stop().await;
    }
}
