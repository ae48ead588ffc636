// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod discovery_registry;
pub mod envelope_security;
pub mod event_bus;
pub mod http_dispatcher;
pub mod node_readiness;
pub mod peer_sync;
pub mod repositories;
pub mod runtime;
pub mod team_definitions;

pub use discovery_registry::{DiscoveryMaintenance, DiscoveryRegistry, DiscoveryThresholds};
pub use event_bus::{forward_peer_changes, DomainEvent, EventBus};
pub use http_dispatcher::HttpRemoteDispatcher;
pub use node_readiness::BootstrapOnceReadiness;
pub use peer_sync::{DiscoveryClient, PeerSync};
pub use repositories::InMemoryRunRecordRepository;
pub use runtime::{LoggingAgentRuntime, WebhookAgentRuntime};
pub use team_definitions::StaticTeamDefinitionProvider;
