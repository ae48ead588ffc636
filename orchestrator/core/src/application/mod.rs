// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod command_ingress;
pub mod degradation;
pub mod envelope_ingress;
pub mod invocation_fence;
pub mod placement;
pub mod routing_port;
pub mod run_locator;
pub mod run_orchestrator;
pub mod run_version_fence;

// Re-export the entry points used by the presentation layer and the daemon
pub use command_ingress::{CommandIngressGateway, IngressError, RunLocator};
pub use envelope_ingress::{InboundEnvelopeHandler, RunBindings};
pub use run_locator::OrchestratorRunLocator;
pub use run_orchestrator::RunOrchestrator;
