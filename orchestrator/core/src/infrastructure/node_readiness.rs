// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lazy per-node run bootstrap.
//!
//! [`BootstrapOnceReadiness`] sends a `RUN_BOOTSTRAP` envelope the first time a
//! run needs a remote node and remembers the (run, node) pair afterwards. A
//! remote answer of `alreadyBound` counts as ready. The routing port calls
//! `forget_node` when a node answers `RUN_NOT_BOUND`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::routing_port::{NodeReadinessEnsurer, RemoteDispatcher, RoutingError};
use crate::domain::dispatch::DispatchResult;
use crate::domain::envelope::{Envelope, EnvelopeKind, RunBootstrapPayload};
use crate::domain::peer::NodeId;
use crate::domain::run::RunId;
use crate::domain::runtime::RunContext;

pub struct BootstrapOnceReadiness {
    dispatcher: Arc<dyn RemoteDispatcher>,
    ready: Mutex<HashSet<(RunId, NodeId)>>,
}

impl BootstrapOnceReadiness {
    pub fn new(dispatcher: Arc<dyn RemoteDispatcher>) -> Self {
        Self {
            dispatcher,
            ready: Mutex::new(HashSet::new()),
        }
    }

    pub fn is_ready(&self, run_id: RunId, node_id: &NodeId) -> bool {
        self.ready.lock().contains(&(run_id, node_id.clone()))
    }
}

#[async_trait]
impl NodeReadinessEnsurer for BootstrapOnceReadiness {
    async fn ensure_node_ready(
        &self,
        target: &NodeId,
        run: RunContext,
        bootstrap: &RunBootstrapPayload,
    ) -> Result<(), RoutingError> {
        if self.is_ready(run.run_id, target) {
            return Ok(());
        }

        let envelope = Envelope::new(
            run.run_id,
            run.run_version,
            EnvelopeKind::RunBootstrap,
            &bootstrap.for_node(target),
        )?;
        let ack = self.dispatcher.send(target, envelope).await?;
        if !ack.accepted {
            let result: DispatchResult = ack.into();
            return Err(RoutingError::BootstrapRejected {
                node_id: target.clone(),
                code: result.code_or_default(),
                message: result.message_or_default(),
            });
        }

        metrics::counter!("teamgrid_bootstrap_envelopes_total").increment(1);
        tracing::info!(
            run_id = %run.run_id,
            run_version = run.run_version,
            node_id = %target,
            already_bound = ack.already_bound,
            "Remote node ready for run"
        );
        self.ready.lock().insert((run.run_id, target.clone()));
        Ok(())
    }

    fn forget_run(&self, run_id: RunId) {
        self.ready.lock().retain(|(run, _)| *run != run_id);
    }

    fn forget_node(&self, run_id: RunId, node_id: &NodeId) {
        self.ready.lock().remove(&(run_id, node_id.clone()));
    }
}
