// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run Version Fence
//!
//! Fencing-token check for inbound run-scoped traffic: an envelope claiming a
//! run version other than the authoritative one is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::dispatch::ErrorCode;
use crate::domain::run::{RunId, RunVersion};

/// Source of the authoritative version of a run.
#[async_trait]
pub trait RunVersionResolver: Send + Sync {
    async fn current_run_version(&self, run_id: RunId) -> Option<RunVersion>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("Run {0} is not bound on this node")]
    RunNotBound(RunId),

    #[error("Stale run version for run {run_id}: claimed {claimed}, current {current}")]
    StaleRunVersion {
        run_id: RunId,
        claimed: RunVersion,
        current: RunVersion,
    },
}

impl FenceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FenceError::RunNotBound(_) => ErrorCode::RunNotBound,
            FenceError::StaleRunVersion { .. } => ErrorCode::StaleRunVersion,
        }
    }
}

#[derive(Clone)]
pub struct RunVersionFence {
    resolver: Arc<dyn RunVersionResolver>,
}

impl RunVersionFence {
    pub fn new(resolver: Arc<dyn RunVersionResolver>) -> Self {
        Self { resolver }
    }

    pub async fn check(&self, run_id: RunId, claimed: RunVersion) -> Result<RunVersion, FenceError> {
        let current = self
            .resolver
            .current_run_version(run_id)
            .await
            .ok_or(FenceError::RunNotBound(run_id))?;

        if current != claimed {
            tracing::warn!(
                run_id = %run_id,
                claimed,
                current,
                "Rejecting traffic for superseded run version"
            );
            return Err(FenceError::StaleRunVersion {
                run_id,
                claimed,
                current,
            });
        }
        Ok(current)
    }
}
