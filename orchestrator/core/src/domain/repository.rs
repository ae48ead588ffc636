// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate root, following the DDD Repository
//! pattern: one repository per aggregate, interface defined in the domain layer,
//! implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `RunRecordRepository` | `RunRecord` | `InMemoryRunRecordRepository` |
//!
//! Run records are process-local state; the storage technology is a deployment
//! concern, so only the in-memory backend ships today.

use async_trait::async_trait;

use crate::domain::run::{RunId, RunRecord};
use crate::domain::team::TeamDefinitionId;

/// Repository interface for RunRecord aggregates
#[async_trait]
pub trait RunRecordRepository: Send + Sync {
    /// Save run record (create or update)
    async fn save(&self, record: &RunRecord) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, run_id: RunId) -> Result<Option<RunRecord>, RepositoryError>;

    /// The non-stopped record for a definition, if any
    async fn find_active_by_definition(
        &self,
        team_definition_id: &TeamDefinitionId,
    ) -> Result<Option<RunRecord>, RepositoryError>;

    async fn list_active(&self) -> Result<Vec<RunRecord>, RepositoryError>;

    async fn delete(&self, run_id: RunId) -> Result<(), RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
