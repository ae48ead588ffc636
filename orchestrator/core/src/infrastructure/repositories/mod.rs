// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the repository abstractions defined in
//! `crate::domain::repository`, following the Repository pattern from DDD.
//!
//! # Available Implementations
//!
//! - **InMemoryRunRecordRepository** - Thread-safe HashMap-backed run records

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::repository::{RepositoryError, RunRecordRepository};
use crate::domain::run::{RunId, RunRecord};
use crate::domain::team::TeamDefinitionId;

#[derive(Clone, Default)]
pub struct InMemoryRunRecordRepository {
    records: Arc<RwLock<HashMap<RunId, RunRecord>>>,
}

impl InMemoryRunRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRecordRepository for InMemoryRunRecordRepository {
    async fn save(&self, record: &RunRecord) -> Result<(), RepositoryError> {
        let mut records = self.records.write();
        let conflicting = records.values().any(|existing| {
            existing.run_id != record.run_id
                && existing.is_active()
                && record.is_active()
                && existing.team_definition_id == record.team_definition_id
        });
        if conflicting {
            return Err(RepositoryError::Conflict(format!(
                "an active run already exists for team definition {}",
                record.team_definition_id
            )));
        }
        records.insert(record.run_id, record.clone());
        Ok(())
    }

    async fn find_by_id(&self, run_id: RunId) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.records.read().get(&run_id).cloned())
    }

    async fn find_active_by_definition(
        &self,
        team_definition_id: &TeamDefinitionId,
    ) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self
            .records
            .read()
            .values()
            .find(|record| record.is_active() && &record.team_definition_id == team_definition_id)
            .cloned())
    }

    async fn list_active(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut active: Vec<RunRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn delete(&self, run_id: RunId) -> Result<(), RepositoryError> {
        self.records.write().remove(&run_id);
        Ok(())
    }
}
